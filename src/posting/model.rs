use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Profile;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CreatePostRequest<'a> {
    pub caption: &'a str,
    pub profile_ids: &'a [String],
    pub media_urls: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Debug)]
pub struct CreatePostResponse {
    pub id: String,
}

#[derive(Deserialize, Debug)]
pub struct ListProfilesResponse {
    #[serde(default)]
    pub data: Vec<Profile>,
}
