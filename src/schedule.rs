//! Slot time computation for bulk posts.
//!
//! Everything here is a pure function of its arguments: no clock reads, no
//! I/O. The quiet-hours window is evaluated in `ScheduleSettings::timezone`.
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::{Error, Result};
use crate::model::{PostingStrategy, ScheduleSettings};

/// First local hour at which posting is allowed.
pub const QUIET_HOURS_END: u32 = 9;
/// First local hour of the quiet window.
pub const QUIET_HOURS_START: u32 = 22;

// Upper bound on one step, keeps millisecond arithmetic well inside i64.
const MAX_STEP_MS: f64 = 1.0e13;

/// Check the invariants a bulk post needs before anything is computed or stored.
pub fn validate_settings(settings: &ScheduleSettings) -> Result<()> {
    interval_to_duration(settings.interval_hours * 3_600_000.0, "interval_hours")?;
    interval_to_duration(
        settings.post_interval_minutes * 60_000.0,
        "post_interval_minutes",
    )?;
    if settings.batch_size == 0 {
        return Err(Error::invalid("batch_size must be >= 1"));
    }
    if settings.profile_ids.is_empty() {
        return Err(Error::invalid("profile_ids must be non-empty"));
    }
    if settings.profile_ids.iter().any(|p| p.trim().is_empty()) {
        return Err(Error::invalid("profile_ids must not contain empty ids"));
    }
    Ok(())
}

fn interval_to_duration(millis: f64, field: &'static str) -> Result<Duration> {
    if !millis.is_finite() || millis <= 0.0 {
        return Err(Error::InvalidConfig(format!("{field} must be > 0")));
    }
    if millis > MAX_STEP_MS {
        return Err(Error::InvalidConfig(format!("{field} is too large")));
    }
    let ms = millis.round() as i64;
    if ms == 0 {
        return Err(Error::InvalidConfig(format!("{field} must be at least 1ms")));
    }
    Ok(Duration::milliseconds(ms))
}

/// Time between two consecutive posts for `strategy`.
pub fn step(strategy: PostingStrategy, settings: &ScheduleSettings) -> Result<Duration> {
    match strategy {
        PostingStrategy::SequentialInterval => {
            interval_to_duration(settings.interval_hours * 3_600_000.0, "interval_hours")
        }
        PostingStrategy::Batch => interval_to_duration(
            settings.post_interval_minutes * 60_000.0,
            "post_interval_minutes",
        ),
    }
}

/// Move `candidate` out of the 22:00–09:00 local window.
///
/// At or after 22:00 it becomes 09:00 of the following day; before 09:00 it
/// becomes 09:00 of the same day. Anything else is returned unchanged.
pub fn apply_schedule_constraints(candidate: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = candidate.with_timezone(&tz);
    let hour = local.hour();
    if hour >= QUIET_HOURS_START {
        match local.date_naive().succ_opt() {
            Some(next_day) => morning_of(next_day, tz),
            None => candidate,
        }
    } else if hour < QUIET_HOURS_END {
        morning_of(local.date_naive(), tz)
    } else {
        candidate
    }
}

/// 09:00:00.000 local on `date`. Falls forward past a DST gap if 09:00 does not exist.
fn morning_of(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let Some(nine) = date.and_hms_opt(QUIET_HOURS_END, 0, 0) else {
        return Utc.from_utc_datetime(&date.and_time(Default::default()));
    };
    for quarter in 0..=12 {
        let naive = nine + Duration::minutes(15 * quarter);
        if let Some(local) = tz.from_local_datetime(&naive).earliest() {
            return local.with_timezone(&Utc);
        }
    }
    Utc.from_utc_datetime(&nine)
}

/// Timestamp at which the item at `index` of a bulk post is published.
pub fn compute_slot_time(
    strategy: PostingStrategy,
    settings: &ScheduleSettings,
    index: usize,
) -> Result<DateTime<Utc>> {
    let step = step(strategy, settings)?;
    let tz = settings.timezone;
    let mut running = settings.start_time;
    let mut i = 0;
    loop {
        let constrained = apply_schedule_constraints(running, tz);
        if i == index {
            return Ok(constrained);
        }
        running = constrained
            .checked_add_signed(step)
            .ok_or_else(|| Error::invalid("schedule overflows the supported time range"))?;
        i += 1;
    }
}

/// Slot times for indices `0..count` in a single running pass.
///
/// Produces the same values as calling [`compute_slot_time`] for every index.
pub fn compute_schedule(
    strategy: PostingStrategy,
    settings: &ScheduleSettings,
    count: usize,
) -> Result<Vec<DateTime<Utc>>> {
    let step = step(strategy, settings)?;
    let tz = settings.timezone;
    let mut slots = Vec::with_capacity(count);
    let mut running = settings.start_time;
    for i in 0..count {
        let constrained = apply_schedule_constraints(running, tz);
        slots.push(constrained);
        if i + 1 < count {
            running = constrained
                .checked_add_signed(step)
                .ok_or_else(|| Error::invalid("schedule overflows the supported time range"))?;
        }
    }
    Ok(slots)
}

/// Slot times for the items of one stored batch, starting at global index `first_index`.
pub fn batch_slots(
    strategy: PostingStrategy,
    settings: &ScheduleSettings,
    first_index: usize,
    len: usize,
) -> Result<Vec<DateTime<Utc>>> {
    let mut slots = compute_schedule(strategy, settings, first_index + len)?;
    Ok(slots.split_off(first_index))
}
