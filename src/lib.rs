pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod posting;
pub mod queue;
pub mod schedule;
pub mod worker;
