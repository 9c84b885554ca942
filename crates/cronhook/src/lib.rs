//! Delayed webhook delivery: a job store, a polling dispatcher that delivers
//! due jobs with bounded retries, and a small management API.

pub mod api;
pub mod config;
pub mod db;
pub mod jobs;
pub mod observability;
