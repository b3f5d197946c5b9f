//! HTTP request handlers for the job CRUD surface and health probes.

pub mod health;
pub mod jobs;

pub use health::{health_check, liveness_check, readiness_check};
pub use jobs::{cancel_job, create_job, get_job, list_jobs, update_job};
