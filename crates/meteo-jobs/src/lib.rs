//! The downstream jobs facade (consumed by C5) and the debounced job
//! publisher (C5 itself). Climatology and anomaly-monitoring jobs are
//! computed by a separate worker; this crate only ever enqueues and
//! tracks requests for that worker, never the computation itself.

pub mod facade;
pub mod publisher;

pub use facade::{Job, JobId, JobsFacade};
pub use publisher::JobPublisher;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobsError {
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("no job available")]
    Empty,
}

pub type JobsResult<T> = Result<T, JobsError>;
