//! The observation store (component C4): a Postgres/Timescale-backed
//! facade other components talk to instead of issuing SQL themselves.
//! Uses an existing Timescale schema — this crate issues no migrations.

pub mod cache;
pub mod client;
pub mod jobs;
pub mod schema;
pub mod store;

pub use client::DbClient;
pub use jobs::DbJobsFacade;
pub use schema::*;
pub use store::ObservationStore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database connection error: {0}")]
    Connection(#[from] sqlx::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("record not found")]
    NotFound,

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

pub type DbResult<T> = Result<T, DbError>;
