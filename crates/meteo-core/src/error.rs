//! Shared error taxonomy for the ingestion core.
//!
//! Mirrors the error kinds named in the platform's error-handling design:
//! transient network trouble, protocol framing errors, decode validation
//! failures, storage write failures, missing configuration, and fatal
//! startup errors. Each downstream crate wraps these (or its own leaf
//! error) in `anyhow::Result` at its public boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("protocol framing error: {0}")]
    ProtocolFraming(String),

    #[error("decode validation failed: {0}")]
    DecodeValidation(String),

    #[error("storage write failed: {0}")]
    StorageWriteFailure(String),

    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
