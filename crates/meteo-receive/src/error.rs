//! Error taxonomy for the push receivers (C8). These never escape to the
//! remote sender as anything but a status code; the detail is for logs.

use meteo_core::CoreError;
use meteo_db::DbError;

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("storage error: {0}")]
    Storage(#[from] DbError),

    #[error("protocol error: {0}")]
    Protocol(#[from] CoreError),

    #[error("unknown station")]
    UnknownStation,

    #[error("authentication required")]
    AuthRequired,

    #[error("access forbidden")]
    AccessForbidden,

    #[error("archive page size mismatch")]
    SizeMismatch,
}
