//! Error types for the command queue and its checkpoint store.

use cadeploy_core::InputError;
use cadeploy_manager::ManagerError;
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Apply(#[from] ManagerError),

    /// An executor other than the manager refused the action.
    #[error("action rejected: {0}")]
    Rejected(String),

    #[error("no transaction in progress for `{0}`")]
    NotBegun(String),

    #[error("transaction for `{0}` is already prepared")]
    AlreadyPrepared(String),

    #[error("checkpoint belongs to `{found}`, not `{expected}`")]
    ForeignCheckpoint { expected: String, found: String },

    #[error("checkpoint schema version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to open checkpoint store: {0}")]
    Open(String),

    #[error("checkpoint store transaction error: {0}")]
    Transaction(String),

    #[error("checkpoint store table error: {0}")]
    Table(String),

    #[error("checkpoint store read error: {0}")]
    Read(String),

    #[error("checkpoint store write error: {0}")]
    Write(String),
}
