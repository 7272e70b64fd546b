use thiserror::Error;

/// Errors surfaced by the file writer and control store.
///
/// `Load` never produces one of these: a corrupt or outdated sidecar is
/// represented as `Ok(None)`, not an error (see [`crate::control::ControlStore::load`]).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize control record: {0}")]
    Serialize(#[from] serde_json::Error),
}
