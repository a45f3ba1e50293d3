use std::path::PathBuf;
use thiserror::Error;

/// The central error type for the toolgate engine.
///
/// Most failure handling is policy, not propagation — fail-open paths
/// swallow errors, fail-closed paths turn them into blocks. This
/// hierarchy covers the seams where callers do need to distinguish what
/// went wrong: state persistence and audit maintenance.
#[derive(Error, Debug)]
pub enum ToolgateError {
    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to write state at {path}: {message}")]
    Write { path: PathBuf, message: String },

    #[error("State lock unavailable at {path}")]
    LockUnavailable { path: PathBuf },
}

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit compaction failed: {0}")]
    Compaction(String),
}

pub type Result<T> = std::result::Result<T, ToolgateError>;
