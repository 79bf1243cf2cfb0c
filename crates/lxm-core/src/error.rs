use thiserror::Error;

/// Error taxonomy for the reconciliation engine.
///
/// `Validation` and `Integrity` describe bad desired state, `Apply`
/// describes a single failed mutation against the OS, and
/// `ConfigCorruption` means a snapshot restore failed and the live
/// state of an OS config file can no longer be trusted. Only the last
/// one is fatal to a reconciliation pass.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("apply failed: {0}")]
    Apply(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("config corruption: {0}")]
    ConfigCorruption(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::ConfigCorruption(_))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
