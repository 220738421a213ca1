use shared::error::TransportError;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Failure surfaced by an engine operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("no joined channel with this peer")]
    NotJoined,
    #[error("peer has no backend profile")]
    NoProfile,
    #[error("backend could not guarantee an encrypted channel")]
    NoEncryption,
    #[error("peer is no longer mutually matched")]
    Unmatched,
    #[error("backend call failed: {0}")]
    Sdk(TransportError),
    #[error("trust check failed: {0}")]
    Trust(String),
    #[error("last-read store failed: {0}")]
    Store(String),
    #[error("internal invariant violated: {0}")]
    Fatal(String),
    #[error("malformed backend data: {0}")]
    Parse(String),
}

impl EngineError {
    /// Conditions the application is expected to handle as ordinary outcomes.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            EngineError::NotJoined
                | EngineError::NoProfile
                | EngineError::NoEncryption
                | EngineError::Unmatched
        )
    }

    pub fn trust(err: anyhow::Error) -> Self {
        EngineError::Trust(format!("{err:#}"))
    }

    pub fn store(err: anyhow::Error) -> Self {
        EngineError::Store(format!("{err:#}"))
    }

    /// Logs at a level matching how surprising the failure is.
    pub fn log(&self, operation: &str) {
        match self {
            EngineError::Fatal(_) => error!(operation, error = %self, "engine: operation failed"),
            EngineError::Sdk(_)
            | EngineError::Parse(_)
            | EngineError::Trust(_)
            | EngineError::Store(_) => warn!(operation, error = %self, "engine: operation failed"),
            _ => debug!(operation, error = %self, "engine: operation declined"),
        }
    }
}

impl From<TransportError> for EngineError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::NoProfile => EngineError::NoProfile,
            TransportError::NoEncryption => EngineError::NoEncryption,
            TransportError::Parse(message) => EngineError::Parse(message),
            other => EngineError::Sdk(other),
        }
    }
}

pub(crate) fn is_forbidden_error(err: &TransportError) -> bool {
    matches!(err, TransportError::Forbidden(_))
}

pub(crate) fn is_unknown_device_error(err: &TransportError) -> bool {
    matches!(err, TransportError::UnknownDevice(_))
}
