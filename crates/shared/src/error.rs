use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes reported by the chat backend in its error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "M_FORBIDDEN")]
    Forbidden,
    #[serde(rename = "M_UNKNOWN_DEVICE")]
    UnknownDevice,
    #[serde(rename = "M_ALREADY_JOINED")]
    AlreadyJoined,
    #[serde(rename = "M_NOT_FOUND")]
    NotFound,
    #[serde(rename = "M_UNENCRYPTED")]
    Unencrypted,
    #[serde(rename = "M_NO_MORE_HISTORY")]
    NoMoreHistory,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(rename = "errcode")]
    pub code: ErrorCode,
    #[serde(rename = "error", default)]
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Answer to a profile lookup: a missing profile is `Ok(false)`, not a failure.
    pub fn into_profile_lookup(self) -> Result<bool, TransportError> {
        match self.code {
            ErrorCode::NotFound => Ok(false),
            _ => Err(self.into()),
        }
    }
}

/// Classified failure of a backend transport call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("unknown recipient device: {0}")]
    UnknownDevice(String),
    #[error("already joined")]
    AlreadyJoined,
    #[error("peer has no backend profile")]
    NoProfile,
    #[error("backend cannot guarantee encryption for this channel")]
    NoEncryption,
    #[error("no older history available")]
    CannotPaginate,
    #[error("malformed backend response: {0}")]
    Parse(String),
    #[error("backend error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

impl From<ApiError> for TransportError {
    fn from(value: ApiError) -> Self {
        match value.code {
            ErrorCode::Forbidden => Self::Forbidden(value.message),
            ErrorCode::UnknownDevice => Self::UnknownDevice(value.message),
            ErrorCode::AlreadyJoined => Self::AlreadyJoined,
            ErrorCode::NotFound => Self::Other(value.message),
            ErrorCode::Unencrypted => Self::NoEncryption,
            ErrorCode::NoMoreHistory => Self::CannotPaginate,
            ErrorCode::Unknown => Self::Other(value.message),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value.to_string())
    }
}
