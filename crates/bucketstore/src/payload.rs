//! Error payloads exchanged with the HTTP layer.
//!
//! ```json
//! {"@type": "PathNotFound", "reason": "path not found: a.txt in bucket docs"}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Rejection, StorageError};

/// Discriminators a peer may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    PathNotFound,
    PathContainsLinks,
    PathInvalid,
    PathAlreadyExists,
    InternalError,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::PathNotFound => "PathNotFound",
            ErrorKind::PathContainsLinks => "PathContainsLinks",
            ErrorKind::PathInvalid => "PathInvalid",
            ErrorKind::PathAlreadyExists => "PathAlreadyExists",
            ErrorKind::InternalError => "InternalError",
        }
    }

    /// HTTP status the transport should answer with.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::PathNotFound => 404,
            ErrorKind::PathAlreadyExists => 409,
            ErrorKind::PathContainsLinks => 422,
            ErrorKind::PathInvalid | ErrorKind::InternalError => 500,
        }
    }
}

/// Wire form of a rejection or fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(rename = "@type")]
    pub kind: ErrorKind,
    pub reason: String,
}

impl ErrorPayload {
    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }

    pub fn to_json(&self) -> String {
        // Serializing a plain struct of an enum and a string cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<&Rejection> for ErrorPayload {
    fn from(rejection: &Rejection) -> Self {
        let kind = match rejection {
            Rejection::PathNotFound { .. } => ErrorKind::PathNotFound,
            Rejection::PathAlreadyExists { .. } => ErrorKind::PathAlreadyExists,
            Rejection::PathContainsLinks { .. } => ErrorKind::PathContainsLinks,
        };
        Self {
            kind,
            reason: rejection.to_string(),
        }
    }
}

impl From<&StorageError> for ErrorPayload {
    fn from(err: &StorageError) -> Self {
        let kind = match err {
            StorageError::PathInvalid { .. } => ErrorKind::PathInvalid,
            _ => ErrorKind::InternalError,
        };
        Self {
            kind,
            reason: err.to_string(),
        }
    }
}

/// A failure reported by a remote store, as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("{}: {}", .0.kind.name(), .0.reason)]
    Known(ErrorPayload),

    #[error("unexpected error response (status {status}): {body}")]
    Unknown { status: u16, body: String },
}

impl RemoteError {
    /// Decode an error response body. Unknown discriminators and bodies that
    /// are not payloads at all keep the raw status and body.
    pub fn decode(status: u16, body: &str) -> Self {
        match serde_json::from_str::<ErrorPayload>(body) {
            Ok(payload) => RemoteError::Known(payload),
            Err(_) => RemoteError::Unknown {
                status,
                body: body.to_string(),
            },
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            RemoteError::Known(payload) => Some(payload.kind),
            RemoteError::Unknown { .. } => None,
        }
    }
}
