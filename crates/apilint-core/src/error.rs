//! Error types and result aliases shared across apilint components.
//!
//! Two layers live here: the internal [`Error`] enum used by library code,
//! and the wire shape [`ErrorBody`] surfaced to HTTP and internal callers.
//! The wire shape is content-neutral; callers dispatch on [`ErrorCode`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// The result type used throughout the apilint kernel.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in kernel operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// The requested resource was not found.
    #[error("not found: {resource_type} with id {id}")]
    ResourceNotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new resource not found error.
    #[must_use]
    pub fn resource_not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::ResourceNotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Machine-readable error codes recognized at component boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// A publish event id collided with an existing validation task.
    DuplicateEvent,
    /// The referenced entity does not exist.
    EntityNotFound,
    /// No active ruleset exists for the requested api type and linter.
    NoActiveRuleset,
    /// The revision component of a version reference is malformed.
    InvalidRevisionFormat,
    /// The caller lacks the privileges for the operation.
    InsufficientPrivileges,
    /// Any other failure.
    Internal,
}

impl ErrorCode {
    /// Returns the HTTP status conventionally paired with this code.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::DuplicateEvent => 409,
            Self::EntityNotFound => 404,
            Self::NoActiveRuleset | Self::InvalidRevisionFormat => 400,
            Self::InsufficientPrivileges => 403,
            Self::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::DuplicateEvent => "DuplicateEvent",
            Self::EntityNotFound => "EntityNotFound",
            Self::NoActiveRuleset => "NoActiveRuleset",
            Self::InvalidRevisionFormat => "InvalidRevisionFormat",
            Self::InsufficientPrivileges => "InsufficientPrivileges",
            Self::Internal => "Internal",
        };
        write!(f, "{label}")
    }
}

/// Structured error shape surfaced to HTTP and internal callers.
///
/// The format is content-neutral; only the shape is part of the contract:
/// `{status, code, message, params?, debug?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// HTTP-style status for the failure.
    pub status: u16,
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Optional structured parameters for the message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    /// Optional debugging detail, never shown to end users.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
}

impl ErrorBody {
    /// Creates a new error body with the status derived from the code.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.http_status(),
            code,
            message: message.into(),
            params: None,
            debug: None,
        }
    }

    /// Attaches structured parameters.
    #[must_use]
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Attaches debugging detail.
    #[must_use]
    pub fn with_debug(mut self, debug: impl Into<String>) -> Self {
        self.debug = Some(debug.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::storage_with_source("failed to read file", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn resource_not_found_display() {
        let err = Error::resource_not_found("ruleset", "abc");
        assert_eq!(err.to_string(), "not found: ruleset with id abc");
    }

    #[test]
    fn error_codes_map_to_http_statuses() {
        assert_eq!(ErrorCode::DuplicateEvent.http_status(), 409);
        assert_eq!(ErrorCode::EntityNotFound.http_status(), 404);
        assert_eq!(ErrorCode::InvalidRevisionFormat.http_status(), 400);
        assert_eq!(ErrorCode::Internal.http_status(), 500);
    }

    #[test]
    fn error_body_serializes_camel_case() {
        let body = ErrorBody::new(ErrorCode::DuplicateEvent, "event already seen")
            .with_params(serde_json::json!({"eventId": "E1"}));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], 409);
        assert_eq!(json["code"], "DuplicateEvent");
        assert_eq!(json["params"]["eventId"], "E1");
        assert!(json.get("debug").is_none());
    }
}
