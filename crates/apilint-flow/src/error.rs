//! Error types for the linting pipeline domain.

use apilint_core::{DocTaskId, ErrorBody, ErrorCode, RulesetId, VersionTaskId};

/// The result type used throughout apilint-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A publish event id collided with an existing version task.
    #[error("duplicate event: {event_id}")]
    DuplicateEvent {
        /// The colliding event id.
        event_id: String,
    },

    /// A version task was not found.
    #[error("version task not found: {task_id}")]
    VersionTaskNotFound {
        /// The task ID that was not found.
        task_id: VersionTaskId,
    },

    /// A document task was not found.
    #[error("document task not found: {task_id}")]
    DocTaskNotFound {
        /// The task ID that was not found.
        task_id: DocTaskId,
    },

    /// A ruleset was not found.
    #[error("ruleset not found: {ruleset_id}")]
    RulesetNotFound {
        /// The ruleset ID that was looked up.
        ruleset_id: RulesetId,
    },

    /// No active ruleset exists for an api type / linter pair.
    #[error("no active ruleset for api type {api_type}")]
    NoActiveRuleset {
        /// The api type that had no catalogue entry.
        api_type: String,
    },

    /// A version reference carried a malformed revision.
    #[error("invalid revision format: {value}")]
    InvalidRevisionFormat {
        /// The offending revision value.
        value: String,
    },

    /// An invalid task state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
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

    /// An API Hub call failed.
    #[error("hub error: {message}")]
    Hub {
        /// Description of the hub failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Invalid worker configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An error from the apilint kernel.
    #[error("core error: {0}")]
    Core(#[from] apilint_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
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

    /// Creates a new hub error.
    #[must_use]
    pub fn hub(message: impl Into<String>) -> Self {
        Self::Hub {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new hub error with a source.
    #[must_use]
    pub fn hub_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Hub {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Maps this error onto the structured wire shape.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        match self {
            Self::DuplicateEvent { event_id } => {
                ErrorBody::new(ErrorCode::DuplicateEvent, self.to_string())
                    .with_params(serde_json::json!({ "eventId": event_id }))
            }
            Self::VersionTaskNotFound { .. }
            | Self::DocTaskNotFound { .. }
            | Self::RulesetNotFound { .. } => {
                ErrorBody::new(ErrorCode::EntityNotFound, self.to_string())
            }
            Self::NoActiveRuleset { api_type } => {
                ErrorBody::new(ErrorCode::NoActiveRuleset, self.to_string())
                    .with_params(serde_json::json!({ "apiType": api_type }))
            }
            Self::InvalidRevisionFormat { .. } => {
                ErrorBody::new(ErrorCode::InvalidRevisionFormat, self.to_string())
            }
            Self::Core(apilint_core::Error::ResourceNotFound { .. }) => {
                ErrorBody::new(ErrorCode::EntityNotFound, self.to_string())
            }
            _ => ErrorBody::new(ErrorCode::Internal, "internal error")
                .with_debug(self.to_string()),
        }
    }
}
