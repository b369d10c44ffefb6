//! Error types and result aliases shared across depot components.

/// The result type used throughout depot-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core codec and identifier operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A SID could not be decoded back to an integer id.
    #[error("invalid sid: {message}")]
    InvalidSid {
        /// Description of what made the SID invalid.
        message: String,
    },

    /// A wire duration string could not be parsed.
    #[error("invalid duration: {message}")]
    InvalidDuration {
        /// Description of what made the duration invalid.
        message: String,
    },
}

impl Error {
    /// Creates a new invalid-SID error.
    #[must_use]
    pub fn invalid_sid(message: impl Into<String>) -> Self {
        Self::InvalidSid {
            message: message.into(),
        }
    }

    /// Creates a new invalid-duration error.
    #[must_use]
    pub fn invalid_duration(message: impl Into<String>) -> Self {
        Self::InvalidDuration {
            message: message.into(),
        }
    }
}
