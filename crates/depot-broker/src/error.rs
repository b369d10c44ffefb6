//! Error taxonomy for the broker domain.
//!
//! Every failure carries a named kind, never a bare code. Conflicts and
//! transient infrastructure errors are recovered locally by retrying;
//! admission, not-found, and unfulfillable errors surface immediately to the
//! caller; provisioning and timeout errors are logged and surface on the
//! order's next describe.

/// The result type used throughout depot-broker.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in broker operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Placement or mutation was refused: tab insufficient, invalid
    /// transition, or unknown item kind.
    #[error("admission denied: {reason}")]
    AdmissionDenied {
        /// Why admission was refused.
        reason: String,
    },

    /// A SID did not resolve to an entity.
    #[error("not found: {resource_type} {sid}")]
    NotFound {
        /// The type of resource that was looked up.
        resource_type: &'static str,
        /// The SID that did not resolve.
        sid: String,
    },

    /// An optimistic-concurrency collision; the caller retries.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the collision.
        message: String,
    },

    /// The order has no conceivable matching inventory.
    #[error("unfulfillable: {message}")]
    Unfulfillable {
        /// Which requirement cannot ever be met.
        message: String,
    },

    /// A grow or destroy task failed terminally.
    #[error("provisioning error: {message}")]
    Provisioning {
        /// Description of the terminal failure.
        message: String,
    },

    /// A task exceeded its hard timeout or blocked past its start deadline.
    #[error("timeout: {message}")]
    Timeout {
        /// What timed out.
        message: String,
    },

    /// The database or a downstream provider is unreachable.
    #[error("infrastructure error: {message}")]
    Infrastructure {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from depot-core.
    #[error("core error: {0}")]
    Core(#[from] depot_core::Error),
}

impl Error {
    /// Creates a new admission-denied error.
    #[must_use]
    pub fn admission_denied(reason: impl Into<String>) -> Self {
        Self::AdmissionDenied {
            reason: reason.into(),
        }
    }

    /// Creates a new not-found error.
    #[must_use]
    pub fn not_found(resource_type: &'static str, sid: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type,
            sid: sid.into(),
        }
    }

    /// Creates a new conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates a new unfulfillable error.
    #[must_use]
    pub fn unfulfillable(message: impl Into<String>) -> Self {
        Self::Unfulfillable {
            message: message.into(),
        }
    }

    /// Creates a new provisioning error.
    #[must_use]
    pub fn provisioning(message: impl Into<String>) -> Self {
        Self::Provisioning {
            message: message.into(),
        }
    }

    /// Creates a new timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Creates a new infrastructure error.
    #[must_use]
    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::Infrastructure {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true if the caller should retry (conflicts and transient
    /// infrastructure failures).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Infrastructure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_denied_display() {
        let err = Error::admission_denied("tab limit exceeded");
        assert!(err.to_string().contains("admission denied"));
        assert!(err.to_string().contains("tab limit exceeded"));
    }

    #[test]
    fn not_found_display() {
        let err = Error::not_found("order", "abc123-def4567");
        assert!(err.to_string().contains("order"));
        assert!(err.to_string().contains("abc123-def4567"));
    }

    #[test]
    fn conflict_and_infrastructure_are_retryable() {
        assert!(Error::conflict("holder changed").is_retryable());
        assert!(Error::infrastructure("database unreachable").is_retryable());
        assert!(!Error::admission_denied("tab").is_retryable());
        assert!(!Error::unfulfillable("no such kind").is_retryable());
    }
}
