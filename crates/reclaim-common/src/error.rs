//! Error types for Reclaim
//!
//! Provider failures are translated into [`ProviderErrorKind`] at the cloud
//! boundary, so nothing above `reclaim-aws` ever matches on vendor error
//! strings. Errors carry the operation and the original code for debugging.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Closed classification of cloud provider failures
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    /// The addressed resource does not exist
    NotFound,
    /// A create call raced with an existing resource
    AlreadyExists,
    /// Credentials lack the permission for this call
    PermissionDenied,
    /// The provider throttled the request
    RateLimited,
    /// The queue was deleted less than the provider minimum interval ago
    RecentlyDeleted,
    /// Anything else
    Other,
}

impl ProviderErrorKind {
    /// Short lowercase label used in log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::PermissionDenied => "permission_denied",
            Self::RateLimited => "rate_limited",
            Self::RecentlyDeleted => "recently_deleted",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed call against the queue or event-routing service
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{operation} failed [{kind}] ({code}): {message}")]
pub struct ProviderError {
    /// Classified failure kind
    pub kind: ProviderErrorKind,
    /// Provider operation name (e.g. "CreateQueue")
    pub operation: String,
    /// Raw provider error code, kept for logs only
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl ProviderError {
    /// Create a provider error of the given kind
    pub fn new(
        kind: ProviderErrorKind,
        operation: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation: operation.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a `NotFound` error, mostly useful in fakes and tests
    pub fn not_found(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::NotFound, operation, "NotFound", message)
    }

    /// True when the addressed resource does not exist
    pub fn is_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::NotFound
    }

    /// True when a create call lost a race with an existing resource
    pub fn is_already_exists(&self) -> bool {
        self.kind == ProviderErrorKind::AlreadyExists
    }

    /// True when the queue cannot be recreated yet
    pub fn is_recently_deleted(&self) -> bool {
        self.kind == ProviderErrorKind::RecentlyDeleted
    }

    /// True when the call was throttled
    pub fn is_rate_limited(&self) -> bool {
        self.kind == ProviderErrorKind::RateLimited
    }
}

/// Main error type for Reclaim operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Cloud provider call failed
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Invalid resource or configuration
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource the problem was found on
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// A deadline-bounded operation did not finish in time
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        /// Operation that was cut off
        operation: String,
        /// Deadline that elapsed
        elapsed: Duration,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a validation error without resource context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a named resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// The provider failure kind, if this error came from the provider
    pub fn provider_kind(&self) -> Option<ProviderErrorKind> {
        match self {
            Error::Provider(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Check if this error is retryable
    ///
    /// Permission problems are retryable: once the policy is fixed the next
    /// attempt succeeds without any reset. Validation errors need a config
    /// change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Provider(_) => true,
            Error::Validation { .. } => false,
            Error::Timeout { .. } => true,
            Error::Internal { .. } => true,
        }
    }
}

/// Returns true when a kube error is an API 404
pub fn is_kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
