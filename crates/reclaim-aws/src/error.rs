//! Translation of AWS error codes into [`ProviderErrorKind`]
//!
//! SQS answers with both the legacy query-protocol codes
//! (`AWS.SimpleQueueService.NonExistentQueue`) and the JSON-protocol ones
//! (`QueueDoesNotExist`) depending on SDK version, so both spellings are
//! matched.

use std::fmt::Debug;

use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use reclaim_common::{ProviderError, ProviderErrorKind};

const NOT_FOUND: &[&str] = &[
    "AWS.SimpleQueueService.NonExistentQueue",
    "NonExistentQueue",
    "QueueDoesNotExist",
    "ResourceNotFoundException",
];

const ALREADY_EXISTS: &[&str] = &[
    "QueueAlreadyExists",
    "QueueNameExists",
    "ResourceAlreadyExistsException",
];

const PERMISSION_DENIED: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "UnauthorizedOperation",
    "AuthorizationError",
];

const RATE_LIMITED: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottled",
    "RequestThrottledException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "AWS.SimpleQueueService.RequestThrottled",
];

const RECENTLY_DELETED: &[&str] = &[
    "AWS.SimpleQueueService.QueueDeletedRecently",
    "QueueDeletedRecently",
];

/// Classify a raw AWS error code
pub fn classify(code: &str) -> ProviderErrorKind {
    if NOT_FOUND.contains(&code) {
        ProviderErrorKind::NotFound
    } else if ALREADY_EXISTS.contains(&code) {
        ProviderErrorKind::AlreadyExists
    } else if PERMISSION_DENIED.contains(&code) {
        ProviderErrorKind::PermissionDenied
    } else if RATE_LIMITED.contains(&code) {
        ProviderErrorKind::RateLimited
    } else if RECENTLY_DELETED.contains(&code) {
        ProviderErrorKind::RecentlyDeleted
    } else {
        ProviderErrorKind::Other
    }
}

/// Convert an SDK error from either service into a [`ProviderError`]
pub(crate) fn from_sdk<E, R>(operation: &str, err: SdkError<E, R>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: Debug,
{
    let code = err.code().unwrap_or("Unknown").to_string();
    let message = match err.message() {
        Some(m) => m.to_string(),
        None => DisplayErrorContext(&err).to_string(),
    };
    ProviderError::new(classify(&code), operation, code, message)
}

/// Error for a successful response that lacked a required field
pub(crate) fn missing_field(operation: &str, field: &str) -> ProviderError {
    ProviderError::new(
        ProviderErrorKind::Other,
        operation,
        "MissingField",
        format!("response did not include {}", field),
    )
}

/// Error for a request that could not be built locally
pub(crate) fn build_error(operation: &str, err: impl std::fmt::Display) -> ProviderError {
    ProviderError::new(
        ProviderErrorKind::Other,
        operation,
        "BuildError",
        err.to_string(),
    )
}
