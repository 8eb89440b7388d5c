//! AWS providers for Reclaim
//!
//! Two narrow traits sit at the cloud boundary: [`QueueProvider`] for the
//! interruption queue and [`EventRouterProvider`] for the routing rules. The
//! SDK-backed implementations translate AWS error codes into
//! [`reclaim_common::ProviderErrorKind`] and retry throttled calls, so callers
//! only ever reason about the closed error taxonomy.

#![deny(missing_docs)]

pub mod error;
pub mod eventbridge;
#[cfg(any(test, feature = "fake"))]
pub mod fake;
pub mod sqs;

pub use eventbridge::{EventBridgeProvider, EventRouterProvider, RuleSummary};
pub use sqs::{QueueMessage, QueueProvider, SqsQueueProvider};

/// Load the shared SDK config, optionally pinning the region.
///
/// Credentials and region otherwise follow the standard AWS provider chain
/// (environment, profile, IRSA web identity, instance metadata).
pub async fn load_sdk_config(region: Option<String>) -> aws_config::SdkConfig {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(aws_config::Region::new(region));
    }
    loader.load().await
}
