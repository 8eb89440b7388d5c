//! Common types for Reclaim: CRDs, settings, errors, events and caches

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod retry;
pub mod settings;
pub mod unavailable_offerings;

pub use error::{Error, ProviderError, ProviderErrorKind};
pub use settings::Settings;
pub use unavailable_offerings::{OfferingKey, UnavailableOfferings};

/// Tag key binding provider resources to a cluster
pub const DISCOVERY_TAG_KEY: &str = "reclaim.dev/discovery";

/// Finalizer holding a NodeTemplate until infrastructure teardown has run
pub const INFRASTRUCTURE_FINALIZER: &str = "reclaim.dev/infrastructure";

/// Field manager name for server-side apply and status patches
pub const FIELD_MANAGER: &str = "reclaim-controller";

/// Well-known node labels read by the interruption controller
pub mod labels {
    /// Instance shape of the node
    pub const INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
    /// Availability zone of the node
    pub const ZONE: &str = "topology.kubernetes.io/zone";
    /// Purchase option of the node (`spot` or `on-demand`)
    pub const CAPACITY_TYPE: &str = "reclaim.dev/capacity-type";
}

/// Capacity type label value for spot instances
pub const CAPACITY_TYPE_SPOT: &str = "spot";

/// Event sources and detail types routed into the interruption queue.
///
/// The routing rules match on these pairs and the message classifier
/// dispatches on them, so both sides are defined once here.
pub mod notification_types {
    /// Source of health and scheduled-maintenance events
    pub const SOURCE_HEALTH: &str = "aws.health";
    /// Source of instance lifecycle events
    pub const SOURCE_EC2: &str = "aws.ec2";

    /// Scheduled maintenance or degraded hardware
    pub const DETAIL_HEALTH_EVENT: &str = "AWS Health Event";
    /// Two-minute spot reclamation warning
    pub const DETAIL_SPOT_INTERRUPTION: &str = "EC2 Spot Instance Interruption Warning";
    /// Elevated risk of spot interruption
    pub const DETAIL_REBALANCE_RECOMMENDATION: &str = "EC2 Instance Rebalance Recommendation";
    /// Instance state transition
    pub const DETAIL_STATE_CHANGE: &str = "EC2 Instance State-change Notification";
}
