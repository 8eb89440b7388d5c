//! Fixed catalog of routing rules and the queue's attributes
//!
//! Rule names embed a hash of the cluster name, so two clusters sharing an
//! account never collide on names. Teardown still confirms ownership through
//! the discovery tag before deleting anything.

use std::collections::BTreeMap;

use reclaim_common::kube_utils::deterministic_hash;
use reclaim_common::notification_types::{
    DETAIL_HEALTH_EVENT, DETAIL_REBALANCE_RECOMMENDATION, DETAIL_SPOT_INTERRUPTION,
    DETAIL_STATE_CHANGE, SOURCE_EC2, SOURCE_HEALTH,
};
use reclaim_aws::sqs::{ATTR_MESSAGE_RETENTION_PERIOD, ATTR_POLICY};

/// Prefix shared by every rule this system creates; used for listing
pub const RULE_NAME_PREFIX: &str = "Reclaim-";

/// Target id attaching the queue to each rule
pub const TARGET_ID: &str = "ReclaimInterruptionQueueTarget";

/// Provider limit on rule name length
const MAX_RULE_NAME_LEN: usize = 64;

/// Messages older than this are dropped by the queue
pub const MESSAGE_RETENTION_SECS: u32 = 300;

/// The four rules routing interruption signals into the queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuleKind {
    /// Health events: scheduled maintenance, degraded hardware
    ScheduledChange,
    /// Spot interruption warnings
    SpotTermination,
    /// Rebalance recommendations
    Rebalance,
    /// Instance state transitions
    StateChange,
}

impl RuleKind {
    /// Every catalog entry
    pub const ALL: [RuleKind; 4] = [
        RuleKind::ScheduledChange,
        RuleKind::SpotTermination,
        RuleKind::Rebalance,
        RuleKind::StateChange,
    ];

    /// Catalog name of the rule
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScheduledChange => "ScheduledChangeRule",
            Self::SpotTermination => "SpotTerminationRule",
            Self::Rebalance => "RebalanceRule",
            Self::StateChange => "StateChangeRule",
        }
    }

    fn source(&self) -> &'static str {
        match self {
            Self::ScheduledChange => SOURCE_HEALTH,
            _ => SOURCE_EC2,
        }
    }

    fn detail_type(&self) -> &'static str {
        match self {
            Self::ScheduledChange => DETAIL_HEALTH_EVENT,
            Self::SpotTermination => DETAIL_SPOT_INTERRUPTION,
            Self::Rebalance => DETAIL_REBALANCE_RECOMMENDATION,
            Self::StateChange => DETAIL_STATE_CHANGE,
        }
    }

    /// Event pattern JSON matching this rule's notifications
    pub fn event_pattern(&self) -> String {
        serde_json::json!({
            "source": [self.source()],
            "detail-type": [self.detail_type()],
        })
        .to_string()
    }
}

/// A rule as it should exist for one cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogRule {
    /// Which catalog entry this is
    pub kind: RuleKind,
    /// Provider-side rule name
    pub name: String,
    /// Event pattern JSON
    pub event_pattern: String,
}

impl CatalogRule {
    /// Description stored on the rule
    pub fn description(&self) -> String {
        format!("Routes {} notifications to the Reclaim interruption queue", self.kind.detail_type())
    }
}

/// Provider-side rule name for a catalog entry
pub fn rule_name(kind: RuleKind, cluster_name: &str) -> String {
    let mut name = format!(
        "{}{}-{}",
        RULE_NAME_PREFIX,
        kind.as_str(),
        deterministic_hash(cluster_name)
    );
    name.truncate(MAX_RULE_NAME_LEN);
    name
}

/// The full rule set for a cluster
pub fn rule_catalog(cluster_name: &str) -> Vec<CatalogRule> {
    RuleKind::ALL
        .iter()
        .map(|kind| CatalogRule {
            kind: *kind,
            name: rule_name(*kind, cluster_name),
            event_pattern: kind.event_pattern(),
        })
        .collect()
}

/// Access policy letting the routing service deliver into the queue
pub fn queue_policy(queue_arn: &str) -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Id": "ReclaimInterruptionQueuePolicy",
        "Statement": [{
            "Sid": "AllowEventDelivery",
            "Effect": "Allow",
            "Principal": {
                "Service": ["events.amazonaws.com", "sqs.amazonaws.com"]
            },
            "Action": "sqs:SendMessage",
            "Resource": queue_arn,
        }]
    })
    .to_string()
}

/// Attributes enforced on the queue after creation
pub fn queue_attributes(queue_arn: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            ATTR_MESSAGE_RETENTION_PERIOD.to_string(),
            MESSAGE_RETENTION_SECS.to_string(),
        ),
        (ATTR_POLICY.to_string(), queue_policy(queue_arn)),
    ])
}
