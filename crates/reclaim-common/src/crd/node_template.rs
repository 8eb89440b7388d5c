//! NodeTemplate CRD describing how nodes are launched for a tenant
//!
//! Every NodeTemplate requires the shared interruption infrastructure to
//! exist. The infrastructure controller provisions it when the first template
//! appears and tears it down after the last one is deleted.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::INFRASTRUCTURE_FINALIZER;

/// NodeTemplate holds provider launch settings consumed by the provisioner.
///
/// Example:
/// ```yaml
/// apiVersion: reclaim.dev/v1alpha1
/// kind: NodeTemplate
/// metadata:
///   name: default
///   namespace: reclaim-system
/// spec:
///   subnetSelector:
///     reclaim.dev/discovery: prod
///   securityGroupSelector:
///     reclaim.dev/discovery: prod
///   instanceProfile: ReclaimNodeInstanceProfile
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "reclaim.dev",
    version = "v1alpha1",
    kind = "NodeTemplate",
    namespaced,
    status = "NodeTemplateStatus",
    shortname = "nt",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Queue","type":"string","jsonPath":".status.queueName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplateSpec {
    /// Tags selecting the subnets nodes are launched into
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subnet_selector: BTreeMap<String, String>,

    /// Tags selecting the security groups attached to nodes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub security_group_selector: BTreeMap<String, String>,

    /// Instance profile assigned to launched instances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_profile: Option<String>,

    /// Extra tags applied to launched instances
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// NodeTemplate status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplateStatus {
    /// Current phase
    #[serde(default)]
    pub phase: NodeTemplatePhase,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Interruption queue backing this template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
}

/// NodeTemplate phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum NodeTemplatePhase {
    /// Infrastructure not yet confirmed
    #[default]
    Pending,
    /// Queue and rules are in place
    Ready,
    /// Last reconcile failed; retrying
    Failed,
    /// Deletion in progress
    Deleting,
}

impl NodeTemplate {
    /// Whether the template carries the infrastructure finalizer
    pub fn has_finalizer(&self) -> bool {
        self.finalizers()
            .iter()
            .any(|f| f == INFRASTRUCTURE_FINALIZER)
    }

    /// Whether the template is being deleted
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Current phase, defaulting to Pending when no status was written yet
    pub fn phase(&self) -> NodeTemplatePhase {
        self.status
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    #[test]
    fn parses_from_yaml_shaped_json() {
        let value = serde_json::json!({
            "apiVersion": "reclaim.dev/v1alpha1",
            "kind": "NodeTemplate",
            "metadata": { "name": "default", "namespace": "reclaim-system" },
            "spec": {
                "subnetSelector": { "reclaim.dev/discovery": "prod" },
                "instanceProfile": "ReclaimNodeInstanceProfile"
            }
        });
        let template: NodeTemplate = serde_json::from_value(value).expect("parse");
        assert_eq!(template.name_any(), "default");
        assert_eq!(
            template.spec.instance_profile.as_deref(),
            Some("ReclaimNodeInstanceProfile")
        );
        assert!(template.spec.security_group_selector.is_empty());
        assert_eq!(template.phase(), NodeTemplatePhase::Pending);
    }

    #[test]
    fn finalizer_and_deletion_flags() {
        let mut template = NodeTemplate::new("default", NodeTemplateSpec::default());
        assert!(!template.has_finalizer());
        assert!(!template.is_deleting());

        template.metadata.finalizers = Some(vec![INFRASTRUCTURE_FINALIZER.to_string()]);
        template.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(template.has_finalizer());
        assert!(template.is_deleting());
    }

    #[test]
    fn status_serializes_camel_case() {
        let status = NodeTemplateStatus {
            phase: NodeTemplatePhase::Ready,
            message: None,
            queue_name: Some("prod".to_string()),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "Ready");
        assert_eq!(json["queueName"], "prod");
        assert!(json.get("message").is_none());
    }
}
