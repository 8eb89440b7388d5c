//! Kubernetes Event recording for Reclaim controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that the interruption and infrastructure controllers can emit standard
//! Kubernetes Events visible via `kubectl describe node`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never fail message processing.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "InstanceSpotInterrupted")
    /// * `action` - What action was taken (e.g. "CordonAndEvict")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// One event captured by [`RecordingEventPublisher`]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Name of the object the event was attached to
    pub object: Option<String>,
    /// Normal or Warning
    pub type_: EventType,
    /// Reason string
    pub reason: String,
    /// Action string
    pub action: String,
}

/// In-memory publisher that keeps every event; used by tests and dry runs.
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.recorded().clone()
    }

    // A panic while holding the lock leaves the recorded events intact
    fn recorded(&self) -> MutexGuard<'_, Vec<RecordedEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of events recorded with the given reason
    pub fn calls(&self, reason: &str) -> usize {
        self.events().iter().filter(|e| e.reason == reason).count()
    }

    /// Total number of events recorded
    pub fn len(&self) -> usize {
        self.events().len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        _note: Option<String>,
    ) {
        self.recorded().push(RecordedEvent {
            object: resource_ref.name.clone(),
            type_,
            reason: reason.to_string(),
            action: action.to_string(),
        });
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    // Interruption events, attached to nodes
    /// Scheduled maintenance or health event for the instance
    pub const INSTANCE_UNHEALTHY: &str = "InstanceUnhealthy";
    /// Spot interruption warning received
    pub const INSTANCE_SPOT_INTERRUPTED: &str = "InstanceSpotInterrupted";
    /// Capacity rebalance recommendation received
    pub const INSTANCE_REBALANCE_RECOMMENDATION: &str = "InstanceRebalanceRecommendation";
    /// Instance is stopping or stopped
    pub const INSTANCE_STOPPING: &str = "InstanceStopping";
    /// Instance is shutting down or terminated
    pub const INSTANCE_TERMINATING: &str = "InstanceTerminating";

    // Infrastructure events, attached to NodeTemplates
    /// Queue and rules are provisioned
    pub const INFRASTRUCTURE_READY: &str = "InfrastructureReady";
    /// Provisioning the queue or rules failed
    pub const INFRASTRUCTURE_FAILED: &str = "InfrastructureFailed";
    /// Queue and rules were deleted with the last NodeTemplate
    pub const INFRASTRUCTURE_DELETED: &str = "InfrastructureDeleted";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Infrastructure teardown
    pub const DELETE: &str = "Delete";
    /// Node was cordoned and drained
    pub const CORDON_AND_EVICT: &str = "CordonAndEvict";
    /// Notification surfaced without acting on the node
    pub const NOTIFY: &str = "Notify";
}
