//! What to do with a node named by a notification

use kube::runtime::events::EventType;

use reclaim_common::events::reasons;

use crate::messages::{Kind, Notification};

/// Decision bound to a resolved node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeAction {
    /// Surface the notification as an event and leave the node alone
    EmitEvent,
    /// Cordon, evict and delete the node, then emit an event
    CordonAndEvict,
    /// Nothing to do
    NoOp,
}

/// Event describing a notification on its node
#[derive(Clone, Debug, PartialEq)]
pub struct InterruptionEvent {
    /// Normal or Warning
    pub type_: EventType,
    /// Reason string
    pub reason: &'static str,
    /// Human-readable note
    pub note: String,
}

/// Action for a notification kind
pub fn decide(kind: Kind) -> NodeAction {
    match kind {
        Kind::SpotInterruption | Kind::StateChangeTerminal => NodeAction::CordonAndEvict,
        Kind::ScheduledChange | Kind::Rebalance => NodeAction::EmitEvent,
        Kind::StateChangeNonTerminal | Kind::Unknown => NodeAction::NoOp,
    }
}

/// Event to publish for a notification, if any
pub fn event_for(notification: &Notification) -> Option<InterruptionEvent> {
    let (type_, reason, note) = match notification.kind {
        Kind::ScheduledChange => (
            EventType::Normal,
            reasons::INSTANCE_UNHEALTHY,
            "Instance has a scheduled maintenance event".to_string(),
        ),
        Kind::SpotInterruption => (
            EventType::Warning,
            reasons::INSTANCE_SPOT_INTERRUPTED,
            "Spot instance is being reclaimed, draining node".to_string(),
        ),
        Kind::Rebalance => (
            EventType::Normal,
            reasons::INSTANCE_REBALANCE_RECOMMENDATION,
            "Spot instance is at elevated risk of interruption".to_string(),
        ),
        Kind::StateChangeTerminal => {
            let state = notification.state.as_deref().unwrap_or("unknown");
            let reason = match state {
                "stopping" | "stopped" => reasons::INSTANCE_STOPPING,
                _ => reasons::INSTANCE_TERMINATING,
            };
            (
                EventType::Warning,
                reason,
                format!("Instance is {}, draining node", state),
            )
        }
        Kind::StateChangeNonTerminal | Kind::Unknown => return None,
    };
    Some(InterruptionEvent { type_, reason, note })
}
