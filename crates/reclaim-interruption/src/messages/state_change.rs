//! Instance state-change notifications

use serde::Deserialize;

use super::{Envelope, Kind, Notification, ParseError};

/// States after which the instance will not serve workloads again
const TERMINAL_STATES: [&str; 4] = ["stopping", "stopped", "shutting-down", "terminated"];

#[derive(Deserialize)]
struct Detail {
    #[serde(rename = "instance-id")]
    instance_id: String,
    state: String,
}

pub(super) fn parse(envelope: &Envelope) -> Result<Notification, ParseError> {
    let detail: Detail = envelope.detail()?;
    let kind = if TERMINAL_STATES.contains(&detail.state.as_str()) {
        Kind::StateChangeTerminal
    } else {
        Kind::StateChangeNonTerminal
    };
    let mut notification = envelope.notification(kind, vec![detail.instance_id]);
    notification.state = Some(detail.state);
    Ok(notification)
}
