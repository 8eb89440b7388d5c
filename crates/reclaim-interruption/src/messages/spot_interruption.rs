//! Spot interruption warnings

use serde::Deserialize;

use super::{Envelope, Kind, Notification, ParseError};

#[derive(Deserialize)]
struct Detail {
    #[serde(rename = "instance-id")]
    instance_id: String,
}

pub(super) fn parse(envelope: &Envelope) -> Result<Notification, ParseError> {
    let detail: Detail = envelope.detail()?;
    Ok(envelope.notification(Kind::SpotInterruption, vec![detail.instance_id]))
}
