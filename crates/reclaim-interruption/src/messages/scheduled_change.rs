//! Health events for scheduled maintenance

use serde::Deserialize;
use tracing::debug;

use super::{Envelope, Kind, Notification, ParseError};

const SERVICE_EC2: &str = "EC2";
const CATEGORY_SCHEDULED_CHANGE: &str = "scheduledChange";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Detail {
    #[serde(default)]
    service: String,
    #[serde(default)]
    event_type_category: String,
    #[serde(default)]
    affected_entities: Vec<AffectedEntity>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AffectedEntity {
    entity_value: String,
}

pub(super) fn parse(envelope: &Envelope) -> Result<Notification, ParseError> {
    let detail: Detail = envelope.detail()?;

    // Health events also cover account-level issues and other services;
    // only instance maintenance is actionable here.
    if detail.service != SERVICE_EC2 || detail.event_type_category != CATEGORY_SCHEDULED_CHANGE {
        debug!(
            service = %detail.service,
            category = %detail.event_type_category,
            "Ignoring health event outside EC2 scheduled changes"
        );
        return Ok(envelope.notification(Kind::Unknown, Vec::new()));
    }

    let instance_ids = detail
        .affected_entities
        .into_iter()
        .map(|e| e.entity_value)
        .filter(|id| !id.is_empty())
        .collect();
    Ok(envelope.notification(Kind::ScheduledChange, instance_ids))
}
