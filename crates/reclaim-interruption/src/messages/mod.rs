//! Classification of raw queue payloads
//!
//! Every payload is an event envelope whose `source` and `detail-type`
//! select a parser from [`PARSERS`]. Pairs missing from the table classify as
//! [`Kind::Unknown`]; bodies that are not a valid envelope, or whose detail
//! does not match the expected shape, are [`ParseError::Malformed`].

mod rebalance;
mod scheduled_change;
mod spot_interruption;
mod state_change;

use serde::Deserialize;
use thiserror::Error;

use reclaim_common::notification_types::{
    DETAIL_HEALTH_EVENT, DETAIL_REBALANCE_RECOMMENDATION, DETAIL_SPOT_INTERRUPTION,
    DETAIL_STATE_CHANGE, SOURCE_EC2, SOURCE_HEALTH,
};

/// Closed classification of a notification
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Scheduled maintenance affecting the instance
    ScheduledChange,
    /// Spot capacity is being reclaimed
    SpotInterruption,
    /// Spot interruption risk is elevated
    Rebalance,
    /// Instance is stopping, stopped, shutting down or terminated
    StateChangeTerminal,
    /// Any other state transition, e.g. pending or running
    StateChangeNonTerminal,
    /// Source and detail type not in the dispatch table
    Unknown,
}

impl Kind {
    /// Label used in log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScheduledChange => "scheduled_change",
            Self::SpotInterruption => "spot_interruption",
            Self::Rebalance => "rebalance",
            Self::StateChangeTerminal => "state_change_terminal",
            Self::StateChangeNonTerminal => "state_change",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    /// Classification
    pub kind: Kind,
    /// Provider event id
    pub event_id: String,
    /// Envelope source
    pub source: String,
    /// Envelope detail type
    pub detail_type: String,
    /// Event time as sent by the provider
    pub time: Option<String>,
    /// Instances the notification is about; health events can name several
    pub instance_ids: Vec<String>,
    /// New instance state, for state-change notifications
    pub state: Option<String>,
}

/// Payload could not be classified
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Body is not a valid envelope or its detail has the wrong shape
    #[error("malformed notification: {0}")]
    Malformed(String),
}

/// Event envelope shared by every notification
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    #[serde(default)]
    pub id: String,
    pub source: String,
    #[serde(rename = "detail-type")]
    pub detail_type: String,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl Envelope {
    /// Notification skeleton carrying the envelope fields
    pub(crate) fn notification(&self, kind: Kind, instance_ids: Vec<String>) -> Notification {
        Notification {
            kind,
            event_id: self.id.clone(),
            source: self.source.clone(),
            detail_type: self.detail_type.clone(),
            time: self.time.clone(),
            instance_ids,
            state: None,
        }
    }

    /// Deserialize the detail object into a kind-specific shape
    pub(crate) fn detail<T: serde::de::DeserializeOwned>(&self) -> Result<T, ParseError> {
        serde_json::from_value(self.detail.clone()).map_err(|e| {
            ParseError::Malformed(format!("{} detail: {}", self.detail_type, e))
        })
    }
}

type Parser = fn(&Envelope) -> Result<Notification, ParseError>;

/// Dispatch table from (source, detail type) to parser
const PARSERS: &[(&str, &str, Parser)] = &[
    (SOURCE_HEALTH, DETAIL_HEALTH_EVENT, scheduled_change::parse),
    (SOURCE_EC2, DETAIL_SPOT_INTERRUPTION, spot_interruption::parse),
    (SOURCE_EC2, DETAIL_REBALANCE_RECOMMENDATION, rebalance::parse),
    (SOURCE_EC2, DETAIL_STATE_CHANGE, state_change::parse),
];

/// Classify a raw payload
pub fn parse(body: &str) -> Result<Notification, ParseError> {
    let envelope: Envelope = serde_json::from_str(body)
        .map_err(|e| ParseError::Malformed(format!("envelope: {}", e)))?;

    match PARSERS
        .iter()
        .find(|(source, detail_type, _)| {
            *source == envelope.source && *detail_type == envelope.detail_type
        }) {
        Some((_, _, parser)) => parser(&envelope),
        None => Ok(envelope.notification(Kind::Unknown, Vec::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spot_interruption_payload() {
        let body = r#"{
            "version": "0",
            "id": "1e5527d7-bb36-4607-3370-4164db56a40e",
            "detail-type": "EC2 Spot Instance Interruption Warning",
            "source": "aws.ec2",
            "account": "123456789012",
            "time": "2022-10-01T12:00:00Z",
            "region": "us-west-2",
            "resources": ["arn:aws:ec2:us-west-2a:instance/i-0b2ac1be61d2c3a1a"],
            "detail": {
                "instance-id": "i-0b2ac1be61d2c3a1a",
                "instance-action": "terminate"
            }
        }"#;
        let n = parse(body).unwrap();
        assert_eq!(n.kind, Kind::SpotInterruption);
        assert_eq!(n.instance_ids, vec!["i-0b2ac1be61d2c3a1a"]);
        assert_eq!(n.event_id, "1e5527d7-bb36-4607-3370-4164db56a40e");
        assert_eq!(n.time.as_deref(), Some("2022-10-01T12:00:00Z"));
    }

    #[test]
    fn scheduled_change_payload_names_every_instance() {
        let body = r#"{
            "version": "0",
            "id": "7fb65329-1628-4cf3-a740-95fg457h1402",
            "detail-type": "AWS Health Event",
            "source": "aws.health",
            "account": "123456789012",
            "time": "2022-10-01T12:00:00Z",
            "region": "us-west-2",
            "resources": [],
            "detail": {
                "eventArn": "arn:aws:health:us-west-2::event/EC2/EC2_INSTANCE_RETIREMENT_SCHEDULED/x",
                "service": "EC2",
                "eventTypeCode": "AWS_EC2_INSTANCE_RETIREMENT_SCHEDULED",
                "eventTypeCategory": "scheduledChange",
                "startTime": "Sat, 05 Oct 2022 12:00:00 GMT",
                "affectedEntities": [
                    {"entityValue": "i-0aaaaaaaaaaaaaaa1"},
                    {"entityValue": "i-0aaaaaaaaaaaaaaa2"}
                ]
            }
        }"#;
        let n = parse(body).unwrap();
        assert_eq!(n.kind, Kind::ScheduledChange);
        assert_eq!(n.instance_ids, vec!["i-0aaaaaaaaaaaaaaa1", "i-0aaaaaaaaaaaaaaa2"]);
    }

    #[test]
    fn rebalance_payload() {
        let body = r#"{
            "id": "5d5c5b1e",
            "detail-type": "EC2 Instance Rebalance Recommendation",
            "source": "aws.ec2",
            "detail": {"instance-id": "i-0123456789abcdef0"}
        }"#;
        let n = parse(body).unwrap();
        assert_eq!(n.kind, Kind::Rebalance);
        assert_eq!(n.instance_ids, vec!["i-0123456789abcdef0"]);
    }

    #[test]
    fn state_change_payloads_split_on_terminal_states() {
        for (state, kind) in [
            ("stopping", Kind::StateChangeTerminal),
            ("stopped", Kind::StateChangeTerminal),
            ("shutting-down", Kind::StateChangeTerminal),
            ("terminated", Kind::StateChangeTerminal),
            ("pending", Kind::StateChangeNonTerminal),
            ("running", Kind::StateChangeNonTerminal),
        ] {
            let body = serde_json::json!({
                "id": "abc",
                "detail-type": "EC2 Instance State-change Notification",
                "source": "aws.ec2",
                "detail": {"instance-id": "i-0123456789abcdef0", "state": state}
            })
            .to_string();
            let n = parse(&body).unwrap();
            assert_eq!(n.kind, kind, "state {}", state);
            assert_eq!(n.state.as_deref(), Some(state));
        }
    }

    #[test]
    fn unknown_detail_type_is_unknown() {
        let body = r#"{
            "id": "x",
            "detail-type": "EC2 AMI State Change",
            "source": "aws.ec2",
            "detail": {}
        }"#;
        let n = parse(body).unwrap();
        assert_eq!(n.kind, Kind::Unknown);
        assert!(n.instance_ids.is_empty());
    }

    #[test]
    fn known_detail_type_from_other_source_is_unknown() {
        let body = r#"{
            "detail-type": "EC2 Spot Instance Interruption Warning",
            "source": "custom.app",
            "detail": {"instance-id": "i-0123456789abcdef0"}
        }"#;
        assert_eq!(parse(body).unwrap().kind, Kind::Unknown);
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert!(matches!(parse("not json"), Err(ParseError::Malformed(_))));
        assert!(matches!(parse(r#"{"id": "x"}"#), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn wrong_detail_shape_is_malformed() {
        let body = r#"{
            "detail-type": "EC2 Spot Instance Interruption Warning",
            "source": "aws.ec2",
            "detail": {"instance-action": "terminate"}
        }"#;
        assert!(matches!(parse(body), Err(ParseError::Malformed(_))));
    }
}
