//! Interruption handling for Reclaim nodes
//!
//! Consumes provider notifications from the interruption queue and turns
//! them into node actions: spot interruptions and terminal state changes
//! drain the node, maintenance and rebalance notices become events.

#![deny(missing_docs)]

pub mod actions;
pub mod controller;
pub mod messages;
pub mod nodes;

pub use actions::{decide, event_for, NodeAction};
pub use controller::{BatchSummary, InterruptionController, MessageOutcome};
pub use messages::{parse, Kind, Notification, ParseError};
pub use nodes::{KubeNodeStore, NodeStore};
