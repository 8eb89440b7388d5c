//! Interruption infrastructure lifecycle
//!
//! Provisions one queue and a fixed set of routing rules per cluster,
//! shared by every NodeTemplate, and removes them when the last template is
//! deleted.

#![deny(missing_docs)]

pub mod catalog;
pub mod controller;
pub mod manager;
pub mod owners;

pub use controller::{error_policy, reconcile, Context};
pub use manager::{EnsureOutcome, InfrastructureManager, TeardownOutcome};
pub use owners::{KubeOwnerStore, OwnerStore};
