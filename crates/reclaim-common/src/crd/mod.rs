//! Custom Resource Definitions for Reclaim

mod node_template;

pub use node_template::{NodeTemplate, NodeTemplatePhase, NodeTemplateSpec, NodeTemplateStatus};
