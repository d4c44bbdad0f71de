//! Resource dependency graph.
//!
//! This module turns the declared resources into a validated DAG:
//! - Resource addresses (`kind.name`)
//! - Nodes with parsed attribute expressions
//! - Cycle and unknown-reference detection
//! - Deterministic topological order, ranks and destroy order

mod address;
mod builder;
mod node;

pub use address::ResourceAddress;
pub use builder::DependencyGraph;
pub use node::{NodeStatus, ResourceNode};
