//! Graph nodes and their lifecycle status.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::ResourceAddress;
use crate::config::Expr;

/// A declared resource after schema validation and default filling.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    /// Resource address.
    pub address: ResourceAddress,
    /// Desired attributes, possibly holding references.
    pub desired: BTreeMap<String, Expr>,
}

/// Lifecycle of a node during a run.
///
/// `Pending -> Planned -> Executing -> Applied | Failed`, with `Skipped` for
/// nodes never dispatched and `Destroyed` for completed deletes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Not yet planned.
    #[default]
    Pending,
    /// Has a plan entry, waiting for dependencies.
    Planned,
    /// Provider call in flight.
    Executing,
    /// Completed successfully.
    Applied,
    /// Provider call failed.
    Failed,
    /// Not executed because a dependency failed or the run was cancelled.
    Skipped,
    /// Deleted successfully.
    Destroyed,
}

impl ResourceNode {
    /// Creates a node.
    #[must_use]
    pub const fn new(address: ResourceAddress, desired: BTreeMap<String, Expr>) -> Self {
        Self { address, desired }
    }
}

impl NodeStatus {
    /// Returns true if the node will not change status again in this run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Applied | Self::Failed | Self::Skipped | Self::Destroyed
        )
    }

    /// Returns true if the node finished without error.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Applied | Self::Destroyed)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Planned => write!(f, "planned"),
            Self::Executing => write!(f, "executing"),
            Self::Applied => write!(f, "applied"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}
