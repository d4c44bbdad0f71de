//! Plan types and ordering.
//!
//! A plan is an ordered list of entries, one per resource. Entries carry
//! their own dependency sets so the executor can schedule them as a
//! dataflow graph instead of walking the list sequentially.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::config::Expr;
use crate::error::PlanError;
use crate::graph::ResourceAddress;
use crate::state::{StateDocument, StateRecord};

/// What a plan does.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlanMode {
    /// Converge remote objects on the configuration.
    Apply,
    /// Delete every recorded resource.
    Destroy,
}

/// Action planned for one resource.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Create a new remote object.
    Create,
    /// Change a remote object in place.
    Update,
    /// Delete the remote object.
    Delete,
    /// Delete and recreate the remote object.
    Replace,
    /// Nothing to do.
    NoOp,
}

/// Order of the two halves of a replace.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReplaceStrategy {
    /// Create the new object, then delete the old one.
    CreateBeforeDestroy,
    /// Delete the old object first; the new one would collide with it.
    DestroyBeforeCreate,
}

/// One attribute that differs between state and configuration.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AttributeChange {
    /// Attribute name.
    pub attribute: String,
    /// Last applied value.
    pub before: Option<Value>,
    /// Desired value; `None` when removed or not known until apply.
    pub after: Option<Value>,
    /// The desired value depends on outputs not known until apply.
    pub unknown: bool,
    /// Changing this attribute forces a replace.
    pub force_new: bool,
}

/// One resource's planned action.
#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
    /// Resource address.
    pub address: ResourceAddress,
    /// Planned action.
    pub action: Action,
    /// Longest-path level in the plan graph.
    pub rank: usize,
    /// Desired attribute expressions; empty for deletes.
    #[serde(skip)]
    pub desired: BTreeMap<String, Expr>,
    /// Record this entry starts from, if any.
    #[serde(skip)]
    pub prior: Option<StateRecord>,
    /// Attribute-level changes.
    pub changes: Vec<AttributeChange>,
    /// The action depends on outputs not known until apply and is
    /// re-evaluated at dispatch time.
    pub deferred: bool,
    /// Entries that must complete first.
    pub dependencies: BTreeSet<ResourceAddress>,
    /// How a replace is sequenced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace_strategy: Option<ReplaceStrategy>,
    /// Superseded remote objects still to delete.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<String>,
    /// Records of replaced dependents deleted before a destroy-before-create
    /// replace removes this resource, deepest first.
    #[serde(skip)]
    pub displaces: Vec<StateRecord>,
}

/// An ordered set of actions.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was computed.
    pub created_at: DateTime<Utc>,
    /// Hash of the configuration the plan was computed from.
    pub config_hash: String,
    /// Apply or destroy.
    pub mode: PlanMode,
    /// Entries in dispatch order.
    pub entries: Vec<PlanEntry>,
}

/// Per-action counts.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct PlanSummary {
    /// Entries to create.
    pub create: usize,
    /// Entries to update in place.
    pub update: usize,
    /// Entries to replace.
    pub replace: usize,
    /// Entries to delete.
    pub delete: usize,
    /// Unchanged entries.
    pub no_op: usize,
}

impl PlanEntry {
    /// Creates an entry with no changes recorded yet.
    #[must_use]
    pub const fn new(address: ResourceAddress, action: Action) -> Self {
        Self {
            address,
            action,
            rank: 0,
            desired: BTreeMap::new(),
            prior: None,
            changes: Vec::new(),
            deferred: false,
            dependencies: BTreeSet::new(),
            replace_strategy: None,
            deposed: Vec::new(),
            displaces: Vec::new(),
        }
    }

    /// Creates a delete entry for a recorded resource.
    #[must_use]
    pub fn delete(record: &StateRecord) -> Self {
        let changes = record
            .attributes
            .iter()
            .map(|(name, value)| AttributeChange {
                attribute: name.clone(),
                before: Some(value.clone()),
                after: None,
                unknown: false,
                force_new: false,
            })
            .collect();
        Self {
            prior: Some(record.clone()),
            changes,
            deposed: record.deposed.clone(),
            ..Self::new(record.address(), Action::Delete)
        }
    }

    /// Returns true if executing this entry calls the provider.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.action != Action::NoOp || !self.deposed.is_empty()
    }

    /// Returns true if any desired attribute refers to another resource.
    #[must_use]
    pub fn has_references(&self) -> bool {
        self.desired.values().any(Expr::has_references)
    }

    /// Returns true if this is a replace that deletes the old object first.
    #[must_use]
    pub fn destroys_first(&self) -> bool {
        self.action == Action::Replace
            && self.replace_strategy == Some(ReplaceStrategy::DestroyBeforeCreate)
    }

    /// One-line description, e.g. `replace subnet.public (cidr_block)`.
    #[must_use]
    pub fn description(&self) -> String {
        let mut text = format!("{} {}", self.action, self.address);
        let forcing: Vec<&str> = self
            .changes
            .iter()
            .filter(|c| c.force_new)
            .map(|c| c.attribute.as_str())
            .collect();
        if self.action == Action::Replace && !forcing.is_empty() {
            text.push_str(&format!(" ({})", forcing.join(", ")));
        }
        if !self.displaces.is_empty() {
            let first: Vec<String> = self.displaces.iter().map(|r| r.address().to_string()).collect();
            text.push_str(&format!(" (after deleting {})", first.join(", ")));
        }
        if !self.deposed.is_empty() {
            text.push_str(&format!(" (+{} deposed)", self.deposed.len()));
        }
        if self.deferred {
            text.push_str(" [deferred]");
        }
        text
    }
}

impl Plan {
    /// Assembles a plan, computing ranks and sorting entries by
    /// `(rank, address)`.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry depends on an address outside the plan
    /// or the entries form a cycle.
    pub fn new(
        mode: PlanMode,
        config_hash: &str,
        mut entries: Vec<PlanEntry>,
    ) -> Result<Self, PlanError> {
        let ranks = rank_entries(&entries)?;
        for entry in &mut entries {
            entry.rank = ranks.get(&entry.address).copied().unwrap_or(0);
        }
        entries.sort_by(|a, b| (a.rank, &a.address).cmp(&(b.rank, &b.address)));

        Ok(Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            mode,
            entries,
        })
    }

    /// Plans the deletion of every recorded resource.
    ///
    /// Deletes run in the reverse of the last successful apply order.
    /// Records missing from that order go first, dependents before their
    /// dependencies. Each delete waits for the deletes of the records that
    /// depend on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the recorded dependencies form a cycle.
    pub fn destroy(state: &StateDocument) -> Result<Self, PlanError> {
        let mut entries: BTreeMap<ResourceAddress, PlanEntry> = state
            .resources
            .values()
            .map(|record| (record.address(), PlanEntry::delete(record)))
            .collect();

        for record in state.resources.values() {
            for dependency in &record.dependencies {
                if let Some(entry) = entries.get_mut(dependency) {
                    entry.dependencies.insert(record.address());
                }
            }
        }

        let ordered: BTreeSet<&ResourceAddress> = state
            .apply_order
            .iter()
            .filter(|a| state.resources.contains_key(*a))
            .collect();
        let unordered: Vec<PlanEntry> = entries
            .values()
            .filter(|e| !ordered.contains(&e.address))
            .map(|e| PlanEntry {
                dependencies: e
                    .dependencies
                    .iter()
                    .filter(|d| !ordered.contains(d))
                    .cloned()
                    .collect(),
                ..PlanEntry::new(e.address.clone(), Action::Delete)
            })
            .collect();

        // Reverse dependency order: each unordered entry after the
        // unordered entries it waits for
        let mut order = rank_entries(&unordered)?
            .into_iter()
            .map(|(address, rank)| (rank, address))
            .collect::<Vec<_>>();
        order.sort();
        let mut sequence: Vec<ResourceAddress> = order.into_iter().map(|(_, a)| a).collect();

        let mut seen = BTreeSet::new();
        for address in state.apply_order.iter().rev() {
            if ordered.contains(address) && seen.insert(address) {
                sequence.push(address.clone());
            }
        }

        let ranks = rank_entries(&entries.values().cloned().collect::<Vec<_>>())?;
        let entries = sequence
            .into_iter()
            .filter_map(|address| {
                entries.remove(&address).map(|mut entry| {
                    entry.rank = ranks.get(&address).copied().unwrap_or(0);
                    entry
                })
            })
            .collect();

        Ok(Self {
            created_at: Utc::now(),
            config_hash: state.config_hash.clone(),
            mode: PlanMode::Destroy,
            entries,
        })
    }

    /// Returns true if no entry changes anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.has_changes()
    }

    /// Returns true if at least one entry changes something.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(PlanEntry::has_changes)
    }

    /// Looks up the entry for an address.
    #[must_use]
    pub fn entry(&self, address: &ResourceAddress) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| &e.address == address)
    }

    /// Returns the planned action for an address.
    #[must_use]
    pub fn action(&self, address: &ResourceAddress) -> Option<Action> {
        self.entry(address).map(|e| e.action)
    }

    /// Entries that change something, in plan order.
    #[must_use]
    pub fn changes(&self) -> Vec<&PlanEntry> {
        self.entries.iter().filter(|e| e.has_changes()).collect()
    }

    /// Counts entries by action.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for entry in &self.entries {
            match entry.action {
                Action::Create => summary.create += 1,
                Action::Update => summary.update += 1,
                Action::Replace => summary.replace += 1,
                Action::Delete => summary.delete += 1,
                Action::NoOp => summary.no_op += 1,
            }
        }
        summary
    }
}

/// Longest-path level of each entry over its dependency set.
///
/// Dependencies outside `entries` are an error.
fn rank_entries(entries: &[PlanEntry]) -> Result<BTreeMap<ResourceAddress, usize>, PlanError> {
    let known: BTreeSet<&ResourceAddress> = entries.iter().map(|e| &e.address).collect();
    for entry in entries {
        if let Some(missing) = entry.dependencies.iter().find(|d| !known.contains(d)) {
            return Err(PlanError::MissingDependency {
                address: entry.address.to_string(),
                dependency: missing.to_string(),
            });
        }
    }

    let mut ranks: BTreeMap<ResourceAddress, usize> = BTreeMap::new();
    let mut remaining: Vec<&PlanEntry> = entries.iter().collect();
    while !remaining.is_empty() {
        let before = remaining.len();
        remaining.retain(|entry| {
            if entry.dependencies.iter().all(|d| ranks.contains_key(d)) {
                let rank = entry
                    .dependencies
                    .iter()
                    .filter_map(|d| ranks.get(d))
                    .map(|r| r + 1)
                    .max()
                    .unwrap_or(0);
                ranks.insert(entry.address.clone(), rank);
                false
            } else {
                true
            }
        });
        if remaining.len() == before {
            let stuck: Vec<String> = remaining.iter().map(|e| e.address.to_string()).collect();
            return Err(PlanError::Ordering {
                message: format!("entries wait on each other: {}", stuck.join(", ")),
            });
        }
    }
    Ok(ranks)
}

impl fmt::Display for PlanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for ReplaceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateBeforeDestroy => write!(f, "create-before-destroy"),
            Self::DestroyBeforeCreate => write!(f, "destroy-before-create"),
        }
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.create, self.update, self.replace, self.delete, self.no_op
        )
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes. Infrastructure matches the configuration.");
        }

        writeln!(f, "Plan ({}):", self.mode)?;
        for entry in self.changes() {
            writeln!(f, "  {}", entry.description())?;
        }
        write!(f, "{}", self.summary())
    }
}
