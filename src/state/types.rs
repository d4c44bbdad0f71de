//! State types for tracking provisioned resources.
//!
//! These types represent the recorded state of the infrastructure: which
//! remote object backs each declared resource, the attributes it was last
//! applied with, and what the provider computed for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::StateError;
use crate::graph::ResourceAddress;
use crate::schema::ID_ATTRIBUTE;

/// Current version of the state format.
pub const STATE_VERSION: u32 = 1;

/// Number of history entries kept in the document.
pub const MAX_HISTORY: usize = 100;

/// The complete state document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateDocument {
    /// State format version.
    pub version: u32,
    /// Incremented on every persisted mutation.
    pub serial: u64,
    /// Identifies this state's history across serials.
    pub lineage: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last applied configuration.
    #[serde(default)]
    pub config_hash: String,
    /// Records by address.
    #[serde(default)]
    pub resources: BTreeMap<ResourceAddress, StateRecord>,
    /// Order in which the last successful apply completed its resources.
    #[serde(default)]
    pub apply_order: Vec<ResourceAddress>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// State of a single provisioned resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateRecord {
    /// Resource kind.
    pub kind: String,
    /// Logical name.
    pub name: String,
    /// Provider-assigned identifier.
    pub id: String,
    /// Resolved attributes the resource was last applied with.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Attributes computed by the provider.
    #[serde(default)]
    pub computed: BTreeMap<String, Value>,
    /// Resources this one referenced when it was applied.
    #[serde(default)]
    pub dependencies: BTreeSet<ResourceAddress>,
    /// Set after a failed update or replace; forces a replace next run.
    #[serde(default)]
    pub tainted: bool,
    /// Ids of earlier objects for this address that a replace superseded
    /// but has not deleted yet.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<String>,
    /// When the remote object was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: RunOperation,
    /// Configuration hash at time of the run.
    pub config_hash: String,
    /// Resources changed by the run.
    pub resources: Vec<String>,
    /// Whether every action succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs recorded in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Apply of the configuration.
    Apply,
    /// Destruction of every resource.
    Destroy,
}

impl StateDocument {
    /// Creates a new empty state document with a fresh lineage.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            lineage: Uuid::new_v4().to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            config_hash: String::new(),
            resources: BTreeMap::new(),
            apply_order: Vec::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Parses a stored document, checking the format version first.
    ///
    /// # Errors
    ///
    /// Returns `VersionMismatch` for documents written by a newer format and
    /// `Corrupted` for anything that does not parse.
    pub fn from_json(content: &str) -> Result<Self, StateError> {
        let raw: Value = serde_json::from_str(content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse state: {e}"),
        })?;

        let version = raw
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| StateError::Corrupted {
                message: String::from("State has no numeric 'version' field"),
            })?;
        let found = u32::try_from(version).unwrap_or(u32::MAX);
        if found > STATE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION,
                found,
            });
        }

        serde_json::from_value(raw).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse state: {e}"),
        })
    }

    /// Serializes the document for storage.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, StateError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))
    }

    /// Gets a record by address.
    #[must_use]
    pub fn get(&self, address: &ResourceAddress) -> Option<&StateRecord> {
        self.resources.get(address)
    }

    /// Adds or replaces a record.
    pub fn upsert(&mut self, record: StateRecord) {
        self.resources.insert(record.address(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a record by address.
    pub fn remove(&mut self, address: &ResourceAddress) -> Option<StateRecord> {
        let result = self.resources.remove(address);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Marks a record tainted. Returns false if there is no such record.
    pub fn taint(&mut self, address: &ResourceAddress) -> bool {
        match self.resources.get_mut(address) {
            Some(record) if !record.tainted => {
                record.tainted = true;
                record.updated_at = Utc::now();
                self.last_updated = record.updated_at;
                true
            }
            _ => false,
        }
    }

    /// Adds a history entry, dropping the oldest beyond [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns every recorded address.
    #[must_use]
    pub fn addresses(&self) -> Vec<&ResourceAddress> {
        self.resources.keys().collect()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl StateRecord {
    /// Creates a record for a freshly created remote object.
    #[must_use]
    pub fn new(address: &ResourceAddress, id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            kind: address.kind.clone(),
            name: address.name.clone(),
            id: id.into(),
            attributes: BTreeMap::new(),
            computed: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            tainted: false,
            deposed: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the applied attributes, builder style.
    #[must_use]
    pub fn with_attributes(mut self, attributes: BTreeMap<String, Value>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Sets the computed attributes, builder style.
    #[must_use]
    pub fn with_computed(mut self, computed: BTreeMap<String, Value>) -> Self {
        self.computed = computed;
        self
    }

    /// Sets the deposed object ids, builder style.
    #[must_use]
    pub fn with_deposed(mut self, deposed: Vec<String>) -> Self {
        self.deposed = deposed;
        self
    }

    /// Sets the dependencies, builder style.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: BTreeSet<ResourceAddress>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Returns the address of this record.
    #[must_use]
    pub fn address(&self) -> ResourceAddress {
        ResourceAddress::new(&self.kind, &self.name)
    }

    /// Looks up an output attribute: `id`, then computed, then applied.
    #[must_use]
    pub fn output(&self, attribute: &str) -> Option<Value> {
        if attribute == ID_ATTRIBUTE {
            return Some(Value::String(self.id.clone()));
        }
        self.computed
            .get(attribute)
            .or_else(|| self.attributes.get(attribute))
            .cloned()
    }

    /// All outputs: applied attributes overlaid with computed ones and `id`.
    #[must_use]
    pub fn outputs(&self) -> BTreeMap<String, Value> {
        let mut outputs = self.attributes.clone();
        outputs.extend(self.computed.clone());
        outputs.insert(ID_ATTRIBUTE.to_string(), Value::String(self.id.clone()));
        outputs
    }
}

impl HistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: RunOperation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: RunOperation,
        config_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, config_hash, resources)
        }
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addr(s: &str) -> ResourceAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_record_outputs() {
        let record = StateRecord::new(&addr("vpc.main"), "vpc-1")
            .with_attributes(BTreeMap::from([(String::from("cidr_block"), json!("10.0.0.0/16"))]))
            .with_computed(BTreeMap::from([(String::from("arn"), json!("arn:vpc-1"))]));

        assert_eq!(record.output("id"), Some(json!("vpc-1")));
        assert_eq!(record.output("arn"), Some(json!("arn:vpc-1")));
        assert_eq!(record.output("cidr_block"), Some(json!("10.0.0.0/16")));
        assert_eq!(record.output("missing"), None);
        assert_eq!(record.outputs().len(), 3);
    }

    #[test]
    fn test_document_json_round_trip() {
        let mut doc = StateDocument::new("edge", "dev");
        doc.upsert(StateRecord::new(&addr("vpc.main"), "vpc-1"));
        doc.apply_order.push(addr("vpc.main"));

        let parsed = StateDocument::from_json(&doc.to_json().unwrap()).unwrap();
        assert_eq!(parsed, doc);
    }

    #[test]
    fn test_deposed_ids_survive_round_trip() {
        let mut state = StateDocument::new("p", "dev");
        state.upsert(
            StateRecord::new(&addr("vpc.main"), "vpc-2").with_deposed(vec![String::from("vpc-1")]),
        );

        let loaded = StateDocument::from_json(&state.to_json().unwrap()).unwrap();
        assert_eq!(loaded.get(&addr("vpc.main")).unwrap().deposed, vec!["vpc-1"]);

        let plain = StateRecord::new(&addr("vpc.other"), "vpc-3");
        assert!(!serde_json::to_string(&plain).unwrap().contains("deposed"));
    }

    #[test]
    fn test_newer_version_rejected() {
        let mut doc = StateDocument::new("edge", "dev");
        doc.version = STATE_VERSION + 1;
        let err = StateDocument::from_json(&doc.to_json().unwrap()).unwrap_err();
        assert!(matches!(err, StateError::VersionMismatch { found, .. } if found == STATE_VERSION + 1));
    }

    #[test]
    fn test_garbage_is_corrupted() {
        assert!(matches!(
            StateDocument::from_json("{not json"),
            Err(StateError::Corrupted { .. })
        ));
        assert!(matches!(
            StateDocument::from_json(r#"{"version": 1, "resources": 7}"#),
            Err(StateError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_taint_and_history_cap() {
        let mut doc = StateDocument::new("edge", "dev");
        doc.upsert(StateRecord::new(&addr("vpc.main"), "vpc-1"));
        assert!(doc.taint(&addr("vpc.main")));
        assert!(!doc.taint(&addr("vpc.main")));
        assert!(!doc.taint(&addr("vpc.other")));

        for _ in 0..(MAX_HISTORY + 5) {
            doc.add_history(HistoryEntry::new(RunOperation::Apply, "h", vec![]));
        }
        assert_eq!(doc.history.len(), MAX_HISTORY);
    }
}
