//! Diff engine comparing desired configuration against recorded state.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use super::plan::{Action, AttributeChange, Plan, PlanEntry, PlanMode, ReplaceStrategy};
use crate::config::{Reference, Resolution};
use crate::error::PlanError;
use crate::graph::{DependencyGraph, ResourceAddress, ResourceNode};
use crate::provider::Attributes;
use crate::schema::{ID_ATTRIBUTE, ResourceSchema, SchemaRegistry};
use crate::state::{StateDocument, StateRecord};

/// Engine classifying each resource into a planned action.
#[derive(Debug, Clone)]
pub struct DiffEngine {
    /// Schemas supplying the per-attribute mutability table.
    registry: Arc<SchemaRegistry>,
}

impl DiffEngine {
    /// Creates a diff engine over a schema registry.
    #[must_use]
    pub const fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    /// Returns the schema registry.
    #[must_use]
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Computes the apply plan for `graph` against `state`.
    ///
    /// Nodes are visited in topological order. A reference resolves at plan
    /// time only when its target keeps its identity (`no-op` or `update`);
    /// anything else leaves the entry deferred until apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the entries cannot be ordered, which only
    /// happens when recorded dependencies are inconsistent.
    pub fn plan(
        &self,
        graph: &DependencyGraph,
        state: &StateDocument,
        config_hash: &str,
    ) -> Result<Plan, PlanError> {
        let mut entries = Vec::with_capacity(graph.len());
        let mut planned: BTreeMap<ResourceAddress, Attributes> = BTreeMap::new();

        for address in graph.topological_order() {
            let Some(node) = graph.node(&address) else {
                continue;
            };
            let lookup = |r: &Reference| {
                planned
                    .get(&r.address)
                    .and_then(|outputs| outputs.get(&r.attribute))
                    .cloned()
            };
            let mut entry = self.diff_node(node, state.get(&address), &lookup);
            entry.dependencies = graph.dependencies(&address);

            debug!(
                address = %entry.address,
                action = %entry.action,
                deferred = entry.deferred,
                changes = entry.changes.len(),
                "classified resource"
            );
            if let Some(outputs) = planned_outputs(&entry) {
                planned.insert(address, outputs);
            }
            entries.push(entry);
        }

        let mut deletes: BTreeMap<ResourceAddress, PlanEntry> = state
            .resources
            .iter()
            .filter(|(address, _)| !graph.contains(address))
            .map(|(address, record)| (address.clone(), PlanEntry::delete(record)))
            .collect();

        // A delete waits for everything whose last applied version used it
        let mut waiting: Vec<(ResourceAddress, ResourceAddress)> = Vec::new();
        for entry in entries.iter().chain(deletes.values()) {
            if let Some(prior) = &entry.prior {
                for dependency in &prior.dependencies {
                    if deletes.contains_key(dependency) {
                        waiting.push((dependency.clone(), entry.address.clone()));
                    }
                }
            }
        }
        for (delete, waits_for) in waiting {
            if let Some(entry) = deletes.get_mut(&delete) {
                entry.dependencies.insert(waits_for);
            }
        }
        entries.extend(deletes.into_values());

        let mut plan = Plan::new(PlanMode::Apply, config_hash, entries)?;
        displace_dependents(&mut plan);
        Ok(plan)
    }

    /// Classifies one node against its record.
    fn diff_node<F>(
        &self,
        node: &ResourceNode,
        prior: Option<&StateRecord>,
        lookup: &F,
    ) -> PlanEntry
    where
        F: Fn(&Reference) -> Option<Value>,
    {
        let mut resolved = Attributes::new();
        let mut unknown = BTreeSet::new();
        for (name, expr) in &node.desired {
            match expr.resolve(lookup) {
                Resolution::Known(value) => {
                    resolved.insert(name.clone(), value);
                }
                Resolution::Unknown(_) => {
                    unknown.insert(name.clone());
                }
            }
        }

        let schema = self.registry.get(&node.address.kind);
        let changes = attribute_changes(schema, prior, &resolved, &unknown);
        let (action, replace_strategy) = classify(schema, prior, &changes, &resolved);

        PlanEntry {
            desired: node.desired.clone(),
            prior: prior.cloned(),
            changes,
            deferred: !unknown.is_empty(),
            replace_strategy,
            deposed: prior.map(|p| p.deposed.clone()).unwrap_or_default(),
            ..PlanEntry::new(node.address.clone(), action)
        }
    }

    /// Re-evaluates a deferred entry once every reference has a value.
    ///
    /// The returned entry is no longer deferred; its action may have
    /// settled on `no-op`, `update` or `replace`.
    #[must_use]
    pub fn reevaluate(&self, entry: &PlanEntry, resolved: &Attributes) -> PlanEntry {
        let schema = self.registry.get(&entry.address.kind);
        let prior = entry.prior.as_ref();
        let changes = attribute_changes(schema, prior, resolved, &BTreeSet::new());
        let (action, replace_strategy) = classify(schema, prior, &changes, resolved);

        PlanEntry {
            action,
            changes,
            deferred: false,
            replace_strategy,
            ..entry.clone()
        }
    }
}

/// Attribute-level differences between a record and resolved desired values.
fn attribute_changes(
    schema: Option<&ResourceSchema>,
    prior: Option<&StateRecord>,
    resolved: &Attributes,
    unknown: &BTreeSet<String>,
) -> Vec<AttributeChange> {
    let empty = Attributes::new();
    let before = prior.map_or(&empty, |p| &p.attributes);
    let force_new = |name: &str| prior.is_some() && schema.is_some_and(|s| !s.is_mutable(name));

    let names: BTreeSet<&String> = before
        .keys()
        .chain(resolved.keys())
        .chain(unknown.iter())
        .collect();

    names
        .into_iter()
        .filter_map(|name| {
            let old = before.get(name);
            let is_unknown = unknown.contains(name);
            let new = resolved.get(name);
            if !is_unknown && old == new {
                return None;
            }
            Some(AttributeChange {
                attribute: name.clone(),
                before: old.cloned(),
                after: new.cloned(),
                unknown: is_unknown,
                force_new: force_new(name),
            })
        })
        .collect()
}

/// Picks the action for a set of changes.
fn classify(
    schema: Option<&ResourceSchema>,
    prior: Option<&StateRecord>,
    changes: &[AttributeChange],
    resolved: &Attributes,
) -> (Action, Option<ReplaceStrategy>) {
    let Some(record) = prior else {
        return (Action::Create, None);
    };

    if record.tainted || changes.iter().any(|c| c.force_new) {
        let collides = schema.is_some_and(|s| {
            resolved
                .iter()
                .any(|(name, value)| s.is_unique(name) && record.attributes.get(name) == Some(value))
        });
        let strategy = if collides {
            ReplaceStrategy::DestroyBeforeCreate
        } else {
            ReplaceStrategy::CreateBeforeDestroy
        };
        return (Action::Replace, Some(strategy));
    }

    if changes.is_empty() {
        (Action::NoOp, None)
    } else {
        (Action::Update, None)
    }
}

/// Gives every destroy-before-create replace the records of the dependents
/// that are replaced along with it, transitively and deepest first.
///
/// Their old objects still point at the resource, so they are deleted
/// before it; the dependents are then created afresh.
fn displace_dependents(plan: &mut Plan) {
    let roots: Vec<ResourceAddress> = plan
        .entries
        .iter()
        .filter(|e| e.destroys_first())
        .map(|e| e.address.clone())
        .collect();

    for root in roots {
        let mut displaced = BTreeSet::new();
        let mut frontier = vec![root.clone()];
        while let Some(current) = frontier.pop() {
            for entry in &plan.entries {
                if entry.action == Action::Replace
                    && entry.prior.is_some()
                    && entry.dependencies.contains(&current)
                    && displaced.insert(entry.address.clone())
                {
                    frontier.push(entry.address.clone());
                }
            }
        }
        if displaced.is_empty() {
            continue;
        }

        let mut records: Vec<(usize, StateRecord)> = plan
            .entries
            .iter()
            .filter(|e| displaced.contains(&e.address))
            .filter_map(|e| e.prior.clone().map(|prior| (e.rank, prior)))
            .collect();
        records.sort_by(|(rank_a, a), (rank_b, b)| {
            rank_b.cmp(rank_a).then_with(|| a.address().cmp(&b.address()))
        });

        debug!(
            address = %root,
            dependents = records.len(),
            "dependents are deleted before the replaced resource"
        );
        if let Some(entry) = plan.entries.iter_mut().find(|e| e.address == root) {
            entry.displaces = records.into_iter().map(|(_, record)| record).collect();
        }
    }
}

/// Outputs of an entry that keeps its identity, as far as they are known
/// before apply.
///
/// An update may recompute any computed output, so only the id and the
/// desired attributes are known for it.
fn planned_outputs(entry: &PlanEntry) -> Option<Attributes> {
    let prior = entry.prior.as_ref()?;
    let mut outputs = match entry.action {
        Action::NoOp => prior.outputs(),
        Action::Update => {
            let mut known = prior.attributes.clone();
            known.insert(ID_ATTRIBUTE.to_string(), Value::String(prior.id.clone()));
            known
        }
        Action::Create | Action::Delete | Action::Replace => return None,
    };
    for change in &entry.changes {
        match &change.after {
            Some(value) => {
                outputs.insert(change.attribute.clone(), value.clone());
            }
            None => {
                outputs.remove(&change.attribute);
            }
        }
    }
    Some(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InfraConfig, ResourceConfig};
    use crate::schema::AttributeSchema;
    use serde_json::json;

    fn addr(s: &str) -> ResourceAddress {
        s.parse().unwrap()
    }

    fn registry() -> Arc<SchemaRegistry> {
        let mut registry = SchemaRegistry::new();
        registry.register(
            ResourceSchema::new("app")
                .with_attribute("name", AttributeSchema::string().unique())
                .with_attribute("port", AttributeSchema::number().force_new())
                .with_attribute("replicas", AttributeSchema::number())
                .with_attribute("upstream", AttributeSchema::string())
                .with_attribute("url", AttributeSchema::string().computed()),
        );
        Arc::new(registry)
    }

    fn plan(resources: Vec<ResourceConfig>, state: &StateDocument) -> Plan {
        let registry = registry();
        let config = InfraConfig {
            resources,
            ..InfraConfig::new("test")
        };
        let graph = DependencyGraph::build(&config, &registry).unwrap();
        DiffEngine::new(registry).plan(&graph, state, "hash").unwrap()
    }

    fn app(name: &str) -> ResourceConfig {
        ResourceConfig::new("app", name)
    }

    fn applied(address: &str, id: &str, attributes: serde_json::Value) -> StateRecord {
        StateRecord::new(&addr(address), id)
            .with_attributes(serde_json::from_value(attributes).unwrap())
    }

    #[test]
    fn test_create_when_no_record() {
        let plan = plan(vec![app("a").with_attribute("port", json!(80))], &StateDocument::new("t", "dev"));
        let entry = plan.entry(&addr("app.a")).unwrap();
        assert_eq!(entry.action, Action::Create);
        assert!(!entry.deferred);
        assert_eq!(entry.changes.len(), 1);
    }

    #[test]
    fn test_immutable_port_change_replaces() {
        let mut state = StateDocument::new("t", "dev");
        state.upsert(applied("app.a", "a-1", json!({"port": 80})));

        let plan = plan(vec![app("a").with_attribute("port", json!(443))], &state);
        let entry = plan.entry(&addr("app.a")).unwrap();
        assert_eq!(entry.action, Action::Replace);
        assert_eq!(entry.replace_strategy, Some(ReplaceStrategy::CreateBeforeDestroy));
        assert_eq!(entry.changes[0].before, Some(json!(80)));
        assert_eq!(entry.changes[0].after, Some(json!(443)));
        assert!(entry.changes[0].force_new);
    }

    #[test]
    fn test_mutable_change_updates_and_equal_is_noop() {
        let mut state = StateDocument::new("t", "dev");
        state.upsert(applied("app.a", "a-1", json!({"port": 80, "replicas": 1})));
        state.upsert(applied("app.b", "b-1", json!({"port": 80})));

        let plan = plan(
            vec![
                app("a").with_attribute("port", json!(80)).with_attribute("replicas", json!(3)),
                app("b").with_attribute("port", json!(80)),
            ],
            &state,
        );
        assert_eq!(plan.action(&addr("app.a")), Some(Action::Update));
        assert_eq!(plan.action(&addr("app.b")), Some(Action::NoOp));
    }

    #[test]
    fn test_tainted_record_replaces() {
        let mut state = StateDocument::new("t", "dev");
        state.upsert(applied("app.a", "a-1", json!({"port": 80})));
        state.taint(&addr("app.a"));

        let plan = plan(vec![app("a").with_attribute("port", json!(80))], &state);
        assert_eq!(plan.action(&addr("app.a")), Some(Action::Replace));
    }

    #[test]
    fn test_unique_value_kept_forces_destroy_first() {
        let mut state = StateDocument::new("t", "dev");
        state.upsert(applied("app.a", "a-1", json!({"name": "web", "port": 80})));

        let plan = plan(
            vec![app("a").with_attribute("name", json!("web")).with_attribute("port", json!(81))],
            &state,
        );
        let entry = plan.entry(&addr("app.a")).unwrap();
        assert_eq!(entry.replace_strategy, Some(ReplaceStrategy::DestroyBeforeCreate));
    }

    #[test]
    fn test_reference_to_created_resource_is_deferred() {
        let mut state = StateDocument::new("t", "dev");
        state.upsert(applied("app.b", "b-1", json!({"upstream": "old", "port": 80})));

        let plan = plan(
            vec![
                app("a"),
                app("b")
                    .with_attribute("upstream", json!("${app.a.id}"))
                    .with_attribute("port", json!(80)),
                app("c").with_attribute("port", json!("${app.a.port}")),
            ],
            &state,
        );

        let b = plan.entry(&addr("app.b")).unwrap();
        assert!(b.deferred);
        assert_eq!(b.action, Action::Update);
        assert!(b.changes[0].unknown);
        assert_eq!(b.dependencies, BTreeSet::from([addr("app.a")]));

        let c = plan.entry(&addr("app.c")).unwrap();
        assert_eq!(c.action, Action::Create);
        assert!(c.deferred);
    }

    #[test]
    fn test_unknown_force_new_is_tentative_replace_and_reevaluates() {
        let mut state = StateDocument::new("t", "dev");
        state.upsert(applied("app.a", "a-1", json!({"port": 80})));
        state.taint(&addr("app.a"));
        state.upsert(applied("app.b", "b-1", json!({"port": 80})));

        let plan = plan(
            vec![
                app("a").with_attribute("port", json!(80)),
                app("b").with_attribute("port", json!("${app.a.port}")),
            ],
            &state,
        );
        let b = plan.entry(&addr("app.b")).unwrap();
        assert_eq!(b.action, Action::Replace);
        assert!(b.deferred);

        let engine = DiffEngine::new(registry());
        let settled = engine.reevaluate(b, &serde_json::from_value(json!({"port": 80})).unwrap());
        assert_eq!(settled.action, Action::NoOp);
        assert!(!settled.deferred);
    }

    #[test]
    fn test_references_to_unchanged_resources_resolve_from_state() {
        let mut state = StateDocument::new("t", "dev");
        state.upsert(
            applied("app.a", "a-1", json!({"port": 80}))
                .with_computed(serde_json::from_value(json!({"url": "http://a"})).unwrap()),
        );
        state.upsert(
            applied("app.b", "b-1", json!({"upstream": "http://a"}))
                .with_dependencies(BTreeSet::from([addr("app.a")])),
        );

        let plan = plan(
            vec![
                app("a").with_attribute("port", json!(80)),
                app("b").with_attribute("upstream", json!("${app.a.url}")),
            ],
            &state,
        );
        assert!(plan.is_empty());
        assert!(plan.entries.iter().all(|e| !e.deferred));
    }

    #[test]
    fn test_computed_output_of_updated_resource_is_deferred() {
        let mut state = StateDocument::new("t", "dev");
        state.upsert(
            applied("app.a", "a-1", json!({"replicas": 1}))
                .with_computed(serde_json::from_value(json!({"url": "url-1"})).unwrap()),
        );
        state.upsert(
            applied("app.b", "b-1", json!({"upstream": "url-1", "name": "a-1"}))
                .with_dependencies(BTreeSet::from([addr("app.a")])),
        );

        let plan = plan(
            vec![
                app("a").with_attribute("replicas", json!(2)),
                app("b")
                    .with_attribute("upstream", json!("${app.a.url}"))
                    .with_attribute("name", json!("${app.a.id}")),
            ],
            &state,
        );
        assert_eq!(plan.action(&addr("app.a")), Some(Action::Update));

        let b = plan.entry(&addr("app.b")).unwrap();
        assert!(b.deferred);
        assert_eq!(b.action, Action::Update);
        let unknown: Vec<&str> = b
            .changes
            .iter()
            .filter(|c| c.unknown)
            .map(|c| c.attribute.as_str())
            .collect();
        assert_eq!(unknown, vec!["upstream"]);
    }

    #[test]
    fn test_destroy_first_replace_displaces_replaced_dependents() {
        let mut registry = SchemaRegistry::new();
        registry.register(
            ResourceSchema::new("net")
                .with_attribute("name", AttributeSchema::string().unique())
                .with_attribute("cidr", AttributeSchema::string().force_new()),
        );
        registry.register(
            ResourceSchema::new("sub")
                .with_attribute("net", AttributeSchema::string().force_new())
                .with_attribute("parent", AttributeSchema::string().force_new())
                .with_attribute("note", AttributeSchema::string()),
        );
        let registry = Arc::new(registry);

        let mut state = StateDocument::new("t", "dev");
        state.upsert(applied("net.main", "net-1", json!({"name": "main", "cidr": "10.0.0.0/16"})));
        state.upsert(
            applied("sub.a", "sub-1", json!({"net": "net-1"}))
                .with_dependencies(BTreeSet::from([addr("net.main")])),
        );
        state.upsert(
            applied("sub.b", "sub-2", json!({"parent": "sub-1"}))
                .with_dependencies(BTreeSet::from([addr("sub.a")])),
        );
        state.upsert(
            applied("sub.c", "sub-3", json!({"note": "main"}))
                .with_dependencies(BTreeSet::from([addr("net.main")])),
        );

        let config = InfraConfig {
            resources: vec![
                ResourceConfig::new("net", "main")
                    .with_attribute("name", json!("main"))
                    .with_attribute("cidr", json!("10.1.0.0/16")),
                ResourceConfig::new("sub", "a").with_attribute("net", json!("${net.main.id}")),
                ResourceConfig::new("sub", "b").with_attribute("parent", json!("${sub.a.id}")),
                ResourceConfig::new("sub", "c").with_attribute("note", json!("${net.main.name}")),
            ],
            ..InfraConfig::new("test")
        };
        let graph = DependencyGraph::build(&config, &registry).unwrap();
        let plan = DiffEngine::new(registry).plan(&graph, &state, "h").unwrap();

        let net = plan.entry(&addr("net.main")).unwrap();
        assert!(net.destroys_first());
        let displaced: Vec<ResourceAddress> = net.displaces.iter().map(StateRecord::address).collect();
        assert_eq!(displaced, vec![addr("sub.b"), addr("sub.a")]);

        assert_eq!(plan.action(&addr("sub.a")), Some(Action::Replace));
        assert_eq!(plan.action(&addr("sub.c")), Some(Action::Update));
    }

    #[test]
    fn test_deposed_objects_make_entry_a_change() {
        let mut state = StateDocument::new("t", "dev");
        state.upsert(
            applied("app.a", "a-2", json!({"port": 80})).with_deposed(vec![String::from("a-1")]),
        );

        let plan = plan(vec![app("a").with_attribute("port", json!(80))], &state);
        let entry = plan.entry(&addr("app.a")).unwrap();
        assert_eq!(entry.action, Action::NoOp);
        assert_eq!(entry.deposed, vec!["a-1"]);
        assert!(plan.has_changes());
    }

    #[test]
    fn test_delete_waits_for_former_dependents() {
        let mut state = StateDocument::new("t", "dev");
        state.upsert(applied("app.a", "a-1", json!({"port": 80})));
        state.upsert(
            applied("app.b", "b-1", json!({"upstream": "a-1"}))
                .with_dependencies(BTreeSet::from([addr("app.a")])),
        );
        state.upsert(
            applied("app.c", "c-1", json!({"upstream": "a-1"}))
                .with_dependencies(BTreeSet::from([addr("app.a")])),
        );

        let plan = plan(vec![app("b").with_attribute("upstream", json!("static"))], &state);
        let delete_a = plan.entry(&addr("app.a")).unwrap();
        assert_eq!(delete_a.action, Action::Delete);
        assert_eq!(
            delete_a.dependencies,
            BTreeSet::from([addr("app.b"), addr("app.c")])
        );
        assert_eq!(plan.action(&addr("app.b")), Some(Action::Update));
        assert_eq!(plan.action(&addr("app.c")), Some(Action::Delete));
        assert_eq!(delete_a.rank, 1);
    }
}
