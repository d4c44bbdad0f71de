//! Plan executor.
//!
//! Runs a plan as a dataflow graph: an entry is dispatched as soon as every
//! entry it depends on has finished successfully and its state write has
//! been acknowledged. Up to `parallelism` entries run at once.
//!
//! Entries that reference other resources are re-evaluated against the
//! values their dependencies actually produced before they run.
//!
//! A failed entry taints its record and skips everything downstream of it;
//! unrelated branches keep going. A failed state write stops all further
//! dispatch. Nothing that was applied is rolled back.

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::diff::DiffEngine;
use super::plan::{Action, Plan, PlanEntry};
use super::resolver::OutputResolver;
use crate::error::{ExecuteError, ProviderError, StateError};
use crate::graph::{NodeStatus, ResourceAddress};
use crate::provider::{Attributes, Provider, ProviderContext, RetryPolicy};
use crate::state::{StateRecord, StateWriter};

/// Default number of entries executed at once.
pub const DEFAULT_PARALLELISM: usize = 4;

/// Executor for plans.
#[derive(Clone)]
pub struct PlanExecutor {
    provider: Arc<dyn Provider>,
    diff: DiffEngine,
    context: ProviderContext,
    retry: RetryPolicy,
    parallelism: usize,
}

/// Outcome of one plan entry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResourceOutcome {
    /// Resource address.
    pub address: ResourceAddress,
    /// Action taken; differs from the plan when a deferred entry settled.
    pub action: Action,
    /// Final status.
    pub status: NodeStatus,
    /// Failure or skip reason.
    pub error: Option<String>,
}

/// Result of executing a plan.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Outcomes in plan order.
    pub outcomes: Vec<ResourceOutcome>,
    /// Resources that now exist as configured, in completion order.
    pub applied: Vec<ResourceAddress>,
    /// State write failure that halted the run.
    pub fatal: Option<StateError>,
    /// The stop signal was received before every entry was dispatched.
    pub cancelled: bool,
}

/// What a worker hands back on success.
struct Done {
    /// `None` for deletes.
    outputs: Option<Attributes>,
}

/// What a worker hands back on failure.
struct Failure {
    message: String,
    fatal: Option<StateError>,
}

/// Errors inside one entry's execution.
enum StepError {
    Provider(ProviderError),
    State(StateError),
    /// The replacement exists but the previous object could not be deleted.
    Leftover { id: String, error: ProviderError },
}

impl From<ProviderError> for StepError {
    fn from(e: ProviderError) -> Self {
        Self::Provider(e)
    }
}

impl From<StateError> for StepError {
    fn from(e: StateError) -> Self {
        Self::State(e)
    }
}

/// Everything a spawned entry needs.
#[derive(Clone)]
struct Worker {
    provider: Arc<dyn Provider>,
    writer: StateWriter,
    context: ProviderContext,
    retry: RetryPolicy,
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.provider.name())
            .field("context", &self.context)
            .field("retry", &self.retry)
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

impl PlanExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, diff: DiffEngine, context: ProviderContext) -> Self {
        Self {
            provider,
            diff,
            context,
            retry: RetryPolicy::default(),
            parallelism: DEFAULT_PARALLELISM,
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the concurrency cap; at least 1.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Executes `plan`, persisting every change through `writer`.
    ///
    /// Setting `stop` to true halts dispatch. In-flight entries finish and
    /// everything not yet dispatched is reported as skipped.
    pub async fn execute(
        &self,
        plan: &Plan,
        writer: &StateWriter,
        stop: watch::Receiver<bool>,
    ) -> ExecutionResult {
        let index: BTreeMap<&ResourceAddress, usize> = plan
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (&e.address, i))
            .collect();
        let mut outcomes: Vec<ResourceOutcome> = plan
            .entries
            .iter()
            .map(|e| ResourceOutcome {
                address: e.address.clone(),
                action: e.action,
                status: NodeStatus::Planned,
                error: None,
            })
            .collect();

        let mut resolver = OutputResolver::for_plan(plan);
        let mut ready: BTreeSet<usize> = resolver
            .initially_ready()
            .iter()
            .filter_map(|a| index.get(a).copied())
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut tasks: JoinSet<(usize, Result<Done, Failure>)> = JoinSet::new();
        let mut applied = Vec::new();
        // Dependents whose old object a destroy-first replace already deleted
        let mut displaced: BTreeSet<ResourceAddress> = BTreeSet::new();
        let mut fatal: Option<StateError> = None;
        let mut halted = false;
        let mut cancelled = false;

        let worker = Worker {
            provider: Arc::clone(&self.provider),
            writer: writer.clone(),
            context: self.context.clone(),
            retry: self.retry.clone(),
        };

        info!(
            mode = %plan.mode,
            entries = plan.entries.len(),
            parallelism = self.parallelism,
            "executing plan"
        );

        loop {
            if !cancelled && *stop.borrow() {
                cancelled = true;
                warn!("stop requested, finishing in-flight actions");
            }

            while !halted && !cancelled {
                let Some(&idx) = ready.first() else {
                    break;
                };
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    break;
                };
                ready.remove(&idx);

                let planned = &plan.entries[idx];
                let resolved = match resolver.resolve(&planned.desired) {
                    Ok(resolved) => resolved,
                    Err(missing) => {
                        let err = ExecuteError::Unresolved {
                            address: planned.address.to_string(),
                            references: missing
                                .iter()
                                .map(ToString::to_string)
                                .collect::<Vec<_>>()
                                .join(", "),
                        };
                        error!(address = %planned.address, error = %err, "cannot dispatch");
                        fail(&mut outcomes, idx, err.to_string());
                        skip_downstream(&mut outcomes, &index, &resolver, &planned.address);
                        continue;
                    }
                };

                let entry = if displaced.contains(&planned.address) {
                    debug!(address = %planned.address, "recreating displaced dependent");
                    let gone = PlanEntry {
                        prior: None,
                        deposed: Vec::new(),
                        displaces: Vec::new(),
                        ..planned.clone()
                    };
                    self.diff.reevaluate(&gone, &resolved)
                } else if planned.deferred
                    || (planned.action != Action::Delete && planned.has_references())
                {
                    let settled = self.diff.reevaluate(planned, &resolved);
                    if settled.action != planned.action {
                        debug!(
                            address = %planned.address,
                            planned = %planned.action,
                            settled = %settled.action,
                            "entry settled"
                        );
                    }
                    settled
                } else {
                    planned.clone()
                };

                if entry.destroys_first() {
                    displaced.extend(entry.displaces.iter().map(StateRecord::address));
                }
                outcomes[idx].action = entry.action;
                outcomes[idx].status = NodeStatus::Executing;

                let worker = worker.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    (idx, worker.execute(entry, resolved).await)
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };

            match joined {
                Ok((idx, Ok(done))) => {
                    let address = &plan.entries[idx].address;
                    outcomes[idx].status = if done.outputs.is_some() {
                        applied.push(address.clone());
                        NodeStatus::Applied
                    } else {
                        NodeStatus::Destroyed
                    };
                    info!(address = %address, action = %outcomes[idx].action, "completed");
                    for next in resolver.complete(address, done.outputs) {
                        if let Some(&i) = index.get(&next) {
                            ready.insert(i);
                        }
                    }
                }
                Ok((idx, Err(failure))) => {
                    let address = &plan.entries[idx].address;
                    fail(&mut outcomes, idx, failure.message);
                    skip_downstream(&mut outcomes, &index, &resolver, address);
                    if let Some(e) = failure.fatal {
                        error!(address = %address, error = %e, "state write failed, halting");
                        halted = true;
                        fatal.get_or_insert(e);
                    }
                }
                Err(e) => {
                    let err = ExecuteError::TaskFailed {
                        message: e.to_string(),
                    };
                    error!(error = %err, "worker task failed, halting");
                    halted = true;
                }
            }
        }

        // Whatever is still executing lost its task; everything else left was never dispatched
        for outcome in outcomes.iter_mut().filter(|o| !o.status.is_terminal()) {
            if outcome.status == NodeStatus::Executing {
                outcome.status = NodeStatus::Failed;
                outcome.error = Some(String::from("worker task failed"));
            } else {
                outcome.status = NodeStatus::Skipped;
                outcome.error = Some(String::from(if cancelled {
                    "cancelled"
                } else {
                    "run halted"
                }));
            }
        }

        ExecutionResult {
            outcomes,
            applied,
            fatal,
            cancelled,
        }
    }
}

fn fail(outcomes: &mut [ResourceOutcome], idx: usize, message: String) {
    outcomes[idx].status = NodeStatus::Failed;
    outcomes[idx].error = Some(message);
}

fn skip_downstream(
    outcomes: &mut [ResourceOutcome],
    index: &BTreeMap<&ResourceAddress, usize>,
    resolver: &OutputResolver,
    failed: &ResourceAddress,
) {
    for address in resolver.downstream(failed) {
        if let Some(&i) = index.get(&address)
            && outcomes[i].status == NodeStatus::Planned
        {
            warn!(address = %address, dependency = %failed, "skipping");
            outcomes[i].status = NodeStatus::Skipped;
            outcomes[i].error = Some(format!("dependency {failed} failed"));
        }
    }
}

impl Worker {
    async fn execute(self, entry: PlanEntry, resolved: Attributes) -> Result<Done, Failure> {
        info!(address = %entry.address, action = %entry.action, "applying");

        match self.perform(&entry, resolved).await {
            Ok(outputs) => Ok(Done { outputs }),
            Err(StepError::State(e)) => Err(Failure {
                message: e.to_string(),
                fatal: Some(e),
            }),
            Err(StepError::Leftover { id, error }) => {
                let message = format!("previous object {id} was not deleted: {error}");
                error!(address = %entry.address, %id, error = %error, "previous object left behind");
                Err(Failure {
                    message,
                    fatal: None,
                })
            }
            Err(StepError::Provider(e)) => {
                error!(address = %entry.address, action = %entry.action, error = %e, "action failed");
                let message = ExecuteError::ActionFailed {
                    action: entry.action.to_string(),
                    address: entry.address.to_string(),
                    reason: e.to_string(),
                }
                .to_string();
                if entry.prior.is_some()
                    && let Err(state) = self.writer.taint(entry.address.clone()).await
                {
                    return Err(Failure {
                        message,
                        fatal: Some(state),
                    });
                }
                Err(Failure {
                    message,
                    fatal: None,
                })
            }
        }
    }

    /// Runs the provider calls for one entry and persists the result.
    /// Returns the entry's outputs, or `None` once it is deleted.
    async fn perform(
        &self,
        entry: &PlanEntry,
        attributes: Attributes,
    ) -> Result<Option<Attributes>, StepError> {
        let ctx = self.context.for_resource(&entry.address);

        let cleared;
        let prior = match entry.prior.as_ref() {
            Some(prior) if !prior.deposed.is_empty() => {
                self.delete_deposed(prior).await?;
                cleared = StateRecord {
                    deposed: Vec::new(),
                    ..prior.clone()
                };
                Some(&cleared)
            }
            other => other,
        };

        match (entry.action, prior) {
            (Action::NoOp, Some(prior)) => {
                if prior.dependencies != entry.dependencies || !entry.deposed.is_empty() {
                    let record = prior.clone().with_dependencies(entry.dependencies.clone());
                    self.writer.upsert(record).await?;
                }
                Ok(Some(prior.outputs()))
            }
            (Action::Update, Some(prior)) => {
                let computed = self.update(&ctx, entry, prior, &attributes).await?;
                let mut record = prior
                    .clone()
                    .with_attributes(attributes)
                    .with_dependencies(entry.dependencies.clone());
                record.computed.extend(computed);
                record.tainted = false;
                record.updated_at = Utc::now();
                let outputs = record.outputs();
                self.writer.upsert(record).await?;
                Ok(Some(outputs))
            }
            (Action::Replace, Some(prior)) if entry.destroys_first() => {
                self.delete_displaced(entry).await?;
                self.delete_object(&ctx, &entry.address, &prior.id).await?;
                self.writer.remove(entry.address.clone()).await?;
                let record = self.create(&ctx, entry, attributes, Vec::new()).await?;
                Ok(Some(record.outputs()))
            }
            (Action::Replace, Some(prior)) => {
                // The old id stays recorded until its object is gone
                let record = self
                    .create(&ctx, entry, attributes, vec![prior.id.clone()])
                    .await?;
                if let Err(error) = self.delete_object(&ctx, &entry.address, &prior.id).await {
                    return Err(StepError::Leftover {
                        id: prior.id.clone(),
                        error,
                    });
                }
                let record = record.with_deposed(Vec::new());
                let outputs = record.outputs();
                self.writer.upsert(record).await?;
                Ok(Some(outputs))
            }
            (Action::Delete, Some(prior)) => {
                self.delete_object(&ctx, &entry.address, &prior.id).await?;
                self.writer.remove(entry.address.clone()).await?;
                Ok(None)
            }
            (Action::Delete, None) => Ok(None),
            (Action::Create, _) | (Action::NoOp | Action::Update | Action::Replace, None) => {
                let record = self.create(&ctx, entry, attributes, Vec::new()).await?;
                Ok(Some(record.outputs()))
            }
        }
    }

    /// Creates the object and persists its record.
    async fn create(
        &self,
        ctx: &ProviderContext,
        entry: &PlanEntry,
        attributes: Attributes,
        deposed: Vec<String>,
    ) -> Result<StateRecord, StepError> {
        let provider = self.provider.as_ref();
        let kind = entry.address.kind.as_str();
        let attrs = &attributes;
        let response = self
            .retry
            .run(&format!("create {}", entry.address), || {
                provider.create(ctx, kind, attrs)
            })
            .await?;

        debug!(address = %entry.address, id = %response.id, "created");
        let record = StateRecord::new(&entry.address, response.id)
            .with_attributes(attributes)
            .with_computed(response.computed)
            .with_dependencies(entry.dependencies.clone())
            .with_deposed(deposed);
        self.writer.upsert(record.clone()).await?;
        Ok(record)
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        entry: &PlanEntry,
        prior: &StateRecord,
        attributes: &Attributes,
    ) -> Result<Attributes, ProviderError> {
        let provider = self.provider.as_ref();
        let kind = entry.address.kind.as_str();
        let id = prior.id.as_str();
        self.retry
            .run(&format!("update {}", entry.address), || {
                provider.update(ctx, kind, id, attributes)
            })
            .await
    }

    /// Deletes a remote object; one that is already gone counts as deleted.
    async fn delete_object(
        &self,
        ctx: &ProviderContext,
        address: &ResourceAddress,
        id: &str,
    ) -> Result<(), ProviderError> {
        let provider = self.provider.as_ref();
        let kind = address.kind.as_str();
        let result = self
            .retry
            .run(&format!("delete {address} ({id})"), || {
                provider.delete(ctx, kind, id)
            })
            .await;

        match result {
            Err(ProviderError::NotFound { .. }) => {
                info!(address = %address, id, "remote object already gone");
                Ok(())
            }
            other => other,
        }
    }

    /// Deletes the objects an earlier replace left behind for `record`.
    async fn delete_deposed(&self, record: &StateRecord) -> Result<(), StepError> {
        let address = record.address();
        let ctx = self.context.for_resource(&address);
        for id in &record.deposed {
            if let Err(error) = self.delete_object(&ctx, &address, id).await {
                return Err(StepError::Leftover {
                    id: id.clone(),
                    error,
                });
            }
            info!(address = %address, id = %id, "deleted deposed object");
        }
        Ok(())
    }

    /// Deletes the dependents a destroy-first replace displaces, deepest first.
    async fn delete_displaced(&self, entry: &PlanEntry) -> Result<(), StepError> {
        for record in &entry.displaces {
            let address = record.address();
            let ctx = self.context.for_resource(&address);
            self.delete_deposed(record).await?;
            self.delete_object(&ctx, &address, &record.id).await?;
            info!(address = %address, dependency = %entry.address, "deleted dependent ahead of replace");
            self.writer.remove(address).await?;
        }
        Ok(())
    }
}

impl ExecutionResult {
    /// Looks up the outcome for an address.
    #[must_use]
    pub fn outcome(&self, address: &ResourceAddress) -> Option<&ResourceOutcome> {
        self.outcomes.iter().find(|o| &o.address == address)
    }

    /// Number of outcomes with `status`.
    #[must_use]
    pub fn count(&self, status: NodeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Returns true if every entry succeeded and state is intact.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.fatal.is_none() && self.outcomes.iter().all(|o| o.status.is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InfraConfig, ResourceConfig};
    use crate::graph::DependencyGraph;
    use crate::provider::{InMemoryProvider, Operation};
    use crate::schema::{AttributeSchema, ResourceSchema, SchemaRegistry};
    use crate::state::{LocalStateStore, StateDocument, StateStore};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn addr(s: &str) -> ResourceAddress {
        s.parse().unwrap()
    }

    fn registry() -> Arc<SchemaRegistry> {
        let mut registry = SchemaRegistry::new();
        registry.register(
            ResourceSchema::new("node")
                .with_attribute("ref", AttributeSchema::string())
                .with_attribute("port", AttributeSchema::number().force_new())
                .with_attribute("host", AttributeSchema::string().computed()),
        );
        registry.register(
            ResourceSchema::new("net")
                .with_attribute("name", AttributeSchema::string().unique())
                .with_attribute("cidr", AttributeSchema::string().force_new()),
        );
        registry.register(
            ResourceSchema::new("sub").with_attribute("net", AttributeSchema::string().force_new()),
        );
        Arc::new(registry)
    }

    fn node(name: &str) -> ResourceConfig {
        ResourceConfig::new("node", name)
    }

    struct Harness {
        _dir: TempDir,
        store: Arc<dyn StateStore>,
        provider: Arc<InMemoryProvider>,
        diff: DiffEngine,
    }

    impl Harness {
        fn new(provider: InMemoryProvider) -> Self {
            let dir = TempDir::new().unwrap();
            let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(dir.path()));
            Self {
                _dir: dir,
                store,
                provider: Arc::new(provider),
                diff: DiffEngine::new(registry()),
            }
        }

        fn executor(&self) -> PlanExecutor {
            PlanExecutor::new(
                Arc::clone(&self.provider) as Arc<dyn Provider>,
                self.diff.clone(),
                ProviderContext::new("test", "dev"),
            )
            .with_retry(RetryPolicy::no_retry())
        }

        async fn run(
            &self,
            resources: Vec<ResourceConfig>,
            state: StateDocument,
            stop: watch::Receiver<bool>,
        ) -> (ExecutionResult, StateDocument) {
            let config = InfraConfig {
                resources,
                ..InfraConfig::new("test")
            };
            let graph = DependencyGraph::build(&config, self.diff.registry()).unwrap();
            let plan = self.diff.plan(&graph, &state, "h").unwrap();
            let (writer, handle) = StateWriter::spawn(Arc::clone(&self.store), state);
            let result = self.executor().execute(&plan, &writer, stop).await;
            drop(writer);
            (result, handle.await.unwrap())
        }
    }

    fn no_stop() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    fn attrs(value: serde_json::Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    fn rejected() -> ProviderError {
        ProviderError::Validation {
            kind: String::from("node"),
            message: String::from("rejected"),
        }
    }

    #[tokio::test]
    async fn test_reference_resolves_after_dependency_persisted() {
        let h = Harness::new(InMemoryProvider::new());
        let (result, state) = h
            .run(
                vec![node("a"), node("b").with_attribute("ref", json!("${node.a.id}"))],
                StateDocument::new("test", "dev"),
                no_stop(),
            )
            .await;

        assert!(result.is_success());
        assert_eq!(result.applied, vec![addr("node.a"), addr("node.b")]);

        let calls = h.provider.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].address, Some(addr("node.a")));
        assert_eq!(calls[1].attributes.as_ref().unwrap()["ref"], json!("node-1"));

        let b = state.get(&addr("node.b")).unwrap();
        assert_eq!(b.attributes["ref"], json!("node-1"));
        assert_eq!(b.dependencies, BTreeSet::from([addr("node.a")]));
        assert_eq!(state.serial, 2);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let provider = InMemoryProvider::new();
        provider.fail_on(
            Operation::Create,
            "node.a",
            ProviderError::Validation {
                kind: String::from("node"),
                message: String::from("rejected"),
            },
        );
        let h = Harness::new(provider);
        let (result, state) = h
            .run(
                vec![
                    node("a"),
                    node("b").with_attribute("ref", json!("${node.a.id}")),
                    node("c").with_attribute("ref", json!("${node.b.id}")),
                    node("d"),
                ],
                StateDocument::new("test", "dev"),
                no_stop(),
            )
            .await;

        assert_eq!(result.outcome(&addr("node.a")).unwrap().status, NodeStatus::Failed);
        assert_eq!(result.outcome(&addr("node.b")).unwrap().status, NodeStatus::Skipped);
        assert_eq!(result.outcome(&addr("node.c")).unwrap().status, NodeStatus::Skipped);
        assert_eq!(result.outcome(&addr("node.d")).unwrap().status, NodeStatus::Applied);
        assert!(!result.is_success());
        assert_eq!(state.len(), 1);
        assert!(state.get(&addr("node.d")).is_some());
    }

    #[tokio::test]
    async fn test_failed_update_taints_record() {
        let provider = InMemoryProvider::new();
        provider.seed("node", "node-1", Attributes::new());
        provider.fail_on(Operation::Update, "node", ProviderError::from_status(409, "conflict"));
        let h = Harness::new(provider);

        let mut state = StateDocument::new("test", "dev");
        state.upsert(StateRecord::new(&addr("node.a"), "node-1"));
        let (result, state) = h
            .run(
                vec![node("a").with_attribute("ref", json!("new"))],
                state,
                no_stop(),
            )
            .await;

        assert_eq!(result.count(NodeStatus::Failed), 1);
        assert!(state.get(&addr("node.a")).unwrap().tainted);
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let h = Harness::new(InMemoryProvider::new().with_latency(Duration::from_millis(20)));
        let resources = (0..8).map(|i| node(&format!("n{i}"))).collect();

        let config = InfraConfig {
            resources,
            ..InfraConfig::new("test")
        };
        let graph = DependencyGraph::build(&config, h.diff.registry()).unwrap();
        let state = StateDocument::new("test", "dev");
        let plan = h.diff.plan(&graph, &state, "h").unwrap();
        let (writer, _handle) = StateWriter::spawn(Arc::clone(&h.store), state);
        let result = h
            .executor()
            .with_parallelism(3)
            .execute(&plan, &writer, no_stop())
            .await;

        assert!(result.is_success());
        assert_eq!(h.provider.max_concurrency(), 3);
    }

    #[tokio::test]
    async fn test_stop_signal_skips_undispatched() {
        let h = Harness::new(InMemoryProvider::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send_replace(true);

        let (result, state) = h
            .run(vec![node("a"), node("b")], StateDocument::new("test", "dev"), stop_rx)
            .await;

        assert!(result.cancelled);
        assert_eq!(result.count(NodeStatus::Skipped), 2);
        assert!(h.provider.calls().is_empty());
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_missing_object_succeeds() {
        let h = Harness::new(InMemoryProvider::new());
        let mut state = StateDocument::new("test", "dev");
        state.upsert(StateRecord::new(&addr("node.gone"), "node-9"));

        let (result, state) = h.run(Vec::new(), state, no_stop()).await;
        assert_eq!(result.outcome(&addr("node.gone")).unwrap().status, NodeStatus::Destroyed);
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_replace_creates_then_deletes() {
        let provider = InMemoryProvider::new();
        provider.seed("node", "node-1", Attributes::from([(String::from("port"), json!(80))]));
        let h = Harness::new(provider);

        let mut state = StateDocument::new("test", "dev");
        state.upsert(
            StateRecord::new(&addr("node.a"), "node-1")
                .with_attributes(Attributes::from([(String::from("port"), json!(80))])),
        );
        let (result, state) = h
            .run(vec![node("a").with_attribute("port", json!(443))], state, no_stop())
            .await;

        assert!(result.is_success());
        let ops: Vec<Operation> = h.provider.calls().iter().map(|c| c.operation).collect();
        assert_eq!(ops, vec![Operation::Create, Operation::Delete]);
        assert_eq!(state.get(&addr("node.a")).unwrap().id, "node-2");
        assert!(h.provider.object("node", "node-1").is_none());
    }

    #[tokio::test]
    async fn test_dependent_follows_output_recomputed_by_update() {
        let provider = InMemoryProvider::new();
        provider.derive_output("node", "host", "ref");
        let h = Harness::new(provider);
        let resources = |r: &str| {
            vec![
                node("a").with_attribute("ref", json!(r)),
                node("b").with_attribute("ref", json!("${node.a.host}")),
            ]
        };

        let (first, state) = h
            .run(resources("1"), StateDocument::new("test", "dev"), no_stop())
            .await;
        assert!(first.is_success());
        assert_eq!(state.get(&addr("node.b")).unwrap().attributes["ref"], json!("host-1"));

        let (second, state) = h.run(resources("2"), state, no_stop()).await;
        assert!(second.is_success());
        assert_eq!(second.outcome(&addr("node.a")).unwrap().action, Action::Update);
        assert_eq!(second.outcome(&addr("node.b")).unwrap().action, Action::Update);
        assert_eq!(state.get(&addr("node.b")).unwrap().attributes["ref"], json!("host-2"));

        let config = InfraConfig {
            resources: resources("2"),
            ..InfraConfig::new("test")
        };
        let graph = DependencyGraph::build(&config, h.diff.registry()).unwrap();
        assert!(h.diff.plan(&graph, &state, "h").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undeleted_previous_object_is_deposed_until_next_run() {
        let provider = InMemoryProvider::new();
        provider.seed("node", "node-1", attrs(json!({"port": 80})));
        provider.fail_times(Operation::Delete, "node.a", 1, rejected());
        let h = Harness::new(provider);

        let mut state = StateDocument::new("test", "dev");
        state.upsert(
            StateRecord::new(&addr("node.a"), "node-1").with_attributes(attrs(json!({"port": 80}))),
        );
        let resources = || vec![node("a").with_attribute("port", json!(443))];

        let (first, state) = h.run(resources(), state, no_stop()).await;
        let outcome = first.outcome(&addr("node.a")).unwrap();
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert!(outcome.error.as_ref().unwrap().contains("node-1"));
        let record = state.get(&addr("node.a")).unwrap();
        assert_eq!(record.id, "node-2");
        assert_eq!(record.deposed, vec!["node-1"]);
        assert!(!record.tainted);
        assert!(h.provider.object("node", "node-1").is_some());

        let (second, state) = h.run(resources(), state, no_stop()).await;
        assert!(second.is_success());
        assert_eq!(second.outcome(&addr("node.a")).unwrap().action, Action::NoOp);
        let record = state.get(&addr("node.a")).unwrap();
        assert_eq!(record.id, "node-2");
        assert!(record.deposed.is_empty());
        assert!(h.provider.object("node", "node-1").is_none());
        assert_eq!(h.provider.object_count(), 1);
    }

    #[tokio::test]
    async fn test_destroy_deletes_deposed_objects() {
        let provider = InMemoryProvider::new();
        provider.seed("node", "node-1", Attributes::new());
        provider.seed("node", "node-2", Attributes::new());
        let h = Harness::new(provider);

        let mut state = StateDocument::new("test", "dev");
        state.upsert(
            StateRecord::new(&addr("node.a"), "node-2").with_deposed(vec![String::from("node-1")]),
        );
        let plan = Plan::destroy(&state).unwrap();
        let (writer, handle) = StateWriter::spawn(Arc::clone(&h.store), state);
        let result = h.executor().execute(&plan, &writer, no_stop()).await;
        drop(writer);
        let state = handle.await.unwrap();

        assert!(result.is_success());
        assert!(state.is_empty());
        assert_eq!(h.provider.object_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_first_replace_recreates_dependents() {
        let provider = InMemoryProvider::new();
        provider.seed("net", "net-1", attrs(json!({"name": "main", "cidr": "10.0.0.0/16"})));
        provider.seed("sub", "sub-1", attrs(json!({"net": "net-1"})));
        let h = Harness::new(provider);

        let mut state = StateDocument::new("test", "dev");
        state.upsert(
            StateRecord::new(&addr("net.main"), "net-1")
                .with_attributes(attrs(json!({"name": "main", "cidr": "10.0.0.0/16"}))),
        );
        state.upsert(
            StateRecord::new(&addr("sub.a"), "sub-1")
                .with_attributes(attrs(json!({"net": "net-1"})))
                .with_dependencies(BTreeSet::from([addr("net.main")])),
        );

        let (result, state) = h
            .run(
                vec![
                    ResourceConfig::new("net", "main")
                        .with_attribute("name", json!("main"))
                        .with_attribute("cidr", json!("10.1.0.0/16")),
                    ResourceConfig::new("sub", "a").with_attribute("net", json!("${net.main.id}")),
                ],
                state,
                no_stop(),
            )
            .await;

        assert!(result.is_success());
        assert_eq!(result.outcome(&addr("sub.a")).unwrap().action, Action::Create);
        let calls: Vec<(Operation, Option<ResourceAddress>)> = h
            .provider
            .calls()
            .into_iter()
            .map(|c| (c.operation, c.address))
            .collect();
        assert_eq!(
            calls,
            vec![
                (Operation::Delete, Some(addr("sub.a"))),
                (Operation::Delete, Some(addr("net.main"))),
                (Operation::Create, Some(addr("net.main"))),
                (Operation::Create, Some(addr("sub.a"))),
            ]
        );
        assert_eq!(state.get(&addr("sub.a")).unwrap().attributes["net"], json!("net-2"));
        assert_eq!(h.provider.object_count(), 2);
    }
}
