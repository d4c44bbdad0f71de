//! Provisioning engine.
//!
//! This module ties the pieces of a run together: it builds the dependency
//! graph, loads recorded state, computes a plan, executes it under the state
//! lock, and finalizes the state document once the run settles.

use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{
    ConfigHasher, ConfigParser, InfraConfig, ProviderType, StateBackend, StateConfig,
};
use crate::error::{ConfigError, ExecuteError, GantryError, Result, StateError, exit_code};
use crate::graph::{DependencyGraph, NodeStatus, ResourceAddress};
use crate::planner::{Action, DiffEngine, Plan, PlanExecutor, ResourceOutcome};
use crate::provider::{
    Attributes, HttpProvider, InMemoryProvider, Provider, ProviderContext, RetryPolicy,
};
use crate::schema::SchemaRegistry;
use crate::state::{
    HistoryEntry, LocalStateStore, RunOperation, S3StateStore, StateDocument, StateMutation,
    StateStore, StateWriter,
};

/// Provisioning engine for one configuration.
pub struct Engine {
    /// Desired configuration.
    config: InfraConfig,
    /// Built-in schemas plus the configuration's own.
    registry: Arc<SchemaRegistry>,
    /// State backend.
    store: Arc<dyn StateStore>,
    /// Infrastructure provider.
    provider: Arc<dyn Provider>,
    /// Context passed to every provider call.
    context: ProviderContext,
    /// Configuration hasher.
    hasher: ConfigHasher,
    /// Retry policy for provider calls.
    retry: RetryPolicy,
    /// Maximum actions in flight.
    parallelism: usize,
}

/// Result of an apply or destroy run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Kind of run.
    pub operation: RunOperation,
    /// Per-resource outcomes in plan order.
    pub outcomes: Vec<ResourceOutcome>,
    /// Resources created, updated or replaced.
    pub changed: usize,
    /// Resources that needed no change.
    pub unchanged: usize,
    /// Resources deleted.
    pub destroyed: usize,
    /// Resources whose action failed.
    pub failed: usize,
    /// Resources never dispatched.
    pub skipped: usize,
    /// Whether the run was stopped early.
    pub cancelled: bool,
    /// State serial after the run.
    pub serial: u64,
}

/// Report of drift between recorded state and remote objects.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// Resources whose remote object differs from state.
    pub drifted: Vec<DriftedResource>,
    /// Number of records checked.
    pub checked: usize,
}

/// One drifted resource.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DriftedResource {
    /// Resource address.
    pub address: ResourceAddress,
    /// Provider identifier.
    pub id: String,
    /// The remote object no longer exists.
    pub missing: bool,
    /// Attributes whose remote value differs from the applied one.
    pub changed: Vec<String>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("project", &self.config.qualified_name())
            .field("store", &self.store.backend_type())
            .field("provider", &self.provider.name())
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine over an explicit store and provider.
    #[must_use]
    pub fn new(
        config: InfraConfig,
        store: Arc<dyn StateStore>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        let registry = Arc::new(SchemaRegistry::with_overrides(&config.schemas));
        let context = ProviderContext::from_config(&config, None);
        let retry = RetryPolicy::from_config(&config.engine.retry);
        let parallelism = config.engine.parallelism.max(1);
        Self {
            config,
            registry,
            store,
            provider,
            context,
            hasher: ConfigHasher::new(),
            retry,
            parallelism,
        }
    }

    /// Creates an engine with the store and provider the configuration asks for.
    ///
    /// Relative state paths resolve against `base_dir`. The in-memory provider
    /// is seeded with every recorded object so consecutive runs agree.
    ///
    /// # Errors
    ///
    /// Returns an error if the state backend or provider cannot be set up.
    pub async fn from_config(config: InfraConfig, base_dir: &Path) -> Result<Self> {
        let store = open_state_store(&config.state, base_dir).await?;

        let provider: Arc<dyn Provider> = match config.provider.provider_type {
            ProviderType::Http => {
                let endpoint = config.provider.endpoint.as_deref().ok_or_else(|| {
                    ConfigError::validation("http provider requires an endpoint", "provider.endpoint")
                })?;
                let provider = match config.provider.timeout_secs {
                    Some(secs) => HttpProvider::with_timeout(endpoint, secs)?,
                    None => HttpProvider::new(endpoint)?,
                };
                Arc::new(provider)
            }
            ProviderType::Memory => {
                let registry = SchemaRegistry::with_overrides(&config.schemas);
                let provider = InMemoryProvider::from_registry(&registry);
                if let Some(state) = store.load().await? {
                    for record in state.resources.values() {
                        let mut object: Attributes = record.attributes.clone();
                        object.extend(record.computed.clone());
                        provider.seed(&record.kind, &record.id, object);
                    }
                }
                Arc::new(provider)
            }
        };

        let token = ConfigParser::provider_token();
        if token.is_none() {
            debug!("No provider token set, calls are unauthenticated");
        }
        let context = ProviderContext::from_config(&config, token);

        Ok(Self::new(config, store, provider).with_context(context))
    }

    /// Sets the provider context.
    #[must_use]
    pub fn with_context(mut self, context: ProviderContext) -> Self {
        self.context = context;
        self
    }

    /// Sets the maximum number of actions in flight; at least 1.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The configuration this engine provisions.
    #[must_use]
    pub const fn config(&self) -> &InfraConfig {
        &self.config
    }

    /// The schema registry in use.
    #[must_use]
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// The state backend.
    #[must_use]
    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    /// Builds and validates the dependency graph.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown kinds, schema violations,
    /// unknown references, or cycles.
    pub fn graph(&self) -> Result<DependencyGraph> {
        Ok(DependencyGraph::build(&self.config, &self.registry)?)
    }

    /// Loads recorded state, or an empty document if none exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or parsed.
    pub async fn load_state(&self) -> Result<StateDocument> {
        Ok(self.store.load().await?.unwrap_or_else(|| {
            StateDocument::new(&self.config.project.name, &self.config.project.environment)
        }))
    }

    /// Computes the plan for the current configuration without changing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is invalid or state cannot be loaded.
    pub async fn plan(&self) -> Result<Plan> {
        let graph = self.graph()?;
        let state = self.load_state().await?;
        let config_hash = self.hasher.hash_config(&self.config);
        Ok(self.diff().plan(&graph, &state, &config_hash)?)
    }

    /// Computes the plan that deletes every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded.
    pub async fn destroy_plan(&self) -> Result<Plan> {
        let state = self.load_state().await?;
        Ok(Plan::destroy(&state)?)
    }

    /// Plans and applies the configuration under the state lock.
    ///
    /// The graph is validated before the lock is taken, so configuration
    /// errors never reach the provider.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid configuration, a held lock, or a state
    /// write failure. Resource failures are reported in the summary.
    pub async fn apply(&self, stop: watch::Receiver<bool>) -> Result<RunSummary> {
        let graph = self.graph()?;

        self.locked(|| async move {
            let state = self.load_state().await?;
            let config_hash = self.hasher.hash_config(&self.config);
            if ConfigHasher::hashes_match(&state.config_hash, &config_hash) {
                info!(
                    hash = %self.hasher.short_hash(&config_hash),
                    "Configuration unchanged since last apply"
                );
            }
            let plan = self.diff().plan(&graph, &state, &config_hash)?;
            self.run(plan, state, RunOperation::Apply, stop).await
        })
        .await
    }

    /// Deletes every recorded resource under the state lock, dependents first.
    ///
    /// # Errors
    ///
    /// Returns an error for a held lock or a state write failure.
    pub async fn destroy(&self, stop: watch::Receiver<bool>) -> Result<RunSummary> {
        self.locked(|| async move {
            let state = self.load_state().await?;
            let plan = Plan::destroy(&state)?;
            self.run(plan, state, RunOperation::Destroy, stop).await
        })
        .await
    }

    /// Reads every recorded object back from the provider and compares it
    /// with the attributes it was last applied with.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or a read fails.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!(
            "Checking for drift in {}/{}",
            self.config.project.name, self.config.project.environment
        );

        let state = self.load_state().await?;
        let provider = self.provider.as_ref();
        let mut report = DriftReport::default();

        for record in state.resources.values() {
            let address = record.address();
            let ctx = self.context.for_resource(&address);
            let kind = record.kind.as_str();
            let id = record.id.as_str();
            let remote = self
                .retry
                .run(&format!("read {address}"), || provider.read(&ctx, kind, id))
                .await?;
            report.checked += 1;

            let drifted = match remote {
                None => Some(DriftedResource {
                    address,
                    id: record.id.clone(),
                    missing: true,
                    changed: Vec::new(),
                }),
                Some(remote) => {
                    let changed: Vec<String> = record
                        .attributes
                        .iter()
                        .filter(|&(name, value)| remote.get(name) != Some(value))
                        .map(|(name, _)| name.clone())
                        .collect();
                    (!changed.is_empty()).then(|| DriftedResource {
                        address,
                        id: record.id.clone(),
                        missing: false,
                        changed,
                    })
                }
            };

            if let Some(drifted) = drifted {
                warn!(address = %drifted.address, missing = drifted.missing, "drift detected");
                report.drifted.push(drifted);
            }
        }

        Ok(report)
    }

    fn diff(&self) -> DiffEngine {
        DiffEngine::new(Arc::clone(&self.registry))
    }

    /// Runs `body` while holding the state lock and releases it afterwards,
    /// unless state writes halted: then the lock stays, marked halted.
    async fn locked<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = self.store.acquire_lock("").await?;
        let result = body().await;

        // After halted writes the recorded state may be missing objects
        if let Err(e @ GantryError::State(StateError::Halted { .. })) = &result {
            error!(lock_id = %lock.lock_id, "State writes halted, keeping the lock until it is force-released");
            if let Err(hold) = self.store.hold_lock(&lock.clone().halt(e.to_string())).await {
                warn!(lock_id = %lock.lock_id, error = %hold, "Failed to mark state lock halted");
            }
        } else if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!(lock_id = %lock.lock_id, error = %e, "Failed to release state lock");
        }
        result
    }

    /// Executes `plan` and finalizes the state document.
    async fn run(
        &self,
        plan: Plan,
        state: StateDocument,
        operation: RunOperation,
        stop: watch::Receiver<bool>,
    ) -> Result<RunSummary> {
        info!(%operation, summary = %plan.summary(), "Starting run");

        let previous_order = state.apply_order.clone();
        let previous_hash = state.config_hash.clone();

        let (writer, handle) = StateWriter::spawn(Arc::clone(&self.store), state);
        let executor = PlanExecutor::new(Arc::clone(&self.provider), self.diff(), self.context.clone())
            .with_retry(self.retry.clone())
            .with_parallelism(self.parallelism);
        let result = executor.execute(&plan, &writer, stop).await;

        if let Some(fatal) = result.fatal {
            drop(writer);
            if let Err(e) = handle.await {
                warn!(error = %e, "State writer task failed");
            }
            return Err(GantryError::State(fatal));
        }

        let mut summary = RunSummary::new(operation, result.outcomes, result.cancelled);
        let success = summary.is_success();

        let snapshot = writer.snapshot();
        let apply_order = if success {
            result.applied
        } else {
            merge_order(&previous_order, &result.applied, &snapshot)
        };
        let config_hash = match (operation, success) {
            (RunOperation::Apply, true) => plan.config_hash.clone(),
            (RunOperation::Destroy, true) => String::new(),
            _ => previous_hash,
        };

        let changed = summary.changed_resources();
        let entry = match summary.failure() {
            None => HistoryEntry::new(operation, &plan.config_hash, changed),
            Some(e) => HistoryEntry::failed(operation, &plan.config_hash, changed, &e.to_string()),
        };
        writer
            .send(StateMutation::Finalize {
                config_hash,
                apply_order,
                entry,
            })
            .await?;
        drop(writer);

        let document = handle
            .await
            .map_err(|e| GantryError::internal(format!("state writer task failed: {e}")))?;
        summary.serial = document.serial;

        info!(
            %operation,
            changed = summary.changed,
            destroyed = summary.destroyed,
            failed = summary.failed,
            skipped = summary.skipped,
            serial = summary.serial,
            "Run finished"
        );
        Ok(summary)
    }
}

/// Opens the configured state backend.
///
/// # Errors
///
/// Returns an error if the S3 backend has no bucket or cannot be reached.
pub async fn open_state_store(
    config: &StateConfig,
    base_dir: &Path,
) -> Result<Arc<dyn StateStore>> {
    match config.backend {
        StateBackend::Local => {
            let store = config.path.as_ref().map_or_else(
                || LocalStateStore::in_project(base_dir),
                |p| LocalStateStore::with_base_dir(base_dir.join(p)),
            );
            Ok(Arc::new(store))
        }
        StateBackend::S3 => {
            let bucket = config.bucket.as_deref().ok_or_else(|| {
                ConfigError::validation("s3 backend requires a bucket", "state.bucket")
            })?;
            let store =
                S3StateStore::new(bucket, config.prefix.as_deref(), config.region.as_deref())
                    .await?;
            Ok(Arc::new(store))
        }
    }
}

/// Apply order after a partial run: the previous order minus removed
/// records, followed by newly applied resources.
fn merge_order(
    previous: &[ResourceAddress],
    applied: &[ResourceAddress],
    state: &StateDocument,
) -> Vec<ResourceAddress> {
    let mut order: Vec<ResourceAddress> = previous
        .iter()
        .filter(|a| state.resources.contains_key(*a))
        .cloned()
        .collect();
    for address in applied {
        if state.resources.contains_key(address) && !order.contains(address) {
            order.push(address.clone());
        }
    }
    order
}

impl RunSummary {
    fn new(operation: RunOperation, outcomes: Vec<ResourceOutcome>, cancelled: bool) -> Self {
        let count = |status: NodeStatus| outcomes.iter().filter(|o| o.status == status).count();
        let unchanged = outcomes
            .iter()
            .filter(|o| o.status == NodeStatus::Applied && o.action == Action::NoOp)
            .count();
        Self {
            operation,
            changed: count(NodeStatus::Applied) - unchanged,
            unchanged,
            destroyed: count(NodeStatus::Destroyed),
            failed: count(NodeStatus::Failed),
            skipped: count(NodeStatus::Skipped),
            cancelled,
            serial: 0,
            outcomes,
        }
    }

    /// Returns true if every resource succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }

    /// The error describing an unsuccessful run.
    #[must_use]
    pub const fn failure(&self) -> Option<ExecuteError> {
        if self.is_success() {
            None
        } else {
            Some(ExecuteError::RunFailed {
                failed: self.failed,
                skipped: self.skipped,
            })
        }
    }

    /// The first failed outcome, or the first skipped one if nothing failed.
    #[must_use]
    pub fn worst_failure(&self) -> Option<&ResourceOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.status == NodeStatus::Failed)
            .or_else(|| self.outcomes.iter().find(|o| o.status == NodeStatus::Skipped))
    }

    /// Process exit code for this run.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        if self.is_success() {
            exit_code::SUCCESS
        } else {
            exit_code::RESOURCE_FAILED
        }
    }

    /// Addresses of resources the run changed.
    fn changed_resources(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.status.is_success() && o.action != Action::NoOp)
            .map(|o| o.address.to_string())
            .collect()
    }
}

impl DriftReport {
    /// Returns true if any resource drifted.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.drifted.is_empty()
    }

    /// Returns true if every remote object matches state.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        !self.has_drift()
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.is_success() { "complete" } else { "incomplete" };
        writeln!(f, "{} {status}:", capitalize(&self.operation.to_string()))?;
        match self.operation {
            RunOperation::Apply => {
                writeln!(f, "  Changed: {}", self.changed)?;
                writeln!(f, "  Unchanged: {}", self.unchanged)?;
            }
            RunOperation::Destroy => writeln!(f, "  Destroyed: {}", self.destroyed)?,
        }
        if self.failed > 0 || self.skipped > 0 {
            writeln!(f, "  Failed: {}", self.failed)?;
            writeln!(f, "  Skipped: {}", self.skipped)?;
        }
        if self.cancelled {
            writeln!(f, "  Run was cancelled")?;
        }
        if let Some(worst) = self.worst_failure() {
            writeln!(
                f,
                "  First error: {} ({})",
                worst.address,
                worst.error.as_deref().unwrap_or("no detail")
            )?;
        }
        Ok(())
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_drift() {
            return write!(f, "No drift detected - {} resource(s) match state", self.checked);
        }
        writeln!(f, "Drift detected:")?;
        for resource in &self.drifted {
            if resource.missing {
                writeln!(f, "  - {} ({}): missing", resource.address, resource.id)?;
            } else {
                writeln!(
                    f,
                    "  - {} ({}): {}",
                    resource.address,
                    resource.id,
                    resource.changed.join(", ")
                )?;
            }
        }
        Ok(())
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}
