//! In-process provider.
//!
//! Keeps remote objects in memory. Used for `provider.type: memory` and as
//! the test double for the executor and engine.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

use super::{Attributes, CreateResponse, Operation, Provider, ProviderContext};
use crate::error::ProviderError;
use crate::graph::ResourceAddress;
use crate::schema::{AttributeType, SchemaRegistry};

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCall {
    /// Call kind.
    pub operation: Operation,
    /// Resource kind.
    pub kind: String,
    /// Remote identifier, absent for create.
    pub id: Option<String>,
    /// Resource the call was made for.
    pub address: Option<ResourceAddress>,
    /// Attributes sent with create and update.
    pub attributes: Option<Attributes>,
}

/// An injected failure.
#[derive(Debug, Clone)]
struct FailureRule {
    operation: Operation,
    /// Kind (`vpc`) or address (`vpc.main`).
    target: String,
    /// Remaining failures, `None` for always.
    remaining: Option<u32>,
    error: ProviderError,
}

#[derive(Debug, Default)]
struct Inner {
    /// Remote objects by (kind, id).
    objects: BTreeMap<(String, String), Attributes>,
    /// Last issued id number per kind.
    counters: BTreeMap<String, u64>,
    /// Computed attributes to generate per kind.
    computed: BTreeMap<String, Vec<(String, AttributeType)>>,
    /// Computed attributes recalculated from an input on every write, per kind.
    derived: BTreeMap<String, Vec<(String, String)>>,
    failures: Vec<FailureRule>,
    calls: Vec<ProviderCall>,
}

/// Provider backed by an in-memory object table.
///
/// Ids are deterministic: `{kind}-{n}`, counted per kind from 1.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    inner: Mutex<Inner>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight gauge on drop.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider that fills in every computed attribute the
    /// registry declares.
    #[must_use]
    pub fn from_registry(registry: &SchemaRegistry) -> Self {
        let provider = Self::new();
        {
            let mut inner = provider.lock();
            for kind in registry.kinds() {
                let Some(schema) = registry.get(kind) else {
                    continue;
                };
                let computed: Vec<(String, AttributeType)> = schema
                    .attributes
                    .iter()
                    .filter(|(_, a)| a.computed)
                    .map(|(name, a)| (name.clone(), a.attr_type))
                    .collect();
                if !computed.is_empty() {
                    inner.computed.insert(kind.to_string(), computed);
                }
            }
        }
        provider
    }

    /// Delays every call by `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Registers an existing remote object, e.g. one recorded in state.
    pub fn seed(&self, kind: &str, id: &str, attributes: Attributes) {
        let mut inner = self.lock();
        if let Some(n) = id
            .strip_prefix(kind)
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|n| n.parse::<u64>().ok())
        {
            let counter = inner.counters.entry(kind.to_string()).or_default();
            *counter = (*counter).max(n);
        }
        inner
            .objects
            .insert((kind.to_string(), id.to_string()), attributes);
    }

    /// Makes `output` a computed attribute of `kind` that tracks `source`.
    ///
    /// Every create and update sets it to `{output}-{source value}`.
    pub fn derive_output(&self, kind: &str, output: &str, source: &str) {
        self.lock()
            .derived
            .entry(kind.to_string())
            .or_default()
            .push((output.to_string(), source.to_string()));
    }

    /// Makes every `operation` on `target` fail with `error`.
    ///
    /// `target` is a kind (`subnet`) or an address (`subnet.public`).
    pub fn fail_on(&self, operation: Operation, target: &str, error: ProviderError) {
        self.push_rule(operation, target, None, error);
    }

    /// Makes the next `times` calls of `operation` on `target` fail.
    pub fn fail_times(&self, operation: Operation, target: &str, times: u32, error: ProviderError) {
        self.push_rule(operation, target, Some(times), error);
    }

    fn push_rule(
        &self,
        operation: Operation,
        target: &str,
        remaining: Option<u32>,
        error: ProviderError,
    ) {
        self.lock().failures.push(FailureRule {
            operation,
            target: target.to_string(),
            remaining,
            error,
        });
    }

    /// Changes an attribute behind the engine's back. Returns false if the
    /// object does not exist.
    pub fn set_remote_attribute(&self, kind: &str, id: &str, name: &str, value: Value) -> bool {
        self.lock()
            .objects
            .get_mut(&(kind.to_string(), id.to_string()))
            .map(|attrs| attrs.insert(name.to_string(), value))
            .is_some()
    }

    /// Deletes an object behind the engine's back. Returns false if it did
    /// not exist.
    pub fn forget(&self, kind: &str, id: &str) -> bool {
        self.lock()
            .objects
            .remove(&(kind.to_string(), id.to_string()))
            .is_some()
    }

    /// Returns a remote object's attributes.
    #[must_use]
    pub fn object(&self, kind: &str, id: &str) -> Option<Attributes> {
        self.lock()
            .objects
            .get(&(kind.to_string(), id.to_string()))
            .cloned()
    }

    /// Number of live remote objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Number of calls of one kind.
    #[must_use]
    pub fn call_count(&self, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Highest number of calls that were in flight at the same time.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Logs the call, waits out the latency, and applies any injected failure.
    async fn enter(
        &self,
        ctx: &ProviderContext,
        operation: Operation,
        kind: &str,
        id: Option<&str>,
        attributes: Option<&Attributes>,
    ) -> Result<InFlight<'_>, ProviderError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        trace!(%operation, kind, id, "memory provider call");
        self.lock().calls.push(ProviderCall {
            operation,
            kind: kind.to_string(),
            id: id.map(ToString::to_string),
            address: ctx.resource.clone(),
            attributes: attributes.cloned(),
        });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let address = ctx.resource.as_ref().map(ToString::to_string);
        let mut inner = self.lock();
        let rule = inner.failures.iter_mut().find(|rule| {
            rule.operation == operation
                && rule.remaining != Some(0)
                && (rule.target == kind || Some(&rule.target) == address.as_ref())
        });
        if let Some(rule) = rule {
            if let Some(remaining) = rule.remaining.as_mut() {
                *remaining -= 1;
            }
            return Err(rule.error.clone());
        }
        drop(inner);

        Ok(guard)
    }
}

fn generated_value(attr: &str, attr_type: AttributeType, id: &str, n: u64) -> Value {
    match attr_type {
        AttributeType::Number => Value::from(n),
        AttributeType::Bool => Value::Bool(true),
        AttributeType::List => Value::Array(Vec::new()),
        AttributeType::Map => Value::Object(serde_json::Map::new()),
        AttributeType::String | AttributeType::Any => Value::String(format!("{attr}-{id}")),
    }
}

fn derived_values(inner: &Inner, kind: &str, attributes: &Attributes) -> Attributes {
    inner
        .derived
        .get(kind)
        .map(|rules| {
            rules
                .iter()
                .filter_map(|(output, source)| {
                    let value = match attributes.get(source)? {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    Some((output.clone(), Value::String(format!("{output}-{value}"))))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn not_found(kind: &str, id: &str) -> ProviderError {
    ProviderError::NotFound {
        kind: kind.to_string(),
        id: id.to_string(),
    }
}

#[async_trait]
impl Provider for InMemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create(
        &self,
        ctx: &ProviderContext,
        kind: &str,
        attributes: &Attributes,
    ) -> Result<CreateResponse, ProviderError> {
        let _guard = self
            .enter(ctx, Operation::Create, kind, None, Some(attributes))
            .await?;

        let mut inner = self.lock();
        let counter = inner.counters.entry(kind.to_string()).or_default();
        *counter += 1;
        let n = *counter;
        let id = format!("{kind}-{n}");

        let mut computed: Attributes = inner
            .computed
            .get(kind)
            .map(|attrs| {
                attrs
                    .iter()
                    .map(|(name, t)| (name.clone(), generated_value(name, *t, &id, n)))
                    .collect()
            })
            .unwrap_or_default();
        computed.extend(derived_values(&inner, kind, attributes));

        let mut object = attributes.clone();
        object.extend(computed.clone());
        inner.objects.insert((kind.to_string(), id.clone()), object);

        Ok(CreateResponse { id, computed })
    }

    async fn update(
        &self,
        ctx: &ProviderContext,
        kind: &str,
        id: &str,
        attributes: &Attributes,
    ) -> Result<Attributes, ProviderError> {
        let _guard = self
            .enter(ctx, Operation::Update, kind, Some(id), Some(attributes))
            .await?;

        let mut inner = self.lock();
        let computed_names: Vec<String> = inner
            .computed
            .get(kind)
            .map(|attrs| attrs.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default();
        let derived = derived_values(&inner, kind, attributes);
        let object = inner
            .objects
            .get_mut(&(kind.to_string(), id.to_string()))
            .ok_or_else(|| not_found(kind, id))?;

        let mut computed: Attributes = computed_names
            .into_iter()
            .filter_map(|name| object.get(&name).cloned().map(|v| (name, v)))
            .collect();
        computed.extend(derived);
        let mut next = attributes.clone();
        next.extend(computed.clone());
        *object = next;

        Ok(computed)
    }

    async fn delete(
        &self,
        ctx: &ProviderContext,
        kind: &str,
        id: &str,
    ) -> Result<(), ProviderError> {
        let _guard = self.enter(ctx, Operation::Delete, kind, Some(id), None).await?;
        self.lock()
            .objects
            .remove(&(kind.to_string(), id.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found(kind, id))
    }

    async fn read(
        &self,
        ctx: &ProviderContext,
        kind: &str,
        id: &str,
    ) -> Result<Option<Attributes>, ProviderError> {
        let _guard = self.enter(ctx, Operation::Read, kind, Some(id), None).await?;
        Ok(self.object(kind, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeSchema, ResourceSchema};
    use serde_json::json;
    use std::sync::Arc;

    fn ctx() -> ProviderContext {
        ProviderContext::new("test", "dev")
    }

    fn attrs(value: Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_ids_and_computed_outputs() {
        let mut registry = SchemaRegistry::new();
        registry.register(
            ResourceSchema::new("lb")
                .with_attribute("name", AttributeSchema::string())
                .with_attribute("dns_name", AttributeSchema::string().computed()),
        );
        let provider = InMemoryProvider::from_registry(&registry);

        let first = provider.create(&ctx(), "lb", &attrs(json!({"name": "a"}))).await.unwrap();
        let second = provider.create(&ctx(), "lb", &attrs(json!({"name": "b"}))).await.unwrap();
        let other = provider.create(&ctx(), "vpc", &Attributes::new()).await.unwrap();

        assert_eq!(first.id, "lb-1");
        assert_eq!(second.id, "lb-2");
        assert_eq!(other.id, "vpc-1");
        assert_eq!(first.computed["dns_name"], json!("dns_name-lb-1"));
        assert!(other.computed.is_empty());

        let stored = provider.read(&ctx(), "lb", "lb-2").await.unwrap().unwrap();
        assert_eq!(stored["name"], json!("b"));
        assert_eq!(stored["dns_name"], json!("dns_name-lb-2"));
    }

    #[tokio::test]
    async fn test_update_keeps_computed_and_missing_is_not_found() {
        let mut registry = SchemaRegistry::new();
        registry.register(
            ResourceSchema::new("lb").with_attribute("arn", AttributeSchema::string().computed()),
        );
        let provider = InMemoryProvider::from_registry(&registry);
        let created = provider.create(&ctx(), "lb", &attrs(json!({"port": 80}))).await.unwrap();

        let computed = provider
            .update(&ctx(), "lb", &created.id, &attrs(json!({"port": 8080})))
            .await
            .unwrap();
        assert_eq!(computed["arn"], json!("arn-lb-1"));
        assert_eq!(provider.object("lb", "lb-1").unwrap()["port"], json!(8080));

        let err = provider.delete(&ctx(), "lb", "lb-9").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { .. }));
        assert_eq!(provider.read(&ctx(), "lb", "lb-9").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failure_injection_by_address_and_count() {
        let provider = InMemoryProvider::new();
        provider.fail_times(
            Operation::Create,
            "subnet.a",
            2,
            ProviderError::RateLimited { retry_after_secs: 0 },
        );
        let addr_a = ResourceAddress::new("subnet", "a");
        let addr_b = ResourceAddress::new("subnet", "b");

        let ctx_a = ctx().for_resource(&addr_a);
        assert!(provider.create(&ctx_a, "subnet", &Attributes::new()).await.is_err());
        assert!(provider.create(&ctx().for_resource(&addr_b), "subnet", &Attributes::new()).await.is_ok());
        assert!(provider.create(&ctx_a, "subnet", &Attributes::new()).await.is_err());
        assert!(provider.create(&ctx_a, "subnet", &Attributes::new()).await.is_ok());

        let calls = provider.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[1].address, Some(addr_b));
        assert_eq!(provider.call_count(Operation::Create), 4);
        assert_eq!(provider.object_count(), 2);
    }

    #[tokio::test]
    async fn test_derived_output_follows_source() {
        let provider = InMemoryProvider::new();
        provider.derive_output("app", "url", "size");

        let created = provider
            .create(&ctx(), "app", &attrs(json!({"size": 1})))
            .await
            .unwrap();
        assert_eq!(created.computed["url"], json!("url-1"));

        let computed = provider
            .update(&ctx(), "app", &created.id, &attrs(json!({"size": "large"})))
            .await
            .unwrap();
        assert_eq!(computed["url"], json!("url-large"));
        assert_eq!(provider.object("app", &created.id).unwrap()["url"], json!("url-large"));
    }

    #[tokio::test]
    async fn test_seed_advances_counter() {
        let provider = InMemoryProvider::new();
        provider.seed("vpc", "vpc-7", attrs(json!({"cidr_block": "10.0.0.0/16"})));
        let created = provider.create(&ctx(), "vpc", &Attributes::new()).await.unwrap();
        assert_eq!(created.id, "vpc-8");
        assert!(provider.set_remote_attribute("vpc", "vpc-7", "cidr_block", json!("10.1.0.0/16")));
        assert!(provider.forget("vpc", "vpc-8"));
        assert!(!provider.forget("vpc", "vpc-8"));
    }

    #[tokio::test]
    async fn test_concurrency_gauge() {
        let provider = Arc::new(InMemoryProvider::new().with_latency(Duration::from_millis(20)));
        let mut tasks = Vec::new();
        for _ in 0..3 {
            let provider = Arc::clone(&provider);
            tasks.push(tokio::spawn(async move {
                provider.create(&ctx(), "vpc", &Attributes::new()).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(provider.max_concurrency(), 3);
        assert_eq!(provider.in_flight.load(Ordering::SeqCst), 0);
    }
}
