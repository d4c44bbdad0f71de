//! Configuration specification types for the provisioning engine.
//!
//! This module defines all the structs that map to the `gantry.yaml` file.
//! These types are declarative: they describe the desired infrastructure,
//! never how to reach it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

use crate::schema::ResourceSchema;

/// The root configuration structure for a Gantry project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InfraConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// Provider configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Engine tuning (parallelism, retries).
    #[serde(default)]
    pub engine: EngineConfig,
    /// Additional or overriding resource schemas.
    #[serde(default)]
    pub schemas: Vec<ResourceSchema>,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProviderConfig {
    /// Provider implementation.
    #[serde(rename = "type", default)]
    pub provider_type: ProviderType,
    /// Base URL of the provider API (required for `http`).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Target region.
    #[serde(default)]
    pub region: Option<String>,
    /// Request timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Provider implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// In-process simulated provider.
    #[default]
    Memory,
    /// REST provider over HTTP.
    Http,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct EngineConfig {
    /// Maximum number of provider actions in flight.
    #[serde(default = "default_parallelism")]
    #[validate(range(min = 1, max = 64))]
    pub parallelism: usize,
    /// Retry policy for transient provider errors.
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct RetryConfig {
    /// Total attempts per provider call, including the first.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    #[validate(range(min = 1.0, max = 10.0))]
    pub multiplier: f64,
}

/// A single declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Resource kind (must exist in the schema registry).
    pub kind: String,
    /// Logical name, unique per kind.
    pub name: String,
    /// Desired attributes: literals, lists, maps and `${kind.name.attr}` references.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

// Default value functions

const fn default_parallelism() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_multiplier() -> f64 {
    2.0
}

fn default_environment() -> String {
    String::from("dev")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl InfraConfig {
    /// Creates an empty configuration for a project with default settings.
    #[must_use]
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: ProjectConfig {
                name: project.into(),
                environment: default_environment(),
            },
            provider: ProviderConfig::default(),
            state: StateConfig::default(),
            engine: EngineConfig::default(),
            schemas: Vec::new(),
            resources: Vec::new(),
        }
    }

    /// Adds a resource, builder style.
    #[must_use]
    pub fn with_resource(mut self, resource: ResourceConfig) -> Self {
        self.resources.push(resource);
        self
    }

    /// Adds a resource schema, builder style.
    #[must_use]
    pub fn with_schema(mut self, schema: ResourceSchema) -> Self {
        self.schemas.push(schema);
        self
    }

    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns the addresses of all declared resources, in declaration order.
    #[must_use]
    pub fn resource_addresses(&self) -> Vec<String> {
        self.resources.iter().map(ResourceConfig::address).collect()
    }
}

impl ResourceConfig {
    /// Creates a resource declaration.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds an attribute, builder style.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Returns the `kind.name` address of this resource.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}.{}", self.kind, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let engine = EngineConfig::default();
        assert_eq!(engine.parallelism, 4);
        assert_eq!(engine.retry.max_attempts, 5);
        assert!(engine.validate().is_ok());
    }

    #[test]
    fn test_engine_parallelism_out_of_range() {
        let engine = EngineConfig {
            parallelism: 0,
            retry: RetryConfig::default(),
        };
        assert!(engine.validate().is_err());
    }

    #[test]
    fn test_resource_address() {
        let resource = ResourceConfig::new("subnet", "public-a")
            .with_attribute("cidr_block", serde_json::json!("10.0.1.0/24"));
        assert_eq!(resource.address(), "subnet.public-a");
        assert_eq!(resource.attributes.len(), 1);
    }
}
