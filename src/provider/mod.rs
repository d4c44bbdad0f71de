//! Provider boundary.
//!
//! The engine never talks to an infrastructure API directly. Every remote
//! effect goes through a [`Provider`], which receives an explicit
//! [`ProviderContext`] with each call:
//! - [`HttpProvider`]: REST JSON provider over `reqwest`
//! - [`InMemoryProvider`]: in-process provider for local runs and tests
//! - [`RetryPolicy`]: exponential backoff for transient errors

mod context;
mod http;
mod memory;
mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ProviderError;

pub use context::{Credentials, ProviderContext};
pub use http::HttpProvider;
pub use memory::{InMemoryProvider, ProviderCall};
pub use retry::RetryPolicy;

/// Attribute map exchanged with providers.
pub type Attributes = BTreeMap<String, Value>;

/// Result of a create call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateResponse {
    /// Provider-assigned identifier.
    pub id: String,
    /// Attributes computed by the provider.
    #[serde(default, rename = "attributes")]
    pub computed: Attributes,
}

/// Kind of provider call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Create a remote object.
    Create,
    /// Update a remote object in place.
    Update,
    /// Delete a remote object.
    Delete,
    /// Read a remote object.
    Read,
}

/// Trait implemented by infrastructure providers.
///
/// Implementations must be safe to call concurrently; the executor issues up
/// to `parallelism` calls at once.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &'static str;

    /// Creates a remote object and returns its identifier and computed outputs.
    async fn create(
        &self,
        ctx: &ProviderContext,
        kind: &str,
        attributes: &Attributes,
    ) -> Result<CreateResponse, ProviderError>;

    /// Updates a remote object in place and returns its computed outputs.
    async fn update(
        &self,
        ctx: &ProviderContext,
        kind: &str,
        id: &str,
        attributes: &Attributes,
    ) -> Result<Attributes, ProviderError>;

    /// Deletes a remote object.
    async fn delete(&self, ctx: &ProviderContext, kind: &str, id: &str)
    -> Result<(), ProviderError>;

    /// Reads a remote object, or `None` if it no longer exists.
    async fn read(
        &self,
        ctx: &ProviderContext,
        kind: &str,
        id: &str,
    ) -> Result<Option<Attributes>, ProviderError>;
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Read => write!(f, "read"),
        }
    }
}
