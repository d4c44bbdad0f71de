//! Explicit per-call provider context.

use std::collections::BTreeMap;
use std::fmt;

use crate::config::InfraConfig;
use crate::graph::ResourceAddress;

/// Provider credentials. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Bearer token.
    token: String,
}

/// Everything a provider call may depend on besides its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderContext {
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Target region.
    pub region: Option<String>,
    /// Provider endpoint.
    pub endpoint: Option<String>,
    /// Resource the call is made for, if any.
    pub resource: Option<ResourceAddress>,
    /// Credentials.
    credentials: Option<Credentials>,
}

impl Credentials {
    /// Wraps a bearer token.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Returns the token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"[redacted]")
            .finish()
    }
}

impl ProviderContext {
    /// Creates a context for a project and environment.
    #[must_use]
    pub fn new(project: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            environment: environment.into(),
            region: None,
            endpoint: None,
            resource: None,
            credentials: None,
        }
    }

    /// Creates a context from the configuration and an optional token.
    #[must_use]
    pub fn from_config(config: &InfraConfig, token: Option<String>) -> Self {
        Self {
            region: config.provider.region.clone(),
            endpoint: config.provider.endpoint.clone(),
            credentials: token.map(Credentials::bearer),
            ..Self::new(&config.project.name, &config.project.environment)
        }
    }

    /// Sets the region, builder style.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Sets the credentials, builder style.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Returns a copy scoped to one resource.
    #[must_use]
    pub fn for_resource(&self, address: &ResourceAddress) -> Self {
        Self {
            resource: Some(address.clone()),
            ..self.clone()
        }
    }

    /// Returns the credentials, if any.
    #[must_use]
    pub const fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Labels every provider should attach to the objects it creates.
    #[must_use]
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::from([
            (String::from("gantry/project"), self.project.clone()),
            (String::from("gantry/environment"), self.environment.clone()),
        ]);
        if let Some(resource) = &self.resource {
            labels.insert(String::from("gantry/address"), resource.to_string());
        }
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_token() {
        let ctx = ProviderContext::new("edge", "prod").with_credentials(Credentials::bearer("s3cr3t"));
        let rendered = format!("{ctx:?}");
        assert!(!rendered.contains("s3cr3t"));
        assert!(rendered.contains("[redacted]"));
        assert_eq!(ctx.credentials().map(Credentials::token), Some("s3cr3t"));
    }

    #[test]
    fn test_resource_scope_and_labels() {
        let ctx = ProviderContext::new("edge", "prod").with_region("eu-west-1");
        let scoped = ctx.for_resource(&ResourceAddress::new("vpc", "main"));

        assert!(ctx.resource.is_none());
        assert_eq!(scoped.region.as_deref(), Some("eu-west-1"));
        assert_eq!(scoped.labels()["gantry/address"], "vpc.main");
        assert_eq!(ctx.labels().len(), 2);
    }

    #[test]
    fn test_from_config() {
        let mut config = InfraConfig::new("edge");
        config.provider.endpoint = Some(String::from("http://localhost:8080"));
        let ctx = ProviderContext::from_config(&config, Some(String::from("t")));
        assert_eq!(ctx.environment, "dev");
        assert_eq!(ctx.endpoint.as_deref(), Some("http://localhost:8080"));
        assert!(ctx.credentials().is_some());
    }
}
