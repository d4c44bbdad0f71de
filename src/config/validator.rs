//! Configuration validation for infrastructure specs.
//!
//! This module checks the structural rules that serde cannot express: naming,
//! backend requirements, engine ranges and duplicate addresses. Schema and
//! reference checks happen later, when the dependency graph is built.

use crate::error::{ConfigError, GantryError, Result};
use std::collections::HashSet;
use tracing::debug;
use validator::Validate;

use super::spec::{
    EngineConfig, InfraConfig, ProjectConfig, ProviderConfig, ProviderType, ResourceConfig,
    StateBackend, StateConfig,
};

/// Validator for infrastructure configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates an infrastructure configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any rule fails.
    pub fn validate(&self, config: &InfraConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_provider(&config.provider, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_engine(&config.engine, &mut result);
        Self::validate_resources(&config.resources, &mut result);
        Self::validate_schemas(config, &mut result);

        if result.errors.is_empty() {
            debug!(warnings = result.warnings.len(), "Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(GantryError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    /// Validates provider configuration.
    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        match (&provider.provider_type, provider.endpoint.as_deref()) {
            (ProviderType::Http, None | Some("")) => {
                result.error(
                    "provider.endpoint",
                    "An endpoint is required when using the http provider",
                );
            }
            (ProviderType::Http, Some(endpoint))
                if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") =>
            {
                result.error(
                    "provider.endpoint",
                    format!("Endpoint '{endpoint}' must start with http:// or https://"),
                );
            }
            (ProviderType::Memory, Some(_)) => {
                result
                    .warnings
                    .push(String::from("provider.endpoint is ignored by the memory provider"));
            }
            _ => {}
        }

        if provider.timeout_secs == Some(0) {
            result.error("provider.timeout_secs", "Timeout must be at least 1 second");
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    /// Validates engine tuning.
    fn validate_engine(engine: &EngineConfig, result: &mut ValidationResult) {
        if let Err(e) = engine.validate() {
            result.error("engine", e.to_string());
        }

        if engine.retry.initial_backoff_ms > engine.retry.max_backoff_ms {
            result.error(
                "engine.retry.initial_backoff_ms",
                "Initial backoff cannot exceed max backoff",
            );
        }
    }

    /// Validates resource declarations.
    fn validate_resources(resources: &[ResourceConfig], result: &mut ValidationResult) {
        if resources.is_empty() {
            result.warnings.push(String::from("No resources defined in configuration"));
            return;
        }

        let mut seen = HashSet::new();
        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !is_valid_identifier(&resource.kind) {
                result.error(
                    format!("{prefix}.kind"),
                    format!("Resource kind '{}' is invalid", resource.kind),
                );
            }

            if !is_valid_identifier(&resource.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Resource name '{}' is invalid. Must start with a letter and contain only letters, digits, '-' or '_'.",
                        resource.name
                    ),
                );
            }

            let address = resource.address();
            if !seen.insert(address.clone()) {
                result.error(
                    format!("{prefix}.name"),
                    format!("Duplicate resource address: {address}"),
                );
            }
        }
    }

    /// Validates schema overrides.
    fn validate_schemas(config: &InfraConfig, result: &mut ValidationResult) {
        let mut seen = HashSet::new();
        for (i, schema) in config.schemas.iter().enumerate() {
            if !is_valid_identifier(&schema.kind) {
                result.error(
                    format!("schemas[{i}].kind"),
                    format!("Schema kind '{}' is invalid", schema.kind),
                );
            }
            if !seen.insert(schema.kind.as_str()) {
                result.warnings.push(format!(
                    "schemas[{i}]: kind '{}' is declared more than once, the last one wins",
                    schema.kind
                ));
            }
            for (name, attribute) in &schema.attributes {
                if attribute.computed && attribute.required {
                    result.error(
                        format!("schemas[{i}].attributes.{name}"),
                        "An attribute cannot be both computed and required",
                    );
                }
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    // First character must be a letter
    if !chars.next().is_some_and(|c| c.is_ascii_lowercase()) {
        return false;
    }

    // Rest must be lowercase alphanumeric or hyphen
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Resource kinds and names end up in `kind.name.attr` references, so they
/// cannot contain dots or placeholder syntax.
fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("edge-network"));
        assert!(is_valid_name("net-123"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Edge")); // uppercase
        assert!(!is_valid_name("1-net")); // starts with number
        assert!(!is_valid_name("net_a")); // underscore
        assert!(!is_valid_name("net-")); // ends with hyphen
        assert!(!is_valid_name("net--a")); // consecutive hyphens
    }

    #[test]
    fn test_identifiers() {
        assert!(is_valid_identifier("load_balancer"));
        assert!(is_valid_identifier("public-a"));
        assert!(!is_valid_identifier("a.b"));
        assert!(!is_valid_identifier("${x}"));
        assert!(!is_valid_identifier("_lead"));
    }

    #[test]
    fn test_valid_config_passes_with_warning() {
        let config = InfraConfig::new("edge");
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 1);
    }

    #[test]
    fn test_http_provider_needs_endpoint() {
        let mut config = InfraConfig::new("edge");
        config.provider.provider_type = ProviderType::Http;
        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(matches!(
            err,
            GantryError::Config(ConfigError::ValidationError { field: Some(f), .. }) if f == "provider.endpoint"
        ));
    }

    #[test]
    fn test_s3_backend_needs_bucket() {
        let mut config = InfraConfig::new("edge");
        config.state.backend = StateBackend::S3;
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_duplicate_resources_rejected() {
        let config = InfraConfig::new("edge")
            .with_resource(ResourceConfig::new("vpc", "main").with_attribute("cidr_block", json!("10.0.0.0/16")))
            .with_resource(ResourceConfig::new("vpc", "main").with_attribute("cidr_block", json!("10.1.0.0/16")));
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_engine_ranges_checked() {
        let mut config = InfraConfig::new("edge");
        config.engine.parallelism = 500;
        assert!(ConfigValidator::new().validate(&config).is_err());

        let mut config = InfraConfig::new("edge");
        config.engine.retry.initial_backoff_ms = 60_000;
        assert!(ConfigValidator::new().validate(&config).is_err());
    }
}
