//! Configuration parser for loading and merging configuration files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, GantryError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::InfraConfig;

/// Environment variable holding the provider bearer token.
pub const PROVIDER_TOKEN_VAR: &str = "GANTRY_PROVIDER_TOKEN";

/// Configuration parser for loading infrastructure configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<InfraConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(GantryError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            GantryError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<InfraConfig> {
        debug!("Parsing YAML configuration");

        let config: InfraConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            GantryError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            project = %config.project.name,
            resources = config.resources.len(),
            "Successfully parsed configuration"
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `GANTRY_<SECTION>_<KEY>` (e.g., `GANTRY_PROJECT_NAME`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<InfraConfig> {
        let mut config = self.load_file(path)?;
        apply_overrides(&mut config, |key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                GantryError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the provider token from the environment, if set.
    #[must_use]
    pub fn provider_token() -> Option<String> {
        std::env::var(PROVIDER_TOKEN_VAR).ok().filter(|t| !t.is_empty())
    }
}

/// Applies `GANTRY_*` overrides using `lookup` to read variables.
///
/// # Errors
///
/// Returns an error if `GANTRY_PARALLELISM` is not a number.
pub fn apply_overrides<F>(config: &mut InfraConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(name) = lookup("GANTRY_PROJECT_NAME") {
        debug!("Overriding project.name from environment");
        config.project.name = name;
    }

    if let Some(env) = lookup("GANTRY_PROJECT_ENVIRONMENT") {
        debug!("Overriding project.environment from environment");
        config.project.environment = env;
    }

    // Provider overrides
    if let Some(endpoint) = lookup("GANTRY_PROVIDER_ENDPOINT") {
        debug!("Overriding provider.endpoint from environment");
        config.provider.endpoint = Some(endpoint);
    }

    if let Some(region) = lookup("GANTRY_PROVIDER_REGION") {
        debug!("Overriding provider.region from environment");
        config.provider.region = Some(region);
    }

    // State overrides
    if let Some(bucket) = lookup("GANTRY_STATE_BUCKET") {
        debug!("Overriding state.bucket from environment");
        config.state.bucket = Some(bucket);
    }

    if let Some(prefix) = lookup("GANTRY_STATE_PREFIX") {
        debug!("Overriding state.prefix from environment");
        config.state.prefix = Some(prefix);
    }

    if let Some(parallelism) = lookup("GANTRY_PARALLELISM") {
        debug!("Overriding engine.parallelism from environment");
        config.engine.parallelism = parallelism.trim().parse().map_err(|_| {
            GantryError::Config(ConfigError::validation(
                format!("GANTRY_PARALLELISM must be a positive integer, got '{parallelism}'"),
                "engine.parallelism",
            ))
        })?;
    }

    Ok(())
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["gantry.yaml", "gantry.yml", "infra.yaml", "infra.yml"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(GantryError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderType, StateBackend};
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
resources: []
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.provider.provider_type, ProviderType::Memory);
        assert_eq!(config.engine.parallelism, 4);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: edge-network
  environment: prod

provider:
  type: http
  endpoint: https://infra.example.com
  region: eu-west-1

state:
  backend: s3
  bucket: gantry-state
  prefix: edge-network/prod

engine:
  parallelism: 8
  retry:
    max_attempts: 3

schemas:
  - kind: firewall_rule
    attributes:
      port: { type: number, required: true, force_new: true }
      note: { type: string }

resources:
  - kind: vpc
    name: main
    attributes:
      cidr_block: 10.0.0.0/16
  - kind: subnet
    name: public-a
    attributes:
      vpc_id: "${vpc.main.id}"
      cidr_block: 10.0.1.0/24
"#;
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();
        assert_eq!(config.qualified_name(), "edge-network-prod");
        assert_eq!(config.provider.provider_type, ProviderType::Http);
        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.engine.retry.max_attempts, 3);
        assert_eq!(config.engine.retry.initial_backoff_ms, 500);
        assert_eq!(config.schemas.len(), 1);
        assert!(!config.schemas[0].attributes["port"].computed);
        assert_eq!(
            config.resource_addresses(),
            vec!["vpc.main".to_string(), "subnet.public-a".to_string()]
        );
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let err = ConfigParser::new().parse_yaml("project: [", None).unwrap_err();
        assert!(matches!(err, GantryError::Config(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = InfraConfig::new("base");
        let vars = HashMap::from([
            ("GANTRY_PROJECT_ENVIRONMENT", "staging"),
            ("GANTRY_PROVIDER_ENDPOINT", "http://localhost:9000"),
            ("GANTRY_PARALLELISM", "12"),
        ]);
        apply_overrides(&mut config, |k| vars.get(k).map(ToString::to_string)).unwrap();

        assert_eq!(config.project.name, "base");
        assert_eq!(config.project.environment, "staging");
        assert_eq!(config.provider.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.engine.parallelism, 12);
    }

    #[test]
    fn test_bad_parallelism_override() {
        let mut config = InfraConfig::new("base");
        let result = apply_overrides(&mut config, |k| {
            (k == "GANTRY_PARALLELISM").then(|| String::from("many"))
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("infra.yml"), "project: {name: x}\n").unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("infra.yml"));
    }
}
