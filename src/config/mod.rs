//! Configuration module for the Gantry provisioning engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `gantry.yaml`
//! - Attribute expressions and `${kind.name.attr}` references
//! - Validation of configuration values
//! - Computing configuration hashes for change detection

mod expr;
mod hash;
mod parser;
mod spec;
mod validator;

pub use expr::{Expr, Reference, Resolution, Segment};
pub use hash::ConfigHasher;
pub use parser::{
    ConfigParser, DEFAULT_CONFIG_FILES, PROVIDER_TOKEN_VAR, apply_overrides, find_config_file,
};
pub use spec::{
    EngineConfig, InfraConfig, ProjectConfig, ProviderConfig, ProviderType, ResourceConfig,
    RetryConfig, StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
