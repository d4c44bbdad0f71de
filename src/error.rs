//! Error types for the Gantry provisioning engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration and graph construction, state management, provider calls,
//! planning, and execution.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Gantry provisioning engine.
#[derive(Debug, Error)]
pub enum GantryError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider API errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Execution errors.
    #[error("Execution error: {0}")]
    Execute(#[from] ExecuteError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
///
/// Every variant is fatal and raised before any provider call is made.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Duplicate resource definition.
    #[error("Duplicate resource address: {address}")]
    DuplicateResource {
        /// The duplicated address.
        address: String,
    },

    /// Resource kind has no registered schema.
    #[error("Unknown resource kind '{kind}' for {address}")]
    UnknownKind {
        /// The unknown kind.
        kind: String,
        /// Address of the resource declaring it.
        address: String,
    },

    /// A resource violates its kind's schema.
    #[error("Schema violation in {address}.{attribute}: {message}")]
    Schema {
        /// Address of the offending resource.
        address: String,
        /// Attribute that violates the schema.
        attribute: String,
        /// Description of the violation.
        message: String,
    },

    /// A reference expression could not be parsed.
    #[error("Invalid reference expression '{expression}': {message}")]
    InvalidReference {
        /// The raw expression.
        expression: String,
        /// What is wrong with it.
        message: String,
    },

    /// A reference names a resource or attribute that does not exist.
    #[error("Unknown reference '{reference}' in {address}.{attribute}")]
    UnknownReference {
        /// Resource holding the reference.
        address: String,
        /// Attribute holding the reference.
        attribute: String,
        /// The reference that could not be resolved.
        reference: String,
    },

    /// The reference graph contains a cycle.
    #[error("Dependency cycle detected: {cycle}")]
    Cycle {
        /// The cycle, rendered as `a -> b -> a`.
        cycle: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State file not found.
    #[error("State file not found: {path}")]
    NotFound {
        /// Path to the missing state file.
        path: PathBuf,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Local filesystem backend error.
    #[error("Local state backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: supported up to {expected}, found {found}")]
    VersionMismatch {
        /// Highest supported state version.
        expected: u32,
        /// Found state version.
        found: u32,
    },

    /// The state writer stopped after a failed write and refuses further mutations.
    #[error("State writes halted after a failed persist; reconcile the state manually: {message}")]
    Halted {
        /// The failure that halted the writer.
        message: String,
    },
}

/// Provider API errors.
///
/// Variants are classified as transient (retried per policy) or permanent
/// (fail the resource immediately), see [`ProviderError::is_transient`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Rate limited by the provider.
    #[error("Provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Network failure talking to the provider.
    #[error("Network error communicating with provider: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// The provider is temporarily unavailable (5xx).
    #[error("Provider unavailable: {status} - {message}")]
    Unavailable {
        /// HTTP status code.
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// The call timed out.
    #[error("Provider call timed out: {operation}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
    },

    /// The provider rejected the request payload.
    #[error("Provider rejected {kind}: {message}")]
    Validation {
        /// Resource kind.
        kind: String,
        /// Rejection message.
        message: String,
    },

    /// Authentication failed.
    #[error("Provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// The remote object does not exist.
    #[error("Remote object not found: {kind} {id}")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Provider identifier.
        id: String,
    },

    /// API request failed with a non-retryable status.
    #[error("Provider API request failed: {status} - {message}")]
    ApiRequestFailed {
        /// HTTP status code.
        status: u16,
        /// Error message from API.
        message: String,
    },

    /// Invalid response from API.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A plan entry depends on an address that is not in the plan.
    #[error("Plan entry {address} depends on {dependency}, which is not part of the plan")]
    MissingDependency {
        /// Dependent entry.
        address: String,
        /// Missing dependency.
        dependency: String,
    },

    /// Plan entries form a cycle.
    #[error("Plan ordering failed: {message}")]
    Ordering {
        /// Description of the ordering issue.
        message: String,
    },
}

/// Execution errors.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// A resource action failed.
    #[error("Failed to {action} {address}: {reason}")]
    ActionFailed {
        /// Action that failed.
        action: String,
        /// Resource address.
        address: String,
        /// Reason for failure.
        reason: String,
    },

    /// A reference was still unresolved when its entry was dispatched.
    #[error("Unresolved references in {address}: {references}")]
    Unresolved {
        /// Resource address.
        address: String,
        /// Comma-separated unresolved references.
        references: String,
    },

    /// A worker task panicked or was aborted.
    #[error("Worker task failed: {message}")]
    TaskFailed {
        /// Description of the failure.
        message: String,
    },

    /// One or more resources failed during the run.
    #[error("{failed} resource(s) failed, {skipped} skipped")]
    RunFailed {
        /// Number of failed resources.
        failed: usize,
        /// Number of skipped resources.
        skipped: usize,
    },
}

/// Result type alias for Gantry operations.
pub type Result<T> = std::result::Result<T, GantryError>;

/// Process exit codes reported by the CLI.
pub mod exit_code {
    /// Run completed without failures.
    pub const SUCCESS: u8 = 0;
    /// At least one resource failed or was skipped.
    pub const RESOURCE_FAILED: u8 = 1;
    /// Configuration error, nothing was executed.
    pub const CONFIG_ERROR: u8 = 2;
    /// State corruption, writes were halted.
    pub const STATE_CORRUPTION: u8 = 3;
    /// Any other error.
    pub const OTHER: u8 = 4;
}

impl GantryError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_transient(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns true if this error means the state can no longer be trusted.
    #[must_use]
    pub const fn is_state_corruption(&self) -> bool {
        matches!(
            self,
            Self::State(
                StateError::Corrupted { .. }
                    | StateError::Halted { .. }
                    | StateError::VersionMismatch { .. }
            )
        )
    }

    /// Returns the process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        if self.is_state_corruption() {
            return exit_code::STATE_CORRUPTION;
        }
        match self {
            Self::Config(_) => exit_code::CONFIG_ERROR,
            Self::Execute(ExecuteError::RunFailed { .. }) => exit_code::RESOURCE_FAILED,
            _ => exit_code::OTHER,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a schema violation error.
    #[must_use]
    pub fn schema(
        address: impl Into<String>,
        attribute: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Schema {
            address: address.into(),
            attribute: attribute.into(),
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates an API request error, classifying the status code.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::AuthenticationFailed { message },
            500..=599 => Self::Unavailable { status, message },
            _ => Self::ApiRequestFailed { status, message },
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Returns true if the error is transient and the call may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::NetworkError { .. }
                | Self::Unavailable { .. }
                | Self::Timeout { .. }
        )
    }

    /// Returns the delay the provider asked for, if any.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}
