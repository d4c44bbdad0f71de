// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Gantry
//!
//! A declarative, idempotent infrastructure provisioning engine.
//!
//! ## Overview
//!
//! Gantry turns a YAML description of resources into remote objects:
//!
//! - Resources reference each other's outputs with `${kind.name.attr}`
//! - References form a dependency graph, validated before anything runs
//! - Plans compare the configuration with recorded state
//! - Independent resources are applied concurrently, dependents wait
//! - Every change is persisted to state before dependents start
//!
//! ## Architecture
//!
//! 1. **Schema registry**: attribute types, computed outputs, immutable attributes
//! 2. **Dependency graph**: a DAG over resource addresses
//! 3. **Diff engine**: create, update, replace, delete or no-op per resource
//! 4. **Executor**: dataflow scheduling with bounded parallelism
//! 5. **State store**: local or S3 backend behind a single writer
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing, validation and reference expressions
//! - [`schema`]: Resource schema registry
//! - [`graph`]: Resource addresses and the dependency graph
//! - [`state`]: State storage backends (local, S3) and the state writer
//! - [`provider`]: Provider boundary, HTTP and in-memory providers
//! - [`planner`]: Diff computation, plans, output resolution and execution
//! - [`engine`]: Plan, apply, destroy and drift under the state lock
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: edge-network
//!   environment: prod
//!
//! resources:
//!   - kind: vpc
//!     name: main
//!     attributes:
//!       cidr_block: 10.0.0.0/16
//!   - kind: subnet
//!     name: public
//!     attributes:
//!       vpc_id: ${vpc.main.id}
//!       cidr_block: 10.0.1.0/24
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod schema;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, InfraConfig};
pub use engine::{DriftReport, Engine, RunSummary};
pub use error::{GantryError, Result};
pub use graph::{DependencyGraph, ResourceAddress};
pub use planner::{DiffEngine, Plan, PlanExecutor};
pub use provider::{HttpProvider, InMemoryProvider, Provider, ProviderContext};
pub use schema::SchemaRegistry;
pub use state::{LocalStateStore, S3StateStore, StateDocument, StateStore};
