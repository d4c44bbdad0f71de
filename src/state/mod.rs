//! State management module for the Gantry provisioning engine.
//!
//! This module provides persistent state storage for tracking provisioned
//! resources: provider identifiers, applied and computed attributes,
//! dependencies, apply order and run history.

mod local;
mod lock;
mod s3;
mod store;
mod types;
mod writer;

pub use local::LocalStateStore;
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    HistoryEntry, MAX_HISTORY, RunOperation, STATE_VERSION, StateDocument, StateRecord,
};
pub use writer::{StateMutation, StateWriter};
