//! State locking for concurrent access protection.
//!
//! This module provides the lock record that keeps two runs from mutating the
//! same state at once. Locks expire so a crashed run cannot wedge the state,
//! except a lock left halted by a failed state write: that one stays until it
//! is force-released.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GantryError, Result, StateError};

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300; // 5 minutes

/// Information about a state lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
    /// Set when state writes failed mid-run; a halted lock never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted: Option<String>,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
            halted: None,
        }
    }

    /// Marks the lock as left behind by a run whose state writes failed.
    #[must_use]
    pub fn halt(mut self, reason: impl Into<String>) -> Self {
        self.halted = Some(reason.into());
        self
    }

    /// Creates a lock for `holder`, generating a process identifier when it is empty.
    #[must_use]
    pub fn for_holder(holder: &str) -> Self {
        if holder.is_empty() {
            Self::new(&generate_holder_id())
        } else {
            Self::new(holder)
        }
    }

    /// Parses a persisted lock record.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Corrupted` if the record is not a lock.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| {
            GantryError::State(StateError::Corrupted {
                message: format!("Failed to parse lock: {e}"),
            })
        })
    }

    /// Serializes the lock record.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            GantryError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })
    }

    /// Returns the error another acquirer gets while this lock is live.
    #[must_use]
    pub fn conflict(&self) -> Option<GantryError> {
        if let Some(reason) = &self.halted {
            return Some(GantryError::State(StateError::Halted {
                message: format!(
                    "{reason} (lock {} held by {}; force-unlock once reconciled)",
                    self.lock_id, self.holder
                ),
            }));
        }
        (!self.is_expired()).then(|| {
            GantryError::State(StateError::LockedByOther {
                holder: self.holder.clone(),
                since: self.acquired_at.to_rfc3339(),
            })
        })
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.halted.is_none() && Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_creation() {
        let lock = LockInfo::new("test-holder");
        assert_eq!(lock.holder, "test-holder");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > 0);
    }

    #[test]
    fn test_expired_lock() {
        let mut lock = LockInfo::new("test-holder");
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(lock.is_expired());
        assert_eq!(lock.remaining_secs(), 0);
    }

    #[test]
    fn test_conflict_only_while_live() {
        let mut lock = LockInfo::for_holder("ci");
        assert!(matches!(
            lock.conflict(),
            Some(GantryError::State(StateError::LockedByOther { ref holder, .. })) if holder == "ci"
        ));

        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(lock.conflict().is_none());
    }

    #[test]
    fn test_halted_lock_never_expires() {
        let mut lock = LockInfo::new("ci").halt("disk full");
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(!lock.is_expired());

        let err = lock.conflict().unwrap();
        assert!(err.is_state_corruption());
        assert!(err.to_string().contains("disk full"));

        let parsed = LockInfo::from_json(&lock.to_json().unwrap()).unwrap();
        assert_eq!(parsed.halted.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_empty_holder_is_generated() {
        let lock = LockInfo::for_holder("");
        assert!(lock.holder.contains(&std::process::id().to_string()));

        let parsed = LockInfo::from_json(&lock.to_json().unwrap()).unwrap();
        assert_eq!(parsed, lock);
        assert!(LockInfo::from_json("not a lock").unwrap_err().is_state_corruption());
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        // IDs should be unique
        assert_ne!(id1, id2);

        // IDs should contain the process ID
        let pid = std::process::id().to_string();
        assert!(id1.contains(&pid));
    }
}
