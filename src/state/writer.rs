//! Serializing state writer.
//!
//! Exactly one task owns the [`StateDocument`] during a run. Workers send
//! mutations over a channel and wait for the acknowledgement, which is only
//! sent once the mutated document has been persisted. Readers take snapshots
//! from a `watch` channel and never block the writer.
//!
//! If a persist fails the in-memory document keeps its last persisted value
//! and the writer halts: every later mutation is refused with
//! [`StateError::Halted`], since the stored state no longer matches reality.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::store::StateStore;
use super::types::{HistoryEntry, StateDocument, StateRecord};
use crate::error::StateError;
use crate::graph::ResourceAddress;

/// Capacity of the mutation channel.
const CHANNEL_CAPACITY: usize = 64;

/// A change to the state document.
#[derive(Debug, Clone)]
pub enum StateMutation {
    /// Insert or replace a record.
    Upsert(StateRecord),
    /// Remove a record.
    Remove(ResourceAddress),
    /// Mark a record tainted.
    Taint(ResourceAddress),
    /// Record the outcome of a run.
    Finalize {
        /// Hash of the configuration the run applied.
        config_hash: String,
        /// New apply order.
        apply_order: Vec<ResourceAddress>,
        /// History entry for the run.
        entry: HistoryEntry,
    },
}

/// A mutation waiting for its acknowledgement.
struct Request {
    mutation: StateMutation,
    ack: oneshot::Sender<Result<u64, StateError>>,
}

/// Handle to the state writer task. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StateWriter {
    /// Mutation channel.
    tx: mpsc::Sender<Request>,
    /// Latest persisted document.
    snapshots: watch::Receiver<Arc<StateDocument>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request").field("mutation", &self.mutation).finish_non_exhaustive()
    }
}

impl StateMutation {
    /// Applies the mutation. Returns false if it changed nothing.
    fn apply(self, document: &mut StateDocument) -> bool {
        match self {
            Self::Upsert(record) => {
                document.upsert(record);
                true
            }
            Self::Remove(address) => document.remove(&address).is_some(),
            Self::Taint(address) => document.taint(&address),
            Self::Finalize {
                config_hash,
                apply_order,
                entry,
            } => {
                document.config_hash = config_hash;
                document.apply_order = apply_order;
                document.add_history(entry);
                document.last_updated = chrono::Utc::now();
                true
            }
        }
    }
}

impl StateWriter {
    /// Spawns the writer task owning `document`.
    ///
    /// The task ends once every handle is dropped and returns the last
    /// persisted document.
    #[must_use]
    pub fn spawn(
        store: Arc<dyn StateStore>,
        document: StateDocument,
    ) -> (Self, JoinHandle<StateDocument>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (snapshot_tx, snapshots) = watch::channel(Arc::new(document.clone()));
        let handle = tokio::spawn(run_writer(store, document, rx, snapshot_tx));
        (Self { tx, snapshots }, handle)
    }

    /// Sends a mutation and waits until it is persisted.
    ///
    /// Returns the serial of the persisted document.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Halted`] if this or an earlier persist failed.
    pub async fn send(&self, mutation: StateMutation) -> Result<u64, StateError> {
        let (ack, response) = oneshot::channel();
        self.tx
            .send(Request { mutation, ack })
            .await
            .map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())?
    }

    /// Inserts or replaces a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the write could not be persisted.
    pub async fn upsert(&self, record: StateRecord) -> Result<u64, StateError> {
        self.send(StateMutation::Upsert(record)).await
    }

    /// Removes a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the write could not be persisted.
    pub async fn remove(&self, address: ResourceAddress) -> Result<u64, StateError> {
        self.send(StateMutation::Remove(address)).await
    }

    /// Marks a record tainted.
    ///
    /// # Errors
    ///
    /// Returns an error if the write could not be persisted.
    pub async fn taint(&self, address: ResourceAddress) -> Result<u64, StateError> {
        self.send(StateMutation::Taint(address)).await
    }

    /// Returns the latest persisted document.
    #[must_use]
    pub fn snapshot(&self) -> Arc<StateDocument> {
        Arc::clone(&self.snapshots.borrow())
    }
}

fn stopped() -> StateError {
    StateError::Halted {
        message: String::from("state writer is no longer running"),
    }
}

async fn run_writer(
    store: Arc<dyn StateStore>,
    mut document: StateDocument,
    mut rx: mpsc::Receiver<Request>,
    snapshots: watch::Sender<Arc<StateDocument>>,
) -> StateDocument {
    let mut halted: Option<String> = None;

    while let Some(Request { mutation, ack }) = rx.recv().await {
        if let Some(reason) = &halted {
            let _ = ack.send(Err(StateError::Halted {
                message: reason.clone(),
            }));
            continue;
        }

        let mut next = document.clone();
        if !mutation.apply(&mut next) {
            let _ = ack.send(Ok(document.serial));
            continue;
        }
        next.serial += 1;

        match store.save(&next).await {
            Ok(()) => {
                debug!(serial = next.serial, "state persisted");
                document = next;
                snapshots.send_replace(Arc::new(document.clone()));
                let _ = ack.send(Ok(document.serial));
            }
            Err(e) => {
                error!(serial = next.serial, error = %e, "state persist failed, halting writes");
                let message = e.to_string();
                halted = Some(message.clone());
                let _ = ack.send(Err(StateError::Halted { message }));
            }
        }
    }

    document
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GantryError, Result};
    use crate::state::{LocalStateStore, LockInfo, RunOperation};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn addr(s: &str) -> ResourceAddress {
        s.parse().unwrap()
    }

    /// Accepts a fixed number of saves, then fails every one.
    struct FlakyStore {
        remaining: AtomicUsize,
    }

    #[async_trait]
    impl StateStore for FlakyStore {
        async fn load(&self) -> Result<Option<StateDocument>> {
            Ok(None)
        }

        async fn save(&self, _state: &StateDocument) -> Result<()> {
            let ok = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if ok {
                Ok(())
            } else {
                Err(GantryError::State(StateError::backend("disk full")))
            }
        }

        async fn delete(&self) -> Result<()> {
            Ok(())
        }

        async fn exists(&self) -> Result<bool> {
            Ok(false)
        }

        async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
            Ok(LockInfo::new(holder))
        }

        async fn release_lock(&self, _lock_id: &str) -> Result<()> {
            Ok(())
        }

        async fn hold_lock(&self, _lock: &LockInfo) -> Result<()> {
            Ok(())
        }

        async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
            Ok(None)
        }

        async fn is_locked(&self) -> Result<bool> {
            Ok(false)
        }

        fn backend_type(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_writes_are_persisted_before_ack() {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        let (writer, handle) = StateWriter::spawn(Arc::clone(&store), StateDocument::new("t", "dev"));

        let serial = writer
            .upsert(StateRecord::new(&addr("vpc.main"), "vpc-1"))
            .await
            .unwrap();
        assert_eq!(serial, 1);

        // The stored document already holds the record when the ack arrives
        let stored = store.load().await.unwrap().unwrap();
        assert_eq!(stored.serial, 1);
        assert!(stored.get(&addr("vpc.main")).is_some());
        assert_eq!(writer.snapshot().serial, 1);

        writer.taint(addr("vpc.main")).await.unwrap();
        writer.remove(addr("vpc.main")).await.unwrap();
        // No-op mutations do not bump the serial
        assert_eq!(writer.remove(addr("vpc.main")).await.unwrap(), 3);

        writer
            .send(StateMutation::Finalize {
                config_hash: String::from("abc"),
                apply_order: vec![],
                entry: HistoryEntry::new(RunOperation::Apply, "abc", vec![]),
            })
            .await
            .unwrap();

        drop(writer);
        let final_doc = handle.await.unwrap();
        assert_eq!(final_doc.serial, 4);
        assert_eq!(final_doc.config_hash, "abc");
        assert_eq!(final_doc.history.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_serialize() {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        let (writer, handle) = StateWriter::spawn(store, StateDocument::new("t", "dev"));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let writer = writer.clone();
            tasks.spawn(async move {
                writer
                    .upsert(StateRecord::new(&addr(&format!("subnet.s{i}")), format!("id-{i}")))
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        drop(writer);
        let doc = handle.await.unwrap();
        assert_eq!(doc.len(), 16);
        assert_eq!(doc.serial, 16);
    }

    #[tokio::test]
    async fn test_failed_persist_halts_writer() {
        let store: Arc<dyn StateStore> = Arc::new(FlakyStore {
            remaining: AtomicUsize::new(1),
        });
        let (writer, handle) = StateWriter::spawn(store, StateDocument::new("t", "dev"));

        writer
            .upsert(StateRecord::new(&addr("vpc.a"), "vpc-1"))
            .await
            .unwrap();

        let err = writer
            .upsert(StateRecord::new(&addr("vpc.b"), "vpc-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::Halted { .. }));

        // Even writes that would succeed are now refused
        let err = writer.taint(addr("vpc.a")).await.unwrap_err();
        assert!(matches!(err, StateError::Halted { ref message } if message.contains("disk full")));

        drop(writer);
        let doc = handle.await.unwrap();
        assert_eq!(doc.serial, 1);
        assert!(doc.get(&addr("vpc.b")).is_none());
        assert!(!doc.get(&addr("vpc.a")).unwrap().tainted);
    }
}
