//! Embedded record store: durable key/value with per-type buckets and a change bus.
//!
//! This crate is an external collaborator of the object lifecycle core in
//! `reflecta-core`: the core only ever talks to the [`RecordStore`] trait, never
//! to [`MemoryStore`] directly. Records are opaque `serde_json::Value` blobs to
//! the store; the core is responsible for everything type-shaped.

mod memory;

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

pub use memory::MemoryStore;

/// Error surface for store operations. Deliberately narrow: the store doesn't
/// know about HTTP statuses or capability checks, just persistence failures.
#[derive(Debug)]
pub enum StoreError {
    NotFound { bucket: String, id: String },
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound { bucket, id } => write!(f, "{bucket}/{id}: not found"),
            StoreError::Backend(msg) => write!(f, "store backend error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// A live feed of a single `(bucket, id)`. The first delivered value (if any)
/// is the object's current state at subscribe time; subsequent values follow
/// each write. The stream ends (no further `recv()`) when the object is
/// deleted, mirroring the source store's channel-close-on-delete contract.
pub struct ReadStreamHandle {
    rx: tokio::sync::mpsc::Receiver<Value>,
    _guard: tokio::task::JoinHandle<()>,
}

impl ReadStreamHandle {
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn close(self) {
        self._guard.abort();
    }
}

/// A live feed of full snapshots of a bucket. Only the latest snapshot is ever
/// retained; slow consumers see the most recent state, never a backlog.
pub struct ListStreamHandle {
    rx: tokio::sync::watch::Receiver<Vec<Value>>,
    primed: bool,
}

impl ListStreamHandle {
    /// Waits for a snapshot distinct from the last one observed by this handle,
    /// returning it. The very first call returns the snapshot current at
    /// subscribe time without waiting.
    pub async fn recv(&mut self) -> Option<Vec<Value>> {
        if !self.primed {
            self.primed = true;
            return Some(self.rx.borrow_and_update().clone());
        }
        if self.rx.changed().await.is_err() {
            return None;
        }
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn close(self) {}
}

#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    async fn read(&self, bucket: &str, id: &str) -> Result<Option<Value>, StoreError>;
    async fn write(&self, bucket: &str, id: &str, value: Value) -> Result<(), StoreError>;
    async fn delete(&self, bucket: &str, id: &str) -> Result<(), StoreError>;
    async fn list(&self, bucket: &str) -> Result<Vec<Value>, StoreError>;
    async fn read_stream(&self, bucket: &str, id: &str) -> Result<ReadStreamHandle, StoreError>;
    async fn list_stream(&self, bucket: &str) -> Result<ListStreamHandle, StoreError>;
}
