//! Durable checkpoint records.
//!
//! A checkpoint is an idempotent request/response record keyed by
//! `(runtime_id, seq)`. It exists so that a decision or AI call interrupted
//! by a crash is not re-executed on resume: if the checkpoint is already
//! `finished` when re-entered under the same key, the stored response is
//! replayed instead.
//!
//! The storage engine behind checkpoints is an external collaborator; the
//! [`CheckpointStore`] trait is its contract. Two reference implementations
//! ship here: an in-memory store for tests and single-process runs, and a
//! JSON-file store for durable resume.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{LoomError, Result};

/// A durable request/response record for one decision or AI call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Owning runtime instance
    pub runtime_id: String,
    /// Monotonic sequence number scoped to the runtime instance
    pub seq: u64,
    /// What kind of transaction this records (e.g. "endpoint", "shrink")
    pub kind: String,
    /// The request payload, if one was submitted
    pub request: Option<Value>,
    /// The response payload, present once finished
    pub response: Option<Value>,
    /// Set exactly once, by whichever path first obtains a response
    pub finished: bool,
}

impl Checkpoint {
    /// Create a fresh, unfinished checkpoint.
    pub fn new(runtime_id: &str, seq: u64, kind: &str) -> Self {
        Self {
            runtime_id: runtime_id.to_string(),
            seq,
            kind: kind.to_string(),
            request: None,
            response: None,
            finished: false,
        }
    }
}

/// Contract for the storage engine behind checkpoints.
///
/// `submit_request` is best-effort: callers log failures and continue.
/// `submit_response` marks the record finished and must be checked: losing
/// a response leaves the transaction unrecoverable.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Create (or re-open) the checkpoint under `(runtime_id, seq)`.
    ///
    /// If a record already exists under that key it is returned as-is,
    /// so a resumed run sees the prior state.
    async fn create(&self, runtime_id: &str, seq: u64, kind: &str) -> Result<Checkpoint>;

    /// Persist the request payload.
    async fn submit_request(&self, checkpoint: &Checkpoint, payload: Value) -> Result<()>;

    /// Persist the response payload and mark the record finished.
    ///
    /// Idempotent: if the record is already finished, the original response
    /// is kept and this call is a no-op.
    async fn submit_response(&self, checkpoint: &Checkpoint, payload: Value) -> Result<()>;

    /// Fetch the checkpoint under `(runtime_id, seq)`, if any.
    async fn lookup(&self, runtime_id: &str, seq: u64) -> Result<Option<Checkpoint>>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// Checkpoint store backed by a process-local map.
///
/// Suitable for tests and runs that do not need crash durability. Safe to
/// clone; clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    records: Arc<RwLock<HashMap<(String, u64), Checkpoint>>>,
}

impl MemoryCheckpointStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn create(&self, runtime_id: &str, seq: u64, kind: &str) -> Result<Checkpoint> {
        let mut records = self.records.write().await;
        let key = (runtime_id.to_string(), seq);
        let checkpoint = records
            .entry(key)
            .or_insert_with(|| Checkpoint::new(runtime_id, seq, kind));
        Ok(checkpoint.clone())
    }

    async fn submit_request(&self, checkpoint: &Checkpoint, payload: Value) -> Result<()> {
        let mut records = self.records.write().await;
        let key = (checkpoint.runtime_id.clone(), checkpoint.seq);
        let record = records
            .get_mut(&key)
            .ok_or_else(|| LoomError::Checkpoint(format!("unknown checkpoint {:?}", key)))?;
        record.request = Some(payload);
        Ok(())
    }

    async fn submit_response(&self, checkpoint: &Checkpoint, payload: Value) -> Result<()> {
        let mut records = self.records.write().await;
        let key = (checkpoint.runtime_id.clone(), checkpoint.seq);
        let record = records
            .get_mut(&key)
            .ok_or_else(|| LoomError::Checkpoint(format!("unknown checkpoint {:?}", key)))?;
        if record.finished {
            debug!(
                runtime_id = %record.runtime_id,
                seq = record.seq,
                "checkpoint already finished, keeping first response"
            );
            return Ok(());
        }
        record.response = Some(payload);
        record.finished = true;
        Ok(())
    }

    async fn lookup(&self, runtime_id: &str, seq: u64) -> Result<Option<Checkpoint>> {
        let records = self.records.read().await;
        Ok(records.get(&(runtime_id.to_string(), seq)).cloned())
    }
}

// ============================================================================
// File store
// ============================================================================

/// Checkpoint store persisting one JSON file per record.
///
/// File names encode the `(runtime_id, seq)` key with filesystem-hostile
/// characters percent-escaped, so arbitrary runtime ids round-trip.
#[derive(Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn file_path(&self, runtime_id: &str, seq: u64) -> PathBuf {
        self.dir
            .join(format!("{}-{}.json", sanitize_component(runtime_id), seq))
    }

    async fn read(&self, runtime_id: &str, seq: u64) -> Result<Option<Checkpoint>> {
        let path = self.file_path(runtime_id, seq);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.file_path(&checkpoint.runtime_id, checkpoint.seq);
        let content = serde_json::to_string_pretty(checkpoint)?;
        tokio::fs::write(&path, content).await?;
        Ok(())
    }
}

/// Percent-escape characters that are unsafe in file names.
fn sanitize_component(key: &str) -> String {
    let mut result = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '/' => result.push_str("%2F"),
            '\\' => result.push_str("%5C"),
            ':' => result.push_str("%3A"),
            '%' => result.push_str("%25"),
            c => result.push(c),
        }
    }
    result
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn create(&self, runtime_id: &str, seq: u64, kind: &str) -> Result<Checkpoint> {
        if let Some(existing) = self.read(runtime_id, seq).await? {
            return Ok(existing);
        }
        let checkpoint = Checkpoint::new(runtime_id, seq, kind);
        self.write(&checkpoint).await?;
        Ok(checkpoint)
    }

    async fn submit_request(&self, checkpoint: &Checkpoint, payload: Value) -> Result<()> {
        let mut record = self
            .read(&checkpoint.runtime_id, checkpoint.seq)
            .await?
            .ok_or_else(|| {
                LoomError::Checkpoint(format!(
                    "unknown checkpoint ({}, {})",
                    checkpoint.runtime_id, checkpoint.seq
                ))
            })?;
        record.request = Some(payload);
        self.write(&record).await
    }

    async fn submit_response(&self, checkpoint: &Checkpoint, payload: Value) -> Result<()> {
        let mut record = self
            .read(&checkpoint.runtime_id, checkpoint.seq)
            .await?
            .ok_or_else(|| {
                LoomError::Checkpoint(format!(
                    "unknown checkpoint ({}, {})",
                    checkpoint.runtime_id, checkpoint.seq
                ))
            })?;
        if record.finished {
            debug!(
                runtime_id = %record.runtime_id,
                seq = record.seq,
                "checkpoint already finished, keeping first response"
            );
            return Ok(());
        }
        record.response = Some(payload);
        record.finished = true;
        self.write(&record).await
    }

    async fn lookup(&self, runtime_id: &str, seq: u64) -> Result<Option<Checkpoint>> {
        self.read(runtime_id, seq).await
    }
}
