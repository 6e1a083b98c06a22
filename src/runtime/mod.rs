//! Runtime context: the capability bundle behind one agent run.
//!
//! A [`RuntimeContext`] owns the identity, sequence source, AI capability,
//! checkpoint store, event guardian, and endpoint manager for one runtime
//! instance. It is an explicit object passed by reference, never a process
//! global, so concurrent runtime instances stay isolated, and its lifecycle
//! (and everything suspended inside it) ends with one cancellation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ai::{AiClient, AiTransaction};
use crate::checkpoint::CheckpointStore;
use crate::config::LoomConfig;
use crate::endpoint::policy::PolicyContext;
use crate::endpoint::EndpointManager;
use crate::error::Result;
use crate::guardian::{Emitter, Guardian};
use crate::timeline::{CompactionContext, Timeline};

/// Identity and capabilities for one runtime instance.
pub struct RuntimeContext {
    runtime_id: String,
    config: LoomConfig,
    seq: Arc<AtomicU64>,
    ai: Arc<dyn AiClient>,
    store: Arc<dyn CheckpointStore>,
    guardian: Arc<Guardian>,
    endpoints: Arc<EndpointManager>,
    cancel: CancellationToken,
}

impl RuntimeContext {
    /// Assemble a runtime instance.
    ///
    /// Wires the guardian's emitter into the endpoint manager so releases
    /// surface on the output event stream. The guardian's dispatch worker is
    /// not started here; call [`RuntimeContext::start_guardian`].
    pub fn new(
        runtime_id: &str,
        ai: Arc<dyn AiClient>,
        store: Arc<dyn CheckpointStore>,
        config: LoomConfig,
    ) -> Result<Arc<Self>> {
        let cancel = CancellationToken::new();
        let seq = Arc::new(AtomicU64::new(0));
        let guardian = Arc::new(Guardian::new(Arc::clone(&ai), cancel.clone()));
        let emitter = guardian.emitter()?;
        let endpoints = EndpointManager::with_emitter(
            runtime_id,
            Arc::clone(&store),
            cancel.clone(),
            emitter,
            Arc::clone(&seq),
        );
        Ok(Arc::new(Self {
            runtime_id: runtime_id.to_string(),
            config,
            seq,
            ai,
            store,
            guardian,
            endpoints,
            cancel,
        }))
    }

    /// This instance's id.
    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    /// The active configuration.
    pub fn config(&self) -> &LoomConfig {
        &self.config
    }

    /// The ambient cancellation token. Cancelling it releases every live
    /// endpoint with an empty decision, stops the guardian's dispatch loop,
    /// and unblocks field-latch and signal waits valuelessly.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Tear the instance down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// The event guardian.
    pub fn guardian(&self) -> &Arc<Guardian> {
        &self.guardian
    }

    /// Start the guardian's dispatch worker.
    pub fn start_guardian(&self) -> Result<JoinHandle<()>> {
        self.guardian.start()
    }

    /// An emitter into the output event stream.
    pub fn emitter(&self) -> Result<Emitter> {
        self.guardian.emitter()
    }

    /// The endpoint manager.
    pub fn endpoints(&self) -> &Arc<EndpointManager> {
        &self.endpoints
    }

    /// Next sequence number. Shared by endpoints and AI transactions so
    /// `(runtime_id, seq)` keys never collide within a run.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// A checkpointed AI transaction wrapper for this instance.
    pub fn transaction(&self) -> AiTransaction {
        AiTransaction::new(
            &self.runtime_id,
            Arc::clone(&self.ai),
            Arc::clone(&self.store),
            self.config.ai.clone(),
        )
    }

    /// Compaction capabilities for a timeline owned by this instance.
    pub fn compaction_context(&self) -> CompactionContext {
        CompactionContext {
            transaction: self.transaction(),
            seq_source: Arc::clone(&self.seq),
            emitter: self.guardian.emitter().ok(),
        }
    }

    /// Review capabilities for auto-decision policies.
    pub fn policy_context(&self) -> PolicyContext {
        PolicyContext {
            transaction: self.transaction(),
            seq_source: Arc::clone(&self.seq),
            review: self.config.review.clone(),
        }
    }

    /// A fresh timeline bound to this instance's budgets.
    pub fn new_timeline(&self) -> Timeline {
        Timeline::new(&self.runtime_id, self.config.timeline.clone())
    }
}
