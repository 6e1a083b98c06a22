//! Pending-decision endpoints.
//!
//! An [`Endpoint`] is one suspended decision: a worker parks on its
//! rendezvous signal until a human, a policy, or context teardown releases it
//! with a decision payload. The [`EndpointManager`] owns all live endpoints
//! for the run, assigns each a monotonic sequence number, and binds each to a
//! durable checkpoint so that a decision made before a crash is replayed,
//! not re-asked, on resume.
//!
//! State machine per endpoint: `created → waiting → released`, where release
//! comes from exactly one of: an external [`EndpointManager::feed`], the
//! owning context's cancellation (the manager sweeps every live endpoint
//! with an empty decision), or an auto-decision policy (see [`policy`]).

pub mod policy;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::decoder::{JsonMap, Params};
use crate::error::{LoomError, Result};
use crate::guardian::{Emitter, OutputEvent};
use crate::signal::Rendezvous;

/// Checkpoint kind tag for endpoint decisions.
const CHECKPOINT_KIND: &str = "endpoint";

/// A single pending decision.
///
/// Endpoints hold only the owning runtime's id, never a reference back to
/// the manager, so manager and endpoint lifetimes stay untangled.
pub struct Endpoint {
    id: String,
    seq: u64,
    runtime_id: String,
    signal: Rendezvous,
    active_params: StdRwLock<Params>,
    review_materials: Params,
    checkpoint: Option<Checkpoint>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Endpoint {
    /// Unique endpoint id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sequence number within the owning runtime instance.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Owning runtime instance id.
    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    /// The read-only snapshot shown to the reviewer.
    pub fn review_materials(&self) -> &Params {
        &self.review_materials
    }

    /// The bound checkpoint, if storage accepted one.
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    /// Whether the endpoint has been released.
    pub fn is_released(&self) -> bool {
        self.signal.is_open()
    }

    /// Current decision payload without waiting.
    pub fn current_params(&self) -> Params {
        self.active_params
            .read()
            .expect("endpoint params lock poisoned")
            .clone()
    }

    fn set_params(&self, params: Params) {
        let mut slot = self
            .active_params
            .write()
            .expect("endpoint params lock poisoned");
        *slot = params;
    }

    /// Block until released.
    pub async fn wait(&self) {
        self.signal.wait().await;
    }

    /// Block until released or `cancel` fires. Returns `false` on cancel.
    pub async fn wait_cancellable(&self, cancel: &CancellationToken) -> bool {
        self.signal.wait_cancellable(cancel).await
    }

    /// Block until released, giving up after `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        self.signal.wait_timeout(timeout).await
    }

    /// Wait for the decision and return its payload.
    ///
    /// Bound to the owning context: if the run is cancelled before any feed,
    /// this returns the empty decision rather than hanging or panicking.
    pub async fn get_params(&self) -> Params {
        self.signal.wait_cancellable(&self.cancel).await;
        self.current_params()
    }
}

/// Owner of all live endpoints for one runtime instance.
///
/// The live-endpoint set lives behind a single reader/writer lock held only
/// for map bookkeeping, never across a wait or an AI call. Endpoints are
/// removed only by process/context teardown.
pub struct EndpointManager {
    runtime_id: String,
    endpoints: Arc<RwLock<HashMap<String, Arc<Endpoint>>>>,
    /// Shared with the owning runtime's other checkpointed transactions so
    /// `(runtime_id, seq)` keys never collide within a run
    seq: Arc<AtomicU64>,
    store: Arc<dyn CheckpointStore>,
    emitter: Option<Emitter>,
    cancel: CancellationToken,
}

impl EndpointManager {
    /// Create a standalone manager with its own sequence counter, and start
    /// its cancellation sweeper.
    ///
    /// When `cancel` fires, every still-live endpoint is released with an
    /// empty decision so no worker stays parked across teardown.
    pub fn new(
        runtime_id: &str,
        store: Arc<dyn CheckpointStore>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Self::build(runtime_id, store, cancel, None, Arc::new(AtomicU64::new(0)))
    }

    /// Like [`EndpointManager::new`], with release events published through
    /// `emitter` and sequence numbers drawn from the runtime-shared
    /// `seq_source`.
    pub fn with_emitter(
        runtime_id: &str,
        store: Arc<dyn CheckpointStore>,
        cancel: CancellationToken,
        emitter: Emitter,
        seq_source: Arc<AtomicU64>,
    ) -> Arc<Self> {
        Self::build(runtime_id, store, cancel, Some(emitter), seq_source)
    }

    fn build(
        runtime_id: &str,
        store: Arc<dyn CheckpointStore>,
        cancel: CancellationToken,
        emitter: Option<Emitter>,
        seq: Arc<AtomicU64>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            runtime_id: runtime_id.to_string(),
            endpoints: Arc::new(RwLock::new(HashMap::new())),
            seq,
            store,
            emitter,
            cancel,
        });
        Self::spawn_sweeper(&manager);
        manager
    }

    fn spawn_sweeper(manager: &Arc<Self>) {
        let sweeper = Arc::clone(manager);
        tokio::spawn(async move {
            sweeper.cancel.cancelled().await;
            sweeper.release_all_empty().await;
        });
    }

    /// The owning runtime instance id.
    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    /// Number of endpoints currently held (released ones included).
    pub async fn len(&self) -> usize {
        self.endpoints.read().await.len()
    }

    /// Whether the manager holds no endpoints.
    pub async fn is_empty(&self) -> bool {
        self.endpoints.read().await.is_empty()
    }

    /// Fetch an endpoint by id.
    pub async fn get(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.read().await.get(id).cloned()
    }

    /// Create the next endpoint.
    ///
    /// Consults checkpoint storage first: a finished decision recorded under
    /// this `(runtime_id, seq)`, e.g. from a run that crashed after the
    /// reviewer answered, is replayed, and the endpoint comes back already
    /// released with the stored payload.
    pub async fn create(&self, review_materials: JsonMap) -> Result<Arc<Endpoint>> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let id = Uuid::new_v4().to_string();

        if let Some(prior) = self.store.lookup(&self.runtime_id, seq).await? {
            if prior.finished {
                debug!(seq, id = %id, "replaying finished endpoint decision");
                let params = prior
                    .response
                    .as_ref()
                    .map(Params::from_value)
                    .unwrap_or_default();
                let endpoint = Arc::new(Endpoint {
                    id: id.clone(),
                    seq,
                    runtime_id: self.runtime_id.clone(),
                    signal: Rendezvous::opened(),
                    active_params: StdRwLock::new(params),
                    review_materials: Params::from_map(review_materials),
                    checkpoint: Some(prior),
                    cancel: self.cancel.clone(),
                });
                self.endpoints
                    .write()
                    .await
                    .insert(id, Arc::clone(&endpoint));
                return Ok(endpoint);
            }
        }

        // A storage failure here only costs durability, not the decision
        // flow; the endpoint proceeds unbound.
        let checkpoint = match self
            .store
            .create(&self.runtime_id, seq, CHECKPOINT_KIND)
            .await
        {
            Ok(cp) => {
                if let Err(e) = self
                    .store
                    .submit_request(&cp, Value::Object(review_materials.clone()))
                    .await
                {
                    warn!(seq, error = %e, "failed to persist endpoint request payload");
                }
                Some(cp)
            }
            Err(e) => {
                warn!(seq, error = %e, "failed to create endpoint checkpoint");
                None
            }
        };

        let endpoint = Arc::new(Endpoint {
            id: id.clone(),
            seq,
            runtime_id: self.runtime_id.clone(),
            signal: Rendezvous::new(),
            active_params: StdRwLock::new(Params::new()),
            review_materials: Params::from_map(review_materials),
            checkpoint,
            cancel: self.cancel.clone(),
        });
        self.endpoints
            .write()
            .await
            .insert(id, Arc::clone(&endpoint));
        Ok(endpoint)
    }

    /// Release the endpoint `id` with a decision payload.
    ///
    /// The only external write path; safe from any number of concurrent
    /// callers. The first effective release wins; a feed landing on an
    /// already-open signal is a benign no-op. The payload is persisted into
    /// the bound checkpoint and the record marked finished.
    ///
    /// # Errors
    /// Unknown `id`, or a response-persistence failure (the release itself
    /// still happened and the worker is running, but the decision would not
    /// survive a crash, so callers must check).
    pub async fn feed(&self, id: &str, params: JsonMap) -> Result<()> {
        let endpoint = self
            .get(id)
            .await
            .ok_or_else(|| LoomError::Endpoint(format!("unknown endpoint id {id}")))?;
        self.release(&endpoint, Params::from_map(params)).await
    }

    async fn release(&self, endpoint: &Arc<Endpoint>, params: Params) -> Result<()> {
        if endpoint.is_released() {
            debug!(id = %endpoint.id, "endpoint already released, ignoring feed");
            return Ok(());
        }
        endpoint.set_params(params.clone());
        endpoint.signal.open();
        debug!(id = %endpoint.id, seq = endpoint.seq, "endpoint released");

        if let Some(emitter) = &self.emitter {
            let event = OutputEvent::endpoint_released(
                &self.runtime_id,
                &endpoint.id,
                Value::Object(params.clone().into_map()),
            );
            if let Err(e) = emitter.emit(event) {
                warn!(id = %endpoint.id, error = %e, "failed to emit release event");
            }
        }

        if let Some(checkpoint) = &endpoint.checkpoint {
            self.store
                .submit_response(checkpoint, Value::Object(params.into_map()))
                .await?;
        }
        Ok(())
    }

    /// Release every still-live endpoint with an empty decision.
    ///
    /// Called by the cancellation sweeper; persistence failures during
    /// teardown are logged and swallowed.
    pub async fn release_all_empty(&self) {
        let live: Vec<Arc<Endpoint>> = {
            let endpoints = self.endpoints.read().await;
            endpoints
                .values()
                .filter(|e| !e.is_released())
                .cloned()
                .collect()
        };
        for endpoint in live {
            if let Err(e) = self.release(&endpoint, Params::new()).await {
                warn!(id = %endpoint.id, error = %e, "failed to persist teardown release");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use serde_json::json;

    fn materials() -> JsonMap {
        let mut map = JsonMap::new();
        map.insert("tool".into(), json!("shell"));
        map.insert("command".into(), json!("rm -rf ./build"));
        map
    }

    fn decision(approved: bool) -> JsonMap {
        let mut map = JsonMap::new();
        map.insert("approved".into(), json!(approved));
        map
    }

    #[tokio::test]
    async fn test_create_assigns_monotonic_seq() {
        let manager = EndpointManager::new(
            "run-1",
            Arc::new(MemoryCheckpointStore::new()),
            CancellationToken::new(),
        );
        let a = manager.create(JsonMap::new()).await.unwrap();
        let b = manager.create(JsonMap::new()).await.unwrap();
        assert_eq!(a.seq(), 0);
        assert_eq!(b.seq(), 1);
        assert_ne!(a.id(), b.id());
        assert_eq!(manager.len().await, 2);
    }

    #[tokio::test]
    async fn test_feed_releases_waiter() {
        let manager = EndpointManager::new(
            "run-1",
            Arc::new(MemoryCheckpointStore::new()),
            CancellationToken::new(),
        );
        let endpoint = manager.create(materials()).await.unwrap();
        assert!(!endpoint.is_released());

        let waiter = Arc::clone(&endpoint);
        let handle = tokio::spawn(async move { waiter.get_params().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.feed(endpoint.id(), decision(true)).await.unwrap();

        let params = handle.await.unwrap();
        assert!(params.bool_of("approved"));
        assert!(endpoint.is_released());
    }

    #[tokio::test]
    async fn test_feed_unknown_id_errors() {
        let manager = EndpointManager::new(
            "run-1",
            Arc::new(MemoryCheckpointStore::new()),
            CancellationToken::new(),
        );
        let result = manager.feed("no-such-id", JsonMap::new()).await;
        assert!(matches!(result, Err(LoomError::Endpoint(_))));
    }

    #[tokio::test]
    async fn test_second_feed_is_benign() {
        let manager = EndpointManager::new(
            "run-1",
            Arc::new(MemoryCheckpointStore::new()),
            CancellationToken::new(),
        );
        let endpoint = manager.create(materials()).await.unwrap();
        manager.feed(endpoint.id(), decision(true)).await.unwrap();
        manager.feed(endpoint.id(), decision(false)).await.unwrap();
        // First release wins
        assert!(endpoint.get_params().await.bool_of("approved"));
    }

    #[tokio::test]
    async fn test_release_persists_decision() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let manager = EndpointManager::new("run-1", store.clone(), CancellationToken::new());
        let endpoint = manager.create(materials()).await.unwrap();
        manager.feed(endpoint.id(), decision(true)).await.unwrap();

        let cp = store.lookup("run-1", endpoint.seq()).await.unwrap().unwrap();
        assert!(cp.finished);
        assert_eq!(cp.response, Some(json!({"approved": true})));
        // The request snapshot was persisted too
        assert_eq!(cp.request.as_ref().unwrap()["tool"], "shell");
    }

    #[tokio::test]
    async fn test_crash_replay_same_decision_without_suspending() {
        let store = Arc::new(MemoryCheckpointStore::new());
        {
            let manager = EndpointManager::new("run-1", store.clone(), CancellationToken::new());
            let endpoint = manager.create(materials()).await.unwrap();
            manager.feed(endpoint.id(), decision(true)).await.unwrap();
        }

        // "Restarted" manager: same runtime id, fresh seq counter
        let manager = EndpointManager::new("run-1", store.clone(), CancellationToken::new());
        let endpoint = manager.create(materials()).await.unwrap();

        // Already released: get_params returns immediately with the stored decision
        assert!(endpoint.is_released());
        let params = tokio::time::timeout(Duration::from_millis(100), endpoint.get_params())
            .await
            .expect("replayed endpoint must not suspend");
        assert!(params.bool_of("approved"));
    }

    #[tokio::test]
    async fn test_cancel_sweeps_live_endpoints_with_empty_decision() {
        let cancel = CancellationToken::new();
        let manager = EndpointManager::new(
            "run-1",
            Arc::new(MemoryCheckpointStore::new()),
            cancel.clone(),
        );
        let endpoint = manager.create(materials()).await.unwrap();

        let waiter = Arc::clone(&endpoint);
        let handle = tokio::spawn(async move { waiter.get_params().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let params = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancelled endpoint must unblock")
            .unwrap();
        assert!(params.is_empty());
    }

    #[tokio::test]
    async fn test_get_params_after_cancel_returns_empty() {
        let cancel = CancellationToken::new();
        let manager = EndpointManager::new(
            "run-1",
            Arc::new(MemoryCheckpointStore::new()),
            cancel.clone(),
        );
        let endpoint = manager.create(JsonMap::new()).await.unwrap();
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // No feed ever happened; the empty decision comes back, no panic
        let params = endpoint.get_params().await;
        assert!(params.is_empty());
    }

    #[tokio::test]
    async fn test_wait_timeout_expires_on_unfed_endpoint() {
        let manager = EndpointManager::new(
            "run-1",
            Arc::new(MemoryCheckpointStore::new()),
            CancellationToken::new(),
        );
        let endpoint = manager.create(JsonMap::new()).await.unwrap();
        assert!(!endpoint.wait_timeout(Duration::from_millis(30)).await);
    }

    #[tokio::test]
    async fn test_concurrent_feeds_race_benignly() {
        let manager = EndpointManager::new(
            "run-1",
            Arc::new(MemoryCheckpointStore::new()),
            CancellationToken::new(),
        );
        let endpoint = manager.create(JsonMap::new()).await.unwrap();

        let mut handles = vec![];
        for i in 0..8 {
            let manager = Arc::clone(&manager);
            let id = endpoint.id().to_string();
            handles.push(tokio::spawn(async move {
                let mut map = JsonMap::new();
                map.insert("winner".into(), json!(i));
                manager.feed(&id, map).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Exactly one decision took effect
        let params = endpoint.get_params().await;
        let winner = params.i64_of("winner");
        assert!((0..8).contains(&winner));
    }

    #[tokio::test]
    async fn test_review_materials_snapshot() {
        let manager = EndpointManager::new(
            "run-1",
            Arc::new(MemoryCheckpointStore::new()),
            CancellationToken::new(),
        );
        let endpoint = manager.create(materials()).await.unwrap();
        assert_eq!(endpoint.review_materials().str_of("tool"), "shell");
    }
}
