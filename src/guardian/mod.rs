//! Event guardian: asynchronous side-channel dispatch.
//!
//! All output events (endpoint releases, compaction notices, anything the
//! runtime emits) flow through one unbounded queue into a single dispatch
//! worker. For each event the guardian:
//!
//! 1. runs every trigger registered for the event's type, handing each a
//!    restricted [`Emitter`] and the AI-calling capability;
//! 2. forwards the event to every registered named mirror: a passive
//!    observer with its own unbounded queue and its own dedicated worker,
//!    started lazily at most once.
//!
//! Mirror and trigger panics are contained at the dispatch boundary: logged,
//! never propagated, never costing other mirrors their events. The dispatch
//! loop ends when the owning context is cancelled or the input queue closes;
//! already-started mirror workers keep draining their queues.

pub mod event;

pub use event::OutputEvent;

use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::ai::AiClient;
use crate::error::{LoomError, Result};

/// Capabilities handed to a trigger invocation.
#[derive(Clone)]
pub struct TriggerContext {
    /// Restricted emitter: triggers may publish follow-up events
    pub emitter: Emitter,
    /// AI-calling capability
    pub ai: Arc<dyn AiClient>,
}

/// A callback bound to an event type, or acting as a mirror over all events.
#[async_trait::async_trait]
pub trait EventTrigger: Send + Sync {
    /// Handle one event.
    async fn handle(&self, event: OutputEvent, ctx: TriggerContext) -> Result<()>;
}

/// Cloneable handle for publishing events into the guardian.
#[derive(Clone)]
pub struct Emitter {
    tx: mpsc::UnboundedSender<OutputEvent>,
}

impl Emitter {
    /// Publish one event. Fails only when the guardian's queue has closed.
    pub fn emit(&self, event: OutputEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| LoomError::ChannelClosed)
    }
}

/// One registered mirror: its trigger plus the lazily-created feed.
struct MirrorEntry {
    trigger: Arc<dyn EventTrigger>,
    /// Present once the mirror's worker has been started (at most once)
    feed: once_cell::sync::OnceCell<mpsc::UnboundedSender<OutputEvent>>,
}

/// The event guardian.
///
/// Registries live behind per-instance locks, never process globals, so
/// multiple concurrent runtimes stay isolated.
pub struct Guardian {
    input_tx: StdMutex<Option<mpsc::UnboundedSender<OutputEvent>>>,
    input_rx: StdMutex<Option<mpsc::UnboundedReceiver<OutputEvent>>>,
    triggers: Arc<RwLock<HashMap<String, Vec<Arc<dyn EventTrigger>>>>>,
    mirrors: Arc<RwLock<HashMap<String, Arc<MirrorEntry>>>>,
    ai: Arc<dyn AiClient>,
    cancel: CancellationToken,
}

impl Guardian {
    /// Create a guardian bound to the given AI capability and context.
    pub fn new(ai: Arc<dyn AiClient>, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            input_tx: StdMutex::new(Some(tx)),
            input_rx: StdMutex::new(Some(rx)),
            triggers: Arc::new(RwLock::new(HashMap::new())),
            mirrors: Arc::new(RwLock::new(HashMap::new())),
            ai,
            cancel,
        }
    }

    /// An emitter feeding this guardian's input queue.
    ///
    /// # Errors
    /// Fails if the queue has already been closed via [`Guardian::close`].
    pub fn emitter(&self) -> Result<Emitter> {
        let guard = self.input_tx.lock().expect("guardian input lock poisoned");
        guard
            .as_ref()
            .map(|tx| Emitter { tx: tx.clone() })
            .ok_or(LoomError::ChannelClosed)
    }

    /// Register a trigger for one event type. Multiple triggers per type run
    /// in registration order.
    pub async fn register_trigger(&self, event_type: &str, trigger: Arc<dyn EventTrigger>) {
        let mut triggers = self.triggers.write().await;
        triggers
            .entry(event_type.to_string())
            .or_default()
            .push(trigger);
    }

    /// Register a named mirror observing every event from this point forward.
    ///
    /// Re-registering a name replaces the previous mirror for future events;
    /// an already-started worker for the old entry drains independently.
    pub async fn add_mirror(&self, name: &str, trigger: Arc<dyn EventTrigger>) {
        let mut mirrors = self.mirrors.write().await;
        mirrors.insert(
            name.to_string(),
            Arc::new(MirrorEntry {
                trigger,
                feed: once_cell::sync::OnceCell::new(),
            }),
        );
    }

    /// Close the input queue. The dispatch worker drains what is queued and
    /// then stops.
    pub fn close(&self) {
        let mut guard = self.input_tx.lock().expect("guardian input lock poisoned");
        *guard = None;
    }

    /// Start the dispatch worker.
    ///
    /// # Errors
    /// Fails if the guardian was already started.
    pub fn start(&self) -> Result<JoinHandle<()>> {
        let rx = {
            let mut guard = self.input_rx.lock().expect("guardian input lock poisoned");
            guard
                .take()
                .ok_or_else(|| LoomError::Config("guardian already started".into()))?
        };
        // The worker keeps only a weak handle to its own input, otherwise
        // the queue could never observe "all senders gone" and close.
        let emitter_tx = self
            .input_tx
            .lock()
            .expect("guardian input lock poisoned")
            .as_ref()
            .map(|tx| tx.downgrade());
        let worker = DispatchWorker {
            triggers: Arc::clone(&self.triggers),
            mirrors: Arc::clone(&self.mirrors),
            ai: Arc::clone(&self.ai),
            cancel: self.cancel.clone(),
            emitter_tx,
        };
        Ok(tokio::spawn(worker.run(rx)))
    }
}

/// State captured by the dispatch loop.
struct DispatchWorker {
    triggers: Arc<RwLock<HashMap<String, Vec<Arc<dyn EventTrigger>>>>>,
    mirrors: Arc<RwLock<HashMap<String, Arc<MirrorEntry>>>>,
    ai: Arc<dyn AiClient>,
    cancel: CancellationToken,
    emitter_tx: Option<mpsc::WeakUnboundedSender<OutputEvent>>,
}

impl DispatchWorker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<OutputEvent>) {
        debug!("guardian dispatch started");
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("guardian dispatch cancelled");
                    break;
                }
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => {
                        debug!("guardian input queue closed");
                        break;
                    }
                },
            };
            self.dispatch(event).await;
        }
    }

    async fn dispatch(&self, event: OutputEvent) {
        let ctx = TriggerContext {
            emitter: Emitter {
                tx: match self.emitter_tx.as_ref().and_then(|weak| weak.upgrade()) {
                    Some(tx) => tx,
                    // Queue already closed: hand triggers a dead-letter
                    // emitter rather than skipping them.
                    None => mpsc::unbounded_channel().0,
                },
            },
            ai: Arc::clone(&self.ai),
        };

        // Type-keyed triggers, in registration order.
        let typed: Vec<Arc<dyn EventTrigger>> = {
            let triggers = self.triggers.read().await;
            triggers.get(&event.event_type).cloned().unwrap_or_default()
        };
        for trigger in typed {
            run_contained(&trigger, event.clone(), ctx.clone(), "trigger").await;
        }

        // Mirrors: lazily start each worker once, then forward.
        let entries: Vec<(String, Arc<MirrorEntry>)> = {
            let mirrors = self.mirrors.read().await;
            mirrors
                .iter()
                .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
                .collect()
        };
        for (name, entry) in entries {
            let feed = entry.feed.get_or_init(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let trigger = Arc::clone(&entry.trigger);
                let ctx = ctx.clone();
                let mirror_name = name.clone();
                tokio::spawn(mirror_worker(mirror_name, trigger, ctx, rx));
                tx
            });
            if feed.send(event.clone()).is_err() {
                warn!(mirror = %name, "mirror worker gone, dropping event");
            }
        }
    }
}

/// Dedicated per-mirror worker: drains its private queue in feed order.
async fn mirror_worker(
    name: String,
    trigger: Arc<dyn EventTrigger>,
    ctx: TriggerContext,
    mut rx: mpsc::UnboundedReceiver<OutputEvent>,
) {
    debug!(mirror = %name, "mirror worker started");
    while let Some(event) = rx.recv().await {
        run_contained(&trigger, event, ctx.clone(), &name).await;
    }
    debug!(mirror = %name, "mirror worker drained");
}

/// Run one trigger invocation with panic containment.
async fn run_contained(
    trigger: &Arc<dyn EventTrigger>,
    event: OutputEvent,
    ctx: TriggerContext,
    who: &str,
) {
    let event_type = event.event_type.clone();
    match AssertUnwindSafe(trigger.handle(event, ctx)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(handler = who, event_type = %event_type, error = %e, "trigger returned error");
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(handler = who, event_type = %event_type, panic = %msg, "trigger panicked");
        }
    }
}
