//! AI-call contract and the checkpointed transaction wrapper.
//!
//! The model backend itself is an external collaborator behind [`AiClient`].
//! Everything in this crate that talks to a model (timeline compaction,
//! AI-scored review) goes through [`AiTransaction`], which adds:
//!
//! - retry with a fixed delay on transient failures (transport, empty reply)
//! - checkpointing of each transaction under `(runtime_id, seq)`, so a
//!   crashed-and-resumed run replays the stored reply instead of paying for
//!   the call again

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::AiRetryConfig;
use crate::error::{AiError, LoomError, Result};

/// An image handed to the model alongside the prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageAttachment {
    /// URL to the image (if hosted remotely)
    pub url: Option<String>,
    /// Raw bytes (if available locally)
    pub data: Option<Vec<u8>>,
    /// Original filename
    pub filename: Option<String>,
}

impl ImageAttachment {
    /// Create an attachment referencing a remote URL.
    pub fn from_url(url: &str) -> Self {
        Self {
            url: Some(url.to_string()),
            ..Default::default()
        }
    }

    /// Create an attachment carrying raw bytes.
    pub fn from_data(data: Vec<u8>) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }
}

/// A single model call request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiRequest {
    /// The prompt text
    pub prompt: String,
    /// Optional image attachments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,
}

impl AiRequest {
    /// Build a text-only request.
    pub fn text(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            images: Vec::new(),
        }
    }

    /// Attach an image (builder pattern).
    pub fn with_image(mut self, image: ImageAttachment) -> Self {
        self.images.push(image);
        self
    }
}

/// The model's reply: reasoning stream and output stream, collected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiReply {
    /// Chain-of-thought / reasoning text, possibly empty
    #[serde(default)]
    pub reasoning: String,
    /// The answer text
    pub output: String,
}

impl AiReply {
    /// Build a reply with output only.
    pub fn output_only(output: &str) -> Self {
        Self {
            reasoning: String::new(),
            output: output.to_string(),
        }
    }
}

/// Contract for the model backend.
///
/// Implementations stream internally however they like; the substrate
/// consumes the collected reply.
#[async_trait]
pub trait AiClient: Send + Sync {
    /// Issue one model call.
    async fn call(&self, request: AiRequest) -> Result<AiReply>;
}

/// Retryable, checkpointed wrapper around [`AiClient`] calls.
///
/// Each transaction is identified by a `(runtime_id, seq)` pair. If the
/// checkpoint under that key is already finished, the stored reply is
/// replayed and the model is never contacted.
#[derive(Clone)]
pub struct AiTransaction {
    runtime_id: String,
    client: Arc<dyn AiClient>,
    store: Arc<dyn CheckpointStore>,
    retry: AiRetryConfig,
}

impl AiTransaction {
    /// Create a transaction wrapper for one runtime instance.
    pub fn new(
        runtime_id: &str,
        client: Arc<dyn AiClient>,
        store: Arc<dyn CheckpointStore>,
        retry: AiRetryConfig,
    ) -> Self {
        Self {
            runtime_id: runtime_id.to_string(),
            client,
            store,
            retry,
        }
    }

    /// The model client behind this transaction wrapper.
    pub fn client(&self) -> &Arc<dyn AiClient> {
        &self.client
    }

    /// Run one checkpointed call.
    ///
    /// `kind` labels the transaction in the checkpoint record ("shrink",
    /// "reduce", "review", ...).
    ///
    /// # Errors
    /// Returns [`LoomError::AiExhausted`] when every attempt failed with a
    /// retryable cause, or the underlying error for a non-retryable failure.
    pub async fn run(&self, seq: u64, kind: &str, request: AiRequest) -> Result<AiReply> {
        // Idempotent replay: a finished checkpoint short-circuits the call.
        if let Some(prior) = self.store.lookup(&self.runtime_id, seq).await? {
            if prior.finished {
                if let Some(response) = prior.response {
                    debug!(seq, kind, "replaying finished AI transaction");
                    return Ok(serde_json::from_value(response)?);
                }
            }
        }

        let checkpoint = self.store.create(&self.runtime_id, seq, kind).await?;

        // Request persistence is best-effort: a failure here must not cost
        // the caller the transaction.
        if let Err(e) = self
            .store
            .submit_request(&checkpoint, serde_json::to_value(&request)?)
            .await
        {
            warn!(seq, kind, error = %e, "failed to persist AI request payload");
        }

        let attempts = self.retry.max_retries + 1;
        let mut last: Option<AiError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                if let Some(ref err) = last {
                    warn!(
                        seq,
                        kind,
                        attempt,
                        max = attempts,
                        error = %err,
                        "retrying AI call after transient failure"
                    );
                }
                tokio::time::sleep(Duration::from_millis(self.retry.retry_delay_ms)).await;
            }

            match self.client.call(request.clone()).await {
                Ok(reply) if reply.output.is_empty() => {
                    last = Some(AiError::Empty);
                }
                Ok(reply) => {
                    // Response persistence is checked: losing it would make
                    // the transaction unrecoverable on resume.
                    self.store
                        .submit_response(&checkpoint, serde_json::to_value(&reply)?)
                        .await?;
                    return Ok(reply);
                }
                Err(LoomError::Ai(err)) if err.is_retryable() => {
                    last = Some(err);
                }
                Err(other) => return Err(other),
            }
        }

        Err(LoomError::AiExhausted {
            attempts,
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Client that fails `failures` times, then succeeds.
    struct FlakyClient {
        calls: AtomicU32,
        failures: u32,
    }

    impl FlakyClient {
        fn new(failures: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
            }
        }
    }

    #[async_trait]
    impl AiClient for FlakyClient {
        async fn call(&self, request: AiRequest) -> Result<AiReply> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(AiError::Transport("connection reset".into()).into());
            }
            Ok(AiReply::output_only(&format!("reply to: {}", request.prompt)))
        }
    }

    fn fast_retry(max_retries: u32) -> AiRetryConfig {
        AiRetryConfig {
            max_retries,
            retry_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let tx = AiTransaction::new("run", Arc::new(FlakyClient::new(0)), store, fast_retry(3));
        let reply = tx.run(0, "test", AiRequest::text("hello")).await.unwrap();
        assert_eq!(reply.output, "reply to: hello");
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let tx = AiTransaction::new("run", Arc::new(FlakyClient::new(2)), store, fast_retry(3));
        let reply = tx.run(0, "test", AiRequest::text("hello")).await.unwrap();
        assert_eq!(reply.output, "reply to: hello");
    }

    #[tokio::test]
    async fn test_exhausts_retries() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let tx = AiTransaction::new("run", Arc::new(FlakyClient::new(10)), store, fast_retry(2));
        let err = tx.run(0, "test", AiRequest::text("hello")).await.unwrap_err();
        match err {
            LoomError::AiExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected AiExhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_reply_is_retried() {
        struct EmptyThenOk {
            calls: AtomicU32,
        }
        #[async_trait]
        impl AiClient for EmptyThenOk {
            async fn call(&self, _request: AiRequest) -> Result<AiReply> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(AiReply::default())
                } else {
                    Ok(AiReply::output_only("second time"))
                }
            }
        }
        let store = Arc::new(MemoryCheckpointStore::new());
        let client = Arc::new(EmptyThenOk {
            calls: AtomicU32::new(0),
        });
        let tx = AiTransaction::new("run", client, store, fast_retry(2));
        let reply = tx.run(0, "test", AiRequest::text("x")).await.unwrap();
        assert_eq!(reply.output, "second time");
    }

    #[tokio::test]
    async fn test_finished_checkpoint_replays_without_calling() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let client = Arc::new(FlakyClient::new(0));
        let tx = AiTransaction::new("run", client.clone(), store.clone(), fast_retry(0));

        let first = tx.run(7, "test", AiRequest::text("once")).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        // Same seq: replayed from the checkpoint, no second model call
        let second = tx.run(7, "test", AiRequest::text("once")).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.output, second.output);
    }

    #[tokio::test]
    async fn test_replay_across_transaction_instances() {
        let store = Arc::new(MemoryCheckpointStore::new());
        {
            let tx = AiTransaction::new(
                "run",
                Arc::new(FlakyClient::new(0)),
                store.clone(),
                fast_retry(0),
            );
            tx.run(3, "test", AiRequest::text("persisted")).await.unwrap();
        }
        // A "restarted" wrapper with a dead client still answers from storage
        let dead = Arc::new(FlakyClient::new(u32::MAX));
        let tx = AiTransaction::new("run", dead, store, fast_retry(0));
        let reply = tx.run(3, "test", AiRequest::text("persisted")).await.unwrap();
        assert_eq!(reply.output, "reply to: persisted");
    }
}
