//! Auto-decision policies.
//!
//! Policies resolve a waiting endpoint without human input. Each returns
//! either `Approve(payload)`, fed through the normal release path, or
//! `Defer`, meaning "keep waiting for a human".
//!
//! - [`ApproveAll`]: immediate default-continue.
//! - [`IntervalApprove`]: the same, with an optional minimum spacing between
//!   approvals; rate limiting is otherwise the caller's concern.
//! - [`AiScored`]: one model call scores risk 0.0–1.0. Low risk continues
//!   after a short delay, medium risk after a longer one, anything above the
//!   mid threshold defers to a human.
//! - [`Manual`]: defers, unless a pluggable assistant proposes a decision,
//!   tried up to 3 times with a short backoff to tolerate a slow UI.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::ai::{AiRequest, AiTransaction};
use crate::config::ReviewConfig;
use crate::decoder::{JsonMap, Params};
use crate::error::Result;

use super::{Endpoint, EndpointManager};

/// Attempts the manual policy makes against its assistant.
const ASSISTANT_ATTEMPTS: u32 = 3;
/// Delay between assistant attempts.
const ASSISTANT_BACKOFF: Duration = Duration::from_millis(100);

/// Capabilities a policy may use while reviewing.
#[derive(Clone)]
pub struct PolicyContext {
    /// Checkpointed AI transaction wrapper for scoring calls
    pub transaction: AiTransaction,
    /// Source of fresh sequence numbers for those calls
    pub seq_source: Arc<AtomicU64>,
    /// Thresholds and delays
    pub review: ReviewConfig,
}

impl PolicyContext {
    fn next_seq(&self) -> u64 {
        self.seq_source.fetch_add(1, Ordering::SeqCst)
    }
}

/// Outcome of one policy review.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyOutcome {
    /// Release the endpoint with this decision payload
    Approve(JsonMap),
    /// No automatic decision; fall back to the human wait
    Defer,
}

/// A policy that may resolve a waiting endpoint without human input.
#[async_trait]
pub trait ReviewPolicy: Send + Sync {
    /// Review one endpoint.
    async fn review(&self, endpoint: &Endpoint, ctx: &PolicyContext) -> Result<PolicyOutcome>;
}

/// The default continue payload.
fn default_continue() -> JsonMap {
    let mut map = JsonMap::new();
    map.insert("approved".to_string(), serde_json::json!(true));
    map
}

// ----------------------------------------------------------------------------
// ApproveAll
// ----------------------------------------------------------------------------

/// Approves every endpoint immediately with the default-continue payload.
pub struct ApproveAll;

#[async_trait]
impl ReviewPolicy for ApproveAll {
    async fn review(&self, _endpoint: &Endpoint, _ctx: &PolicyContext) -> Result<PolicyOutcome> {
        Ok(PolicyOutcome::Approve(default_continue()))
    }
}

// ----------------------------------------------------------------------------
// IntervalApprove
// ----------------------------------------------------------------------------

/// Approves like [`ApproveAll`], optionally refusing to approve twice within
/// `min_interval`. Callers drive the cadence; with no interval set this is
/// unconditional.
pub struct IntervalApprove {
    min_interval: Option<Duration>,
    last: Mutex<Option<Instant>>,
}

impl IntervalApprove {
    /// Unconditional variant.
    pub fn new() -> Self {
        Self {
            min_interval: None,
            last: Mutex::new(None),
        }
    }

    /// Refuse to approve more often than once per `interval`.
    pub fn with_min_interval(interval: Duration) -> Self {
        Self {
            min_interval: Some(interval),
            last: Mutex::new(None),
        }
    }
}

impl Default for IntervalApprove {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReviewPolicy for IntervalApprove {
    async fn review(&self, _endpoint: &Endpoint, _ctx: &PolicyContext) -> Result<PolicyOutcome> {
        if let Some(interval) = self.min_interval {
            let mut last = self.last.lock().await;
            if let Some(prev) = *last {
                if prev.elapsed() < interval {
                    return Ok(PolicyOutcome::Defer);
                }
            }
            *last = Some(Instant::now());
        }
        Ok(PolicyOutcome::Approve(default_continue()))
    }
}

// ----------------------------------------------------------------------------
// AiScored
// ----------------------------------------------------------------------------

/// Scores the pending step's risk with one model call.
///
/// Score < `low_threshold`: approve after `short_delay_ms`.
/// Score < `mid_threshold`: approve after `long_delay_ms`.
/// Otherwise, or when the reply is unusable: defer to a human.
pub struct AiScored;

impl AiScored {
    fn prompt(endpoint: &Endpoint) -> String {
        let materials = serde_json::to_string(endpoint.review_materials().as_map())
            .unwrap_or_else(|_| "{}".to_string());
        format!(
            "An autonomous agent wants to perform the step described below. \
             Rate the risk of allowing it on a scale from 0.0 (harmless) to \
             1.0 (dangerous). Reply with the number only.\n\n{}",
            materials
        )
    }

    /// Pull the first parseable float out of the reply.
    fn parse_score(output: &str) -> Option<f64> {
        output
            .split(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
            .filter(|token| !token.is_empty())
            .find_map(|token| token.parse::<f64>().ok())
            .filter(|score| (0.0..=1.0).contains(score))
    }
}

#[async_trait]
impl ReviewPolicy for AiScored {
    async fn review(&self, endpoint: &Endpoint, ctx: &PolicyContext) -> Result<PolicyOutcome> {
        let seq = ctx.next_seq();
        let reply = ctx
            .transaction
            .run(seq, "review", AiRequest::text(&Self::prompt(endpoint)))
            .await?;

        let Some(score) = Self::parse_score(&reply.output) else {
            warn!(endpoint = endpoint.id(), reply = %reply.output, "unparseable risk score, deferring");
            return Ok(PolicyOutcome::Defer);
        };
        debug!(endpoint = endpoint.id(), score, "risk score");

        if score < ctx.review.low_threshold {
            tokio::time::sleep(Duration::from_millis(ctx.review.short_delay_ms)).await;
            Ok(PolicyOutcome::Approve(default_continue()))
        } else if score < ctx.review.mid_threshold {
            tokio::time::sleep(Duration::from_millis(ctx.review.long_delay_ms)).await;
            Ok(PolicyOutcome::Approve(default_continue()))
        } else {
            Ok(PolicyOutcome::Defer)
        }
    }
}

// ----------------------------------------------------------------------------
// Manual
// ----------------------------------------------------------------------------

/// Proposes a decision for a waiting endpoint (e.g. a UI-side helper).
#[async_trait]
pub trait DecisionAssistant: Send + Sync {
    /// Return `Some(payload)` to decide, `None` to leave it to the human.
    async fn propose(&self, endpoint: &Endpoint) -> Result<Option<JsonMap>>;
}

/// Human-in-the-loop policy.
///
/// Without an assistant it always defers. With one, the assistant is asked
/// up to 3 times with a short backoff; a proposal goes through the normal
/// release path, a refusal or persistent failure defers.
pub struct Manual {
    assistant: Option<Arc<dyn DecisionAssistant>>,
}

impl Manual {
    /// Plain human wait.
    pub fn new() -> Self {
        Self { assistant: None }
    }

    /// Human wait aided by `assistant`.
    pub fn with_assistant(assistant: Arc<dyn DecisionAssistant>) -> Self {
        Self {
            assistant: Some(assistant),
        }
    }
}

impl Default for Manual {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReviewPolicy for Manual {
    async fn review(&self, endpoint: &Endpoint, _ctx: &PolicyContext) -> Result<PolicyOutcome> {
        let Some(assistant) = &self.assistant else {
            return Ok(PolicyOutcome::Defer);
        };
        for attempt in 0..ASSISTANT_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(ASSISTANT_BACKOFF).await;
            }
            match assistant.propose(endpoint).await {
                Ok(Some(params)) => return Ok(PolicyOutcome::Approve(params)),
                Ok(None) => return Ok(PolicyOutcome::Defer),
                Err(e) => {
                    warn!(
                        endpoint = endpoint.id(),
                        attempt,
                        error = %e,
                        "decision assistant failed"
                    );
                }
            }
        }
        Ok(PolicyOutcome::Defer)
    }
}

// ----------------------------------------------------------------------------
// Manager integration
// ----------------------------------------------------------------------------

impl EndpointManager {
    /// Run `policy` against the endpoint `id`; an approval is fed through
    /// the normal release path.
    ///
    /// Returns `true` if the policy released the endpoint, `false` if it
    /// deferred (the human wait continues).
    pub async fn resolve_with(
        &self,
        id: &str,
        policy: &dyn ReviewPolicy,
        ctx: &PolicyContext,
    ) -> Result<bool> {
        let endpoint = self
            .get(id)
            .await
            .ok_or_else(|| crate::error::LoomError::Endpoint(format!("unknown endpoint id {id}")))?;
        match policy.review(&endpoint, ctx).await? {
            PolicyOutcome::Approve(params) => {
                self.feed(id, params).await?;
                Ok(true)
            }
            PolicyOutcome::Defer => Ok(false),
        }
    }
}

/// Decision payload helpers shared by policy consumers.
pub fn approved(params: &Params) -> bool {
    params.bool_of("approved")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{AiClient, AiReply};
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::config::AiRetryConfig;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    /// Model stub that always answers with a fixed string.
    struct FixedAi(String);

    #[async_trait]
    impl AiClient for FixedAi {
        async fn call(&self, _request: AiRequest) -> Result<AiReply> {
            Ok(AiReply::output_only(&self.0))
        }
    }

    fn context(answer: &str) -> PolicyContext {
        let store = Arc::new(MemoryCheckpointStore::new());
        PolicyContext {
            transaction: AiTransaction::new(
                "run-policy",
                Arc::new(FixedAi(answer.to_string())),
                store,
                AiRetryConfig {
                    max_retries: 0,
                    retry_delay_ms: 1,
                },
            ),
            seq_source: Arc::new(AtomicU64::new(1000)),
            review: ReviewConfig {
                low_threshold: 0.3,
                mid_threshold: 0.6,
                short_delay_ms: 1,
                long_delay_ms: 1,
            },
        }
    }

    async fn make_endpoint() -> (Arc<EndpointManager>, Arc<Endpoint>) {
        let manager = EndpointManager::new(
            "run-policy",
            Arc::new(MemoryCheckpointStore::new()),
            CancellationToken::new(),
        );
        let mut materials = JsonMap::new();
        materials.insert("tool".into(), json!("shell"));
        let endpoint = manager.create(materials).await.unwrap();
        (manager, endpoint)
    }

    #[tokio::test]
    async fn test_approve_all() {
        let (_m, endpoint) = make_endpoint().await;
        let outcome = ApproveAll.review(&endpoint, &context("0")).await.unwrap();
        match outcome {
            PolicyOutcome::Approve(map) => assert_eq!(map["approved"], json!(true)),
            PolicyOutcome::Defer => panic!("ApproveAll must approve"),
        }
    }

    #[tokio::test]
    async fn test_interval_approve_unconditional() {
        let (_m, endpoint) = make_endpoint().await;
        let policy = IntervalApprove::new();
        let ctx = context("0");
        for _ in 0..3 {
            assert!(matches!(
                policy.review(&endpoint, &ctx).await.unwrap(),
                PolicyOutcome::Approve(_)
            ));
        }
    }

    #[tokio::test]
    async fn test_interval_approve_rate_limited() {
        let (_m, endpoint) = make_endpoint().await;
        let policy = IntervalApprove::with_min_interval(Duration::from_secs(60));
        let ctx = context("0");
        assert!(matches!(
            policy.review(&endpoint, &ctx).await.unwrap(),
            PolicyOutcome::Approve(_)
        ));
        // Second approval inside the window defers
        assert_eq!(
            policy.review(&endpoint, &ctx).await.unwrap(),
            PolicyOutcome::Defer
        );
    }

    #[tokio::test]
    async fn test_ai_scored_low_risk_approves() {
        let (_m, endpoint) = make_endpoint().await;
        let outcome = AiScored.review(&endpoint, &context("0.1")).await.unwrap();
        assert!(matches!(outcome, PolicyOutcome::Approve(_)));
    }

    #[tokio::test]
    async fn test_ai_scored_medium_risk_approves_slowly() {
        let (_m, endpoint) = make_endpoint().await;
        let outcome = AiScored.review(&endpoint, &context("0.45")).await.unwrap();
        assert!(matches!(outcome, PolicyOutcome::Approve(_)));
    }

    #[tokio::test]
    async fn test_ai_scored_high_risk_defers() {
        let (_m, endpoint) = make_endpoint().await;
        let outcome = AiScored.review(&endpoint, &context("0.9")).await.unwrap();
        assert_eq!(outcome, PolicyOutcome::Defer);
    }

    #[tokio::test]
    async fn test_ai_scored_junk_reply_defers() {
        let (_m, endpoint) = make_endpoint().await;
        let outcome = AiScored
            .review(&endpoint, &context("I cannot assess that."))
            .await
            .unwrap();
        assert_eq!(outcome, PolicyOutcome::Defer);
    }

    #[test]
    fn test_parse_score_variants() {
        assert_eq!(AiScored::parse_score("0.4"), Some(0.4));
        assert_eq!(AiScored::parse_score("Risk: 0.75 overall"), Some(0.75));
        assert_eq!(AiScored::parse_score("1"), Some(1.0));
        assert_eq!(AiScored::parse_score("97 out of 100"), None);
        assert_eq!(AiScored::parse_score("no number here"), None);
    }

    #[tokio::test]
    async fn test_manual_without_assistant_defers() {
        let (_m, endpoint) = make_endpoint().await;
        let outcome = Manual::new().review(&endpoint, &context("0")).await.unwrap();
        assert_eq!(outcome, PolicyOutcome::Defer);
    }

    #[tokio::test]
    async fn test_manual_assistant_proposes() {
        struct YesBot;
        #[async_trait]
        impl DecisionAssistant for YesBot {
            async fn propose(&self, _endpoint: &Endpoint) -> Result<Option<JsonMap>> {
                let mut map = JsonMap::new();
                map.insert("approved".into(), json!(true));
                map.insert("by".into(), json!("assistant"));
                Ok(Some(map))
            }
        }
        let (_m, endpoint) = make_endpoint().await;
        let policy = Manual::with_assistant(Arc::new(YesBot));
        match policy.review(&endpoint, &context("0")).await.unwrap() {
            PolicyOutcome::Approve(map) => assert_eq!(map["by"], json!("assistant")),
            PolicyOutcome::Defer => panic!("assistant proposal must approve"),
        }
    }

    #[tokio::test]
    async fn test_manual_assistant_retried_then_defers() {
        struct FlakyBot {
            calls: AtomicU64,
        }
        #[async_trait]
        impl DecisionAssistant for FlakyBot {
            async fn propose(&self, _endpoint: &Endpoint) -> Result<Option<JsonMap>> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(crate::error::LoomError::Endpoint("ui unreachable".into()))
            }
        }
        let bot = Arc::new(FlakyBot {
            calls: AtomicU64::new(0),
        });
        let (_m, endpoint) = make_endpoint().await;
        let assistant: Arc<dyn DecisionAssistant> = bot.clone();
        let policy = Manual::with_assistant(assistant);
        let outcome = policy.review(&endpoint, &context("0")).await.unwrap();
        assert_eq!(outcome, PolicyOutcome::Defer);
        assert_eq!(bot.calls.load(Ordering::SeqCst), ASSISTANT_ATTEMPTS as u64);
    }

    #[tokio::test]
    async fn test_resolve_with_feeds_through_release_path() {
        let (manager, endpoint) = make_endpoint().await;
        let released = manager
            .resolve_with(endpoint.id(), &ApproveAll, &context("0"))
            .await
            .unwrap();
        assert!(released);
        assert!(endpoint.is_released());
        assert!(approved(&endpoint.get_params().await));
    }

    #[tokio::test]
    async fn test_resolve_with_defer_leaves_endpoint_waiting() {
        let (manager, endpoint) = make_endpoint().await;
        let released = manager
            .resolve_with(endpoint.id(), &Manual::new(), &context("0"))
            .await
            .unwrap();
        assert!(!released);
        assert!(!endpoint.is_released());
    }
}
