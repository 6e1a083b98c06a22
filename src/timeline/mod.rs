//! Bounded, self-compacting execution history.
//!
//! The timeline is an append-only, time-ordered log of what the agent did:
//! tool results, user interactions, free text. It stays bounded through two
//! AI-assisted compaction forms, both invoked only when a size threshold is
//! crossed, never eagerly:
//!
//! - **Shrink** (per item): one model call summarizes the single oldest
//!   oversized item; the summary substitutes for the content from then on,
//!   and the model may recommend dropping the item outright (soft delete).
//! - **Reduce** (range): when the live count exceeds the hard cap, one model
//!   call condenses everything up to a boundary id into a single narrative;
//!   the prefix is removed and rendering collapses it to one line.
//!
//! Compaction calls run through the checkpointed [`AiTransaction`] contract,
//! so repeating a boundary is idempotent. Only the latest summary per id and
//! the latest reducer per boundary are retained, which bounds serialized
//! size no matter how many times compaction runs.
//!
//! The timeline is single-writer by construction (`&mut self`): the runtime
//! serializes all mutation through the owning agent's control-flow path.
//! Concurrent reads against a mutating timeline need external locking.

pub mod item;

pub use item::{TimelineItem, TimelineItemValue};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::ai::{AiRequest, AiTransaction};
use crate::config::TimelineConfig;
use crate::error::{LoomError, Result};
use crate::guardian::{Emitter, OutputEvent};

/// Sleep between timestamp collision retries.
const COLLISION_RETRY: Duration = Duration::from_millis(2);

/// Capabilities compaction needs: the checkpointed AI wrapper, a fresh-seq
/// source, and (optionally) the event emitter.
#[derive(Clone)]
pub struct CompactionContext {
    /// Checkpointed, retryable AI calls
    pub transaction: AiTransaction,
    /// Source of sequence numbers for those calls
    pub seq_source: Arc<AtomicU64>,
    /// Where shrink/reduce notices go, if anywhere
    pub emitter: Option<Emitter>,
}

impl CompactionContext {
    fn next_seq(&self) -> u64 {
        self.seq_source.fetch_add(1, Ordering::SeqCst)
    }

    fn emit(&self, event: OutputEvent) {
        if let Some(emitter) = &self.emitter {
            if let Err(e) = emitter.emit(event) {
                warn!(error = %e, "failed to emit compaction event");
            }
        }
    }
}

/// Parsed shrink reply: the summary plus an optional drop recommendation.
fn parse_shrink_reply(output: &str) -> (String, bool) {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(output.trim()) {
        if let Some(obj) = value.as_object() {
            if let Some(summary) = obj.get("summary").and_then(|v| v.as_str()) {
                let drop = obj.get("drop").and_then(|v| v.as_bool()).unwrap_or(false);
                return (summary.to_string(), drop);
            }
        }
    }
    (output.trim().to_string(), false)
}

/// The execution history log.
pub struct Timeline {
    runtime_id: String,
    config: TimelineConfig,
    next_id: u64,
    items: BTreeMap<u64, TimelineItem>,
    id_to_ts: BTreeMap<u64, i64>,
    ts_to_id: BTreeMap<i64, u64>,
    /// Latest shrink text per id (earlier summaries are overwritten)
    summaries: BTreeMap<u64, String>,
    /// Latest range narrative per boundary id
    reducers: BTreeMap<u64, String>,
}

impl Timeline {
    /// Create an empty timeline.
    pub fn new(runtime_id: &str, config: TimelineConfig) -> Self {
        Self {
            runtime_id: runtime_id.to_string(),
            config,
            next_id: 0,
            items: BTreeMap::new(),
            id_to_ts: BTreeMap::new(),
            ts_to_id: BTreeMap::new(),
            summaries: BTreeMap::new(),
            reducers: BTreeMap::new(),
        }
    }

    /// The active size budgets.
    pub fn config(&self) -> &TimelineConfig {
        &self.config
    }

    /// Number of live items (reduced-away items are gone, soft-deleted ones
    /// still count until a reduce removes them).
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the timeline holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Fetch an item by id.
    pub fn get(&self, id: u64) -> Option<&TimelineItem> {
        self.items.get(&id)
    }

    /// Item ids in time order.
    pub fn ids_in_time_order(&self) -> Vec<u64> {
        self.ts_to_id.values().copied().collect()
    }

    /// Count of items not yet summarized.
    pub fn unsummarized_count(&self) -> usize {
        self.items.len() - self.summaries.len()
    }

    /// The latest reducer boundary, if a reduce has happened.
    pub fn reducer_boundary(&self) -> Option<u64> {
        self.reducers.keys().next_back().copied()
    }

    /// Append one item, assigning a strictly-unique timestamp.
    ///
    /// A millisecond-clock collision triggers a short async sleep and a
    /// retake rather than sharing a slot; first writer wins the stamp.
    pub async fn append(&mut self, value: TimelineItemValue) -> u64 {
        let mut ts = chrono::Utc::now().timestamp_millis();
        while self.ts_to_id.contains_key(&ts) {
            tokio::time::sleep(COLLISION_RETRY).await;
            ts = chrono::Utc::now().timestamp_millis();
        }

        let id = self.next_id;
        self.next_id += 1;
        self.items.insert(id, TimelineItem::new(id, value));
        self.id_to_ts.insert(id, ts);
        self.ts_to_id.insert(ts, id);
        id
    }

    /// Append and then let compaction catch up. The usual write path.
    pub async fn record(&mut self, value: TimelineItemValue, ctx: &CompactionContext) -> Result<u64> {
        let id = self.append(value).await;
        self.compact(ctx).await?;
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Compaction
    // ------------------------------------------------------------------

    /// Enforce every size budget, compacting as needed.
    ///
    /// Never eager: each pass runs only while its threshold is exceeded.
    pub async fn compact(&mut self, ctx: &CompactionContext) -> Result<()> {
        // Too many un-summarized items: shrink oldest until back in budget.
        while self.unsummarized_count() > self.config.full_memory_count {
            if self.shrink_oldest(ctx).await?.is_none() {
                break;
            }
        }

        // Too many live items: collapse a prefix, keeping headroom so one
        // reduce covers a whole overflow run.
        while self.items.len() > self.config.max_timeline_limit() {
            let ids = self.ids_in_time_order();
            let keep = self.config.full_memory_count;
            let boundary = ids[ids.len() - keep - 1];
            self.reduce_to(ctx, boundary).await?;
        }

        // Rendered dump over budget: keep compacting oldest spans
        let mut guard = self.items.len() * 2 + 4;
        while self.dump(None).len() > self.config.total_dump_content_limit && guard > 0 {
            guard -= 1;
            if self.summaries.len() < self.items.len() {
                if self.shrink_oldest(ctx).await?.is_none() {
                    break;
                }
            } else if self.items.len() > 1 {
                let ids = self.ids_in_time_order();
                let boundary = ids[ids.len() / 2];
                self.reduce_to(ctx, boundary).await?;
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Shrink the single oldest un-summarized item (oversized ones first).
    ///
    /// Returns the shrunk id, or `None` when nothing is left to shrink.
    pub async fn shrink_oldest(&mut self, ctx: &CompactionContext) -> Result<Option<u64>> {
        let candidates: Vec<u64> = self
            .ids_in_time_order()
            .into_iter()
            .filter(|id| {
                self.items
                    .get(id)
                    .map(|item| !item.is_shrunk() && !item.deleted)
                    .unwrap_or(false)
            })
            .collect();

        let target = candidates
            .iter()
            .copied()
            .find(|id| {
                self.items
                    .get(id)
                    .map(|item| item.rendered_len() > self.config.item_shrink_threshold)
                    .unwrap_or(false)
            })
            .or_else(|| candidates.first().copied());
        let Some(id) = target else {
            return Ok(None);
        };

        let rendered = self.items.get(&id).map(|i| i.value.render()).unwrap_or_default();
        let prompt = format!(
            "Summarize the following execution history entry so it stays \
             useful as agent memory. Keep concrete identifiers and outcomes. \
             Reply with the summary text, or with {{\"summary\": \"...\", \
             \"drop\": true}} if the entry no longer matters.\n\n{}",
            rendered
        );
        let reply = ctx
            .transaction
            .run(ctx.next_seq(), "shrink", AiRequest::text(&prompt))
            .await?;
        let (summary, drop) = parse_shrink_reply(&reply.output);

        if let Some(item) = self.items.get_mut(&id) {
            item.set_summary(&summary);
            if drop {
                item.deleted = true;
            }
        }
        self.summaries.insert(id, summary.clone());
        debug!(id, drop, "timeline item shrunk");
        ctx.emit(OutputEvent::timeline_shrink(&self.runtime_id, id, &summary));
        Ok(Some(id))
    }

    /// Collapse everything at or below `boundary` into one narrative.
    ///
    /// The prefix items (and their summaries) are removed; only the reducer
    /// text survives. Re-running on the same boundary overwrites, never
    /// accumulates.
    pub async fn reduce_to(&mut self, ctx: &CompactionContext, boundary: u64) -> Result<()> {
        let mut prefix = Vec::new();
        if let Some((_, prior)) = self.reducers.iter().next_back() {
            prefix.push(format!("[earlier history] {}", prior));
        }
        for id in self.ids_in_time_order() {
            if id > boundary {
                continue;
            }
            if let Some(item) = self.items.get(&id) {
                if !item.deleted {
                    prefix.push(item.render());
                }
            }
        }

        let prompt = format!(
            "Condense the following agent execution history into one short \
             narrative paragraph. Preserve decisions, outcomes, and anything \
             a future step might depend on.\n\n{}",
            prefix.join("\n")
        );
        let reply = ctx
            .transaction
            .run(ctx.next_seq(), "reduce", AiRequest::text(&prompt))
            .await?;

        // Drop the collapsed prefix from every map.
        let doomed: Vec<u64> = self
            .items
            .keys()
            .copied()
            .filter(|id| *id <= boundary)
            .collect();
        for id in doomed {
            self.items.remove(&id);
            self.summaries.remove(&id);
            if let Some(ts) = self.id_to_ts.remove(&id) {
                self.ts_to_id.remove(&ts);
            }
        }
        // Only the latest narrative up to this boundary is retained.
        let superseded: Vec<u64> = self
            .reducers
            .keys()
            .copied()
            .filter(|b| *b <= boundary)
            .collect();
        for b in superseded {
            self.reducers.remove(&b);
        }
        self.reducers.insert(boundary, reply.output.trim().to_string());

        debug!(boundary, remaining = self.items.len(), "timeline prefix reduced");
        ctx.emit(OutputEvent::timeline_reduce(&self.runtime_id, boundary));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------

    /// Render the history in time order, up to `upper` (inclusive) if given.
    ///
    /// The reducer narrative stands in for everything at/below its boundary;
    /// shrunk items render their summary; soft-deleted items are skipped.
    pub fn dump(&self, upper: Option<u64>) -> String {
        let mut lines = Vec::new();
        if let Some((&boundary, text)) = self.reducers.iter().next_back() {
            if upper.map(|u| boundary <= u).unwrap_or(true) {
                lines.push(format!("[earlier history] {}", text));
            }
        }
        for id in self.ids_in_time_order() {
            if let Some(u) = upper {
                if id > u {
                    continue;
                }
            }
            if let Some(item) = self.items.get(&id) {
                if !item.deleted {
                    lines.push(item.render());
                }
            }
        }
        lines.join("\n")
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Snapshot the live state for persistence.
    ///
    /// Only live, non-deleted items plus the latest summary/reducer entries
    /// are serialized. A shrunk item's original content is blanked: once
    /// compacted, it can never be reintroduced by a restore, so repeated
    /// compact-and-persist cycles cannot grow without bound.
    pub fn snapshot(&self) -> TimelineSnapshot {
        let mut items = Vec::new();
        for id in self.ids_in_time_order() {
            let Some(item) = self.items.get(&id) else {
                continue;
            };
            if item.deleted {
                continue;
            }
            let mut persisted = item.clone();
            if persisted.is_shrunk() {
                persisted.value = TimelineItemValue::free_text("");
            }
            items.push(SnapshotEntry {
                timestamp: self.id_to_ts.get(&id).copied().unwrap_or_default(),
                item: persisted,
            });
        }
        let live: Vec<u64> = items.iter().map(|e| e.item.id).collect();
        TimelineSnapshot {
            runtime_id: self.runtime_id.clone(),
            next_id: self.next_id,
            items,
            summaries: self
                .summaries
                .iter()
                .filter(|(id, _)| live.contains(id))
                .map(|(id, s)| (*id, s.clone()))
                .collect(),
            reducers: self.reducers.clone(),
        }
    }

    /// Rebuild a timeline from a snapshot.
    ///
    /// Timestamp collisions in the snapshot are disambiguated by bumping
    /// forward one millisecond, preserving order.
    pub fn restore(snapshot: TimelineSnapshot, config: TimelineConfig) -> Result<Self> {
        let mut timeline = Self::new(&snapshot.runtime_id, config);
        timeline.next_id = snapshot.next_id;
        for entry in snapshot.items {
            let id = entry.item.id;
            let mut ts = entry.timestamp;
            while timeline.ts_to_id.contains_key(&ts) {
                ts += 1;
            }
            if timeline.items.contains_key(&id) {
                return Err(LoomError::Timeline(format!("duplicate item id {id} in snapshot")));
            }
            timeline.next_id = timeline.next_id.max(id + 1);
            timeline.items.insert(id, entry.item);
            timeline.id_to_ts.insert(id, ts);
            timeline.ts_to_id.insert(ts, id);
        }
        timeline.summaries = snapshot.summaries;
        timeline.reducers = snapshot.reducers;
        Ok(timeline)
    }

    /// Persist the snapshot as pretty JSON.
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.snapshot())?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Load a snapshot file.
    pub async fn load_from_file(path: &Path, config: TimelineConfig) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let snapshot: TimelineSnapshot = serde_json::from_str(&content)?;
        Self::restore(snapshot, config)
    }

    // ------------------------------------------------------------------
    // Id reassignment
    // ------------------------------------------------------------------

    /// Remap every surviving id (and the ids referenced by summaries and
    /// reducers) through `generate`, preserving relative time order.
    ///
    /// Reducer boundaries draw their ids first (they stand for the oldest
    /// span), then items in time order, so a monotonic generator keeps the
    /// whole history ordered. Used when resuming a persisted timeline under
    /// a fresh id sequence.
    ///
    /// # Errors
    /// Fails if the generator yields a duplicate id.
    pub fn reassign_ids(&mut self, mut generate: impl FnMut() -> u64) -> Result<()> {
        let mut new_reducers = BTreeMap::new();
        for (_, text) in std::mem::take(&mut self.reducers) {
            let id = generate();
            if new_reducers.insert(id, text).is_some() {
                return Err(LoomError::Timeline(format!("generator repeated id {id}")));
            }
        }

        let mut mapping = BTreeMap::new();
        for old in self.ids_in_time_order() {
            let id = generate();
            if new_reducers.contains_key(&id) || mapping.values().any(|v| *v == id) {
                return Err(LoomError::Timeline(format!("generator repeated id {id}")));
            }
            mapping.insert(old, id);
        }

        let mut items = BTreeMap::new();
        let mut id_to_ts = BTreeMap::new();
        let mut ts_to_id = BTreeMap::new();
        let mut summaries = BTreeMap::new();
        for (old, new) in &mapping {
            if let Some(mut item) = self.items.remove(old) {
                item.id = *new;
                items.insert(*new, item);
            }
            if let Some(ts) = self.id_to_ts.remove(old) {
                id_to_ts.insert(*new, ts);
                ts_to_id.insert(ts, *new);
            }
            if let Some(summary) = self.summaries.remove(old) {
                summaries.insert(*new, summary);
            }
        }
        self.items = items;
        self.id_to_ts = id_to_ts;
        self.ts_to_id = ts_to_id;
        self.summaries = summaries;
        self.reducers = new_reducers;
        self.next_id = self
            .items
            .keys()
            .next_back()
            .map(|id| id + 1)
            .unwrap_or(self.next_id);
        Ok(())
    }
}

/// One persisted item with its timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Millisecond timestamp
    pub timestamp: i64,
    /// The item (content blanked when shrunk)
    pub item: TimelineItem,
}

/// Serialized form of a timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineSnapshot {
    /// Owning runtime instance
    pub runtime_id: String,
    /// Next id the timeline would assign
    pub next_id: u64,
    /// Live items in time order
    pub items: Vec<SnapshotEntry>,
    /// Latest shrink text per surviving id
    pub summaries: BTreeMap<u64, String>,
    /// Latest narrative per boundary
    pub reducers: BTreeMap<u64, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{AiClient, AiReply};
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::config::AiRetryConfig;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Summarizer stub: echoes a short fixed-form summary.
    struct StubSummarizer {
        calls: AtomicU32,
    }

    #[async_trait]
    impl AiClient for StubSummarizer {
        async fn call(&self, request: AiRequest) -> crate::error::Result<AiReply> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if request.prompt.starts_with("Condense") {
                Ok(AiReply::output_only(&format!("narrative#{n}")))
            } else {
                Ok(AiReply::output_only(&format!("summary#{n}")))
            }
        }
    }

    fn ctx() -> CompactionContext {
        CompactionContext {
            transaction: AiTransaction::new(
                "run-tl",
                Arc::new(StubSummarizer {
                    calls: AtomicU32::new(0),
                }),
                Arc::new(MemoryCheckpointStore::new()),
                AiRetryConfig {
                    max_retries: 0,
                    retry_delay_ms: 1,
                },
            ),
            seq_source: Arc::new(AtomicU64::new(0)),
            emitter: None,
        }
    }

    fn small_config() -> TimelineConfig {
        TimelineConfig {
            full_memory_count: 3,
            item_shrink_threshold: 64,
            total_dump_content_limit: 4_096,
        }
    }

    async fn push_n(timeline: &mut Timeline, n: usize, ctx: &CompactionContext) {
        for i in 0..n {
            timeline
                .record(
                    TimelineItemValue::tool_result(&format!("c{i}"), "shell", &format!("result {i}")),
                    ctx,
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_append_assigns_unique_timestamps() {
        let mut timeline = Timeline::new("run", small_config());
        for _ in 0..10 {
            timeline.append(TimelineItemValue::free_text("x")).await;
        }
        assert_eq!(timeline.len(), 10);
        // One timestamp per item, strictly unique
        assert_eq!(timeline.ts_to_id.len(), 10);
        // Time order equals insertion order for a single writer
        assert_eq!(timeline.ids_in_time_order(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_shrink_kicks_in_past_full_memory_count() {
        let mut timeline = Timeline::new("run", small_config());
        let ctx = ctx();
        push_n(&mut timeline, 4, &ctx).await;

        // 4 items, budget 3: the oldest must have been shrunk
        assert!(timeline.get(0).unwrap().is_shrunk());
        assert!(timeline.unsummarized_count() <= 3);
        assert!(timeline.dump(None).contains("summary#"));
    }

    #[tokio::test]
    async fn test_oversized_item_shrunk_first() {
        let mut timeline = Timeline::new("run", small_config());
        let ctx = ctx();
        timeline.append(TimelineItemValue::free_text("small")).await;
        let big = "b".repeat(500);
        timeline.append(TimelineItemValue::free_text(&big)).await;
        timeline.append(TimelineItemValue::free_text("also small")).await;
        timeline.append(TimelineItemValue::free_text("tiny")).await;

        timeline.compact(&ctx).await.unwrap();
        // The oversized item (id 1) won over the strictly-older small one
        assert!(timeline.get(1).unwrap().is_shrunk());
    }

    #[tokio::test]
    async fn test_reduce_collapses_prefix() {
        let mut timeline = Timeline::new("run", small_config());
        let ctx = ctx();
        // max_timeline_limit = 9; pushing past it forces a reduce
        push_n(&mut timeline, 12, &ctx).await;

        assert!(timeline.len() <= small_config().max_timeline_limit());
        let boundary = timeline.reducer_boundary().expect("reduce must have run");
        // Everything at/below the boundary is gone from the maps
        assert!(timeline.items.keys().all(|id| *id > boundary));
        let dump = timeline.dump(None);
        assert!(dump.starts_with("[earlier history] narrative#"));
    }

    #[tokio::test]
    async fn test_repeated_reduce_keeps_single_narrative() {
        let mut timeline = Timeline::new("run", small_config());
        let ctx = ctx();
        push_n(&mut timeline, 30, &ctx).await;
        // However many reduces ran, exactly one reducer entry survives
        assert_eq!(timeline.reducers.len(), 1);
    }

    #[tokio::test]
    async fn test_dump_budget_enforced() {
        let config = TimelineConfig {
            full_memory_count: 50,
            item_shrink_threshold: 10_000,
            total_dump_content_limit: 600,
        };
        let mut timeline = Timeline::new("run", config);
        let ctx = ctx();
        for i in 0..20 {
            timeline
                .record(
                    TimelineItemValue::free_text(&format!("{i}: {}", "x".repeat(80))),
                    &ctx,
                )
                .await
                .unwrap();
        }
        assert!(timeline.dump(None).len() <= 600);
    }

    #[tokio::test]
    async fn test_dump_upper_bound() {
        let mut timeline = Timeline::new("run", small_config());
        timeline.append(TimelineItemValue::free_text("zero")).await;
        timeline.append(TimelineItemValue::free_text("one")).await;
        timeline.append(TimelineItemValue::free_text("two")).await;

        let partial = timeline.dump(Some(1));
        assert!(partial.contains("zero"));
        assert!(partial.contains("one"));
        assert!(!partial.contains("two"));
    }

    #[tokio::test]
    async fn test_dump_skips_soft_deleted() {
        let mut timeline = Timeline::new("run", small_config());
        timeline.append(TimelineItemValue::free_text("keep me")).await;
        timeline.append(TimelineItemValue::free_text("drop me")).await;
        timeline.items.get_mut(&1).unwrap().deleted = true;

        let dump = timeline.dump(None);
        assert!(dump.contains("keep me"));
        assert!(!dump.contains("drop me"));
    }

    #[tokio::test]
    async fn test_shrink_drop_recommendation() {
        /// Summarizer that recommends dropping everything.
        struct Dropper;
        #[async_trait]
        impl AiClient for Dropper {
            async fn call(&self, _request: AiRequest) -> crate::error::Result<AiReply> {
                Ok(AiReply::output_only(
                    r#"{"summary": "irrelevant scaffolding", "drop": true}"#,
                ))
            }
        }
        let ctx = CompactionContext {
            transaction: AiTransaction::new(
                "run-drop",
                Arc::new(Dropper),
                Arc::new(MemoryCheckpointStore::new()),
                AiRetryConfig {
                    max_retries: 0,
                    retry_delay_ms: 1,
                },
            ),
            seq_source: Arc::new(AtomicU64::new(0)),
            emitter: None,
        };
        let mut timeline = Timeline::new("run", small_config());
        timeline.append(TimelineItemValue::free_text("ephemeral")).await;
        let id = timeline.shrink_oldest(&ctx).await.unwrap().unwrap();

        let item = timeline.get(id).unwrap();
        assert!(item.deleted);
        assert_eq!(item.shrink_result.as_deref(), Some("irrelevant scaffolding"));
        assert!(!timeline.dump(None).contains("ephemeral"));
    }

    #[test]
    fn test_parse_shrink_reply_forms() {
        assert_eq!(
            parse_shrink_reply("plain text summary"),
            ("plain text summary".to_string(), false)
        );
        assert_eq!(
            parse_shrink_reply(r#"{"summary": "s", "drop": true}"#),
            ("s".to_string(), true)
        );
        assert_eq!(
            parse_shrink_reply(r#"{"summary": "keep", "drop": false}"#),
            ("keep".to_string(), false)
        );
        // JSON without a summary key falls back to raw text
        let (text, drop) = parse_shrink_reply(r#"{"other": 1}"#);
        assert!(text.contains("other"));
        assert!(!drop);
    }

    // ── persistence ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_snapshot_restore_roundtrip() {
        let mut timeline = Timeline::new("run", small_config());
        let ctx = ctx();
        push_n(&mut timeline, 5, &ctx).await;

        let snapshot = timeline.snapshot();
        let restored = Timeline::restore(snapshot, small_config()).unwrap();
        assert_eq!(restored.len(), timeline.len());
        assert_eq!(restored.dump(None), timeline.dump(None));
    }

    #[tokio::test]
    async fn test_compaction_shrinks_serialized_size() {
        let config = TimelineConfig {
            full_memory_count: 2,
            item_shrink_threshold: 16,
            total_dump_content_limit: 100_000,
        };
        let mut timeline = Timeline::new("run", config.clone());
        for i in 0..6 {
            timeline
                .append(TimelineItemValue::free_text(&format!(
                    "{i}: {}",
                    "payload ".repeat(40)
                )))
                .await;
        }
        let before = serde_json::to_string(&timeline.snapshot()).unwrap();

        let ctx = ctx();
        timeline.compact(&ctx).await.unwrap();
        let after = serde_json::to_string(&timeline.snapshot()).unwrap();

        // Compacted form is strictly smaller, and restoring it cannot bring
        // a compacted item's original content back
        assert!(after.len() < before.len());
        assert!(timeline.get(0).unwrap().is_shrunk());
        let restored = Timeline::restore(timeline.snapshot(), config).unwrap();
        let reserialized = serde_json::to_string(&restored.snapshot()).unwrap();
        assert!(!reserialized.contains("0: payload"));
        assert!(reserialized.contains("summary#"));
    }

    #[tokio::test]
    async fn test_snapshot_excludes_deleted_items() {
        let mut timeline = Timeline::new("run", small_config());
        timeline.append(TimelineItemValue::free_text("alive")).await;
        timeline.append(TimelineItemValue::free_text("gone")).await;
        timeline.items.get_mut(&1).unwrap().deleted = true;

        let snapshot = timeline.snapshot();
        assert_eq!(snapshot.items.len(), 1);
        assert_eq!(snapshot.items[0].item.id, 0);
    }

    #[tokio::test]
    async fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timeline.json");

        let mut timeline = Timeline::new("run", small_config());
        timeline.append(TimelineItemValue::free_text("persist me")).await;
        timeline.save_to_file(&path).await.unwrap();

        let loaded = Timeline::load_from_file(&path, small_config()).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.dump(None).contains("persist me"));
    }

    // ── id reassignment ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_reassign_ids_preserves_time_order() {
        let mut timeline = Timeline::new("run", small_config());
        timeline.append(TimelineItemValue::free_text("first")).await;
        timeline.append(TimelineItemValue::free_text("second")).await;
        timeline.append(TimelineItemValue::free_text("third")).await;

        let mut next = 100;
        timeline
            .reassign_ids(|| {
                next += 1;
                next
            })
            .unwrap();

        assert_eq!(timeline.ids_in_time_order(), vec![101, 102, 103]);
        let dump = timeline.dump(None);
        let first = dump.find("first").unwrap();
        let third = dump.find("third").unwrap();
        assert!(first < third);
    }

    #[tokio::test]
    async fn test_reassign_ids_remaps_summaries_and_reducers() {
        let mut timeline = Timeline::new("run", small_config());
        let ctx = ctx();
        push_n(&mut timeline, 12, &ctx).await;
        let had_reducer = timeline.reducer_boundary().is_some();
        assert!(had_reducer);
        let summary_count = timeline.summaries.len();

        let mut next = 1000;
        timeline
            .reassign_ids(|| {
                next += 1;
                next
            })
            .unwrap();

        // The reducer boundary drew an id older than every item
        let boundary = timeline.reducer_boundary().unwrap();
        assert!(timeline.items.keys().all(|id| *id > boundary));
        // Summaries follow their items
        assert_eq!(timeline.summaries.len(), summary_count);
        for id in timeline.summaries.keys() {
            assert!(timeline.items.contains_key(id));
        }
    }

    #[tokio::test]
    async fn test_reassign_ids_rejects_duplicates() {
        let mut timeline = Timeline::new("run", small_config());
        timeline.append(TimelineItemValue::free_text("a")).await;
        timeline.append(TimelineItemValue::free_text("b")).await;
        let result = timeline.reassign_ids(|| 7);
        assert!(matches!(result, Err(LoomError::Timeline(_))));
    }
}
