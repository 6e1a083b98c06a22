//! Streaming action decoder.
//!
//! Pulls a chunked text stream (an LLM response as it arrives) through a
//! structural JSON scanner and the out-of-band tag scanner, and populates an
//! [`Action`] progressively: callers read fields while the stream is still
//! in flight.
//!
//! Recognition: pairs are buffered until an `@action` key whose value (or,
//! when the value is an object, any of its string values) matches the target
//! name or an alias. From that point every pair commits straight through the
//! field latches, and the completed object also commits under the
//! whole-object key. A stream that ends without recognition fails with
//! [`LoomError::ActionNotFound`] carrying a truncated echo of the input.

pub mod action;
pub mod scanner;
pub mod tags;

pub use action::{Action, JsonMap, Params};
pub use scanner::{JsonScanner, ScanEvent};
pub use tags::TagScanner;

use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{LoomError, Result};

/// The key whose value names the action being emitted.
pub const ACTION_KEY: &str = "@action";

/// Default whole-object key.
pub const DEFAULT_WHOLE_KEY: &str = "@object";

/// Bytes of consumed input echoed back in a not-found error.
const ECHO_LIMIT: usize = 512;

/// What to decode out of the stream.
#[derive(Debug, Clone)]
pub struct DecodeRequest {
    /// The action name to recognize
    pub target: String,
    /// Accepted aliases for the target
    pub aliases: Vec<String>,
    /// Per-invocation disambiguator for out-of-band tag blocks
    pub nonce: String,
    /// Key the full parameter object commits under
    pub whole_key: String,
}

impl DecodeRequest {
    /// Decode request for `target` with no aliases and an empty nonce.
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            aliases: Vec::new(),
            nonce: String::new(),
            whole_key: DEFAULT_WHOLE_KEY.to_string(),
        }
    }

    /// Accept these aliases as well (builder pattern).
    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Use this correlation nonce for tag blocks (builder pattern).
    pub fn with_nonce(mut self, nonce: &str) -> Self {
        self.nonce = nonce.to_string();
        self
    }

    /// Commit the full object under this key instead (builder pattern).
    pub fn with_whole_key(mut self, key: &str) -> Self {
        self.whole_key = key.to_string();
        self
    }

    fn matches(&self, candidate: &str) -> bool {
        candidate == self.target || self.aliases.iter().any(|a| a == candidate)
    }

    /// The matched name if `value` recognizes this request: either the value
    /// itself (string form) or any string inside it (object form).
    fn recognize(&self, value: &Value) -> Option<String> {
        match value {
            Value::String(s) if self.matches(s) => Some(s.clone()),
            Value::Object(map) => map.values().find_map(|v| match v {
                Value::String(s) if self.matches(s) => Some(s.clone()),
                _ => None,
            }),
            _ => None,
        }
    }
}

/// A running decode: the progressively-populated action plus the worker.
pub struct DecodeHandle {
    /// The action; fields become readable as the stream arrives
    pub action: Arc<Action>,
    /// The decode worker. Resolves `Ok` on recognition + stream end, or
    /// `Err(ActionNotFound)` when the stream ends unrecognized.
    pub worker: JoinHandle<Result<()>>,
}

/// Entry point for streamed action decoding.
pub struct ActionDecoder;

impl ActionDecoder {
    /// Spawn a decode worker over `chunks`.
    ///
    /// The returned action is usable immediately; readers block per field.
    /// Cancelling `cancel` stops the worker and unblocks every pending read
    /// valuelessly (not an error).
    pub fn spawn(
        chunks: mpsc::Receiver<String>,
        request: DecodeRequest,
        cancel: CancellationToken,
    ) -> DecodeHandle {
        let action = Arc::new(Action::new(&request.whole_key));
        let worker_action = Arc::clone(&action);
        let worker = tokio::spawn(run_decode(chunks, request, cancel, worker_action));
        DecodeHandle { action, worker }
    }

    /// Decode a complete, already-buffered response.
    ///
    /// Convenience for callers that do not stream: feeds the whole text as
    /// one chunk and waits for the worker.
    pub async fn decode_text(
        text: &str,
        request: DecodeRequest,
        cancel: CancellationToken,
    ) -> Result<Arc<Action>> {
        let (tx, rx) = mpsc::channel(1);
        tx.send(text.to_string())
            .await
            .map_err(|_| LoomError::ChannelClosed)?;
        drop(tx);
        let handle = Self::spawn(rx, request, cancel);
        handle.worker.await.map_err(|e| {
            LoomError::Decode(format!("decode worker panicked: {e}"))
        })??;
        Ok(handle.action)
    }
}

/// Per-stream decode state: recognition, buffered pairs, pending tag plumbing.
struct DecodeState {
    request: DecodeRequest,
    action: Arc<Action>,
    recognized: bool,
    /// Pairs seen before recognition, replayed once the action matches
    buffered: Vec<(String, Value)>,
    /// Committed values still holding unresolved placeholders, latch open
    awaiting_tags: HashMap<String, Value>,
    /// tag -> field keys whose value references it
    tag_fields: HashMap<String, Vec<String>>,
    /// Tag contents resolved so far
    resolved: HashMap<String, String>,
}

impl DecodeState {
    fn new(request: DecodeRequest, action: Arc<Action>) -> Self {
        Self {
            request,
            action,
            recognized: false,
            buffered: Vec::new(),
            awaiting_tags: HashMap::new(),
            tag_fields: HashMap::new(),
            resolved: HashMap::new(),
        }
    }

    fn on_scan_event(&mut self, event: ScanEvent) {
        match event {
            ScanEvent::Pair { key, value } => {
                if self.recognized {
                    self.commit(&key, value);
                    return;
                }
                if key == ACTION_KEY {
                    if let Some(name) = self.request.recognize(&value) {
                        debug!(action = %name, "action recognized in stream");
                        self.recognized = true;
                        self.action.set_name(&name);
                        self.commit(ACTION_KEY, value);
                        let buffered = std::mem::take(&mut self.buffered);
                        for (k, v) in buffered {
                            self.commit(&k, v);
                        }
                        return;
                    }
                }
                self.buffered.push((key, value));
            }
            ScanEvent::ObjectDone { value } => {
                if self.recognized {
                    let whole_key = self.request.whole_key.clone();
                    self.commit(&whole_key, value);
                }
            }
        }
    }

    /// Commit one field. Values still referencing unresolved tags keep their
    /// latch open until the tag blocks arrive (or the stream ends).
    fn commit(&mut self, key: &str, mut value: Value) {
        for (tag, content) in &self.resolved {
            tags::substitute(&mut value, tag, content);
        }
        let pending: BTreeSet<String> = tags::tags_of(&value)
            .into_iter()
            .filter(|t| !self.resolved.contains_key(t))
            .collect();
        if pending.is_empty() {
            self.action.set(key, value);
            return;
        }
        for tag in pending {
            self.tag_fields.entry(tag).or_default().push(key.to_string());
        }
        self.awaiting_tags.insert(key.to_string(), value);
    }

    /// A tag block completed: substitute it into every field waiting on it
    /// and close latches that have nothing further pending.
    fn on_tag(&mut self, tag: &str, content: &str) {
        self.resolved.insert(tag.to_string(), content.to_string());
        let Some(keys) = self.tag_fields.remove(tag) else {
            return;
        };
        for key in keys {
            let Some(mut value) = self.awaiting_tags.remove(&key) else {
                continue;
            };
            tags::substitute(&mut value, tag, content);
            let still_pending = tags::tags_of(&value)
                .into_iter()
                .any(|t| !self.resolved.contains_key(&t));
            if still_pending {
                self.awaiting_tags.insert(key, value);
            } else {
                self.action.set(&key, value);
            }
        }
    }

    /// Stream over: flush fields still waiting on tags with what they have.
    /// Their placeholders stay unresolved (best-effort, never an error).
    fn flush(&mut self) {
        for (key, value) in std::mem::take(&mut self.awaiting_tags) {
            self.action.set(&key, value);
        }
    }
}

async fn run_decode(
    mut chunks: mpsc::Receiver<String>,
    request: DecodeRequest,
    cancel: CancellationToken,
    action: Arc<Action>,
) -> Result<()> {
    let mut json_scanner = JsonScanner::new();
    let mut tag_scanner = TagScanner::new(&request.nonce);
    let mut state = DecodeState::new(request, Arc::clone(&action));

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("decode cancelled, unblocking readers");
                state.flush();
                action.finish();
                return Ok(());
            }
            chunk = chunks.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };

        let mut scan_events = Vec::new();
        json_scanner.feed(&chunk, |e| scan_events.push(e));
        for event in scan_events {
            state.on_scan_event(event);
        }

        let mut blocks = Vec::new();
        tag_scanner.feed(&chunk, |tag, content| {
            blocks.push((tag.to_string(), content.to_string()))
        });
        for (tag, content) in blocks {
            state.on_tag(&tag, &content);
        }
    }

    json_scanner.finish();
    tag_scanner.finish();
    state.flush();
    action.finish();

    if !state.recognized {
        let consumed = json_scanner.consumed();
        let echo: String = consumed.chars().take(ECHO_LIMIT).collect();
        return Err(LoomError::ActionNotFound { echo });
    }
    Ok(())
}
