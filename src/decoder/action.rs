//! Decoded actions and their field latches.
//!
//! An [`Action`] is the progressively-populated result of decoding a streamed
//! JSON document: a name plus an ordered parameter map where each field sits
//! behind a one-time-closing latch. Readers block until the field arrives, the
//! stream ends, or the ambient context is cancelled.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Ordered JSON object map (insertion order preserved).
pub type JsonMap = Map<String, Value>;

// ----------------------------------------------------------------------------
// Value coercion helpers
// ----------------------------------------------------------------------------

/// Coerce a JSON value to a string. Strings pass through; numbers and bools
/// render; everything else yields the empty string.
pub fn coerce_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Coerce a JSON value to an i64, defaulting to 0.
pub fn coerce_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().unwrap_or_else(|| {
            n.as_f64().map(|f| f as i64).unwrap_or(0)
        }),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        Value::Bool(b) => *b as i64,
        _ => 0,
    }
}

/// Coerce a JSON value to an f64, defaulting to 0.0.
pub fn coerce_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        Value::Bool(b) => *b as u8 as f64,
        _ => 0.0,
    }
}

/// Coerce a JSON value to a bool, defaulting to false.
pub fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.trim(), "true" | "1" | "yes"),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => false,
    }
}

// ----------------------------------------------------------------------------
// Params
// ----------------------------------------------------------------------------

/// Schema-less ordered parameter container with coerce-and-default accessors.
///
/// Accessors never panic and never fail: a missing or mistyped field yields
/// the type's zero value. Iteration follows insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(JsonMap);

impl Params {
    /// Create an empty parameter map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing JSON object map.
    pub fn from_map(map: JsonMap) -> Self {
        Self(map)
    }

    /// Wrap a JSON value: objects keep their entries, anything else is empty.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(map) => Self(map.clone()),
            _ => Self::default(),
        }
    }

    /// The underlying ordered map.
    pub fn as_map(&self) -> &JsonMap {
        &self.0
    }

    /// Consume into the underlying ordered map.
    pub fn into_map(self) -> JsonMap {
        self.0
    }

    /// Insert a value under `key` (builder pattern friendly).
    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    /// Raw value under `key`, if present.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String under `key`, coerced; empty string if absent.
    pub fn str_of(&self, key: &str) -> String {
        self.0.get(key).map(coerce_str).unwrap_or_default()
    }

    /// i64 under `key`, coerced; 0 if absent.
    pub fn i64_of(&self, key: &str) -> i64 {
        self.0.get(key).map(coerce_i64).unwrap_or(0)
    }

    /// f64 under `key`, coerced; 0.0 if absent.
    pub fn f64_of(&self, key: &str) -> f64 {
        self.0.get(key).map(coerce_f64).unwrap_or(0.0)
    }

    /// bool under `key`, coerced; false if absent.
    pub fn bool_of(&self, key: &str) -> bool {
        self.0.get(key).map(coerce_bool).unwrap_or(false)
    }

    /// Nested object under `key` as `Params`; empty if absent or not an object.
    pub fn object_of(&self, key: &str) -> Params {
        self.0.get(key).map(Params::from_value).unwrap_or_default()
    }

    /// Array under `key`; empty if absent or not an array.
    pub fn array_of(&self, key: &str) -> Vec<Value> {
        match self.0.get(key) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

impl From<Params> for Value {
    fn from(params: Params) -> Self {
        Value::Object(params.0)
    }
}

// ----------------------------------------------------------------------------
// Field latch
// ----------------------------------------------------------------------------

/// One field's slot: its latest value plus the one-shot closed latch.
///
/// The latch closes exactly once; the value may still be overwritten later
/// (last-write-wins), it just never goes back to "unset".
struct FieldSlot {
    value: RwLock<Option<Value>>,
    closed: watch::Sender<bool>,
}

impl FieldSlot {
    fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            value: RwLock::new(None),
            closed,
        }
    }

    fn set(&self, value: Value) {
        {
            let mut slot = self.value.write().expect("field slot lock poisoned");
            *slot = Some(value);
        }
        // Close the latch; a no-op on overwrite since the flag is already true.
        self.closed.send_replace(true);
    }

    fn current(&self) -> Option<Value> {
        self.value.read().expect("field slot lock poisoned").clone()
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

// ----------------------------------------------------------------------------
// Action
// ----------------------------------------------------------------------------

/// A decoded intent: a name plus latched, progressively-arriving fields.
///
/// Produced by the decoder; shared with readers via `Arc`. Readers use the
/// `get*` methods, which block until the field's latch closes or the stream
/// finishes (EOF, decode error, or cancellation). A finished stream unblocks
/// every pending read valuelessly: "no answer", not an error.
pub struct Action {
    name: RwLock<String>,
    whole_key: String,
    slots: RwLock<HashMap<String, Arc<FieldSlot>>>,
    done: watch::Sender<bool>,
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Action {
    /// Create an empty action whose full parameter object will be exposed
    /// under `whole_key`.
    pub fn new(whole_key: &str) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            name: RwLock::new(String::new()),
            whole_key: whole_key.to_string(),
            slots: RwLock::new(HashMap::new()),
            done,
        }
    }

    /// The recognized action name; empty until recognition.
    pub fn name(&self) -> String {
        self.name.read().expect("action name lock poisoned").clone()
    }

    /// The key the full parameter object is committed under.
    pub fn whole_key(&self) -> &str {
        &self.whole_key
    }

    pub(crate) fn set_name(&self, name: &str) {
        let mut slot = self.name.write().expect("action name lock poisoned");
        *slot = name.to_string();
    }

    fn slot(&self, key: &str) -> Arc<FieldSlot> {
        {
            let slots = self.slots.read().expect("action slots lock poisoned");
            if let Some(slot) = slots.get(key) {
                return Arc::clone(slot);
            }
        }
        let mut slots = self.slots.write().expect("action slots lock poisoned");
        Arc::clone(
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(FieldSlot::new())),
        )
    }

    /// Commit a value under `key`, closing its latch if not already closed.
    pub(crate) fn set(&self, key: &str, value: Value) {
        self.slot(key).set(value);
    }

    /// Mark the stream finished, unblocking every pending read.
    pub(crate) fn finish(&self) {
        self.done.send_replace(true);
    }

    /// Whether the owning stream has finished (EOF, error, or cancellation).
    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Whether `key`'s latch has closed.
    pub fn is_ready(&self, key: &str) -> bool {
        let slots = self.slots.read().expect("action slots lock poisoned");
        slots.get(key).map(|s| s.is_closed()).unwrap_or(false)
    }

    /// Non-blocking read of `key`.
    pub fn try_get(&self, key: &str) -> Option<Value> {
        let slots = self.slots.read().expect("action slots lock poisoned");
        slots.get(key).and_then(|s| s.current())
    }

    /// Read `key`, blocking until its latch closes or the stream finishes.
    ///
    /// Returns `None` if the stream finished before the field arrived.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let slot = self.slot(key);
        if slot.is_closed() {
            return slot.current();
        }
        let mut closed = slot.closed.subscribe();
        let mut done = self.done.subscribe();
        tokio::select! {
            _ = closed.wait_for(|v| *v) => {}
            _ = done.wait_for(|v| *v) => {}
        }
        slot.current()
    }

    /// Like [`Action::get`], but also unblocks on cancellation.
    pub async fn get_cancellable(&self, key: &str, cancel: &CancellationToken) -> Option<Value> {
        tokio::select! {
            _ = cancel.cancelled() => self.try_get(key),
            value = self.get(key) => value,
        }
    }

    /// String field, coerced; empty if absent at stream end.
    pub async fn get_str(&self, key: &str) -> String {
        self.get(key).await.map(|v| coerce_str(&v)).unwrap_or_default()
    }

    /// i64 field, coerced; 0 if absent at stream end.
    pub async fn get_i64(&self, key: &str) -> i64 {
        self.get(key).await.map(|v| coerce_i64(&v)).unwrap_or(0)
    }

    /// bool field, coerced; false if absent at stream end.
    pub async fn get_bool(&self, key: &str) -> bool {
        self.get(key).await.map(|v| coerce_bool(&v)).unwrap_or(false)
    }

    /// The full parameter object, available once the wrapping object has
    /// completely parsed. Empty if the stream ended first.
    pub async fn params(&self) -> Params {
        self.get(&self.whole_key)
            .await
            .map(|v| Params::from_value(&v))
            .unwrap_or_default()
    }
}
