//! Output event type.
//!
//! The sole observable surface exposed to UI/telemetry collaborators. Events
//! are typed by a string tag; consumers must treat unknown tags as opaque and
//! forward them unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A typed, JSON-content output event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputEvent {
    /// The runtime instance that produced the event
    pub coordinator_id: String,
    /// Event type tag (e.g. "endpoint.released", "timeline.shrink")
    pub event_type: String,
    /// Originating node within the runtime, if any
    #[serde(default)]
    pub node_id: String,
    /// Whether this event is part of a streamed sequence
    #[serde(default)]
    pub streaming: bool,
    /// When the event was produced
    pub timestamp: DateTime<Utc>,
    /// Event payload
    pub content: Value,
}

impl OutputEvent {
    /// Create an event stamped now.
    pub fn new(coordinator_id: &str, event_type: &str, content: Value) -> Self {
        Self {
            coordinator_id: coordinator_id.to_string(),
            event_type: event_type.to_string(),
            node_id: String::new(),
            streaming: false,
            timestamp: Utc::now(),
            content,
        }
    }

    /// Set the originating node (builder pattern).
    pub fn with_node(mut self, node_id: &str) -> Self {
        self.node_id = node_id.to_string();
        self
    }

    /// Mark the event as part of a streamed sequence (builder pattern).
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    // ------------------------------------------------------------------
    // Standard event constructors
    // ------------------------------------------------------------------

    /// An endpoint was released with a decision payload.
    pub fn endpoint_released(coordinator_id: &str, endpoint_id: &str, decision: Value) -> Self {
        Self::new(
            coordinator_id,
            "endpoint.released",
            json!({ "endpoint_id": endpoint_id, "decision": decision }),
        )
    }

    /// A timeline item was shrunk to a summary.
    pub fn timeline_shrink(coordinator_id: &str, item_id: u64, summary: &str) -> Self {
        Self::new(
            coordinator_id,
            "timeline.shrink",
            json!({ "item_id": item_id, "summary": summary }),
        )
    }

    /// A timeline prefix was reduced to a single narrative.
    pub fn timeline_reduce(coordinator_id: &str, boundary_id: u64) -> Self {
        Self::new(
            coordinator_id,
            "timeline.reduce",
            json!({ "boundary_id": boundary_id }),
        )
    }

    /// A streamed action finished decoding.
    pub fn decode_done(coordinator_id: &str, action_name: &str) -> Self {
        Self::new(
            coordinator_id,
            "decode.done",
            json!({ "action": action_name }),
        )
    }
}
