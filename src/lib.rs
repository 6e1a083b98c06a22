//! Agentloom - concurrency and state substrate for LLM agent runtimes
//!
//! Four tightly coupled subsystems:
//!
//! - [`decoder`]: decodes a named action out of a streamed, loosely-formed
//!   JSON document while it is still arriving, with an out-of-band tag
//!   protocol for transporting unescaped text alongside the JSON.
//! - [`endpoint`]: suspend-for-approval rendezvous points bound to durable
//!   [`checkpoint`] records, so a decision survives process restart.
//! - [`timeline`]: bounded execution history with AI-assisted shrink/reduce
//!   compaction.
//! - [`guardian`]: asynchronous event dispatch to type-keyed triggers and
//!   passive mirror observers.
//!
//! [`runtime::RuntimeContext`] bundles the ambient capabilities (identity,
//! sequence source, AI client, checkpoint store, cancellation) one agent run
//! needs to drive all four.

pub mod ai;
pub mod checkpoint;
pub mod config;
pub mod decoder;
pub mod endpoint;
pub mod error;
pub mod guardian;
pub mod runtime;
pub mod signal;
pub mod timeline;
pub mod utils;

pub use ai::{AiClient, AiReply, AiRequest, AiTransaction};
pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::LoomConfig;
pub use decoder::{Action, ActionDecoder, DecodeRequest, JsonMap, Params};
pub use endpoint::{Endpoint, EndpointManager};
pub use error::{AiError, LoomError, Result};
pub use guardian::{Emitter, EventTrigger, Guardian, OutputEvent, TriggerContext};
pub use runtime::RuntimeContext;
pub use signal::Rendezvous;
pub use timeline::{Timeline, TimelineItem, TimelineItemValue};
