//! Conversation orchestration for switchboard.
//!
//! This crate provides:
//!
//! - **Stores**: session, continuation, human-activity and language maps
//!   over an atomic per-key bucket (in memory or NATS JetStream KV)
//! - **Tool Registry / Dispatcher**: the startup tool catalog and the
//!   sanitizing, failure-absorbing invocation path
//! - **Deduplicator**: at-most-once registration of inbound event ids
//! - **Handoff Gate**: suppression of automated replies while a human
//!   operator is active
//! - **Engine**: one serialized tool-calling turn per session

pub mod dedup;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod handoff;
pub mod nats;
pub mod store;
pub mod tool;

pub use dedup::{MessageDeduplicator, fallback_event_id};
pub use dispatch::{SanitizePolicy, ToolDispatcher};
pub use engine::{COMMIT_ATTEMPTS, ConversationEngine, Reply, SessionSummary};
pub use error::{ConversationError, StoreError, ToolError};
pub use handoff::{DEFAULT_COOLDOWN, HandoffGate};
pub use nats::{NatsConfig, NatsKvBucket};
pub use store::{
    ContinuationSnapshot, ContinuationStore, ConversationStores, HumanActivityStore,
    InMemoryBucket, KvBucket, LanguageStore, SessionRecord, SessionStore, Versioned,
};
pub use tool::{Tool, ToolContext, ToolDefinition, ToolRegistry};
