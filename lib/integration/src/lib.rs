//! Channel integration for switchboard.
//!
//! This crate provides:
//!
//! - **Events**: the inbound message model and provider input composition
//! - **Connectors**: reply delivery and business-record correlation adapters
//! - **Remote tools**: catalog-driven tools that forward to HTTP endpoints
//! - **Queue**: deferred turns over a JetStream work-queue stream
//! - **Dispatcher**: the per-event pipeline from webhook to reply

pub mod connector;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod queue;
pub mod remote_tool;

pub use connector::{
    DeliveryAdapter, DeliveryRecord, HttpDeliveryAdapter, HttpEndpoint, HttpRecordCorrelator,
    LogDeliveryAdapter, NoopCorrelator, RecordCorrelator,
};
pub use dispatcher::{
    DispatchOutcome, DispatchSettings, DispatcherParts, InboundDispatcher, SkipReason, TurnOutcome,
};
pub use error::{ConnectorError, DispatchError, QueueError};
pub use event::{Direction, InboundEvent, RecordReference, detect_language};
pub use queue::{JobHandler, JobQueue, NatsJobQueue, TurnJob};
pub use remote_tool::{RemoteTool, load_registry};
