//! Generative-model primitives for switchboard.
//!
//! This crate provides:
//!
//! - **Backend**: the provider adapter seam and its request/response types
//! - **Messages**: canonical tool calls and the raw shapes they decode from
//! - **Coordinate**: the bounded, iterative tool-calling loop
//! - **OpenAI**: an HTTP adapter for the Responses API

pub mod backend;
pub mod coordinate;
pub mod error;
pub mod message;
pub mod openai;

pub use backend::{
    ContinuationToken, DEFAULT_MODEL, LlmBackend, LlmBackendConfig, ProviderRequest,
    ProviderResponse,
};
pub use coordinate::{
    CoordinateConfig, CoordinateOutcome, Coordinator, DEFAULT_MAX_ITERATIONS,
    DEFAULT_TURN_TIMEOUT, ToolExecutor,
};
pub use error::{CoordinateError, LlmError};
pub use message::{InputItem, OutputItem, RawToolCall, ToolCall, ToolCallShapeError, ToolResult};
pub use openai::OpenAiBackend;
