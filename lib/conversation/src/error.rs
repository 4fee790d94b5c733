//! Error types for the conversation crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `StoreError`: Errors from key-value bucket operations
//! - `ToolError`: Errors from tool execution
//! - `ConversationError`: Terminal failures of a turn, wrapping the above

use std::fmt;

/// Errors from key-value bucket operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Could not reach or open the backing store.
    ConnectionFailed { reason: String },
    /// Reading a key failed.
    ReadFailed {
        bucket: String,
        key: String,
        reason: String,
    },
    /// Writing a key failed.
    WriteFailed {
        bucket: String,
        key: String,
        reason: String,
    },
    /// A stored value could not be decoded.
    Corrupt {
        bucket: String,
        key: String,
        reason: String,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { reason } => {
                write!(f, "store connection failed: {reason}")
            }
            Self::ReadFailed {
                bucket,
                key,
                reason,
            } => write!(f, "failed to read '{key}' from {bucket}: {reason}"),
            Self::WriteFailed {
                bucket,
                key,
                reason,
            } => write!(f, "failed to write '{key}' to {bucket}: {reason}"),
            Self::Corrupt {
                bucket,
                key,
                reason,
            } => write!(f, "corrupt value for '{key}' in {bucket}: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from tool execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// Tool execution failed.
    ExecutionFailed { name: String, reason: String },
    /// Invalid tool input.
    InvalidInput { name: String, reason: String },
    /// Tool did not finish within its time limit.
    Timeout { name: String, after_secs: u64 },
    /// Tool panicked.
    Panicked { name: String },
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecutionFailed { name, reason } => {
                write!(f, "tool '{name}' execution failed: {reason}")
            }
            Self::InvalidInput { name, reason } => {
                write!(f, "invalid input for tool '{name}': {reason}")
            }
            Self::Timeout { name, after_secs } => {
                write!(f, "tool '{name}' timed out after {after_secs}s")
            }
            Self::Panicked { name } => write!(f, "tool '{name}' panicked"),
        }
    }
}

impl std::error::Error for ToolError {}

/// Terminal failures of a conversation turn.
///
/// Use these to add context when wrapping lower-level errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationError {
    /// Missing credentials or model; not retried.
    Configuration,
    /// The provider rejected or failed a request.
    Provider,
    /// The provider never produced a final answer within the iteration cap.
    LoopExceeded { max: u32 },
    /// The turn budget ran out with nothing recoverable.
    TimeoutExceeded,
    /// A store operation failed (use as context wrapper).
    Store { operation: &'static str },
    /// Another process kept committing to the session while this turn ran.
    Conflict { attempts: u32 },
}

impl fmt::Display for ConversationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "conversation engine is misconfigured"),
            Self::Provider => write!(f, "provider request failed"),
            Self::LoopExceeded { max } => {
                write!(f, "tool loop exceeded {max} iterations")
            }
            Self::TimeoutExceeded => write!(f, "conversation turn timed out"),
            Self::Store { operation } => write!(f, "store operation '{operation}' failed"),
            Self::Conflict { attempts } => {
                write!(f, "continuation changed concurrently on each of {attempts} attempts")
            }
        }
    }
}

impl std::error::Error for ConversationError {}
