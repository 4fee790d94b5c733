//! Error types for the integration crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `ConnectorError`: Errors from outbound delivery, correlation and tool endpoints
//! - `QueueError`: Errors from the deferred job queue
//! - `DispatchError`: Failures of inbound event handling

use std::fmt;

/// Errors from calls to external services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// Connection to service failed.
    ConnectionFailed { reason: String },
    /// The service answered with an error status.
    Rejected { status: u16, body: String },
    /// The service answered with something we could not read.
    ProtocolError { reason: String },
    /// Invalid adapter configuration.
    InvalidConfig { reason: String },
    /// Timeout waiting for response.
    Timeout,
}

impl fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { reason } => {
                write!(f, "connection failed: {reason}")
            }
            Self::Rejected { status, body } => {
                write!(f, "request rejected with status {status}: {body}")
            }
            Self::ProtocolError { reason } => {
                write!(f, "protocol error: {reason}")
            }
            Self::InvalidConfig { reason } => {
                write!(f, "invalid connector configuration: {reason}")
            }
            Self::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl std::error::Error for ConnectorError {}

/// Errors from the deferred job queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Could not create or reach the stream.
    Unavailable { reason: String },
    /// Publishing a job failed.
    PublishFailed { reason: String },
    /// Pulling or acknowledging jobs failed.
    ConsumeFailed { reason: String },
    /// A job payload could not be encoded or decoded.
    InvalidJob { reason: String },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { reason } => write!(f, "job queue unavailable: {reason}"),
            Self::PublishFailed { reason } => write!(f, "failed to enqueue job: {reason}"),
            Self::ConsumeFailed { reason } => write!(f, "failed to consume jobs: {reason}"),
            Self::InvalidJob { reason } => write!(f, "invalid job payload: {reason}"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Failures of inbound event handling (use as context wrapper).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// A store read or write failed before the turn could run.
    State { operation: &'static str },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State { operation } => write!(f, "state operation '{operation}' failed"),
        }
    }
}

impl std::error::Error for DispatchError {}
