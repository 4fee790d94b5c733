//! Error types for the AI crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `LlmError`: Provider adapter failures (configuration and requests)
//! - `CoordinateError`: Terminal outcomes of the tool-calling loop

use std::fmt;

/// Errors from provider adapter operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// Provider is unreachable or failing on its side.
    ProviderUnavailable { provider: String, reason: String },
    /// Provider rejected the request.
    RequestFailed { status: Option<u16>, reason: String },
    /// Response parsing failed.
    ResponseParseFailed { reason: String },
    /// Timeout waiting for response.
    Timeout,
    /// Rate limit exceeded.
    RateLimited { retry_after_secs: Option<u64> },
    /// Missing credentials or model.
    InvalidConfig { reason: String },
}

impl LlmError {
    /// Returns true for configuration problems that no retry will fix.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::InvalidConfig { .. })
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderUnavailable { provider, reason } => {
                write!(f, "LLM provider '{provider}' unavailable: {reason}")
            }
            Self::RequestFailed { status, reason } => match status {
                Some(status) => write!(f, "LLM request failed with status {status}: {reason}"),
                None => write!(f, "LLM request failed: {reason}"),
            },
            Self::ResponseParseFailed { reason } => {
                write!(f, "failed to parse LLM response: {reason}")
            }
            Self::Timeout => write!(f, "LLM request timed out"),
            Self::RateLimited { retry_after_secs } => {
                if let Some(secs) = retry_after_secs {
                    write!(f, "rate limited, retry after {secs}s")
                } else {
                    write!(f, "rate limited")
                }
            }
            Self::InvalidConfig { reason } => {
                write!(f, "invalid LLM configuration: {reason}")
            }
        }
    }
}

impl std::error::Error for LlmError {}

/// Terminal failures of the tool-calling loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinateError {
    /// The provider kept requesting tools through the last allowed call.
    MaxIterationsExceeded { max: u32 },
    /// The wall-clock budget ran out and no partial text was recoverable.
    TimeoutExceeded { budget_secs: u64, iterations: u32 },
    /// A provider call failed (use as context wrapper over `LlmError`).
    Provider { iteration: u32 },
    /// The provider adapter is misconfigured (use as context wrapper).
    Configuration,
}

impl fmt::Display for CoordinateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxIterationsExceeded { max } => {
                write!(f, "no final answer after {max} provider calls")
            }
            Self::TimeoutExceeded {
                budget_secs,
                iterations,
            } => {
                write!(
                    f,
                    "turn exceeded its {budget_secs}s budget after {iterations} provider calls"
                )
            }
            Self::Provider { iteration } => {
                write!(f, "provider call {iteration} failed")
            }
            Self::Configuration => write!(f, "provider adapter is misconfigured"),
        }
    }
}

impl std::error::Error for CoordinateError {}
