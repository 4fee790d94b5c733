//! Provider adapter abstraction.
//!
//! An [`LlmBackend`] turns one [`ProviderRequest`] into one
//! [`ProviderResponse`]. Adapters are responsible for decoding every tool
//! call shape their provider emits into canonical [`OutputItem`]s.

use crate::error::LlmError;
use crate::message::{InputItem, OutputItem, ToolCall};
use async_trait::async_trait;
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::time::Duration;

/// Default model when none is configured.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Opaque provider-issued value that resumes a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    /// Wraps a provider token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the token is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A prefix suitable for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(20) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Configuration for a provider adapter.
#[derive(Clone, Serialize, Deserialize)]
pub struct LlmBackendConfig {
    /// Base URL for the API.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// API key.
    pub api_key: Option<String>,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
}

impl std::fmt::Debug for LlmBackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmBackendConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl LlmBackendConfig {
    /// Creates an OpenAI configuration with the default model.
    #[must_use]
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: Some(api_key.into()),
            request_timeout: Duration::from_secs(60),
        }
    }

    /// Overrides the base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Overrides the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Overrides the per-request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Checks that credentials and model are present.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::InvalidConfig` naming the first missing value.
    pub fn validate(&self) -> Result<(), Report<LlmError>> {
        if self.api_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
            return Err(LlmError::InvalidConfig {
                reason: "API key is not configured".to_string(),
            }
            .into());
        }
        if self.model.trim().is_empty() {
            return Err(LlmError::InvalidConfig {
                reason: "model is not configured".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// One call to the provider.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Model identifier.
    pub model: String,
    /// Ordered input turns.
    pub input: Vec<InputItem>,
    /// Tool schema catalog.
    pub tools: Vec<JsonValue>,
    /// Resumption point, if the conversation has one.
    pub continuation: Option<ContinuationToken>,
}

/// The provider's answer to one [`ProviderRequest`].
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// Token that resumes the conversation after this response.
    pub continuation: ContinuationToken,
    /// Model that produced the response.
    pub model: String,
    /// Ordered output items.
    pub output: Vec<OutputItem>,
}

impl ProviderResponse {
    /// Text fragments in emission order.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.output.iter().filter_map(|item| match item {
            OutputItem::Text(text) => Some(text.as_str()),
            _ => None,
        })
    }

    /// Decoded tool calls in emission order.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.output.iter().filter_map(|item| match item {
            OutputItem::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    /// Returns true if the response requests any tool, well-formed or not.
    #[must_use]
    pub fn requests_tools(&self) -> bool {
        self.output
            .iter()
            .any(|item| !matches!(item, OutputItem::Text(_)))
    }
}

/// Trait for provider adapters.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Submits one request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be made or is rejected.
    async fn respond(&self, request: &ProviderRequest) -> Result<ProviderResponse, Report<LlmError>>;

    /// Best-effort fetch of the assistant text already produced under
    /// `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup itself fails.
    async fn retrieve_text(
        &self,
        _token: &ContinuationToken,
    ) -> Result<Option<String>, Report<LlmError>> {
        Ok(None)
    }

    /// Returns the configured model name.
    fn model(&self) -> &str;
}
