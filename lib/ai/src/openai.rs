//! OpenAI Responses API adapter.
//!
//! Conversation state lives on the provider side: each response id is the
//! continuation token and is passed back as `previous_response_id`.

use crate::backend::{ContinuationToken, LlmBackend, LlmBackendConfig, ProviderRequest, ProviderResponse};
use crate::error::LlmError;
use crate::message::{InputItem, OutputItem, RawToolCall, ToolCall};
use async_trait::async_trait;
use reqwest::StatusCode;
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, instrument, warn};

const PROVIDER_NAME: &str = "openai";

/// Responses API client.
pub struct OpenAiBackend {
    client: reqwest::Client,
    config: LlmBackendConfig,
    api_key: String,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .finish_non_exhaustive()
    }
}

impl OpenAiBackend {
    /// Creates a backend after validating its configuration.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::InvalidConfig` if the API key or model is missing
    /// or the HTTP client cannot be built.
    pub fn new(config: LlmBackendConfig) -> Result<Self, Report<LlmError>> {
        config.validate()?;
        let api_key = config.api_key.clone().unwrap_or_default();

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LlmError::InvalidConfig {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn build_body(request: &ProviderRequest) -> ApiRequest<'_> {
        ApiRequest {
            model: &request.model,
            input: request.input.iter().map(encode_input).collect(),
            tools: &request.tools,
            previous_response_id: request.continuation.as_ref().map(ContinuationToken::as_str),
        }
    }

    async fn read_response(response: reqwest::Response) -> Result<ApiResponse, Report<LlmError>> {
        let status = response.status();
        if !status.is_success() {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body, retry_after_secs).into());
        }

        let parsed = response
            .json::<ApiResponse>()
            .await
            .map_err(|e| LlmError::ResponseParseFailed {
                reason: e.to_string(),
            })?;
        Ok(parsed)
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    #[instrument(skip(self, request), fields(model = %request.model, items = request.input.len()))]
    async fn respond(&self, request: &ProviderRequest) -> Result<ProviderResponse, Report<LlmError>> {
        let response = self
            .client
            .post(self.url("responses"))
            .bearer_auth(&self.api_key)
            .json(&Self::build_body(request))
            .send()
            .await
            .map_err(transport_error)?;

        let api_response = Self::read_response(response).await?;
        debug!(response_id = %api_response.id, "provider responded");

        Ok(ProviderResponse {
            continuation: ContinuationToken::new(api_response.id),
            model: api_response.model.unwrap_or_else(|| request.model.clone()),
            output: decode_output(api_response.output),
        })
    }

    #[instrument(skip(self, token), fields(response_id = %token.short()))]
    async fn retrieve_text(
        &self,
        token: &ContinuationToken,
    ) -> Result<Option<String>, Report<LlmError>> {
        let response = self
            .client
            .get(self.url(&format!("responses/{}", token.as_str())))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport_error)?;

        let api_response = Self::read_response(response).await?;
        let texts: Vec<String> = decode_output(api_response.output)
            .into_iter()
            .filter_map(|item| match item {
                OutputItem::Text(text) => Some(text),
                _ => None,
            })
            .collect();

        Ok((!texts.is_empty()).then(|| texts.join("\n")))
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    input: Vec<JsonValue>,
    #[serde(skip_serializing_if = "<[JsonValue]>::is_empty")]
    tools: &'a [JsonValue],
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_response_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    id: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    output: Vec<JsonValue>,
}

fn encode_input(item: &InputItem) -> JsonValue {
    match item {
        InputItem::System { text } => json!({
            "role": "system",
            "content": [{"type": "input_text", "text": text}],
        }),
        InputItem::User { text } => json!({
            "role": "user",
            "content": [{"type": "input_text", "text": text}],
        }),
        InputItem::ToolOutput {
            correlation_id,
            output,
        } => json!({
            "type": "function_call_output",
            "call_id": correlation_id,
            "output": output,
        }),
    }
}

/// Flattens message content and decodes tool calls, preserving order.
fn decode_output(items: Vec<JsonValue>) -> Vec<OutputItem> {
    let mut output = Vec::new();
    for item in items {
        let kind = item
            .get("type")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        match kind.as_str() {
            "message" => {
                let content = item
                    .get("content")
                    .and_then(JsonValue::as_array)
                    .cloned()
                    .unwrap_or_default();
                output.extend(decode_output(content));
            }
            "output_text" | "text" => {
                if let Some(text) = item.get("text").and_then(JsonValue::as_str) {
                    output.push(OutputItem::Text(text.to_string()));
                }
            }
            "function_call" | "tool_use" | "function" => output.push(decode_tool_call(item)),
            other => debug!(item_type = other, "ignoring output item"),
        }
    }
    output
}

fn decode_tool_call(item: JsonValue) -> OutputItem {
    let correlation_id = ["call_id", "id"]
        .iter()
        .find_map(|key| item.get(*key).and_then(JsonValue::as_str))
        .unwrap_or_default()
        .to_string();
    let name = item
        .get("name")
        .or_else(|| item.pointer("/function/name"))
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string();

    let decoded = serde_json::from_value::<RawToolCall>(item)
        .map_err(|e| crate::message::ToolCallShapeError {
            correlation_id,
            name,
            reason: format!("unrecognized tool call shape: {e}"),
        })
        .and_then(ToolCall::try_from);

    match decoded {
        Ok(call) => OutputItem::ToolCall(call),
        Err(err) => {
            warn!(tool = %err.name, reason = %err.reason, "could not decode tool call");
            OutputItem::MalformedToolCall(err)
        }
    }
}

fn transport_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::ProviderUnavailable {
            provider: PROVIDER_NAME.to_string(),
            reason: e.to_string(),
        }
    }
}

fn status_error(status: StatusCode, body: String, retry_after_secs: Option<u64>) -> LlmError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited { retry_after_secs },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::InvalidConfig {
            reason: format!("provider rejected credentials ({status})"),
        },
        s if s.is_server_error() => LlmError::ProviderUnavailable {
            provider: PROVIDER_NAME.to_string(),
            reason: format!("{status}: {body}"),
        },
        s => LlmError::RequestFailed {
            status: Some(s.as_u16()),
            reason: body,
        },
    }
}
