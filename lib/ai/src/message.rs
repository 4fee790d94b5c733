//! Turn items exchanged with the provider.
//!
//! Providers have emitted tool calls in more than one shape over time: some
//! carry an already-parsed argument object, others a JSON-encoded string.
//! [`RawToolCall`] accepts every known shape and converts into the single
//! canonical [`ToolCall`] the rest of the system works with.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// One item of input submitted to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputItem {
    /// System instructions.
    System { text: String },
    /// The user's message.
    User { text: String },
    /// The serialized result of a tool call from the previous response.
    ToolOutput {
        correlation_id: String,
        output: String,
    },
}

impl InputItem {
    /// Creates a system item.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self::System { text: text.into() }
    }

    /// Creates a user item.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::User { text: text.into() }
    }
}

impl From<ToolResult> for InputItem {
    fn from(result: ToolResult) -> Self {
        Self::ToolOutput {
            correlation_id: result.correlation_id,
            output: result.output,
        }
    }
}

/// One item of provider output, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputItem {
    /// A text fragment.
    Text(String),
    /// A request to run a tool.
    ToolCall(ToolCall),
    /// A tool request whose payload could not be decoded.
    ///
    /// Still answered with an error result so the model can recover.
    MalformedToolCall(ToolCallShapeError),
}

/// Canonical tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned id that the matching result must echo.
    pub correlation_id: String,
    /// The tool name.
    pub name: String,
    /// Decoded argument object.
    pub arguments: Map<String, JsonValue>,
}

impl ToolCall {
    /// Creates a new tool call.
    #[must_use]
    pub fn new(
        correlation_id: impl Into<String>,
        name: impl Into<String>,
        arguments: Map<String, JsonValue>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Result of one tool call, ready to be fed back to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The tool call this result answers.
    pub correlation_id: String,
    /// Serialized payload.
    pub output: String,
    /// Whether the payload describes a failure.
    pub is_error: bool,
}

impl ToolResult {
    /// Creates a result from a structured payload.
    ///
    /// A payload carrying `"success": false` or an `error` key counts as an
    /// error.
    #[must_use]
    pub fn from_payload(correlation_id: impl Into<String>, payload: &JsonValue) -> Self {
        let is_error = payload.get("success").and_then(JsonValue::as_bool) == Some(false)
            || payload.get("error").is_some_and(|e| !e.is_null());
        let output = match payload {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            correlation_id: correlation_id.into(),
            output,
            is_error,
        }
    }

    /// Creates an error result with the conventional `{error, success}` payload.
    #[must_use]
    pub fn failure(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        let payload = serde_json::json!({ "error": error.into(), "success": false });
        Self::from_payload(correlation_id, &payload)
    }
}

/// A tool call the adapter could not normalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallShapeError {
    /// Correlation id, when the payload carried one.
    pub correlation_id: String,
    /// Tool name, when the payload carried one.
    pub name: String,
    /// Why normalization failed.
    pub reason: String,
}

impl fmt::Display for ToolCallShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "malformed call to tool '{}' ({}): {}",
            self.name, self.correlation_id, self.reason
        )
    }
}

impl std::error::Error for ToolCallShapeError {}

/// The known wire shapes of a tool call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawToolCall {
    /// `{id, name, input: {...}}`, arguments already parsed.
    Parsed {
        id: String,
        name: String,
        input: JsonValue,
    },
    /// `{id, function: {name, arguments: "<json>"}}`.
    Encoded { id: String, function: RawFunction },
    /// `{call_id, name, arguments: "<json>"}`.
    Flat {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: Option<String>,
    },
}

/// Function body of an encoded tool call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawFunction {
    /// The tool name.
    pub name: String,
    /// JSON-encoded arguments; may be absent or empty.
    #[serde(default)]
    pub arguments: Option<String>,
}

impl TryFrom<RawToolCall> for ToolCall {
    type Error = ToolCallShapeError;

    fn try_from(raw: RawToolCall) -> Result<Self, Self::Error> {
        let (correlation_id, name, arguments) = match raw {
            RawToolCall::Parsed { id, name, input } => {
                let arguments = match input {
                    JsonValue::Object(map) => map,
                    JsonValue::Null => Map::new(),
                    other => {
                        return Err(ToolCallShapeError {
                            correlation_id: id,
                            name,
                            reason: format!("input must be an object, got {other}"),
                        });
                    }
                };
                (id, name, arguments)
            }
            RawToolCall::Encoded { id, function } => {
                let arguments = decode_arguments(function.arguments.as_deref())
                    .map_err(|reason| ToolCallShapeError {
                        correlation_id: id.clone(),
                        name: function.name.clone(),
                        reason,
                    })?;
                (id, function.name, arguments)
            }
            RawToolCall::Flat {
                call_id,
                name,
                arguments,
            } => {
                let arguments =
                    decode_arguments(arguments.as_deref()).map_err(|reason| ToolCallShapeError {
                        correlation_id: call_id.clone(),
                        name: name.clone(),
                        reason,
                    })?;
                (call_id, name, arguments)
            }
        };

        Ok(Self {
            correlation_id,
            name,
            arguments,
        })
    }
}

fn decode_arguments(encoded: Option<&str>) -> Result<Map<String, JsonValue>, String> {
    let encoded = encoded.map(str::trim).unwrap_or_default();
    if encoded.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<JsonValue>(encoded) {
        Ok(JsonValue::Object(map)) => Ok(map),
        Ok(other) => Err(format!("arguments must encode an object, got {other}")),
        Err(e) => Err(format!("arguments are not valid JSON: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parsed_and_encoded_shapes_normalize_identically() {
        let parsed: RawToolCall = serde_json::from_value(json!({
            "id": "call_1",
            "name": "search_products",
            "input": {"query": "tiramisù", "qty": 2}
        }))
        .expect("parsed shape");
        let encoded: RawToolCall = serde_json::from_value(json!({
            "id": "call_1",
            "type": "function",
            "function": {
                "name": "search_products",
                "arguments": "{\"query\":\"tiramisù\",\"qty\":2}"
            }
        }))
        .expect("encoded shape");

        assert!(matches!(parsed, RawToolCall::Parsed { .. }));
        assert!(matches!(encoded, RawToolCall::Encoded { .. }));

        let a = ToolCall::try_from(parsed).expect("normalize parsed");
        let b = ToolCall::try_from(encoded).expect("normalize encoded");
        assert_eq!(a, b);
        assert_eq!(a.arguments["qty"], 2);
    }

    #[test]
    fn flat_shape_uses_call_id() {
        let raw: RawToolCall = serde_json::from_value(json!({
            "type": "function_call",
            "id": "fc_9",
            "call_id": "call_9",
            "name": "lookup",
            "arguments": "{\"code\":\"TIR-01\"}"
        }))
        .expect("flat shape");

        let call = ToolCall::try_from(raw).expect("normalize");
        assert_eq!(call.correlation_id, "call_9");
        assert_eq!(call.arguments["code"], "TIR-01");
    }

    #[test]
    fn empty_encoded_arguments_become_empty_object() {
        let raw = RawToolCall::Encoded {
            id: "c".to_string(),
            function: RawFunction {
                name: "ping".to_string(),
                arguments: Some("  ".to_string()),
            },
        };
        let call = ToolCall::try_from(raw).expect("normalize");
        assert!(call.arguments.is_empty());
    }

    #[test]
    fn non_object_arguments_are_rejected() {
        let raw = RawToolCall::Flat {
            call_id: "c".to_string(),
            name: "ping".to_string(),
            arguments: Some("[1,2]".to_string()),
        };
        let err = ToolCall::try_from(raw).unwrap_err();
        assert_eq!(err.name, "ping");
        assert!(err.reason.contains("object"));
    }

    #[test]
    fn tool_result_error_detection() {
        let ok = ToolResult::from_payload("c", &json!({"success": true, "code": "X"}));
        assert!(!ok.is_error);

        let failed = ToolResult::failure("c", "boom");
        assert!(failed.is_error);
        let payload: JsonValue = serde_json::from_str(&failed.output).expect("json output");
        assert_eq!(payload, json!({"error": "boom", "success": false}));
    }

    #[test]
    fn tool_result_becomes_tool_output_input() {
        let item = InputItem::from(ToolResult::from_payload("c1", &json!({"a": 1})));
        assert_eq!(
            item,
            InputItem::ToolOutput {
                correlation_id: "c1".to_string(),
                output: "{\"a\":1}".to_string(),
            }
        );
    }
}
