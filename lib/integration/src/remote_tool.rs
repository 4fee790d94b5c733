//! Tools that forward their arguments to an HTTP endpoint.
//!
//! The catalog file is a JSON array (or `{"tools": [...]}`) of tool
//! definitions in either accepted shape, each with an extra `endpoint`
//! (URL string or `{url, bearer_token, timeout_seconds}` object). An entry
//! may also name an `on_success` endpoint of the same form; it receives
//! `{tool, identity, session_id, arguments, result}` after every call whose
//! result carries `"success": true`:
//!
//! ```json
//! [{"type": "function", "name": "update_contact",
//!   "description": "Update the customer's contact details",
//!   "parameters": {"type": "object", "properties": {"email": {"type": "string"}}},
//!   "endpoint": "http://crm.local/api/tools/update_contact",
//!   "on_success": "http://crm.local/api/profiles"}]
//! ```

use crate::connector::HttpEndpoint;
use crate::error::ConnectorError;
use async_trait::async_trait;
use reqwest::Client;
use rootcause::prelude::Report;
use serde_json::{Map, Value as JsonValue};
use std::path::Path;
use std::sync::Arc;
use switchboard_conversation::{Tool, ToolContext, ToolDefinition, ToolError, ToolRegistry};
use tracing::{info, instrument, warn};

/// A tool executed by POSTing its arguments to an endpoint.
///
/// A non-2xx answer is a tool failure; a 2xx JSON answer is the payload
/// handed back to the model as-is.
#[derive(Debug)]
pub struct RemoteTool {
    definition: ToolDefinition,
    endpoint: HttpEndpoint,
    client: Client,
    on_success: Option<SuccessHook>,
}

/// Endpoint notified after a successful call.
#[derive(Debug)]
struct SuccessHook {
    endpoint: HttpEndpoint,
    client: Client,
}

impl RemoteTool {
    /// Creates a remote tool.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::InvalidConfig` for an empty URL.
    pub fn new(
        definition: ToolDefinition,
        endpoint: HttpEndpoint,
    ) -> Result<Self, Report<ConnectorError>> {
        Ok(Self {
            client: endpoint.client()?,
            definition,
            endpoint,
            on_success: None,
        })
    }

    /// Notifies `endpoint` after each successful call.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::InvalidConfig` for an empty URL.
    pub fn with_on_success(
        mut self,
        endpoint: HttpEndpoint,
    ) -> Result<Self, Report<ConnectorError>> {
        self.on_success = Some(SuccessHook {
            client: endpoint.client()?,
            endpoint,
        });
        Ok(self)
    }

    /// Builds a tool from one catalog entry.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::InvalidConfig` if the definition or endpoint
    /// is missing or malformed.
    pub fn from_catalog_entry(entry: &JsonValue) -> Result<Self, Report<ConnectorError>> {
        let definition = ToolDefinition::from_catalog_entry(entry).map_err(|e| {
            ConnectorError::InvalidConfig {
                reason: e.current_context().to_string(),
            }
        })?;

        let Some(endpoint) = endpoint_field(entry, "endpoint", &definition.name)? else {
            return Err(ConnectorError::InvalidConfig {
                reason: format!("tool {} has no endpoint", definition.name),
            }
            .into());
        };
        let on_success = endpoint_field(entry, "on_success", &definition.name)?;

        let tool = Self::new(definition, endpoint)?;
        match on_success {
            Some(hook) => tool.with_on_success(hook),
            None => Ok(tool),
        }
    }
}

/// Reads an endpoint given as a URL string or an object.
fn endpoint_field(
    entry: &JsonValue,
    field: &str,
    tool: &str,
) -> Result<Option<HttpEndpoint>, Report<ConnectorError>> {
    match entry.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(url)) => Ok(Some(HttpEndpoint::new(url.clone()))),
        Some(value @ JsonValue::Object(_)) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| {
                ConnectorError::InvalidConfig {
                    reason: format!("tool {tool}: bad {field}: {e}"),
                }
                .into()
            }),
        Some(_) => Err(ConnectorError::InvalidConfig {
            reason: format!("tool {tool}: {field} must be a URL or an object"),
        }
        .into()),
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    #[instrument(skip(self, arguments), fields(tool = %self.definition.name))]
    async fn execute(
        &self,
        arguments: Map<String, JsonValue>,
    ) -> Result<JsonValue, Report<ToolError>> {
        let name = &self.definition.name;
        self.endpoint
            .post_json(&self.client, &JsonValue::Object(arguments))
            .await
            .map_err(|e| {
                ToolError::ExecutionFailed {
                    name: name.clone(),
                    reason: e.current_context().to_string(),
                }
                .into()
            })
    }

    async fn on_success(
        &self,
        context: &ToolContext,
        arguments: &Map<String, JsonValue>,
        result: &JsonValue,
    ) {
        let Some(hook) = &self.on_success else {
            return;
        };
        let body = serde_json::json!({
            "tool": self.definition.name,
            "identity": context.identity,
            "session_id": context.session_id,
            "arguments": arguments,
            "result": result,
        });
        match hook.endpoint.post_json(&hook.client, &body).await {
            Ok(_) => info!(tool = %self.definition.name, "success hook notified"),
            Err(report) => {
                warn!(tool = %self.definition.name, error = %report, "success hook failed");
            }
        }
    }
}

/// Parses a catalog document into tools.
///
/// # Errors
///
/// Returns `ConnectorError::InvalidConfig` for a document of the wrong
/// shape or any bad entry.
pub fn parse_catalog(document: &JsonValue) -> Result<Vec<RemoteTool>, Report<ConnectorError>> {
    let entries = match document {
        JsonValue::Array(entries) => entries,
        JsonValue::Object(object) => match object.get("tools") {
            Some(JsonValue::Array(entries)) => entries,
            _ => {
                return Err(ConnectorError::InvalidConfig {
                    reason: "tool catalog object has no \"tools\" array".to_string(),
                }
                .into());
            }
        },
        _ => {
            return Err(ConnectorError::InvalidConfig {
                reason: "tool catalog must be an array or an object".to_string(),
            }
            .into());
        }
    };

    entries.iter().map(RemoteTool::from_catalog_entry).collect()
}

/// Reads the catalog file at `path` into a registry.
///
/// # Errors
///
/// Returns `ConnectorError::InvalidConfig` if the file is unreadable or
/// any entry is invalid.
pub fn load_registry(path: &Path) -> Result<ToolRegistry, Report<ConnectorError>> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConnectorError::InvalidConfig {
        reason: format!("cannot read tool catalog {}: {e}", path.display()),
    })?;
    let document: JsonValue =
        serde_json::from_str(&raw).map_err(|e| ConnectorError::InvalidConfig {
            reason: format!("tool catalog {} is not JSON: {e}", path.display()),
        })?;

    let mut registry = ToolRegistry::new();
    for tool in parse_catalog(&document)? {
        info!(tool = %tool.definition.name, url = %tool.endpoint.url, "registered remote tool");
        registry.register(Arc::new(tool));
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchboard_ai::ToolCall;
    use switchboard_conversation::ToolDispatcher;
    use switchboard_core::SessionId;
    use wiremock::matchers::{body_json, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn catalog_accepts_both_shapes_and_endpoint_forms() {
        let tools = parse_catalog(&json!({"tools": [
            {"type": "function", "name": "search_products", "endpoint": "http://crm.local/search"},
            {
                "type": "function",
                "function": {"name": "update_contact", "description": "Update a contact"},
                "endpoint": {"url": "http://crm.local/contact", "bearer_token": "t", "timeout_seconds": 5}
            }
        ]}))
        .unwrap();

        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].definition().name, "search_products");
        assert_eq!(tools[1].definition().description, "Update a contact");
        assert_eq!(tools[1].endpoint.timeout_seconds, 5);
    }

    #[test]
    fn catalog_rejects_entries_without_endpoint() {
        let err = parse_catalog(&json!([{"type": "function", "name": "orphan"}])).unwrap_err();
        assert!(err.current_context().to_string().contains("orphan"));
        assert!(parse_catalog(&json!("tools")).is_err());
    }

    #[test]
    fn registry_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tools.json");
        std::fs::write(
            &file,
            r#"[{"type": "function", "name": "search_products", "endpoint": "http://crm.local/search"}]"#,
        )
        .unwrap();

        let registry = load_registry(&file).unwrap();
        assert_eq!(registry.names(), vec!["search_products"]);
        assert!(load_registry(&dir.path().join("missing.json")).is_err());
    }

    #[tokio::test]
    async fn execute_forwards_arguments() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_json(json!({"query": "tiramisù", "phone_from": "+391234"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": true, "code": "TIR-002"})),
            )
            .mount(&server)
            .await;

        let tool = RemoteTool::new(
            ToolDefinition::new("search_products", "Search"),
            HttpEndpoint::new(format!("{}/search", server.uri())),
        )
        .unwrap();

        let JsonValue::Object(arguments) = json!({"query": "tiramisù", "phone_from": "+391234"})
        else {
            unreachable!()
        };
        let result = tool.execute(arguments).await.unwrap();
        assert_eq!(result["code"], "TIR-002");
    }

    #[tokio::test]
    async fn execute_failure_is_tool_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let tool = RemoteTool::new(
            ToolDefinition::new("search_products", "Search"),
            HttpEndpoint::new(server.uri()),
        )
        .unwrap();

        let err = tool.execute(Map::new()).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            ToolError::ExecutionFailed { name, .. } if name == "search_products"
        ));
    }

    #[test]
    fn catalog_reads_optional_success_hook() {
        let tools = parse_catalog(&json!([
            {"type": "function", "name": "update_contact",
             "endpoint": "http://crm.local/contact", "on_success": "http://crm.local/profiles"},
            {"type": "function", "name": "search_products", "endpoint": "http://crm.local/search"}
        ]))
        .unwrap();
        assert_eq!(
            tools[0].on_success.as_ref().map(|hook| hook.endpoint.url.as_str()),
            Some("http://crm.local/profiles")
        );
        assert!(tools[1].on_success.is_none());

        let err = parse_catalog(&json!([
            {"type": "function", "name": "update_contact",
             "endpoint": "http://crm.local/contact", "on_success": 42}
        ]))
        .unwrap_err();
        assert!(err.current_context().to_string().contains("on_success"));
    }

    async fn contact_tool(server: &MockServer, tool_reply: JsonValue) -> ToolDispatcher {
        Mock::given(method("POST"))
            .and(path("/contact"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tool_reply))
            .mount(server)
            .await;

        let tool = RemoteTool::from_catalog_entry(&json!({
            "type": "function",
            "name": "update_contact",
            "endpoint": format!("{}/contact", server.uri()),
            "on_success": {"url": format!("{}/profiles", server.uri()), "timeout_seconds": 5}
        }))
        .unwrap();
        ToolDispatcher::new(Arc::new(ToolRegistry::new().with_tool(Arc::new(tool))))
    }

    fn update_call() -> ToolCall {
        let JsonValue::Object(arguments) = json!({"email": "anna@example.com"}) else {
            unreachable!()
        };
        ToolCall::new("call_1", "update_contact", arguments)
    }

    #[tokio::test]
    async fn successful_call_notifies_success_hook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/profiles"))
            .and(body_partial_json(json!({
                "tool": "update_contact",
                "identity": "+391234",
                "arguments": {"email": "anna@example.com"},
                "result": {"success": true, "contact_id": "c-9"}
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        let dispatcher = contact_tool(&server, json!({"success": true, "contact_id": "c-9"})).await;

        let context = ToolContext {
            identity: "+391234".parse().unwrap(),
            session_id: SessionId::new(),
        };
        dispatcher.dispatch(update_call(), &context).await;

        server.verify().await;
    }

    #[tokio::test]
    async fn unsuccessful_call_skips_success_hook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/profiles"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;
        let dispatcher =
            contact_tool(&server, json!({"success": false, "error": "invalid email"})).await;

        let context = ToolContext {
            identity: "+391234".parse().unwrap(),
            session_id: SessionId::new(),
        };
        dispatcher.dispatch(update_call(), &context).await;

        server.verify().await;
    }

    #[tokio::test]
    async fn failing_success_hook_keeps_tool_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/profiles"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        let dispatcher = contact_tool(&server, json!({"success": true})).await;

        let context = ToolContext {
            identity: "+391234".parse().unwrap(),
            session_id: SessionId::new(),
        };
        let result = dispatcher.dispatch(update_call(), &context).await;

        assert!(result.output.contains("\"success\":true"));
        server.verify().await;
    }
}
