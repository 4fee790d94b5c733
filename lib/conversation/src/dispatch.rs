//! Tool dispatch.
//!
//! Every call the model requests goes through [`ToolDispatcher::dispatch`],
//! which never fails: unknown tools, tool errors, hung tools and panics all
//! come back as `{error, success: false}` payloads the model can read.
//!
//! Arguments are sanitized first. The model is untrusted, so the identity
//! field is always overwritten with the session's identity and every alias
//! spelling of it is removed.

use crate::error::ToolError;
use crate::tool::{ToolContext, ToolRegistry};
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use serde_json::{Map, Value as JsonValue, json};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use switchboard_ai::{ToolCall, ToolExecutor, ToolResult};
use switchboard_core::Identity;
use tracing::{debug, info, warn};

/// Default per-tool time limit.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Which argument carries the caller's identity, and its forbidden aliases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizePolicy {
    /// Field that always receives the trusted identity.
    pub identity_field: String,
    /// Alternate spellings stripped from arguments, compared case-insensitively.
    pub aliases: Vec<String>,
}

impl Default for SanitizePolicy {
    fn default() -> Self {
        Self {
            identity_field: "phone_from".to_string(),
            aliases: vec![
                "phone".to_string(),
                "mobile".to_string(),
                "mobile_no".to_string(),
            ],
        }
    }
}

impl SanitizePolicy {
    /// Returns `arguments` with the identity field forced to `identity`.
    #[must_use]
    pub fn apply(&self, mut arguments: Map<String, JsonValue>, identity: &Identity) -> Map<String, JsonValue> {
        arguments.retain(|key, _| {
            !key.eq_ignore_ascii_case(&self.identity_field)
                && !self.aliases.iter().any(|alias| key.eq_ignore_ascii_case(alias))
        });
        arguments.insert(
            self.identity_field.clone(),
            JsonValue::String(identity.to_string()),
        );
        arguments
    }
}

/// Sanitizes, invokes and shapes tool calls.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    policy: SanitizePolicy,
    tool_timeout: Duration,
}

impl ToolDispatcher {
    /// Creates a dispatcher over a finished registry.
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            policy: SanitizePolicy::default(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Sets the sanitization policy.
    #[must_use]
    pub fn with_policy(mut self, policy: SanitizePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the per-tool time limit.
    #[must_use]
    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Returns the registry.
    #[must_use]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Runs one call and returns its result.
    pub async fn dispatch(&self, call: ToolCall, context: &ToolContext) -> ToolResult {
        let ToolCall {
            correlation_id,
            name,
            arguments,
        } = call;

        let Some(tool) = self.registry.get(&name) else {
            warn!(tool = %name, "model requested unknown tool");
            return ToolResult::from_payload(
                correlation_id,
                &json!({"error": "tool not found", "success": false}),
            );
        };

        let arguments = self.policy.apply(arguments, &context.identity);
        debug!(tool = %name, session_id = %context.session_id, "invoking tool");

        let invocation = AssertUnwindSafe(tool.execute(arguments.clone())).catch_unwind();
        let outcome = match tokio::time::timeout(self.tool_timeout, invocation).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(report))) => Err(report.current_context().clone()),
            Ok(Err(_panic)) => Err(ToolError::Panicked { name: name.clone() }),
            Err(_) => Err(ToolError::Timeout {
                name: name.clone(),
                after_secs: self.tool_timeout.as_secs(),
            }),
        };

        match outcome {
            Ok(value) => {
                if value.get("success").and_then(JsonValue::as_bool) == Some(true) {
                    tool.on_success(context, &arguments, &value).await;
                }
                info!(tool = %name, "tool completed");
                ToolResult::from_payload(correlation_id, &value)
            }
            Err(err) => {
                warn!(tool = %name, error = %err, "tool failed");
                ToolResult::failure(correlation_id, err.to_string())
            }
        }
    }

    /// Binds the dispatcher to one turn's trusted context.
    #[must_use]
    pub fn bind(&self, context: ToolContext) -> BoundDispatcher<'_> {
        BoundDispatcher {
            dispatcher: self,
            context,
        }
    }
}

/// A dispatcher bound to one turn, usable by the tool-calling loop.
pub struct BoundDispatcher<'a> {
    dispatcher: &'a ToolDispatcher,
    context: ToolContext,
}

#[async_trait]
impl ToolExecutor for BoundDispatcher<'_> {
    async fn execute_batch(&self, calls: Vec<ToolCall>) -> Vec<ToolResult> {
        join_all(
            calls
                .into_iter()
                .map(|call| self.dispatcher.dispatch(call, &self.context)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{Tool, ToolDefinition};
    use rootcause::prelude::Report;
    use std::sync::Mutex;
    use switchboard_core::SessionId;

    /// Records the arguments it receives and answers with a fixed payload.
    struct Recorder {
        name: &'static str,
        reply: JsonValue,
        seen: Mutex<Vec<Map<String, JsonValue>>>,
        side_effects: Mutex<Vec<Identity>>,
    }

    impl Recorder {
        fn new(name: &'static str, reply: JsonValue) -> Arc<Self> {
            Arc::new(Self {
                name,
                reply,
                seen: Mutex::new(Vec::new()),
                side_effects: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Tool for Recorder {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new(self.name, "records arguments")
        }

        async fn execute(
            &self,
            arguments: Map<String, JsonValue>,
        ) -> Result<JsonValue, Report<ToolError>> {
            self.seen.lock().unwrap().push(arguments);
            Ok(self.reply.clone())
        }

        async fn on_success(
            &self,
            context: &ToolContext,
            _arguments: &Map<String, JsonValue>,
            _result: &JsonValue,
        ) {
            self.side_effects.lock().unwrap().push(context.identity.clone());
        }
    }

    struct Failing;

    #[async_trait]
    impl Tool for Failing {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("failing", "always fails")
        }

        async fn execute(
            &self,
            _arguments: Map<String, JsonValue>,
        ) -> Result<JsonValue, Report<ToolError>> {
            Err(ToolError::ExecutionFailed {
                name: "failing".to_string(),
                reason: "backend down".to_string(),
            }
            .into())
        }
    }

    struct Hanging;

    #[async_trait]
    impl Tool for Hanging {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("hanging", "never returns")
        }

        async fn execute(
            &self,
            _arguments: Map<String, JsonValue>,
        ) -> Result<JsonValue, Report<ToolError>> {
            futures::future::pending().await
        }
    }

    struct Panicking;

    #[async_trait]
    impl Tool for Panicking {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("panicking", "panics")
        }

        async fn execute(
            &self,
            _arguments: Map<String, JsonValue>,
        ) -> Result<JsonValue, Report<ToolError>> {
            panic!("tool bug")
        }
    }

    fn context() -> ToolContext {
        ToolContext {
            identity: "+391234".parse().unwrap(),
            session_id: SessionId::new(),
        }
    }

    fn call(name: &str, arguments: JsonValue) -> ToolCall {
        let JsonValue::Object(arguments) = arguments else {
            panic!("arguments must be an object");
        };
        ToolCall::new("call_1", name, arguments)
    }

    fn payload(result: &ToolResult) -> JsonValue {
        serde_json::from_str(&result.output).unwrap()
    }

    #[test]
    fn sanitize_overwrites_identity_and_strips_aliases() {
        let identity: Identity = "+391234".parse().unwrap();
        let JsonValue::Object(arguments) = json!({
            "phone_from": "+390000",
            "Phone": "+390001",
            "MOBILE": "+390002",
            "mobile_no": "+390003",
            "first_name": "Giulia"
        }) else {
            unreachable!()
        };

        let sanitized = SanitizePolicy::default().apply(arguments, &identity);
        assert_eq!(
            JsonValue::Object(sanitized),
            json!({"phone_from": "+391234", "first_name": "Giulia"})
        );
    }

    #[test]
    fn sanitize_inserts_identity_when_absent() {
        let identity: Identity = "+391234".parse().unwrap();
        let sanitized = SanitizePolicy::default().apply(Map::new(), &identity);
        assert_eq!(sanitized["phone_from"], "+391234");
    }

    #[tokio::test]
    async fn unknown_tool_yields_not_found_payload() {
        let dispatcher = ToolDispatcher::new(Arc::new(ToolRegistry::new()));
        let result = dispatcher.dispatch(call("missing", json!({})), &context()).await;

        assert!(result.is_error);
        assert_eq!(payload(&result)["error"], "tool not found");
    }

    #[tokio::test]
    async fn dispatched_arguments_carry_trusted_identity() {
        let recorder = Recorder::new("update_contact", json!({"success": true}));
        let dispatcher =
            ToolDispatcher::new(Arc::new(ToolRegistry::new().with_tool(recorder.clone())));

        dispatcher
            .dispatch(
                call("update_contact", json!({"phone_from": "+399999", "phone": "+398888"})),
                &context(),
            )
            .await;

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen[0]["phone_from"], "+391234");
        assert!(!seen[0].contains_key("phone"));
    }

    #[tokio::test]
    async fn success_signal_triggers_side_effect() {
        let ok = Recorder::new("update_contact", json!({"success": true}));
        let silent = Recorder::new("search", json!({"items": []}));
        let dispatcher = ToolDispatcher::new(Arc::new(
            ToolRegistry::new()
                .with_tool(ok.clone())
                .with_tool(silent.clone()),
        ));

        dispatcher.dispatch(call("update_contact", json!({})), &context()).await;
        dispatcher.dispatch(call("search", json!({})), &context()).await;

        assert_eq!(ok.side_effects.lock().unwrap().len(), 1);
        assert!(silent.side_effects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tool_error_becomes_error_payload() {
        let dispatcher =
            ToolDispatcher::new(Arc::new(ToolRegistry::new().with_tool(Arc::new(Failing))));
        let result = dispatcher.dispatch(call("failing", json!({})), &context()).await;

        let body = payload(&result);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("backend down"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_tool_is_cut_off() {
        let dispatcher =
            ToolDispatcher::new(Arc::new(ToolRegistry::new().with_tool(Arc::new(Hanging))))
                .with_tool_timeout(Duration::from_secs(5));
        let result = dispatcher.dispatch(call("hanging", json!({})), &context()).await;

        assert!(result.is_error);
        assert!(payload(&result)["error"].as_str().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn panicking_tool_is_contained() {
        let dispatcher =
            ToolDispatcher::new(Arc::new(ToolRegistry::new().with_tool(Arc::new(Panicking))));
        let result = dispatcher.dispatch(call("panicking", json!({})), &context()).await;

        assert!(result.is_error);
        assert!(payload(&result)["error"].as_str().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn batch_preserves_call_order() {
        let recorder = Recorder::new("search", json!({"ok": 1}));
        let dispatcher =
            ToolDispatcher::new(Arc::new(ToolRegistry::new().with_tool(recorder.clone())));
        let bound = dispatcher.bind(context());

        let calls = vec![
            ToolCall::new("a", "search", Map::new()),
            ToolCall::new("b", "missing", Map::new()),
            ToolCall::new("c", "search", Map::new()),
        ];
        let results = bound.execute_batch(calls).await;

        let ids: Vec<_> = results.iter().map(|r| r.correlation_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(results[1].is_error);
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
    }
}
