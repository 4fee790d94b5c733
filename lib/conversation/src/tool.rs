//! Tool registry for conversation mode.
//!
//! Tools are server-side functions the model may call mid-turn. The
//! registry is built once at startup and shared read-only afterwards.

use crate::error::ToolError;
use async_trait::async_trait;
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use switchboard_core::{Identity, SessionId};

/// Definition of a tool available during conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON schema for input parameters.
    pub input_schema: JsonValue,
}

impl ToolDefinition {
    /// Creates a new tool definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
        }
    }

    /// Sets the input schema.
    #[must_use]
    pub fn with_input_schema(mut self, schema: JsonValue) -> Self {
        self.input_schema = schema;
        self
    }

    /// Reads a catalog entry in either the flat shape
    /// (`{type, name, description, parameters}`) or the nested shape
    /// (`{type, function: {name, description, parameters}}`).
    ///
    /// # Errors
    ///
    /// Returns `ToolError::InvalidInput` if the entry is not a function
    /// tool or has no name.
    pub fn from_catalog_entry(entry: &JsonValue) -> Result<Self, Report<ToolError>> {
        let kind = entry.get("type").and_then(JsonValue::as_str).unwrap_or("function");
        let body = entry.get("function").unwrap_or(entry);
        let name = body
            .get("name")
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .unwrap_or_default();

        if !kind.eq_ignore_ascii_case("function") || name.is_empty() {
            return Err(ToolError::InvalidInput {
                name: name.to_string(),
                reason: format!("catalog entry is not a named function tool (type {kind})"),
            }
            .into());
        }

        let mut definition = Self::new(
            name,
            body.get("description")
                .and_then(JsonValue::as_str)
                .unwrap_or_default(),
        );
        if let Some(parameters) = body.get("parameters").filter(|p| !p.is_null()) {
            definition.input_schema = parameters.clone();
        }
        Ok(definition)
    }

    /// Converts the definition to the flat function-tool format.
    #[must_use]
    pub fn to_llm_format(&self) -> JsonValue {
        serde_json::json!({
            "type": "function",
            "name": self.name,
            "description": self.description,
            "parameters": self.input_schema,
        })
    }
}

/// Who a tool call is being made for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    /// Trusted identity resolved from the session store.
    pub identity: Identity,
    /// The session the turn belongs to.
    pub session_id: SessionId,
}

/// Trait for tool execution.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the tool definition.
    fn definition(&self) -> ToolDefinition;

    /// Executes the tool with sanitized arguments.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool fails; the dispatcher turns it into an
    /// error result for the model.
    async fn execute(&self, arguments: Map<String, JsonValue>) -> Result<JsonValue, Report<ToolError>>;

    /// Side effect run after a result carrying `"success": true`.
    async fn on_success(
        &self,
        _context: &ToolContext,
        _arguments: &Map<String, JsonValue>,
        _result: &JsonValue,
    ) {
    }
}

/// Registry of available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, (ToolDefinition, Arc<dyn Tool>)>,
}

impl ToolRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registers a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let definition = tool.definition();
        self.tools.insert(definition.name.clone(), (definition, tool));
    }

    /// Adds a tool (builder form).
    #[must_use]
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    /// Gets a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|(_, tool)| Arc::clone(tool))
    }

    /// Returns registered tool names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Converts definitions to the format expected by the provider,
    /// ordered by name.
    #[must_use]
    pub fn to_llm_format(&self) -> Vec<JsonValue> {
        let mut definitions: Vec<_> = self.tools.values().map(|(def, _)| def).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions.into_iter().map(ToolDefinition::to_llm_format).collect()
    }
}
