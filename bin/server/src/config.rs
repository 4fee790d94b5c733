//! Centralized server configuration.
//!
//! This module provides strongly-typed configuration for the server,
//! loaded via the `config` crate from environment variables, e.g.
//! `PROVIDER__API_KEY`, `CONVERSATION__MAX_ITERATIONS`, `NATS__URL`.
//!
//! Without `NATS__URL` the server keeps all state in memory and runs every
//! turn inline.

use crate::error::StartupError;
use rootcause::prelude::Report;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use switchboard_ai::{DEFAULT_MAX_ITERATIONS, DEFAULT_MODEL, DEFAULT_TURN_TIMEOUT, LlmBackendConfig};
use switchboard_conversation::{DEFAULT_COOLDOWN, NatsConfig, SanitizePolicy};
use switchboard_integration::{DispatchSettings, HttpEndpoint};

/// Server configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Model provider.
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Tool-calling loop settings.
    #[serde(default)]
    pub conversation: ConversationConfig,

    /// Human handoff settings.
    #[serde(default)]
    pub handoff: HandoffConfig,

    /// Inbound dispatch settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// NATS state and queue. In-memory state when absent.
    #[serde(default)]
    pub nats: Option<NatsConfig>,

    /// Reply delivery gateway. Replies are only logged when absent.
    #[serde(default)]
    pub delivery: Option<HttpEndpoint>,

    /// Business-record correlation endpoint.
    #[serde(default)]
    pub correlation: Option<HttpEndpoint>,

    /// JSON tool catalog.
    #[serde(default)]
    pub tools_file: Option<PathBuf>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

/// Model provider configuration.
#[derive(Clone, Deserialize)]
pub struct ProviderConfig {
    /// API key. Required at start-up.
    #[serde(default)]
    pub api_key: Option<String>,

    /// API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,

    /// Timeout for a single provider request, in seconds.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_request_timeout_seconds() -> u64 {
    60
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .finish()
    }
}

impl ProviderConfig {
    /// Builds the backend configuration. Validation happens when the
    /// backend is created.
    #[must_use]
    pub fn backend_config(&self) -> LlmBackendConfig {
        LlmBackendConfig::openai(self.api_key.clone().unwrap_or_default())
            .with_base_url(self.base_url.clone())
            .with_model(self.model.clone())
            .with_request_timeout(Duration::from_secs(self.request_timeout_seconds))
    }
}

/// Tool-calling loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationConfig {
    /// System instructions sent at the start of each turn.
    #[serde(default)]
    pub instructions: Option<String>,

    /// File to read the instructions from, when `instructions` is unset.
    #[serde(default)]
    pub instructions_file: Option<PathBuf>,

    /// Provider calls allowed per turn.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Wall-clock budget per turn, in seconds.
    #[serde(default = "default_turn_timeout_seconds")]
    pub turn_timeout_seconds: u64,

    /// Budget per tool invocation, in seconds.
    #[serde(default = "default_tool_timeout_seconds")]
    pub tool_timeout_seconds: u64,

    /// Argument that always carries the trusted identity.
    #[serde(default = "default_identity_field")]
    pub identity_field: String,

    /// Other argument names removed before the trusted identity is set.
    #[serde(default = "default_identity_aliases")]
    pub identity_aliases: Vec<String>,
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_turn_timeout_seconds() -> u64 {
    DEFAULT_TURN_TIMEOUT.as_secs()
}

fn default_tool_timeout_seconds() -> u64 {
    30
}

fn default_identity_field() -> String {
    SanitizePolicy::default().identity_field
}

fn default_identity_aliases() -> Vec<String> {
    SanitizePolicy::default().aliases
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            instructions: None,
            instructions_file: None,
            max_iterations: default_max_iterations(),
            turn_timeout_seconds: default_turn_timeout_seconds(),
            tool_timeout_seconds: default_tool_timeout_seconds(),
            identity_field: default_identity_field(),
            identity_aliases: default_identity_aliases(),
        }
    }
}

impl ConversationConfig {
    /// Returns the sanitization policy for tool arguments.
    #[must_use]
    pub fn sanitize_policy(&self) -> SanitizePolicy {
        SanitizePolicy {
            identity_field: self.identity_field.clone(),
            aliases: self.identity_aliases.clone(),
        }
    }

    /// Resolves the system instructions, reading `instructions_file` if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the instructions file cannot be read.
    pub fn load_instructions(&self) -> std::io::Result<Option<String>> {
        if let Some(text) = self.instructions.as_ref().filter(|t| !t.trim().is_empty()) {
            return Ok(Some(text.clone()));
        }
        match &self.instructions_file {
            Some(path) => Ok(Some(std::fs::read_to_string(path)?)),
            None => Ok(None),
        }
    }
}

/// Human handoff configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HandoffConfig {
    /// Seconds automated replies stay paused after operator activity.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
}

fn default_cooldown_seconds() -> u64 {
    DEFAULT_COOLDOWN.as_secs()
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_cooldown_seconds(),
        }
    }
}

/// Inbound dispatch configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Never defer turns to workers.
    #[serde(default)]
    pub force_inline: bool,

    /// Deliver replies.
    #[serde(default = "default_autoreply")]
    pub autoreply: bool,

    /// Reply sent when a turn fails.
    #[serde(default)]
    pub fallback_reply: Option<String>,

    /// How long seen event ids are remembered, in seconds.
    #[serde(default = "default_dedup_retention_seconds")]
    pub dedup_retention_seconds: u64,

    /// Interval between deduplicator prunes, in seconds.
    #[serde(default = "default_dedup_prune_interval_seconds")]
    pub dedup_prune_interval_seconds: u64,

    /// Run a job worker in this process (only with NATS).
    #[serde(default = "default_worker_enabled")]
    pub worker_enabled: bool,
}

fn default_autoreply() -> bool {
    true
}

fn default_dedup_retention_seconds() -> u64 {
    86_400
}

fn default_dedup_prune_interval_seconds() -> u64 {
    600
}

fn default_worker_enabled() -> bool {
    true
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            force_inline: false,
            autoreply: default_autoreply(),
            fallback_reply: None,
            dedup_retention_seconds: default_dedup_retention_seconds(),
            dedup_prune_interval_seconds: default_dedup_prune_interval_seconds(),
            worker_enabled: default_worker_enabled(),
        }
    }
}

impl DispatchConfig {
    /// Returns the dispatcher settings.
    #[must_use]
    pub fn settings(&self) -> DispatchSettings {
        let defaults = DispatchSettings::default();
        DispatchSettings {
            force_inline: self.force_inline,
            autoreply: self.autoreply,
            fallback_reply: self
                .fallback_reply
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or(defaults.fallback_reply),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `StartupError::Configuration` if the environment cannot be
    /// read or a setting is invalid.
    pub fn from_env() -> Result<Self, Report<StartupError>> {
        let source = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("conversation.identity_aliases")
                    .try_parsing(true),
            )
            .build()
            .map_err(invalid)?;
        Self::from_source(source)
    }

    fn from_source(source: config::Config) -> Result<Self, Report<StartupError>> {
        let config: Self = source.try_deserialize().map_err(invalid)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that would stop every turn or crash a timer.
    ///
    /// A zero handoff cooldown is allowed and disables the pause.
    ///
    /// # Errors
    ///
    /// Returns `StartupError::Configuration` naming the first zero setting.
    pub fn validate(&self) -> Result<(), Report<StartupError>> {
        let positive = [
            ("conversation.max_iterations", u64::from(self.conversation.max_iterations)),
            ("conversation.turn_timeout_seconds", self.conversation.turn_timeout_seconds),
            ("conversation.tool_timeout_seconds", self.conversation.tool_timeout_seconds),
            ("provider.request_timeout_seconds", self.provider.request_timeout_seconds),
            ("dispatch.dedup_retention_seconds", self.dispatch.dedup_retention_seconds),
            (
                "dispatch.dedup_prune_interval_seconds",
                self.dispatch.dedup_prune_interval_seconds,
            ),
        ];
        match positive.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(StartupError::Configuration {
                reason: format!("{name} must be greater than zero"),
            }
            .into()),
            None => Ok(()),
        }
    }
}

fn invalid(e: config::ConfigError) -> StartupError {
    StartupError::Configuration {
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<ServerConfig, Report<StartupError>> {
        let mut builder = config::Config::builder();
        for (key, value) in pairs {
            builder = builder.set_override(*key, *value).unwrap();
        }
        ServerConfig::from_source(builder.build().unwrap())
    }

    fn from_pairs(pairs: &[(&str, &str)]) -> ServerConfig {
        load(pairs).unwrap()
    }

    fn rejected_setting(pairs: &[(&str, &str)]) -> String {
        let err = load(pairs).unwrap_err();
        match err.current_context() {
            StartupError::Configuration { reason } => reason.clone(),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_numeric_settings_are_rejected() {
        for key in [
            "conversation.max_iterations",
            "conversation.turn_timeout_seconds",
            "conversation.tool_timeout_seconds",
            "provider.request_timeout_seconds",
            "dispatch.dedup_retention_seconds",
            "dispatch.dedup_prune_interval_seconds",
        ] {
            let reason = rejected_setting(&[(key, "0")]);
            assert!(reason.contains(key), "{key}: {reason}");
        }
    }

    #[test]
    fn zero_cooldown_is_allowed() {
        let config = from_pairs(&[("handoff.cooldown_seconds", "0")]);
        assert_eq!(config.handoff.cooldown_seconds, 0);
    }

    #[test]
    fn malformed_number_is_a_configuration_error() {
        let reason = rejected_setting(&[("conversation.max_iterations", "many")]);
        assert!(!reason.is_empty());
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = from_pairs(&[]);
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.provider.model, "gpt-4o-mini");
        assert!(config.provider.api_key.is_none());
        assert_eq!(config.conversation.max_iterations, 6);
        assert_eq!(config.conversation.turn_timeout_seconds, 120);
        assert_eq!(config.conversation.tool_timeout_seconds, 30);
        assert_eq!(config.conversation.identity_field, "phone_from");
        assert_eq!(config.handoff.cooldown_seconds, 300);
        assert!(config.dispatch.autoreply);
        assert_eq!(config.dispatch.dedup_retention_seconds, 86_400);
        assert!(config.nats.is_none());
        assert!(config.delivery.is_none());
    }

    #[test]
    fn nested_sections_are_read() {
        let config = from_pairs(&[
            ("provider.api_key", "sk-test"),
            ("provider.model", "gpt-4.1"),
            ("nats.url", "nats://localhost:4222"),
            ("delivery.url", "http://crm.local/send"),
            ("handoff.cooldown_seconds", "60"),
        ]);
        assert_eq!(config.provider.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.provider.backend_config().model, "gpt-4.1");
        assert_eq!(config.nats.unwrap().url, "nats://localhost:4222");
        assert_eq!(config.delivery.unwrap().url, "http://crm.local/send");
        assert_eq!(config.handoff.cooldown_seconds, 60);
    }

    #[test]
    fn blank_fallback_reply_uses_default() {
        let dispatch = DispatchConfig {
            fallback_reply: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(
            dispatch.settings().fallback_reply,
            DispatchSettings::default().fallback_reply
        );
    }

    #[test]
    fn inline_instructions_win_over_file() {
        let conversation = ConversationConfig {
            instructions: Some("Sei un assistente".to_string()),
            instructions_file: Some(PathBuf::from("/nonexistent")),
            ..Default::default()
        };
        assert_eq!(
            conversation.load_instructions().unwrap().as_deref(),
            Some("Sei un assistente")
        );
    }

    #[test]
    fn sanitize_policy_follows_config() {
        let conversation = ConversationConfig {
            identity_field: "customer_phone".to_string(),
            identity_aliases: vec!["phone".to_string()],
            ..Default::default()
        };
        let policy = conversation.sanitize_policy();
        assert_eq!(policy.identity_field, "customer_phone");
        assert_eq!(policy.aliases, vec!["phone"]);
    }
}
