//! Coordinate primitive.
//!
//! The tool-calling loop drives one user turn to completion:
//! 1. Submit instructions and the user text (resuming from any prior token)
//! 2. If the response requests tools, execute the whole batch
//! 3. Submit the batch of results, resuming from the response's token
//! 4. Repeat until a response carries no tool calls
//!
//! The loop is bounded twice: by a cap on provider calls and by one
//! wall-clock budget for the whole turn. Running out of budget degrades to
//! whatever text already exists, tagged partial.

use crate::backend::{ContinuationToken, LlmBackend, ProviderRequest};
use crate::error::CoordinateError;
use crate::message::{InputItem, OutputItem, ToolCall, ToolResult};
use async_trait::async_trait;
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default cap on provider calls per turn.
pub const DEFAULT_MAX_ITERATIONS: u32 = 6;

/// Default wall-clock budget per turn.
pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(120);

/// Upper bound on the best-effort partial text lookup after a timeout.
const PARTIAL_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs a batch of tool calls on behalf of the loop.
///
/// Implementations must return one result per call and never fail as a
/// whole; individual tool failures are reported as error results.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Executes every call and returns their results.
    async fn execute_batch(&self, calls: Vec<ToolCall>) -> Vec<ToolResult>;
}

/// Configuration for the Coordinate primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinateConfig {
    /// Model identifier.
    pub model: String,
    /// System instructions sent with the first call of each turn.
    pub instructions: Option<String>,
    /// Tool schema catalog sent with every call.
    pub tools: Vec<JsonValue>,
    /// Maximum provider calls per turn.
    pub max_iterations: u32,
    /// Wall-clock budget per turn.
    pub timeout: Duration,
}

impl CoordinateConfig {
    /// Creates a configuration for `model` with default bounds.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            instructions: None,
            tools: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            timeout: DEFAULT_TURN_TIMEOUT,
        }
    }

    /// Sets the maximum iterations.
    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Sets the wall-clock budget.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the system instructions.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Sets the tool catalog.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<JsonValue>) -> Self {
        self.tools = tools;
        self
    }
}

/// The result of one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinateOutcome {
    /// Final assistant text, trimmed.
    pub text: String,
    /// True when the budget ran out and `text` is what could be recovered.
    pub partial: bool,
    /// Latest token issued during this turn.
    pub continuation: Option<ContinuationToken>,
    /// Provider calls made.
    pub iterations: u32,
    /// Model that produced the last response.
    pub model: String,
}

/// Executes the tool-calling loop against one backend.
#[derive(Clone)]
pub struct Coordinator {
    backend: Arc<dyn LlmBackend>,
    config: CoordinateConfig,
}

impl Coordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(backend: Arc<dyn LlmBackend>, config: CoordinateConfig) -> Self {
        Self { backend, config }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CoordinateConfig {
        &self.config
    }

    /// Runs one turn for `user_text`.
    ///
    /// # Errors
    ///
    /// - `CoordinateError::Provider` (or `Configuration`) wrapping the
    ///   adapter's `LlmError` when a provider call fails
    /// - `CoordinateError::MaxIterationsExceeded` when the last allowed call
    ///   still requests tools
    /// - `CoordinateError::TimeoutExceeded` when the budget runs out and no
    ///   partial text can be recovered
    pub async fn run(
        &self,
        user_text: &str,
        prior: Option<ContinuationToken>,
        executor: &dyn ToolExecutor,
    ) -> Result<CoordinateOutcome, Report<CoordinateError>> {
        let started = Instant::now();
        let budget = self.config.timeout;
        let max = self.config.max_iterations;

        let mut input = Vec::with_capacity(2);
        if let Some(instructions) = self.config.instructions.as_deref().map(str::trim) {
            if !instructions.is_empty() {
                input.push(InputItem::system(instructions));
            }
        }
        input.push(InputItem::user(user_text));

        let mut resume_from = prior;
        let mut issued: Option<ContinuationToken> = None;
        let mut interim_text: Vec<String> = Vec::new();
        let mut model = self.config.model.clone();

        for iteration in 1..=max {
            let remaining = budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return self
                    .recover_partial(&interim_text, issued, iteration - 1, model)
                    .await;
            }

            debug!(
                iteration,
                max,
                items = input.len(),
                resuming = resume_from.as_ref().map(ContinuationToken::short),
                "calling provider"
            );

            let request = ProviderRequest {
                model: self.config.model.clone(),
                input: std::mem::take(&mut input),
                tools: self.config.tools.clone(),
                continuation: resume_from.clone(),
            };

            let response = match tokio::time::timeout(remaining, self.backend.respond(&request)).await
            {
                Ok(Ok(response)) => response,
                Ok(Err(report)) => {
                    let context = if report.current_context().is_configuration() {
                        CoordinateError::Configuration
                    } else {
                        CoordinateError::Provider { iteration }
                    };
                    return Err(report.context(context));
                }
                Err(_) => {
                    warn!(iteration, "provider call outlived the turn budget");
                    return self
                        .recover_partial(&interim_text, issued, iteration, model)
                        .await;
                }
            };

            model = response.model.clone();
            resume_from = Some(response.continuation.clone());
            issued = Some(response.continuation.clone());

            if !response.requests_tools() {
                let text = clean_text(response.texts());
                info!(iteration, chars = text.len(), "turn completed");
                return Ok(CoordinateOutcome {
                    text,
                    partial: false,
                    continuation: issued,
                    iterations: iteration,
                    model,
                });
            }

            if iteration == max {
                warn!(max, "provider still requesting tools at iteration cap");
                return Err(CoordinateError::MaxIterationsExceeded { max }.into());
            }

            interim_text.extend(response.texts().map(str::to_string));

            let mut calls = Vec::new();
            let mut rejected = Vec::new();
            for item in response.output {
                match item {
                    OutputItem::ToolCall(call) => calls.push(call),
                    OutputItem::MalformedToolCall(err) => {
                        warn!(tool = %err.name, reason = %err.reason, "malformed tool call");
                        rejected.push(ToolResult::failure(err.correlation_id, err.reason));
                    }
                    OutputItem::Text(_) => {}
                }
            }

            info!(iteration, tools = calls.len(), "executing tool batch");
            let mut results = executor.execute_batch(calls).await;
            results.extend(rejected);
            input = results.into_iter().map(InputItem::from).collect();

            if started.elapsed() >= budget {
                warn!(iteration, "turn budget exhausted after tool round");
                return self
                    .recover_partial(&interim_text, issued, iteration, model)
                    .await;
            }
        }

        Err(CoordinateError::MaxIterationsExceeded { max }.into())
    }

    async fn recover_partial(
        &self,
        interim_text: &[String],
        issued: Option<ContinuationToken>,
        iterations: u32,
        model: String,
    ) -> Result<CoordinateOutcome, Report<CoordinateError>> {
        let mut text = clean_text(interim_text.iter().map(String::as_str));

        if text.is_empty() {
            if let Some(token) = issued.as_ref() {
                match tokio::time::timeout(PARTIAL_FETCH_TIMEOUT, self.backend.retrieve_text(token))
                    .await
                {
                    Ok(Ok(Some(fetched))) => text = clean_text(std::iter::once(fetched.as_str())),
                    Ok(Ok(None)) => {}
                    Ok(Err(report)) => warn!(error = %report, "partial text lookup failed"),
                    Err(_) => warn!("partial text lookup timed out"),
                }
            }
        }

        if text.is_empty() {
            return Err(CoordinateError::TimeoutExceeded {
                budget_secs: self.config.timeout.as_secs(),
                iterations,
            }
            .into());
        }

        info!(iterations, chars = text.len(), "returning partial reply");
        Ok(CoordinateOutcome {
            text,
            partial: true,
            continuation: issued,
            iterations,
            model,
        })
    }
}

/// Joins fragments with newlines, drops citation markers and trims.
fn clean_text<'a>(fragments: impl Iterator<Item = &'a str>) -> String {
    let joined = fragments
        .map(strip_citations)
        .filter(|s| !s.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    joined.trim().to_string()
}

/// Removes `【…】` citation markers.
fn strip_citations(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '【' => depth += 1,
            '】' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}
