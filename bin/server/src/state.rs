//! Wiring of the orchestrator from configuration.
//!
//! One [`AppState`] is built at start-up and shared by all handlers and
//! the background worker.

use crate::config::ServerConfig;
use crate::error::StartupError;
use rootcause::prelude::Report;
use std::sync::Arc;
use std::time::Duration;
use switchboard_ai::{CoordinateConfig, Coordinator, LlmBackend, OpenAiBackend};
use switchboard_conversation::{
    ConversationEngine, ConversationStores, HandoffGate, MessageDeduplicator, ToolDispatcher,
    ToolRegistry,
};
use switchboard_integration::{
    DeliveryAdapter, DispatcherParts, HttpDeliveryAdapter, HttpRecordCorrelator, InboundDispatcher,
    JobQueue, LogDeliveryAdapter, NatsJobQueue, NoopCorrelator, RecordCorrelator, load_registry,
};
use tracing::info;

/// Shared application state.
pub struct AppState {
    /// The inbound pipeline, and through it the engine, gate and
    /// deduplicator.
    pub dispatcher: Arc<InboundDispatcher>,
}

/// Everything `main` needs to run.
pub struct Runtime {
    /// Handler state.
    pub state: Arc<AppState>,
    /// Work queue, when NATS is configured.
    pub queue: Option<Arc<NatsJobQueue>>,
}

/// Builds the runtime from configuration, connecting to NATS and the
/// provider as configured.
///
/// # Errors
///
/// Returns a `StartupError` naming the part that could not be created.
pub async fn build(config: &ServerConfig) -> Result<Runtime, Report<StartupError>> {
    let backend = OpenAiBackend::new(config.provider.backend_config())
        .map_err(|e| e.context(StartupError::Provider))?;
    info!(model = %config.provider.model, base_url = %config.provider.base_url, "provider configured");

    let registry = match &config.tools_file {
        Some(path) => load_registry(path).map_err(|e| e.context(StartupError::Tools))?,
        None => ToolRegistry::new(),
    };
    info!(tools = ?registry.names(), "tool registry ready");

    let (stores, queue) = match &config.nats {
        Some(nats) => {
            let jetstream = nats
                .connect()
                .await
                .map_err(|e| e.context(StartupError::State))?;
            let stores = nats
                .open_stores(&jetstream)
                .await
                .map_err(|e| e.context(StartupError::State))?;
            let queue = NatsJobQueue::open(jetstream, nats.jobs())
                .await
                .map_err(|e| e.context(StartupError::Queue))?;
            info!(url = %nats.url, "using NATS state and job queue");
            (stores, Some(Arc::new(queue)))
        }
        None => {
            info!("no NATS configured, using in-memory state and inline turns");
            (ConversationStores::in_memory(), None)
        }
    };

    let delivery: Arc<dyn DeliveryAdapter> = match &config.delivery {
        Some(endpoint) => Arc::new(
            HttpDeliveryAdapter::new(endpoint.clone()).map_err(|e| e.context(StartupError::Adapter))?,
        ),
        None => Arc::new(LogDeliveryAdapter),
    };
    let correlator: Arc<dyn RecordCorrelator> = match &config.correlation {
        Some(endpoint) => Arc::new(
            HttpRecordCorrelator::new(endpoint.clone())
                .map_err(|e| e.context(StartupError::Adapter))?,
        ),
        None => Arc::new(NoopCorrelator),
    };

    let mut dispatcher = assemble(
        config,
        stores,
        Arc::new(backend),
        registry,
        delivery,
        correlator,
    )?;
    if let Some(queue) = &queue {
        let queue: Arc<dyn JobQueue> = queue.clone();
        dispatcher = dispatcher.with_queue(queue);
    }

    let state = Arc::new(AppState {
        dispatcher: Arc::new(dispatcher),
    });
    Ok(Runtime { state, queue })
}

/// Assembles the dispatcher from already-created parts.
///
/// # Errors
///
/// Returns `StartupError::Configuration` if the instructions file cannot
/// be read.
pub fn assemble(
    config: &ServerConfig,
    stores: ConversationStores,
    backend: Arc<dyn LlmBackend>,
    registry: ToolRegistry,
    delivery: Arc<dyn DeliveryAdapter>,
    correlator: Arc<dyn RecordCorrelator>,
) -> Result<InboundDispatcher, Report<StartupError>> {
    let conversation = &config.conversation;
    let instructions =
        conversation
            .load_instructions()
            .map_err(|e| StartupError::Configuration {
                reason: format!("cannot read instructions file: {e}"),
            })?;

    let mut coordinate = CoordinateConfig::new(backend.model())
        .with_max_iterations(conversation.max_iterations)
        .with_timeout(Duration::from_secs(conversation.turn_timeout_seconds))
        .with_tools(registry.to_llm_format());
    if let Some(instructions) = instructions {
        coordinate = coordinate.with_instructions(instructions);
    }

    let tools = ToolDispatcher::new(Arc::new(registry))
        .with_policy(conversation.sanitize_policy())
        .with_tool_timeout(Duration::from_secs(conversation.tool_timeout_seconds));

    let engine = ConversationEngine::new(
        &stores,
        Arc::new(tools),
        Coordinator::new(backend, coordinate),
    );
    let gate = HandoffGate::new(stores.activity.clone())
        .with_cooldown(Duration::from_secs(config.handoff.cooldown_seconds));

    Ok(InboundDispatcher::new(DispatcherParts {
        engine: Arc::new(engine),
        sessions: stores.sessions,
        languages: stores.languages,
        gate,
        dedup: Arc::new(MessageDeduplicator::new()),
        delivery,
        correlator,
    })
    .with_settings(config.dispatch.settings()))
}
