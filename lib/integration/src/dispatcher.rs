//! Inbound dispatcher.
//!
//! Decides, for each event from the messaging channel, whether an
//! automated turn should run, and where:
//!
//! 1. outgoing operator messages mark the recipient active and stop
//! 2. duplicates, reactions and empty messages are skipped
//! 3. identities inside their handoff cooldown are skipped
//! 4. the business record is correlated (best effort), the language is
//!    remembered and the session is resolved
//! 5. the turn runs inline, or is published for a worker when one is
//!    listening; a failed publish falls back to inline
//!
//! Fatal turn failures are answered with a fallback reply.

use crate::connector::{DeliveryAdapter, RecordCorrelator};
use crate::error::DispatchError;
use crate::event::{Direction, InboundEvent, detect_language};
use crate::queue::{JobHandler, JobQueue, TurnJob};
use async_trait::async_trait;
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use switchboard_conversation::{
    ConversationEngine, HandoffGate, LanguageStore, MessageDeduplicator, SessionStore,
    fallback_event_id,
};
use switchboard_core::{EventId, Identity, SessionId};
use tracing::{error, info, instrument, warn};

/// Reply sent when a turn fails.
pub const DEFAULT_FALLBACK_REPLY: &str =
    "Mi dispiace, al momento non riesco a rispondere. Un operatore ti ricontatterà a breve.";

/// Why an event did not produce a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Operator message; recipient marked active.
    Outgoing,
    /// Event id already seen.
    Duplicate,
    /// Reaction-only payload.
    Reaction,
    /// No text and nothing else to say.
    EmptyInput,
    /// A human operator is handling this identity.
    HumanActive,
}

/// What happened to an inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// No turn ran.
    Skipped { reason: SkipReason },
    /// The turn was handed to a worker.
    Deferred { session_id: SessionId },
    /// The turn ran here.
    Completed(TurnOutcome),
}

/// Result of running one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// The engine produced a reply.
    Replied {
        session_id: SessionId,
        partial: bool,
        delivered: bool,
    },
    /// The engine failed; the fallback reply may have been sent.
    Failed { fallback_delivered: bool },
}

/// Knobs for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DispatchSettings {
    /// Never defer, even when workers are listening.
    #[serde(default)]
    pub force_inline: bool,
    /// Deliver replies. When false, turns still run.
    #[serde(default = "default_autoreply")]
    pub autoreply: bool,
    /// Text sent after a failed turn.
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
}

fn default_autoreply() -> bool {
    true
}

fn default_fallback_reply() -> String {
    DEFAULT_FALLBACK_REPLY.to_string()
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            force_inline: false,
            autoreply: default_autoreply(),
            fallback_reply: default_fallback_reply(),
        }
    }
}

/// Shared pieces the dispatcher is built from.
pub struct DispatcherParts {
    pub engine: Arc<ConversationEngine>,
    pub sessions: SessionStore,
    pub languages: LanguageStore,
    pub gate: HandoffGate,
    pub dedup: Arc<MessageDeduplicator>,
    /// Where replies go.
    pub delivery: Arc<dyn DeliveryAdapter>,
    /// Business-record hook, called before each turn.
    pub correlator: Arc<dyn RecordCorrelator>,
}

/// Routes inbound events into conversation turns.
pub struct InboundDispatcher {
    engine: Arc<ConversationEngine>,
    sessions: SessionStore,
    languages: LanguageStore,
    gate: HandoffGate,
    dedup: Arc<MessageDeduplicator>,
    delivery: Arc<dyn DeliveryAdapter>,
    correlator: Arc<dyn RecordCorrelator>,
    queue: Option<Arc<dyn JobQueue>>,
    settings: DispatchSettings,
}

impl InboundDispatcher {
    /// Creates a dispatcher that runs every turn inline.
    #[must_use]
    pub fn new(parts: DispatcherParts) -> Self {
        Self {
            engine: parts.engine,
            sessions: parts.sessions,
            languages: parts.languages,
            gate: parts.gate,
            dedup: parts.dedup,
            delivery: parts.delivery,
            correlator: parts.correlator,
            queue: None,
            settings: DispatchSettings::default(),
        }
    }

    /// Sets the deferred job queue.
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Sets the dispatch settings.
    #[must_use]
    pub fn with_settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Returns the handoff gate.
    #[must_use]
    pub fn gate(&self) -> &HandoffGate {
        &self.gate
    }

    /// Returns the deduplicator.
    #[must_use]
    pub fn dedup(&self) -> &MessageDeduplicator {
        &self.dedup
    }

    /// Returns the conversation engine.
    #[must_use]
    pub fn engine(&self) -> &ConversationEngine {
        &self.engine
    }

    /// Handles one inbound event.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::State` when recording operator activity
    /// fails. Turn failures, including failing to resolve the session, are
    /// not errors; they end in [`TurnOutcome::Failed`].
    #[instrument(skip(self, event), fields(from = %event.from, direction = ?event.direction))]
    pub async fn handle(
        &self,
        event: InboundEvent,
    ) -> Result<DispatchOutcome, Report<DispatchError>> {
        if event.direction == Direction::Outgoing {
            match &event.to {
                Some(to) => self.gate.mark_active(to).await.map_err(|e| {
                    e.context(DispatchError::State {
                        operation: "mark_active",
                    })
                })?,
                None => warn!("outgoing event without recipient"),
            }
            return Ok(skipped(SkipReason::Outgoing));
        }

        let event_id = event
            .event_id
            .clone()
            .unwrap_or_else(|| fallback_event_id(&event.from, event.timestamp, &event.text));
        if !self.dedup.register(&event_id) {
            info!(event_id = %event_id, "duplicate event");
            return Ok(skipped(SkipReason::Duplicate));
        }

        if event.is_reaction() {
            return Ok(skipped(SkipReason::Reaction));
        }
        if event.text.trim().is_empty() && event.is_text() {
            return Ok(skipped(SkipReason::EmptyInput));
        }

        let identity = &event.from;
        match self.gate.is_suppressed(identity).await {
            Ok(true) => {
                info!(identity = %identity, "human active recently, skipping automated reply");
                return Ok(skipped(SkipReason::HumanActive));
            }
            Ok(false) => {}
            Err(report) => warn!(error = %report, "handoff check failed, continuing"),
        }

        if let Err(report) = self.correlator.ensure_record(identity).await {
            warn!(error = %report, "record correlation failed (non-fatal)");
        }

        let language = self.remember_language(identity, &event.text).await;
        let Some(input) = event.compose_input(language.as_deref()) else {
            return Ok(skipped(SkipReason::EmptyInput));
        };

        let session_id = match self.sessions.get_or_create_session(identity).await {
            Ok(session_id) => session_id,
            Err(report) => {
                error!(identity = %identity, error = %report, "failed to resolve session");
                self.dedup.forget(&event_id);
                let fallback_delivered = self.send_fallback(identity, Some(&event_id)).await;
                return Ok(DispatchOutcome::Completed(TurnOutcome::Failed {
                    fallback_delivered,
                }));
            }
        };

        let job = TurnJob {
            identity: identity.clone(),
            input,
            reply_to: Some(event_id),
        };

        if let Some(queue) = self.deferral_queue().await {
            match queue.enqueue(&job).await {
                Ok(()) => {
                    info!(session_id = %session_id, "turn deferred to worker");
                    return Ok(DispatchOutcome::Deferred { session_id });
                }
                Err(report) => {
                    warn!(error = %report, "enqueue failed, falling back to inline processing");
                }
            }
        }

        Ok(DispatchOutcome::Completed(self.run_turn(job).await))
    }

    /// Runs one turn and delivers its reply (or the fallback).
    pub async fn run_turn(&self, job: TurnJob) -> TurnOutcome {
        let TurnJob {
            identity,
            input,
            reply_to,
        } = job;

        match self.engine.respond(&identity, &input).await {
            Ok(reply) => {
                let delivered = if self.settings.autoreply && !reply.text.is_empty() {
                    self.deliver(&identity, &reply.text, reply_to.as_ref()).await
                } else {
                    info!(
                        autoreply = self.settings.autoreply,
                        chars = reply.text.chars().count(),
                        "reply not delivered"
                    );
                    false
                };
                TurnOutcome::Replied {
                    session_id: reply.session_id,
                    partial: reply.partial,
                    delivered,
                }
            }
            Err(report) => {
                error!(identity = %identity, error = %report, "conversation turn failed");
                let fallback_delivered = self.send_fallback(&identity, reply_to.as_ref()).await;
                TurnOutcome::Failed { fallback_delivered }
            }
        }
    }

    async fn send_fallback(&self, to: &Identity, reply_to: Option<&EventId>) -> bool {
        self.settings.autoreply && self.deliver(to, &self.settings.fallback_reply, reply_to).await
    }

    async fn deliver(&self, to: &Identity, text: &str, reply_to: Option<&EventId>) -> bool {
        match self.delivery.deliver(to, text, reply_to).await {
            Ok(_) => true,
            Err(report) => {
                error!(to = %to, error = %report, "reply delivery failed");
                false
            }
        }
    }

    /// Returns the queue to defer to, if deferral is on and a worker
    /// appears to be listening.
    async fn deferral_queue(&self) -> Option<&Arc<dyn JobQueue>> {
        if self.settings.force_inline {
            return None;
        }
        let queue = self.queue.as_ref()?;
        if queue.has_workers().await {
            Some(queue)
        } else {
            info!("no workers listening, processing inline");
            None
        }
    }

    async fn remember_language(&self, identity: &Identity, text: &str) -> Option<String> {
        let stored = match self.languages.get(identity).await {
            Ok(stored) => stored,
            Err(report) => {
                warn!(error = %report, "language lookup failed");
                None
            }
        };
        if text.trim().is_empty() {
            return stored;
        }

        let detected = detect_language(text);
        if stored.as_deref() != Some(detected) {
            if let Err(report) = self.languages.set(identity, detected).await {
                warn!(error = %report, "failed to store language");
            }
        }
        Some(detected.to_string())
    }
}

fn skipped(reason: SkipReason) -> DispatchOutcome {
    DispatchOutcome::Skipped { reason }
}

#[async_trait]
impl JobHandler for InboundDispatcher {
    async fn process(&self, job: TurnJob) {
        let outcome = self.run_turn(job).await;
        info!(?outcome, "deferred turn finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{DeliveryRecord, NoopCorrelator};
    use crate::error::{ConnectorError, QueueError};
    use chrono::Duration as ChronoDuration;
    use serde_json::Value as JsonValue;
    use std::sync::Mutex;
    use switchboard_ai::{
        ContinuationToken, CoordinateConfig, Coordinator, InputItem, LlmBackend, LlmError,
        OutputItem, ProviderRequest, ProviderResponse,
    };
    use switchboard_conversation::{
        ConversationStores, InMemoryBucket, KvBucket, StoreError, ToolDispatcher, ToolRegistry,
        Versioned,
    };
    use switchboard_core::ManualClock;

    /// Backend answering "ok" to everything, or failing when told to.
    #[derive(Default)]
    struct StubBackend {
        inputs: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl LlmBackend for StubBackend {
        async fn respond(
            &self,
            request: &ProviderRequest,
        ) -> Result<ProviderResponse, Report<LlmError>> {
            let user = request
                .input
                .iter()
                .find_map(|item| match item {
                    InputItem::User { text } => Some(text.clone()),
                    _ => None,
                })
                .unwrap_or_default();
            let n = {
                let mut inputs = self.inputs.lock().unwrap();
                inputs.push(user);
                inputs.len()
            };
            if self.fail {
                return Err(LlmError::ProviderUnavailable {
                    provider: "stub".to_string(),
                    reason: "down".to_string(),
                }
                .into());
            }
            Ok(ProviderResponse {
                continuation: ContinuationToken::new(format!("resp_{n}")),
                model: "stub-model".to_string(),
                output: vec![OutputItem::Text("ok".to_string())],
            })
        }

        fn model(&self) -> &str {
            "stub-model"
        }
    }

    #[derive(Default)]
    struct RecordingDelivery {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl DeliveryAdapter for RecordingDelivery {
        async fn deliver(
            &self,
            to: &Identity,
            text: &str,
            _reply_to: Option<&EventId>,
        ) -> Result<DeliveryRecord, Report<ConnectorError>> {
            if self.fail {
                return Err(ConnectorError::Timeout.into());
            }
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), text.to_string()));
            Ok(DeliveryRecord::default())
        }
    }

    struct FailingCorrelator;

    #[async_trait]
    impl RecordCorrelator for FailingCorrelator {
        async fn ensure_record(&self, _identity: &Identity) -> Result<(), Report<ConnectorError>> {
            Err(ConnectorError::ConnectionFailed {
                reason: "crm offline".to_string(),
            }
            .into())
        }
    }

    #[derive(Default)]
    struct FakeQueue {
        workers: bool,
        broken: bool,
        jobs: Mutex<Vec<TurnJob>>,
    }

    #[async_trait]
    impl JobQueue for FakeQueue {
        async fn has_workers(&self) -> bool {
            self.workers
        }

        async fn enqueue(&self, job: &TurnJob) -> Result<(), Report<QueueError>> {
            if self.broken {
                return Err(QueueError::PublishFailed {
                    reason: "no responders".to_string(),
                }
                .into());
            }
            self.jobs.lock().unwrap().push(job.clone());
            Ok(())
        }
    }

    struct Harness {
        dispatcher: InboundDispatcher,
        backend: Arc<StubBackend>,
        delivery: Arc<RecordingDelivery>,
        clock: ManualClock,
        stores: ConversationStores,
    }

    /// Session bucket that cannot reach its backend.
    struct BrokenBucket;

    #[async_trait]
    impl KvBucket for BrokenBucket {
        fn name(&self) -> &str {
            "sessions"
        }

        async fn get_versioned(&self, _key: &str) -> Result<Versioned, Report<StoreError>> {
            Err(StoreError::ConnectionFailed {
                reason: "nats down".to_string(),
            }
            .into())
        }

        async fn update(
            &self,
            _key: &str,
            _value: &JsonValue,
            _revision: u64,
        ) -> Result<bool, Report<StoreError>> {
            Err(StoreError::ConnectionFailed {
                reason: "nats down".to_string(),
            }
            .into())
        }

        async fn put(&self, _key: &str, _value: &JsonValue) -> Result<(), Report<StoreError>> {
            Err(StoreError::ConnectionFailed {
                reason: "nats down".to_string(),
            }
            .into())
        }

        async fn create(&self, _key: &str, _value: &JsonValue) -> Result<bool, Report<StoreError>> {
            Err(StoreError::ConnectionFailed {
                reason: "nats down".to_string(),
            }
            .into())
        }

        async fn delete(&self, _key: &str) -> Result<(), Report<StoreError>> {
            Err(StoreError::ConnectionFailed {
                reason: "nats down".to_string(),
            }
            .into())
        }
    }

    struct Options {
        backend: StubBackend,
        delivery: RecordingDelivery,
        correlator: Arc<dyn RecordCorrelator>,
        sessions: Option<Arc<dyn KvBucket>>,
    }

    impl Default for Options {
        fn default() -> Self {
            Self {
                backend: StubBackend::default(),
                delivery: RecordingDelivery::default(),
                correlator: Arc::new(NoopCorrelator),
                sessions: None,
            }
        }
    }

    fn harness(options: Options) -> Harness {
        let backend = Arc::new(options.backend);
        let delivery = Arc::new(options.delivery);
        let stores = match options.sessions {
            Some(sessions) => ConversationStores::from_buckets(
                sessions,
                Arc::new(InMemoryBucket::new("continuations")),
                Arc::new(InMemoryBucket::new("human_activity")),
                Arc::new(InMemoryBucket::new("languages")),
            ),
            None => ConversationStores::in_memory(),
        };
        let clock = ManualClock::default();

        let engine = ConversationEngine::new(
            &stores,
            Arc::new(ToolDispatcher::new(Arc::new(ToolRegistry::new()))),
            Coordinator::new(backend.clone(), CoordinateConfig::new("stub-model")),
        );
        let gate = HandoffGate::new(stores.activity.clone()).with_clock(Arc::new(clock.clone()));

        let dispatcher = InboundDispatcher::new(DispatcherParts {
            engine: Arc::new(engine),
            sessions: stores.sessions.clone(),
            languages: stores.languages.clone(),
            gate,
            dedup: Arc::new(MessageDeduplicator::new()),
            delivery: delivery.clone(),
            correlator: options.correlator,
        });

        Harness {
            dispatcher,
            backend,
            delivery,
            clock,
            stores,
        }
    }

    fn identity(s: &str) -> Identity {
        s.parse().unwrap()
    }

    fn message(id: &str, text: &str) -> InboundEvent {
        InboundEvent::incoming(identity("+391234"), text).with_event_id(id.parse().unwrap())
    }

    fn calls(h: &Harness) -> usize {
        h.backend.inputs.lock().unwrap().len()
    }

    #[tokio::test]
    async fn human_activity_suppresses_until_cooldown_elapses() {
        let h = harness(Options::default());
        h.dispatcher
            .gate()
            .mark_active(&identity("+391234"))
            .await
            .unwrap();

        let outcome = h.dispatcher.handle(message("m1", "ciao")).await.unwrap();
        assert_eq!(outcome, skipped(SkipReason::HumanActive));
        assert_eq!(calls(&h), 0);

        h.clock.advance(ChronoDuration::seconds(301));
        let outcome = h.dispatcher.handle(message("m2", "ciao")).await.unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Completed(TurnOutcome::Replied {
                delivered: true,
                ..
            })
        ));
        assert_eq!(
            *h.delivery.sent.lock().unwrap(),
            vec![("+391234".to_string(), "ok".to_string())]
        );
    }

    #[tokio::test]
    async fn outgoing_message_marks_recipient_active() {
        let h = harness(Options::default());
        let operator = InboundEvent::outgoing(identity("+390000"), identity("+391234"), "Sono Marco");

        let outcome = h.dispatcher.handle(operator).await.unwrap();
        assert_eq!(outcome, skipped(SkipReason::Outgoing));

        let outcome = h.dispatcher.handle(message("m1", "ciao")).await.unwrap();
        assert_eq!(outcome, skipped(SkipReason::HumanActive));
    }

    #[tokio::test]
    async fn duplicate_events_run_once() {
        let h = harness(Options::default());
        let first = h.dispatcher.handle(message("m1", "ciao")).await.unwrap();
        let second = h.dispatcher.handle(message("m1", "ciao")).await.unwrap();

        assert!(matches!(first, DispatchOutcome::Completed(_)));
        assert_eq!(second, skipped(SkipReason::Duplicate));
        assert_eq!(calls(&h), 1);
    }

    #[tokio::test]
    async fn events_without_id_are_deduplicated_by_fallback() {
        let h = harness(Options::default());
        let event = InboundEvent::incoming(identity("+391234"), "ciao");

        h.dispatcher.handle(event.clone()).await.unwrap();
        let again = h.dispatcher.handle(event).await.unwrap();
        assert_eq!(again, skipped(SkipReason::Duplicate));
    }

    #[tokio::test]
    async fn reactions_and_empty_messages_are_skipped() {
        let h = harness(Options::default());
        let reaction = message("m1", "👍").with_content_type("reaction");
        assert_eq!(
            h.dispatcher.handle(reaction).await.unwrap(),
            skipped(SkipReason::Reaction)
        );
        assert_eq!(
            h.dispatcher.handle(message("m2", "  ")).await.unwrap(),
            skipped(SkipReason::EmptyInput)
        );
        assert_eq!(calls(&h), 0);
    }

    #[tokio::test]
    async fn image_without_caption_gets_placeholder_input() {
        let h = harness(Options::default());
        let image = message("m1", "").with_content_type("image");
        h.dispatcher.handle(image).await.unwrap();

        let inputs = h.backend.inputs.lock().unwrap();
        assert!(inputs[0].starts_with("[non-text:image]"));
    }

    #[tokio::test]
    async fn language_is_detected_and_remembered() {
        let h = harness(Options::default());
        h.dispatcher
            .handle(message("m1", "Hola, buenos días"))
            .await
            .unwrap();

        assert_eq!(
            h.stores.languages.get(&identity("+391234")).await.unwrap(),
            Some("es".to_string())
        );
        let inputs = h.backend.inputs.lock().unwrap();
        assert!(inputs[0].contains("\"lang\":\"es\""));
    }

    #[tokio::test]
    async fn correlation_failure_is_not_fatal() {
        let h = harness(Options {
            correlator: Arc::new(FailingCorrelator),
            ..Default::default()
        });
        let outcome = h.dispatcher.handle(message("m1", "ciao")).await.unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Completed(TurnOutcome::Replied { .. })
        ));
    }

    #[tokio::test]
    async fn failed_turn_sends_fallback() {
        let h = harness(Options {
            backend: StubBackend {
                fail: true,
                ..Default::default()
            },
            ..Default::default()
        });
        let outcome = h.dispatcher.handle(message("m1", "ciao")).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Completed(TurnOutcome::Failed {
                fallback_delivered: true
            })
        );
        assert_eq!(h.delivery.sent.lock().unwrap()[0].1, DEFAULT_FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn session_store_failure_sends_fallback_and_allows_retry() {
        let h = harness(Options {
            sessions: Some(Arc::new(BrokenBucket)),
            ..Default::default()
        });

        let outcome = h.dispatcher.handle(message("m1", "ciao")).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Completed(TurnOutcome::Failed {
                fallback_delivered: true
            })
        );
        assert_eq!(
            *h.delivery.sent.lock().unwrap(),
            vec![("+391234".to_string(), DEFAULT_FALLBACK_REPLY.to_string())]
        );

        let redelivered = h.dispatcher.handle(message("m1", "ciao")).await.unwrap();
        assert_ne!(redelivered, skipped(SkipReason::Duplicate));
        assert_eq!(calls(&h), 0);
    }

    #[tokio::test]
    async fn redelivered_event_without_id_or_timestamp_is_duplicate() {
        let h = harness(Options::default());

        h.dispatcher
            .handle(InboundEvent::incoming(identity("+391234"), "ciao"))
            .await
            .unwrap();
        let again = h
            .dispatcher
            .handle(InboundEvent::incoming(identity("+391234"), "ciao"))
            .await
            .unwrap();

        assert_eq!(again, skipped(SkipReason::Duplicate));
        assert_eq!(calls(&h), 1);
    }

    #[tokio::test]
    async fn delivery_failure_is_reported_not_raised() {
        let h = harness(Options {
            delivery: RecordingDelivery {
                fail: true,
                ..Default::default()
            },
            ..Default::default()
        });
        let outcome = h.dispatcher.handle(message("m1", "ciao")).await.unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Completed(TurnOutcome::Replied {
                delivered: false,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn autoreply_off_runs_turn_without_delivery() {
        let h = harness(Options::default());
        let dispatcher = h.dispatcher.with_settings(DispatchSettings {
            autoreply: false,
            ..Default::default()
        });
        let outcome = dispatcher.handle(message("m1", "ciao")).await.unwrap();

        assert!(matches!(
            outcome,
            DispatchOutcome::Completed(TurnOutcome::Replied {
                delivered: false,
                ..
            })
        ));
        assert_eq!(h.backend.inputs.lock().unwrap().len(), 1);
        assert!(h.delivery.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn turn_is_deferred_when_workers_listen() {
        let h = harness(Options::default());
        let queue = Arc::new(FakeQueue {
            workers: true,
            ..Default::default()
        });
        let dispatcher = h.dispatcher.with_queue(queue.clone());

        let outcome = dispatcher.handle(message("m1", "ciao")).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Deferred { .. }));
        assert_eq!(h.backend.inputs.lock().unwrap().len(), 0);

        let job = queue.jobs.lock().unwrap().remove(0);
        assert_eq!(job.reply_to, Some("m1".parse().unwrap()));
        dispatcher.process(job).await;

        assert_eq!(h.backend.inputs.lock().unwrap().len(), 1);
        assert_eq!(h.delivery.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn enqueue_failure_falls_back_to_inline() {
        let h = harness(Options::default());
        let dispatcher = h.dispatcher.with_queue(Arc::new(FakeQueue {
            workers: true,
            broken: true,
            ..Default::default()
        }));

        let outcome = dispatcher.handle(message("m1", "ciao")).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Completed(_)));
        assert_eq!(h.backend.inputs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_workers_or_force_inline_run_inline() {
        let h = harness(Options::default());
        let idle = Arc::new(FakeQueue::default());
        let dispatcher = h.dispatcher.with_queue(idle.clone());
        let outcome = dispatcher.handle(message("m1", "ciao")).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Completed(_)));

        let busy = Arc::new(FakeQueue {
            workers: true,
            ..Default::default()
        });
        let dispatcher = dispatcher.with_queue(busy.clone()).with_settings(DispatchSettings {
            force_inline: true,
            ..Default::default()
        });
        let outcome = dispatcher.handle(message("m2", "ciao")).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Completed(_)));
        assert!(busy.jobs.lock().unwrap().is_empty());
        assert!(idle.jobs.lock().unwrap().is_empty());
    }
}
