//! Deferred conversation turns.
//!
//! When workers are available, the inbound dispatcher publishes a
//! [`TurnJob`] to a JetStream work-queue stream instead of running the
//! turn on the webhook request. Work-queue retention removes a message
//! once it is acknowledged, so each job is consumed by one worker.

use crate::error::QueueError;
use async_nats::jetstream;
use async_nats::jetstream::AckKind;
use async_nats::jetstream::consumer::{AckPolicy, pull};
use async_trait::async_trait;
use futures::StreamExt;
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{EventId, Identity};
use tracing::{debug, info, instrument, warn};

/// Durable consumer shared by all workers.
const WORKER_CONSUMER: &str = "switchboard-workers";

/// How long the worker availability check may take before it counts as "no".
const WORKER_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Default time a worker has to acknowledge a job before redelivery.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(300);

/// One deferred conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnJob {
    /// Who the turn is for.
    pub identity: Identity,
    /// Composed provider input.
    pub input: String,
    /// Inbound message to reply under.
    pub reply_to: Option<EventId>,
}

/// Queue of deferred turns.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Best-effort check that some worker is listening.
    async fn has_workers(&self) -> bool;

    /// Publishes a job.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::PublishFailed` if the job was not accepted.
    async fn enqueue(&self, job: &TurnJob) -> Result<(), Report<QueueError>>;
}

/// Runs deferred turns.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs one job to completion, including reply delivery.
    async fn process(&self, job: TurnJob);
}

/// How a consumed job message is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    /// Remove the job from the stream.
    Ack,
    /// Remove the job and never redeliver it.
    Terminate,
}

/// Decodes `payload` and runs it through `handler`.
async fn settle(payload: &[u8], handler: &dyn JobHandler) -> Settlement {
    match serde_json::from_slice::<TurnJob>(payload) {
        Ok(job) => {
            debug!(identity = %job.identity, "running deferred turn");
            handler.process(job).await;
            Settlement::Ack
        }
        Err(e) => {
            warn!(error = %e, "discarding undecodable job");
            Settlement::Terminate
        }
    }
}

/// JetStream work-queue implementation of [`JobQueue`].
pub struct NatsJobQueue {
    jetstream: jetstream::Context,
    stream: jetstream::stream::Stream,
    subject: String,
    ack_wait: Duration,
}

impl NatsJobQueue {
    /// Opens (creating if needed) the work-queue stream `stream_name`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Unavailable` if the stream cannot be created.
    pub async fn open(
        jetstream: jetstream::Context,
        stream_name: &str,
    ) -> Result<Self, Report<QueueError>> {
        let subject = format!("{stream_name}.turns");
        let stream = jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_name.to_string(),
                subjects: vec![subject.clone()],
                storage: jetstream::stream::StorageType::File,
                retention: jetstream::stream::RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::Unavailable {
                reason: format!("failed to create work stream {stream_name}: {e}"),
            })?;

        Ok(Self {
            jetstream,
            stream,
            subject,
            ack_wait: DEFAULT_ACK_WAIT,
        })
    }

    /// Sets how long a worker may hold a job unacknowledged.
    #[must_use]
    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Pulls jobs forever, running each through `handler`.
    ///
    /// Jobs are acknowledged after the handler returns, whatever the
    /// outcome; the handler is responsible for telling the user. Payloads
    /// that do not decode are terminated so they are not redelivered.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConsumeFailed` if the consumer cannot be
    /// created or the message stream breaks.
    pub async fn run_worker(&self, handler: Arc<dyn JobHandler>) -> Result<(), Report<QueueError>> {
        let consumer = self
            .stream
            .get_or_create_consumer(
                WORKER_CONSUMER,
                pull::Config {
                    durable_name: Some(WORKER_CONSUMER.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.ack_wait,
                    max_deliver: 3,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::ConsumeFailed {
                reason: format!("failed to create consumer: {e}"),
            })?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| QueueError::ConsumeFailed {
                reason: format!("failed to get messages: {e}"),
            })?;

        info!(subject = %self.subject, "job worker started");

        while let Some(message) = messages.next().await {
            let message = message.map_err(|e| QueueError::ConsumeFailed {
                reason: e.to_string(),
            })?;

            let ack = match settle(&message.payload, handler.as_ref()).await {
                Settlement::Ack => message.ack().await,
                Settlement::Terminate => message.ack_with(AckKind::Term).await,
            };
            if let Err(e) = ack {
                warn!(error = %e, "failed to acknowledge job");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl JobQueue for NatsJobQueue {
    async fn has_workers(&self) -> bool {
        let lookup = self.stream.consumer_info(WORKER_CONSUMER);
        match tokio::time::timeout(WORKER_CHECK_TIMEOUT, lookup).await {
            Ok(Ok(info)) => info.num_waiting > 0,
            Ok(Err(e)) => {
                debug!(error = %e, "no worker consumer");
                false
            }
            Err(_) => {
                warn!("worker availability check timed out");
                false
            }
        }
    }

    #[instrument(skip(self, job), fields(identity = %job.identity))]
    async fn enqueue(&self, job: &TurnJob) -> Result<(), Report<QueueError>> {
        let bytes = serde_json::to_vec(job).map_err(|e| QueueError::InvalidJob {
            reason: e.to_string(),
        })?;

        self.jetstream
            .publish(self.subject.clone(), bytes.into())
            .await
            .map_err(|e| QueueError::PublishFailed {
                reason: e.to_string(),
            })?
            .await
            .map_err(|e| QueueError::PublishFailed {
                reason: e.to_string(),
            })?;

        Ok(())
    }
}
