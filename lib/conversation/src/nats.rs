//! NATS JetStream key-value buckets.
//!
//! Each store map lives in its own KV bucket. JetStream KV gives per-key
//! atomic `put`, `create` (put-if-absent) and revision-checked `update`,
//! which is what session convergence and continuation commits rely on
//! across processes.
//!
//! Identities such as `+391234` contain characters NATS does not allow in
//! keys, so keys are base64url-encoded on the way in.

use crate::error::StoreError;
use crate::store::{ConversationStores, KvBucket, Versioned};
use async_nats::jetstream;
use async_nats::jetstream::kv::{self, CreateErrorKind, UpdateErrorKind};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rootcause::prelude::Report;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::info;

/// Default bucket for identity → session.
const SESSIONS_BUCKET: &str = "switchboard-sessions";

/// Default bucket for session → continuation token.
const CONTINUATIONS_BUCKET: &str = "switchboard-continuations";

/// Default bucket for identity → human activity.
const ACTIVITY_BUCKET: &str = "switchboard-human-activity";

/// Default bucket for identity → language.
const LANGUAGES_BUCKET: &str = "switchboard-languages";

/// Default work-queue stream for deferred turns.
const JOBS_STREAM: &str = "SWITCHBOARD_JOBS";

/// Connection and naming for NATS-backed state.
#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL.
    pub url: String,
    /// Session bucket name (defaults to switchboard-sessions).
    #[serde(default)]
    pub sessions_bucket: Option<String>,
    /// Continuation bucket name (defaults to switchboard-continuations).
    #[serde(default)]
    pub continuations_bucket: Option<String>,
    /// Human-activity bucket name (defaults to switchboard-human-activity).
    #[serde(default)]
    pub activity_bucket: Option<String>,
    /// Language bucket name (defaults to switchboard-languages).
    #[serde(default)]
    pub languages_bucket: Option<String>,
    /// Deferred job stream name (defaults to SWITCHBOARD_JOBS).
    #[serde(default)]
    pub jobs_stream: Option<String>,
}

impl NatsConfig {
    /// Creates a new config with the given NATS URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sessions_bucket: None,
            continuations_bucket: None,
            activity_bucket: None,
            languages_bucket: None,
            jobs_stream: None,
        }
    }

    fn sessions(&self) -> &str {
        self.sessions_bucket.as_deref().unwrap_or(SESSIONS_BUCKET)
    }

    fn continuations(&self) -> &str {
        self.continuations_bucket
            .as_deref()
            .unwrap_or(CONTINUATIONS_BUCKET)
    }

    fn activity(&self) -> &str {
        self.activity_bucket.as_deref().unwrap_or(ACTIVITY_BUCKET)
    }

    fn languages(&self) -> &str {
        self.languages_bucket.as_deref().unwrap_or(LANGUAGES_BUCKET)
    }

    /// Returns the deferred job stream name.
    #[must_use]
    pub fn jobs(&self) -> &str {
        self.jobs_stream.as_deref().unwrap_or(JOBS_STREAM)
    }

    /// Connects and returns a JetStream context.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the server is unreachable.
    pub async fn connect(&self) -> Result<jetstream::Context, Report<StoreError>> {
        let client = async_nats::connect(&self.url)
            .await
            .map_err(|e| StoreError::ConnectionFailed {
                reason: e.to_string(),
            })?;
        Ok(jetstream::new(client))
    }

    /// Opens (creating where needed) all four store buckets.
    ///
    /// # Errors
    ///
    /// Returns an error if any bucket cannot be opened.
    pub async fn open_stores(
        &self,
        jetstream: &jetstream::Context,
    ) -> Result<ConversationStores, Report<StoreError>> {
        let sessions = NatsKvBucket::open(jetstream, self.sessions()).await?;
        let continuations = NatsKvBucket::open(jetstream, self.continuations()).await?;
        let activity = NatsKvBucket::open(jetstream, self.activity()).await?;
        let languages = NatsKvBucket::open(jetstream, self.languages()).await?;

        Ok(ConversationStores::from_buckets(
            Arc::new(sessions),
            Arc::new(continuations),
            Arc::new(activity),
            Arc::new(languages),
        ))
    }
}

/// A JetStream KV bucket holding JSON values.
pub struct NatsKvBucket {
    name: String,
    store: kv::Store,
}

impl NatsKvBucket {
    /// Opens `name`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the bucket cannot be
    /// opened or created.
    pub async fn open(
        jetstream: &jetstream::Context,
        name: &str,
    ) -> Result<Self, Report<StoreError>> {
        let store = match jetstream.get_key_value(name).await {
            Ok(store) => store,
            Err(_) => {
                info!(bucket = name, "creating key-value bucket");
                jetstream
                    .create_key_value(kv::Config {
                        bucket: name.to_string(),
                        history: 1,
                        storage: jetstream::stream::StorageType::File,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| StoreError::ConnectionFailed {
                        reason: format!("failed to create bucket {name}: {e}"),
                    })?
            }
        };

        Ok(Self {
            name: name.to_string(),
            store,
        })
    }

    fn encode_key(key: &str) -> String {
        URL_SAFE_NO_PAD.encode(key.as_bytes())
    }

    fn encode_value(&self, key: &str, value: &JsonValue) -> Result<Vec<u8>, Report<StoreError>> {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::WriteFailed {
            bucket: self.name.clone(),
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(bytes)
    }
}

#[async_trait]
impl KvBucket for NatsKvBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_versioned(&self, key: &str) -> Result<Versioned, Report<StoreError>> {
        let entry = self
            .store
            .entry(Self::encode_key(key))
            .await
            .map_err(|e| StoreError::ReadFailed {
                bucket: self.name.clone(),
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        match entry {
            Some(entry) => versioned(&self.name, key, entry.operation, entry.revision, &entry.value),
            None => Ok(Versioned {
                value: None,
                revision: 0,
            }),
        }
    }

    async fn update(
        &self,
        key: &str,
        value: &JsonValue,
        revision: u64,
    ) -> Result<bool, Report<StoreError>> {
        if revision == 0 {
            return self.create(key, value).await;
        }
        let bytes = self.encode_value(key, value)?;
        let result = self
            .store
            .update(Self::encode_key(key), bytes.into(), revision)
            .await;
        update_outcome(&self.name, key, result)
    }

    async fn put(&self, key: &str, value: &JsonValue) -> Result<(), Report<StoreError>> {
        let bytes = self.encode_value(key, value)?;
        self.store
            .put(Self::encode_key(key), bytes.into())
            .await
            .map_err(|e| StoreError::WriteFailed {
                bucket: self.name.clone(),
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn create(&self, key: &str, value: &JsonValue) -> Result<bool, Report<StoreError>> {
        let bytes = self.encode_value(key, value)?;
        let result = self.store.create(Self::encode_key(key), bytes.into()).await;
        create_outcome(&self.name, key, result)
    }

    async fn delete(&self, key: &str) -> Result<(), Report<StoreError>> {
        self.store
            .delete(Self::encode_key(key))
            .await
            .map_err(|e| StoreError::WriteFailed {
                bucket: self.name.clone(),
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// Delete and purge markers read as absent but keep their revision, so a
/// conditional write can still detect that the key moved.
fn versioned(
    bucket: &str,
    key: &str,
    operation: kv::Operation,
    revision: u64,
    bytes: &[u8],
) -> Result<Versioned, Report<StoreError>> {
    if operation != kv::Operation::Put {
        return Ok(Versioned {
            value: None,
            revision,
        });
    }
    let value = serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
        bucket: bucket.to_string(),
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Versioned {
        value: Some(value),
        revision,
    })
}

fn create_outcome(
    bucket: &str,
    key: &str,
    result: Result<u64, kv::CreateError>,
) -> Result<bool, Report<StoreError>> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == CreateErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(StoreError::WriteFailed {
            bucket: bucket.to_string(),
            key: key.to_string(),
            reason: e.to_string(),
        }
        .into()),
    }
}

fn update_outcome(
    bucket: &str,
    key: &str,
    result: Result<u64, kv::UpdateError>,
) -> Result<bool, Report<StoreError>> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == UpdateErrorKind::WrongLastRevision => Ok(false),
        Err(e) => Err(StoreError::WriteFailed {
            bucket: bucket.to_string(),
            key: key.to_string(),
            reason: e.to_string(),
        }
        .into()),
    }
}
