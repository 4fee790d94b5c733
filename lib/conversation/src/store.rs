//! Durable per-identity state.
//!
//! Every map is a flat string → JSON bucket with atomic per-key operations.
//! Nothing is cached between operations, so several processes sharing one
//! backend see the same state.
//!
//! Each key carries a revision that changes on every write. Writers that
//! must not overwrite a concurrent change read with
//! [`KvBucket::get_versioned`] and write back with [`KvBucket::update`].

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use switchboard_ai::ContinuationToken;
use switchboard_core::{Identity, SessionId};
use tracing::{debug, info};

/// A value read together with the revision it was written at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    /// The value, or `None` when the key is absent or deleted.
    pub value: Option<JsonValue>,
    /// Revision of the last write to the key; zero if it was never written.
    pub revision: u64,
}

/// Atomic per-key JSON storage.
#[async_trait]
pub trait KvBucket: Send + Sync {
    /// Returns the bucket name, for diagnostics.
    fn name(&self) -> &str;

    /// Reads a key.
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, Report<StoreError>> {
        Ok(self.get_versioned(key).await?.value)
    }

    /// Reads a key and its current revision.
    async fn get_versioned(&self, key: &str) -> Result<Versioned, Report<StoreError>>;

    /// Writes a key only if its revision is still `revision`.
    ///
    /// Returns `false` when another writer changed the key since it was
    /// read.
    async fn update(
        &self,
        key: &str,
        value: &JsonValue,
        revision: u64,
    ) -> Result<bool, Report<StoreError>>;

    /// Writes a key unconditionally.
    async fn put(&self, key: &str, value: &JsonValue) -> Result<(), Report<StoreError>>;

    /// Writes a key only if it is absent.
    ///
    /// Returns `false` when another writer got there first.
    async fn create(&self, key: &str, value: &JsonValue) -> Result<bool, Report<StoreError>>;

    /// Removes a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), Report<StoreError>>;
}

/// Process-local bucket, for tests and single-process development.
#[derive(Debug, Default)]
pub struct InMemoryBucket {
    name: String,
    entries: DashMap<String, (JsonValue, u64)>,
    last_revision: AtomicU64,
}

impl InMemoryBucket {
    /// Creates an empty bucket.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            last_revision: AtomicU64::new(0),
        }
    }

    fn next_revision(&self) -> u64 {
        self.last_revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the bucket is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvBucket for InMemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_versioned(&self, key: &str) -> Result<Versioned, Report<StoreError>> {
        Ok(match self.entries.get(key) {
            Some(entry) => {
                let (value, revision) = entry.value();
                Versioned {
                    value: Some(value.clone()),
                    revision: *revision,
                }
            }
            None => Versioned {
                value: None,
                revision: 0,
            },
        })
    }

    async fn update(
        &self,
        key: &str,
        value: &JsonValue,
        revision: u64,
    ) -> Result<bool, Report<StoreError>> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) if slot.get().1 == revision => {
                slot.insert((value.clone(), self.next_revision()));
                Ok(true)
            }
            Entry::Vacant(slot) if revision == 0 => {
                slot.insert((value.clone(), self.next_revision()));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn put(&self, key: &str, value: &JsonValue) -> Result<(), Report<StoreError>> {
        self.entries
            .insert(key.to_string(), (value.clone(), self.next_revision()));
        Ok(())
    }

    async fn create(&self, key: &str, value: &JsonValue) -> Result<bool, Report<StoreError>> {
        self.update(key, value, 0).await
    }

    async fn delete(&self, key: &str) -> Result<(), Report<StoreError>> {
        self.entries.remove(key);
        Ok(())
    }
}

async fn read_typed<T: DeserializeOwned>(
    bucket: &dyn KvBucket,
    key: &str,
) -> Result<Option<T>, Report<StoreError>> {
    match bucket.get(key).await? {
        Some(value) => decode(bucket, key, value).map(Some),
        None => Ok(None),
    }
}

fn decode<T: DeserializeOwned>(
    bucket: &dyn KvBucket,
    key: &str,
    value: JsonValue,
) -> Result<T, Report<StoreError>> {
    let typed = serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
        bucket: bucket.name().to_string(),
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    Ok(typed)
}

fn encode<T: Serialize>(bucket: &dyn KvBucket, key: &str, value: &T) -> Result<JsonValue, Report<StoreError>> {
    let encoded = serde_json::to_value(value).map_err(|e| StoreError::WriteFailed {
        bucket: bucket.name().to_string(),
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    Ok(encoded)
}

/// Value stored per identity in the session map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// The identity the session belongs to.
    pub identity: Identity,
    /// The session handle.
    pub session_id: SessionId,
    /// When the session was minted.
    pub created_at: DateTime<Utc>,
}

/// Identity → session map.
#[derive(Clone)]
pub struct SessionStore {
    bucket: Arc<dyn KvBucket>,
}

impl SessionStore {
    /// Creates a store over `bucket`.
    #[must_use]
    pub fn new(bucket: Arc<dyn KvBucket>) -> Self {
        Self { bucket }
    }

    /// Reads the full session record for `identity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket read fails or the value is corrupt.
    pub async fn get_record(
        &self,
        identity: &Identity,
    ) -> Result<Option<SessionRecord>, Report<StoreError>> {
        read_typed(self.bucket.as_ref(), identity.as_str()).await
    }

    /// Looks up the session for `identity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket read fails or the value is corrupt.
    pub async fn get_session(
        &self,
        identity: &Identity,
    ) -> Result<Option<SessionId>, Report<StoreError>> {
        Ok(self.get_record(identity).await?.map(|r| r.session_id))
    }

    /// Returns the session for `identity`, minting one on first contact.
    ///
    /// Concurrent first contacts converge: only one `create` wins and every
    /// caller returns the winner's id.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket fails.
    pub async fn get_or_create_session(
        &self,
        identity: &Identity,
    ) -> Result<SessionId, Report<StoreError>> {
        if let Some(existing) = self.get_session(identity).await? {
            return Ok(existing);
        }

        let record = SessionRecord {
            identity: identity.clone(),
            session_id: SessionId::new(),
            created_at: Utc::now(),
        };
        let value = encode(self.bucket.as_ref(), identity.as_str(), &record)?;

        if self.bucket.create(identity.as_str(), &value).await? {
            info!(identity = %identity, session_id = %record.session_id, "created session");
            return Ok(record.session_id);
        }

        debug!(identity = %identity, "lost session creation race, re-reading");
        let winner = self.get_session(identity).await?.ok_or_else(|| StoreError::ReadFailed {
            bucket: self.bucket.name().to_string(),
            key: identity.to_string(),
            reason: "session vanished after conflicting create".to_string(),
        })?;
        Ok(winner)
    }

    /// Removes the session for `identity`, returning the removed id.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket fails.
    pub async fn reset(&self, identity: &Identity) -> Result<Option<SessionId>, Report<StoreError>> {
        let existing = self.get_session(identity).await?;
        if existing.is_some() {
            self.bucket.delete(identity.as_str()).await?;
        }
        Ok(existing)
    }
}

/// A continuation token as read at one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationSnapshot {
    /// The stored token, if any.
    pub token: Option<ContinuationToken>,
    revision: u64,
}

/// Session → continuation token map.
#[derive(Clone)]
pub struct ContinuationStore {
    bucket: Arc<dyn KvBucket>,
}

impl ContinuationStore {
    /// Creates a store over `bucket`.
    #[must_use]
    pub fn new(bucket: Arc<dyn KvBucket>) -> Self {
        Self { bucket }
    }

    /// Reads the latest token for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket read fails or the value is corrupt.
    pub async fn get_continuation(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ContinuationToken>, Report<StoreError>> {
        let token: Option<ContinuationToken> =
            read_typed(self.bucket.as_ref(), &session_id.to_string()).await?;
        Ok(token.filter(|t| !t.is_empty()))
    }

    /// Reads the latest token for `session_id` together with the revision
    /// a later [`commit`](Self::commit) must match.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket read fails or the value is corrupt.
    pub async fn snapshot(
        &self,
        session_id: &SessionId,
    ) -> Result<ContinuationSnapshot, Report<StoreError>> {
        let key = session_id.to_string();
        let Versioned { value, revision } = self.bucket.get_versioned(&key).await?;
        let token = match value {
            Some(value) => Some(decode::<ContinuationToken>(self.bucket.as_ref(), &key, value)?),
            None => None,
        };
        Ok(ContinuationSnapshot {
            token: token.filter(|t| !t.is_empty()),
            revision,
        })
    }

    /// Stores `token` unless the entry changed since `snapshot` was taken.
    ///
    /// Returns `false` on a concurrent change; nothing is written then.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket write fails.
    pub async fn commit(
        &self,
        session_id: &SessionId,
        snapshot: &ContinuationSnapshot,
        token: &ContinuationToken,
    ) -> Result<bool, Report<StoreError>> {
        let key = session_id.to_string();
        let value = encode(self.bucket.as_ref(), &key, token)?;
        self.bucket.update(&key, &value, snapshot.revision).await
    }

    /// Overwrites the token for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket write fails.
    pub async fn set_continuation(
        &self,
        session_id: &SessionId,
        token: &ContinuationToken,
    ) -> Result<(), Report<StoreError>> {
        let key = session_id.to_string();
        let value = encode(self.bucket.as_ref(), &key, token)?;
        self.bucket.put(&key, &value).await
    }

    /// Forgets the token for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket delete fails.
    pub async fn clear(&self, session_id: &SessionId) -> Result<(), Report<StoreError>> {
        self.bucket.delete(&session_id.to_string()).await
    }
}

/// Identity → last human-operator activity.
#[derive(Clone)]
pub struct HumanActivityStore {
    bucket: Arc<dyn KvBucket>,
}

impl HumanActivityStore {
    /// Creates a store over `bucket`.
    #[must_use]
    pub fn new(bucket: Arc<dyn KvBucket>) -> Self {
        Self { bucket }
    }

    /// Reads the last activity time.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket read fails or the value is corrupt.
    pub async fn last_activity(
        &self,
        identity: &Identity,
    ) -> Result<Option<DateTime<Utc>>, Report<StoreError>> {
        read_typed(self.bucket.as_ref(), identity.as_str()).await
    }

    /// Records activity at `at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket write fails.
    pub async fn record(
        &self,
        identity: &Identity,
        at: DateTime<Utc>,
    ) -> Result<(), Report<StoreError>> {
        let value = encode(self.bucket.as_ref(), identity.as_str(), &at)?;
        self.bucket.put(identity.as_str(), &value).await
    }
}

/// Identity → last detected language code.
#[derive(Clone)]
pub struct LanguageStore {
    bucket: Arc<dyn KvBucket>,
}

impl LanguageStore {
    /// Creates a store over `bucket`.
    #[must_use]
    pub fn new(bucket: Arc<dyn KvBucket>) -> Self {
        Self { bucket }
    }

    /// Reads the stored language.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket read fails or the value is corrupt.
    pub async fn get(&self, identity: &Identity) -> Result<Option<String>, Report<StoreError>> {
        read_typed(self.bucket.as_ref(), identity.as_str()).await
    }

    /// Stores `language` for `identity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket write fails.
    pub async fn set(&self, identity: &Identity, language: &str) -> Result<(), Report<StoreError>> {
        self.bucket
            .put(identity.as_str(), &JsonValue::String(language.to_string()))
            .await
    }

    /// Forgets the language for `identity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket delete fails.
    pub async fn clear(&self, identity: &Identity) -> Result<(), Report<StoreError>> {
        self.bucket.delete(identity.as_str()).await
    }
}

/// The four identity-keyed maps, opened together.
#[derive(Clone)]
pub struct ConversationStores {
    /// Identity → session.
    pub sessions: SessionStore,
    /// Session → continuation token.
    pub continuations: ContinuationStore,
    /// Identity → last human activity.
    pub activity: HumanActivityStore,
    /// Identity → language.
    pub languages: LanguageStore,
}

impl ConversationStores {
    /// Groups stores over already-opened buckets.
    #[must_use]
    pub fn from_buckets(
        sessions: Arc<dyn KvBucket>,
        continuations: Arc<dyn KvBucket>,
        activity: Arc<dyn KvBucket>,
        languages: Arc<dyn KvBucket>,
    ) -> Self {
        Self {
            sessions: SessionStore::new(sessions),
            continuations: ContinuationStore::new(continuations),
            activity: HumanActivityStore::new(activity),
            languages: LanguageStore::new(languages),
        }
    }

    /// Stores backed by fresh in-memory buckets.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::from_buckets(
            Arc::new(InMemoryBucket::new("sessions")),
            Arc::new(InMemoryBucket::new("continuations")),
            Arc::new(InMemoryBucket::new("human_activity")),
            Arc::new(InMemoryBucket::new("languages")),
        )
    }
}
