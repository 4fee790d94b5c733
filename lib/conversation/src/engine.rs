//! Conversation loop engine.
//!
//! One call to [`ConversationEngine::respond`] is one user turn: resolve the
//! session, run the tool-calling loop from the stored continuation token,
//! then commit the new token.
//!
//! Within one process, turns for the same session are serialized by a
//! per-session async mutex held across the whole read-run-commit sequence,
//! so a second message always resumes from the first message's committed
//! token. Across processes the commit is revision-checked: a turn whose
//! starting token was replaced while it ran is run again from the newer
//! token, up to [`COMMIT_ATTEMPTS`] times.
//!
//! The token is committed only when a turn ends in a final, tool-free
//! answer. Failed, exceeded and partial turns leave the stored token as it
//! was before the turn started.

use crate::dispatch::ToolDispatcher;
use crate::error::{ConversationError, StoreError};
use crate::store::{
    ContinuationStore, ConversationStores, HumanActivityStore, LanguageStore, SessionStore,
};
use crate::tool::ToolContext;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rootcause::prelude::Report;
use serde::Serialize;
use std::sync::Arc;
use switchboard_ai::{CoordinateError, Coordinator};
use switchboard_core::{Identity, SessionId};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// How many times a turn runs before giving up on a contended commit.
pub const COMMIT_ATTEMPTS: u32 = 3;

/// The reply to one user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Assistant text, trimmed. May be empty.
    pub text: String,
    /// The identity's session.
    pub session_id: SessionId,
    /// Model that produced the reply.
    pub model: String,
    /// True when the turn ran out of time and this is recovered text.
    pub partial: bool,
}

/// What is stored for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub identity: Identity,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    /// Log-length prefix of the stored continuation token.
    pub continuation: Option<String>,
    pub language: Option<String>,
    pub last_human_activity: Option<DateTime<Utc>>,
}

/// Serialized, per-session execution of the tool-calling loop.
pub struct ConversationEngine {
    sessions: SessionStore,
    continuations: ContinuationStore,
    languages: LanguageStore,
    activity: HumanActivityStore,
    dispatcher: Arc<ToolDispatcher>,
    coordinator: Coordinator,
    session_locks: DashMap<SessionId, Arc<Mutex<()>>>,
}

impl ConversationEngine {
    /// Creates an engine over `stores`.
    #[must_use]
    pub fn new(
        stores: &ConversationStores,
        dispatcher: Arc<ToolDispatcher>,
        coordinator: Coordinator,
    ) -> Self {
        Self {
            sessions: stores.sessions.clone(),
            continuations: stores.continuations.clone(),
            languages: stores.languages.clone(),
            activity: stores.activity.clone(),
            dispatcher,
            coordinator,
            session_locks: DashMap::new(),
        }
    }

    /// Returns the tool dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    /// Runs one turn for `identity`.
    ///
    /// # Errors
    ///
    /// Returns a `ConversationError` naming the terminal failure:
    /// configuration, provider, loop exceeded, timeout, commit conflict,
    /// or store.
    #[instrument(skip(self, text), fields(identity = %identity))]
    pub async fn respond(
        &self,
        identity: &Identity,
        text: &str,
    ) -> Result<Reply, Report<ConversationError>> {
        loop {
            let session_id = self
                .sessions
                .get_or_create_session(identity)
                .await
                .map_err(store_failure("get_or_create_session"))?;

            let lock = self.session_lock(session_id);
            let result = {
                let _guard = lock.lock().await;
                // A reset may have run while this turn waited for the lock.
                match self.sessions.get_session(identity).await {
                    Ok(Some(current)) if current == session_id => {
                        Some(self.run_turn(identity, session_id, text).await)
                    }
                    Ok(_) => None,
                    Err(report) => Some(Err(store_failure("get_session")(report))),
                }
            };
            self.release_lock(session_id, lock);

            match result {
                Some(result) => return result,
                None => info!(session_id = %session_id, "session reset while waiting, resolving again"),
            }
        }
    }

    /// Deletes the session, continuation and language for `identity`.
    ///
    /// Waits for any in-flight turn on that session to finish first.
    ///
    /// # Errors
    ///
    /// Returns `ConversationError::Store` if a delete fails.
    pub async fn reset_session(
        &self,
        identity: &Identity,
    ) -> Result<Option<SessionId>, Report<ConversationError>> {
        let Some(session_id) = self
            .sessions
            .get_session(identity)
            .await
            .map_err(store_failure("get_session"))?
        else {
            return Ok(None);
        };

        let lock = self.session_lock(session_id);
        let result = async {
            let _guard = lock.lock().await;
            self.continuations
                .clear(&session_id)
                .await
                .map_err(store_failure("clear_continuation"))?;
            self.languages
                .clear(identity)
                .await
                .map_err(store_failure("clear_language"))?;
            self.sessions
                .reset(identity)
                .await
                .map_err(store_failure("reset_session"))
        }
        .await;
        self.release_lock(session_id, lock);

        let removed = result?;
        info!(identity = %identity, session_id = %session_id, "session reset");
        Ok(removed)
    }

    /// Reads everything stored for `identity`, or `None` if it has no
    /// session.
    ///
    /// # Errors
    ///
    /// Returns `ConversationError::Store` if a read fails.
    pub async fn inspect(
        &self,
        identity: &Identity,
    ) -> Result<Option<SessionSummary>, Report<ConversationError>> {
        let Some(record) = self
            .sessions
            .get_record(identity)
            .await
            .map_err(store_failure("get_session"))?
        else {
            return Ok(None);
        };

        let continuation = self
            .continuations
            .get_continuation(&record.session_id)
            .await
            .map_err(store_failure("get_continuation"))?;
        let language = self
            .languages
            .get(identity)
            .await
            .map_err(store_failure("get_language"))?;
        let last_human_activity = self
            .activity
            .last_activity(identity)
            .await
            .map_err(store_failure("last_activity"))?;

        Ok(Some(SessionSummary {
            identity: record.identity,
            session_id: record.session_id,
            created_at: record.created_at,
            continuation: continuation.map(|token| token.short().to_string()),
            language,
            last_human_activity,
        }))
    }

    fn session_lock(&self, session_id: SessionId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.session_locks
                .entry(session_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    fn release_lock(&self, session_id: SessionId, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.session_locks
            .remove_if(&session_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn run_turn(
        &self,
        identity: &Identity,
        session_id: SessionId,
        text: &str,
    ) -> Result<Reply, Report<ConversationError>> {
        for attempt in 1..=COMMIT_ATTEMPTS {
            let snapshot = self
                .continuations
                .snapshot(&session_id)
                .await
                .map_err(store_failure("get_continuation"))?;

            match snapshot.token.as_ref() {
                Some(token) => {
                    info!(session_id = %session_id, previous = token.short(), attempt, "continuing conversation");
                }
                None => info!(session_id = %session_id, attempt, "starting conversation"),
            }

            let executor = self.dispatcher.bind(ToolContext {
                identity: identity.clone(),
                session_id,
            });

            let outcome = self
                .coordinator
                .run(text, snapshot.token.clone(), &executor)
                .await
                .map_err(|report| {
                    let context = match report.current_context() {
                        CoordinateError::MaxIterationsExceeded { max } => {
                            ConversationError::LoopExceeded { max: *max }
                        }
                        CoordinateError::TimeoutExceeded { .. } => {
                            ConversationError::TimeoutExceeded
                        }
                        CoordinateError::Configuration => ConversationError::Configuration,
                        CoordinateError::Provider { .. } => ConversationError::Provider,
                    };
                    warn!(session_id = %session_id, error = %report, "turn failed");
                    report.context(context)
                })?;

            let committed = match (&outcome.continuation, outcome.partial) {
                (Some(token), false) => self
                    .continuations
                    .commit(&session_id, &snapshot, token)
                    .await
                    .map_err(store_failure("commit_continuation"))?,
                (_, true) => {
                    warn!(session_id = %session_id, "partial reply, keeping previous continuation");
                    true
                }
                (None, false) => true,
            };

            if committed {
                return Ok(Reply {
                    text: outcome.text,
                    session_id,
                    model: outcome.model,
                    partial: outcome.partial,
                });
            }
            warn!(session_id = %session_id, attempt, "continuation changed during turn, running again");
        }

        Err(ConversationError::Conflict {
            attempts: COMMIT_ATTEMPTS,
        }
        .into())
    }
}

fn store_failure(
    operation: &'static str,
) -> impl Fn(Report<StoreError>) -> Report<ConversationError> {
    move |report| report.context(ConversationError::Store { operation })
}
