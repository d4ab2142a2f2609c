use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use std::sync::Arc;

use crate::{
    error::{FlowError, Result},
    session::{AuthenticatedUser, ConversationSession, ConversationState},
};

/// How long a session record survives without any write
pub const DEFAULT_IDLE_LIFETIME_SECS: i64 = 86_400;

/// An update applied to the live view of a chat's session under that chat's lock.
/// Returning `None` removes the record.
pub type SessionUpdate =
    Box<dyn FnOnce(Option<ConversationSession>) -> Result<Option<ConversationSession>> + Send>;

pub fn session_update<F>(update: F) -> SessionUpdate
where
    F: FnOnce(Option<ConversationSession>) -> Result<Option<ConversationSession>> + Send + 'static,
{
    Box::new(update)
}

/// Durable, expiring conversation state keyed by chat id.
///
/// Implementations provide `load` and an atomic `modify`; the named session
/// operations are built on top of those two. Every read treats expired
/// records, scratch entries and payloads as absent.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Raw record, expiry not applied
    async fn load(&self, chat_id: &str) -> Result<Option<ConversationSession>>;

    /// Atomically apply `update` to the live view of the record and persist the result
    async fn modify(
        &self,
        chat_id: &str,
        update: SessionUpdate,
    ) -> Result<Option<ConversationSession>>;

    async fn get_state(&self, chat_id: &str) -> Result<Option<ConversationState>> {
        Ok(self
            .load(chat_id)
            .await?
            .and_then(|session| session.live_at(Utc::now()))
            .map(|session| session.state))
    }

    async fn set_state(&self, chat_id: &str, state: ConversationState) -> Result<()> {
        let id = chat_id.to_string();
        self.modify(
            chat_id,
            session_update(move |current| {
                if state == ConversationState::Anonymous {
                    return Ok(None);
                }
                let mut session = current.unwrap_or_else(|| {
                    ConversationSession::new(id, ConversationState::Anonymous, Utc::now())
                });
                session.set_state(state)?;
                Ok(Some(session))
            }),
        )
        .await?;
        Ok(())
    }

    async fn put_scratch(
        &self,
        chat_id: &str,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<()> {
        let id = chat_id.to_string();
        let key = key.to_string();
        self.modify(
            chat_id,
            session_update(move |current| {
                let mut session = current.ok_or(FlowError::SessionNotFound(id))?;
                session.put_scratch(key, value, ttl, Utc::now())?;
                Ok(Some(session))
            }),
        )
        .await?;
        Ok(())
    }

    async fn get_scratch(&self, chat_id: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .load(chat_id)
            .await?
            .and_then(|session| session.live_at(Utc::now()))
            .and_then(|session| session.scratch_value(key)))
    }

    async fn store_authenticated(
        &self,
        chat_id: &str,
        user: AuthenticatedUser,
        ttl: Duration,
    ) -> Result<()> {
        let id = chat_id.to_string();
        self.modify(
            chat_id,
            session_update(move |current| {
                let now = Utc::now();
                let mut session = current.unwrap_or_else(|| {
                    ConversationSession::new(id, ConversationState::Anonymous, now)
                });
                session.authenticate(user, ttl, now);
                Ok(Some(session))
            }),
        )
        .await?;
        Ok(())
    }

    async fn get_authenticated(&self, chat_id: &str) -> Result<Option<AuthenticatedUser>> {
        Ok(self
            .load(chat_id)
            .await?
            .and_then(|session| session.live_at(Utc::now()))
            .and_then(|session| session.authenticated.map(|entry| entry.user)))
    }

    async fn clear(&self, chat_id: &str) -> Result<()> {
        self.modify(chat_id, session_update(|_| Ok(None))).await?;
        Ok(())
    }
}

/// In-memory implementation of SessionStore
pub struct InMemorySessionStore {
    sessions: Arc<DashMap<String, ConversationSession>>,
    idle_lifetime: Duration,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::with_idle_lifetime(Duration::seconds(DEFAULT_IDLE_LIFETIME_SECS))
    }

    pub fn with_idle_lifetime(idle_lifetime: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            idle_lifetime,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, chat_id: &str) -> Result<Option<ConversationSession>> {
        Ok(self.sessions.get(chat_id).map(|entry| entry.clone()))
    }

    async fn modify(
        &self,
        chat_id: &str,
        update: SessionUpdate,
    ) -> Result<Option<ConversationSession>> {
        let now = Utc::now();
        // The entry guard holds the shard lock, so updates to one chat are serialized.
        match self.sessions.entry(chat_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let previous_revision = occupied.get().revision;
                let current = occupied.get().clone().live_at(now);
                match update(current)? {
                    Some(mut next) => {
                        next.stamp(previous_revision, now, self.idle_lifetime);
                        occupied.insert(next.clone());
                        Ok(Some(next))
                    }
                    None => {
                        occupied.remove();
                        Ok(None)
                    }
                }
            }
            Entry::Vacant(vacant) => match update(None)? {
                Some(mut next) => {
                    next.stamp(0, now, self.idle_lifetime);
                    vacant.insert(next.clone());
                    Ok(Some(next))
                }
                None => Ok(None),
            },
        }
    }
}
