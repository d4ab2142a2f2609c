use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::{
    collaborators::{AnswerService, DataStore},
    command::Command,
    credentials::CredentialVerifier,
    error::Result,
    replies,
    session::{AuthenticatedUser, ConversationSession, ConversationState, SessionTtls, scratch_keys},
};

/// Tunables for the conversation flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSettings {
    pub ttls: SessionTtls,
    /// How many records `/transactions` lists
    pub transaction_limit: usize,
    /// How many recent records are given to the answer service with `/query`
    pub query_context_limit: usize,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            ttls: SessionTtls::default(),
            transaction_limit: 5,
            query_context_limit: 5,
        }
    }
}

/// Collaborators available to handlers
#[derive(Clone)]
pub struct Services {
    pub data_store: Arc<dyn DataStore>,
    pub answers: Arc<dyn AnswerService>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub settings: FlowSettings,
}

/// Everything a handler sees about the message being handled
pub struct Turn<'a> {
    pub chat_id: &'a str,
    pub command: &'a Command,
    /// Live view of the session as read at the start of the turn
    pub session: Option<&'a ConversationSession>,
    pub services: &'a Services,
    pub now: DateTime<Utc>,
}

impl Turn<'_> {
    pub fn state(&self) -> ConversationState {
        self.session
            .map_or(ConversationState::Anonymous, |session| session.state)
    }

    pub fn authenticated_user(&self) -> Option<&AuthenticatedUser> {
        self.session.and_then(ConversationSession::authenticated_user)
    }

    pub fn scratch_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.session.and_then(|session| session.scratch_value(key))
    }
}

/// The session write a handler asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Pure read, nothing is written
    None,
    /// Drop everything and wait for an account number
    Restart,
    /// Rewrite the current state label
    Stay(ConversationState),
    /// Remember the account number and wait for its password
    AwaitPassword { account_number: String },
    /// Promote to an authenticated session
    Authenticate(AuthenticatedUser),
    /// Remove the session, back to anonymous
    Reset,
}

impl Effect {
    pub fn writes(&self) -> bool {
        !matches!(self, Effect::None)
    }

    /// The session that results from applying this effect to `current`
    pub fn apply(
        self,
        chat_id: &str,
        current: Option<ConversationSession>,
        ttls: SessionTtls,
        now: DateTime<Utc>,
    ) -> Result<Option<ConversationSession>> {
        let existing_or = |current: Option<ConversationSession>, state| {
            current.unwrap_or_else(|| ConversationSession::new(chat_id, state, now))
        };

        match self {
            Effect::None => Ok(current),
            Effect::Restart => Ok(Some(ConversationSession::new(
                chat_id,
                ConversationState::AwaitingAccount,
                now,
            ))),
            Effect::Stay(state) => {
                let mut session = existing_or(current, state);
                session.set_state(state)?;
                Ok(Some(session))
            }
            Effect::AwaitPassword { account_number } => {
                let mut session = existing_or(current, ConversationState::AwaitingAccount);
                session.set_state(ConversationState::AwaitingPassword)?;
                session.put_scratch(
                    scratch_keys::ACCOUNT_NUMBER,
                    account_number,
                    ttls.scratch,
                    now,
                )?;
                Ok(Some(session))
            }
            Effect::Authenticate(user) => {
                let mut session = existing_or(current, ConversationState::AwaitingPassword);
                session.authenticate(user, ttls.authenticated, now);
                Ok(Some(session))
            }
            Effect::Reset => Ok(None),
        }
    }
}

/// Expected negative outcomes. These are answered, never logged as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    NotAuthenticated,
    AccountNotFound,
    InvalidCredential,
    SessionExpired,
}

/// Reply plus session effect produced by a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub reply: String,
    pub effect: Effect,
}

impl Transition {
    pub fn new(reply: impl Into<String>, effect: Effect) -> Self {
        Self {
            reply: reply.into(),
            effect,
        }
    }

    /// Reply without touching the session
    pub fn reply(reply: impl Into<String>) -> Self {
        Self::new(reply, Effect::None)
    }
}

impl From<Refusal> for Transition {
    fn from(refusal: Refusal) -> Self {
        match refusal {
            Refusal::NotAuthenticated => Transition::reply(replies::AUTHENTICATE_FIRST),
            Refusal::AccountNotFound => Transition::new(
                replies::INVALID_ACCOUNT,
                Effect::Stay(ConversationState::AwaitingAccount),
            ),
            Refusal::InvalidCredential => Transition::new(replies::INVALID_PASSWORD, Effect::Reset),
            Refusal::SessionExpired => Transition::new(replies::SESSION_EXPIRED, Effect::Reset),
        }
    }
}

/// Handles one kind of message in one kind of state
#[async_trait]
pub trait Handler: Send + Sync {
    /// Identifier used in logs
    fn id(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn run(&self, turn: &Turn<'_>) -> Result<Transition>;
}
