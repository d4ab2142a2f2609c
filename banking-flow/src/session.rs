use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{FlowError, Result};

// Scratch keys used by the login sub-flow
pub mod scratch_keys {
    pub const ACCOUNT_NUMBER: &str = "account_number";
}

/// Where a chat currently is in the login / command flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationState {
    Anonymous,
    AwaitingAccount,
    AwaitingPassword,
    Authenticated,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Anonymous => "ANONYMOUS",
            ConversationState::AwaitingAccount => "AWAITING_ACCOUNT",
            ConversationState::AwaitingPassword => "AWAITING_PASSWORD",
            ConversationState::Authenticated => "AUTHENTICATED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ANONYMOUS" => Some(ConversationState::Anonymous),
            "AWAITING_ACCOUNT" => Some(ConversationState::AwaitingAccount),
            "AWAITING_PASSWORD" => Some(ConversationState::AwaitingPassword),
            "AUTHENTICATED" => Some(ConversationState::Authenticated),
            _ => None,
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A short-lived value collected during the login sub-flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScratchEntry {
    pub value: Value,
    pub expires_at: DateTime<Utc>,
}

/// Snapshot of the logged-in account holder kept for the session duration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub customer_id: String,
    pub name: String,
    pub account_number: String,
    pub account_type: String,
    pub city: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticatedEntry {
    pub user: AuthenticatedUser,
    pub expires_at: DateTime<Utc>,
}

/// Lifetimes of the login scratch values and of the authenticated payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTtls {
    pub scratch: Duration,
    pub authenticated: Duration,
}

impl Default for SessionTtls {
    fn default() -> Self {
        Self {
            scratch: Duration::seconds(300),
            authenticated: Duration::seconds(3600),
        }
    }
}

/// One chat's authentication and interaction state.
///
/// `authenticated` is set exactly when `state` is `Authenticated` in every
/// stored record. Views produced by [`ConversationSession::live_at`] hide an
/// expired payload while keeping the state label, which is how an expired
/// login is told apart from a chat that never logged in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub chat_id: String,
    pub state: ConversationState,
    #[serde(default)]
    pub scratch: BTreeMap<String, ScratchEntry>,
    #[serde(default)]
    pub authenticated: Option<AuthenticatedEntry>,
    #[serde(default)]
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConversationSession {
    /// A fresh, not yet persisted session. The store stamps expiry and revision on write.
    pub fn new(chat_id: impl Into<String>, state: ConversationState, now: DateTime<Utc>) -> Self {
        Self {
            chat_id: chat_id.into(),
            state,
            scratch: BTreeMap::new(),
            authenticated: None,
            revision: 0,
            updated_at: now,
            expires_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// The session as seen at `now`: absent once expired, with expired scratch
    /// entries and an expired payload dropped.
    pub fn live_at(mut self, now: DateTime<Utc>) -> Option<Self> {
        if self.is_expired(now) {
            return None;
        }
        self.scratch.retain(|_, entry| entry.expires_at > now);
        if self
            .authenticated
            .as_ref()
            .is_some_and(|entry| entry.expires_at <= now)
        {
            self.authenticated = None;
        }
        Some(self)
    }

    pub fn scratch_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.scratch
            .get(key)
            .and_then(|entry| serde_json::from_value(entry.value.clone()).ok())
    }

    pub fn put_scratch(
        &mut self,
        key: impl Into<String>,
        value: impl Serialize,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.scratch.insert(
            key.into(),
            ScratchEntry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    pub fn authenticated_user(&self) -> Option<&AuthenticatedUser> {
        self.authenticated.as_ref().map(|entry| &entry.user)
    }

    /// Promote to `Authenticated`. Login scratch does not outlive the attempt.
    pub fn authenticate(&mut self, user: AuthenticatedUser, ttl: Duration, now: DateTime<Utc>) {
        self.state = ConversationState::Authenticated;
        self.scratch.clear();
        self.authenticated = Some(AuthenticatedEntry {
            user,
            expires_at: now + ttl,
        });
    }

    pub fn set_state(&mut self, state: ConversationState) -> Result<()> {
        match state {
            ConversationState::Authenticated if self.authenticated.is_none() => {
                Err(FlowError::InvalidTransition(format!(
                    "chat {} cannot become {} without an authenticated payload",
                    self.chat_id, state
                )))
            }
            ConversationState::Authenticated => {
                self.state = state;
                Ok(())
            }
            ConversationState::Anonymous => {
                self.state = state;
                self.scratch.clear();
                self.authenticated = None;
                Ok(())
            }
            _ => {
                self.state = state;
                self.authenticated = None;
                Ok(())
            }
        }
    }

    /// Bookkeeping applied by a store right before a write
    pub fn stamp(&mut self, previous_revision: u64, now: DateTime<Utc>, idle_lifetime: Duration) {
        self.revision = previous_revision + 1;
        self.updated_at = now;
        self.expires_at = now + idle_lifetime;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> AuthenticatedUser {
        AuthenticatedUser {
            customer_id: "C1".to_string(),
            name: "Asha Rao".to_string(),
            account_number: "AC100".to_string(),
            account_type: "savings".to_string(),
            city: Some("Bengaluru".to_string()),
        }
    }

    fn stamped(state: ConversationState, now: DateTime<Utc>) -> ConversationSession {
        let mut session = ConversationSession::new("42", state, now);
        session.stamp(0, now, Duration::hours(24));
        session
    }

    #[test]
    fn test_live_view_drops_expired_scratch_only() {
        let now = Utc::now();
        let mut session = stamped(ConversationState::AwaitingPassword, now);
        session
            .put_scratch(scratch_keys::ACCOUNT_NUMBER, "AC100", Duration::seconds(60), now)
            .unwrap();
        session
            .put_scratch("stale", "old", Duration::seconds(-1), now)
            .unwrap();

        let live = session.live_at(now).unwrap();
        assert_eq!(
            live.scratch_value::<String>(scratch_keys::ACCOUNT_NUMBER),
            Some("AC100".to_string())
        );
        assert!(live.scratch_value::<String>("stale").is_none());

        let later = live.live_at(now + Duration::seconds(61)).unwrap();
        assert!(later.scratch.is_empty());
        assert_eq!(later.state, ConversationState::AwaitingPassword);
    }

    #[test]
    fn test_expired_payload_keeps_state_label() {
        let now = Utc::now();
        let mut session = stamped(ConversationState::AwaitingPassword, now);
        session.authenticate(user(), Duration::minutes(30), now);

        let live = session.clone().live_at(now + Duration::minutes(10)).unwrap();
        assert_eq!(live.authenticated_user(), Some(&user()));

        let expired = session.live_at(now + Duration::minutes(31)).unwrap();
        assert_eq!(expired.state, ConversationState::Authenticated);
        assert!(expired.authenticated_user().is_none());
    }

    #[test]
    fn test_expired_session_is_absent() {
        let now = Utc::now();
        let session = stamped(ConversationState::AwaitingAccount, now);
        assert!(session.live_at(now + Duration::hours(25)).is_none());
    }

    #[test]
    fn test_authenticate_clears_scratch() {
        let now = Utc::now();
        let mut session = stamped(ConversationState::AwaitingPassword, now);
        session
            .put_scratch(scratch_keys::ACCOUNT_NUMBER, "AC100", Duration::seconds(300), now)
            .unwrap();
        session.authenticate(user(), Duration::hours(1), now);

        assert_eq!(session.state, ConversationState::Authenticated);
        assert!(session.scratch.is_empty());
    }

    #[test]
    fn test_set_state_keeps_payload_invariant() {
        let now = Utc::now();
        let mut session = stamped(ConversationState::AwaitingAccount, now);
        assert!(matches!(
            session.set_state(ConversationState::Authenticated),
            Err(FlowError::InvalidTransition(_))
        ));

        session.authenticate(user(), Duration::hours(1), now);
        session.set_state(ConversationState::AwaitingAccount).unwrap();
        assert!(session.authenticated.is_none());
    }

    #[test]
    fn test_state_labels_match_serde_names() {
        for state in [
            ConversationState::Anonymous,
            ConversationState::AwaitingAccount,
            ConversationState::AwaitingPassword,
            ConversationState::Authenticated,
        ] {
            let json = serde_json::to_value(state).unwrap();
            assert_eq!(json, Value::String(state.as_str().to_string()));
            assert_eq!(ConversationState::parse(state.as_str()), Some(state));
        }
    }
}
