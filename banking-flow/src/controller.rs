//! ConversationController: reads one chat's session, runs the handler the dispatch
//! table picks for the message, and commits the resulting effect.
//!
//! One inbound message is one turn:
//! 1. load a snapshot of the session and apply expiry
//! 2. resolve a handler from `(state, command)` and run it with no lock held
//! 3. if the handler asked for a write, commit it through `SessionStore::modify`,
//!    checking that nobody else committed for the chat since the snapshot
//!
//! Failures never escape a turn. They are logged and answered with a recoverable
//! error reply, leaving the session as it was.

use chrono::Utc;
use std::sync::Arc;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    collaborators::MessagingGateway,
    command::Command,
    dispatch::DispatchTable,
    error::{FlowError, Result},
    handler::{Services, Turn},
    handlers::banking_dispatch_table,
    replies,
    session::ConversationState,
    storage::{SessionStore, session_update},
};

/// Outcome of one turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub chat_id: String,
    pub text: String,
    /// State of the chat once the turn is over
    pub state: ConversationState,
}

#[derive(Clone)]
pub struct ConversationController {
    table: Arc<DispatchTable>,
    store: Arc<dyn SessionStore>,
    services: Services,
    gateway: Arc<dyn MessagingGateway>,
}

impl ConversationController {
    pub fn new(
        table: Arc<DispatchTable>,
        store: Arc<dyn SessionStore>,
        services: Services,
        gateway: Arc<dyn MessagingGateway>,
    ) -> Self {
        Self {
            table,
            store,
            services,
            gateway,
        }
    }

    /// Controller wired with the banking assistant's dispatch table
    pub fn banking(
        store: Arc<dyn SessionStore>,
        services: Services,
        gateway: Arc<dyn MessagingGateway>,
    ) -> Self {
        Self::new(Arc::new(banking_dispatch_table()), store, services, gateway)
    }

    pub fn session_store(&self) -> Arc<dyn SessionStore> {
        self.store.clone()
    }

    /// Handle a message and return the reply without sending it
    pub async fn respond(&self, chat_id: &str, text: &str) -> Reply {
        let span = info_span!("turn", chat_id = %chat_id);
        async move {
            match self.run_turn(chat_id, text).await {
                Ok(reply) => reply,
                Err(err) => self.recover(chat_id, err).await,
            }
        }
        .instrument(span)
        .await
    }

    /// Handle a message from the messaging platform and send the reply back.
    /// `text` is `None` for messages without text (stickers, photos, ...).
    pub async fn handle_inbound(&self, chat_id: &str, text: Option<&str>) -> Reply {
        let reply = match text {
            Some(text) => self.respond(chat_id, text).await,
            None => {
                let err = FlowError::MalformedInput("message has no text".to_string());
                self.recover(chat_id, err).await
            }
        };

        if let Err(err) = self.gateway.send(chat_id, &reply.text).await {
            error!(chat_id = %chat_id, error = %err, "Failed to deliver reply");
        }
        reply
    }

    async fn run_turn(&self, chat_id: &str, text: &str) -> Result<Reply> {
        let now = Utc::now();
        let snapshot = self
            .store
            .load(chat_id)
            .await?
            .and_then(|session| session.live_at(now));
        let command = Command::parse(text);

        let turn = Turn {
            chat_id,
            command: &command,
            session: snapshot.as_ref(),
            services: &self.services,
            now,
        };
        let state = turn.state();

        let handler = self
            .table
            .resolve(state, &command)
            .ok_or_else(|| FlowError::NoRoute {
                state: state.to_string(),
                command: command.to_string(),
            })?;
        debug!(
            state = %state,
            command = %command,
            handler = handler.id(),
            "Dispatching message"
        );

        let transition = handler.run(&turn).await?;

        if !transition.effect.writes() {
            return Ok(Reply {
                chat_id: chat_id.to_string(),
                text: transition.reply,
                state,
            });
        }

        let expected_revision = snapshot.as_ref().map(|session| session.revision);
        let effect = transition.effect;
        let ttls = self.services.settings.ttls;
        let id = chat_id.to_string();

        let committed = self
            .store
            .modify(
                chat_id,
                session_update(move |current| {
                    if current.as_ref().map(|session| session.revision) != expected_revision {
                        return Err(FlowError::ConcurrentUpdate(id));
                    }
                    effect.apply(&id, current, ttls, now)
                }),
            )
            .await?;

        let next_state = committed
            .as_ref()
            .map_or(ConversationState::Anonymous, |session| session.state);
        info!(
            from = %state,
            to = %next_state,
            handler = handler.id(),
            "Session transition committed"
        );

        Ok(Reply {
            chat_id: chat_id.to_string(),
            text: transition.reply,
            state: next_state,
        })
    }

    async fn recover(&self, chat_id: &str, err: FlowError) -> Reply {
        let text = match &err {
            FlowError::UpstreamUnavailable(_) | FlowError::RateLimited { .. } => {
                warn!(chat_id = %chat_id, error = %err, "Upstream unavailable");
                replies::TEMPORARILY_UNAVAILABLE
            }
            FlowError::ConcurrentUpdate(_) => {
                warn!(chat_id = %chat_id, "Concurrent update rejected");
                replies::CONCURRENT_UPDATE
            }
            _ => {
                error!(chat_id = %chat_id, error = %err, "Failed to handle message");
                replies::GENERIC_ERROR
            }
        };

        Reply {
            chat_id: chat_id.to_string(),
            text: text.to_string(),
            state: self.current_state(chat_id).await,
        }
    }

    async fn current_state(&self, chat_id: &str) -> ConversationState {
        match self.store.get_state(chat_id).await {
            Ok(state) => state.unwrap_or(ConversationState::Anonymous),
            Err(err) => {
                warn!(chat_id = %chat_id, error = %err, "Could not read state after failure");
                ConversationState::Anonymous
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collaborators::{
            Account, AccountStatus, AnswerService, DataStore, InMemoryDataStore, TransactionKind,
            TransactionRecord,
        },
        credentials::CompatibleVerifier,
        dispatch::{CommandPattern, DispatchTableBuilder, StatePattern},
        handler::{Effect, FlowSettings, Handler, Transition},
        session::{ConversationSession, SessionTtls, scratch_keys},
        storage::InMemorySessionStore,
    };
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingAnswers {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AnswerService for CountingAnswers {
        async fn answer(&self, prompt: &str, context: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(context.contains("Asha Rao"));
            Ok(format!("  answer to: {prompt}  "))
        }
    }

    struct FailingAnswers;

    #[async_trait]
    impl AnswerService for FailingAnswers {
        async fn answer(&self, _prompt: &str, _context: &str) -> Result<String> {
            Err(FlowError::UpstreamUnavailable("model timed out".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingGateway {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessagingGateway for RecordingGateway {
        async fn send(&self, chat_id: &str, text: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((chat_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        controller: ConversationController,
        store: Arc<InMemorySessionStore>,
        data: Arc<InMemoryDataStore>,
        gateway: Arc<RecordingGateway>,
    }

    fn data_store() -> Arc<InMemoryDataStore> {
        let data = Arc::new(InMemoryDataStore::new());
        data.insert_account(Account {
            customer_id: "C1".to_string(),
            name: "Asha Rao".to_string(),
            account_number: "AC100".to_string(),
            account_type: "savings".to_string(),
            city: Some("Pune".to_string()),
            status: AccountStatus::Active,
            credential: "pw1".to_string(),
        });
        data.insert_account(Account {
            customer_id: "C2".to_string(),
            name: "Ravi Kumar".to_string(),
            account_number: "AC200".to_string(),
            account_type: "current".to_string(),
            city: None,
            status: AccountStatus::Inactive,
            credential: "pw2".to_string(),
        });
        data
    }

    fn fixture_with(answers: Arc<dyn AnswerService>, settings: FlowSettings) -> Fixture {
        let store = Arc::new(InMemorySessionStore::new());
        let data = data_store();
        let gateway = Arc::new(RecordingGateway::default());
        let services = Services {
            data_store: data.clone(),
            answers,
            verifier: Arc::new(CompatibleVerifier),
            settings,
        };
        let controller = ConversationController::banking(store.clone(), services, gateway.clone());
        Fixture {
            controller,
            store,
            data,
            gateway,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(CountingAnswers::default()), FlowSettings::default())
    }

    async fn login(controller: &ConversationController, chat_id: &str) -> Reply {
        controller.respond(chat_id, "/start").await;
        controller.respond(chat_id, "AC100").await;
        controller.respond(chat_id, "pw1").await
    }

    fn transaction(id: &str, day: u32, balance_after: i64) -> TransactionRecord {
        TransactionRecord {
            id: id.to_string(),
            customer_id: "C1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, day, 9, 0, 0).unwrap(),
            amount: 500,
            kind: TransactionKind::Credit,
            method: "NEFT".to_string(),
            description: Some("Salary".to_string()),
            balance_after,
        }
    }

    #[tokio::test]
    async fn test_start_resets_any_state() {
        let f = fixture();
        login(&f.controller, "42").await;

        let reply = f.controller.respond("42", "/start").await;
        assert_eq!(reply.text, replies::WELCOME);
        assert_eq!(reply.state, ConversationState::AwaitingAccount);

        let session = f.store.load("42").await.unwrap().unwrap();
        assert!(session.scratch.is_empty());
        assert!(session.authenticated.is_none());
    }

    #[tokio::test]
    async fn test_account_number_is_remembered() {
        let f = fixture();
        f.controller.respond("42", "/start").await;

        let reply = f.controller.respond("42", "  AC100 ").await;
        assert_eq!(reply.text, replies::ACCOUNT_FOUND);
        assert_eq!(reply.state, ConversationState::AwaitingPassword);
        assert_eq!(
            f.store
                .get_scratch("42", scratch_keys::ACCOUNT_NUMBER)
                .await
                .unwrap()
                .as_deref(),
            Some("AC100")
        );
    }

    #[tokio::test]
    async fn test_unknown_or_inactive_account_stays_put() {
        let f = fixture();
        f.controller.respond("42", "/start").await;

        for candidate in ["AC999", "AC200"] {
            let reply = f.controller.respond("42", candidate).await;
            assert_eq!(reply.text, replies::INVALID_ACCOUNT);
            assert_eq!(reply.state, ConversationState::AwaitingAccount);
        }
        assert!(
            f.store
                .get_scratch("42", scratch_keys::ACCOUNT_NUMBER)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_login_scenario() {
        let f = fixture();
        let reply = login(&f.controller, "42").await;

        assert_eq!(reply.state, ConversationState::Authenticated);
        assert!(reply.text.contains("Asha Rao"));

        let user = f.store.get_authenticated("42").await.unwrap().unwrap();
        assert_eq!(user.customer_id, "C1");
        assert_eq!(user.account_number, "AC100");
        assert_eq!(user.city.as_deref(), Some("Pune"));

        let reply = f.controller.respond("42", "/transactions").await;
        assert_eq!(reply.text, replies::NO_TRANSACTIONS);
    }

    #[tokio::test]
    async fn test_wrong_password_clears_session() {
        let f = fixture();
        f.controller.respond("42", "/start").await;
        f.controller.respond("42", "AC100").await;

        let reply = f.controller.respond("42", "PW1").await;
        assert_eq!(reply.text, replies::INVALID_PASSWORD);
        assert_eq!(reply.state, ConversationState::Anonymous);
        assert!(f.store.load("42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commands_during_login_reprompt() {
        let f = fixture();
        f.controller.respond("42", "/start").await;
        let reply = f.controller.respond("42", "/balance").await;
        assert_eq!(reply.text, replies::ENTER_ACCOUNT_NUMBER);

        f.controller.respond("42", "AC100").await;
        let reply = f.controller.respond("42", "/transactions").await;
        assert_eq!(reply.text, replies::ENTER_PASSWORD);
        assert_eq!(reply.state, ConversationState::AwaitingPassword);
    }

    #[tokio::test]
    async fn test_expired_scratch_ends_login() {
        let settings = FlowSettings {
            ttls: SessionTtls {
                scratch: Duration::zero(),
                ..SessionTtls::default()
            },
            ..FlowSettings::default()
        };
        let f = fixture_with(Arc::new(CountingAnswers::default()), settings);
        f.controller.respond("42", "/start").await;
        f.controller.respond("42", "AC100").await;

        let reply = f.controller.respond("42", "pw1").await;
        assert_eq!(reply.text, replies::SESSION_EXPIRED);
        assert_eq!(reply.state, ConversationState::Anonymous);
    }

    #[tokio::test]
    async fn test_transactions_are_listed_and_stable() {
        let f = fixture();
        f.data.append_transaction(transaction("T1", 1, 1500)).await.unwrap();
        f.data.append_transaction(transaction("T2", 2, 2000)).await.unwrap();
        login(&f.controller, "42").await;
        let before = f.store.load("42").await.unwrap().unwrap().revision;

        let first = f.controller.respond("42", "/transactions").await;
        let second = f.controller.respond("42", "/transactions").await;

        assert_eq!(first, second);
        assert!(first.text.starts_with("Transaction ID: T2"));
        assert!(first.text.contains("Transaction ID: T1"));
        assert_eq!(f.store.load("42").await.unwrap().unwrap().revision, before);
    }

    #[tokio::test]
    async fn test_balance_reports_latest_record() {
        let f = fixture();
        f.data.append_transaction(transaction("T1", 1, 1500)).await.unwrap();
        f.data.append_transaction(transaction("T2", 5, 2750)).await.unwrap();
        login(&f.controller, "42").await;

        let reply = f.controller.respond("42", "/balance").await;
        assert!(reply.text.contains("₹2750"));
    }

    #[tokio::test]
    async fn test_expired_login_asks_to_start_again() {
        let settings = FlowSettings {
            ttls: SessionTtls {
                authenticated: Duration::zero(),
                ..SessionTtls::default()
            },
            ..FlowSettings::default()
        };
        let f = fixture_with(Arc::new(CountingAnswers::default()), settings);
        login(&f.controller, "42").await;

        let reply = f.controller.respond("42", "/transactions").await;
        assert_eq!(reply.text, replies::SESSION_EXPIRED);
        assert_eq!(reply.state, ConversationState::Anonymous);

        let reply = f.controller.respond("42", "/balance").await;
        assert_eq!(reply.text, replies::AUTHENTICATE_FIRST);
    }

    #[tokio::test]
    async fn test_interleaved_logins_keep_scratch_apart() {
        let f = fixture();
        f.data.insert_account(Account {
            customer_id: "C3".to_string(),
            name: "Meera Iyer".to_string(),
            account_number: "AC300".to_string(),
            account_type: "savings".to_string(),
            city: None,
            status: AccountStatus::Active,
            credential: "pw3".to_string(),
        });

        f.controller.respond("1", "/start").await;
        f.controller.respond("2", "/start").await;
        f.controller.respond("1", "AC100").await;
        f.controller.respond("2", "AC300").await;

        // Each chat's password only opens its own account
        let reply = f.controller.respond("1", "pw3").await;
        assert_eq!(reply.text, replies::INVALID_PASSWORD);
        let reply = f.controller.respond("2", "pw3").await;
        assert!(reply.text.contains("Meera Iyer"));
    }

    #[tokio::test]
    async fn test_query_requires_login() {
        let answers = Arc::new(CountingAnswers::default());
        let f = fixture_with(answers.clone(), FlowSettings::default());

        let reply = f.controller.respond("42", "/query what is my balance").await;
        assert_eq!(reply.text, replies::AUTHENTICATE_FIRST);
        assert_eq!(reply.state, ConversationState::Anonymous);
        assert_eq!(answers.calls.load(Ordering::SeqCst), 0);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_query_is_answered_with_context() {
        let answers = Arc::new(CountingAnswers::default());
        let f = fixture_with(answers.clone(), FlowSettings::default());
        login(&f.controller, "42").await;

        let reply = f.controller.respond("42", "/query What did I spend?").await;
        assert_eq!(reply.text, "answer to: What did I spend?");
        assert_eq!(answers.calls.load(Ordering::SeqCst), 1);

        let reply = f.controller.respond("42", "/query").await;
        assert_eq!(reply.text, replies::QUERY_USAGE);
        assert_eq!(answers.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_upstream_failure_leaves_state() {
        let f = fixture_with(Arc::new(FailingAnswers), FlowSettings::default());
        login(&f.controller, "42").await;
        let before = f.store.load("42").await.unwrap().unwrap();

        let reply = f.controller.respond("42", "/query balance?").await;
        assert_eq!(reply.text, replies::TEMPORARILY_UNAVAILABLE);
        assert_eq!(reply.state, ConversationState::Authenticated);
        assert_eq!(f.store.load("42").await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_logout_and_help() {
        let f = fixture();
        login(&f.controller, "42").await;

        let reply = f.controller.respond("42", "what now?").await;
        assert_eq!(reply.text, replies::HELP);
        assert_eq!(reply.state, ConversationState::Authenticated);

        let reply = f.controller.respond("42", "/logout").await;
        assert_eq!(reply.text, replies::LOGGED_OUT);
        assert_eq!(reply.state, ConversationState::Anonymous);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_inbound_messages_are_sent_back() {
        let f = fixture();
        f.controller.handle_inbound("42", Some("/start")).await;
        let reply = f.controller.handle_inbound("42", None).await;

        assert_eq!(reply.text, replies::GENERIC_ERROR);
        assert_eq!(reply.state, ConversationState::AwaitingAccount);

        let sent = f.gateway.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                ("42".to_string(), replies::WELCOME.to_string()),
                ("42".to_string(), replies::GENERIC_ERROR.to_string()),
            ]
        );
    }

    /// Writes to the store on behalf of another message while the turn is in flight
    struct Interloper {
        store: Arc<InMemorySessionStore>,
    }

    #[async_trait]
    impl Handler for Interloper {
        async fn run(&self, turn: &Turn<'_>) -> Result<Transition> {
            let chat_id = turn.chat_id.to_string();
            self.store
                .modify(
                    turn.chat_id,
                    session_update(move |_| {
                        Ok(Some(ConversationSession::new(
                            chat_id,
                            ConversationState::AwaitingAccount,
                            Utc::now(),
                        )))
                    }),
                )
                .await?;
            Ok(Transition::new(
                "late",
                Effect::AwaitPassword {
                    account_number: "AC100".to_string(),
                },
            ))
        }
    }

    #[tokio::test]
    async fn test_racing_commit_is_rejected() {
        let f = fixture();
        let table = DispatchTableBuilder::new("race")
            .route(
                StatePattern::Any,
                CommandPattern::Any,
                Arc::new(Interloper {
                    store: f.store.clone(),
                }),
            )
            .build();
        let controller = ConversationController::new(
            Arc::new(table),
            f.store.clone(),
            f.controller.services.clone(),
            f.gateway.clone(),
        );

        let reply = controller.respond("42", "AC100").await;
        assert_eq!(reply.text, replies::CONCURRENT_UPDATE);

        let session = f.store.load("42").await.unwrap().unwrap();
        assert_eq!(session.state, ConversationState::AwaitingAccount);
        assert_eq!(session.revision, 1);
        assert!(session.scratch.is_empty());
    }
}
