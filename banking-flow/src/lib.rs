pub mod collaborators;
pub mod command;
pub mod controller;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod format;
pub mod handler;
pub mod handlers;
pub mod replies;
pub mod retry;
pub mod session;
pub mod storage;
pub mod storage_postgres;

// Re-export commonly used types
pub use collaborators::{
    Account, AccountStatus, AnswerService, DataStore, InMemoryDataStore, MessagingGateway,
    TransactionKind, TransactionRecord,
};
pub use command::{Command, CommandKind};
pub use controller::{ConversationController, Reply};
pub use credentials::{Argon2Verifier, CompatibleVerifier, CredentialVerifier, PlaintextVerifier};
pub use dispatch::{CommandPattern, DispatchTable, DispatchTableBuilder, StatePattern};
pub use error::{FlowError, Result};
pub use handler::{Effect, FlowSettings, Handler, Refusal, Services, Transition, Turn};
pub use handlers::banking_dispatch_table;
pub use retry::RetryPolicy;
pub use session::{AuthenticatedUser, ConversationSession, ConversationState, SessionTtls};
pub use storage::{InMemorySessionStore, SessionStore, SessionUpdate, session_update};
pub use storage_postgres::PostgresSessionStore;

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct EchoAnswers;

    #[async_trait]
    impl AnswerService for EchoAnswers {
        async fn answer(&self, prompt: &str, _context: &str) -> Result<String> {
            Ok(prompt.to_string())
        }
    }

    struct NullGateway;

    #[async_trait]
    impl MessagingGateway for NullGateway {
        async fn send(&self, _chat_id: &str, _text: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_simple_conversation() {
        let data = Arc::new(InMemoryDataStore::new());
        data.insert_account(Account {
            customer_id: "C1".to_string(),
            name: "Asha Rao".to_string(),
            account_number: "AC100".to_string(),
            account_type: "savings".to_string(),
            city: None,
            status: AccountStatus::Active,
            credential: "pw1".to_string(),
        });
        let services = Services {
            data_store: data,
            answers: Arc::new(EchoAnswers),
            verifier: Arc::new(CompatibleVerifier),
            settings: FlowSettings::default(),
        };
        let controller = ConversationController::banking(
            Arc::new(InMemorySessionStore::new()),
            services,
            Arc::new(NullGateway),
        );

        controller.handle_inbound("7", Some("/start")).await;
        controller.handle_inbound("7", Some("AC100")).await;
        let reply = controller.handle_inbound("7", Some("pw1")).await;
        assert_eq!(reply.state, ConversationState::Authenticated);

        let reply = controller.respond("7", "/query hello there").await;
        assert_eq!(reply.text, "hello there");
    }

    #[tokio::test]
    async fn test_session_store_roundtrip() {
        let store = InMemorySessionStore::new();
        store
            .set_state("7", ConversationState::AwaitingAccount)
            .await
            .unwrap();
        assert_eq!(
            store.get_state("7").await.unwrap(),
            Some(ConversationState::AwaitingAccount)
        );
        store.clear("7").await.unwrap();
        assert!(store.get_state("7").await.unwrap().is_none());
    }
}
