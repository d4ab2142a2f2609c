//! The banking assistant's conversation handlers and the table that wires them.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    command::{Command, CommandKind},
    dispatch::{CommandPattern, DispatchTable, DispatchTableBuilder, StatePattern},
    error::Result,
    format::{build_query_context, format_balance, format_transactions},
    handler::{Effect, Handler, Refusal, Transition, Turn},
    replies,
    session::{AuthenticatedUser, ConversationState, scratch_keys},
};

/// Clears whatever the chat had and starts a login
pub struct StartHandler;

#[async_trait]
impl Handler for StartHandler {
    async fn run(&self, _turn: &Turn<'_>) -> Result<Transition> {
        Ok(Transition::new(replies::WELCOME, Effect::Restart))
    }
}

/// Anything but `/start` from a chat without a session
pub struct LoginRequiredHandler;

#[async_trait]
impl Handler for LoginRequiredHandler {
    async fn run(&self, _turn: &Turn<'_>) -> Result<Transition> {
        Ok(Refusal::NotAuthenticated.into())
    }
}

/// Fixed reply, session untouched
pub struct PromptHandler(pub &'static str);

#[async_trait]
impl Handler for PromptHandler {
    async fn run(&self, _turn: &Turn<'_>) -> Result<Transition> {
        Ok(Transition::reply(self.0))
    }
}

fn free_text<'a>(turn: &'a Turn<'_>) -> &'a str {
    match turn.command {
        Command::Text(text) => text,
        _ => "",
    }
}

/// Looks up the candidate account number
pub struct AccountNumberHandler;

#[async_trait]
impl Handler for AccountNumberHandler {
    async fn run(&self, turn: &Turn<'_>) -> Result<Transition> {
        let candidate = free_text(turn);

        match turn.services.data_store.find_account(candidate).await? {
            Some(account) => {
                debug!(chat_id = %turn.chat_id, "Account number accepted");
                Ok(Transition::new(
                    replies::ACCOUNT_FOUND,
                    Effect::AwaitPassword {
                        account_number: account.account_number,
                    },
                ))
            }
            None => Ok(Refusal::AccountNotFound.into()),
        }
    }
}

/// Verifies the password against the account remembered in scratch
pub struct PasswordHandler;

#[async_trait]
impl Handler for PasswordHandler {
    async fn run(&self, turn: &Turn<'_>) -> Result<Transition> {
        let Some(account_number) = turn.scratch_value::<String>(scratch_keys::ACCOUNT_NUMBER)
        else {
            return Ok(Refusal::SessionExpired.into());
        };

        let account = turn
            .services
            .data_store
            .find_account(&account_number)
            .await?;

        match account {
            Some(account)
                if turn
                    .services
                    .verifier
                    .verify(&account.credential, free_text(turn)) =>
            {
                info!(
                    chat_id = %turn.chat_id,
                    customer_id = %account.customer_id,
                    "Login succeeded"
                );
                let user = AuthenticatedUser::from(&account);
                Ok(Transition::new(
                    replies::logged_in(&user.name),
                    Effect::Authenticate(user),
                ))
            }
            _ => {
                info!(chat_id = %turn.chat_id, "Login rejected");
                Ok(Refusal::InvalidCredential.into())
            }
        }
    }
}

/// Runs the inner handler only while the authenticated payload is still live
pub struct RequireLogin<H>(pub H);

#[async_trait]
impl<H: Handler> Handler for RequireLogin<H> {
    fn id(&self) -> &str {
        self.0.id()
    }

    async fn run(&self, turn: &Turn<'_>) -> Result<Transition> {
        if turn.authenticated_user().is_none() {
            return Ok(Refusal::SessionExpired.into());
        }
        self.0.run(turn).await
    }
}

fn logged_in_user<'a>(turn: &'a Turn<'_>) -> std::result::Result<&'a AuthenticatedUser, Refusal> {
    turn.authenticated_user().ok_or(Refusal::SessionExpired)
}

pub struct TransactionsHandler;

#[async_trait]
impl Handler for TransactionsHandler {
    async fn run(&self, turn: &Turn<'_>) -> Result<Transition> {
        let user = match logged_in_user(turn) {
            Ok(user) => user,
            Err(refusal) => return Ok(refusal.into()),
        };

        let records = turn
            .services
            .data_store
            .list_recent_transactions(&user.customer_id, turn.services.settings.transaction_limit)
            .await?;

        Ok(Transition::reply(format_transactions(&records)))
    }
}

pub struct BalanceHandler;

#[async_trait]
impl Handler for BalanceHandler {
    async fn run(&self, turn: &Turn<'_>) -> Result<Transition> {
        let user = match logged_in_user(turn) {
            Ok(user) => user,
            Err(refusal) => return Ok(refusal.into()),
        };

        let latest = turn
            .services
            .data_store
            .list_recent_transactions(&user.customer_id, 1)
            .await?;

        Ok(Transition::reply(format_balance(latest.first())))
    }
}

/// Free-form question answered by the answer service with account context
pub struct QueryHandler;

#[async_trait]
impl Handler for QueryHandler {
    async fn run(&self, turn: &Turn<'_>) -> Result<Transition> {
        let user = match logged_in_user(turn) {
            Ok(user) => user,
            Err(refusal) => return Ok(refusal.into()),
        };

        let question = match turn.command {
            Command::Query(question) if !question.is_empty() => question,
            _ => return Ok(Transition::reply(replies::QUERY_USAGE)),
        };

        let records = turn
            .services
            .data_store
            .list_recent_transactions(
                &user.customer_id,
                turn.services.settings.query_context_limit,
            )
            .await?;
        let context = build_query_context(user, &records);

        let answer = turn.services.answers.answer(question, &context).await?;
        let answer = answer.trim();
        if answer.is_empty() {
            return Ok(Transition::reply(replies::EMPTY_ANSWER));
        }
        Ok(Transition::reply(answer))
    }
}

pub struct LogoutHandler;

#[async_trait]
impl Handler for LogoutHandler {
    async fn run(&self, _turn: &Turn<'_>) -> Result<Transition> {
        Ok(Transition::new(replies::LOGGED_OUT, Effect::Reset))
    }
}

pub struct HelpHandler;

#[async_trait]
impl Handler for HelpHandler {
    async fn run(&self, _turn: &Turn<'_>) -> Result<Transition> {
        Ok(Transition::reply(replies::HELP))
    }
}

/// The login flow and authenticated commands of the banking assistant
pub fn banking_dispatch_table() -> DispatchTable {
    use ConversationState::{Anonymous, Authenticated, AwaitingAccount, AwaitingPassword};

    DispatchTableBuilder::new("banking_assistant")
        .route(
            StatePattern::Any,
            CommandPattern::Is(CommandKind::Start),
            Arc::new(StartHandler),
        )
        .route(
            StatePattern::Is(Anonymous),
            CommandPattern::Any,
            Arc::new(LoginRequiredHandler),
        )
        .route(
            StatePattern::Is(AwaitingAccount),
            CommandPattern::Text,
            Arc::new(AccountNumberHandler),
        )
        .route(
            StatePattern::Is(AwaitingAccount),
            CommandPattern::AnyCommand,
            Arc::new(PromptHandler(replies::ENTER_ACCOUNT_NUMBER)),
        )
        .route(
            StatePattern::Is(AwaitingPassword),
            CommandPattern::Text,
            Arc::new(PasswordHandler),
        )
        .route(
            StatePattern::Is(AwaitingPassword),
            CommandPattern::AnyCommand,
            Arc::new(PromptHandler(replies::ENTER_PASSWORD)),
        )
        .route(
            StatePattern::Is(Authenticated),
            CommandPattern::Is(CommandKind::Transactions),
            Arc::new(RequireLogin(TransactionsHandler)),
        )
        .route(
            StatePattern::Is(Authenticated),
            CommandPattern::Is(CommandKind::Balance),
            Arc::new(RequireLogin(BalanceHandler)),
        )
        .route(
            StatePattern::Is(Authenticated),
            CommandPattern::Is(CommandKind::Query),
            Arc::new(RequireLogin(QueryHandler)),
        )
        .route(
            StatePattern::Is(Authenticated),
            CommandPattern::Is(CommandKind::Logout),
            Arc::new(RequireLogin(LogoutHandler)),
        )
        .route(
            StatePattern::Is(Authenticated),
            CommandPattern::Any,
            Arc::new(RequireLogin(HelpHandler)),
        )
        .build()
}
