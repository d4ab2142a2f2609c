use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::{error::Result, session::AuthenticatedUser};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
}

impl AccountStatus {
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("active") {
            AccountStatus::Active
        } else {
            AccountStatus::Inactive
        }
    }
}

/// A customer account as held by the data store. Never mutated by the conversation flow.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub customer_id: String,
    pub name: String,
    pub account_number: String,
    pub account_type: String,
    pub city: Option<String>,
    pub status: AccountStatus,
    pub credential: String,
}

impl Account {
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("customer_id", &self.customer_id)
            .field("name", &self.name)
            .field("account_number", &self.account_number)
            .field("account_type", &self.account_type)
            .field("city", &self.city)
            .field("status", &self.status)
            .field("credential", &"<redacted>")
            .finish()
    }
}

impl From<&Account> for AuthenticatedUser {
    fn from(account: &Account) -> Self {
        AuthenticatedUser {
            customer_id: account.customer_id.clone(),
            name: account.name.clone(),
            account_number: account.account_number.clone(),
            account_type: account.account_type.clone(),
            city: account.city.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Debit,
    Credit,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Debit => "debit",
            TransactionKind::Credit => "credit",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "debit" => Some(TransactionKind::Debit),
            "credit" => Some(TransactionKind::Credit),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub customer_id: String,
    pub timestamp: DateTime<Utc>,
    pub amount: i64,
    pub kind: TransactionKind,
    pub method: String,
    pub description: Option<String>,
    pub balance_after: i64,
}

/// Account and transaction lookups
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Active accounts only
    async fn find_account(&self, account_number: &str) -> Result<Option<Account>>;

    /// Lookup by customer id, any status
    async fn find_customer(&self, customer_id: &str) -> Result<Option<Account>>;

    /// Newest first, at most `limit` records
    async fn list_recent_transactions(
        &self,
        customer_id: &str,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>>;

    async fn append_transaction(&self, record: TransactionRecord) -> Result<()>;
}

/// Free-text question answering, typically LLM backed
#[async_trait]
pub trait AnswerService: Send + Sync {
    /// Fails with `FlowError::UpstreamUnavailable` once retries are exhausted
    async fn answer(&self, prompt: &str, context: &str) -> Result<String>;
}

/// Outbound chat transport
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn send(&self, chat_id: &str, text: &str) -> Result<()>;
}

/// In-memory implementation of DataStore
pub struct InMemoryDataStore {
    accounts: Arc<DashMap<String, Account>>,
    transactions: Arc<DashMap<String, Vec<TransactionRecord>>>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self {
            accounts: Arc::new(DashMap::new()),
            transactions: Arc::new(DashMap::new()),
        }
    }

    pub fn insert_account(&self, account: Account) {
        self.accounts
            .insert(account.account_number.clone(), account);
    }
}

impl Default for InMemoryDataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn find_account(&self, account_number: &str) -> Result<Option<Account>> {
        Ok(self
            .accounts
            .get(account_number.trim())
            .map(|entry| entry.clone())
            .filter(Account::is_active))
    }

    async fn find_customer(&self, customer_id: &str) -> Result<Option<Account>> {
        Ok(self
            .accounts
            .iter()
            .find(|entry| entry.customer_id == customer_id)
            .map(|entry| entry.value().clone()))
    }

    async fn list_recent_transactions(
        &self,
        customer_id: &str,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>> {
        let mut records = self
            .transactions
            .get(customer_id)
            .map(|entry| entry.clone())
            .unwrap_or_default();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        Ok(records)
    }

    async fn append_transaction(&self, record: TransactionRecord) -> Result<()> {
        self.transactions
            .entry(record.customer_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }
}
