use async_trait::async_trait;
use banking_flow::{
    Account, AccountStatus, DataStore, FlowError, InMemoryDataStore, Result, RetryPolicy,
    TransactionKind, TransactionRecord,
};
use chrono::{NaiveDateTime, TimeZone, Utc};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::{info, warn};

const CREATE_USERS: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    customer_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    account_number TEXT UNIQUE NOT NULL,
    ifsc_code TEXT NOT NULL,
    account_city TEXT,
    account_type TEXT,
    status TEXT,
    contact TEXT NOT NULL,
    password TEXT NOT NULL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)
"#;

const CREATE_TRANSACTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS transactions (
    transaction_id TEXT PRIMARY KEY,
    customer_id TEXT REFERENCES users(customer_id) ON DELETE CASCADE,
    account_number TEXT NOT NULL,
    date_time TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    amount INTEGER CHECK (amount >= 0),
    transaction_type TEXT CHECK (transaction_type IN ('debit', 'credit')),
    method TEXT NOT NULL,
    description TEXT,
    balance_after_transaction INTEGER NOT NULL
)
"#;

const SELECT_ACCOUNT: &str = r#"
SELECT customer_id, name, account_number, account_type, account_city, status, password
FROM users
WHERE account_number = $1
"#;

const SELECT_CUSTOMER: &str = r#"
SELECT customer_id, name, account_number, account_type, account_city, status, password
FROM users
WHERE customer_id = $1
"#;

const SELECT_RECENT_TRANSACTIONS: &str = r#"
SELECT transaction_id, customer_id, date_time, amount, transaction_type, method, description,
       balance_after_transaction
FROM transactions
WHERE customer_id = $1
ORDER BY date_time DESC
LIMIT $2
"#;

const INSERT_TRANSACTION: &str = r#"
INSERT INTO transactions (transaction_id, customer_id, account_number, date_time, amount,
                          transaction_type, method, description, balance_after_transaction)
SELECT $1, customer_id, account_number, $3, $4, $5, $6, $7, $8
FROM users
WHERE customer_id = $2
"#;

type AccountRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
);

type TransactionRow = (
    String,
    Option<String>,
    Option<NaiveDateTime>,
    Option<i32>,
    Option<String>,
    String,
    Option<String>,
    i32,
);

/// Banking data in the `users` / `transactions` tables
pub struct PostgresDataStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresDataStore {
    pub async fn connect(database_url: &str, retry: RetryPolicy) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(classify)?;
        let store = Self { pool, retry };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_USERS).execute(&self.pool).await?;
        sqlx::query(CREATE_TRANSACTIONS).execute(&self.pool).await?;
        info!("users and transactions tables ready");
        Ok(())
    }
}

/// Connection trouble is worth another attempt, anything else is not
fn classify(err: sqlx::Error) -> FlowError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => FlowError::UpstreamUnavailable(err.to_string()),
        other => other.into(),
    }
}

fn account_from_row(row: AccountRow) -> Account {
    let (customer_id, name, account_number, account_type, city, status, credential) = row;
    Account {
        customer_id,
        name,
        account_number,
        account_type: account_type.unwrap_or_default(),
        city,
        status: status
            .as_deref()
            .map_or(AccountStatus::Inactive, AccountStatus::parse),
        credential,
    }
}

fn transaction_from_row(customer_id: &str, row: TransactionRow) -> Option<TransactionRecord> {
    let (id, row_customer, date_time, amount, kind, method, description, balance_after) = row;
    let Some(kind) = kind.as_deref().and_then(TransactionKind::parse) else {
        warn!(transaction_id = %id, "Skipping transaction with unknown type");
        return None;
    };

    Some(TransactionRecord {
        id,
        customer_id: row_customer.unwrap_or_else(|| customer_id.to_string()),
        timestamp: date_time.map_or_else(Utc::now, |naive| Utc.from_utc_datetime(&naive)),
        amount: i64::from(amount.unwrap_or_default()),
        kind,
        method,
        description,
        balance_after: i64::from(balance_after),
    })
}

fn to_column(value: i64, column: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| FlowError::MalformedInput(format!("{column} {value} does not fit the column")))
}

#[async_trait]
impl DataStore for PostgresDataStore {
    async fn find_account(&self, account_number: &str) -> Result<Option<Account>> {
        let pool = &self.pool;
        let account_number = account_number.trim();

        let row = self
            .retry
            .run("find_account", move || async move {
                sqlx::query_as::<_, AccountRow>(SELECT_ACCOUNT)
                    .bind(account_number)
                    .fetch_optional(pool)
                    .await
                    .map_err(classify)
            })
            .await?;

        Ok(row.map(account_from_row).filter(Account::is_active))
    }

    async fn find_customer(&self, customer_id: &str) -> Result<Option<Account>> {
        let pool = &self.pool;

        let row = self
            .retry
            .run("find_customer", move || async move {
                sqlx::query_as::<_, AccountRow>(SELECT_CUSTOMER)
                    .bind(customer_id)
                    .fetch_optional(pool)
                    .await
                    .map_err(classify)
            })
            .await?;

        Ok(row.map(account_from_row))
    }

    async fn list_recent_transactions(
        &self,
        customer_id: &str,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>> {
        let pool = &self.pool;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = self
            .retry
            .run("list_recent_transactions", move || async move {
                sqlx::query_as::<_, TransactionRow>(SELECT_RECENT_TRANSACTIONS)
                    .bind(customer_id)
                    .bind(limit)
                    .fetch_all(pool)
                    .await
                    .map_err(classify)
            })
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| transaction_from_row(customer_id, row))
            .collect())
    }

    async fn append_transaction(&self, record: TransactionRecord) -> Result<()> {
        let amount = to_column(record.amount, "amount")?;
        let balance_after = to_column(record.balance_after, "balance_after")?;

        let inserted = sqlx::query(INSERT_TRANSACTION)
            .bind(&record.id)
            .bind(&record.customer_id)
            .bind(record.timestamp.naive_utc())
            .bind(amount)
            .bind(record.kind.as_str())
            .bind(&record.method)
            .bind(&record.description)
            .bind(balance_after)
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        if inserted.rows_affected() == 0 {
            return Err(FlowError::MalformedInput(format!(
                "no customer {} for transaction {}",
                record.customer_id, record.id
            )));
        }
        Ok(())
    }
}

/// Accounts and history served when no database is configured
pub async fn seed_demo_data(store: &InMemoryDataStore) -> Result<()> {
    store.insert_account(Account {
        customer_id: "C1".to_string(),
        name: "Asha Rao".to_string(),
        account_number: "AC100".to_string(),
        account_type: "savings".to_string(),
        city: Some("Pune".to_string()),
        status: AccountStatus::Active,
        credential: "pw1".to_string(),
    });
    store.insert_account(Account {
        customer_id: "C2".to_string(),
        name: "Ravi Kumar".to_string(),
        account_number: "AC200".to_string(),
        account_type: "current".to_string(),
        city: Some("Chennai".to_string()),
        status: AccountStatus::Inactive,
        credential: "pw2".to_string(),
    });

    let history = [
        ("T1001", 1, 50_000, TransactionKind::Credit, "NEFT", "Salary", 62_500),
        ("T1002", 3, 1_200, TransactionKind::Debit, "UPI", "Groceries", 61_300),
        ("T1003", 7, 15_000, TransactionKind::Debit, "IMPS", "Rent", 46_300),
        ("T1004", 9, 899, TransactionKind::Debit, "Card", "Streaming subscription", 45_401),
    ];
    for (id, day, amount, kind, method, description, balance_after) in history {
        store
            .append_transaction(TransactionRecord {
                id: id.to_string(),
                customer_id: "C1".to_string(),
                timestamp: Utc
                    .with_ymd_and_hms(2024, 3, day, 10, 0, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
                amount,
                kind,
                method: method.to_string(),
                description: Some(description.to_string()),
                balance_after,
            })
            .await?;
    }
    info!("Seeded in-memory data store with demo accounts");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_map_to_domain() {
        let account = account_from_row((
            "C9".to_string(),
            "Meera Iyer".to_string(),
            "AC900".to_string(),
            None,
            Some("Mumbai".to_string()),
            Some("Active".to_string()),
            "secret".to_string(),
        ));
        assert!(account.is_active());
        assert_eq!(account.account_type, "");

        let naive = NaiveDateTime::parse_from_str("2024-03-01 10:00:00", "%Y-%m-%d %H:%M:%S")
            .unwrap();
        let record = transaction_from_row(
            "C9",
            (
                "T1".to_string(),
                None,
                Some(naive),
                Some(250),
                Some("debit".to_string()),
                "UPI".to_string(),
                None,
                750,
            ),
        )
        .unwrap();
        assert_eq!(record.customer_id, "C9");
        assert_eq!(record.kind, TransactionKind::Debit);
        assert_eq!(record.timestamp, Utc.from_utc_datetime(&naive));

        let unknown = (
            "T2".to_string(),
            None,
            None,
            None,
            Some("refund".to_string()),
            "UPI".to_string(),
            None,
            0,
        );
        assert!(transaction_from_row("C9", unknown).is_none());
    }

    #[test]
    fn test_connection_errors_are_transient() {
        assert!(classify(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!classify(sqlx::Error::RowNotFound).is_transient());
    }

    #[tokio::test]
    async fn test_demo_data() {
        let store = InMemoryDataStore::new();
        seed_demo_data(&store).await.unwrap();

        assert!(store.find_account("AC100").await.unwrap().is_some());
        assert!(store.find_account("AC200").await.unwrap().is_none());

        let recent = store.list_recent_transactions("C1", 1).await.unwrap();
        assert_eq!(recent[0].id, "T1004");
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_postgres_lookup() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let store = PostgresDataStore::connect(&url, RetryPolicy::none())
            .await
            .unwrap();
        assert!(store.find_account("no-such-account").await.unwrap().is_none());
    }
}
