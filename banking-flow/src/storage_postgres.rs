use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;

use crate::{
    error::Result,
    session::ConversationSession,
    storage::{DEFAULT_IDLE_LIFETIME_SECS, SessionStore, SessionUpdate},
};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS chat_sessions (
    chat_id TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    data JSONB NOT NULL,
    revision BIGINT NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
)
"#;

const UPSERT_SESSION: &str = r#"
INSERT INTO chat_sessions (chat_id, state, data, revision, expires_at, updated_at)
VALUES ($1, $2, $3, $4, $5, $6)
ON CONFLICT (chat_id) DO UPDATE SET
    state = EXCLUDED.state,
    data = EXCLUDED.data,
    revision = EXCLUDED.revision,
    expires_at = EXCLUDED.expires_at,
    updated_at = EXCLUDED.updated_at
"#;

/// Session store backed by a `chat_sessions` table.
///
/// `modify` runs inside a transaction holding a per-chat advisory lock, so
/// concurrent webhook deliveries for one chat are serialized across server
/// instances while different chats never contend.
pub struct PostgresSessionStore {
    pool: PgPool,
    idle_lifetime: Duration,
}

impl PostgresSessionStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with_idle_lifetime(
            database_url,
            Duration::seconds(DEFAULT_IDLE_LIFETIME_SECS),
        )
        .await
    }

    pub async fn connect_with_idle_lifetime(
        database_url: &str,
        idle_lifetime: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        let store = Self::from_pool(pool, idle_lifetime);
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool, idle_lifetime: Duration) -> Self {
        Self {
            pool,
            idle_lifetime,
        }
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        info!("chat_sessions table ready");
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    async fn load(&self, chat_id: &str) -> Result<Option<ConversationSession>> {
        let row: Option<(Value,)> =
            sqlx::query_as("SELECT data FROM chat_sessions WHERE chat_id = $1")
                .bind(chat_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row
            .map(|(data,)| serde_json::from_value::<ConversationSession>(data))
            .transpose()?)
    }

    async fn modify(
        &self,
        chat_id: &str,
        update: SessionUpdate,
    ) -> Result<Option<ConversationSession>> {
        let mut tx = self.pool.begin().await?;

        // Row locks cannot cover a row that does not exist yet, so lock the key instead.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;

        let row: Option<(Value,)> =
            sqlx::query_as("SELECT data FROM chat_sessions WHERE chat_id = $1")
                .bind(chat_id)
                .fetch_optional(&mut *tx)
                .await?;
        let existing = row
            .map(|(data,)| serde_json::from_value::<ConversationSession>(data))
            .transpose()?;

        let now = Utc::now();
        let previous_revision = existing.as_ref().map_or(0, |session| session.revision);
        let current = existing.and_then(|session| session.live_at(now));

        // An error drops the transaction, which rolls it back.
        match update(current)? {
            Some(mut next) => {
                next.stamp(previous_revision, now, self.idle_lifetime);
                let data = serde_json::to_value(&next)?;
                sqlx::query(UPSERT_SESSION)
                    .bind(chat_id)
                    .bind(next.state.as_str())
                    .bind(data)
                    .bind(next.revision as i64)
                    .bind(next.expires_at)
                    .bind(next.updated_at)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(Some(next))
            }
            None => {
                sqlx::query("DELETE FROM chat_sessions WHERE chat_id = $1")
                    .bind(chat_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConversationState;

    // Needs a reachable database: DATABASE_URL=postgres://... cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_postgres_round_trip() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = PostgresSessionStore::connect(&url).await.unwrap();

        store
            .set_state("pg-test", ConversationState::AwaitingAccount)
            .await
            .unwrap();
        assert_eq!(
            store.get_state("pg-test").await.unwrap(),
            Some(ConversationState::AwaitingAccount)
        );

        store.clear("pg-test").await.unwrap();
        assert!(store.get_state("pg-test").await.unwrap().is_none());
    }
}
