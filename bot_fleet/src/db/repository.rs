//! PostgreSQL-backed [`StateStore`].
//!
//! Writes go to two tables (see `migrations/`):
//! - `minecraft_accounts`: one row per account, carrying the online flag
//! - `chat_messages`: append-only chat log

use async_trait::async_trait;
use sqlx::PgPool;
use std::{future::Future, time::Duration};
use tokio::time::timeout;

use crate::{
    account::{AccountId, ChatEvent},
    store::{StateStore, StoreError, StoreResult},
};

/// Default timeout for a single statement
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Execute a query, giving up after `duration`.
async fn with_timeout<F, T>(duration: Duration, future: F) -> StoreResult<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match timeout(duration, future).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(StoreError::Unavailable(format!(
            "query timed out after {duration:?}"
        ))),
    }
}

fn connection_status(online: bool) -> &'static str {
    if online { "online" } else { "offline" }
}

/// PostgreSQL implementation of [`StateStore`]
#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
    query_timeout: Duration,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn set_online(&self, account_id: &AccountId, online: bool) -> StoreResult<()> {
        let result = with_timeout(
            self.query_timeout,
            sqlx::query(
                "UPDATE minecraft_accounts
                 SET is_online = $1, last_seen = NOW(), connection_status = $2
                 WHERE id = $3",
            )
            .bind(online)
            .bind(connection_status(online))
            .bind(account_id.as_str())
            .execute(&self.pool),
        )
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AccountNotFound(account_id.clone()));
        }
        Ok(())
    }

    async fn save_chat(&self, event: &ChatEvent) -> StoreResult<()> {
        with_timeout(
            self.query_timeout,
            sqlx::query(
                "INSERT INTO chat_messages (id, account_id, message, timestamp, is_outgoing)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(event.id)
            .bind(event.account_id.as_str())
            .bind(&event.text)
            .bind(event.timestamp)
            .bind(event.is_outgoing())
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}
