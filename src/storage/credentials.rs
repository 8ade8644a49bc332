/// Persistence for broker credentials
///
/// One row per API key holding the current request token (single use) and
/// the last minted access token. Rows are overwritten in place.

use crate::error::Result;
use crate::storage::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;

/// Stored credential state for one brokerage account
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct AccountCredential {
    pub api_key: String,
    pub request_token: Option<String>,
    pub access_token: Option<String>,
    /// Last request token that has been through an exchange
    pub consumed_request_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed credential store
#[derive(Debug, Clone)]
pub struct CredentialStore {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl CredentialStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
        }
    }

    /// Fetch the credential row for an API key
    pub async fn get(&self, api_key: &str) -> Result<Option<AccountCredential>> {
        self.retry
            .run(|| {
                sqlx::query_as::<_, AccountCredential>(
                    "SELECT api_key, request_token, access_token, consumed_request_token, \
                     created_at, updated_at FROM broker_credentials WHERE api_key = ?",
                )
                .bind(api_key)
                .fetch_optional(&self.pool)
            })
            .await
    }

    /// Store a freshly minted request token, replacing any previous one
    pub async fn store_request_token(&self, api_key: &str, request_token: &str) -> Result<()> {
        let now = Utc::now();
        self.retry
            .run(|| {
                sqlx::query(
                    r#"
                    INSERT INTO broker_credentials (api_key, request_token, created_at, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(api_key) DO UPDATE SET
                        request_token = excluded.request_token,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(api_key)
                .bind(request_token)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
            })
            .await?;
        Ok(())
    }

    /// Retire a request token that went through an exchange, successful or not
    pub async fn consume_request_token(&self, api_key: &str, request_token: &str) -> Result<()> {
        let now = Utc::now();
        self.retry
            .run(|| {
                sqlx::query(
                    r#"
                    INSERT INTO broker_credentials
                        (api_key, consumed_request_token, created_at, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(api_key) DO UPDATE SET
                        request_token = NULL,
                        consumed_request_token = excluded.consumed_request_token,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(api_key)
                .bind(request_token)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
            })
            .await?;
        Ok(())
    }

    /// Store a new access token
    pub async fn store_access_token(&self, api_key: &str, access_token: &str) -> Result<()> {
        let now = Utc::now();
        self.retry
            .run(|| {
                sqlx::query(
                    r#"
                    INSERT INTO broker_credentials (api_key, access_token, created_at, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(api_key) DO UPDATE SET
                        access_token = excluded.access_token,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(api_key)
                .bind(access_token)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
            })
            .await?;
        Ok(())
    }

    /// Drop the stored state for an API key
    pub async fn clear(&self, api_key: &str) -> Result<bool> {
        let result = self
            .retry
            .run(|| {
                sqlx::query("DELETE FROM broker_credentials WHERE api_key = ?")
                    .bind(api_key)
                    .execute(&self.pool)
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::test_pool;

    #[tokio::test]
    async fn request_token_lifecycle() {
        let (_dir, pool) = test_pool().await;
        let store = CredentialStore::new(pool);

        assert!(store.get("k1").await.unwrap().is_none());

        store.store_request_token("k1", "rt-1").await.unwrap();
        let row = store.get("k1").await.unwrap().unwrap();
        assert_eq!(row.request_token.as_deref(), Some("rt-1"));
        assert_eq!(row.access_token, None);

        store.consume_request_token("k1", "rt-1").await.unwrap();
        store.store_access_token("k1", "at-1").await.unwrap();
        let row = store.get("k1").await.unwrap().unwrap();
        assert_eq!(row.request_token, None);
        assert_eq!(row.consumed_request_token.as_deref(), Some("rt-1"));
        assert_eq!(row.access_token.as_deref(), Some("at-1"));
    }

    #[tokio::test]
    async fn rows_are_per_api_key() {
        let (_dir, pool) = test_pool().await;
        let store = CredentialStore::new(pool);

        store.store_access_token("k1", "at-1").await.unwrap();
        store.store_access_token("k2", "at-2").await.unwrap();
        store.store_access_token("k1", "at-3").await.unwrap();

        assert_eq!(
            store.get("k1").await.unwrap().unwrap().access_token.as_deref(),
            Some("at-3")
        );
        assert_eq!(
            store.get("k2").await.unwrap().unwrap().access_token.as_deref(),
            Some("at-2")
        );
        assert!(store.clear("k2").await.unwrap());
        assert!(store.get("k2").await.unwrap().is_none());
    }
}
