//! Credential repository for database operations
//!
//! Every state change is a single conditional `UPDATE`, so two callers can
//! never both observe a credential as theirs.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::credential::{Credential, CredentialInventory, CredentialState};
use crate::error::{Error, Result};
use crate::storage::from_millis;

const CREDENTIAL_COLUMNS: &str = "id, token, state, issued_at, reserved_at, spent_at";

/// Repository for credential database operations
#[derive(Debug, Clone)]
pub struct CredentialRepository {
    pool: SqlitePool,
}

impl CredentialRepository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Persist a batch of freshly issued credentials in one transaction
    ///
    /// Either every credential is stored or none is.
    pub async fn insert_batch(&self, credentials: &[Credential]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for credential in credentials {
            sqlx::query(
                r#"
                INSERT INTO credentials (id, token, state, issued_at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(credential.id.to_string())
            .bind(credential.token.as_slice())
            .bind(credential.state.as_str())
            .bind(credential.issued_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Atomically move the oldest unused credential to `reserved`
    pub async fn reserve_one(&self, now: DateTime<Utc>) -> Result<Option<Credential>> {
        let row: Option<CredentialRow> = sqlx::query_as(&format!(
            r#"
            UPDATE credentials
            SET state = 'reserved', reserved_at = ?
            WHERE id = (
                SELECT id FROM credentials
                WHERE state = 'unused'
                ORDER BY issued_at, id
                LIMIT 1
            )
            AND state = 'unused'
            RETURNING {CREDENTIAL_COLUMNS}
            "#
        ))
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        row.map(CredentialRow::into_credential).transpose()
    }

    /// `reserved -> spent`; returns whether a row changed
    pub async fn mark_spent(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET state = 'spent', spent_at = ?
            WHERE id = ? AND state = 'reserved'
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// `reserved -> unused`; returns whether a row changed
    pub async fn release(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET state = 'unused', reserved_at = NULL
            WHERE id = ? AND state = 'reserved'
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get the current state of a credential
    pub async fn state_of(&self, id: Uuid) -> Result<Option<CredentialState>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT state FROM credentials WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(state,)| {
            CredentialState::from_str(&state)
                .ok_or_else(|| Error::Parse(format!("Invalid credential state: {}", state)))
        })
        .transpose()
    }

    /// Get a credential by ID
    pub async fn get(&self, id: Uuid) -> Result<Option<Credential>> {
        let row: Option<CredentialRow> = sqlx::query_as(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(CredentialRow::into_credential).transpose()
    }

    /// List credentials, optionally filtered by state, oldest first
    pub async fn list(&self, state: Option<CredentialState>) -> Result<Vec<Credential>> {
        let rows: Vec<CredentialRow> = match state {
            Some(state) => {
                sqlx::query_as(&format!(
                    "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE state = ? ORDER BY issued_at, id"
                ))
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {CREDENTIAL_COLUMNS} FROM credentials ORDER BY issued_at, id"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(CredentialRow::into_credential).collect()
    }

    /// Count credentials in each state
    pub async fn inventory(&self) -> Result<CredentialInventory> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM credentials GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut inventory = CredentialInventory::default();
        for (state, count) in rows {
            match CredentialState::from_str(&state) {
                Some(CredentialState::Unused) => inventory.unused = count,
                Some(CredentialState::Reserved) => inventory.reserved = count,
                Some(CredentialState::Spent) => inventory.spent = count,
                None => return Err(Error::Parse(format!("Invalid credential state: {}", state))),
            }
        }
        Ok(inventory)
    }

    /// Delete unused credentials issued before `cutoff`
    pub async fn delete_unused_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM credentials WHERE state = 'unused' AND issued_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Release reservations made before `cutoff` that no submitting query holds
    ///
    /// Another process sharing the store holds a fresh reservation for a
    /// moment before its record turns `submitting`; the cutoff leaves those.
    pub async fn release_orphaned(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET state = 'unused', reserved_at = NULL
            WHERE state = 'reserved'
            AND reserved_at < ?
            AND id NOT IN (
                SELECT credential_id FROM query_records
                WHERE credential_id IS NOT NULL AND state = 'submitting'
            )
            "#,
        )
        .bind(cutoff.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Responder-side record of tokens already presented to this node
#[derive(Debug, Clone)]
pub struct RedeemedTokenRepository {
    pool: SqlitePool,
}

impl RedeemedTokenRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a redemption; false if the digest was already present
    pub async fn record(&self, digest: &str, query_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO redeemed_tokens (digest, query_id, seen_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(digest)
        .bind(query_id.to_string())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Forget redemptions older than `cutoff`
    pub async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM redeemed_tokens WHERE seen_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

// ========== Database Row Types ==========

#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: String,
    token: Vec<u8>,
    state: String,
    issued_at: i64,
    reserved_at: Option<i64>,
    spent_at: Option<i64>,
}

impl CredentialRow {
    fn into_credential(self) -> Result<Credential> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| Error::Parse(format!("Invalid credential ID: {}", e)))?;
        let state = CredentialState::from_str(&self.state)
            .ok_or_else(|| Error::Parse(format!("Invalid credential state: {}", self.state)))?;

        Ok(Credential {
            id,
            token: Zeroizing::new(self.token),
            state,
            issued_at: from_millis(self.issued_at)?,
            reserved_at: self.reserved_at.map(from_millis).transpose()?,
            spent_at: self.spent_at.map(from_millis).transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Database, now_millis};

    async fn create_test_repo() -> CredentialRepository {
        let db = Database::in_memory()
            .await
            .expect("Failed to create test database");
        CredentialRepository::new(db.pool().clone())
    }

    fn issue(n: u8) -> Vec<Credential> {
        (0..n)
            .map(|i| Credential::issued(vec![i; 16], now_millis()))
            .collect()
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let repo = create_test_repo().await;
        let batch = issue(2);
        repo.insert_batch(&batch).await.expect("insert");

        let stored = repo.get(batch[0].id).await.unwrap().expect("credential");
        assert_eq!(stored.state, CredentialState::Unused);
        assert_eq!(stored.token.as_slice(), batch[0].token.as_slice());
        assert_eq!(stored.issued_at, batch[0].issued_at);
    }

    #[tokio::test]
    async fn test_insert_batch_is_atomic() {
        let repo = create_test_repo().await;
        let mut batch = issue(3);
        // Duplicate primary key makes the last insert fail
        batch[2].id = batch[0].id;

        assert!(repo.insert_batch(&batch).await.is_err());
        assert_eq!(repo.inventory().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_reserve_spend_release_cycle() {
        let repo = create_test_repo().await;
        repo.insert_batch(&issue(1)).await.unwrap();

        let reserved = repo.reserve_one(now_millis()).await.unwrap().expect("reserved");
        assert_eq!(reserved.state, CredentialState::Reserved);
        assert!(reserved.reserved_at.is_some());
        assert!(repo.reserve_one(now_millis()).await.unwrap().is_none());

        assert!(repo.release(reserved.id).await.unwrap());
        assert!(!repo.release(reserved.id).await.unwrap());
        assert_eq!(
            repo.state_of(reserved.id).await.unwrap(),
            Some(CredentialState::Unused)
        );

        let again = repo.reserve_one(now_millis()).await.unwrap().expect("reserved");
        assert_eq!(again.id, reserved.id);
        assert!(repo.mark_spent(again.id, now_millis()).await.unwrap());
        assert!(!repo.mark_spent(again.id, now_millis()).await.unwrap());
        assert!(!repo.release(again.id).await.unwrap());

        let inventory = repo.inventory().await.unwrap();
        assert_eq!(inventory.spent, 1);
        assert_eq!(inventory.unused, 0);
    }

    #[tokio::test]
    async fn test_delete_unused_before_keeps_reserved() {
        let repo = create_test_repo().await;
        repo.insert_batch(&issue(2)).await.unwrap();
        let reserved = repo.reserve_one(now_millis()).await.unwrap().unwrap();

        let cutoff = now_millis() + chrono::Duration::seconds(1);
        assert_eq!(repo.delete_unused_before(cutoff).await.unwrap(), 1);
        assert!(repo.get(reserved.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_orphaned() {
        let repo = create_test_repo().await;
        repo.insert_batch(&issue(2)).await.unwrap();
        let reserved_at = now_millis();
        repo.reserve_one(reserved_at).await.unwrap().unwrap();

        assert_eq!(repo.release_orphaned(reserved_at).await.unwrap(), 0);
        assert_eq!(repo.inventory().await.unwrap().reserved, 1);

        let later = reserved_at + chrono::Duration::seconds(1);
        assert_eq!(repo.release_orphaned(later).await.unwrap(), 1);
        assert_eq!(repo.inventory().await.unwrap().unused, 2);
    }

    #[tokio::test]
    async fn test_redeemed_tokens_detect_replay() {
        let db = Database::in_memory().await.unwrap();
        let redeemed = RedeemedTokenRepository::new(db.pool().clone());
        let query_id = Uuid::new_v4();

        assert!(redeemed.record("digest-1", query_id, now_millis()).await.unwrap());
        assert!(!redeemed.record("digest-1", Uuid::new_v4(), now_millis()).await.unwrap());
        assert!(redeemed.record("digest-2", query_id, now_millis()).await.unwrap());

        let cutoff = now_millis() + chrono::Duration::seconds(1);
        assert_eq!(redeemed.delete_before(cutoff).await.unwrap(), 2);
    }
}
