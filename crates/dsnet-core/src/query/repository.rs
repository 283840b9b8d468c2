//! Query record repository
//!
//! Every lifecycle transition is a conditional `UPDATE ... WHERE state IN (...)`
//! so two writers can never both advance the same record. Response appends
//! and the expiry sweep each run in one transaction whose first statement is
//! a write, which takes SQLite's write lock before anything is read.

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use super::query::{PayloadKind, Query, QueryPayload, Response, StoredResponse};
use super::state::{FailureReason, QueryRecord, QueryState, QuerySummary};
use crate::codec::Commitment;
use crate::config::LateResponsePolicy;
use crate::error::{Error, Result};
use crate::storage::from_millis;

const RECORD_COLUMNS: &str = "id, state, payload_kind, payload, reply_secret, expected_responses, \
     created_at, deadline, credential_id, envelope, commitment, attempts, failure_reason, \
     submitted_at, finished_at, updated_at";

/// Result of appending a response to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored; the query is still awaiting more
    Accepted { count: i64 },
    /// Stored, and the expected count is now reached
    Completed { count: i64 },
    /// Stored as an extra answer to an already completed query
    RecordedLate,
    /// Query already completed and late responses are dropped
    Late,
    /// Same proof already stored for this query
    Duplicate,
    /// No awaiting (or completed) record with this id
    NotAwaiting,
}

/// Records moved by one expiry sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepResult {
    pub expired: Vec<Uuid>,
    pub completed: Vec<Uuid>,
}

/// Repository for query record database operations
#[derive(Debug, Clone)]
pub struct QueryRepository {
    pool: SqlitePool,
}

impl QueryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Persist a new query in `created`
    pub async fn insert(&self, query: &Query, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO query_records (
                id, state, payload_kind, payload, reply_secret, expected_responses,
                created_at, deadline, updated_at
            )
            VALUES (?, 'created', ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(query.id.to_string())
        .bind(query.payload.kind.as_str())
        .bind(query.payload.bytes.as_slice())
        .bind(query.reply_secret.as_slice())
        .bind(query.expected_responses.map(i64::from))
        .bind(query.created_at.timestamp_millis())
        .bind(query.deadline.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a record with its collected responses
    pub async fn get(&self, id: Uuid) -> Result<Option<QueryRecord>> {
        let row: Option<QueryRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM query_records WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut record = row.into_record()?;
        record.responses = self.responses(id).await?;
        Ok(Some(record))
    }

    /// Current state of a record
    pub async fn state_of(&self, id: Uuid) -> Result<Option<QueryState>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT state FROM query_records WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(state,)| parse_state(&state)).transpose()
    }

    /// Commitment of a query that is awaiting responses or already completed
    pub async fn commitment_for_response(&self, id: Uuid) -> Result<Option<Commitment>> {
        let row: Option<(Option<Vec<u8>>,)> = sqlx::query_as(
            r#"
            SELECT commitment FROM query_records
            WHERE id = ? AND state IN ('awaiting_responses', 'completed')
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .and_then(|(bytes,)| bytes)
            .and_then(|bytes| Commitment::from_slice(&bytes)))
    }

    /// Stored responses for a query, oldest first
    pub async fn responses(&self, query_id: Uuid) -> Result<Vec<StoredResponse>> {
        let rows: Vec<ResponseRow> = sqlx::query_as(
            r#"
            SELECT id, query_id, payload, proof, received_at, late
            FROM query_responses
            WHERE query_id = ?
            ORDER BY received_at, rowid
            "#,
        )
        .bind(query_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ResponseRow::into_stored).collect()
    }

    /// List records newest first, optionally filtered by state
    pub async fn list(&self, state: Option<QueryState>, limit: i64) -> Result<Vec<QuerySummary>> {
        let sql = format!(
            r#"
            SELECT q.id, q.state, q.expected_responses, q.attempts, q.created_at,
                   q.deadline, q.failure_reason,
                   (SELECT COUNT(*) FROM query_responses r WHERE r.query_id = q.id) AS response_count
            FROM query_records q
            {}
            ORDER BY q.created_at DESC, q.id
            LIMIT ?
            "#,
            if state.is_some() { "WHERE q.state = ?" } else { "" }
        );

        let mut query = sqlx::query_as::<_, SummaryRow>(&sql);
        if let Some(state) = state {
            query = query.bind(state.as_str());
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;

        rows.into_iter().map(SummaryRow::into_summary).collect()
    }

    /// Ids of records in any of `states`, oldest first
    pub async fn ids_in_states(&self, states: &[QueryState]) -> Result<Vec<Uuid>> {
        let sql = format!(
            "SELECT id FROM query_records WHERE state IN ({}) ORDER BY created_at, id",
            placeholders(states.len())
        );

        let mut query = sqlx::query_as::<_, (String,)>(&sql);
        for state in states {
            query = query.bind(state.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter().map(|(id,)| parse_uuid(&id)).collect()
    }

    /// `created -> submitting`, fixing the credential and envelope
    pub async fn begin_submission(
        &self,
        id: Uuid,
        credential_id: Uuid,
        envelope: &[u8],
        commitment: &Commitment,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE query_records
            SET state = 'submitting', credential_id = ?, envelope = ?, commitment = ?, updated_at = ?
            WHERE id = ? AND state = 'created'
            "#,
        )
        .bind(credential_id.to_string())
        .bind(envelope)
        .bind(commitment.as_bytes().as_slice())
        .bind(now.timestamp_millis())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Count one transmission attempt; `None` if the record left `submitting`
    pub async fn record_attempt(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<u32>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE query_records
            SET attempts = attempts + 1, updated_at = ?
            WHERE id = ? AND state = 'submitting'
            RETURNING attempts
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(attempts,)| attempts.max(0) as u32))
    }

    /// `submitting -> awaiting_responses`
    pub async fn mark_awaiting(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE query_records
            SET state = 'awaiting_responses', submitted_at = ?, updated_at = ?
            WHERE id = ? AND state = 'submitting'
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Move to `failed` if the record is currently in one of `from`
    pub async fn fail(
        &self,
        id: Uuid,
        from: &[QueryState],
        reason: FailureReason,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE query_records
            SET state = 'failed', failure_reason = ?, finished_at = ?, updated_at = ?
            WHERE id = ? AND state IN ({})
            "#,
            placeholders(from.len())
        );

        let mut query = sqlx::query(&sql)
            .bind(reason.as_str())
            .bind(now.timestamp_millis())
            .bind(now.timestamp_millis())
            .bind(id.to_string());
        for state in from {
            query = query.bind(state.as_str());
        }
        let result = query.execute(&self.pool).await?;

        Ok(result.rows_affected() > 0)
    }

    /// Append a verified response and complete the query when satisfied
    pub async fn append_response(
        &self,
        response: &Response,
        policy: LateResponsePolicy,
    ) -> Result<AppendOutcome> {
        let mut tx = self.pool.begin().await?;

        // Touching the row first takes the write lock before any read
        let target: Option<(String, Option<i64>)> = sqlx::query_as(
            r#"
            UPDATE query_records
            SET updated_at = ?
            WHERE id = ? AND state IN ('awaiting_responses', 'completed')
            RETURNING state, expected_responses
            "#,
        )
        .bind(response.received_at.timestamp_millis())
        .bind(response.query_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((state, expected)) = target else {
            tx.rollback().await?;
            return Ok(AppendOutcome::NotAwaiting);
        };
        let completed = parse_state(&state)? == QueryState::Completed;

        if completed && policy == LateResponsePolicy::Drop {
            tx.rollback().await?;
            return Ok(AppendOutcome::Late);
        }

        if !insert_response(&mut tx, response, completed).await? {
            tx.rollback().await?;
            return Ok(AppendOutcome::Duplicate);
        }

        if completed {
            tx.commit().await?;
            return Ok(AppendOutcome::RecordedLate);
        }

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM query_responses WHERE query_id = ? AND late = 0",
        )
        .bind(response.query_id.to_string())
        .fetch_one(&mut *tx)
        .await?;

        let satisfied = expected.is_some_and(|n| count >= n);
        if satisfied {
            sqlx::query(
                r#"
                UPDATE query_records
                SET state = 'completed', finished_at = ?
                WHERE id = ? AND state = 'awaiting_responses'
                "#,
            )
            .bind(response.received_at.timestamp_millis())
            .bind(response.query_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(if satisfied {
            AppendOutcome::Completed { count }
        } else {
            AppendOutcome::Accepted { count }
        })
    }

    /// Finalize every awaiting record whose deadline is at or before `now`
    ///
    /// Open-ended queries holding at least one response complete; everything
    /// else expires.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepResult> {
        let now_ms = now.timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let completed: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE query_records
            SET state = 'completed', finished_at = ?, updated_at = ?
            WHERE state = 'awaiting_responses'
            AND deadline <= ?
            AND expected_responses IS NULL
            AND EXISTS (SELECT 1 FROM query_responses r WHERE r.query_id = query_records.id)
            RETURNING id
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_all(&mut *tx)
        .await?;

        let expired: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE query_records
            SET state = 'expired', finished_at = ?, updated_at = ?
            WHERE state = 'awaiting_responses' AND deadline <= ?
            RETURNING id
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(SweepResult {
            expired: expired
                .into_iter()
                .map(|(id,)| parse_uuid(&id))
                .collect::<Result<_>>()?,
            completed: completed
                .into_iter()
                .map(|(id,)| parse_uuid(&id))
                .collect::<Result<_>>()?,
        })
    }

    /// Complete an awaiting open-ended query that holds at least one response
    pub async fn close(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE query_records
            SET state = 'completed', finished_at = ?, updated_at = ?
            WHERE id = ?
            AND state = 'awaiting_responses'
            AND expected_responses IS NULL
            AND EXISTS (SELECT 1 FROM query_responses r WHERE r.query_id = query_records.id)
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete terminal records (and their responses) finished before `cutoff`
    pub async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM query_records
            WHERE state IN ('completed', 'expired', 'failed') AND finished_at < ?
            "#,
        )
        .bind(cutoff.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Number of records per state
    pub async fn count_by_state(&self) -> Result<Vec<(QueryState, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*) FROM query_records GROUP BY state ORDER BY state",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(state, count)| Ok((parse_state(&state)?, count)))
            .collect()
    }
}

async fn insert_response(
    tx: &mut Transaction<'_, Sqlite>,
    response: &Response,
    late: bool,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO query_responses (id, query_id, payload, proof, received_at, late)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(response.query_id.to_string())
    .bind(response.payload.as_slice())
    .bind(response.proof.as_slice())
    .bind(response.received_at.timestamp_millis())
    .bind(late)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() > 0)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n.max(1)].join(", ")
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Parse(format!("Invalid query ID: {}", e)))
}

fn parse_state(s: &str) -> Result<QueryState> {
    QueryState::from_str(s).ok_or_else(|| Error::Parse(format!("Invalid query state: {}", s)))
}

fn parse_reason(s: Option<String>) -> Result<Option<FailureReason>> {
    s.map(|s| {
        FailureReason::from_str(&s)
            .ok_or_else(|| Error::Parse(format!("Invalid failure reason: {}", s)))
    })
    .transpose()
}

fn parse_expected(n: Option<i64>) -> Result<Option<u16>> {
    n.map(|n| {
        u16::try_from(n).map_err(|_| Error::Parse(format!("Invalid expected responses: {}", n)))
    })
    .transpose()
}

// ========== Database Row Types ==========

#[derive(sqlx::FromRow)]
struct QueryRow {
    id: String,
    state: String,
    payload_kind: String,
    payload: Vec<u8>,
    reply_secret: Vec<u8>,
    expected_responses: Option<i64>,
    created_at: i64,
    deadline: i64,
    credential_id: Option<String>,
    envelope: Option<Vec<u8>>,
    commitment: Option<Vec<u8>>,
    attempts: i64,
    failure_reason: Option<String>,
    submitted_at: Option<i64>,
    finished_at: Option<i64>,
    updated_at: i64,
}

impl QueryRow {
    fn into_record(self) -> Result<QueryRecord> {
        let kind = PayloadKind::from_str(&self.payload_kind)
            .ok_or_else(|| Error::Parse(format!("Invalid payload kind: {}", self.payload_kind)))?;
        let reply_secret: [u8; 32] = self
            .reply_secret
            .as_slice()
            .try_into()
            .map_err(|_| Error::Parse("Invalid reply secret length".to_string()))?;
        let commitment = self
            .commitment
            .map(|bytes| {
                Commitment::from_slice(&bytes)
                    .ok_or_else(|| Error::Parse("Invalid commitment length".to_string()))
            })
            .transpose()?;

        let query = Query {
            id: parse_uuid(&self.id)?,
            payload: QueryPayload::new(kind, self.payload),
            created_at: from_millis(self.created_at)?,
            deadline: from_millis(self.deadline)?,
            expected_responses: parse_expected(self.expected_responses)?,
            reply_secret,
        };

        Ok(QueryRecord {
            query,
            state: parse_state(&self.state)?,
            credential_id: self.credential_id.as_deref().map(parse_uuid).transpose()?,
            envelope: self.envelope,
            commitment,
            attempts: self.attempts.max(0) as u32,
            failure_reason: parse_reason(self.failure_reason)?,
            submitted_at: self.submitted_at.map(from_millis).transpose()?,
            finished_at: self.finished_at.map(from_millis).transpose()?,
            updated_at: from_millis(self.updated_at)?,
            responses: Vec::new(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResponseRow {
    id: String,
    query_id: String,
    payload: Vec<u8>,
    proof: Vec<u8>,
    received_at: i64,
    late: bool,
}

impl ResponseRow {
    fn into_stored(self) -> Result<StoredResponse> {
        let proof: [u8; 32] = self
            .proof
            .as_slice()
            .try_into()
            .map_err(|_| Error::Parse("Invalid response proof length".to_string()))?;

        Ok(StoredResponse {
            id: parse_uuid(&self.id)?,
            response: Response {
                query_id: parse_uuid(&self.query_id)?,
                payload: self.payload,
                proof,
                received_at: from_millis(self.received_at)?,
            },
            late: self.late,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: String,
    state: String,
    expected_responses: Option<i64>,
    attempts: i64,
    created_at: i64,
    deadline: i64,
    failure_reason: Option<String>,
    response_count: i64,
}

impl SummaryRow {
    fn into_summary(self) -> Result<QuerySummary> {
        Ok(QuerySummary {
            id: parse_uuid(&self.id)?,
            state: parse_state(&self.state)?,
            expected_responses: parse_expected(self.expected_responses)?,
            response_count: self.response_count,
            attempts: self.attempts.max(0) as u32,
            created_at: from_millis(self.created_at)?,
            deadline: from_millis(self.deadline)?,
            failure_reason: parse_reason(self.failure_reason)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credential, CredentialRepository};
    use crate::storage::{Database, now_millis};
    use std::time::Duration;

    struct Fixture {
        repo: QueryRepository,
        credentials: CredentialRepository,
    }

    async fn fixture() -> Fixture {
        let db = Database::in_memory().await.expect("database");
        Fixture {
            repo: QueryRepository::new(db.pool().clone()),
            credentials: CredentialRepository::new(db.pool().clone()),
        }
    }

    fn commitment() -> Commitment {
        Commitment([9; 32])
    }

    /// Drive a fresh query to `awaiting_responses`
    async fn awaiting(f: &Fixture, expected: Option<u16>, ttl: Duration) -> Query {
        let query = Query::new(QueryPayload::cleartext("terms"), expected, ttl);
        f.repo.insert(&query, now_millis()).await.unwrap();

        let credential = Credential::issued(vec![1, 2, 3], now_millis());
        f.credentials.insert_batch(std::slice::from_ref(&credential)).await.unwrap();
        f.credentials.reserve_one(now_millis()).await.unwrap();

        assert!(
            f.repo
                .begin_submission(query.id, credential.id, b"envelope", &commitment(), now_millis())
                .await
                .unwrap()
        );
        assert_eq!(f.repo.record_attempt(query.id, now_millis()).await.unwrap(), Some(1));
        assert!(f.repo.mark_awaiting(query.id, now_millis()).await.unwrap());
        query
    }

    fn response(query_id: Uuid, tag: u8) -> Response {
        Response::new(query_id, vec![tag], [tag; 32])
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let f = fixture().await;
        let query = Query::new(QueryPayload::cleartext("abc"), Some(3), Duration::from_secs(30));
        f.repo.insert(&query, now_millis()).await.unwrap();

        let record = f.repo.get(query.id).await.unwrap().expect("record");
        assert_eq!(record.query, query);
        assert_eq!(record.state, QueryState::Created);
        assert_eq!(record.attempts, 0);
        assert!(record.credential_id.is_none());
        assert!(record.responses.is_empty());

        assert!(f.repo.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_begin_submission_only_from_created() {
        let f = fixture().await;
        let query = awaiting(&f, Some(1), Duration::from_secs(30)).await;

        let again = f
            .repo
            .begin_submission(query.id, Uuid::new_v4(), b"other", &commitment(), now_millis())
            .await
            .unwrap();
        assert!(!again);
        assert_eq!(f.repo.record_attempt(query.id, now_millis()).await.unwrap(), None);
        assert!(!f.repo.mark_awaiting(query.id, now_millis()).await.unwrap());

        let record = f.repo.get(query.id).await.unwrap().unwrap();
        assert_eq!(record.envelope.as_deref(), Some(b"envelope".as_slice()));
        assert_eq!(record.commitment, Some(commitment()));
        assert!(record.submitted_at.is_some());
    }

    #[tokio::test]
    async fn test_append_completes_at_expected_count() {
        let f = fixture().await;
        let query = awaiting(&f, Some(2), Duration::from_secs(30)).await;
        let policy = LateResponsePolicy::Drop;

        assert_eq!(
            f.repo.append_response(&response(query.id, 1), policy).await.unwrap(),
            AppendOutcome::Accepted { count: 1 }
        );
        assert_eq!(
            f.repo.append_response(&response(query.id, 1), policy).await.unwrap(),
            AppendOutcome::Duplicate
        );
        assert_eq!(
            f.repo.append_response(&response(query.id, 2), policy).await.unwrap(),
            AppendOutcome::Completed { count: 2 }
        );
        assert_eq!(
            f.repo.append_response(&response(query.id, 3), policy).await.unwrap(),
            AppendOutcome::Late
        );

        let record = f.repo.get(query.id).await.unwrap().unwrap();
        assert_eq!(record.state, QueryState::Completed);
        assert_eq!(record.responses.len(), 2);
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_late_responses_recorded_when_configured() {
        let f = fixture().await;
        let query = awaiting(&f, Some(1), Duration::from_secs(30)).await;
        let policy = LateResponsePolicy::Record;

        f.repo.append_response(&response(query.id, 1), policy).await.unwrap();
        assert_eq!(
            f.repo.append_response(&response(query.id, 2), policy).await.unwrap(),
            AppendOutcome::RecordedLate
        );

        let record = f.repo.get(query.id).await.unwrap().unwrap();
        assert_eq!(record.state, QueryState::Completed);
        assert_eq!(record.responses.len(), 2);
        assert_eq!(record.on_time_responses().count(), 1);
    }

    #[tokio::test]
    async fn test_append_to_unknown_or_created_is_rejected() {
        let f = fixture().await;
        let query = Query::new(QueryPayload::cleartext("abc"), Some(1), Duration::from_secs(30));
        f.repo.insert(&query, now_millis()).await.unwrap();

        for id in [Uuid::new_v4(), query.id] {
            assert_eq!(
                f.repo
                    .append_response(&response(id, 1), LateResponsePolicy::Record)
                    .await
                    .unwrap(),
                AppendOutcome::NotAwaiting
            );
        }
        assert!(f.repo.responses(query.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_expires_and_completes_open_ended() {
        let f = fixture().await;
        let short = awaiting(&f, Some(2), Duration::from_millis(10)).await;
        let open_with = awaiting(&f, None, Duration::from_millis(10)).await;
        let open_without = awaiting(&f, None, Duration::from_millis(10)).await;
        let long = awaiting(&f, Some(1), Duration::from_secs(3600)).await;

        let policy = LateResponsePolicy::Drop;
        f.repo.append_response(&response(short.id, 1), policy).await.unwrap();
        f.repo.append_response(&response(open_with.id, 1), policy).await.unwrap();

        let later = now_millis() + chrono::Duration::seconds(1);
        let result = f.repo.sweep(later).await.unwrap();
        assert_eq!(result.completed, vec![open_with.id]);
        assert_eq!(result.expired.len(), 2);
        assert!(result.expired.contains(&short.id));
        assert!(result.expired.contains(&open_without.id));

        let expired = f.repo.get(short.id).await.unwrap().unwrap();
        assert_eq!(expired.state, QueryState::Expired);
        assert_eq!(expired.responses.len(), 1);
        assert_eq!(f.repo.state_of(long.id).await.unwrap(), Some(QueryState::AwaitingResponses));

        // A second sweep finds nothing
        assert_eq!(f.repo.sweep(later).await.unwrap(), SweepResult::default());
        // And the expired record no longer accepts responses
        assert_eq!(
            f.repo.append_response(&response(short.id, 2), policy).await.unwrap(),
            AppendOutcome::NotAwaiting
        );
    }

    #[tokio::test]
    async fn test_close_requires_a_response() {
        let f = fixture().await;
        let query = awaiting(&f, None, Duration::from_secs(30)).await;

        assert!(!f.repo.close(query.id, now_millis()).await.unwrap());
        f.repo
            .append_response(&response(query.id, 1), LateResponsePolicy::Drop)
            .await
            .unwrap();
        assert!(f.repo.close(query.id, now_millis()).await.unwrap());
        assert_eq!(f.repo.state_of(query.id).await.unwrap(), Some(QueryState::Completed));
    }

    #[tokio::test]
    async fn test_fail_respects_source_states() {
        let f = fixture().await;
        let query = awaiting(&f, Some(1), Duration::from_secs(30)).await;

        let pre_submit = [QueryState::Created, QueryState::Submitting];
        assert!(!f.repo.fail(query.id, &pre_submit, FailureReason::EncodeFailed, now_millis()).await.unwrap());

        assert!(
            f.repo
                .fail(query.id, &QueryState::sources_of(QueryState::Failed), FailureReason::Cancelled, now_millis())
                .await
                .unwrap()
        );
        let record = f.repo.get(query.id).await.unwrap().unwrap();
        assert_eq!(record.state, QueryState::Failed);
        assert_eq!(record.failure_reason, Some(FailureReason::Cancelled));
    }

    #[tokio::test]
    async fn test_list_count_and_purge() {
        let f = fixture().await;
        let done = awaiting(&f, Some(1), Duration::from_secs(30)).await;
        f.repo
            .append_response(&response(done.id, 1), LateResponsePolicy::Drop)
            .await
            .unwrap();
        let pending = Query::new(QueryPayload::cleartext("p"), None, Duration::from_secs(30));
        f.repo.insert(&pending, now_millis()).await.unwrap();

        let all = f.repo.list(None, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        let completed = f.repo.list(Some(QueryState::Completed), 10).await.unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].response_count, 1);

        let counts = f.repo.count_by_state().await.unwrap();
        assert!(counts.contains(&(QueryState::Completed, 1)));
        assert!(counts.contains(&(QueryState::Created, 1)));

        let ids = f.repo.ids_in_states(&[QueryState::Created, QueryState::Submitting]).await.unwrap();
        assert_eq!(ids, vec![pending.id]);

        let cutoff = now_millis() + chrono::Duration::seconds(1);
        assert_eq!(f.repo.purge_terminal_before(cutoff).await.unwrap(), 1);
        assert!(f.repo.get(done.id).await.unwrap().is_none());
        assert!(f.repo.responses(done.id).await.unwrap().is_empty());
        assert!(f.repo.get(pending.id).await.unwrap().is_some());
    }
}
