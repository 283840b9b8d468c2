//! Database migrations
//!
//! This module manages SQLite schema migrations for the dsnet client.
//! Migrations are versioned and applied automatically on database connection.
//!
//! All timestamps are INTEGER milliseconds since the Unix epoch so that
//! deadline comparisons are numeric rather than lexical.

use sqlx::SqlitePool;

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

/// SQL for creating the migrations tracking table
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: Credential store and query records
const MIGRATION_V1: &str = r#"
    -- Anonymous credentials
    CREATE TABLE IF NOT EXISTS credentials (
        id TEXT PRIMARY KEY NOT NULL,
        token BLOB NOT NULL,
        state TEXT NOT NULL DEFAULT 'unused' CHECK (state IN ('unused', 'reserved', 'spent')),
        issued_at INTEGER NOT NULL,
        reserved_at INTEGER,
        spent_at INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_credentials_state ON credentials(state, issued_at);

    -- Durable projection of each query's lifecycle
    CREATE TABLE IF NOT EXISTS query_records (
        id TEXT PRIMARY KEY NOT NULL,
        state TEXT NOT NULL DEFAULT 'created' CHECK (state IN (
            'created', 'submitting', 'awaiting_responses', 'completed', 'expired', 'failed'
        )),
        payload_kind TEXT NOT NULL,
        payload BLOB NOT NULL,
        reply_secret BLOB NOT NULL,
        expected_responses INTEGER,
        created_at INTEGER NOT NULL,
        deadline INTEGER NOT NULL,
        credential_id TEXT REFERENCES credentials(id) ON DELETE SET NULL,
        envelope BLOB,
        commitment BLOB,
        attempts INTEGER NOT NULL DEFAULT 0,
        failure_reason TEXT,
        submitted_at INTEGER,
        finished_at INTEGER,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_query_records_state ON query_records(state, deadline);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_query_records_credential
        ON query_records(credential_id) WHERE credential_id IS NOT NULL;

    -- Responses collected for a query (a set: duplicates collapse on proof)
    CREATE TABLE IF NOT EXISTS query_responses (
        id TEXT PRIMARY KEY NOT NULL,
        query_id TEXT NOT NULL REFERENCES query_records(id) ON DELETE CASCADE,
        payload BLOB NOT NULL,
        proof BLOB NOT NULL,
        received_at INTEGER NOT NULL,
        late INTEGER NOT NULL DEFAULT 0,
        UNIQUE (query_id, proof)
    );

    CREATE INDEX IF NOT EXISTS idx_query_responses_query_id ON query_responses(query_id);
"#;

/// Migration 2: Responder-side replay guard
const MIGRATION_V2: &str = r#"
    CREATE TABLE IF NOT EXISTS redeemed_tokens (
        digest TEXT PRIMARY KEY NOT NULL,
        query_id TEXT NOT NULL,
        seen_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_redeemed_tokens_seen_at ON redeemed_tokens(seen_at);
"#;

/// Get the current schema version from the database
async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let (version,): (Option<i32>,) = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_one(pool)
        .await?;

    Ok(version.unwrap_or(0))
}

/// Record that a migration has been applied
async fn record_migration(pool: &SqlitePool, version: i32) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Credential store and query records");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    if current_version < 2 {
        tracing::info!("Applying migration v2: Redeemed token replay guard");
        sqlx::raw_sql(MIGRATION_V2).execute(pool).await?;
        record_migration(pool, 2).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Check if the database needs migrations
pub async fn needs_migration(pool: &SqlitePool) -> anyhow::Result<bool> {
    let current_version = get_current_version(pool).await?;
    Ok(current_version < CURRENT_VERSION)
}

/// Get migration status information
pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Current schema version in the database
    pub current_version: i32,
    /// Target schema version (latest)
    pub target_version: i32,
    /// Whether migrations need to be run
    pub needs_migration: bool,
}
