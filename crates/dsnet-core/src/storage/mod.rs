//! Storage layer - SQLite
//!
//! Durable home of credentials, query records and their responses.
//!
//! # Architecture
//!
//! - `database`: Connection pool management and initialization
//! - `migrations`: Schema versioning and automatic migration
//!
//! # Usage
//!
//! ```ignore
//! use dsnet_core::storage::Database;
//!
//! // Create an in-memory database for testing
//! let db = Database::in_memory().await?;
//! ```

pub mod database;
pub mod migrations;

pub use database::{Database, DatabaseConfig};
pub use migrations::{migration_status, run_migrations, MigrationStatus, CURRENT_VERSION};

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Current time truncated to the millisecond precision used in storage
pub fn now_millis() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis()).unwrap_or_else(|_| Utc::now())
}

/// Convert a stored millisecond timestamp back into a `DateTime`
pub fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Parse(format!("Timestamp out of range: {}", ms)))
}
