//! dsnet Core Library
//!
//! Client engine for the datashare privacy-preserving search network:
//! - Anonymous credentials (acquisition, reservation, single spend)
//! - Query codec (size-bucketed envelopes bound to a credential proof)
//! - Query lifecycle (durable state machine, resumable after restart)
//! - Submission with retry/backoff over an unreliable relay
//! - Response verification and aggregation, deadline sweep
//! - Local answering of inbound queries
//! - Storage (SQLite)

pub mod codec;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod index;
pub mod query;
pub mod storage;
pub mod transport;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::engine::{Engine, EngineBuilder, ResponseOutcome};
    pub use crate::error::{Error, Result};
    pub use crate::query::{PayloadKind, Query, QueryPayload, QueryRecord, QueryState, Response};
    pub use crate::storage::Database;
}
