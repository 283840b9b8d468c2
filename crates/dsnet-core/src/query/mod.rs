//! Query lifecycle
//!
//! - `query`: query, payload and response entities
//! - `state`: the lifecycle state machine and the durable record
//! - `repository`: compare-and-set persistence of records and responses

pub mod query;
pub mod repository;
pub mod state;

pub use query::{PayloadKind, Query, QueryPayload, Response, StoredResponse};
pub use repository::{AppendOutcome, QueryRepository, SweepResult};
pub use state::{FailureReason, QueryRecord, QueryState, QuerySummary};
