//! Response aggregator
//!
//! Inbound responses are untrusted. Each one is matched to an in-flight
//! query, its proof checked against that query's envelope commitment, and
//! only then appended. Every rejection is logged with its concrete reason,
//! but callers only ever learn that the response was dropped.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::QueryCodec;
use crate::config::LateResponsePolicy;
use crate::error::{Error, Result};
use crate::query::{AppendOutcome, QueryRecord, QueryRepository, QueryState, Response, SweepResult};
use crate::storage::now_millis;

/// What happened to one inbound response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Stored against its query
    Accepted { count: i64 },
    /// Stored, and the query reached its expected count
    Completed { count: i64 },
    /// Not stored; the reason is only in the logs
    Dropped,
}

impl ResponseOutcome {
    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped)
    }
}

/// Collects and verifies responses for awaiting queries
#[derive(Debug, Clone)]
pub struct ResponseAggregator {
    queries: QueryRepository,
    policy: LateResponsePolicy,
}

impl ResponseAggregator {
    pub fn new(queries: QueryRepository, policy: LateResponsePolicy) -> Self {
        Self { queries, policy }
    }

    pub fn policy(&self) -> LateResponsePolicy {
        self.policy
    }

    /// Verify and store a response
    ///
    /// Only storage failures are returned as errors.
    pub async fn on_response(&self, response: Response) -> Result<ResponseOutcome> {
        let query_id = response.query_id;

        match self.verify(&response).await {
            Ok(()) => {}
            Err(Error::DatabaseError(e)) => return Err(Error::DatabaseError(e)),
            Err(e) => {
                debug!(query_id = %query_id, code = e.code(), reason = %e, "Dropping response");
                return Ok(ResponseOutcome::Dropped);
            }
        }

        let outcome = match self.queries.append_response(&response, self.policy).await? {
            AppendOutcome::Accepted { count } => {
                debug!(query_id = %query_id, count, "Response accepted");
                ResponseOutcome::Accepted { count }
            }
            AppendOutcome::Completed { count } => {
                info!(query_id = %query_id, count, state = %QueryState::Completed, "Query completed");
                ResponseOutcome::Completed { count }
            }
            AppendOutcome::RecordedLate => {
                debug!(query_id = %query_id, "Late response recorded for completed query");
                let count = self.queries.responses(query_id).await?.len() as i64;
                ResponseOutcome::Accepted { count }
            }
            AppendOutcome::Late => {
                debug!(query_id = %query_id, reason = "late", "Dropping response for completed query");
                ResponseOutcome::Dropped
            }
            AppendOutcome::Duplicate => {
                debug!(query_id = %query_id, reason = "duplicate", "Dropping duplicate response");
                ResponseOutcome::Dropped
            }
            AppendOutcome::NotAwaiting => {
                // The sweep got there between verification and append
                debug!(query_id = %query_id, reason = "not awaiting", "Dropping response");
                ResponseOutcome::Dropped
            }
        };

        Ok(outcome)
    }

    async fn verify(&self, response: &Response) -> Result<()> {
        let commitment = self
            .queries
            .commitment_for_response(response.query_id)
            .await?
            .ok_or(Error::UnknownQuery(response.query_id))?;

        if !QueryCodec::verify_response(&commitment, response) {
            return Err(Error::ResponseProofInvalid);
        }
        Ok(())
    }

    /// Finalize awaiting queries whose deadline is at or before `now`
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepResult> {
        let result = self.queries.sweep(now).await?;

        for id in &result.completed {
            info!(query_id = %id, state = %QueryState::Completed, "Open-ended query closed at deadline");
        }
        for id in &result.expired {
            info!(query_id = %id, state = %QueryState::Expired, "Query expired");
        }

        Ok(result)
    }

    /// Complete an open-ended query that holds at least one response
    ///
    /// With no responses yet the record is returned still awaiting; only the
    /// sweep expires queries.
    pub async fn close(&self, id: Uuid) -> Result<QueryRecord> {
        if self.queries.close(id, now_millis()).await? {
            info!(query_id = %id, state = %QueryState::Completed, "Query closed");
            return self.record(id).await;
        }

        let record = self.record(id).await?;
        if record.state != QueryState::AwaitingResponses {
            return Err(Error::InvalidTransition {
                id,
                from: record.state.to_string(),
                to: QueryState::Completed.to_string(),
            });
        }
        if let Some(expected) = record.query.expected_responses {
            return Err(Error::InvalidInput(format!(
                "query {} expects {} responses and completes on its own",
                id, expected
            )));
        }

        warn!(query_id = %id, "Close requested with no responses yet, still awaiting");
        Ok(record)
    }

    async fn record(&self, id: Uuid) -> Result<QueryRecord> {
        self.queries.get(id).await?.ok_or(Error::QueryNotFound(id))
    }
}
