//! Query lifecycle state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::query::{Query, StoredResponse};
use crate::codec::Commitment;

/// Lifecycle state of a query
///
/// ```text
/// Created -> Submitting -> AwaitingResponses -> Completed | Expired
///    |           |  ^              |
///    |           +--+ (retry)      |
///    +-----------+-----------------+--> Failed
/// ```
///
/// `Completed`, `Expired` and `Failed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Created,
    Submitting,
    AwaitingResponses,
    Completed,
    Expired,
    Failed,
}

impl QueryState {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "submitting" => Some(Self::Submitting),
            "awaiting_responses" => Some(Self::AwaitingResponses),
            "completed" => Some(Self::Completed),
            "expired" => Some(Self::Expired),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Submitting => "submitting",
            Self::AwaitingResponses => "awaiting_responses",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Failed)
    }

    /// Whether a submission for this query may still be (re)attempted
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Created | Self::Submitting)
    }

    /// Check whether a transition to `target` is allowed
    pub fn can_transition_to(&self, target: QueryState) -> bool {
        use QueryState::*;
        matches!(
            (self, target),
            (Created, Submitting)
                | (Created, Failed)
                | (Submitting, Submitting)
                | (Submitting, AwaitingResponses)
                | (Submitting, Failed)
                | (AwaitingResponses, Completed)
                | (AwaitingResponses, Expired)
                | (AwaitingResponses, Failed)
        )
    }

    /// States from which `target` can be entered
    pub fn sources_of(target: QueryState) -> Vec<QueryState> {
        ALL_STATES
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(target))
            .collect()
    }
}

const ALL_STATES: [QueryState; 6] = [
    QueryState::Created,
    QueryState::Submitting,
    QueryState::AwaitingResponses,
    QueryState::Completed,
    QueryState::Expired,
    QueryState::Failed,
];

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a query ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Cancelled,
    EncodeFailed,
    TransmissionExhausted,
    TransportRejected,
}

impl FailureReason {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "cancelled" => Some(Self::Cancelled),
            "encode_failed" => Some(Self::EncodeFailed),
            "transmission_exhausted" => Some(Self::TransmissionExhausted),
            "transport_rejected" => Some(Self::TransportRejected),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::EncodeFailed => "encode_failed",
            Self::TransmissionExhausted => "transmission_exhausted",
            Self::TransportRejected => "transport_rejected",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable projection of a query's lifecycle
#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub query: Query,
    pub state: QueryState,
    /// Credential reserved for (or spent by) this query
    pub credential_id: Option<Uuid>,
    /// Encoded envelope, fixed once submission begins
    pub envelope: Option<Vec<u8>>,
    pub commitment: Option<Commitment>,
    pub attempts: u32,
    pub failure_reason: Option<FailureReason>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Collected responses, oldest first
    pub responses: Vec<StoredResponse>,
}

impl QueryRecord {
    pub fn id(&self) -> Uuid {
        self.query.id
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Responses that arrived before completion
    pub fn on_time_responses(&self) -> impl Iterator<Item = &StoredResponse> {
        self.responses.iter().filter(|r| !r.late)
    }
}

/// One row of a query listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySummary {
    pub id: Uuid,
    pub state: QueryState,
    pub expected_responses: Option<u16>,
    pub response_count: i64,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub failure_reason: Option<FailureReason>,
}
