//! Query and response entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::storage::now_millis;

/// What a payload asks of the remote index
///
/// The engine only uses this as a wire tag; the local index decides which
/// kinds it can answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PayloadKind {
    /// Plain search terms
    Cleartext = 1,
    /// Private set intersection request
    Psi = 2,
}

impl PayloadKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Cleartext),
            2 => Some(Self::Psi),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "cleartext" => Some(Self::Cleartext),
            "psi" => Some(Self::Psi),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cleartext => "cleartext",
            Self::Psi => "psi",
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opaque query content tagged with its kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPayload {
    pub kind: PayloadKind,
    pub bytes: Vec<u8>,
}

impl QueryPayload {
    pub fn new(kind: PayloadKind, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            bytes: bytes.into(),
        }
    }

    /// Cleartext search terms
    pub fn cleartext(text: impl AsRef<str>) -> Self {
        Self::new(PayloadKind::Cleartext, text.as_ref().as_bytes())
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A locally originated search request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub id: Uuid,
    pub payload: QueryPayload,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Distinct responses that complete the query
    ///
    /// `None` means open-ended: completes on `close` or at the deadline.
    /// Responses are counted as a set: two responders returning byte-identical
    /// results for this query produce the same proof and count once, so a
    /// count above the number of distinct possible answers may never be
    /// reached and the query then expires at its deadline.
    pub expected_responses: Option<u16>,
    /// Per-query random salt, so identical payloads never share a commitment
    pub reply_secret: [u8; 32],
}

impl Query {
    /// Build a query that expires `ttl` from now
    ///
    /// An expected count of zero is treated as open-ended.
    pub fn new(payload: QueryPayload, expected_responses: Option<u16>, ttl: Duration) -> Self {
        let created_at = now_millis();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let deadline = created_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            id: Uuid::new_v4(),
            payload,
            created_at,
            deadline: crate::storage::from_millis(deadline.timestamp_millis()).unwrap_or(deadline),
            expected_responses: expected_responses.filter(|n| *n > 0),
            reply_secret: rand::random(),
        }
    }

    pub fn is_open_ended(&self) -> bool {
        self.expected_responses.is_none()
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}

/// A reply to one query, as collected by the aggregator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub query_id: Uuid,
    /// Result payload produced by the remote index
    pub payload: Vec<u8>,
    /// HMAC over the query id and payload, keyed by the envelope commitment
    pub proof: [u8; 32],
    pub received_at: DateTime<Utc>,
}

impl Response {
    pub fn new(query_id: Uuid, payload: Vec<u8>, proof: [u8; 32]) -> Self {
        Self {
            query_id,
            payload,
            proof,
            received_at: now_millis(),
        }
    }
}

/// A response as stored against its query record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub id: Uuid,
    pub response: Response,
    /// Arrived after the query had already completed
    pub late: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_kind_tags() {
        for kind in [PayloadKind::Cleartext, PayloadKind::Psi] {
            assert_eq!(PayloadKind::from_u8(kind.as_u8()), Some(kind));
            assert_eq!(PayloadKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(PayloadKind::from_u8(0), None);
        assert_eq!(PayloadKind::from_u8(0x7f), None);
    }

    #[test]
    fn test_new_query_timestamps_are_millisecond_precision() {
        let query = Query::new(QueryPayload::cleartext("rust"), Some(2), Duration::from_secs(60));
        assert_eq!(query.created_at.timestamp_subsec_nanos() % 1_000_000, 0);
        assert_eq!(query.deadline.timestamp_subsec_nanos() % 1_000_000, 0);
        assert_eq!((query.deadline - query.created_at).num_seconds(), 60);
        assert!(!query.is_past_deadline(query.created_at));
        assert!(query.is_past_deadline(query.deadline));
    }

    #[test]
    fn test_zero_expected_means_open_ended() {
        let query = Query::new(QueryPayload::cleartext("x"), Some(0), Duration::from_secs(1));
        assert!(query.is_open_ended());
        let query = Query::new(QueryPayload::cleartext("x"), None, Duration::from_secs(1));
        assert!(query.is_open_ended());
    }

    #[test]
    fn test_queries_get_distinct_ids_and_secrets() {
        let a = Query::new(QueryPayload::cleartext("same"), None, Duration::from_secs(1));
        let b = Query::new(QueryPayload::cleartext("same"), None, Duration::from_secs(1));
        assert_ne!(a.id, b.id);
        assert_ne!(a.reply_secret, b.reply_secret);
    }
}
