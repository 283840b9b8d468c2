//! Submission engine
//!
//! Drives a query from `created` to `awaiting_responses`: reserve a
//! credential, bind it to the envelope commitment, encode, and transmit with
//! bounded exponential backoff.
//!
//! A credential counts as spent the moment the relay acknowledges a send.
//! Until then any exit path hands the reservation back, except a transport
//! shutdown, which leaves the record `submitting` for [`SubmissionEngine::resume`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backoff::BackoffPolicy;
use crate::codec::QueryCodec;
use crate::credentials::{Credential, CredentialManager};
use crate::error::{Error, Result};
use crate::query::{FailureReason, Query, QueryRecord, QueryRepository, QueryState};
use crate::storage::now_millis;
use crate::transport::{PeerSelector, RelayTransport, TransportError};

/// Ids held by this process, with RAII removal
#[derive(Debug, Clone, Default)]
struct IdSet(Arc<Mutex<HashSet<Uuid>>>);

impl IdSet {
    fn try_insert(&self, id: Uuid) -> Option<IdGuard> {
        let mut set = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        set.insert(id).then(|| IdGuard {
            set: self.clone(),
            id,
        })
    }

    fn contains(&self, id: Uuid) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }
}

struct IdGuard {
    set: IdSet,
    id: Uuid,
}

impl Drop for IdGuard {
    fn drop(&mut self) {
        self.set
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Submission engine
#[derive(Clone)]
pub struct SubmissionEngine {
    credentials: CredentialManager,
    queries: QueryRepository,
    codec: QueryCodec,
    transport: Arc<dyn RelayTransport>,
    backoff: BackoffPolicy,
    auto_acquire_batch: u32,
    /// Queries with a submitter running in this process
    active: IdSet,
    /// Queries whose envelope is currently handed to the transport
    transmitting: IdSet,
}

impl SubmissionEngine {
    pub fn new(
        credentials: CredentialManager,
        queries: QueryRepository,
        codec: QueryCodec,
        transport: Arc<dyn RelayTransport>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            credentials,
            queries,
            codec,
            transport,
            backoff,
            auto_acquire_batch: 0,
            active: IdSet::default(),
            transmitting: IdSet::default(),
        }
    }

    /// Acquire this many credentials when a reservation finds none (0 disables)
    pub fn with_auto_acquire(mut self, batch: u32) -> Self {
        self.auto_acquire_batch = batch;
        self
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Persist `query` and submit it
    ///
    /// Returns the record once the relay has acknowledged the envelope.
    /// `NoCredentialAvailable` leaves the record `created` for a later
    /// [`resume`](Self::resume).
    pub async fn submit(&self, query: Query) -> Result<QueryRecord> {
        self.queries.insert(&query, now_millis()).await?;
        info!(
            query_id = %query.id,
            kind = %query.payload.kind,
            expected = ?query.expected_responses,
            deadline = %query.deadline,
            "Query created"
        );

        let Some(_guard) = self.active.try_insert(query.id) else {
            return self.record(query.id).await;
        };
        self.submit_created(&query).await
    }

    /// Continue an interrupted submission
    ///
    /// `created` records start over from reservation; `submitting` records
    /// retransmit their stored envelope with the credential they already
    /// hold. Any other state, or a submitter already running for this id, is
    /// returned unchanged.
    pub async fn resume(&self, id: Uuid) -> Result<QueryRecord> {
        let Some(_guard) = self.active.try_insert(id) else {
            debug!(query_id = %id, "Submission already running");
            return self.record(id).await;
        };

        let record = self.record(id).await?;
        match record.state {
            QueryState::Created => {
                info!(query_id = %id, "Resuming query from created");
                self.submit_created(&record.query).await
            }
            QueryState::Submitting => {
                let (Some(credential_id), Some(envelope)) = (record.credential_id, record.envelope)
                else {
                    return Err(Error::Parse(format!(
                        "submitting query {} has no credential or envelope",
                        id
                    )));
                };
                info!(
                    query_id = %id,
                    credential_id = %credential_id,
                    attempts = record.attempts,
                    "Resuming transmission"
                );
                self.transmit(id, credential_id, &envelope).await
            }
            _ => Ok(record),
        }
    }

    /// Cancel a query that has not finished
    ///
    /// Before the credential is spent the reservation is returned; after
    /// that the query is failed without refund.
    pub async fn cancel(&self, id: Uuid) -> Result<QueryRecord> {
        let from = QueryState::sources_of(QueryState::Failed);
        if !self
            .queries
            .fail(id, &from, FailureReason::Cancelled, now_millis())
            .await?
        {
            let record = self.record(id).await?;
            return Err(Error::InvalidTransition {
                id,
                from: record.state.to_string(),
                to: QueryState::Failed.to_string(),
            });
        }

        let record = self.record(id).await?;
        info!(query_id = %id, "Query cancelled");

        // A send in progress decides for itself once it returns
        if let Some(credential_id) = record.credential_id
            && !self.transmitting.contains(id)
        {
            self.release_unsent(id, credential_id).await;
        }

        Ok(record)
    }

    async fn submit_created(&self, query: &Query) -> Result<QueryRecord> {
        if let Err(e) = self.codec.check_fits(query) {
            self.fail(query.id, QueryState::Created, FailureReason::EncodeFailed).await?;
            return Err(e);
        }

        let credential = self.reserve().await?;

        let commitment = self.codec.commitment(query);
        let proof = self
            .credentials
            .authority()
            .prove(&credential.token, &commitment);

        let envelope = match self.codec.encode(query, &proof) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(query_id = %query.id, error = %e, "Envelope encoding failed");
                self.fail(query.id, QueryState::Created, FailureReason::EncodeFailed).await?;
                self.release_unsent(query.id, credential.id).await;
                return Err(e);
            }
        };

        let started = self
            .queries
            .begin_submission(
                query.id,
                credential.id,
                envelope.as_bytes(),
                &commitment,
                now_millis(),
            )
            .await?;
        if !started {
            // Cancelled between creation and reservation
            self.release_unsent(query.id, credential.id).await;
            return self.record(query.id).await;
        }

        debug!(
            query_id = %query.id,
            credential_id = %credential.id,
            envelope_len = envelope.len(),
            "Query submitting"
        );
        self.transmit(query.id, credential.id, envelope.as_bytes()).await
    }

    async fn reserve(&self) -> Result<Credential> {
        match self.credentials.reserve_one().await {
            Err(Error::NoCredentialAvailable) if self.auto_acquire_batch > 0 => {
                info!(batch = self.auto_acquire_batch, "Credential store empty, acquiring");
                self.credentials
                    .acquire_with_retry(self.auto_acquire_batch, &self.backoff)
                    .await?;
                self.credentials.reserve_one().await
            }
            other => other,
        }
    }

    async fn transmit(&self, id: Uuid, credential_id: Uuid, envelope: &[u8]) -> Result<QueryRecord> {
        let peers = PeerSelector::Fanout { route: id };

        loop {
            let sending = self.transmitting.try_insert(id);
            let Some(attempt) = self.queries.record_attempt(id, now_millis()).await? else {
                drop(sending);
                // Left `submitting` underneath us (cancelled) before this send
                self.release_unsent(id, credential_id).await;
                return self.record(id).await;
            };

            debug!(query_id = %id, attempt, "Transmitting envelope");
            let result = self.transport.send(&peers, envelope).await;
            drop(sending);

            match result {
                Ok(()) => {
                    self.credentials.mark_spent(credential_id).await?;
                    if self.queries.mark_awaiting(id, now_millis()).await? {
                        info!(query_id = %id, attempt, "Query submitted, awaiting responses");
                    } else {
                        debug!(query_id = %id, "Query left submitting during transmission");
                    }
                    return self.record(id).await;
                }
                Err(TransportError::Closed) => {
                    warn!(query_id = %id, "Transport closed, submission will resume later");
                    return Err(TransportError::Closed.into());
                }
                Err(e) if e.is_transient() && self.backoff.allows_retry(attempt) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        query_id = %id,
                        attempt,
                        wait_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transmission failed, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    warn!(query_id = %id, attempts = attempt, error = %e, "Transmission attempts exhausted");
                    self.fail(id, QueryState::Submitting, FailureReason::TransmissionExhausted)
                        .await?;
                    self.release_unsent(id, credential_id).await;
                    return Err(Error::SubmissionExhausted {
                        id,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    warn!(query_id = %id, attempt, error = %e, "Relay rejected envelope");
                    self.fail(id, QueryState::Submitting, FailureReason::TransportRejected)
                        .await?;
                    self.release_unsent(id, credential_id).await;
                    return Err(e.into());
                }
            }
        }
    }

    async fn fail(&self, id: Uuid, from: QueryState, reason: FailureReason) -> Result<()> {
        if self.queries.fail(id, &[from], reason, now_millis()).await? {
            info!(query_id = %id, reason = %reason, "Query failed");
        }
        Ok(())
    }

    /// Return a reservation whose token never left the process
    ///
    /// A credential spent by an earlier run of this submission stays spent.
    async fn release_unsent(&self, id: Uuid, credential_id: Uuid) {
        match self.credentials.release(credential_id).await {
            Ok(()) => {}
            Err(Error::InvalidCredentialState { state, .. }) => {
                debug!(query_id = %id, credential_id = %credential_id, state = %state, "Credential not released");
            }
            Err(e) => {
                warn!(query_id = %id, credential_id = %credential_id, error = %e, "Failed to release credential");
            }
        }
    }

    async fn record(&self, id: Uuid) -> Result<QueryRecord> {
        self.queries.get(id).await?.ok_or(Error::QueryNotFound(id))
    }
}
