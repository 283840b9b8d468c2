//! Engine
//!
//! [`Engine`] is the context object owning the credential store, the query
//! records and the capabilities they talk to. Every operation goes through
//! it; there is no process-wide state.
//!
//! - `submission`: created -> awaiting, with retry/backoff
//! - `aggregator`: verify and collect responses, expiry sweep, close
//! - `answerer`: answer inbound queries from the local index
//! - `backoff`: shared retry schedule

pub mod aggregator;
pub mod answerer;
pub mod backoff;
pub mod submission;

pub use aggregator::{ResponseAggregator, ResponseOutcome};
pub use answerer::LocalAnswerer;
pub use backoff::BackoffPolicy;
pub use submission::SubmissionEngine;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::{FrameKind, QueryCodec};
use crate::config::Config;
use crate::credentials::{
    Credential, CredentialAuthority, CredentialInventory, CredentialManager, CredentialRepository,
    CredentialState, RedeemedTokenRepository,
};
use crate::error::{Error, Result};
use crate::index::LocalIndex;
use crate::query::{
    Query, QueryPayload, QueryRecord, QueryRepository, QueryState, QuerySummary, Response,
    SweepResult,
};
use crate::storage::{Database, now_millis};
use crate::transport::{CoverTrafficSender, PeerSelector, RelayTransport, TickSource};

/// Counters from one pass over the relay inbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub frames: usize,
    /// Inbound queries answered and replied to
    pub answered: usize,
    /// Responses stored against a local query
    pub accepted: usize,
    /// Queries completed by this pass
    pub completed: usize,
    pub dropped: usize,
    /// Frames whose handling hit a local error; the rest of the batch still ran
    pub failed: usize,
}

/// What [`Engine::recover`] did after a restart
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Credentials reserved by a submission that never recorded them
    pub released: u64,
    /// Records brought to `awaiting_responses` or a terminal state
    pub resumed: Vec<Uuid>,
    /// Records whose resumption returned an error
    pub failed: Vec<Uuid>,
}

/// Builder for an [`Engine`]
pub struct EngineBuilder {
    config: Option<Config>,
    database: Option<Database>,
    authority: Option<Arc<dyn CredentialAuthority>>,
    transport: Option<Arc<dyn RelayTransport>>,
    index: Option<Arc<dyn LocalIndex>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            database: None,
            authority: None,
            transport: None,
            index: None,
        }
    }

    /// Engine configuration (defaults if unset)
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Migrated database holding credentials and query records
    pub fn database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn authority(mut self, authority: Arc<dyn CredentialAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn RelayTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Local index; without one, inbound queries are dropped
    pub fn index(mut self, index: Arc<dyn LocalIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Build the engine
    ///
    /// With cover traffic enabled this spawns the release worker, so it must
    /// run inside a tokio runtime.
    pub fn build(self) -> Result<Engine> {
        let config = self.config.unwrap_or_default();
        config
            .validate()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        let database = self
            .database
            .ok_or_else(|| Error::ConfigError("a database is required".into()))?;
        let authority = self
            .authority
            .ok_or_else(|| Error::ConfigError("a credential authority is required".into()))?;
        let transport = self
            .transport
            .ok_or_else(|| Error::ConfigError("a relay transport is required".into()))?;

        let codec = QueryCodec::from_config(&config.codec)?;
        let background = CancellationToken::new();

        let transport: Arc<dyn RelayTransport> = if config.cover.enabled {
            let ticks = TickSource::from_config(&config.cover)?;
            info!(mean_secs = config.cover.mean_interval_secs, "Cover traffic enabled");
            Arc::new(CoverTrafficSender::spawn(
                transport,
                codec.clone(),
                ticks,
                background.child_token(),
            ))
        } else {
            transport
        };

        let pool = database.pool().clone();
        let credentials = CredentialManager::new(CredentialRepository::new(pool.clone()), authority.clone());
        let queries = QueryRepository::new(pool.clone());
        let redeemed = RedeemedTokenRepository::new(pool);
        let backoff = BackoffPolicy::from(&config.submission);

        let submission = SubmissionEngine::new(
            credentials.clone(),
            queries.clone(),
            codec.clone(),
            transport.clone(),
            backoff,
        )
        .with_auto_acquire(config.credentials.auto_acquire_batch);

        let aggregator = ResponseAggregator::new(queries.clone(), config.aggregation.late_responses);

        let answerer = self.index.map(|index| {
            LocalAnswerer::new(codec.clone(), authority, index, redeemed.clone())
        });

        Ok(Engine {
            config,
            database,
            credentials,
            queries,
            redeemed,
            codec,
            transport,
            submission,
            aggregator,
            answerer,
            background,
        })
    }
}

/// Client engine context
pub struct Engine {
    config: Config,
    database: Database,
    credentials: CredentialManager,
    queries: QueryRepository,
    redeemed: RedeemedTokenRepository,
    codec: QueryCodec,
    transport: Arc<dyn RelayTransport>,
    submission: SubmissionEngine,
    aggregator: ResponseAggregator,
    answerer: Option<LocalAnswerer>,
    /// Stops workers owned by the engine (cover traffic)
    background: CancellationToken,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn codec(&self) -> &QueryCodec {
        &self.codec
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    pub fn queries(&self) -> &QueryRepository {
        &self.queries
    }

    pub fn transport(&self) -> &Arc<dyn RelayTransport> {
        &self.transport
    }

    pub fn submission(&self) -> &SubmissionEngine {
        &self.submission
    }

    pub fn aggregator(&self) -> &ResponseAggregator {
        &self.aggregator
    }

    /// Whether inbound queries are answered
    pub fn is_answering(&self) -> bool {
        self.answerer.is_some()
    }

    // ========== Credentials ==========

    /// Acquire `count` credentials, retrying transient issuance failures
    pub async fn acquire(&self, count: u32) -> Result<Vec<Credential>> {
        self.credentials
            .acquire_with_retry(count, self.submission.backoff())
            .await
    }

    pub async fn inventory(&self) -> Result<CredentialInventory> {
        self.credentials.inventory().await
    }

    pub async fn list_credentials(&self, state: Option<CredentialState>) -> Result<Vec<Credential>> {
        self.credentials.list(state).await
    }

    /// Drop unused credentials older than the configured time-to-live
    pub async fn expire_tokens(&self) -> Result<u64> {
        let ttl = ChronoDuration::days(self.config.credentials.token_ttl_days);
        self.credentials.expire_unused(ttl).await
    }

    // ========== Queries ==========

    /// Build a query; `ttl` defaults to the configured deadline
    pub fn new_query(
        &self,
        payload: QueryPayload,
        expected_responses: Option<u16>,
        ttl: Option<Duration>,
    ) -> Query {
        let ttl = ttl.unwrap_or_else(|| self.config.submission.default_deadline());
        Query::new(payload, expected_responses, ttl)
    }

    pub async fn submit(&self, query: Query) -> Result<QueryRecord> {
        self.submission.submit(query).await
    }

    pub async fn resume(&self, id: Uuid) -> Result<QueryRecord> {
        self.submission.resume(id).await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<QueryRecord> {
        self.submission.cancel(id).await
    }

    pub async fn close(&self, id: Uuid) -> Result<QueryRecord> {
        self.aggregator.close(id).await
    }

    pub async fn on_response(&self, response: Response) -> Result<ResponseOutcome> {
        self.aggregator.on_response(response).await
    }

    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepResult> {
        self.aggregator.sweep_expired(now).await
    }

    /// Answer an inbound query frame; `None` when dropped
    pub async fn handle_inbound(&self, frame: &[u8]) -> Result<Option<Response>> {
        match &self.answerer {
            Some(answerer) => answerer.handle_inbound(frame).await,
            None => {
                debug!(reason = "no local index", "Dropping inbound query");
                Ok(None)
            }
        }
    }

    pub async fn get_query(&self, id: Uuid) -> Result<QueryRecord> {
        self.queries.get(id).await?.ok_or(Error::QueryNotFound(id))
    }

    pub async fn list_queries(&self, state: Option<QueryState>, limit: i64) -> Result<Vec<QuerySummary>> {
        self.queries.list(state, limit).await
    }

    pub async fn count_by_state(&self) -> Result<Vec<(QueryState, i64)>> {
        self.queries.count_by_state().await
    }

    /// Delete terminal records and redeemed-token digests past the retention window
    pub async fn purge_old_records(&self) -> Result<u64> {
        let cutoff = now_millis() - ChronoDuration::days(self.config.aggregation.retention_days);
        let records = self.queries.purge_terminal_before(cutoff).await?;
        let digests = self.redeemed.delete_before(cutoff).await?;

        info!(records, digests, "Purged old records");
        Ok(records)
    }

    // ========== Relay loop ==========

    /// Drain the relay inbox once and dispatch every frame
    pub async fn poll_once(&self) -> Result<PollReport> {
        let frames = self.transport.poll_inbound().await?;
        let mut report = PollReport {
            frames: frames.len(),
            ..PollReport::default()
        };

        for frame in frames {
            match self.codec.frame_kind(&frame) {
                Ok(FrameKind::Query) => match self.answer(&frame).await {
                    Ok(true) => report.answered += 1,
                    Ok(false) => report.dropped += 1,
                    Err(e) => {
                        Self::log_loop_error("answer", &e);
                        report.failed += 1;
                    }
                },
                Ok(FrameKind::Response) => match self.codec.decode_response(&frame) {
                    Ok(response) => match self.aggregator.on_response(response).await {
                        Ok(ResponseOutcome::Accepted { .. }) => report.accepted += 1,
                        Ok(ResponseOutcome::Completed { .. }) => {
                            report.accepted += 1;
                            report.completed += 1;
                        }
                        Ok(ResponseOutcome::Dropped) => report.dropped += 1,
                        Err(e) => {
                            Self::log_loop_error("aggregate", &e);
                            report.failed += 1;
                        }
                    },
                    Err(e) => {
                        debug!(code = e.code(), reason = %e, "Dropping response frame");
                        report.dropped += 1;
                    }
                },
                Err(e) => {
                    debug!(len = frame.len(), reason = %e, "Dropping unrecognized frame");
                    report.dropped += 1;
                }
            }
        }

        if report.frames > 0 {
            debug!(?report, "Relay inbox processed");
        }
        Ok(report)
    }

    /// Answer a query frame and send the reply back along its route
    async fn answer(&self, frame: &[u8]) -> Result<bool> {
        let Some(response) = self.handle_inbound(frame).await? else {
            return Ok(false);
        };

        let reply = match self.codec.encode_response(&response) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(query_id = %response.query_id, code = e.code(), reason = %e, "Reply not encoded");
                return Ok(false);
            }
        };
        let route = PeerSelector::Reply {
            route: response.query_id,
        };
        match self.transport.send(&route, &reply).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(query_id = %response.query_id, error = %e, "Reply not sent");
                Ok(false)
            }
        }
    }

    /// Pick up work interrupted by a restart
    ///
    /// Releases credentials stuck in `reserved` without a submitting record
    /// for longer than `credentials.orphan_grace_secs`, then resumes every `created` and `submitting` record. Awaiting records
    /// need nothing; the polling loop collects their responses.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let released = self
            .credentials
            .release_orphaned(self.config.credentials.orphan_grace())
            .await?;

        let mut report = RecoveryReport {
            released,
            ..RecoveryReport::default()
        };
        let pending = self
            .queries
            .ids_in_states(&[QueryState::Created, QueryState::Submitting])
            .await?;

        // Resumed concurrently so one query in backoff does not hold up the rest
        let outcomes = join_all(pending.into_iter().map(|id| async move {
            (id, self.submission.resume(id).await)
        }))
        .await;

        for (id, outcome) in outcomes {
            match outcome {
                Ok(record) => {
                    debug!(query_id = %id, state = %record.state, "Recovered query");
                    report.resumed.push(id);
                }
                Err(e) => {
                    warn!(query_id = %id, code = e.code(), error = %e, "Query not recovered");
                    report.failed.push(id);
                }
            }
        }

        info!(
            released = report.released,
            resumed = report.resumed.len(),
            failed = report.failed.len(),
            "Recovery finished"
        );
        Ok(report)
    }

    /// Poll the relay and sweep deadlines until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let poll_every = Duration::from_millis(self.config.aggregation.poll_interval_ms);
        let sweep_every = Duration::from_secs(self.config.aggregation.sweep_interval_secs);

        let mut poll = tokio::time::interval(poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_ms = poll_every.as_millis() as u64,
            sweep_secs = sweep_every.as_secs(),
            answering = self.is_answering(),
            "Engine running"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {
                    if let Err(e) = self.poll_once().await {
                        Self::log_loop_error("poll", &e);
                    }
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep_expired(now_millis()).await {
                        Self::log_loop_error("sweep", &e);
                    }
                }
            }
        }

        info!("Engine stopped");
        Ok(())
    }

    fn log_loop_error(task: &'static str, e: &Error) {
        if e.is_recoverable() {
            warn!(task, code = e.code(), error = %e, "Background task failed, will retry");
        } else {
            error!(task, code = e.code(), error = %e, "Background task failed");
        }
    }

    /// Stop engine-owned workers
    pub fn shutdown(&self) {
        self.background.cancel();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.background.cancel();
    }
}
