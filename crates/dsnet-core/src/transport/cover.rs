//! Cover traffic
//!
//! Outbound frames are queued and released one per tick, with tick gaps drawn
//! from an exponential distribution. A tick that finds the queue empty sends
//! a dummy query frame of the smallest bucket instead, so an observer of this
//! node's link sees the same rate whether or not it is querying.
//!
//! `send` resolves only once the queued frame has actually been handed to
//! the inner relay, so an `Ok` still means "transmitted".

use async_trait::async_trait;
use rand_distr::{Distribution, Exp};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{PeerSelector, RelayTransport, TransportError};
use crate::codec::QueryCodec;
use crate::config::CoverConfig;
use crate::error::{Error, Result};

/// Gap between release ticks
#[derive(Debug, Clone, Copy)]
pub enum TickSource {
    /// Poisson process with the given rate
    Exponential(Exp<f64>),
    /// Constant gap, for deterministic tests
    Fixed(Duration),
}

impl TickSource {
    /// Exponential gaps averaging `mean`
    pub fn exponential(mean: Duration) -> Result<Self> {
        let secs = mean.as_secs_f64();
        if secs <= 0.0 {
            return Err(Error::ConfigError("cover interval must be positive".into()));
        }
        let exp = Exp::new(1.0 / secs)
            .map_err(|e| Error::ConfigError(format!("invalid cover interval {:?}: {}", mean, e)))?;
        Ok(Self::Exponential(exp))
    }

    pub fn from_config(config: &CoverConfig) -> Result<Self> {
        if !config.mean_interval_secs.is_finite() || config.mean_interval_secs <= 0.0 {
            return Err(Error::ConfigError("cover.mean_interval_secs must be positive".into()));
        }
        Self::exponential(Duration::from_secs_f64(config.mean_interval_secs))
    }

    pub fn next_gap(&self) -> Duration {
        match self {
            Self::Exponential(exp) => {
                let secs = exp.sample(&mut rand::thread_rng());
                Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
            }
            Self::Fixed(gap) => *gap,
        }
    }
}

struct Outbound {
    peers: PeerSelector,
    frame: Vec<u8>,
    ack: oneshot::Sender<std::result::Result<(), TransportError>>,
}

/// Relay wrapper emitting sends on randomized ticks
pub struct CoverTrafficSender {
    inner: Arc<dyn RelayTransport>,
    queue: mpsc::UnboundedSender<Outbound>,
    worker: JoinHandle<()>,
}

impl CoverTrafficSender {
    /// Start the release worker; it stops when `shutdown` fires
    pub fn spawn(
        inner: Arc<dyn RelayTransport>,
        codec: QueryCodec,
        ticks: TickSource,
        shutdown: CancellationToken,
    ) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(release_loop(inner.clone(), codec, ticks, rx, shutdown));

        Self {
            inner,
            queue,
            worker,
        }
    }

    /// Whether the release worker is still running
    pub fn is_running(&self) -> bool {
        !self.worker.is_finished()
    }
}

async fn release_loop(
    inner: Arc<dyn RelayTransport>,
    codec: QueryCodec,
    ticks: TickSource,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    shutdown: CancellationToken,
) {
    debug!("Cover traffic worker started");

    loop {
        let gap = ticks.next_gap();
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(gap) => {}
        }

        match rx.try_recv() {
            Ok(outbound) => {
                let result = inner.send(&outbound.peers, &outbound.frame).await;
                // The caller may have given up waiting; the frame is out either way
                let _ = outbound.ack.send(result);
            }
            Err(mpsc::error::TryRecvError::Empty) => {
                let route = PeerSelector::Fanout {
                    route: Uuid::new_v4(),
                };
                let frame = match codec.cover_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "Could not build cover frame");
                        continue;
                    }
                };
                match inner.send(&route, &frame).await {
                    Ok(()) => trace!("Sent cover frame"),
                    Err(e) => trace!(error = %e, "Cover frame not sent"),
                }
            }
            Err(mpsc::error::TryRecvError::Disconnected) => break,
        }
    }

    rx.close();
    let mut abandoned = 0;
    while let Ok(outbound) = rx.try_recv() {
        let _ = outbound.ack.send(Err(TransportError::Closed));
        abandoned += 1;
    }
    if abandoned > 0 {
        warn!(abandoned, "Cover traffic worker stopped with frames still queued");
    }
    debug!("Cover traffic worker stopped");
}

#[async_trait]
impl RelayTransport for CoverTrafficSender {
    async fn send(&self, peers: &PeerSelector, frame: &[u8]) -> std::result::Result<(), TransportError> {
        let (ack, done) = oneshot::channel();
        self.queue
            .send(Outbound {
                peers: *peers,
                frame: frame.to_vec(),
                ack,
            })
            .map_err(|_| TransportError::Closed)?;

        done.await.map_err(|_| TransportError::Closed)?
    }

    async fn poll_inbound(&self) -> std::result::Result<Vec<Vec<u8>>, TransportError> {
        self.inner.poll_inbound().await
    }
}
