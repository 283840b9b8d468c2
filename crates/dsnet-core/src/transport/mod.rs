//! Relay transport capability
//!
//! The relay network forwards opaque frames between peers. Delivery is not
//! guaranteed: frames may be lost, duplicated or reordered, and the engine
//! tolerates all three.
//!
//! - `memory`: in-process relay hub, used by tests and local simulations
//! - `http`: relay reached over HTTP
//! - `cover`: wrapper that releases sends on randomized ticks and fills
//!   idle ticks with dummy frames

pub mod cover;
pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::Error;

pub use cover::{CoverTrafficSender, TickSource};
pub use http::HttpRelay;
pub use memory::{MemoryRelay, MemoryRelayHub};

/// Where the relay network should deliver a frame
///
/// Topology is the relay's concern; the engine only distinguishes a fresh
/// query fan-out from a reply travelling back along a query's route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerSelector {
    /// Forward to peers that may answer
    Fanout { route: Uuid },
    /// Return to whoever originated `route`
    Reply { route: Uuid },
}

impl PeerSelector {
    pub fn route(&self) -> Uuid {
        match self {
            Self::Fanout { route } | Self::Reply { route } => *route,
        }
    }
}

/// Transport failure modes
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Transient: worth retrying
    #[error("relay unavailable: {0}")]
    Unavailable(String),

    /// The relay refused the frame; retrying will not help
    #[error("relay rejected frame: {0}")]
    Rejected(String),

    /// The sender was shut down before the frame went out
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Transport(err.to_string())
    }
}

/// Send and receive frames through the relay network
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Hand a frame to the relay; `Ok` is the network's acknowledgment
    async fn send(&self, peers: &PeerSelector, frame: &[u8]) -> Result<(), TransportError>;

    /// Drain frames addressed to this node since the last poll
    async fn poll_inbound(&self) -> Result<Vec<Vec<u8>>, TransportError>;
}
