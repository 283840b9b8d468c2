//! In-process relay network
//!
//! A hub connects any number of endpoints. A fan-out frame is copied to every
//! other endpoint's inbox and remembers which endpoint opened its route; a
//! reply frame is delivered to that endpoint only. Replies on unknown routes
//! are lost, as they would be on a real relay.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::trace;
use uuid::Uuid;

use super::{PeerSelector, RelayTransport, TransportError};

#[derive(Debug, Default)]
struct HubState {
    inboxes: HashMap<Uuid, VecDeque<Vec<u8>>>,
    routes: HashMap<Uuid, Uuid>,
}

/// Shared routing table and inboxes
#[derive(Debug, Clone, Default)]
pub struct MemoryRelayHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryRelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint to the hub
    pub async fn endpoint(&self) -> MemoryRelay {
        let node = Uuid::new_v4();
        self.state.lock().await.inboxes.insert(node, VecDeque::new());

        MemoryRelay {
            node,
            hub: self.clone(),
            faults: Arc::new(Faults::default()),
        }
    }

    /// Frames waiting across all inboxes
    pub async fn pending(&self) -> usize {
        self.state.lock().await.inboxes.values().map(VecDeque::len).sum()
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_next: AtomicU32,
    reject: AtomicBool,
    blackhole: AtomicBool,
    sent: AtomicU64,
}

/// One node's connection to a [`MemoryRelayHub`]
#[derive(Debug, Clone)]
pub struct MemoryRelay {
    node: Uuid,
    hub: MemoryRelayHub,
    faults: Arc<Faults>,
}

impl MemoryRelay {
    pub fn node_id(&self) -> Uuid {
        self.node
    }

    /// Fail the next `n` sends with a transient error
    pub fn fail_next_sends(&self, n: u32) {
        self.faults.fail_next.store(n, Ordering::SeqCst);
    }

    /// Refuse every send permanently while set
    pub fn set_rejecting(&self, reject: bool) {
        self.faults.reject.store(reject, Ordering::SeqCst);
    }

    /// Acknowledge sends but deliver nothing while set
    pub fn set_blackhole(&self, blackhole: bool) {
        self.faults.blackhole.store(blackhole, Ordering::SeqCst);
    }

    /// Frames acknowledged by this endpoint so far
    pub fn sent_count(&self) -> u64 {
        self.faults.sent.load(Ordering::SeqCst)
    }

    /// Place a frame directly in this endpoint's inbox
    pub async fn deliver(&self, frame: Vec<u8>) {
        let mut state = self.hub.state.lock().await;
        state.inboxes.entry(self.node).or_default().push_back(frame);
    }
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    async fn send(&self, peers: &PeerSelector, frame: &[u8]) -> Result<(), TransportError> {
        if self.faults.reject.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("endpoint is rejecting".into()));
        }
        let pending_failure = self
            .faults
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending_failure.is_ok() {
            return Err(TransportError::Unavailable("injected failure".into()));
        }

        self.faults.sent.fetch_add(1, Ordering::SeqCst);
        if self.faults.blackhole.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut state = self.hub.state.lock().await;
        match *peers {
            PeerSelector::Fanout { route } => {
                state.routes.insert(route, self.node);
                let node = self.node;
                for (_, inbox) in state.inboxes.iter_mut().filter(|(id, _)| **id != node) {
                    inbox.push_back(frame.to_vec());
                }
            }
            PeerSelector::Reply { route } => match state.routes.get(&route).copied() {
                Some(origin) => {
                    state.inboxes.entry(origin).or_default().push_back(frame.to_vec());
                }
                None => trace!(route = %route, "Reply on unknown route lost"),
            },
        }
        Ok(())
    }

    async fn poll_inbound(&self) -> Result<Vec<Vec<u8>>, TransportError> {
        let mut state = self.hub.state.lock().await;
        Ok(state
            .inboxes
            .get_mut(&self.node)
            .map(|inbox| inbox.drain(..).collect())
            .unwrap_or_default())
    }
}
