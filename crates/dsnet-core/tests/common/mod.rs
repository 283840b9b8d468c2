//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dsnet_core::codec::Commitment;
use dsnet_core::config::{Config, LateResponsePolicy};
use dsnet_core::credentials::{AuthorityError, CredentialAuthority, CredentialProof};
use dsnet_core::engine::Engine;
use dsnet_core::index::MemoryIndex;
use dsnet_core::query::{Query, QueryPayload};
use dsnet_core::storage::Database;
use dsnet_core::transport::{MemoryRelay, MemoryRelayHub};

/// Deterministic credential authority
///
/// Tokens are sequential, a presentation is `SHA-256(token || commitment)`,
/// and a token counts as double-spent once it has been presented for two
/// different commitments. Every responder of one query sees the same
/// commitment, so fan-out is not mistaken for reuse.
#[derive(Default)]
pub struct FakeAuthority {
    next: AtomicU64,
    redeemed: Mutex<HashMap<Vec<u8>, Commitment>>,
}

impl FakeAuthority {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn presentation(token: &[u8], commitment: &Commitment) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(token);
        hasher.update(commitment.as_bytes());
        hasher.finalize().to_vec()
    }

    /// Tokens seen by `verify` so far
    pub fn redeemed_count(&self) -> usize {
        self.redeemed.lock().unwrap().len()
    }
}

#[async_trait]
impl CredentialAuthority for FakeAuthority {
    async fn request_issuance(&self, count: u32) -> Result<Vec<Vec<u8>>, AuthorityError> {
        Ok((0..count)
            .map(|_| {
                let n = self.next.fetch_add(1, Ordering::SeqCst);
                format!("token-{:08}", n).into_bytes()
            })
            .collect())
    }

    fn prove(&self, token: &[u8], commitment: &Commitment) -> CredentialProof {
        CredentialProof {
            token: token.to_vec(),
            proof: Self::presentation(token, commitment),
        }
    }

    async fn verify(
        &self,
        proof: &CredentialProof,
        commitment: &Commitment,
    ) -> Result<bool, AuthorityError> {
        if proof.proof != Self::presentation(&proof.token, commitment) {
            return Ok(false);
        }

        let mut redeemed = self.redeemed.lock().unwrap();
        match redeemed.get(&proof.token) {
            Some(seen) => Ok(seen == commitment),
            None => {
                redeemed.insert(proof.token.clone(), *commitment);
                Ok(true)
            }
        }
    }
}

/// One engine attached to the shared relay hub
pub struct Node {
    pub engine: Engine,
    pub relay: MemoryRelay,
}

/// Config with fast retries for tests
pub fn test_config(policy: LateResponsePolicy) -> Config {
    let mut config = Config::default();
    config.submission.backoff_base_ms = 1;
    config.submission.backoff_max_ms = 5;
    config.aggregation.late_responses = policy;
    config
}

pub async fn node(
    hub: &MemoryRelayHub,
    authority: &Arc<FakeAuthority>,
    config: Config,
    entities: Option<&[&str]>,
) -> Node {
    node_on(hub, authority, config, entities, Database::in_memory().await.unwrap()).await
}

pub async fn node_on(
    hub: &MemoryRelayHub,
    authority: &Arc<FakeAuthority>,
    config: Config,
    entities: Option<&[&str]>,
    database: Database,
) -> Node {
    let relay = hub.endpoint().await;
    let mut builder = Engine::builder()
        .config(config)
        .database(database)
        .authority(authority.clone())
        .transport(Arc::new(relay.clone()));
    if let Some(entities) = entities {
        builder = builder.index(Arc::new(MemoryIndex::new(entities.iter().copied())));
    }

    Node {
        engine: builder.build().unwrap(),
        relay,
    }
}

/// Entity sets of successive responders
///
/// Identical answers to one query carry identical proofs and are stored
/// once, so responders that should count separately need distinct results
/// for `"alice bob carol"`.
pub const RESPONDER_ENTITIES: [&[&str]; 4] = [
    &["alice", "bob", "carol"],
    &["alice", "bob"],
    &["bob", "carol"],
    &["alice", "carol"],
];

/// A querier plus `responders` answering nodes on one hub
pub struct Network {
    pub hub: MemoryRelayHub,
    pub authority: Arc<FakeAuthority>,
    pub querier: Node,
    pub responders: Vec<Node>,
}

pub async fn network(responders: usize, policy: LateResponsePolicy) -> Network {
    let hub = MemoryRelayHub::new();
    let authority = FakeAuthority::new();
    let querier = node(&hub, &authority, test_config(policy), None).await;

    let mut nodes = Vec::with_capacity(responders);
    for i in 0..responders {
        let entities = RESPONDER_ENTITIES[i % RESPONDER_ENTITIES.len()];
        nodes.push(node(&hub, &authority, test_config(policy), Some(entities)).await);
    }

    Network {
        hub,
        authority,
        querier,
        responders: nodes,
    }
}

impl Network {
    /// Let every responder answer whatever reached it
    pub async fn responders_answer(&self) -> usize {
        let mut answered = 0;
        for responder in &self.responders {
            answered += responder.engine.poll_once().await.unwrap().answered;
        }
        answered
    }
}

pub fn query(text: &str, expected: Option<u16>) -> Query {
    Query::new(QueryPayload::cleartext(text), expected, Duration::from_secs(60))
}
