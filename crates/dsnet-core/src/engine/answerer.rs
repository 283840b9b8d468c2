//! Local answerer
//!
//! Handles query envelopes addressed to this node. Anything that fails
//! decoding, proof verification, the local index, the reply size limit or
//! the replay guard is dropped without a reply, so a sender learns nothing
//! about token validity.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::codec::{QueryCodec, QueryEnvelope};
use crate::credentials::{CredentialAuthority, RedeemedTokenRepository};
use crate::error::{Error, Result};
use crate::index::LocalIndex;
use crate::query::Response;
use crate::storage::now_millis;

/// Answers inbound queries from the local index
#[derive(Clone)]
pub struct LocalAnswerer {
    codec: QueryCodec,
    authority: Arc<dyn CredentialAuthority>,
    index: Arc<dyn LocalIndex>,
    redeemed: RedeemedTokenRepository,
}

impl LocalAnswerer {
    pub fn new(
        codec: QueryCodec,
        authority: Arc<dyn CredentialAuthority>,
        index: Arc<dyn LocalIndex>,
        redeemed: RedeemedTokenRepository,
    ) -> Self {
        Self {
            codec,
            authority,
            index,
            redeemed,
        }
    }

    /// Answer one inbound query frame
    ///
    /// `Ok(None)` means the frame was dropped; the reason is logged. Only
    /// storage failures surface as errors.
    pub async fn handle_inbound(&self, frame: &[u8]) -> Result<Option<Response>> {
        let envelope = QueryEnvelope::from_bytes(frame.to_vec());

        let decoded = match self.codec.decode(&envelope, self.authority.as_ref()).await {
            Ok(decoded) => decoded,
            Err(e) if e.is_untrusted_input() => {
                debug!(code = e.code(), reason = %e, "Dropping inbound query");
                return Ok(None);
            }
            Err(e) => {
                warn!(error = %e, "Could not verify inbound query, dropping");
                return Ok(None);
            }
        };
        let query = decoded.query;

        let now = now_millis();
        if query.is_past_deadline(now) {
            debug!(query_id = %query.id, reason = "past deadline", "Dropping inbound query");
            return Ok(None);
        }

        let result = match self.index.execute(&query.payload).await {
            Ok(result) => result,
            Err(e) => {
                let e = Error::from(e);
                warn!(query_id = %query.id, code = e.code(), reason = %e, "Dropping inbound query");
                return Ok(None);
            }
        };

        // An unsendable reply must not burn the querier's token
        if let Err(e) = self.codec.check_response_fits(result.len()) {
            warn!(query_id = %query.id, code = e.code(), reason = %e, "Dropping inbound query");
            return Ok(None);
        }

        let digest = hex::encode(Sha256::digest(&decoded.proof.token));
        if !self.redeemed.record(&digest, query.id, now).await? {
            debug!(query_id = %query.id, reason = "replayed token", "Dropping inbound query");
            return Ok(None);
        }

        let proof = QueryCodec::sign_response(&decoded.commitment, query.id, &result);
        info!(query_id = %query.id, kind = %query.payload.kind, len = result.len(), "Answered inbound query");

        Ok(Some(Response::new(query.id, result, proof)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Commitment;
    use crate::credentials::{AuthorityError, CredentialProof};
    use crate::index::MemoryIndex;
    use crate::query::{PayloadKind, Query, QueryPayload};
    use crate::storage::Database;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Proof is the commitment itself; verification can be switched off
    #[derive(Default)]
    struct LocalAuthority {
        offline: AtomicBool,
    }

    #[async_trait]
    impl CredentialAuthority for LocalAuthority {
        async fn request_issuance(&self, count: u32) -> std::result::Result<Vec<Vec<u8>>, AuthorityError> {
            Ok((0..count).map(|i| vec![i as u8; 16]).collect())
        }

        fn prove(&self, token: &[u8], commitment: &Commitment) -> CredentialProof {
            CredentialProof {
                token: token.to_vec(),
                proof: commitment.as_bytes().to_vec(),
            }
        }

        async fn verify(
            &self,
            proof: &CredentialProof,
            commitment: &Commitment,
        ) -> std::result::Result<bool, AuthorityError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(AuthorityError::Unavailable("offline".into()));
            }
            Ok(proof.proof == commitment.as_bytes())
        }
    }

    struct Fixture {
        answerer: LocalAnswerer,
        authority: Arc<LocalAuthority>,
        index: Arc<MemoryIndex>,
        codec: QueryCodec,
        _db: Database,
    }

    async fn fixture() -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let authority = Arc::new(LocalAuthority::default());
        let index = Arc::new(MemoryIndex::new(["alice", "bob", "carol"]));
        let codec = QueryCodec::default();

        let answerer = LocalAnswerer::new(
            codec.clone(),
            authority.clone(),
            index.clone(),
            RedeemedTokenRepository::new(db.pool().clone()),
        );

        Fixture {
            answerer,
            authority,
            index,
            codec,
            _db: db,
        }
    }

    fn envelope(f: &Fixture, query: &Query, token: &[u8]) -> Vec<u8> {
        let proof = f.authority.prove(token, &f.codec.commitment(query));
        f.codec.encode(query, &proof).unwrap().into_bytes()
    }

    fn query(text: &str) -> Query {
        Query::new(QueryPayload::cleartext(text), Some(1), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_answers_with_signed_response() {
        let f = fixture().await;
        let q = query("alice dave carol");

        let response = f
            .answerer
            .handle_inbound(&envelope(&f, &q, b"token-1"))
            .await
            .unwrap()
            .expect("answered");

        assert_eq!(response.query_id, q.id);
        assert_eq!(response.payload, br#"["alice","carol"]"#.to_vec());
        assert!(QueryCodec::verify_response(&f.codec.commitment(&q), &response));
    }

    #[tokio::test]
    async fn test_invalid_proof_is_dropped() {
        let f = fixture().await;
        let q = query("alice");
        let forged = CredentialProof {
            token: b"token".to_vec(),
            proof: vec![0; 32],
        };
        let frame = f.codec.encode(&q, &forged).unwrap().into_bytes();

        assert!(f.answerer.handle_inbound(&frame).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let f = fixture().await;

        assert!(f.answerer.handle_inbound(b"garbage").await.unwrap().is_none());
        assert!(f.answerer.handle_inbound(&f.codec.cover_frame().unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replayed_token_is_dropped() {
        let f = fixture().await;

        let first = query("alice");
        assert!(f.answerer.handle_inbound(&envelope(&f, &first, b"reused")).await.unwrap().is_some());

        // Same token bound to a fresh query still verifies, but was already redeemed here
        let second = query("bob");
        assert!(f.answerer.handle_inbound(&envelope(&f, &second, b"reused")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_query_is_dropped() {
        let f = fixture().await;
        let mut q = query("alice");
        q.deadline = q.created_at;

        assert!(f.answerer.handle_inbound(&envelope(&f, &q, b"t")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_index_failures_are_dropped() {
        let f = fixture().await;

        let psi = Query::new(
            QueryPayload::new(PayloadKind::Psi, vec![1, 2, 3]),
            None,
            Duration::from_secs(60),
        );
        assert!(f.answerer.handle_inbound(&envelope(&f, &psi, b"t1")).await.unwrap().is_none());

        f.index.set_available(false);
        let q = query("alice");
        assert!(f.answerer.handle_inbound(&envelope(&f, &q, b"t2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversize_result_is_dropped_without_redeeming() {
        let f = fixture().await;
        let codec = QueryCodec::new(vec![256, 1024]).unwrap();
        let terms: Vec<String> = (0..170).map(|i| format!("{:03}", i)).collect();
        let answerer = LocalAnswerer::new(
            codec.clone(),
            f.authority.clone(),
            Arc::new(MemoryIndex::new(terms.iter().map(String::as_str))),
            RedeemedTokenRepository::new(f._db.pool().clone()),
        );
        let seal = |q: &Query, token: &[u8]| {
            let proof = f.authority.prove(token, &codec.commitment(q));
            codec.encode(q, &proof).unwrap().into_bytes()
        };

        // Every term matches; the quoted result outgrows the largest bucket
        let everything = query(&terms.join(" "));
        assert!(answerer.handle_inbound(&seal(&everything, b"kept")).await.unwrap().is_none());

        // The token was not spent on the dropped query
        let small = query("001");
        let response = answerer.handle_inbound(&seal(&small, b"kept")).await.unwrap().expect("answered");
        assert!(codec.encode_response(&response).is_ok());
    }

    #[tokio::test]
    async fn test_authority_outage_is_dropped() {
        let f = fixture().await;
        f.authority.offline.store(true, Ordering::SeqCst);

        let q = query("alice");
        assert!(f.answerer.handle_inbound(&envelope(&f, &q, b"t")).await.unwrap().is_none());
    }
}
