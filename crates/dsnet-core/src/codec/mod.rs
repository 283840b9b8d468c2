//! Query codec
//!
//! Serializes queries and responses into fixed-size, zero-padded frames so
//! that every envelope whose payload falls under the same bucket has the
//! same byte length on the wire. Layout details live in [`wire`].
//!
//! Decoding never panics on untrusted input: every structural violation
//! becomes [`Error::MalformedEnvelope`].

pub mod wire;

use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::config::CodecConfig;
use crate::credentials::{CredentialAuthority, CredentialProof};
use crate::error::{Error, Result};
use crate::query::{PayloadKind, Query, QueryPayload, Response};
use crate::storage::{from_millis, now_millis};

pub use wire::FrameKind;
use wire::{BodyReader, BodyWriter, HEADER_LEN};

type HmacSha256 = Hmac<Sha256>;

const COMMITMENT_DOMAIN: &[u8] = b"dsnet/query-commitment/v1";

/// Fixed-size part of a query body: id, timestamps, expected, kind,
/// reply secret and the three length prefixes
const QUERY_BODY_OVERHEAD: usize = 16 + 8 + 8 + 2 + 1 + 32 + 4 + 2 + 2;

/// Fixed-size part of a response body: query id, length prefix, proof
const RESPONSE_BODY_OVERHEAD: usize = 16 + 4 + 32;

/// Payload kind tag carried only by cover frames; never a valid query
pub const COVER_PAYLOAD_KIND: u8 = 0;

const COVER_TTL_MILLIS: i64 = 60_000;

/// SHA-256 digest binding a credential proof and every response to one query
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Commitment(pub [u8; 32]);

impl Commitment {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commitment({})", &self.to_hex()[..16])
    }
}

/// Encoded query frame plus its credential proof; immutable once built
#[derive(Clone, PartialEq, Eq)]
pub struct QueryEnvelope {
    bytes: Vec<u8>,
}

impl QueryEnvelope {
    /// Wrap bytes received from the network; validated on decode
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl fmt::Debug for QueryEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEnvelope")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A query recovered from an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedQuery {
    pub query: Query,
    pub proof: CredentialProof,
    pub commitment: Commitment,
}

/// Envelope encoder/decoder for one bucket ladder
#[derive(Debug, Clone)]
pub struct QueryCodec {
    buckets: Vec<usize>,
}

impl Default for QueryCodec {
    fn default() -> Self {
        Self {
            buckets: CodecConfig::default().buckets,
        }
    }
}

impl QueryCodec {
    /// Create a codec; buckets must be strictly ascending and hold a header
    pub fn new(buckets: Vec<usize>) -> Result<Self> {
        if buckets.is_empty() {
            return Err(Error::ConfigError("codec needs at least one bucket".into()));
        }
        if buckets[0] < HEADER_LEN + QUERY_BODY_OVERHEAD {
            return Err(Error::ConfigError(format!(
                "smallest bucket must be at least {} bytes",
                HEADER_LEN + QUERY_BODY_OVERHEAD
            )));
        }
        if buckets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::ConfigError(
                "codec buckets must be strictly ascending".into(),
            ));
        }
        if buckets.iter().any(|b| *b > u32::MAX as usize) {
            return Err(Error::ConfigError("codec bucket exceeds 4 GiB".into()));
        }
        Ok(Self { buckets })
    }

    pub fn from_config(config: &CodecConfig) -> Result<Self> {
        Self::new(config.buckets.clone())
    }

    pub fn buckets(&self) -> &[usize] {
        &self.buckets
    }

    /// Largest frame this codec produces or accepts
    pub fn max_frame(&self) -> usize {
        self.buckets.last().copied().unwrap_or(0)
    }

    /// Commitment over every query field except the credential
    pub fn commitment(&self, query: &Query) -> Commitment {
        let mut hasher = Sha256::new();
        hasher.update(COMMITMENT_DOMAIN);
        hasher.update(query.id.as_bytes());
        hasher.update(query.created_at.timestamp_millis().to_be_bytes());
        hasher.update(query.deadline.timestamp_millis().to_be_bytes());
        hasher.update(query.expected_responses.unwrap_or(0).to_be_bytes());
        hasher.update([query.payload.kind.as_u8()]);
        hasher.update(query.reply_secret);
        hasher.update((query.payload.len() as u64).to_be_bytes());
        hasher.update(&query.payload.bytes);
        Commitment(hasher.finalize().into())
    }

    /// Reject payloads that could not fit even with an empty credential
    pub fn check_fits(&self, query: &Query) -> Result<()> {
        let size = HEADER_LEN + QUERY_BODY_OVERHEAD + query.payload.len();
        if size > self.max_frame() {
            return Err(Error::PayloadTooLarge {
                size,
                max: self.max_frame(),
            });
        }
        Ok(())
    }

    /// Encode a query and its credential proof into a padded envelope
    pub fn encode(&self, query: &Query, proof: &CredentialProof) -> Result<QueryEnvelope> {
        self.check_fits(query)?;

        let mut body = BodyWriter::new();
        body.raw(query.id.as_bytes())
            .i64(query.created_at.timestamp_millis())
            .i64(query.deadline.timestamp_millis())
            .u16(query.expected_responses.unwrap_or(0))
            .u8(query.payload.kind.as_u8())
            .raw(&query.reply_secret);
        body.long_bytes(&query.payload.bytes)?;
        body.short_bytes(&proof.token)?;
        body.short_bytes(&proof.proof)?;

        let bytes = wire::seal(FrameKind::Query, &body.into_bytes(), &self.buckets)?;
        Ok(QueryEnvelope { bytes })
    }

    /// Structural decode only; the credential proof is not checked
    pub fn parse(&self, envelope: &QueryEnvelope) -> Result<DecodedQuery> {
        let (kind, body) = wire::open(envelope.as_bytes(), &self.buckets)?;
        if kind != FrameKind::Query {
            return Err(Error::MalformedEnvelope("expected a query frame".into()));
        }

        let mut reader = BodyReader::new(body);
        let id = Uuid::from_bytes(reader.array("query id")?);
        let created_at = from_millis(reader.i64("created_at")?)
            .map_err(|_| Error::MalformedEnvelope("created_at out of range".into()))?;
        let deadline = from_millis(reader.i64("deadline")?)
            .map_err(|_| Error::MalformedEnvelope("deadline out of range".into()))?;
        let expected = reader.u16("expected responses")?;
        let tag = reader.u8("payload kind")?;
        if tag == COVER_PAYLOAD_KIND {
            return Err(Error::MalformedEnvelope("cover frame".into()));
        }
        let kind = PayloadKind::from_u8(tag)
            .ok_or_else(|| Error::MalformedEnvelope(format!("unknown payload kind {}", tag)))?;
        let reply_secret = reader.array("reply secret")?;
        let payload = reader.long_bytes("payload")?.to_vec();
        let token = reader.short_bytes("credential token")?.to_vec();
        let proof = reader.short_bytes("credential proof")?.to_vec();
        reader.finish()?;

        if deadline < created_at {
            return Err(Error::MalformedEnvelope("deadline precedes creation".into()));
        }

        let query = Query {
            id,
            payload: QueryPayload::new(kind, payload),
            created_at,
            deadline,
            expected_responses: (expected > 0).then_some(expected),
            reply_secret,
        };
        let commitment = self.commitment(&query);

        Ok(DecodedQuery {
            query,
            proof: CredentialProof { token, proof },
            commitment,
        })
    }

    /// Decode and verify the attached credential proof
    pub async fn decode(
        &self,
        envelope: &QueryEnvelope,
        authority: &dyn CredentialAuthority,
    ) -> Result<DecodedQuery> {
        let decoded = self.parse(envelope)?;

        match authority.verify(&decoded.proof, &decoded.commitment).await {
            Ok(true) => Ok(decoded),
            Ok(false) => Err(Error::ProofInvalid),
            Err(e) => Err(Error::Transport(e.to_string())),
        }
    }

    /// Kind of a received frame, without validating the body
    pub fn frame_kind(&self, frame: &[u8]) -> Result<FrameKind> {
        wire::peek_kind(frame)
    }

    /// Reject result payloads no response bucket can hold
    pub fn check_response_fits(&self, result_len: usize) -> Result<()> {
        let size = HEADER_LEN + RESPONSE_BODY_OVERHEAD + result_len;
        if size > self.max_frame() {
            return Err(Error::PayloadTooLarge {
                size,
                max: self.max_frame(),
            });
        }
        Ok(())
    }

    pub fn encode_response(&self, response: &Response) -> Result<Vec<u8>> {
        self.check_response_fits(response.payload.len())?;

        let mut body = BodyWriter::new();
        body.raw(response.query_id.as_bytes());
        body.long_bytes(&response.payload)?;
        body.raw(&response.proof);

        wire::seal(FrameKind::Response, &body.into_bytes(), &self.buckets)
    }

    /// Structural decode of a response frame, stamped with the receipt time
    pub fn decode_response(&self, frame: &[u8]) -> Result<Response> {
        let (kind, body) = wire::open(frame, &self.buckets)?;
        if kind != FrameKind::Response {
            return Err(Error::MalformedEnvelope("expected a response frame".into()));
        }

        let mut reader = BodyReader::new(body);
        let query_id = Uuid::from_bytes(reader.array("query id")?);
        let payload = reader.long_bytes("result payload")?.to_vec();
        let proof = reader.array("response proof")?;
        reader.finish()?;

        Ok(Response {
            query_id,
            payload,
            proof,
            received_at: now_millis(),
        })
    }

    /// Response proof: `HMAC-SHA256(commitment, query_id || result)`
    pub fn sign_response(commitment: &Commitment, query_id: Uuid, result: &[u8]) -> [u8; 32] {
        let mut mac = response_mac(commitment);
        mac.update(query_id.as_bytes());
        mac.update(result);
        mac.finalize().into_bytes().into()
    }

    /// Constant-time check of a response proof against its query's commitment
    pub fn verify_response(commitment: &Commitment, response: &Response) -> bool {
        let mut mac = response_mac(commitment);
        mac.update(response.query_id.as_bytes());
        mac.update(&response.payload);
        mac.verify_slice(&response.proof).is_ok()
    }

    /// Dummy query frame for the smallest bucket
    ///
    /// Real header, current timestamps, random filler of random length and
    /// zero padding, exactly like a small query. The payload kind is
    /// [`COVER_PAYLOAD_KIND`], which `parse` rejects.
    pub fn cover_frame(&self) -> Result<Vec<u8>> {
        let mut rng = rand::thread_rng();
        let now = now_millis().timestamp_millis();
        let mut reply_secret = [0u8; 32];
        rng.fill_bytes(&mut reply_secret);

        let mut body = BodyWriter::new();
        body.raw(Uuid::new_v4().as_bytes())
            .i64(now)
            .i64(now.saturating_add(COVER_TTL_MILLIS))
            .u16(0)
            .u8(COVER_PAYLOAD_KIND)
            .raw(&reply_secret);

        let room = self.buckets[0] - HEADER_LEN - body.len();
        let mut filler = vec![0u8; rng.gen_range(0..=room)];
        rng.fill_bytes(&mut filler);
        body.raw(&filler);

        wire::seal(FrameKind::Query, &body.into_bytes(), &self.buckets[..1])
    }
}

fn response_mac(commitment: &Commitment) -> HmacSha256 {
    <HmacSha256 as Mac>::new_from_slice(commitment.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"))
}
