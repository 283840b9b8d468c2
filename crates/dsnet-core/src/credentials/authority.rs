//! Credential authority capability
//!
//! The blind-signature scheme itself lives behind this trait. The engine
//! only needs four things from it: obtain unblinded tokens, turn a token
//! into a presentation bound to an envelope commitment, and verify such a
//! presentation (including the authority's double-spend check).

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::codec::Commitment;
use crate::error::Error;

/// Failure modes of the credential authority
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthorityError {
    #[error("credential authority unavailable: {0}")]
    Unavailable(String),

    #[error("credential authority quota exceeded")]
    QuotaExceeded,
}

impl From<AuthorityError> for Error {
    fn from(err: AuthorityError) -> Self {
        match err {
            AuthorityError::Unavailable(msg) => Error::IssuanceError(msg),
            AuthorityError::QuotaExceeded => Error::IssuanceExhausted,
        }
    }
}

/// A token presentation attached to a query envelope
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialProof {
    /// Unblinded token being redeemed
    pub token: Vec<u8>,
    /// Presentation binding the token to one envelope commitment
    pub proof: Vec<u8>,
}

impl fmt::Debug for CredentialProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialProof")
            .field("token_len", &self.token.len())
            .field("proof_len", &self.proof.len())
            .finish()
    }
}

/// Issuing and verifying side of the anonymous-credential scheme
#[async_trait]
pub trait CredentialAuthority: Send + Sync {
    /// Run blind issuance for `count` tokens and return them unblinded
    async fn request_issuance(&self, count: u32) -> Result<Vec<Vec<u8>>, AuthorityError>;

    /// Produce a presentation of `token` bound to `commitment`
    fn prove(&self, token: &[u8], commitment: &Commitment) -> CredentialProof;

    /// Check a presentation against `commitment`
    ///
    /// Returns `Ok(false)` for forged, mismatched or already-redeemed tokens.
    async fn verify(
        &self,
        proof: &CredentialProof,
        commitment: &Commitment,
    ) -> Result<bool, AuthorityError>;
}
