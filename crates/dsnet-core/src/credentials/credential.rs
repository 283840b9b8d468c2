//! Credential entity and consumption states

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Consumption state of an anonymous credential
///
/// A credential only ever moves forward (`Unused -> Reserved -> Spent`),
/// with the single exception of `release`, which hands a reservation back
/// before the token was ever transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialState {
    Unused,
    Reserved,
    Spent,
}

impl CredentialState {
    /// Create from string representation
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "unused" => Some(Self::Unused),
            "reserved" => Some(Self::Reserved),
            "spent" => Some(Self::Spent),
            _ => None,
        }
    }

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unused => "unused",
            Self::Reserved => "reserved",
            Self::Spent => "spent",
        }
    }
}

impl fmt::Display for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An unlinkable authorization token held in the credential store
#[derive(Clone)]
pub struct Credential {
    /// Local identifier, never sent on the wire
    pub id: Uuid,
    /// Unblinded token material as returned by the authority
    pub token: Zeroizing<Vec<u8>>,
    pub state: CredentialState,
    pub issued_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub spent_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Wrap freshly issued token material as an unused credential
    pub fn issued(token: Vec<u8>, issued_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            token: Zeroizing::new(token),
            state: CredentialState::Unused,
            issued_at,
            reserved_at: None,
            spent_at: None,
        }
    }

    /// Short hex digest of the token, safe for display
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.token.as_slice());
        hex::encode(&digest[..6])
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("token_len", &self.token.len())
            .field("state", &self.state)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Count of credentials per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CredentialInventory {
    pub unused: i64,
    pub reserved: i64,
    pub spent: i64,
}

impl CredentialInventory {
    pub fn total(&self) -> i64 {
        self.unused + self.reserved + self.spent
    }
}
