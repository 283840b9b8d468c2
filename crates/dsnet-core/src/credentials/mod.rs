//! Anonymous credentials
//!
//! Tokens are obtained from the issuing authority in batches, held in the
//! credential store, and consumed exactly once:
//!
//! ```text
//! unused --reserve_one--> reserved --mark_spent--> spent
//!    ^                       |
//!    +-------release---------+
//! ```

pub mod authority;
pub mod credential;
pub mod http;
pub mod manager;
pub mod repository;

pub use authority::{AuthorityError, CredentialAuthority, CredentialProof};
pub use credential::{Credential, CredentialInventory, CredentialState};
pub use http::HttpCredentialAuthority;
pub use manager::CredentialManager;
pub use repository::{CredentialRepository, RedeemedTokenRepository};
