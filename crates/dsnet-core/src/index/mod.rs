//! Local index capability
//!
//! The answering side hands decoded payloads to whatever search backend the
//! node runs. Result bytes are opaque to the engine.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::Error;
use crate::query::{PayloadKind, QueryPayload};

pub use memory::MemoryIndex;

/// Local index failure modes
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("index unavailable: {0}")]
    Unavailable(String),

    #[error("index cannot answer {0} queries")]
    Unsupported(PayloadKind),
}

impl From<IndexError> for Error {
    fn from(err: IndexError) -> Self {
        Error::IndexUnavailable(err.to_string())
    }
}

/// Search backend queried on behalf of remote peers
#[async_trait]
pub trait LocalIndex: Send + Sync {
    /// Run a payload against local content and return the result payload
    async fn execute(&self, payload: &QueryPayload) -> Result<Vec<u8>, IndexError>;
}
