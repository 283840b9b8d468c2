//! Error types for dsnet

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using dsnet's Error
pub type Result<T> = std::result::Result<T, Error>;

/// dsnet error types
///
/// Untrusted-input failures (`PayloadTooLarge`, `MalformedEnvelope`,
/// `ProofInvalid`, `ResponseProofInvalid`, `UnknownQuery`) never leave the
/// component that detects them on the inbound path; they exist so that
/// component can log a precise reason before dropping the message.
#[derive(Error, Debug)]
pub enum Error {
    // Credential errors (E001-E099)
    #[error("Credential issuance failed: {0}. Retry later.")]
    IssuanceError(String),

    #[error("Credential authority quota exhausted")]
    IssuanceExhausted,

    #[error("No unused credential available. Run `dsnet tokens acquire` to fetch more.")]
    NoCredentialAvailable,

    #[error("Credential {id} is '{state}', cannot {operation}")]
    InvalidCredentialState {
        id: Uuid,
        state: String,
        operation: &'static str,
    },

    #[error("Credential {0} not found")]
    CredentialNotFound(Uuid),

    // Codec errors (E100-E199)
    #[error("Payload of {size} bytes exceeds the largest envelope bucket ({max} bytes)")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Credential proof did not verify")]
    ProofInvalid,

    #[error("Response proof did not verify")]
    ResponseProofInvalid,

    // Query errors (E200-E299)
    #[error("No in-flight query {0}")]
    UnknownQuery(Uuid),

    #[error("Query {0} not found. Run `dsnet queries list` to see all queries.")]
    QueryNotFound(Uuid),

    #[error("Query {id} cannot move from '{from}' to '{to}'")]
    InvalidTransition {
        id: Uuid,
        from: String,
        to: String,
    },

    #[error("Query {id} gave up after {attempts} transmission attempts")]
    SubmissionExhausted { id: Uuid, attempts: u32 },

    // Network errors (E300-E399)
    #[error("Relay transport error: {0}")]
    Transport(String),

    #[error("Network error: {0}. Check the relay and authority URLs.")]
    NetworkError(#[from] reqwest::Error),

    // Index errors (E400-E499)
    #[error("Local index unavailable: {0}")]
    IndexUnavailable(String),

    // Database errors (E500-E599)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Input errors (E700-E799)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::IssuanceError(_) => "E001",
            Self::IssuanceExhausted => "E002",
            Self::NoCredentialAvailable => "E003",
            Self::InvalidCredentialState { .. } => "E004",
            Self::CredentialNotFound(_) => "E005",
            Self::PayloadTooLarge { .. } => "E100",
            Self::MalformedEnvelope(_) => "E101",
            Self::ProofInvalid => "E102",
            Self::ResponseProofInvalid => "E103",
            Self::UnknownQuery(_) => "E200",
            Self::QueryNotFound(_) => "E201",
            Self::InvalidTransition { .. } => "E202",
            Self::SubmissionExhausted { .. } => "E203",
            Self::Transport(_) => "E300",
            Self::NetworkError(_) => "E301",
            Self::IndexUnavailable(_) => "E400",
            Self::DatabaseError(_) => "E500",
            Self::Parse(_) => "E501",
            Self::ConfigError(_) => "E600",
            Self::InvalidInput(_) => "E700",
            Self::Io(_) => "E9999",
        }
    }

    /// Whether the caller may retry the operation that produced this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::IssuanceError(_)
                | Self::NoCredentialAvailable
                | Self::UnknownQuery(_)
                | Self::Transport(_)
                | Self::NetworkError(_)
                | Self::IndexUnavailable(_)
        )
    }

    /// Whether this error was raised by validating untrusted network input
    pub fn is_untrusted_input(&self) -> bool {
        matches!(
            self,
            Self::PayloadTooLarge { .. }
                | Self::MalformedEnvelope(_)
                | Self::ProofInvalid
                | Self::ResponseProofInvalid
                | Self::UnknownQuery(_)
        )
    }
}
