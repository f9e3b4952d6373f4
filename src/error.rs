//! Error types for the signing core.
//!
//! Every variant belongs to one [`ErrorKind`]. Network errors are the only
//! ones the relay layer retries; crypto and codec errors are deterministic
//! and propagate immediately.

use thiserror::Error;

/// Coarse error taxonomy used for retry and presentation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Relay or mediator unreachable.
    Network,
    /// Quorum, participant, or state-machine problems.
    Session,
    /// Ceremony failure or signature verification failure.
    Crypto,
    /// Malformed or unsupported intent for a chain family.
    Codec,
    /// Wrong password on an encrypted share or backup.
    Decryption,
    /// Persistence and serialization plumbing.
    Internal,
}

/// Signing core error type.
#[derive(Error, Debug)]
pub enum KeysignError {
    // Network errors
    #[error("Relay unreachable: {0}")]
    RelayUnreachable(String),

    #[error("Relay rejected request with status {status}: {body}")]
    RelayRejected { status: u16, body: String },

    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    // Session errors
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid session state: expected {expected}, got {actual}")]
    InvalidSessionState { expected: String, actual: String },

    #[error("Quorum not reached: need {needed}, have {have}")]
    QuorumNotReached { needed: usize, have: usize },

    #[error("Participant dropped: {0}")]
    ParticipantDropped(String),

    #[error("Invalid participant: {0}")]
    InvalidParticipant(String),

    #[error("Invalid threshold: t={threshold} must be <= n={total}")]
    InvalidThreshold { threshold: usize, total: usize },

    #[error("Session cancelled")]
    Cancelled,

    // Crypto errors
    #[error("Ceremony failed: {0}")]
    CeremonyFailed(String),

    #[error("Signature does not verify for hash {hash}")]
    SignatureMismatch { hash: String },

    #[error("Conflicting signature already recorded for hash {hash}")]
    SignatureConflict { hash: String },

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    // Ledger errors
    #[error("Signature not found for hash {hash}")]
    SignatureNotFound { hash: String },

    // Codec errors
    #[error("Unsupported chain: {0}")]
    UnsupportedChain(String),

    #[error("Invalid intent: {0}")]
    InvalidIntent(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("No eligible gas coin: {0}")]
    NoEligibleGasCoin(String),

    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u128, available: u128 },

    #[error("Malformed CBOR: {0}")]
    MalformedCbor(String),

    // Decryption errors
    #[error("Decryption failed: {0}")]
    Decryption(String),

    // Vault store errors
    #[error("Vault not found: {0}")]
    VaultNotFound(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KeysignError {
    /// Taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RelayUnreachable(_)
            | Self::RelayRejected { .. }
            | Self::RetriesExhausted { .. } => ErrorKind::Network,

            Self::SessionNotFound(_)
            | Self::InvalidSessionState { .. }
            | Self::QuorumNotReached { .. }
            | Self::ParticipantDropped(_)
            | Self::InvalidParticipant(_)
            | Self::InvalidThreshold { .. }
            | Self::Cancelled => ErrorKind::Session,

            Self::CeremonyFailed(_)
            | Self::SignatureMismatch { .. }
            | Self::SignatureConflict { .. }
            | Self::SignatureNotFound { .. }
            | Self::InvalidPublicKey(_)
            | Self::InvalidSignature(_) => ErrorKind::Crypto,

            Self::UnsupportedChain(_)
            | Self::InvalidIntent(_)
            | Self::InvalidAddress(_)
            | Self::NoEligibleGasCoin(_)
            | Self::InsufficientFunds { .. }
            | Self::MalformedCbor(_) => ErrorKind::Codec,

            Self::Decryption(_) => ErrorKind::Decryption,

            Self::VaultNotFound(_)
            | Self::Storage(_)
            | Self::Serialization(_)
            | Self::Deserialization(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the relay layer should try the operation again.
    ///
    /// A 4xx rejection is final; 5xx and transport failures are retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RelayUnreachable(_) => true,
            Self::RelayRejected { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the caller may recover by asking the user again.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Decryption)
    }

    /// Stable error code for structured output.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::RelayUnreachable(_) => Some("RELAY_UNREACHABLE"),
            Self::RelayRejected { .. } => Some("RELAY_REJECTED"),
            Self::RetriesExhausted { .. } => Some("RETRIES_EXHAUSTED"),
            Self::SessionNotFound(_) => Some("SESSION_NOT_FOUND"),
            Self::InvalidSessionState { .. } => Some("INVALID_SESSION_STATE"),
            Self::QuorumNotReached { .. } => Some("QUORUM_NOT_REACHED"),
            Self::ParticipantDropped(_) => Some("PARTICIPANT_DROPPED"),
            Self::InvalidParticipant(_) => Some("INVALID_PARTICIPANT"),
            Self::InvalidThreshold { .. } => Some("INVALID_THRESHOLD"),
            Self::Cancelled => Some("CANCELLED"),
            Self::CeremonyFailed(_) => Some("CEREMONY_FAILED"),
            Self::SignatureMismatch { .. } => Some("SIGNATURE_MISMATCH"),
            Self::SignatureConflict { .. } => Some("SIGNATURE_CONFLICT"),
            Self::InvalidPublicKey(_) => Some("INVALID_PUBLIC_KEY"),
            Self::InvalidSignature(_) => Some("INVALID_SIGNATURE"),
            Self::SignatureNotFound { .. } => Some("SIGNATURE_NOT_FOUND"),
            Self::UnsupportedChain(_) => Some("UNSUPPORTED_CHAIN"),
            Self::InvalidIntent(_) => Some("INVALID_INTENT"),
            Self::InvalidAddress(_) => Some("INVALID_ADDRESS"),
            Self::NoEligibleGasCoin(_) => Some("NO_ELIGIBLE_GAS_COIN"),
            Self::InsufficientFunds { .. } => Some("INSUFFICIENT_FUNDS"),
            Self::MalformedCbor(_) => Some("MALFORMED_CBOR"),
            Self::Decryption(_) => Some("DECRYPTION_FAILED"),
            Self::VaultNotFound(_) => Some("VAULT_NOT_FOUND"),
            Self::Storage(_) => Some("STORAGE_ERROR"),
            Self::Serialization(_) => Some("SERIALIZATION_ERROR"),
            Self::Deserialization(_) => Some("DESERIALIZATION_ERROR"),
            Self::Internal(_) => None, // Don't expose internal error codes
        }
    }
}

// Conversion from common error types

impl From<std::io::Error> for KeysignError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for KeysignError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}

impl From<redb::Error> for KeysignError {
    fn from(err: redb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::DatabaseError> for KeysignError {
    fn from(err: redb::DatabaseError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::TableError> for KeysignError {
    fn from(err: redb::TableError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::TransactionError> for KeysignError {
    fn from(err: redb::TransactionError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::CommitError> for KeysignError {
    fn from(err: redb::CommitError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::StorageError> for KeysignError {
    fn from(err: redb::StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for KeysignError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::RelayUnreachable(format!("Request timed out: {err}"))
        } else if err.is_connect() {
            Self::RelayUnreachable(format!("Connection failed: {err}"))
        } else if err.is_decode() {
            Self::Deserialization(err.to_string())
        } else {
            Self::RelayUnreachable(err.to_string())
        }
    }
}

impl From<hex::FromHexError> for KeysignError {
    fn from(err: hex::FromHexError) -> Self {
        Self::Deserialization(format!("Invalid hex: {err}"))
    }
}

/// Result type alias for signing-core operations.
pub type KeysignResult<T> = Result<T, KeysignError>;
