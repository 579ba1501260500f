use std::io;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    RoundNotCollected,
    RoundReferenceMismatch,
    ExternalRoundMissing,
    ExternalRoundTooEarly,
    ExternalReferenceAhead,
    ExternalReferenceStale,
    ReverseLinkViolation,
    InvalidSnapshot,
    InvalidTransaction,
    SignerNotInMask,
    ResponseAlreadyRecorded,
    InvalidSignerIndex,
    InvalidResponseCount,
    MaskOverflow,
    CryptoError,
    StorageError,
    TransportError,
    SerializationError,
    EncodingError,
    ConfigError,
    ChannelClosed,
    InvariantViolation,
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("self cache snapshots not collected yet {node} {round}")]
    RoundNotCollected { node: crate::foundation::NodeId, round: u64 },

    #[error("self cache snapshots not match yet {node} {reference}")]
    RoundReferenceMismatch { node: crate::foundation::NodeId, reference: crate::foundation::RoundHash },

    #[error("external round {0} not collected yet")]
    ExternalRoundMissing(crate::foundation::RoundHash),

    #[error("external reference {reference} too early {number} {head}")]
    ExternalRoundTooEarly { reference: crate::foundation::RoundHash, number: u64, head: u64 },

    #[error("external reference later than snapshot time {external} {snapshot}")]
    ExternalReferenceAhead { external: u64, snapshot: u64 },

    #[error("external reference {reference} too early for best round start {best_start}")]
    ExternalReferenceStale { reference: crate::foundation::RoundHash, best_start: u64 },

    #[error("external reverse reference {node} {number} {link}")]
    ReverseLinkViolation { node: crate::foundation::NodeId, number: u64, link: u64 },

    #[error("invalid snapshot: {details}")]
    InvalidSnapshot { details: String },

    #[error("invalid transaction: {details}")]
    InvalidTransaction { details: String },

    #[error("signer index {index} not in mask")]
    SignerNotInMask { index: usize },

    #[error("response for signer index {index} already recorded")]
    ResponseAlreadyRecorded { index: usize },

    #[error("invalid signer index {index} (publics {max})")]
    InvalidSignerIndex { index: usize, max: usize },

    #[error("invalid cosi signature response count: {count}")]
    InvalidResponseCount { count: usize },

    #[error("signer index {index} exceeds mask capacity")]
    MaskOverflow { index: usize },

    #[error("crypto error during {operation}: {details}")]
    CryptoError { operation: String, details: String },

    #[error("storage error during {operation}: {details}")]
    StorageError { operation: String, details: String },

    #[error("transport error during {operation}: {details}")]
    TransportError { operation: String, details: String },

    #[error("{format} serialization error: {details}")]
    SerializationError { format: String, details: String },

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("action channel closed")]
    ChannelClosed,

    #[error("kernel invariant violated: {details}")]
    InvariantViolation { details: String },
}

pub type Result<T> = std::result::Result<T, KernelError>;

impl KernelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            KernelError::RoundNotCollected { .. } => ErrorCode::RoundNotCollected,
            KernelError::RoundReferenceMismatch { .. } => ErrorCode::RoundReferenceMismatch,
            KernelError::ExternalRoundMissing(_) => ErrorCode::ExternalRoundMissing,
            KernelError::ExternalRoundTooEarly { .. } => ErrorCode::ExternalRoundTooEarly,
            KernelError::ExternalReferenceAhead { .. } => ErrorCode::ExternalReferenceAhead,
            KernelError::ExternalReferenceStale { .. } => ErrorCode::ExternalReferenceStale,
            KernelError::ReverseLinkViolation { .. } => ErrorCode::ReverseLinkViolation,
            KernelError::InvalidSnapshot { .. } => ErrorCode::InvalidSnapshot,
            KernelError::InvalidTransaction { .. } => ErrorCode::InvalidTransaction,
            KernelError::SignerNotInMask { .. } => ErrorCode::SignerNotInMask,
            KernelError::ResponseAlreadyRecorded { .. } => ErrorCode::ResponseAlreadyRecorded,
            KernelError::InvalidSignerIndex { .. } => ErrorCode::InvalidSignerIndex,
            KernelError::InvalidResponseCount { .. } => ErrorCode::InvalidResponseCount,
            KernelError::MaskOverflow { .. } => ErrorCode::MaskOverflow,
            KernelError::CryptoError { .. } => ErrorCode::CryptoError,
            KernelError::StorageError { .. } => ErrorCode::StorageError,
            KernelError::TransportError { .. } => ErrorCode::TransportError,
            KernelError::SerializationError { .. } => ErrorCode::SerializationError,
            KernelError::EncodingError(_) => ErrorCode::EncodingError,
            KernelError::ConfigError(_) => ErrorCode::ConfigError,
            KernelError::ChannelClosed => ErrorCode::ChannelClosed,
            KernelError::InvariantViolation { .. } => ErrorCode::InvariantViolation,
        }
    }

    /// Fatal errors stop the action loop; the process must halt rather than
    /// keep mutating the graph after an invariant break.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KernelError::InvariantViolation { .. })
    }

    pub fn invariant(details: impl Into<String>) -> Self {
        KernelError::InvariantViolation { details: details.into() }
    }

    pub fn invalid_snapshot(details: impl Into<String>) -> Self {
        KernelError::InvalidSnapshot { details: details.into() }
    }

    pub fn crypto(operation: impl Into<String>, details: impl Into<String>) -> Self {
        KernelError::CryptoError { operation: operation.into(), details: details.into() }
    }

    pub fn storage(operation: impl Into<String>, details: impl Into<String>) -> Self {
        KernelError::StorageError { operation: operation.into(), details: details.into() }
    }

    pub fn transport(operation: impl Into<String>, details: impl Into<String>) -> Self {
        KernelError::TransportError { operation: operation.into(), details: details.into() }
    }
}

impl From<hex::FromHexError> for KernelError {
    fn from(err: hex::FromHexError) -> Self {
        KernelError::EncodingError(format!("hex decode error: {}", err))
    }
}

impl From<bincode::Error> for KernelError {
    fn from(err: bincode::Error) -> Self {
        KernelError::SerializationError { format: "bincode".to_string(), details: err.to_string() }
    }
}

impl From<toml::de::Error> for KernelError {
    fn from(err: toml::de::Error) -> Self {
        KernelError::ConfigError(format!("TOML parsing error: {}", err))
    }
}

impl From<io::Error> for KernelError {
    fn from(err: io::Error) -> Self {
        KernelError::StorageError { operation: "io".to_string(), details: err.to_string() }
    }
}
