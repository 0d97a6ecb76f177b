//! # Error Taxonomy
//!
//! Every failure the engine can surface is an [`EngineError`]. Failures are recovered
//! at the smallest scope possible: a reverted call only rejects its own continuation,
//! a failed batch only rejects the calls of its group, and a failed unit of work only
//! produces a `Failure` entry in the orchestration result.

use crate::chains::Chain;
use crate::fixed_point::DecimalError;
use ethers::types::Address;
use serde::{Deserialize, Serialize};

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// The aggregate call itself could not be delivered; every call in the group fails.
    #[error("batch transport error on {chain}: {message}")]
    BatchTransport { chain: Chain, message: String },

    /// The aggregate response length disagrees with the request length.
    #[error("batch length mismatch on {chain}: sent {expected} calls, received {actual} results")]
    BatchLengthMismatch {
        chain: Chain,
        expected: usize,
        actual: usize,
    },

    /// An individual call reported failure.
    #[error("call to {target:?} reverted: {reason}")]
    CallRevert { target: Address, reason: String },

    /// The adapter does not implement the requested query shape.
    #[error("{protocol}/{product} does not support {operation}")]
    AdapterUnsupported {
        protocol: String,
        product: String,
        operation: String,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("rpc call on {chain} timed out after {after_ms}ms")]
    Timeout { chain: Chain, after_ms: u64 },

    #[error("transport error on {chain}: {message}")]
    Transport { chain: Chain, message: String },

    #[error("invalid call: {0}")]
    InvalidCall(String),

    #[error("token tree for {token:?} exceeds maximum depth of {max_depth}")]
    DepthExceeded { max_depth: usize, token: Address },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Decimal(#[from] DecimalError),

    #[error("adapter error: {message}")]
    Adapter { message: String },
}

/// Serializable classification of an [`EngineError`], carried by failed task results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BatchTransport,
    BatchLengthMismatch,
    CallRevert,
    AdapterUnsupported,
    Configuration,
    Timeout,
    Transport,
    InvalidInput,
    DepthExceeded,
    Arithmetic,
    Adapter,
    Panic,
}

impl EngineError {
    pub fn adapter(message: impl Into<String>) -> Self {
        Self::Adapter {
            message: message.into(),
        }
    }

    pub fn unsupported(
        protocol: impl Into<String>,
        product: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self::AdapterUnsupported {
            protocol: protocol.into(),
            product: product.into(),
            operation: operation.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::BatchTransport { .. } => FailureKind::BatchTransport,
            Self::BatchLengthMismatch { .. } => FailureKind::BatchLengthMismatch,
            Self::CallRevert { .. } => FailureKind::CallRevert,
            Self::AdapterUnsupported { .. } => FailureKind::AdapterUnsupported,
            Self::Configuration(_) => FailureKind::Configuration,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Transport { .. } => FailureKind::Transport,
            Self::InvalidCall(_) | Self::InvalidInput(_) => FailureKind::InvalidInput,
            Self::DepthExceeded { .. } => FailureKind::DepthExceeded,
            Self::Decimal(_) => FailureKind::Arithmetic,
            Self::Adapter { .. } => FailureKind::Adapter,
        }
    }

    /// Whether `ChainEndpoint` may retry the whole call after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Transport { .. } | Self::BatchTransport { .. }
        )
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::AdapterUnsupported { .. })
    }
}
