//! # Protocol Adapter Trait
//!
//! This module defines the narrow contract between the engine and the protocol
//! plugins. Every adapter translates one product of one protocol on one chain
//! (e.g. "aave-v3 / a-token / ethereum") into the common token-tree shape; the engine
//! never sees a protocol ABI.
//!
//! ## Overview
//!
//! - `get_positions` returns the user's protocol tokens, optionally with their
//!   underlying tokens already attached as children.
//! - `get_withdrawals`, `get_deposits`, `get_repays` and `get_borrows` return the
//!   user's movements in a closed block range.
//! - `unwrap` returns the exchange rate of one whole protocol token into its
//!   underlying tokens. A *price adapter* uses the same method to return the USD
//!   price of a token as a single [`TokenType::Fiat`] rate.
//! - `get_total_value_locked` returns pool totals.
//!
//! Operations an adapter does not support return [`EngineError::AdapterUnsupported`]
//! (the default implementation for the movement and TVL methods), which the
//! orchestrator filters out of responses unless asked to keep them.
//!
//! Every method is block-scoped and may be called concurrently for different
//! blocks, so adapters must not keep shared mutable state between calls.
//!
//! ## Example
//!
//! ```rust,ignore
//! struct StakedEth {
//!     metadata: AdapterMetadata,
//!     endpoint: Arc<ChainEndpoint>,
//! }
//!
//! #[async_trait]
//! impl ProtocolAdapter for StakedEth {
//!     fn metadata(&self) -> &AdapterMetadata {
//!         &self.metadata
//!     }
//!
//!     async fn get_protocol_tokens(&self) -> Result<Vec<ProtocolToken>> {
//!         // Static list or a registry contract read
//!     }
//!
//!     async fn get_positions(&self, user: Address, block: Option<u64>, filter: Option<&[Address]>) -> Result<Vec<TokenNode>> {
//!         // balanceOf through self.endpoint.call(...)
//!     }
//!
//!     async fn unwrap(&self, protocol_token: Address, block: Option<u64>) -> Result<UnwrapExchangeRate> {
//!         // convertToAssets(10^decimals)
//!     }
//! }
//! ```

use crate::chains::Chain;
use crate::error::{EngineError, Result};
use crate::types::{Movement, MovementKind, PositionType, TokenMetadata, TokenNode, UnwrapExchangeRate};
use async_trait::async_trait;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of an adapter: which product of which protocol on which chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdapterMetadata {
    pub protocol_id: String,
    pub product_id: String,
    pub chain: Chain,
    pub position_type: PositionType,
}

impl AdapterMetadata {
    pub fn new(
        protocol_id: impl Into<String>,
        product_id: impl Into<String>,
        chain: Chain,
        position_type: PositionType,
    ) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            product_id: product_id.into(),
            chain,
            position_type,
        }
    }

    pub fn key(&self) -> AdapterKey {
        AdapterKey {
            chain: self.chain,
            protocol_id: self.protocol_id.clone(),
            product_id: self.product_id.clone(),
        }
    }

    pub fn unsupported(&self, operation: &str) -> EngineError {
        EngineError::unsupported(&self.protocol_id, &self.product_id, operation)
    }
}

/// Lookup key for adapters, also the memo identity used during unwrapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AdapterKey {
    pub chain: Chain,
    pub protocol_id: String,
    pub product_id: String,
}

impl fmt::Display for AdapterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.chain, self.protocol_id, self.product_id)
    }
}

/// A protocol token and its direct underlying tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolToken {
    #[serde(flatten)]
    pub token: TokenMetadata,
    pub underlying_tokens: Vec<TokenMetadata>,
}

#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn metadata(&self) -> &AdapterMetadata;

    /// Every protocol token this adapter can report on.
    async fn get_protocol_tokens(&self) -> Result<Vec<ProtocolToken>>;

    /// The user's protocol-token balances at `block` (latest when `None`).
    async fn get_positions(
        &self,
        user: Address,
        block: Option<u64>,
        protocol_token_filter: Option<&[Address]>,
    ) -> Result<Vec<TokenNode>>;

    async fn get_withdrawals(
        &self,
        _user: Address,
        _from_block: u64,
        _to_block: u64,
    ) -> Result<Vec<Movement>> {
        Err(self.metadata().unsupported("get_withdrawals"))
    }

    async fn get_deposits(
        &self,
        _user: Address,
        _from_block: u64,
        _to_block: u64,
    ) -> Result<Vec<Movement>> {
        Err(self.metadata().unsupported("get_deposits"))
    }

    async fn get_repays(
        &self,
        _user: Address,
        _from_block: u64,
        _to_block: u64,
    ) -> Result<Vec<Movement>> {
        Err(self.metadata().unsupported("get_repays"))
    }

    async fn get_borrows(
        &self,
        _user: Address,
        _from_block: u64,
        _to_block: u64,
    ) -> Result<Vec<Movement>> {
        Err(self.metadata().unsupported("get_borrows"))
    }

    /// Exchange rate of one whole `protocol_token` into its underlying tokens.
    async fn unwrap(&self, protocol_token: Address, block: Option<u64>) -> Result<UnwrapExchangeRate>;

    /// Pool totals, one node per protocol token with `total_supply_raw` set.
    async fn get_total_value_locked(
        &self,
        _protocol_token_filter: Option<&[Address]>,
        _block: Option<u64>,
    ) -> Result<Vec<TokenNode>> {
        Err(self.metadata().unsupported("get_total_value_locked"))
    }
}

/// Dispatches to the movement method matching `kind`.
pub async fn get_movements(
    adapter: &dyn ProtocolAdapter,
    kind: MovementKind,
    user: Address,
    from_block: u64,
    to_block: u64,
) -> Result<Vec<Movement>> {
    match kind {
        MovementKind::Deposit => adapter.get_deposits(user, from_block, to_block).await,
        MovementKind::Withdrawal => adapter.get_withdrawals(user, from_block, to_block).await,
        MovementKind::Borrow => adapter.get_borrows(user, from_block, to_block).await,
        MovementKind::Repay => adapter.get_repays(user, from_block, to_block).await,
    }
}
