//! Common types shared by the batching, resolution and attribution layers.

pub mod conversions;
pub mod token_tree;

pub use token_tree::{
    BalanceField, Movement, MovementKind, PositionType, Snapshot, SnapshotTag, TokenMetadata,
    TokenNode, TokenType, UnderlyingRate, UnwrapExchangeRate,
};

use ethers::types::{BlockId, BlockNumber};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Height a read is pinned to. Pending calls are grouped per selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockSelector {
    Latest,
    Number(u64),
}

impl BlockSelector {
    pub fn block_id(&self) -> BlockId {
        match self {
            BlockSelector::Latest => BlockId::Number(BlockNumber::Latest),
            BlockSelector::Number(n) => BlockId::Number(BlockNumber::Number((*n).into())),
        }
    }
}

impl From<Option<u64>> for BlockSelector {
    fn from(block: Option<u64>) -> Self {
        block.map_or(BlockSelector::Latest, BlockSelector::Number)
    }
}

impl fmt::Display for BlockSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockSelector::Latest => f.write_str("latest"),
            BlockSelector::Number(n) => write!(f, "{}", n),
        }
    }
}
