//! # Token Trees
//!
//! A position is a forest of [`TokenNode`]s: a protocol token at the root, backed by
//! underlying tokens, which may be protocol tokens themselves. A node with children
//! never carries an authoritative price; its value is the sum of its children. A leaf
//! must carry a price to be valued, otherwise the tree is flagged as having tokens
//! without a USD price.

use crate::fixed_point::{DecimalError, FixedPointDecimal};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Protocol,
    Underlying,
    UnderlyingClaimable,
    Reward,
    /// Fiat pseudo-token returned by price adapters.
    Fiat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionType {
    Supply,
    Lend,
    Stake,
    Reward,
    Borrow,
}

impl PositionType {
    pub fn is_borrow(&self) -> bool {
        matches!(self, PositionType::Borrow)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub address: Address,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

impl TokenMetadata {
    pub fn new(address: Address, name: &str, symbol: &str, decimals: u8) -> Self {
        Self {
            address,
            name: name.to_string(),
            symbol: symbol.to_string(),
            decimals,
        }
    }
}

/// Which amount on a node scales its children during unwrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalanceField {
    /// User balance (positions, movements).
    #[default]
    Balance,
    /// Pool total supply (TVL queries). Falls back to `balance_raw` when absent.
    TotalSupply,
}

impl BalanceField {
    pub fn amount(&self, node: &TokenNode) -> U256 {
        match self {
            BalanceField::Balance => node.balance_raw,
            BalanceField::TotalSupply => node.total_supply_raw.unwrap_or(node.balance_raw),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenNode {
    #[serde(flatten)]
    pub metadata: TokenMetadata,
    pub token_type: TokenType,
    pub balance_raw: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_supply_raw: Option<U256>,
    /// USD per whole token. Only meaningful on leaves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<FixedPointDecimal>,
    #[serde(default)]
    pub has_tokens_without_usd_prices: bool,
    #[serde(default)]
    pub children: Vec<TokenNode>,
}

impl TokenNode {
    pub fn new(metadata: TokenMetadata, token_type: TokenType, balance_raw: U256) -> Self {
        Self {
            metadata,
            token_type,
            balance_raw,
            total_supply_raw: None,
            price: None,
            has_tokens_without_usd_prices: false,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<TokenNode>) -> Self {
        self.children = children;
        self
    }

    pub fn with_price(mut self, price: FixedPointDecimal) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_total_supply(mut self, total_supply_raw: U256) -> Self {
        self.total_supply_raw = Some(total_supply_raw);
        self
    }

    pub fn address(&self) -> Address {
        self.metadata.address
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Balance in whole-token units.
    pub fn balance(&self) -> Result<FixedPointDecimal, DecimalError> {
        FixedPointDecimal::from_units(self.balance_raw, self.metadata.decimals)
    }

    /// Every leaf has a price.
    pub fn is_fully_priced(&self) -> bool {
        if self.is_leaf() {
            self.price.is_some()
        } else {
            self.children.iter().all(TokenNode::is_fully_priced)
        }
    }

    pub fn leaves(&self) -> Vec<&TokenNode> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a TokenNode>) {
        if self.is_leaf() {
            out.push(self);
        } else {
            for child in &self.children {
                child.collect_leaves(out);
            }
        }
    }

    /// USD value of the priced part of the tree. Unpriced leaves contribute zero;
    /// check [`is_fully_priced`](Self::is_fully_priced) before trusting the total.
    pub fn priced_value(&self) -> Result<FixedPointDecimal, DecimalError> {
        if self.is_leaf() {
            return match &self.price {
                Some(price) => self.balance()?.checked_mul(price),
                None => Ok(FixedPointDecimal::ZERO),
            };
        }
        self.children
            .iter()
            .try_fold(FixedPointDecimal::ZERO, |acc, child| {
                acc.checked_add(&child.priced_value()?)
            })
    }
}

/// Exchange rate of one whole protocol token into each underlying token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnwrapExchangeRate {
    pub protocol_token: TokenMetadata,
    pub tokens: Vec<UnderlyingRate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnderlyingRate {
    #[serde(flatten)]
    pub token: TokenMetadata,
    pub token_type: TokenType,
    /// Underlying base units per `10^protocol_decimals` protocol base units.
    pub underlying_rate_raw: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    Deposit,
    Withdrawal,
    Borrow,
    Repay,
}

/// A single deposit, withdrawal, borrow or repay affecting one protocol token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    pub kind: MovementKind,
    pub protocol_token: TokenMetadata,
    pub tokens: Vec<TokenNode>,
    pub block_number: u64,
    pub transaction_hash: H256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTag {
    Start,
    End,
}

/// Immutable position forest captured at one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tag: SnapshotTag,
    pub block_number: u64,
    pub positions: Vec<TokenNode>,
}

impl Snapshot {
    pub fn new(tag: SnapshotTag, block_number: u64, positions: Vec<TokenNode>) -> Self {
        Self {
            tag,
            block_number,
            positions,
        }
    }

    pub fn position(&self, protocol_token: Address) -> Option<&TokenNode> {
        self.positions
            .iter()
            .find(|node| node.address() == protocol_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(byte: u8, balance: u64, price: Option<&str>) -> TokenNode {
        let node = TokenNode::new(
            TokenMetadata::new(Address::repeat_byte(byte), "Token", "TKN", 0),
            TokenType::Underlying,
            U256::from(balance),
        );
        match price {
            Some(p) => node.with_price(p.parse().unwrap()),
            None => node,
        }
    }

    #[test]
    fn test_priced_value_sums_children() {
        let root = TokenNode::new(
            TokenMetadata::new(Address::repeat_byte(9), "LP", "LP", 18),
            TokenType::Protocol,
            U256::exp10(18),
        )
        .with_children(vec![leaf(1, 10, Some("2")), leaf(2, 3, Some("0.5"))]);

        assert!(root.is_fully_priced());
        assert_eq!(root.priced_value().unwrap().to_string(), "21.5");
        assert_eq!(root.leaves().len(), 2);
    }

    #[test]
    fn test_missing_leaf_price_is_not_fully_priced() {
        let root = TokenNode::new(
            TokenMetadata::new(Address::repeat_byte(9), "LP", "LP", 18),
            TokenType::Protocol,
            U256::exp10(18),
        )
        .with_children(vec![leaf(1, 10, Some("2")), leaf(2, 3, None)]);

        assert!(!root.is_fully_priced());
        assert_eq!(root.priced_value().unwrap().to_string(), "20");
    }

    #[test]
    fn test_total_supply_field_falls_back_to_balance() {
        let node = leaf(1, 10, None);
        assert_eq!(BalanceField::TotalSupply.amount(&node), U256::from(10u64));
        let node = node.with_total_supply(U256::from(99u64));
        assert_eq!(BalanceField::TotalSupply.amount(&node), U256::from(99u64));
    }
}
