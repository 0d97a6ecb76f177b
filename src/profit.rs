//! # Profit Attribution
//!
//! Diffs a start and an end snapshot, plus the movements in between, into a fee-only
//! profit per protocol token:
//!
//! ```text
//! profit = end + withdrawals - deposits - start
//! ```
//!
//! Borrow positions use the same formula on their debt (borrows count as deposits,
//! repays as withdrawals) and negate the result, since a growing debt is a cost.
//!
//! Movements are taken from the half-open window `(start_block, end_block]`. A leaf
//! token present in only one snapshot is valued at zero on the other side and counted
//! as unmatched.

use crate::error::{EngineError, Result};
use crate::fixed_point::FixedPointDecimal;
use crate::metrics::RunMetrics;
use crate::types::{Movement, MovementKind, PositionType, Snapshot, TokenMetadata, TokenNode};
use crate::yield_estimator::YieldEstimate;
use ethers::types::Address;
use indexmap::IndexMap;
use log::debug;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenProfit {
    #[serde(flatten)]
    pub token: TokenMetadata,
    pub start_value: FixedPointDecimal,
    pub end_value: FixedPointDecimal,
    pub deposits_value: FixedPointDecimal,
    pub withdrawals_value: FixedPointDecimal,
    pub profit: FixedPointDecimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionProfit {
    pub protocol_token: TokenMetadata,
    pub position_type: PositionType,
    pub from_block: u64,
    pub to_block: u64,
    /// USD, negated for borrow positions.
    pub profit: FixedPointDecimal,
    pub tokens: Vec<TokenProfit>,
    pub has_tokens_without_usd_prices: bool,
    pub unmatched_token_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yield_estimate: Option<YieldEstimate>,
}

/// Which side of the identity a movement lands on for a given position type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    In,
    Out,
}

fn flow_of(kind: MovementKind, position_type: PositionType) -> Option<Flow> {
    match (position_type.is_borrow(), kind) {
        (false, MovementKind::Deposit) => Some(Flow::In),
        (false, MovementKind::Withdrawal) => Some(Flow::Out),
        (true, MovementKind::Borrow) => Some(Flow::In),
        (true, MovementKind::Repay) => Some(Flow::Out),
        _ => None,
    }
}

/// Movements in `(from_block, to_block]`.
pub fn movements_in_window(movements: &[Movement], from_block: u64, to_block: u64) -> Vec<&Movement> {
    movements
        .iter()
        .filter(|m| m.block_number > from_block && m.block_number <= to_block)
        .collect()
}

#[derive(Debug)]
struct Leg {
    token: TokenMetadata,
    start: Option<FixedPointDecimal>,
    end: Option<FixedPointDecimal>,
    deposits: FixedPointDecimal,
    withdrawals: FixedPointDecimal,
}

impl Leg {
    fn new(token: TokenMetadata) -> Self {
        Self {
            token,
            start: None,
            end: None,
            deposits: FixedPointDecimal::ZERO,
            withdrawals: FixedPointDecimal::ZERO,
        }
    }
}

#[derive(Debug)]
struct PositionAccumulator {
    protocol_token: TokenMetadata,
    legs: IndexMap<Address, Leg>,
    degraded: bool,
}

impl PositionAccumulator {
    fn new(protocol_token: TokenMetadata) -> Self {
        Self {
            protocol_token,
            legs: IndexMap::new(),
            degraded: false,
        }
    }

    fn leg(&mut self, token: &TokenMetadata) -> &mut Leg {
        self.legs
            .entry(token.address)
            .or_insert_with(|| Leg::new(token.clone()))
    }
}

/// Priced value of a leaf; unpriced leaves are worth zero and mark the position degraded.
fn leaf_value(leaf: &TokenNode, degraded: &mut bool) -> Result<FixedPointDecimal> {
    match &leaf.price {
        Some(price) => Ok(leaf.balance()?.checked_mul(price)?),
        None => {
            *degraded = true;
            Ok(FixedPointDecimal::ZERO)
        }
    }
}

pub struct ProfitAttributor {
    metrics: Arc<RunMetrics>,
}

impl Default for ProfitAttributor {
    fn default() -> Self {
        Self::new(Arc::new(RunMetrics::new()))
    }
}

impl ProfitAttributor {
    pub fn new(metrics: Arc<RunMetrics>) -> Self {
        Self { metrics }
    }

    /// Profit per protocol token present in either snapshot or in a movement.
    pub fn attribute(
        &self,
        start: &Snapshot,
        end: &Snapshot,
        movements: &[Movement],
        position_type: PositionType,
    ) -> Result<Vec<PositionProfit>> {
        if start.block_number > end.block_number {
            return Err(EngineError::InvalidInput(format!(
                "start snapshot block {} is after end snapshot block {}",
                start.block_number, end.block_number
            )));
        }

        let mut positions: IndexMap<Address, PositionAccumulator> = IndexMap::new();

        for node in &end.positions {
            let acc = positions
                .entry(node.address())
                .or_insert_with(|| PositionAccumulator::new(node.metadata.clone()));
            acc.degraded |= node.has_tokens_without_usd_prices;
            for leaf in node.leaves() {
                let value = leaf_value(leaf, &mut acc.degraded)?;
                let leg = acc.leg(&leaf.metadata);
                leg.end = Some(leg.end.unwrap_or(FixedPointDecimal::ZERO).checked_add(&value)?);
            }
        }

        for node in &start.positions {
            let acc = positions
                .entry(node.address())
                .or_insert_with(|| PositionAccumulator::new(node.metadata.clone()));
            acc.degraded |= node.has_tokens_without_usd_prices;
            for leaf in node.leaves() {
                let value = leaf_value(leaf, &mut acc.degraded)?;
                let leg = acc.leg(&leaf.metadata);
                leg.start = Some(leg.start.unwrap_or(FixedPointDecimal::ZERO).checked_add(&value)?);
            }
        }

        for movement in movements_in_window(movements, start.block_number, end.block_number) {
            let Some(flow) = flow_of(movement.kind, position_type) else {
                continue;
            };
            let acc = positions
                .entry(movement.protocol_token.address)
                .or_insert_with(|| PositionAccumulator::new(movement.protocol_token.clone()));
            for node in &movement.tokens {
                acc.degraded |= node.has_tokens_without_usd_prices;
                for leaf in node.leaves() {
                    let value = leaf_value(leaf, &mut acc.degraded)?;
                    let leg = acc.leg(&leaf.metadata);
                    match flow {
                        Flow::In => leg.deposits = leg.deposits.checked_add(&value)?,
                        Flow::Out => leg.withdrawals = leg.withdrawals.checked_add(&value)?,
                    }
                }
            }
        }

        let mut unmatched_total = 0;
        let mut results = Vec::with_capacity(positions.len());
        for (_, acc) in positions {
            let mut unmatched = 0u64;
            let mut tokens = Vec::with_capacity(acc.legs.len());

            for (_, leg) in acc.legs {
                if leg.start.is_some() != leg.end.is_some() {
                    debug!(
                        "{} ({:?}) only present in the {} snapshot of {}",
                        leg.token.symbol,
                        leg.token.address,
                        if leg.start.is_some() { "start" } else { "end" },
                        acc.protocol_token.symbol
                    );
                    unmatched += 1;
                }
                let start_value = leg.start.unwrap_or(FixedPointDecimal::ZERO);
                let end_value = leg.end.unwrap_or(FixedPointDecimal::ZERO);
                let mut profit = end_value
                    .checked_add(&leg.withdrawals)?
                    .checked_sub(&leg.deposits)?
                    .checked_sub(&start_value)?;
                if position_type.is_borrow() {
                    profit = -profit;
                }
                tokens.push(TokenProfit {
                    token: leg.token,
                    start_value,
                    end_value,
                    deposits_value: leg.deposits,
                    withdrawals_value: leg.withdrawals,
                    profit,
                });
            }

            let total = FixedPointDecimal::checked_sum(tokens.iter().map(|t| &t.profit))?;
            unmatched_total += unmatched;
            results.push(PositionProfit {
                protocol_token: acc.protocol_token,
                position_type,
                from_block: start.block_number,
                to_block: end.block_number,
                profit: total,
                tokens,
                has_tokens_without_usd_prices: acc.degraded,
                unmatched_token_count: unmatched,
                yield_estimate: None,
            });
        }

        self.metrics.record_unmatched_profit_tokens(unmatched_total);
        Ok(results)
    }
}
