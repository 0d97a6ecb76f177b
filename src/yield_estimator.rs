//! # Yield Estimation
//!
//! Turns a start/end pair of one position (plus interim movements) into an
//! annualized rate. The strategy is picked from the shape of the resolved tree:
//!
//! | leaves | strategy |
//! |---|---|
//! | 1 | [`YieldStrategy::SingleBalance`]: fractional balance growth net of movements |
//! | 2 | [`YieldStrategy::ConstantProduct`]: fee income isolated from impermanent loss |
//! | other | no estimate |
//!
//! All balance math is done in [`FixedPointDecimal`]; only the final compounding
//! (`apy`) uses `f64` because of the fractional exponent.

use crate::chains::Chain;
use crate::error::{EngineError, Result};
use crate::fixed_point::FixedPointDecimal;
use crate::profit::movements_in_window;
use crate::types::{Movement, MovementKind, PositionType, TokenNode};
use ethers::types::Address;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YieldEstimate {
    /// Growth over the window as a fraction (0.01 = 1%).
    pub interest: FixedPointDecimal,
    pub apr: f64,
    pub apy: f64,
    pub duration_days: f64,
    pub frequency: f64,
}

impl YieldEstimate {
    /// `apr = frequency * interest`, `apy = (1 + apr / frequency)^frequency - 1`.
    pub fn from_interest(interest: FixedPointDecimal, duration_days: f64) -> Result<Self> {
        if !(duration_days > 0.0) {
            return Err(EngineError::InvalidInput(format!(
                "yield window must be positive, got {} days",
                duration_days
            )));
        }
        let frequency = 365.0 / duration_days;
        let apr = frequency * interest.to_f64();
        let apy = (1.0 + apr / frequency).powf(frequency) - 1.0;
        Ok(Self {
            interest,
            apr,
            apy,
            duration_days,
            frequency,
        })
    }
}

/// Inputs shared by every strategy. `start` and `end` are the same protocol token
/// resolved at `from_block` and `to_block`.
#[derive(Debug, Clone, Copy)]
pub struct YieldInput<'a> {
    pub chain: Chain,
    pub position_type: PositionType,
    pub start: &'a TokenNode,
    pub end: &'a TokenNode,
    pub movements: &'a [Movement],
    pub from_block: u64,
    pub to_block: u64,
}

impl YieldInput<'_> {
    pub fn duration_days(&self) -> f64 {
        self.to_block.saturating_sub(self.from_block) as f64
            / self.chain.average_blocks_per_day() as f64
    }

    /// Net raw principal flow of `token` in the window, signed so that adding it to the
    /// start balance gives the balance expected without any accrual.
    fn net_flow(&self, token: Address) -> Result<FixedPointDecimal> {
        let mut net = FixedPointDecimal::ZERO;
        for movement in movements_in_window(self.movements, self.from_block, self.to_block) {
            if movement.protocol_token.address != self.start.address() {
                continue;
            }
            let inflow = match (self.position_type.is_borrow(), movement.kind) {
                (false, MovementKind::Deposit) | (true, MovementKind::Borrow) => true,
                (false, MovementKind::Withdrawal) | (true, MovementKind::Repay) => false,
                _ => continue,
            };
            for node in &movement.tokens {
                for leaf in node.leaves().into_iter().filter(|l| l.address() == token) {
                    let amount = leaf.balance()?;
                    net = if inflow {
                        net.checked_add(&amount)?
                    } else {
                        net.checked_sub(&amount)?
                    };
                }
            }
        }
        Ok(net)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum YieldStrategy {
    SingleBalance,
    ConstantProduct,
}

impl YieldStrategy {
    /// Strategy for a tree with `leaf_count` leaves, if any.
    pub fn for_leaf_count(leaf_count: usize) -> Option<Self> {
        match leaf_count {
            1 => Some(YieldStrategy::SingleBalance),
            2 => Some(YieldStrategy::ConstantProduct),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            YieldStrategy::SingleBalance => "single-balance",
            YieldStrategy::ConstantProduct => "constant-product",
        }
    }

    pub fn required_leaves(&self) -> usize {
        match self {
            YieldStrategy::SingleBalance => 1,
            YieldStrategy::ConstantProduct => 2,
        }
    }

    /// Runs this strategy. A tree of the wrong shape is an
    /// [`EngineError::AdapterUnsupported`]; a missing price gives `Ok(None)`.
    pub fn estimate(&self, input: &YieldInput<'_>) -> Result<Option<YieldEstimate>> {
        let start_leaves = input.start.leaves();
        let end_leaves = input.end.leaves();
        let required = self.required_leaves();
        if start_leaves.len() != required || end_leaves.len() != required {
            return Err(EngineError::unsupported(
                self.name(),
                format!("{} leaves", start_leaves.len().max(end_leaves.len())),
                "estimate_yield",
            ));
        }
        if !input.start.is_fully_priced() || !input.end.is_fully_priced() {
            return Ok(None);
        }

        let interest = match self {
            YieldStrategy::SingleBalance => {
                single_balance_interest(input, start_leaves[0], end_leaves[0])?
            }
            YieldStrategy::ConstantProduct => {
                match constant_product_interest(input, &start_leaves, &end_leaves)? {
                    Some(interest) => interest,
                    None => return Ok(None),
                }
            }
        };
        YieldEstimate::from_interest(interest, input.duration_days()).map(Some)
    }
}

/// Picks the strategy from the tree shape. Shapes no strategy supports give `Ok(None)`.
pub fn estimate_yield(input: &YieldInput<'_>) -> Result<Option<YieldEstimate>> {
    let leaf_count = input.start.leaves().len();
    if leaf_count != input.end.leaves().len() {
        return Ok(None);
    }
    match YieldStrategy::for_leaf_count(leaf_count) {
        Some(strategy) => strategy.estimate(input),
        None => Ok(None),
    }
}

fn single_balance_interest(
    input: &YieldInput<'_>,
    start: &TokenNode,
    end: &TokenNode,
) -> Result<FixedPointDecimal> {
    if start.address() != end.address() {
        return Err(EngineError::InvalidInput(format!(
            "start leaf {:?} and end leaf {:?} differ",
            start.address(),
            end.address()
        )));
    }
    let start_balance = start.balance()?;
    if start_balance.is_zero() {
        return Err(EngineError::InvalidInput(format!(
            "zero start balance for {}",
            start.metadata.symbol
        )));
    }
    let accrued = end
        .balance()?
        .checked_sub(&input.net_flow(start.address())?)?
        .checked_sub(&start_balance)?;
    Ok(accrued.checked_div(&start_balance)?)
}

/// Fee share of a two-token constant-product position.
///
/// `k = x0 * y0`. At end prices the fee-less pool would hold `x = sqrt(k * py / px)`
/// and `y = sqrt(k * px / py)`; anything above that in the (movement-adjusted) end
/// balances is fees. Interest is fee value over fee-less value.
fn constant_product_interest(
    input: &YieldInput<'_>,
    start: &[&TokenNode],
    end: &[&TokenNode],
) -> Result<Option<FixedPointDecimal>> {
    let same_order = (
        end[0].address() == start[0].address(),
        end[1].address() == start[1].address(),
    );
    let (x_end, y_end) = match same_order {
        (true, true) => (end[0], end[1]),
        _ if end[0].address() == start[1].address() && end[1].address() == start[0].address() => {
            (end[1], end[0])
        }
        _ => {
            return Err(EngineError::InvalidInput(
                "start and end pools hold different tokens".to_string(),
            ))
        }
    };
    let (Some(px), Some(py)) = (&x_end.price, &y_end.price) else {
        return Ok(None);
    };
    if px.is_zero() || py.is_zero() {
        return Ok(None);
    }

    let k = start[0].balance()?.checked_mul(&start[1].balance()?)?;
    if k.is_zero() {
        return Err(EngineError::InvalidInput("empty pool at start block".to_string()));
    }

    let x_hypothetical = k.checked_mul(&py.checked_div(px)?)?.sqrt()?;
    let y_hypothetical = k.checked_mul(&px.checked_div(py)?)?.sqrt()?;

    let x_actual = x_end.balance()?.checked_sub(&input.net_flow(x_end.address())?)?;
    let y_actual = y_end.balance()?.checked_sub(&input.net_flow(y_end.address())?)?;

    let fee_value = x_actual
        .checked_sub(&x_hypothetical)?
        .checked_mul(px)?
        .checked_add(&y_actual.checked_sub(&y_hypothetical)?.checked_mul(py)?)?;
    let hypothetical_value = x_hypothetical
        .checked_mul(px)?
        .checked_add(&y_hypothetical.checked_mul(py)?)?;

    Ok(Some(fee_value.checked_div(&hypothetical_value)?))
}
