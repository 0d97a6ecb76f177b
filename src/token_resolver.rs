//! # Token Tree Resolution
//!
//! Walks position forests depth-first and attaches value to every node:
//!
//! - a node that already has children is never unwrapped again; its children are
//!   resolved instead
//! - a childless protocol token is unwrapped through the adapter that owns it and
//!   gains one child per underlying token
//! - any other leaf is priced through the chain's price adapter
//!
//! A leaf that cannot be priced is flagged, together with every ancestor, through
//! `has_tokens_without_usd_prices`; resolution carries on. The only hard failure is a
//! tree deeper than [`MAX_TOKEN_TREE_DEPTH`].
//!
//! Unwrap results are memoized per run in an [`UnwrapMemo`] keyed by
//! `(adapter, protocol token, block)`, so a pool token that shows up in both a
//! position and a movement is only unwrapped once.

use crate::adapter_registry::AdapterRegistry;
use crate::chains::Chain;
use crate::error::{EngineError, Result};
use crate::fixed_point::{DecimalError, FixedPointDecimal};
use crate::metrics::RunMetrics;
use crate::protocol_adapter::{AdapterKey, ProtocolAdapter};
use crate::types::{BalanceField, Movement, TokenNode, TokenType, UnwrapExchangeRate};
use dashmap::DashMap;
use ethers::types::{Address, U256};
use futures::future::{join_all, BoxFuture, FutureExt};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Deepest token tree the resolver accepts, root included.
pub const MAX_TOKEN_TREE_DEPTH: usize = 16;

type MemoKey = (AdapterKey, Address, Option<u64>);

/// Run-scoped unwrap cache. Concurrent lookups of the same key share one adapter call.
#[derive(Default)]
pub struct UnwrapMemo {
    entries: DashMap<MemoKey, Arc<OnceCell<Result<UnwrapExchangeRate>>>>,
}

impl UnwrapMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn get_or_unwrap(
        &self,
        adapter: &dyn ProtocolAdapter,
        token: Address,
        block: Option<u64>,
        metrics: &RunMetrics,
    ) -> Result<UnwrapExchangeRate> {
        let key = (adapter.metadata().key(), token, block);
        let cell = self.entries.entry(key).or_default().clone();

        let computed = AtomicBool::new(false);
        let result = cell
            .get_or_init(|| async {
                computed.store(true, Ordering::Relaxed);
                adapter.unwrap(token, block).await
            })
            .await
            .clone();

        if computed.load(Ordering::Relaxed) {
            metrics.record_memo_miss();
        } else {
            metrics.record_memo_hit();
        }
        result
    }
}

pub struct TokenTreeResolver {
    registry: Arc<AdapterRegistry>,
    memo: Arc<UnwrapMemo>,
    metrics: Arc<RunMetrics>,
}

impl TokenTreeResolver {
    pub fn new(registry: Arc<AdapterRegistry>, memo: Arc<UnwrapMemo>, metrics: Arc<RunMetrics>) -> Self {
        Self {
            registry,
            memo,
            metrics,
        }
    }

    /// Resolves `nodes` in place. Top-level protocol tokens are unwrapped through
    /// `adapter`; nested protocol tokens through whichever registered adapter owns them.
    pub async fn resolve(
        &self,
        adapter: &Arc<dyn ProtocolAdapter>,
        nodes: &mut [TokenNode],
        block: Option<u64>,
        field: BalanceField,
    ) -> Result<()> {
        let chain = adapter.metadata().chain;
        let results = join_all(nodes.iter_mut().map(|node| {
            self.resolve_node(chain, Some(adapter.clone()), node, block, field, 1)
        }))
        .await;
        results.into_iter().collect()
    }

    /// Resolves a forest that belongs to no particular adapter (movement tokens):
    /// every protocol token is routed through the registry.
    pub async fn resolve_unowned(
        &self,
        chain: Chain,
        nodes: &mut [TokenNode],
        block: Option<u64>,
        field: BalanceField,
    ) -> Result<()> {
        let results = join_all(
            nodes
                .iter_mut()
                .map(|node| self.resolve_node(chain, None, node, block, field, 1)),
        )
        .await;
        results.into_iter().collect()
    }

    /// Resolves each movement's tokens at the movement's own block. Top-level
    /// protocol tokens are unwrapped through `adapter`, which produced the movements.
    pub async fn resolve_movements(
        &self,
        adapter: &Arc<dyn ProtocolAdapter>,
        movements: &mut [Movement],
    ) -> Result<()> {
        let results = join_all(movements.iter_mut().map(|movement| {
            let block = Some(movement.block_number);
            self.resolve(adapter, &mut movement.tokens, block, BalanceField::Balance)
        }))
        .await;
        results.into_iter().collect()
    }

    /// Memoized exchange rate of `protocol_token` through `adapter`.
    pub async fn unwrap_rate(
        &self,
        adapter: &Arc<dyn ProtocolAdapter>,
        protocol_token: Address,
        block: Option<u64>,
    ) -> Result<UnwrapExchangeRate> {
        self.memo
            .get_or_unwrap(adapter.as_ref(), protocol_token, block, &self.metrics)
            .await
    }

    fn resolve_node<'a>(
        &'a self,
        chain: Chain,
        owner: Option<Arc<dyn ProtocolAdapter>>,
        node: &'a mut TokenNode,
        block: Option<u64>,
        field: BalanceField,
        depth: usize,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if depth > MAX_TOKEN_TREE_DEPTH {
                return Err(EngineError::DepthExceeded {
                    max_depth: MAX_TOKEN_TREE_DEPTH,
                    token: node.address(),
                });
            }

            if node.is_leaf() {
                if node.price.is_none() && node.token_type != TokenType::Fiat {
                    let owner =
                        owner.or_else(|| self.registry.adapter_for_token(chain, node.address()));
                    match owner {
                        Some(owner) => self.expand(chain, &owner, node, block, field).await?,
                        None => self.price_leaf(chain, node, block).await,
                    }
                }
                if node.is_leaf() {
                    node.has_tokens_without_usd_prices =
                        node.price.is_none() && node.token_type != TokenType::Fiat;
                    return Ok(());
                }
            }

            let children = join_all(
                node.children
                    .iter_mut()
                    .map(|child| self.resolve_node(chain, None, child, block, field, depth + 1)),
            )
            .await;
            for result in children {
                result?;
            }

            node.has_tokens_without_usd_prices = node
                .children
                .iter()
                .any(|child| child.has_tokens_without_usd_prices);
            Ok(())
        }
        .boxed()
    }

    /// Unwraps a childless protocol token into children, or prices it directly when
    /// the owner answers with a fiat rate. Falls back to the price adapter when the
    /// owner cannot unwrap it.
    async fn expand(
        &self,
        chain: Chain,
        owner: &Arc<dyn ProtocolAdapter>,
        node: &mut TokenNode,
        block: Option<u64>,
        field: BalanceField,
    ) -> Result<()> {
        let rates = match self
            .memo
            .get_or_unwrap(owner.as_ref(), node.address(), block, &self.metrics)
            .await
        {
            Ok(rates) if !rates.tokens.is_empty() => rates,
            Ok(_) => {
                self.price_leaf(chain, node, block).await;
                return Ok(());
            }
            Err(e) => {
                debug!(
                    "{} could not unwrap {:?} at {:?}: {}",
                    owner.metadata().key(),
                    node.address(),
                    block,
                    e
                );
                self.price_leaf(chain, node, block).await;
                return Ok(());
            }
        };

        if rates.tokens.iter().all(|rate| rate.token_type == TokenType::Fiat) {
            node.price = price_from_rates(&rates);
            return Ok(());
        }

        let amount = field.amount(node);
        let mut children = Vec::with_capacity(rates.tokens.len());
        for rate in rates.tokens.iter().filter(|rate| rate.token_type != TokenType::Fiat) {
            let raw = scale_by_rate(amount, rate.underlying_rate_raw, node.metadata.decimals)
                .ok_or(EngineError::Decimal(DecimalError::Overflow))?;
            let mut child = TokenNode::new(rate.token.clone(), rate.token_type, raw);
            if field == BalanceField::TotalSupply {
                child.total_supply_raw = Some(raw);
            }
            children.push(child);
        }
        node.children = children;
        Ok(())
    }

    /// Attaches a USD price from the chain's price adapter. Leaves the node unpriced
    /// when there is none or it cannot price the token.
    async fn price_leaf(&self, chain: Chain, node: &mut TokenNode, block: Option<u64>) {
        let Some(prices) = self.registry.price_adapter(chain) else {
            debug!("no price adapter for {}, {:?} stays unpriced", chain, node.address());
            return;
        };
        match self
            .memo
            .get_or_unwrap(prices.as_ref(), node.address(), block, &self.metrics)
            .await
        {
            Ok(rates) => node.price = price_from_rates(&rates),
            Err(e) => debug!(
                "no USD price for {} {:?} at {:?}: {}",
                node.metadata.symbol,
                node.address(),
                block,
                e
            ),
        }
    }
}

/// `amount * rate / 10^decimals`, in raw units of the underlying token.
fn scale_by_rate(amount: U256, rate: U256, decimals: u8) -> Option<U256> {
    let product = amount.full_mul(rate);
    let divisor = ethers::types::U512::from(U256::exp10(decimals as usize));
    U256::try_from(product / divisor).ok()
}

/// USD price of one whole token from a price adapter's fiat rate.
fn price_from_rates(rates: &UnwrapExchangeRate) -> Option<FixedPointDecimal> {
    let fiat = rates
        .tokens
        .iter()
        .find(|rate| rate.token_type == TokenType::Fiat)?;
    FixedPointDecimal::from_units(fiat.underlying_rate_raw, fiat.token.decimals).ok()
}
