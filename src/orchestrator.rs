//! # Task Orchestrator
//!
//! The `TaskOrchestrator` fans a query out over every registered adapter selected by
//! the filters (chain × protocol × product) and runs each as an isolated unit of work.
//!
//! ## Overview
//!
//! - Every unit runs in its own tokio task with no global concurrency limit; the
//!   per-chain `RpcBatcher` is what bounds network concurrency.
//! - A unit that fails (or panics) becomes a `Failure` entry carrying its identity;
//!   sibling units and the run itself are never aborted.
//! - Successful units with an empty payload are dropped, and so are
//!   `AdapterUnsupported` failures unless `QueryFilters::include_unsupported` is set.
//! - Each run gets a fresh unwrap memo and its own `RunMetrics`, returned with the
//!   results in a `RunReport`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let settings = Settings::new()?;
//! let orchestrator = TaskOrchestrator::from_settings(&settings, registry)?;
//!
//! let positions = orchestrator
//!     .get_positions(user, &QueryFilters::default().chains(vec![Chain::Ethereum]))
//!     .await;
//! ```

use crate::{
    adapter_registry::AdapterRegistry,
    chain_endpoint::ChainEndpoint,
    chains::Chain,
    error::{EngineError, FailureKind, Result},
    metrics::{RpcMetricsSnapshot, RunMetrics},
    profit::{PositionProfit, ProfitAttributor},
    protocol_adapter::{get_movements, AdapterMetadata, ProtocolAdapter},
    settings::Settings,
    task_result::{RunReport, TaskResult},
    token_resolver::{TokenTreeResolver, UnwrapMemo},
    types::{BalanceField, Movement, MovementKind, Snapshot, SnapshotTag, TokenNode, UnwrapExchangeRate},
    utils::TimePeriod,
    yield_estimator::{estimate_yield, YieldInput},
};
use ethers::types::Address;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Selection and block overrides for one query.
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub chains: Option<Vec<Chain>>,
    pub protocols: Option<Vec<String>>,
    pub products: Option<Vec<String>>,
    pub protocol_tokens: Option<Vec<Address>>,
    pub block_numbers: HashMap<Chain, u64>,
    pub include_unsupported: bool,
}

impl QueryFilters {
    pub fn chains(mut self, chains: Vec<Chain>) -> Self {
        self.chains = Some(chains);
        self
    }

    pub fn protocols(mut self, protocols: Vec<&str>) -> Self {
        self.protocols = Some(protocols.into_iter().map(str::to_string).collect());
        self
    }

    pub fn products(mut self, products: Vec<&str>) -> Self {
        self.products = Some(products.into_iter().map(str::to_string).collect());
        self
    }

    pub fn protocol_tokens(mut self, tokens: Vec<Address>) -> Self {
        self.protocol_tokens = Some(tokens);
        self
    }

    pub fn block_number(mut self, chain: Chain, block: u64) -> Self {
        self.block_numbers.insert(chain, block);
        self
    }

    pub fn include_unsupported(mut self, include: bool) -> Self {
        self.include_unsupported = include;
        self
    }

    pub fn block_for(&self, chain: Chain) -> Option<u64> {
        self.block_numbers.get(&chain).copied()
    }

    fn selects(&self, metadata: &AdapterMetadata) -> bool {
        self.chains
            .as_ref()
            .map_or(true, |chains| chains.contains(&metadata.chain))
            && self
                .protocols
                .as_ref()
                .map_or(true, |p| p.iter().any(|id| id == &metadata.protocol_id))
            && self
                .products
                .as_ref()
                .map_or(true, |p| p.iter().any(|id| id == &metadata.product_id))
    }
}

/// Start of a profit window; the end is the stable block or the filter's override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfitWindow {
    Period(TimePeriod),
    FromBlock(u64),
}

impl ProfitWindow {
    pub fn from_block(&self, chain: Chain, to_block: u64) -> u64 {
        match self {
            ProfitWindow::Period(period) => period.from_block(chain, to_block),
            ProfitWindow::FromBlock(block) => (*block).min(to_block),
        }
    }
}

impl Default for ProfitWindow {
    fn default() -> Self {
        ProfitWindow::Period(TimePeriod::OneDay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Positions {
        user: Address,
    },
    Profits {
        user: Address,
        window: ProfitWindow,
    },
    Movements {
        user: Address,
        kind: MovementKind,
        from_block: u64,
        to_block: u64,
    },
    Unwrap,
    TotalValueLocked,
}

/// Payload of a `run` result, one variant per query kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryPayload {
    Positions(Vec<TokenNode>),
    Profits(Vec<PositionProfit>),
    Movements(Vec<Movement>),
    Unwrap(Vec<UnwrapExchangeRate>),
    TotalValueLocked(Vec<TokenNode>),
}

/// A payload with nothing in it is not reported.
pub trait Findings {
    fn is_empty_finding(&self) -> bool;
}

impl<T> Findings for Vec<T> {
    fn is_empty_finding(&self) -> bool {
        self.is_empty()
    }
}

/// Everything a unit of work needs, owned so the unit can run on its own task.
#[derive(Clone)]
pub struct UnitContext {
    pub adapter: Arc<dyn ProtocolAdapter>,
    pub endpoint: Arc<ChainEndpoint>,
    pub resolver: Arc<TokenTreeResolver>,
    pub metrics: Arc<RunMetrics>,
    pub block: Option<u64>,
}

impl UnitContext {
    pub fn chain(&self) -> Chain {
        self.adapter.metadata().chain
    }

    /// The filter's block override, or the chain's stable block.
    pub async fn block_or_stable(&self) -> Result<u64> {
        match self.block {
            Some(block) => Ok(block),
            None => self.endpoint.get_latest_stable_block().await,
        }
    }
}

pub struct TaskOrchestrator {
    registry: Arc<AdapterRegistry>,
    endpoints: HashMap<Chain, Arc<ChainEndpoint>>,
}

impl TaskOrchestrator {
    pub fn new(registry: Arc<AdapterRegistry>, endpoints: Vec<Arc<ChainEndpoint>>) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|endpoint| (endpoint.chain(), endpoint))
            .collect();
        Self {
            registry,
            endpoints,
        }
    }

    /// Validates `settings` and builds an HTTP endpoint for every chain with a
    /// provider URL. Chains without one are left out; their units fail with a
    /// configuration error.
    pub fn from_settings(settings: &Settings, registry: Arc<AdapterRegistry>) -> Result<Self> {
        settings.validate()?;
        let mut endpoints = Vec::new();
        for chain in settings.configured_chains() {
            let resolved = settings.resolve(chain)?;
            endpoints.push(Arc::new(ChainEndpoint::from_settings(resolved)?));
        }
        info!(
            "TaskOrchestrator ready with {} adapters on {} chains",
            registry.len(),
            endpoints.len()
        );
        Ok(Self::new(registry, endpoints))
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    pub fn endpoint(&self, chain: Chain) -> Option<&Arc<ChainEndpoint>> {
        self.endpoints.get(&chain)
    }

    /// Runs any query and wraps the payloads in [`QueryPayload`].
    pub async fn run(&self, query: Query, filters: &QueryFilters) -> RunReport<QueryPayload> {
        match query {
            Query::Positions { user } => self
                .get_positions_report(user, filters)
                .await
                .map(QueryPayload::Positions),
            Query::Profits { user, window } => self
                .get_profits_report(user, window, filters)
                .await
                .map(QueryPayload::Profits),
            Query::Movements {
                user,
                kind,
                from_block,
                to_block,
            } => self
                .get_movements_report(user, kind, from_block, to_block, filters)
                .await
                .map(QueryPayload::Movements),
            Query::Unwrap => self.unwrap_report(filters).await.map(QueryPayload::Unwrap),
            Query::TotalValueLocked => self
                .get_total_value_locked_report(filters)
                .await
                .map(QueryPayload::TotalValueLocked),
        }
    }

    pub async fn get_positions(&self, user: Address, filters: &QueryFilters) -> Vec<TaskResult<Vec<TokenNode>>> {
        self.get_positions_report(user, filters).await.results
    }

    pub async fn get_positions_report(&self, user: Address, filters: &QueryFilters) -> RunReport<Vec<TokenNode>> {
        let token_filter = filters.protocol_tokens.clone();
        self.execute("get_positions", filters, move |ctx| {
            let token_filter = token_filter.clone();
            async move {
                let mut positions = ctx
                    .adapter
                    .get_positions(user, ctx.block, token_filter.as_deref())
                    .await?;
                ctx.resolver
                    .resolve(&ctx.adapter, &mut positions, ctx.block, BalanceField::Balance)
                    .await?;
                Ok(positions)
            }
        })
        .await
    }

    pub async fn get_profits(
        &self,
        user: Address,
        window: ProfitWindow,
        filters: &QueryFilters,
    ) -> Vec<TaskResult<Vec<PositionProfit>>> {
        self.get_profits_report(user, window, filters).await.results
    }

    pub async fn get_profits_report(
        &self,
        user: Address,
        window: ProfitWindow,
        filters: &QueryFilters,
    ) -> RunReport<Vec<PositionProfit>> {
        let token_filter = filters.protocol_tokens.clone();
        self.execute("get_profits", filters, move |ctx| {
            let token_filter = token_filter.clone();
            async move { profits_unit(ctx, user, window, token_filter).await }
        })
        .await
    }

    pub async fn get_withdrawals(
        &self,
        user: Address,
        from_block: u64,
        to_block: u64,
        filters: &QueryFilters,
    ) -> Vec<TaskResult<Vec<Movement>>> {
        self.get_movements_report(user, MovementKind::Withdrawal, from_block, to_block, filters)
            .await
            .results
    }

    pub async fn get_deposits(
        &self,
        user: Address,
        from_block: u64,
        to_block: u64,
        filters: &QueryFilters,
    ) -> Vec<TaskResult<Vec<Movement>>> {
        self.get_movements_report(user, MovementKind::Deposit, from_block, to_block, filters)
            .await
            .results
    }

    pub async fn get_repays(
        &self,
        user: Address,
        from_block: u64,
        to_block: u64,
        filters: &QueryFilters,
    ) -> Vec<TaskResult<Vec<Movement>>> {
        self.get_movements_report(user, MovementKind::Repay, from_block, to_block, filters)
            .await
            .results
    }

    pub async fn get_borrows(
        &self,
        user: Address,
        from_block: u64,
        to_block: u64,
        filters: &QueryFilters,
    ) -> Vec<TaskResult<Vec<Movement>>> {
        self.get_movements_report(user, MovementKind::Borrow, from_block, to_block, filters)
            .await
            .results
    }

    pub async fn get_movements_report(
        &self,
        user: Address,
        kind: MovementKind,
        from_block: u64,
        to_block: u64,
        filters: &QueryFilters,
    ) -> RunReport<Vec<Movement>> {
        let operation = match kind {
            MovementKind::Deposit => "get_deposits",
            MovementKind::Withdrawal => "get_withdrawals",
            MovementKind::Borrow => "get_borrows",
            MovementKind::Repay => "get_repays",
        };
        self.execute(operation, filters, move |ctx| async move {
            if from_block > to_block {
                return Err(EngineError::InvalidInput(format!(
                    "from_block {} is after to_block {}",
                    from_block, to_block
                )));
            }
            let mut movements =
                get_movements(ctx.adapter.as_ref(), kind, user, from_block, to_block).await?;
            ctx.resolver
                .resolve_movements(&ctx.adapter, &mut movements)
                .await?;
            Ok(movements)
        })
        .await
    }

    pub async fn unwrap(&self, filters: &QueryFilters) -> Vec<TaskResult<Vec<UnwrapExchangeRate>>> {
        self.unwrap_report(filters).await.results
    }

    pub async fn unwrap_report(&self, filters: &QueryFilters) -> RunReport<Vec<UnwrapExchangeRate>> {
        let token_filter = filters.protocol_tokens.clone();
        self.execute("unwrap", filters, move |ctx| {
            let token_filter = token_filter.clone();
            async move {
                let tokens: Vec<Address> = ctx
                    .adapter
                    .get_protocol_tokens()
                    .await?
                    .into_iter()
                    .map(|token| token.token.address)
                    .filter(|address| {
                        token_filter
                            .as_ref()
                            .map_or(true, |filter| filter.contains(address))
                    })
                    .collect();
                let rates = join_all(
                    tokens
                        .iter()
                        .map(|token| ctx.resolver.unwrap_rate(&ctx.adapter, *token, ctx.block)),
                )
                .await;
                rates.into_iter().collect()
            }
        })
        .await
    }

    pub async fn get_total_value_locked(&self, filters: &QueryFilters) -> Vec<TaskResult<Vec<TokenNode>>> {
        self.get_total_value_locked_report(filters).await.results
    }

    pub async fn get_total_value_locked_report(&self, filters: &QueryFilters) -> RunReport<Vec<TokenNode>> {
        let token_filter = filters.protocol_tokens.clone();
        self.execute("get_total_value_locked", filters, move |ctx| {
            let token_filter = token_filter.clone();
            async move {
                let mut pools = ctx
                    .adapter
                    .get_total_value_locked(token_filter.as_deref(), ctx.block)
                    .await?;
                ctx.resolver
                    .resolve(&ctx.adapter, &mut pools, ctx.block, BalanceField::TotalSupply)
                    .await?;
                Ok(pools)
            }
        })
        .await
    }

    /// Runs `unit` once per selected adapter and collects the outcomes.
    async fn execute<T, F, Fut>(&self, operation: &'static str, filters: &QueryFilters, unit: F) -> RunReport<T>
    where
        T: Findings + Send + 'static,
        F: Fn(UnitContext) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let run_id = Uuid::new_v4();
        let span = info_span!("orchestrator_run", %run_id, operation);

        async move {
            let metrics = Arc::new(RunMetrics::new());
            let resolver = Arc::new(TokenTreeResolver::new(
                self.registry.clone(),
                Arc::new(UnwrapMemo::new()),
                metrics.clone(),
            ));

            let selected: Vec<Arc<dyn ProtocolAdapter>> = self
                .registry
                .adapters()
                .filter(|adapter| filters.selects(adapter.metadata()))
                .cloned()
                .collect();
            let rpc_before: BTreeMap<Chain, RpcMetricsSnapshot> = selected
                .iter()
                .filter_map(|adapter| {
                    let chain = adapter.metadata().chain;
                    self.endpoints.get(&chain).map(|e| (chain, e.metrics()))
                })
                .collect();

            info!("Starting {} over {} units", operation, selected.len());

            let mut pending = Vec::with_capacity(selected.len());
            for adapter in selected {
                metrics.record_unit_started();
                let metadata = adapter.metadata().clone();
                let Some(endpoint) = self.endpoints.get(&metadata.chain).cloned() else {
                    pending.push((
                        metadata.clone(),
                        Err(EngineError::Configuration(format!(
                            "no rpc url configured for {}",
                            metadata.chain
                        ))),
                    ));
                    continue;
                };

                let ctx = UnitContext {
                    adapter,
                    endpoint,
                    resolver: resolver.clone(),
                    metrics: metrics.clone(),
                    block: filters.block_for(metadata.chain),
                };
                let unit_span = info_span!(
                    "unit",
                    protocol = %metadata.protocol_id,
                    product = %metadata.product_id,
                    chain = %metadata.chain
                );
                pending.push((metadata, Ok(tokio::spawn(unit(ctx).instrument(unit_span)))));
            }

            let outcomes = join_all(pending.into_iter().map(|(metadata, handle)| async move {
                let outcome = match handle {
                    Ok(handle) => handle.await,
                    Err(err) => Ok(Err(err)),
                };
                (metadata, outcome)
            }))
            .await;

            let mut results = Vec::new();
            for (metadata, outcome) in outcomes {
                match outcome {
                    Ok(Ok(payload)) => {
                        if payload.is_empty_finding() {
                            debug!("{} has no findings for {}", metadata.key(), operation);
                        } else {
                            results.push(TaskResult::success(&metadata, payload));
                        }
                    }
                    Ok(Err(err)) => {
                        metrics.record_unit_failed();
                        if err.is_unsupported() && !filters.include_unsupported {
                            debug!("{} does not support {}", metadata.key(), operation);
                            continue;
                        }
                        warn!("{} failed {}: {}", metadata.key(), operation, err);
                        results.push(TaskResult::failure(&metadata, &err));
                    }
                    Err(join_err) => {
                        metrics.record_unit_failed();
                        warn!("{} panicked during {}: {}", metadata.key(), operation, join_err);
                        results.push(TaskResult::failure_with_kind(
                            &metadata,
                            FailureKind::Panic,
                            join_err.to_string(),
                        ));
                    }
                }
            }

            for (chain, before) in rpc_before {
                if let Some(endpoint) = self.endpoints.get(&chain) {
                    metrics.record_rpc(chain, endpoint.metrics().since(&before));
                }
            }

            let metrics = metrics.snapshot();
            info!(
                "Finished {}: {} results, {} failed units",
                operation,
                results.len(),
                metrics.units_failed
            );
            RunReport {
                run_id,
                results,
                metrics,
            }
        }
        .instrument(span)
        .await
    }
}

/// One adapter's profits: positions at both ends of the window, the movements in
/// between, all resolved, then attributed and (where the shape allows) annualized.
async fn profits_unit(
    ctx: UnitContext,
    user: Address,
    window: ProfitWindow,
    token_filter: Option<Vec<Address>>,
) -> Result<Vec<PositionProfit>> {
    let chain = ctx.chain();
    let position_type = ctx.adapter.metadata().position_type;
    let to_block = ctx.block_or_stable().await?;
    let from_block = window.from_block(chain, to_block);

    let (mut start, mut end) = futures::try_join!(
        ctx.adapter
            .get_positions(user, Some(from_block), token_filter.as_deref()),
        ctx.adapter
            .get_positions(user, Some(to_block), token_filter.as_deref()),
    )?;

    let (inflow, outflow) = if position_type.is_borrow() {
        (MovementKind::Borrow, MovementKind::Repay)
    } else {
        (MovementKind::Deposit, MovementKind::Withdrawal)
    };
    let mut movements = if from_block < to_block {
        let (mut ins, outs) = futures::try_join!(
            get_movements(ctx.adapter.as_ref(), inflow, user, from_block + 1, to_block),
            get_movements(ctx.adapter.as_ref(), outflow, user, from_block + 1, to_block),
        )?;
        ins.extend(outs);
        ins
    } else {
        Vec::new()
    };
    if let Some(filter) = &token_filter {
        movements.retain(|m| filter.contains(&m.protocol_token.address));
    }

    futures::try_join!(
        ctx.resolver
            .resolve(&ctx.adapter, &mut start, Some(from_block), BalanceField::Balance),
        ctx.resolver
            .resolve(&ctx.adapter, &mut end, Some(to_block), BalanceField::Balance),
        ctx.resolver.resolve_movements(&ctx.adapter, &mut movements),
    )?;

    let start = Snapshot::new(SnapshotTag::Start, from_block, start);
    let end = Snapshot::new(SnapshotTag::End, to_block, end);
    let attributor = ProfitAttributor::new(ctx.metrics.clone());
    let mut profits = attributor.attribute(&start, &end, &movements, position_type)?;

    for profit in &mut profits {
        if profit.has_tokens_without_usd_prices {
            debug!(
                "no yield estimate for {}: unpriced tokens in the window",
                profit.protocol_token.symbol
            );
            continue;
        }
        let address = profit.protocol_token.address;
        let (Some(start_node), Some(end_node)) = (start.position(address), end.position(address))
        else {
            continue;
        };
        let input = YieldInput {
            chain,
            position_type,
            start: start_node,
            end: end_node,
            movements: &movements,
            from_block,
            to_block,
        };
        match estimate_yield(&input) {
            Ok(estimate) => profit.yield_estimate = estimate,
            Err(err) => debug!(
                "no yield estimate for {}: {}",
                profit.protocol_token.symbol, err
            ),
        }
    }
    Ok(profits)
}
