//! Integration tests for the task orchestrator and token tree resolution
//!
//! Adapters are in-memory fixtures; the endpoint runs over `MockTransport` so
//! orchestration never touches the network.

mod common;

use common::{
    endpoint, token, units, user, LoopingAdapter, MockTransport, PriceAdapter, Script,
    ScriptedAdapter, VaultAdapter,
};
use defi_portfolio_sdk::adapter_registry::AdapterRegistry;
use defi_portfolio_sdk::chains::Chain;
use defi_portfolio_sdk::error::FailureKind;
use defi_portfolio_sdk::orchestrator::{ProfitWindow, Query, QueryFilters, QueryPayload, TaskOrchestrator};
use defi_portfolio_sdk::task_result::TaskOutcome;
use defi_portfolio_sdk::token_resolver::MAX_TOKEN_TREE_DEPTH;
use defi_portfolio_sdk::types::{MovementKind, TokenNode, TokenType};
use ethers::types::U256;
use std::sync::Arc;

const FROM_BLOCK: u64 = 9_000;
const TO_BLOCK: u64 = 10_000;

fn usdc() -> defi_portfolio_sdk::types::TokenMetadata {
    token(0x22, "USDC", 6)
}

fn vault() -> VaultAdapter {
    VaultAdapter::new("yield-vault", token(0x11, "yvUSDC", 18), usdc())
        .balance_at(FROM_BLOCK, units(100, 18))
        .balance_at(TO_BLOCK, units(110, 18))
        .latest_balance(units(110, 18))
        .rate_at(FROM_BLOCK, U256::from(1_000_000u64))
        .rate_at(TO_BLOCK, U256::from(1_050_000u64))
        .movement(MovementKind::Deposit, TO_BLOCK, units(10, 18))
}

async fn orchestrator(adapters: Vec<Arc<dyn defi_portfolio_sdk::ProtocolAdapter>>) -> TaskOrchestrator {
    orchestrator_with_index(adapters, true).await
}

async fn orchestrator_with_index(
    adapters: Vec<Arc<dyn defi_portfolio_sdk::ProtocolAdapter>>,
    index_tokens: bool,
) -> TaskOrchestrator {
    let mut registry = AdapterRegistry::new();
    for adapter in adapters {
        registry.register(adapter).expect("unique adapter");
    }
    registry.register_price_adapter(Arc::new(
        PriceAdapter::new(Chain::Ethereum).price(usdc().address, "1"),
    ));
    if index_tokens {
        registry.index_protocol_tokens(None).await;
    }

    TaskOrchestrator::new(
        Arc::new(registry),
        vec![endpoint(Arc::new(MockTransport::new().with_head(TO_BLOCK + 2)))],
    )
}

fn at_to_block() -> QueryFilters {
    QueryFilters::default().block_number(Chain::Ethereum, TO_BLOCK)
}

/// Positions are unwrapped into their underlying token and priced
#[tokio::test]
async fn test_positions_are_resolved_and_priced() {
    let orchestrator = orchestrator(vec![Arc::new(vault())]).await;

    let results = orchestrator.get_positions(user(), &at_to_block()).await;

    assert_eq!(results.len(), 1);
    let positions = results[0].payload().expect("success");
    let root = &positions[0];
    assert_eq!(root.children.len(), 1);
    assert_eq!(root.children[0].metadata.symbol, "USDC");
    assert_eq!(root.children[0].balance_raw, U256::from(115_500_000u64));
    assert!(!root.has_tokens_without_usd_prices);
    assert_eq!(root.priced_value().unwrap().to_string(), "115.5");
}

/// One failing and one panicking adapter do not affect their siblings
#[tokio::test]
async fn test_failing_units_are_isolated() {
    let orchestrator = orchestrator(vec![
        Arc::new(ScriptedAdapter::new("broken", Chain::Ethereum, Script::Fail("rpc says no"))),
        Arc::new(ScriptedAdapter::new("buggy", Chain::Ethereum, Script::Panic)),
        Arc::new(vault()),
    ])
    .await;

    let report = orchestrator.get_positions_report(user(), &at_to_block()).await;

    assert_eq!(report.results.len(), 3);
    let broken = &report.results[0];
    assert_eq!(broken.protocol_id, "broken");
    assert_eq!(broken.failure_kind(), Some(FailureKind::Adapter));
    match &broken.outcome {
        TaskOutcome::Failure { message, .. } => assert!(message.contains("rpc says no")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(report.results[1].failure_kind(), Some(FailureKind::Panic));
    assert!(report.results[2].is_success());
    assert_eq!(report.metrics.units_started, 3);
    assert_eq!(report.metrics.units_failed, 2);
}

/// Successful units with nothing to report are dropped
#[tokio::test]
async fn test_empty_results_are_filtered() {
    let orchestrator = orchestrator(vec![
        Arc::new(ScriptedAdapter::new("idle", Chain::Ethereum, Script::Empty)),
        Arc::new(vault()),
    ])
    .await;

    let results = orchestrator.get_positions(user(), &at_to_block()).await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].protocol_id, "yield-vault");
}

/// Unsupported operations are hidden unless asked for
#[tokio::test]
async fn test_unsupported_failures_are_filtered() {
    let orchestrator = orchestrator(vec![
        Arc::new(ScriptedAdapter::new("no-tvl", Chain::Ethereum, Script::Empty)),
        Arc::new(vault()),
    ])
    .await;

    let results = orchestrator.get_total_value_locked(&at_to_block()).await;
    assert_eq!(results.len(), 1);
    assert!(results[0].is_success());
    let pools = results[0].payload().unwrap();
    assert_eq!(pools[0].children[0].total_supply_raw, Some(U256::from(115_500_000u64)));

    let results = orchestrator
        .get_total_value_locked(&at_to_block().include_unsupported(true))
        .await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].failure_kind(), Some(FailureKind::AdapterUnsupported));
}

/// A chain without an endpoint fails only its own units
#[tokio::test]
async fn test_missing_endpoint_is_a_configuration_failure() {
    let orchestrator = orchestrator(vec![
        Arc::new(
            VaultAdapter::new("base-vault", token(0x33, "bvUSDC", 18), usdc())
                .on_chain(Chain::Base)
                .latest_balance(units(1, 18)),
        ),
        Arc::new(vault()),
    ])
    .await;

    let results = orchestrator.get_positions(user(), &at_to_block()).await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].chain, Chain::Base);
    assert_eq!(results[0].failure_kind(), Some(FailureKind::Configuration));
    assert!(results[1].is_success());
}

/// Filters narrow the fan-out to the selected protocols
#[tokio::test]
async fn test_filters_select_units() {
    let orchestrator = orchestrator(vec![
        Arc::new(ScriptedAdapter::new("broken", Chain::Ethereum, Script::Fail("x"))),
        Arc::new(vault()),
    ])
    .await;

    let filters = at_to_block().protocols(vec!["yield-vault"]);
    let report = orchestrator.get_positions_report(user(), &filters).await;

    assert_eq!(report.metrics.units_started, 1);
    assert_eq!(report.results.len(), 1);
    assert!(report.results[0].is_success());
}

/// A leaf without a USD price flags itself and every ancestor
#[tokio::test]
async fn test_missing_price_propagates_to_root() {
    let unknown = token(0x44, "ODD", 18);
    let orchestrator = orchestrator(vec![Arc::new(
        VaultAdapter::new("odd-vault", token(0x55, "vODD", 18), unknown).latest_balance(units(3, 18)),
    )])
    .await;

    let results = orchestrator.get_positions(user(), &QueryFilters::default()).await;

    let root = &results[0].payload().expect("unpriced positions still succeed")[0];
    assert!(root.has_tokens_without_usd_prices);
    assert!(root.children[0].has_tokens_without_usd_prices);
    assert!(root.children[0].price.is_none());
}

/// Trees deeper than the ceiling fail the unit with DepthExceeded
#[tokio::test]
async fn test_depth_ceiling() {
    let orchestrator = orchestrator(vec![Arc::new(LoopingAdapter::new(token(0x66, "LOOP", 18)))]).await;

    let results = orchestrator.get_positions(user(), &at_to_block()).await;

    assert_eq!(results.len(), 1);
    match &results[0].outcome {
        TaskOutcome::Failure { kind, message } => {
            assert_eq!(*kind, FailureKind::DepthExceeded);
            assert!(message.contains(&MAX_TOKEN_TREE_DEPTH.to_string()));
        }
        other => panic!("expected DepthExceeded, got {:?}", other),
    }
}

/// Pre-resolved children are kept as-is and never unwrapped again
#[tokio::test]
async fn test_existing_children_are_not_unwrapped() {
    let share = token(0x11, "yvUSDC", 18);
    let preset = TokenNode::new(share, TokenType::Protocol, units(1, 18)).with_children(vec![
        TokenNode::new(usdc(), TokenType::Underlying, U256::from(2_000_000u64)),
    ]);
    let vault = Arc::new(vault());
    let orchestrator = orchestrator(vec![
        Arc::new(ScriptedAdapter::new("preset", Chain::Ethereum, Script::Positions(vec![preset]))),
        vault.clone(),
    ])
    .await;

    let results = orchestrator
        .get_positions(user(), &at_to_block().protocols(vec!["preset"]))
        .await;

    let root = &results[0].payload().unwrap()[0];
    assert_eq!(root.children.len(), 1);
    assert_eq!(root.children[0].balance_raw, U256::from(2_000_000u64));
    assert_eq!(root.priced_value().unwrap().to_string(), "2");
    assert_eq!(vault.unwrap_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

/// End to end profit: start/end snapshots, a deposit in the window, memoized unwraps
#[tokio::test]
async fn test_profits_end_to_end() {
    let vault = Arc::new(vault());
    let orchestrator = orchestrator(vec![vault.clone()]).await;

    let report = orchestrator
        .get_profits_report(user(), ProfitWindow::FromBlock(FROM_BLOCK), &at_to_block())
        .await;

    assert_eq!(report.results.len(), 1, "{:?}", report.results);
    let profits = report.results[0].payload().expect("profits");
    assert_eq!(profits.len(), 1);
    let profit = &profits[0];
    assert_eq!(profit.from_block, FROM_BLOCK);
    assert_eq!(profit.to_block, TO_BLOCK);
    // 100 USDC -> 115.5 USDC with a 10.5 USDC deposit
    assert_eq!(profit.profit.to_string(), "5");
    assert_eq!(profit.tokens[0].deposits_value.to_string(), "10.5");
    assert!(!profit.has_tokens_without_usd_prices);
    assert_eq!(profit.unmatched_token_count, 0);

    let estimate = profit.yield_estimate.as_ref().expect("single balance yield");
    assert_eq!(estimate.interest.to_string(), "0.05");
    assert!(estimate.apr > 0.0);

    // The deposit's share token at TO_BLOCK reuses the end snapshot's unwrap
    assert!(report.metrics.unwrap_memo_hits >= 1);
    assert_eq!(vault.unwrap_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
}

/// Movement tokens unwrap through the adapter that reported them, even when the
/// registry's token index was never built
#[tokio::test]
async fn test_profits_without_token_index() {
    let vault = Arc::new(vault());
    let orchestrator = orchestrator_with_index(vec![vault.clone()], false).await;

    let report = orchestrator
        .get_profits_report(user(), ProfitWindow::FromBlock(FROM_BLOCK), &at_to_block())
        .await;

    let profit = &report.results[0].payload().expect("profits")[0];
    assert_eq!(profit.profit.to_string(), "5");
    assert_eq!(profit.tokens[0].deposits_value.to_string(), "10.5");
    assert!(!profit.has_tokens_without_usd_prices);
    let estimate = profit.yield_estimate.as_ref().expect("single balance yield");
    assert_eq!(estimate.interest.to_string(), "0.05");
    assert_eq!(vault.unwrap_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
}

/// Positions with unpriced tokens still report a profit but no yield
#[tokio::test]
async fn test_unpriced_profit_has_no_yield_estimate() {
    let unpriced = VaultAdapter::new("odd-vault", token(0x11, "vODD", 18), token(0x77, "ODD", 6))
        .balance_at(FROM_BLOCK, units(100, 18))
        .balance_at(TO_BLOCK, units(110, 18))
        .rate_at(FROM_BLOCK, U256::from(1_000_000u64))
        .rate_at(TO_BLOCK, U256::from(1_050_000u64));
    let orchestrator = orchestrator(vec![Arc::new(unpriced)]).await;

    let report = orchestrator
        .get_profits_report(user(), ProfitWindow::FromBlock(FROM_BLOCK), &at_to_block())
        .await;

    let profit = &report.results[0].payload().expect("profits")[0];
    assert!(profit.has_tokens_without_usd_prices);
    assert!(profit.yield_estimate.is_none());
}

/// The stable block is used when no block override is given
#[tokio::test]
async fn test_profits_default_to_stable_block() {
    let orchestrator = orchestrator(vec![Arc::new(vault())]).await;

    let results = orchestrator
        .get_profits(user(), ProfitWindow::FromBlock(FROM_BLOCK), &QueryFilters::default())
        .await;

    // head is TO_BLOCK + 2 and Ethereum keeps a 2 block margin
    let profit = &results[0].payload().expect("profits")[0];
    assert_eq!(profit.to_block, TO_BLOCK);
}

/// `run` wraps every query kind in its payload variant
#[tokio::test]
async fn test_run_dispatches_queries() {
    let orchestrator = orchestrator(vec![Arc::new(vault())]).await;

    let report = orchestrator
        .run(
            Query::Movements {
                user: user(),
                kind: MovementKind::Deposit,
                from_block: FROM_BLOCK,
                to_block: TO_BLOCK,
            },
            &at_to_block(),
        )
        .await;
    match report.results[0].payload() {
        Some(QueryPayload::Movements(movements)) => {
            assert_eq!(movements.len(), 1);
            let leaf = &movements[0].tokens[0].children[0];
            assert_eq!(leaf.balance_raw, U256::from(10_500_000u64));
        }
        other => panic!("expected movements, got {:?}", other),
    }

    let report = orchestrator.run(Query::Unwrap, &at_to_block()).await;
    match report.results[0].payload() {
        Some(QueryPayload::Unwrap(rates)) => {
            assert_eq!(rates[0].tokens[0].underlying_rate_raw, U256::from(1_050_000u64));
        }
        other => panic!("expected unwrap rates, got {:?}", other),
    }

    let report = orchestrator
        .get_movements_report(user(), MovementKind::Deposit, TO_BLOCK, FROM_BLOCK, &at_to_block())
        .await;
    assert_eq!(report.results[0].failure_kind(), Some(FailureKind::InvalidInput));

    let withdrawals = orchestrator
        .get_withdrawals(user(), FROM_BLOCK, TO_BLOCK, &at_to_block())
        .await;
    assert!(withdrawals.is_empty());
}
