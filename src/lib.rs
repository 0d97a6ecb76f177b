//! # DeFi Portfolio SDK
//!
//! A Rust library for reading DeFi positions across protocols and EVM chains, valuing
//! them in USD and attributing profit over a block window.
//!
//! ## Overview
//!
//! The SDK separates the read infrastructure (batched RPC, retries, failover) from the
//! protocol logic, which lives behind the [`ProtocolAdapter`] trait. It focuses on:
//!
//! - **Batching**: Concurrent contract reads folded into Multicall3 `aggregate3` calls
//! - **Resolution**: Protocol tokens unwrapped recursively down to priced leaves
//! - **Attribution**: Profit per position from two snapshots and the movements between
//! - **Orchestration**: One isolated unit of work per (chain, protocol, product)
//!
//! ## Architecture
//!
//! ### RPC Layer
//! A [`ChainEndpoint`] per chain applies timeouts and linear retries and routes
//! anonymous reads through the chain's [`RpcBatcher`].
//!
//! ### Adapter Layer
//! Adapters translate protocol contracts into token trees. The [`AdapterRegistry`]
//! indexes them by key and by protocol token.
//!
//! ### Valuation Layer
//! The [`TokenTreeResolver`] expands and prices token trees, [`ProfitAttributor`]
//! computes profit and the yield estimators annualize it.
//!
//! ### Orchestration Layer
//! [`TaskOrchestrator`] fans a query out over the selected adapters and returns one
//! [`TaskResult`] per unit.

// Core Types
/// Common types and data structures
pub mod types;
/// Error taxonomy
pub mod error;
/// 18-decimal signed fixed-point arithmetic
pub mod fixed_point;
/// Supported chains and per-chain constants
pub mod chains;

// RPC Layer
/// Raw JSON-RPC transport seam
pub mod transport;
/// Multicall3 batching
pub mod multicall;
/// Per-chain endpoint with timeout, retry and routing
pub mod chain_endpoint;

// Adapter Layer
/// Trait for protocol adapters
pub mod protocol_adapter;
/// Adapter lookup and protocol token index
pub mod adapter_registry;
/// Key-value caching
pub mod cache;

// Valuation Layer
/// Token tree unwrapping and pricing
pub mod token_resolver;
/// Profit attribution between two snapshots
pub mod profit;
/// APR / APY estimation
pub mod yield_estimator;

// Orchestration Layer
/// Query fan-out over adapters
pub mod orchestrator;
/// Per-unit results and run reports
pub mod task_result;

// Infrastructure
/// Configuration management
pub mod settings;
/// RPC and run counters
pub mod metrics;
/// Logging bootstrap
pub mod telemetry;
/// General utilities
pub mod utils;

// Re-exports for convenience
pub use adapter_registry::AdapterRegistry;
pub use chain_endpoint::{CallRequest, ChainEndpoint};
pub use chains::Chain;
pub use error::{EngineError, FailureKind};
pub use fixed_point::FixedPointDecimal;
pub use multicall::RpcBatcher;
pub use orchestrator::{ProfitWindow, Query, QueryFilters, TaskOrchestrator};
pub use profit::{PositionProfit, ProfitAttributor};
pub use protocol_adapter::{AdapterMetadata, ProtocolAdapter};
pub use settings::Settings;
pub use task_result::{RunReport, TaskOutcome, TaskResult};
pub use token_resolver::TokenTreeResolver;
pub use yield_estimator::{estimate_yield, YieldEstimate};
