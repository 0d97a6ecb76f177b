// src/metrics.rs
//
// Metrics are context objects, not process globals: each `ChainEndpoint` owns an
// `RpcMetrics`, each orchestration run owns a `RunMetrics`, and tests assert on them
// directly. With the `observability` feature every increment is mirrored into the
// `metrics` crate for Prometheus-style export.

use crate::chains::Chain;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[cfg(feature = "observability")]
fn mirror(name: &'static str, chain: Option<Chain>, value: u64) {
    match chain {
        Some(chain) => ::metrics::counter!(name, value, "chain" => chain.to_string()),
        None => ::metrics::counter!(name, value),
    }
}

#[cfg(not(feature = "observability"))]
fn mirror(_name: &'static str, _chain: Option<Chain>, _value: u64) {}

/// Per-chain RPC counters shared by a `ChainEndpoint` and its `RpcBatcher`.
#[derive(Debug)]
pub struct RpcMetrics {
    chain: Chain,
    direct_calls: AtomicU64,
    batched_calls: AtomicU64,
    batches_flushed: AtomicU64,
    batch_failures: AtomicU64,
    largest_batch: AtomicU64,
    call_reverts: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RpcMetricsSnapshot {
    pub direct_calls: u64,
    pub batched_calls: u64,
    pub batches_flushed: u64,
    pub batch_failures: u64,
    pub largest_batch: u64,
    pub call_reverts: u64,
    pub retries: u64,
    pub timeouts: u64,
}

impl RpcMetrics {
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            direct_calls: AtomicU64::new(0),
            batched_calls: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            batch_failures: AtomicU64::new(0),
            largest_batch: AtomicU64::new(0),
            call_reverts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn record_direct_call(&self) {
        self.direct_calls.fetch_add(1, Ordering::Relaxed);
        mirror("rpc_direct_calls_total", Some(self.chain), 1);
    }

    pub fn record_batch_flush(&self, size: usize) {
        let size = size as u64;
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.batched_calls.fetch_add(size, Ordering::Relaxed);
        self.largest_batch.fetch_max(size, Ordering::Relaxed);
        mirror("rpc_batches_flushed_total", Some(self.chain), 1);
        mirror("rpc_batched_calls_total", Some(self.chain), size);
    }

    pub fn record_batch_failure(&self) {
        self.batch_failures.fetch_add(1, Ordering::Relaxed);
        mirror("rpc_batch_failures_total", Some(self.chain), 1);
    }

    pub fn record_call_revert(&self) {
        self.call_reverts.fetch_add(1, Ordering::Relaxed);
        mirror("rpc_call_reverts_total", Some(self.chain), 1);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        mirror("rpc_retries_total", Some(self.chain), 1);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        mirror("rpc_timeouts_total", Some(self.chain), 1);
    }

    pub fn snapshot(&self) -> RpcMetricsSnapshot {
        RpcMetricsSnapshot {
            direct_calls: self.direct_calls.load(Ordering::Relaxed),
            batched_calls: self.batched_calls.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batch_failures: self.batch_failures.load(Ordering::Relaxed),
            largest_batch: self.largest_batch.load(Ordering::Relaxed),
            call_reverts: self.call_reverts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

impl RpcMetricsSnapshot {
    /// Traffic between two snapshots of the same counters. `largest_batch` is kept
    /// from `self` since a maximum cannot be differenced.
    pub fn since(&self, earlier: &RpcMetricsSnapshot) -> RpcMetricsSnapshot {
        RpcMetricsSnapshot {
            direct_calls: self.direct_calls.saturating_sub(earlier.direct_calls),
            batched_calls: self.batched_calls.saturating_sub(earlier.batched_calls),
            batches_flushed: self.batches_flushed.saturating_sub(earlier.batches_flushed),
            batch_failures: self.batch_failures.saturating_sub(earlier.batch_failures),
            largest_batch: self.largest_batch,
            call_reverts: self.call_reverts.saturating_sub(earlier.call_reverts),
            retries: self.retries.saturating_sub(earlier.retries),
            timeouts: self.timeouts.saturating_sub(earlier.timeouts),
        }
    }
}

/// Counters scoped to a single orchestration run.
///
/// RPC figures are the difference between endpoint snapshots taken at the start and
/// end of the run; runs executing concurrently against the same endpoints see each
/// other's traffic.
#[derive(Debug, Default)]
pub struct RunMetrics {
    units_started: AtomicU64,
    units_failed: AtomicU64,
    unwrap_memo_hits: AtomicU64,
    unwrap_memo_misses: AtomicU64,
    unmatched_profit_tokens: AtomicU64,
    rpc: Mutex<BTreeMap<Chain, RpcMetricsSnapshot>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunMetricsSnapshot {
    pub units_started: u64,
    pub units_failed: u64,
    pub unwrap_memo_hits: u64,
    pub unwrap_memo_misses: u64,
    pub unmatched_profit_tokens: u64,
    pub rpc: BTreeMap<Chain, RpcMetricsSnapshot>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_unit_started(&self) {
        self.units_started.fetch_add(1, Ordering::Relaxed);
        mirror("orchestrator_units_total", None, 1);
    }

    pub fn record_unit_failed(&self) {
        self.units_failed.fetch_add(1, Ordering::Relaxed);
        mirror("orchestrator_unit_failures_total", None, 1);
    }

    pub fn record_memo_hit(&self) {
        self.unwrap_memo_hits.fetch_add(1, Ordering::Relaxed);
        mirror("unwrap_memo_hits_total", None, 1);
    }

    pub fn record_memo_miss(&self) {
        self.unwrap_memo_misses.fetch_add(1, Ordering::Relaxed);
        mirror("unwrap_memo_misses_total", None, 1);
    }

    /// A token present in only one of the two profit snapshots.
    pub fn record_unmatched_profit_tokens(&self, count: u64) {
        if count > 0 {
            self.unmatched_profit_tokens
                .fetch_add(count, Ordering::Relaxed);
            mirror("profit_unmatched_tokens_total", None, count);
        }
    }

    pub fn record_rpc(&self, chain: Chain, delta: RpcMetricsSnapshot) {
        if let Ok(mut rpc) = self.rpc.lock() {
            rpc.insert(chain, delta);
        }
    }

    pub fn snapshot(&self) -> RunMetricsSnapshot {
        RunMetricsSnapshot {
            units_started: self.units_started.load(Ordering::Relaxed),
            units_failed: self.units_failed.load(Ordering::Relaxed),
            unwrap_memo_hits: self.unwrap_memo_hits.load(Ordering::Relaxed),
            unwrap_memo_misses: self.unwrap_memo_misses.load(Ordering::Relaxed),
            unmatched_profit_tokens: self.unmatched_profit_tokens.load(Ordering::Relaxed),
            rpc: self
                .rpc
                .lock()
                .map(|rpc| rpc.clone())
                .unwrap_or_default(),
        }
    }
}
