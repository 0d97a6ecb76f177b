//! # Chain Endpoint
//!
//! One per chain. Wraps an [`RpcTransport`] with a hard per-call timeout, a bounded
//! linear retry on transient failures, and routing between the direct path and the
//! chain's [`RpcBatcher`].
//!
//! Routing rule: a request carrying a `from` address always goes directly to the
//! transport; anonymous reads go through the batcher when batching is enabled for
//! the chain, otherwise direct.

use crate::chains::Chain;
use crate::error::{EngineError, Result};
use crate::metrics::{RpcMetrics, RpcMetricsSnapshot};
use crate::multicall::{Call, RpcBatcher};
use crate::settings::ResolvedChainSettings;
use crate::transport::{HttpTransport, RpcTransport};
use crate::types::BlockSelector;
use crate::utils::create_block_chunks;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Filter, Log, TransactionRequest};
use log::{debug, info};
use std::future::Future;
use std::sync::Arc;
use tokio_retry::RetryIf;

/// A read-only contract call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    /// Authenticated sender. Presence forces the direct path.
    pub from: Option<Address>,
    pub to: Address,
    pub data: Bytes,
    pub block: BlockSelector,
    pub allow_failure: bool,
}

impl CallRequest {
    pub fn new(to: Address, data: impl Into<Bytes>) -> Self {
        Self {
            from: None,
            to,
            data: data.into(),
            block: BlockSelector::Latest,
            allow_failure: true,
        }
    }

    pub fn at_block(mut self, block: impl Into<BlockSelector>) -> Self {
        self.block = block.into();
        self
    }

    pub fn from(mut self, from: Address) -> Self {
        self.from = Some(from);
        self
    }
}

pub struct ChainEndpoint {
    chain: Chain,
    transport: Arc<dyn RpcTransport>,
    batcher: Option<RpcBatcher>,
    settings: ResolvedChainSettings,
    metrics: Arc<RpcMetrics>,
}

impl ChainEndpoint {
    /// Builds an HTTP-backed endpoint from resolved settings.
    pub fn from_settings(settings: ResolvedChainSettings) -> Result<Self> {
        let transport =
            HttpTransport::new(settings.chain, &settings.rpc_url, settings.enable_failover)?;
        Ok(Self::new(settings, Arc::new(transport)))
    }

    pub fn new(settings: ResolvedChainSettings, transport: Arc<dyn RpcTransport>) -> Self {
        let chain = settings.chain;
        let metrics = Arc::new(RpcMetrics::new(chain));
        let batcher = settings.enable_batching.then(|| {
            RpcBatcher::new(
                chain,
                transport.clone(),
                settings.multicall_address,
                settings.batch_policy,
                metrics.clone(),
            )
        });

        info!(
            "ChainEndpoint {} ready (batching: {}, max_batch_size: {}, timeout: {:?}, retries: {}, failover: {})",
            chain,
            settings.enable_batching,
            settings.batch_policy.max_batch_size,
            settings.call_timeout,
            settings.max_retries,
            settings.enable_failover
        );

        Self {
            chain,
            transport,
            batcher,
            settings,
            metrics,
        }
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn settings(&self) -> &ResolvedChainSettings {
        &self.settings
    }

    pub fn batcher(&self) -> Option<&RpcBatcher> {
        self.batcher.as_ref()
    }

    pub fn metrics(&self) -> RpcMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Executes `request` with timeout and retry. A retried batched call re-enters
    /// the batcher as a new call.
    pub async fn call(&self, request: CallRequest) -> Result<Bytes> {
        let request = &request;
        self.with_retry(move || self.dispatch(request)).await
    }

    /// Chain head minus the chain's reorg safety margin.
    pub async fn get_latest_stable_block(&self) -> Result<u64> {
        let head = self
            .with_retry(move || self.transport.block_number())
            .await?;
        let stable = head.saturating_sub(self.chain.stable_block_margin());
        debug!("{} head {} -> stable block {}", self.chain, head, stable);
        Ok(stable)
    }

    /// Logs matching `filter` in `from_block..=to_block`, fetched in chunks of at most
    /// `max_logs_block_range` blocks and returned in block order.
    pub async fn get_logs_in_range(
        &self,
        filter: &Filter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>> {
        if from_block > to_block {
            return Err(EngineError::InvalidInput(format!(
                "log range start {} is after end {}",
                from_block, to_block
            )));
        }

        let mut logs = Vec::new();
        for (start, end) in
            create_block_chunks(from_block, to_block, self.settings.max_logs_block_range)
        {
            let chunk_filter = filter.clone().from_block(start).to_block(end);
            let chunk_filter = &chunk_filter;
            let chunk = self
                .with_retry(move || self.transport.get_logs(chunk_filter))
                .await?;
            debug!(
                "{} getLogs {}..={} returned {} logs",
                self.chain,
                start,
                end,
                chunk.len()
            );
            logs.extend(chunk);
        }
        Ok(logs)
    }

    async fn dispatch(&self, request: &CallRequest) -> Result<Bytes> {
        match (&self.batcher, request.from) {
            (Some(batcher), None) => {
                let call = Call {
                    target: request.to,
                    call_data: request.data.clone(),
                    allow_failure: request.allow_failure,
                };
                batcher.enqueue(call, request.block).await
            }
            _ => self.direct_call(request).await,
        }
    }

    async fn direct_call(&self, request: &CallRequest) -> Result<Bytes> {
        let mut tx = TransactionRequest::new()
            .to(request.to)
            .data(request.data.clone());
        if let Some(from) = request.from {
            tx = tx.from(from);
        }
        let tx: TypedTransaction = tx.into();

        self.metrics.record_direct_call();
        let result = self.transport.call(&tx, request.block).await;
        if let Err(EngineError::CallRevert { .. }) = &result {
            self.metrics.record_call_revert();
        }
        result
    }

    /// Runs `op` under the per-call timeout, retrying transient failures with linearly
    /// growing delays (`retry_delay`, `2 * retry_delay`, ...) up to `max_retries` times.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let chain = self.chain;
        let timeout = self.settings.call_timeout;
        let delay = self.settings.retry_delay;
        let metrics = &self.metrics;
        let strategy = (1..=self.settings.max_retries).map(move |n| delay * n);

        let mut attempt = 0u32;
        RetryIf::start(
            strategy,
            move || {
                attempt += 1;
                if attempt > 1 {
                    debug!("{} retry attempt {}", chain, attempt - 1);
                    metrics.record_retry();
                }
                let fut = op();
                async move {
                    match tokio::time::timeout(timeout, fut).await {
                        Ok(result) => result,
                        Err(_) => {
                            metrics.record_timeout();
                            Err(EngineError::Timeout {
                                chain,
                                after_ms: timeout.as_millis() as u64,
                            })
                        }
                    }
                }
            },
            |err: &EngineError| err.is_transient(),
        )
        .await
    }
}
