//! # RPC Transport
//!
//! The raw JSON-RPC seam under [`ChainEndpoint`](crate::chain_endpoint::ChainEndpoint)
//! and [`RpcBatcher`](crate::multicall::RpcBatcher). Production code uses
//! [`HttpTransport`] (an ethers `Provider<Http>`); tests plug in their own
//! implementation to count round trips and script failures.

use crate::chains::Chain;
use crate::error::EngineError;
use crate::multicall::decode_revert_reason;
use crate::types::BlockSelector;
use async_trait::async_trait;
use ethers::prelude::{Http, Middleware, Provider};
use ethers::providers::{ProviderError, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Filter, Log};
use log::debug;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::str::FromStr;
use url::Url;

/// Request header telling the RPC gateway it may silently reroute to a backup node.
pub const FAILOVER_HEADER: &str = "x-rpc-failover";

#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// `eth_call` at `block`.
    async fn call(&self, tx: &TypedTransaction, block: BlockSelector) -> Result<Bytes, EngineError>;

    /// `eth_blockNumber`
    async fn block_number(&self) -> Result<u64, EngineError>;

    /// `eth_getLogs`
    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, EngineError>;
}

/// JSON-RPC over HTTP via ethers.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    chain: Chain,
    provider: Provider<Http>,
}

impl HttpTransport {
    pub fn new(chain: Chain, url: &str, enable_failover: bool) -> Result<Self, EngineError> {
        let url = Url::parse(url)
            .map_err(|e| EngineError::Configuration(format!("invalid rpc url {}: {}", url, e)))?;

        let mut headers = HeaderMap::new();
        if enable_failover {
            let name = HeaderName::from_str(FAILOVER_HEADER)
                .map_err(|e| EngineError::Configuration(e.to_string()))?;
            headers.insert(name, HeaderValue::from_static("true"));
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| EngineError::Configuration(format!("http client: {}", e)))?;

        debug!(
            "HttpTransport for {} -> {} (failover: {})",
            chain,
            url.host_str().unwrap_or("?"),
            enable_failover
        );

        Ok(Self {
            chain,
            provider: Provider::new(Http::new_with_client(url, client)),
        })
    }

    fn map_error(&self, target: Option<Address>, err: ProviderError) -> EngineError {
        if let Some(response) = err.as_error_response() {
            if response.message.to_lowercase().contains("revert") {
                let reason = response
                    .data
                    .as_ref()
                    .and_then(|data| data.as_str())
                    .and_then(|hex_data| Bytes::from_str(hex_data).ok())
                    .map(|data| decode_revert_reason(&data))
                    .unwrap_or_else(|| response.message.clone());
                return EngineError::CallRevert {
                    target: target.unwrap_or_default(),
                    reason,
                };
            }
        }
        EngineError::Transport {
            chain: self.chain,
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn call(&self, tx: &TypedTransaction, block: BlockSelector) -> Result<Bytes, EngineError> {
        self.provider
            .call(tx, Some(block.block_id()))
            .await
            .map_err(|e| self.map_error(tx.to_addr().copied(), e))
    }

    async fn block_number(&self) -> Result<u64, EngineError> {
        self.provider
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| self.map_error(None, e))
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, EngineError> {
        self.provider
            .get_logs(filter)
            .await
            .map_err(|e| self.map_error(None, e))
    }
}
