// src/adapter_registry.rs
//
// Adapters are registered up front, then `index_protocol_tokens` asks each one for
// its protocol tokens so nested tokens met while unwrapping can be routed to the
// adapter that owns them.

use crate::cache::{cache_aside, KeyValueCache};
use crate::chains::Chain;
use crate::error::{EngineError, Result};
use crate::protocol_adapter::{AdapterKey, ProtocolAdapter, ProtocolToken};
use ethers::types::Address;
use indexmap::IndexMap;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: IndexMap<AdapterKey, Arc<dyn ProtocolAdapter>>,
    token_index: HashMap<(Chain, Address), AdapterKey>,
    price_adapters: HashMap<Chain, Arc<dyn ProtocolAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a protocol adapter. Fails on a duplicate `(chain, protocol, product)`.
    pub fn register(&mut self, adapter: Arc<dyn ProtocolAdapter>) -> Result<()> {
        let key = adapter.metadata().key();
        if self.adapters.contains_key(&key) {
            return Err(EngineError::Configuration(format!(
                "adapter {} registered twice",
                key
            )));
        }
        debug!("Registered adapter {}", key);
        self.adapters.insert(key, adapter);
        Ok(())
    }

    /// Sets the adapter used to price leaf tokens on its chain.
    pub fn register_price_adapter(&mut self, adapter: Arc<dyn ProtocolAdapter>) {
        let chain = adapter.metadata().chain;
        if self.price_adapters.insert(chain, adapter).is_some() {
            warn!("Replaced price adapter for {}", chain);
        }
    }

    /// Loads every adapter's protocol tokens, through `cache` when one is injected.
    ///
    /// An adapter whose token list cannot be loaded is skipped with a warning; its
    /// tokens will simply not be unwrapped when met nested inside other positions.
    pub async fn index_protocol_tokens(&mut self, cache: Option<&dyn KeyValueCache>) -> usize {
        let mut indexed = 0;
        for (key, adapter) in &self.adapters {
            let loaded = match cache {
                Some(cache) => {
                    let cache_key = format!("protocol-tokens:{}", key);
                    cache_aside(cache, &cache_key, || adapter.get_protocol_tokens()).await
                }
                None => adapter.get_protocol_tokens().await,
            };

            let tokens: Vec<ProtocolToken> = match loaded {
                Ok(tokens) => tokens,
                Err(e) => {
                    warn!("Could not load protocol tokens for {}: {}", key, e);
                    continue;
                }
            };

            for token in tokens {
                if let Some(previous) = self
                    .token_index
                    .insert((key.chain, token.token.address), key.clone())
                {
                    if &previous != key {
                        warn!(
                            "Protocol token {:?} claimed by {} and {}",
                            token.token.address, previous, key
                        );
                    }
                }
                indexed += 1;
            }
        }
        info!(
            "Indexed {} protocol tokens across {} adapters",
            indexed,
            self.adapters.len()
        );
        indexed
    }

    pub fn get(&self, key: &AdapterKey) -> Option<Arc<dyn ProtocolAdapter>> {
        self.adapters.get(key).cloned()
    }

    /// Adapter owning `token` on `chain`, if any.
    pub fn adapter_for_token(&self, chain: Chain, token: Address) -> Option<Arc<dyn ProtocolAdapter>> {
        self.token_index
            .get(&(chain, token))
            .and_then(|key| self.adapters.get(key))
            .cloned()
    }

    pub fn price_adapter(&self, chain: Chain) -> Option<Arc<dyn ProtocolAdapter>> {
        self.price_adapters.get(&chain).cloned()
    }

    /// Registered adapters in registration order.
    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn ProtocolAdapter>> {
        self.adapters.values()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
