use crate::chains::Chain;
use crate::error::EngineError;
use crate::types::conversions::parse_address;
use config::{Config, ConfigError, Environment, File, FileFormat};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Canonical Multicall3 deployment (same address on every supported chain).
pub const MULTICALL3_ADDRESS: &str = "0xcA11bde05977b3631167028862bE2a173976CA11";

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Values every chain inherits unless its own `[chains.<name>]` table overrides them.
#[derive(Debug, Deserialize, Clone)]
pub struct ChainDefaults {
    #[serde(default = "default_true")]
    pub enable_batching: bool,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_false")]
    pub enable_failover: bool,
    #[serde(default = "default_multicall_address")]
    pub multicall_address: String,
    #[serde(default = "default_max_logs_block_range")]
    pub max_logs_block_range: u64,
}

fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_max_batch_size() -> usize {
    100
}
fn default_flush_timeout_ms() -> u64 {
    10
}
fn default_call_timeout_ms() -> u64 {
    10_000
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_delay_ms() -> u64 {
    250
}
fn default_multicall_address() -> String {
    MULTICALL3_ADDRESS.to_string()
}
fn default_max_logs_block_range() -> u64 {
    10_000
}

impl Default for ChainDefaults {
    fn default() -> Self {
        Self {
            enable_batching: default_true(),
            max_batch_size: default_max_batch_size(),
            flush_timeout_ms: default_flush_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            enable_failover: default_false(),
            multicall_address: default_multicall_address(),
            max_logs_block_range: default_max_logs_block_range(),
        }
    }
}

/// Per-chain overrides. Every field is optional and falls back to [`ChainDefaults`].
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ChainSettings {
    #[serde(default)]
    pub rpc_url: Option<String>,
    #[serde(default)]
    pub enable_batching: Option<bool>,
    #[serde(default)]
    pub max_batch_size: Option<usize>,
    #[serde(default)]
    pub flush_timeout_ms: Option<u64>,
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub enable_failover: Option<bool>,
    #[serde(default)]
    pub multicall_address: Option<String>,
    #[serde(default)]
    pub max_logs_block_range: Option<u64>,
}

/// Size and time flush triggers for one chain's pending call groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub max_batch_size: usize,
    pub flush_timeout: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            flush_timeout: Duration::from_millis(default_flush_timeout_ms()),
        }
    }
}

/// Immutable per-chain view, read once when a `ChainEndpoint` is built.
#[derive(Debug, Clone)]
pub struct ResolvedChainSettings {
    pub chain: Chain,
    pub rpc_url: String,
    pub enable_batching: bool,
    pub batch_policy: BatchPolicy,
    pub call_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub enable_failover: bool,
    pub multicall_address: Address,
    pub max_logs_block_range: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub defaults: ChainDefaults,
    #[serde(default)]
    pub chains: HashMap<Chain, ChainSettings>,
}

impl Settings {
    /// Loads `Config.toml` (optional), then `DEFI__*` structured env overrides, then the
    /// `DEFI_RPC_<CHAIN>` provider URL shortcuts. `.env` is honoured.
    pub fn new() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let s = Config::builder()
            .add_source(File::with_name("Config.toml").required(false))
            .add_source(
                Environment::with_prefix("DEFI")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        settings.apply_rpc_env_overrides();
        Ok(settings)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize()
    }

    /// Structured override, e.g. for embedding the SDK without a config file.
    pub fn with_rpc_url(mut self, chain: Chain, url: impl Into<String>) -> Self {
        self.chains.entry(chain).or_default().rpc_url = Some(url.into());
        self
    }

    pub fn with_chain(mut self, chain: Chain, chain_settings: ChainSettings) -> Self {
        self.chains.insert(chain, chain_settings);
        self
    }

    fn apply_rpc_env_overrides(&mut self) {
        for chain in Chain::ALL {
            let key = format!("DEFI_RPC_{}", chain.as_str().to_uppercase());
            if let Ok(url) = env::var(&key) {
                let trimmed = url.trim();
                if !trimmed.is_empty() {
                    self.chains.entry(chain).or_default().rpc_url = Some(trimmed.to_string());
                }
            }
        }
    }

    /// Chains with a provider URL.
    pub fn configured_chains(&self) -> Vec<Chain> {
        let mut chains: Vec<Chain> = self
            .chains
            .iter()
            .filter(|(_, c)| c.rpc_url.is_some())
            .map(|(chain, _)| *chain)
            .collect();
        chains.sort();
        chains
    }

    /// Fail-fast validation of construction-time values.
    ///
    /// A missing `rpc_url` is not an error here; it only fails that chain's units.
    pub fn validate(&self) -> Result<(), EngineError> {
        for chain in Chain::ALL {
            self.resolve_values(chain)?;
        }
        Ok(())
    }

    /// Immutable settings for `chain`, or `Configuration` if it has no provider URL.
    pub fn resolve(&self, chain: Chain) -> Result<ResolvedChainSettings, EngineError> {
        let (rpc_url, resolved) = self.resolve_values(chain)?;
        let rpc_url = rpc_url.ok_or_else(|| {
            EngineError::Configuration(format!(
                "no RPC provider URL configured for chain {} (set DEFI_RPC_{})",
                chain,
                chain.as_str().to_uppercase()
            ))
        })?;
        Ok(ResolvedChainSettings { rpc_url, ..resolved })
    }

    fn resolve_values(
        &self,
        chain: Chain,
    ) -> Result<(Option<String>, ResolvedChainSettings), EngineError> {
        let d = &self.defaults;
        let overrides = self.chains.get(&chain).cloned().unwrap_or_default();

        let max_batch_size = overrides.max_batch_size.unwrap_or(d.max_batch_size);
        let flush_timeout_ms = overrides.flush_timeout_ms.unwrap_or(d.flush_timeout_ms);
        let call_timeout_ms = overrides.call_timeout_ms.unwrap_or(d.call_timeout_ms);
        let max_logs_block_range = overrides
            .max_logs_block_range
            .unwrap_or(d.max_logs_block_range);

        if max_batch_size == 0 {
            return Err(invalid(chain, "max_batch_size must be greater than zero"));
        }
        if flush_timeout_ms == 0 {
            return Err(invalid(chain, "flush_timeout_ms must be greater than zero"));
        }
        if call_timeout_ms == 0 {
            return Err(invalid(chain, "call_timeout_ms must be greater than zero"));
        }
        if max_logs_block_range == 0 {
            return Err(invalid(chain, "max_logs_block_range must be greater than zero"));
        }

        let multicall_raw = overrides
            .multicall_address
            .clone()
            .unwrap_or_else(|| d.multicall_address.clone());
        let multicall_address = parse_address(&multicall_raw)
            .map_err(|e| invalid(chain, &format!("multicall_address: {}", e)))?;

        if let Some(url) = &overrides.rpc_url {
            url::Url::parse(url).map_err(|e| invalid(chain, &format!("rpc_url {}: {}", url, e)))?;
        }

        let resolved = ResolvedChainSettings {
            chain,
            rpc_url: String::new(),
            enable_batching: overrides.enable_batching.unwrap_or(d.enable_batching),
            batch_policy: BatchPolicy {
                max_batch_size,
                flush_timeout: Duration::from_millis(flush_timeout_ms),
            },
            call_timeout: Duration::from_millis(call_timeout_ms),
            max_retries: overrides.max_retries.unwrap_or(d.max_retries),
            retry_delay: Duration::from_millis(
                overrides.retry_delay_ms.unwrap_or(d.retry_delay_ms),
            ),
            enable_failover: overrides.enable_failover.unwrap_or(d.enable_failover),
            multicall_address,
            max_logs_block_range,
        };
        Ok((overrides.rpc_url, resolved))
    }
}

fn invalid(chain: Chain, message: &str) -> EngineError {
    EngineError::Configuration(format!("[chains.{}] {}", chain, message))
}
