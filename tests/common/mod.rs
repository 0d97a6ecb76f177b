//! Shared fixtures for the integration tests: a scriptable RPC transport and a few
//! in-memory protocol adapters.

#![allow(dead_code)]

use async_trait::async_trait;
use defi_portfolio_sdk::chain_endpoint::ChainEndpoint;
use defi_portfolio_sdk::chains::Chain;
use defi_portfolio_sdk::error::{EngineError, Result};
use defi_portfolio_sdk::fixed_point::FixedPointDecimal;
use defi_portfolio_sdk::multicall::{aggregate3_function, decode_revert_reason};
use defi_portfolio_sdk::protocol_adapter::{AdapterMetadata, ProtocolAdapter, ProtocolToken};
use defi_portfolio_sdk::settings::{ChainSettings, ResolvedChainSettings, Settings};
use defi_portfolio_sdk::transport::RpcTransport;
use defi_portfolio_sdk::types::{
    BlockSelector, Movement, MovementKind, PositionType, TokenMetadata, TokenNode, TokenType,
    UnderlyingRate, UnwrapExchangeRate,
};
use ethers::abi::Token;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Filter, Log, H256, U256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Answers one inner call: `Ok(return data)` or `Err(revert data)`.
pub type CallHandler = Box<dyn Fn(Address, &[u8]) -> std::result::Result<Vec<u8>, Vec<u8>> + Send + Sync>;

/// Call data starting with this byte reverts with `Error("boom")`.
pub const REVERT_MARKER: u8 = 0xde;

pub fn error_string(reason: &str) -> Vec<u8> {
    let mut data = vec![0x08, 0xc3, 0x79, 0xa0];
    data.extend(ethers::abi::encode(&[Token::String(reason.to_string())]));
    data
}

fn echo_or_revert(_target: Address, data: &[u8]) -> std::result::Result<Vec<u8>, Vec<u8>> {
    if data.first() == Some(&REVERT_MARKER) {
        Err(error_string("boom"))
    } else {
        Ok(data.to_vec())
    }
}

/// In-memory `RpcTransport`. Aggregate3 requests are decoded and answered per inner
/// call through the handler, so batching behaviour can be asserted end to end.
pub struct MockTransport {
    handler: CallHandler,
    latency: Option<Duration>,
    head: AtomicU64,
    fail_next: AtomicUsize,
    short_responses: AtomicBool,
    pub aggregate_calls: AtomicUsize,
    pub direct_calls: AtomicUsize,
    pub batch_sizes: Mutex<Vec<usize>>,
    pub senders: Mutex<Vec<Option<Address>>>,
    pub log_ranges: Mutex<Vec<(u64, u64)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            handler: Box::new(echo_or_revert),
            latency: None,
            head: AtomicU64::new(0),
            fail_next: AtomicUsize::new(0),
            short_responses: AtomicBool::new(false),
            aggregate_calls: AtomicUsize::new(0),
            direct_calls: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
            log_ranges: Mutex::new(Vec::new()),
        }
    }

    pub fn with_handler(mut self, handler: CallHandler) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_head(self, head: u64) -> Self {
        self.head.store(head, Ordering::SeqCst);
        self
    }

    /// The next `n` requests fail with a transport error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Aggregate responses drop their last result.
    pub fn short_responses(&self, enabled: bool) {
        self.short_responses.store(enabled, Ordering::SeqCst);
    }

    pub fn aggregate_calls(&self) -> usize {
        self.aggregate_calls.load(Ordering::SeqCst)
    }

    pub fn direct_calls(&self) -> usize {
        self.direct_calls.load(Ordering::SeqCst)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn answer_aggregate(&self, payload: &[u8]) -> Result<Bytes> {
        self.aggregate_calls.fetch_add(1, Ordering::SeqCst);
        let decoded = aggregate3_function()
            .decode_input(payload)
            .map_err(|e| EngineError::InvalidCall(e.to_string()))?;
        let calls = decoded
            .into_iter()
            .next()
            .and_then(Token::into_array)
            .unwrap_or_default();

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            if let Token::Tuple(fields) = call {
                if let [Token::Address(target), Token::Bool(_), Token::Bytes(data)] = fields.as_slice() {
                    let (success, output) = match (self.handler)(*target, data) {
                        Ok(output) => (true, output),
                        Err(revert) => (false, revert),
                    };
                    results.push(Token::Tuple(vec![Token::Bool(success), Token::Bytes(output)]));
                }
            }
        }
        self.batch_sizes.lock().unwrap().push(results.len());
        if self.short_responses.load(Ordering::SeqCst) {
            results.pop();
        }
        Ok(Bytes::from(ethers::abi::encode(&[Token::Array(results)])))
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn call(&self, tx: &TypedTransaction, _block: BlockSelector) -> Result<Bytes> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.take_failure() {
            return Err(EngineError::Transport {
                chain: Chain::Ethereum,
                message: "connection reset by peer".to_string(),
            });
        }

        let target = tx.to_addr().copied().unwrap_or_default();
        let data = tx.data().cloned().unwrap_or_default();
        if data.len() >= 4 && data[..4] == aggregate3_function().short_signature() {
            return self.answer_aggregate(&data[4..]);
        }

        self.direct_calls.fetch_add(1, Ordering::SeqCst);
        self.senders.lock().unwrap().push(tx.from().copied());
        match (self.handler)(target, &data) {
            Ok(output) => Ok(Bytes::from(output)),
            Err(revert) => Err(EngineError::CallRevert {
                target,
                reason: decode_revert_reason(&revert),
            }),
        }
    }

    async fn block_number(&self) -> Result<u64> {
        if self.take_failure() {
            return Err(EngineError::Transport {
                chain: Chain::Ethereum,
                message: "connection reset by peer".to_string(),
            });
        }
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>> {
        let from = filter.get_from_block().map(|b| b.as_u64()).unwrap_or_default();
        let to = filter.get_to_block().map(|b| b.as_u64()).unwrap_or_default();
        self.log_ranges.lock().unwrap().push((from, to));
        Ok(vec![Log {
            block_number: Some(from.into()),
            ..Default::default()
        }])
    }
}

/// Resolved settings for `chain` with a local provider URL and `configure` applied.
pub fn chain_settings(chain: Chain, configure: impl FnOnce(&mut ChainSettings)) -> ResolvedChainSettings {
    let mut overrides = ChainSettings {
        rpc_url: Some("http://localhost:8545".to_string()),
        ..Default::default()
    };
    configure(&mut overrides);
    Settings::default()
        .with_chain(chain, overrides)
        .resolve(chain)
        .expect("test settings should resolve")
}

pub fn endpoint(transport: Arc<MockTransport>) -> Arc<ChainEndpoint> {
    Arc::new(ChainEndpoint::new(
        chain_settings(Chain::Ethereum, |_| {}),
        transport,
    ))
}

pub fn token(byte: u8, symbol: &str, decimals: u8) -> TokenMetadata {
    TokenMetadata::new(Address::repeat_byte(byte), symbol, symbol, decimals)
}

pub fn units(whole: u64, decimals: u8) -> U256 {
    U256::from(whole) * U256::exp10(decimals as usize)
}

pub fn user() -> Address {
    Address::repeat_byte(0xaa)
}

/// ERC-4626 style vault: one protocol token over one underlying, with scripted
/// balances and exchange rates per block.
pub struct VaultAdapter {
    metadata: AdapterMetadata,
    pub share: TokenMetadata,
    pub asset: TokenMetadata,
    balances: HashMap<u64, U256>,
    latest_balance: U256,
    rates: HashMap<u64, U256>,
    default_rate: U256,
    movements: Vec<Movement>,
    pub unwrap_calls: AtomicUsize,
}

impl VaultAdapter {
    pub fn new(protocol_id: &str, share: TokenMetadata, asset: TokenMetadata) -> Self {
        let default_rate = U256::exp10(asset.decimals as usize);
        Self {
            metadata: AdapterMetadata::new(protocol_id, "vault", Chain::Ethereum, PositionType::Supply),
            share,
            asset,
            balances: HashMap::new(),
            latest_balance: U256::zero(),
            rates: HashMap::new(),
            default_rate,
            movements: Vec::new(),
            unwrap_calls: AtomicUsize::new(0),
        }
    }

    pub fn on_chain(mut self, chain: Chain) -> Self {
        self.metadata.chain = chain;
        self
    }

    pub fn balance_at(mut self, block: u64, raw: U256) -> Self {
        self.balances.insert(block, raw);
        self
    }

    pub fn latest_balance(mut self, raw: U256) -> Self {
        self.latest_balance = raw;
        self
    }

    /// Underlying base units per whole share at `block`.
    pub fn rate_at(mut self, block: u64, raw: U256) -> Self {
        self.rates.insert(block, raw);
        self
    }

    pub fn movement(mut self, kind: MovementKind, block: u64, shares: U256) -> Self {
        self.movements.push(Movement {
            kind,
            protocol_token: self.share.clone(),
            tokens: vec![TokenNode::new(self.share.clone(), TokenType::Protocol, shares)],
            block_number: block,
            transaction_hash: H256::from_low_u64_be(block),
        });
        self
    }

    fn movements_of(&self, kind: MovementKind, from_block: u64, to_block: u64) -> Vec<Movement> {
        self.movements
            .iter()
            .filter(|m| m.kind == kind && m.block_number >= from_block && m.block_number <= to_block)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ProtocolAdapter for VaultAdapter {
    fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    async fn get_protocol_tokens(&self) -> Result<Vec<ProtocolToken>> {
        Ok(vec![ProtocolToken {
            token: self.share.clone(),
            underlying_tokens: vec![self.asset.clone()],
        }])
    }

    async fn get_positions(
        &self,
        _user: Address,
        block: Option<u64>,
        protocol_token_filter: Option<&[Address]>,
    ) -> Result<Vec<TokenNode>> {
        if let Some(filter) = protocol_token_filter {
            if !filter.contains(&self.share.address) {
                return Ok(Vec::new());
            }
        }
        let balance = match block {
            Some(block) => self.balances.get(&block).copied().unwrap_or_default(),
            None => self.latest_balance,
        };
        if balance.is_zero() {
            return Ok(Vec::new());
        }
        Ok(vec![TokenNode::new(self.share.clone(), TokenType::Protocol, balance)])
    }

    async fn get_deposits(&self, _user: Address, from_block: u64, to_block: u64) -> Result<Vec<Movement>> {
        Ok(self.movements_of(MovementKind::Deposit, from_block, to_block))
    }

    async fn get_withdrawals(&self, _user: Address, from_block: u64, to_block: u64) -> Result<Vec<Movement>> {
        Ok(self.movements_of(MovementKind::Withdrawal, from_block, to_block))
    }

    async fn unwrap(&self, protocol_token: Address, block: Option<u64>) -> Result<UnwrapExchangeRate> {
        self.unwrap_calls.fetch_add(1, Ordering::SeqCst);
        if protocol_token != self.share.address {
            return Err(EngineError::adapter(format!("unknown share {:?}", protocol_token)));
        }
        let rate = block
            .and_then(|b| self.rates.get(&b).copied())
            .unwrap_or(self.default_rate);
        Ok(UnwrapExchangeRate {
            protocol_token: self.share.clone(),
            tokens: vec![UnderlyingRate {
                token: self.asset.clone(),
                token_type: TokenType::Underlying,
                underlying_rate_raw: rate,
            }],
        })
    }

    async fn get_total_value_locked(
        &self,
        _protocol_token_filter: Option<&[Address]>,
        _block: Option<u64>,
    ) -> Result<Vec<TokenNode>> {
        Ok(vec![
            TokenNode::new(self.share.clone(), TokenType::Protocol, U256::zero())
                .with_total_supply(self.latest_balance),
        ])
    }
}

/// USD prices for leaf tokens, answered as a single fiat rate.
pub struct PriceAdapter {
    metadata: AdapterMetadata,
    prices: HashMap<Address, U256>,
}

impl PriceAdapter {
    pub fn new(chain: Chain) -> Self {
        Self {
            metadata: AdapterMetadata::new("prices", "usd", chain, PositionType::Supply),
            prices: HashMap::new(),
        }
    }

    pub fn price(mut self, token: Address, usd: &str) -> Self {
        let price: FixedPointDecimal = usd.parse().expect("valid price literal");
        self.prices
            .insert(token, price.to_units(18).expect("non-negative price"));
        self
    }
}

#[async_trait]
impl ProtocolAdapter for PriceAdapter {
    fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    async fn get_protocol_tokens(&self) -> Result<Vec<ProtocolToken>> {
        Ok(Vec::new())
    }

    async fn get_positions(&self, _: Address, _: Option<u64>, _: Option<&[Address]>) -> Result<Vec<TokenNode>> {
        Err(self.metadata.unsupported("get_positions"))
    }

    async fn unwrap(&self, token: Address, _block: Option<u64>) -> Result<UnwrapExchangeRate> {
        let rate = self
            .prices
            .get(&token)
            .copied()
            .ok_or_else(|| EngineError::adapter(format!("no price for {:?}", token)))?;
        Ok(UnwrapExchangeRate {
            protocol_token: TokenMetadata::new(token, "", "", 18),
            tokens: vec![UnderlyingRate {
                token: TokenMetadata::new(Address::zero(), "US Dollar", "USD", 18),
                token_type: TokenType::Fiat,
                underlying_rate_raw: rate,
            }],
        })
    }
}

/// What a [`ScriptedAdapter`] answers to `get_positions`.
pub enum Script {
    Empty,
    Fail(&'static str),
    Panic,
    Positions(Vec<TokenNode>),
}

pub struct ScriptedAdapter {
    metadata: AdapterMetadata,
    script: Script,
}

impl ScriptedAdapter {
    pub fn new(protocol_id: &str, chain: Chain, script: Script) -> Self {
        Self {
            metadata: AdapterMetadata::new(protocol_id, "pool", chain, PositionType::Supply),
            script,
        }
    }
}

#[async_trait]
impl ProtocolAdapter for ScriptedAdapter {
    fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    async fn get_protocol_tokens(&self) -> Result<Vec<ProtocolToken>> {
        Ok(Vec::new())
    }

    async fn get_positions(&self, _: Address, _: Option<u64>, _: Option<&[Address]>) -> Result<Vec<TokenNode>> {
        match &self.script {
            Script::Empty => Ok(Vec::new()),
            Script::Fail(message) => Err(EngineError::adapter(*message)),
            Script::Panic => panic!("adapter bug"),
            Script::Positions(nodes) => Ok(nodes.clone()),
        }
    }

    async fn unwrap(&self, _: Address, _: Option<u64>) -> Result<UnwrapExchangeRate> {
        Err(self.metadata.unsupported("unwrap"))
    }
}

/// A protocol token that unwraps into itself, producing an unbounded tree.
pub struct LoopingAdapter {
    metadata: AdapterMetadata,
    token: TokenMetadata,
}

impl LoopingAdapter {
    pub fn new(token: TokenMetadata) -> Self {
        Self {
            metadata: AdapterMetadata::new("ouroboros", "wrapper", Chain::Ethereum, PositionType::Supply),
            token,
        }
    }
}

#[async_trait]
impl ProtocolAdapter for LoopingAdapter {
    fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    async fn get_protocol_tokens(&self) -> Result<Vec<ProtocolToken>> {
        Ok(vec![ProtocolToken {
            token: self.token.clone(),
            underlying_tokens: vec![self.token.clone()],
        }])
    }

    async fn get_positions(&self, _: Address, _: Option<u64>, _: Option<&[Address]>) -> Result<Vec<TokenNode>> {
        Ok(vec![TokenNode::new(
            self.token.clone(),
            TokenType::Protocol,
            units(1, self.token.decimals),
        )])
    }

    async fn unwrap(&self, _: Address, _: Option<u64>) -> Result<UnwrapExchangeRate> {
        Ok(UnwrapExchangeRate {
            protocol_token: self.token.clone(),
            tokens: vec![UnderlyingRate {
                token: self.token.clone(),
                token_type: TokenType::Protocol,
                underlying_rate_raw: units(1, self.token.decimals),
            }],
        })
    }
}
