use crate::chains::Chain;
use crate::error::{EngineError, Result};
use crate::metrics::RpcMetrics;
use crate::settings::BatchPolicy;
use crate::transport::RpcTransport;
use crate::types::BlockSelector;
use ethers::abi::{Function, Param, ParamType, StateMutability, Token};
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

/// A single contract read to be folded into an `aggregate3` call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Call {
    /// Target contract address
    pub target: Address,
    /// Encoded function call data
    pub call_data: Bytes,
    /// When false, a failure of this call reverts the whole aggregate.
    pub allow_failure: bool,
}

impl Call {
    pub fn new(target: Address, call_data: impl Into<Bytes>) -> Self {
        Self {
            target,
            call_data: call_data.into(),
            allow_failure: true,
        }
    }
}

/// Multicall3 `aggregate3((address,bool,bytes)[]) returns ((bool,bytes)[])`.
#[allow(deprecated)]
pub fn aggregate3_function() -> Function {
    Function {
        name: "aggregate3".to_string(),
        inputs: vec![Param {
            name: "calls".to_string(),
            kind: ParamType::Array(Box::new(ParamType::Tuple(vec![
                ParamType::Address,
                ParamType::Bool,
                ParamType::Bytes,
            ]))),
            internal_type: None,
        }],
        outputs: vec![Param {
            name: "returnData".to_string(),
            kind: ParamType::Array(Box::new(ParamType::Tuple(vec![
                ParamType::Bool,
                ParamType::Bytes,
            ]))),
            internal_type: None,
        }],
        constant: None,
        state_mutability: StateMutability::Payable,
    }
}

/// Human-readable reason for revert data: `Error(string)`, `Panic(uint256)` or raw hex.
pub fn decode_revert_reason(data: &[u8]) -> String {
    if data.is_empty() {
        return "execution reverted".to_string();
    }
    if data.len() >= 4 {
        let (selector, payload) = data.split_at(4);
        if selector == ERROR_STRING_SELECTOR {
            if let Ok(mut tokens) = ethers::abi::decode(&[ParamType::String], payload) {
                if let Some(Token::String(reason)) = tokens.pop() {
                    return reason;
                }
            }
        } else if selector == PANIC_SELECTOR {
            if let Ok(mut tokens) = ethers::abi::decode(&[ParamType::Uint(256)], payload) {
                if let Some(Token::Uint(code)) = tokens.pop() {
                    return format!("panic code {:#x}", code);
                }
            }
        }
    }
    format!("0x{}", hex::encode(data))
}

struct PendingCall {
    call: Call,
    reply: oneshot::Sender<Result<Bytes>>,
}

struct PendingBatch {
    generation: u64,
    calls: Vec<PendingCall>,
}

#[derive(Default)]
struct PendingState {
    groups: HashMap<BlockSelector, PendingBatch>,
    next_generation: u64,
}

struct BatcherInner {
    chain: Chain,
    transport: Arc<dyn RpcTransport>,
    multicall_address: Address,
    policy: BatchPolicy,
    state: Mutex<PendingState>,
    metrics: Arc<RpcMetrics>,
}

/// Coalesces concurrent reads into Multicall3 `aggregate3` round trips.
///
/// Calls are grouped by the block they target. A group is flushed when it reaches
/// `max_batch_size` calls, or `flush_timeout` after its first call arrived, whichever
/// comes first. Each caller is resolved with its own result:
///
/// - a successful inner call resolves with the returned bytes
/// - a failed inner call rejects only that caller with [`EngineError::CallRevert`]
/// - a failed aggregate rejects every caller of the group with
///   [`EngineError::BatchTransport`]
/// - a response whose length differs from the request rejects every caller of the
///   group with [`EngineError::BatchLengthMismatch`]
///
/// ## Example
///
/// ```rust,ignore
/// let batcher = RpcBatcher::new(Chain::Ethereum, transport, MULTICALL3, BatchPolicy::default(), metrics);
/// let (a, b) = tokio::join!(
///     batcher.enqueue(Call::new(token, balance_of_alice), BlockSelector::Latest),
///     batcher.enqueue(Call::new(token, balance_of_bob), BlockSelector::Latest),
/// );
/// ```
#[derive(Clone)]
pub struct RpcBatcher {
    inner: Arc<BatcherInner>,
}

impl RpcBatcher {
    pub fn new(
        chain: Chain,
        transport: Arc<dyn RpcTransport>,
        multicall_address: Address,
        policy: BatchPolicy,
        metrics: Arc<RpcMetrics>,
    ) -> Self {
        let mut policy = policy;
        if policy.max_batch_size == 0 {
            warn!("max_batch_size of 0 on {}, using 1", chain);
            policy.max_batch_size = 1;
        }

        Self {
            inner: Arc::new(BatcherInner {
                chain,
                transport,
                multicall_address,
                policy,
                state: Mutex::new(PendingState::default()),
                metrics,
            }),
        }
    }

    pub fn chain(&self) -> Chain {
        self.inner.chain
    }

    pub fn policy(&self) -> &BatchPolicy {
        &self.inner.policy
    }

    /// Number of calls waiting for a flush, over all block groups.
    pub fn pending_calls(&self) -> usize {
        self.inner
            .state
            .lock()
            .map(|state| state.groups.values().map(|g| g.calls.len()).sum())
            .unwrap_or(0)
    }

    /// Queues `call` against `block` and waits for its individual result.
    pub async fn enqueue(&self, call: Call, block: BlockSelector) -> Result<Bytes> {
        if call.target.is_zero() {
            return Err(EngineError::InvalidCall("call target is empty".to_string()));
        }
        if call.call_data.is_empty() {
            return Err(EngineError::InvalidCall(format!(
                "call to {:?} has empty call data",
                call.target
            )));
        }

        let (reply, receiver) = oneshot::channel();
        let (arm_timer, ready) = {
            let mut state = self.inner.state.lock().map_err(|_| self.poisoned())?;
            let generation = state.next_generation;
            let group = state.groups.entry(block).or_insert_with(|| PendingBatch {
                generation,
                calls: Vec::new(),
            });

            let arm_timer = if group.calls.is_empty() {
                group.generation = generation;
                Some(generation)
            } else {
                None
            };
            group.calls.push(PendingCall { call, reply });
            let full = group.calls.len() >= self.inner.policy.max_batch_size;

            if arm_timer.is_some() {
                state.next_generation += 1;
            }
            let ready = if full { state.groups.remove(&block) } else { None };
            (arm_timer, ready)
        };

        match (ready, arm_timer) {
            (Some(batch), _) => {
                let batcher = self.clone();
                tokio::spawn(async move { batcher.flush(block, batch.calls).await });
            }
            (None, Some(generation)) => {
                let batcher = self.clone();
                let delay = self.inner.policy.flush_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(batch) = batcher.take_group(block, generation) {
                        batcher.flush(block, batch.calls).await;
                    }
                });
            }
            (None, None) => {}
        }

        receiver.await.map_err(|_| EngineError::BatchTransport {
            chain: self.inner.chain,
            message: "batch dropped before completion".to_string(),
        })?
    }

    /// Runs several calls at the same block and returns results in input order.
    pub async fn run(&self, calls: Vec<Call>, block: BlockSelector) -> Vec<Result<Bytes>> {
        futures::future::join_all(calls.into_iter().map(|call| self.enqueue(call, block))).await
    }

    /// Removes the group if it is still the one the timer was armed for.
    fn take_group(&self, block: BlockSelector, generation: u64) -> Option<PendingBatch> {
        let mut state = self.inner.state.lock().ok()?;
        match state.groups.get(&block) {
            Some(group) if group.generation == generation => state.groups.remove(&block),
            _ => None,
        }
    }

    fn poisoned(&self) -> EngineError {
        EngineError::BatchTransport {
            chain: self.inner.chain,
            message: "batcher state lock poisoned".to_string(),
        }
    }

    async fn flush(&self, block: BlockSelector, calls: Vec<PendingCall>) {
        if calls.is_empty() {
            return;
        }
        let size = calls.len();
        self.inner.metrics.record_batch_flush(size);
        debug!(
            "Flushing batch of {} calls on {} at block {}",
            size, self.inner.chain, block
        );

        let requests: Vec<&Call> = calls.iter().map(|pending| &pending.call).collect();
        match self.execute_aggregate3(&requests, block).await {
            Ok(results) if results.len() != size => {
                warn!(
                    "aggregate3 on {} returned {} results for {} calls",
                    self.inner.chain,
                    results.len(),
                    size
                );
                self.inner.metrics.record_batch_failure();
                let err = EngineError::BatchLengthMismatch {
                    chain: self.inner.chain,
                    expected: size,
                    actual: results.len(),
                };
                reject_all(calls, &err);
            }
            Ok(results) => {
                for (pending, (success, data)) in calls.into_iter().zip(results) {
                    let outcome = if success {
                        Ok(data)
                    } else {
                        self.inner.metrics.record_call_revert();
                        Err(EngineError::CallRevert {
                            target: pending.call.target,
                            reason: decode_revert_reason(&data),
                        })
                    };
                    // Receiver may have timed out and gone away.
                    let _ = pending.reply.send(outcome);
                }
            }
            Err(err) => {
                warn!("aggregate3 on {} failed: {}", self.inner.chain, err);
                self.inner.metrics.record_batch_failure();
                let err = EngineError::BatchTransport {
                    chain: self.inner.chain,
                    message: err.to_string(),
                };
                reject_all(calls, &err);
            }
        }
    }

    async fn execute_aggregate3(
        &self,
        calls: &[&Call],
        block: BlockSelector,
    ) -> Result<Vec<(bool, Bytes)>> {
        let call_tokens = calls
            .iter()
            .map(|call| {
                // Call3 struct: (address target, bool allowFailure, bytes callData)
                Token::Tuple(vec![
                    Token::Address(call.target),
                    Token::Bool(call.allow_failure),
                    Token::Bytes(call.call_data.to_vec()),
                ])
            })
            .collect();

        let function = aggregate3_function();
        let calldata = function
            .encode_input(&[Token::Array(call_tokens)])
            .map_err(|e| EngineError::InvalidCall(format!("aggregate3 encoding: {}", e)))?;

        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.inner.multicall_address)
            .data(calldata)
            .into();
        let response = self.inner.transport.call(&tx, block).await?;

        let decoded = function
            .decode_output(&response)
            .map_err(|e| self.malformed(format!("aggregate3 decoding: {}", e)))?;
        let results = decoded
            .into_iter()
            .next()
            .and_then(Token::into_array)
            .ok_or_else(|| self.malformed("invalid aggregate3 response format".to_string()))?;

        results
            .into_iter()
            .map(|token| match token {
                // Result struct: (bool success, bytes returnData)
                Token::Tuple(fields) => match fields.as_slice() {
                    [Token::Bool(success), Token::Bytes(data)] => {
                        Ok((*success, Bytes::from(data.clone())))
                    }
                    _ => Err(self.malformed("unexpected aggregate3 result tuple".to_string())),
                },
                _ => Err(self.malformed("unexpected aggregate3 result token".to_string())),
            })
            .collect()
    }

    fn malformed(&self, message: String) -> EngineError {
        EngineError::BatchTransport {
            chain: self.inner.chain,
            message,
        }
    }
}

fn reject_all(calls: Vec<PendingCall>, err: &EngineError) {
    for pending in calls {
        let _ = pending.reply.send(Err(err.clone()));
    }
}
