//! Scripted chain collaborators for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::*;

/// Replays queued transfer and confirmation results. When a script runs
/// dry, transfers succeed with a generated hash and confirmations report
/// a deep enough block.
pub struct ScriptedLedger {
    chain: Chain,
    stall_transfers: AtomicBool,
    transfers: Mutex<VecDeque<Result<String, ChainError>>>,
    confirmations: Mutex<VecDeque<Result<TxConfirmation, ChainError>>>,
    pub submitted: Mutex<Vec<TransferRequest>>,
    polls: Mutex<u32>,
}

impl ScriptedLedger {
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            stall_transfers: AtomicBool::new(false),
            transfers: Mutex::new(VecDeque::new()),
            confirmations: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            polls: Mutex::new(0),
        }
    }

    pub fn push_transfer(&self, result: Result<String, ChainError>) -> &Self {
        self.transfers.lock().push_back(result);
        self
    }

    pub fn push_confirmation(&self, result: Result<TxConfirmation, ChainError>) -> &Self {
        self.confirmations.lock().push_back(result);
        self
    }

    /// Transfers hang until the caller gives up, like an unresponsive node
    pub fn stall_transfers(&self) {
        self.stall_transfers.store(true, Ordering::SeqCst);
    }

    pub fn poll_count(&self) -> u32 {
        *self.polls.lock()
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.lock().len()
    }
}

#[async_trait]
impl RewardLedger for ScriptedLedger {
    fn source_chain(&self) -> Chain {
        self.chain
    }

    async fn transfer(&self, request: &TransferRequest) -> Result<String, ChainError> {
        if self.stall_transfers.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        let result = self
            .transfers
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("0x{}", hex::encode(request.voucher_id))));
        if result.is_ok() {
            self.submitted.lock().push(request.clone());
        }
        result
    }

    async fn confirmations(&self, _tx_hash: &str) -> Result<TxConfirmation, ChainError> {
        *self.polls.lock() += 1;
        self.confirmations
            .lock()
            .pop_front()
            .unwrap_or(Ok(TxConfirmation::Mined { confirmations: 64 }))
    }
}

/// Quotes a fixed fee, recording each request
pub struct FixedFeeEstimator {
    pub fee: Mutex<RelayFee>,
    pub calls: Mutex<Vec<(Chain, Chain, u64)>>,
    failures: Mutex<VecDeque<ChainError>>,
}

impl FixedFeeEstimator {
    pub fn new(fee: u128) -> Self {
        Self {
            fee: Mutex::new(RelayFee(fee)),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn fail_next(&self, error: ChainError) {
        self.failures.lock().push_back(error);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl FeeEstimator for FixedFeeEstimator {
    async fn estimate_fee(
        &self,
        source: Chain,
        destination: Chain,
        gas_limit: u64,
    ) -> Result<RelayFee, ChainError> {
        self.calls.lock().push((source, destination, gas_limit));
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        Ok(*self.fee.lock())
    }
}
