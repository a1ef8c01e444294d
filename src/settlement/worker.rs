//! Settlement workers.
//!
//! Each worker claims one job at a time, pays it through the reward vault
//! and tracks the transaction to the configured confirmation depth.
//!
//! INVARIANTS:
//! - A job with a recorded transaction is never resubmitted; a re-claim
//!   resumes confirmation polling for the recorded hash
//! - Every payout carries the job's voucher id, so the vault rejects a
//!   second payout for the same job
//! - A fresh relay fee is estimated before every submission

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::chain::{voucher_id, FeeEstimator, RewardLedger, TransferRequest, TxConfirmation};
use crate::error::{AppError, AppResult, ChainError, QueueError, SettlementError};
use crate::ledger::models::*;
use crate::ledger::store::RewardStore;
use crate::queue::{JobQueue, JobResult};

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub relay_gas_limit: u64,
    pub relay_fee_buffer_bps: u32,
    pub required_confirmations: u64,
    pub confirmation_poll_interval: Duration,
    pub max_confirmation_polls: u32,
    pub rpc_timeout: Duration,
    pub store_timeout: Duration,
    /// Sleep between empty claims
    pub claim_idle: Duration,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            relay_gas_limit: 200_000,
            relay_fee_buffer_bps: 0,
            required_confirmations: 3,
            confirmation_poll_interval: Duration::from_secs(6),
            max_confirmation_polls: 20,
            rpc_timeout: Duration::from_secs(20),
            store_timeout: Duration::from_secs(10),
            claim_idle: Duration::from_secs(2),
        }
    }
}

impl SettlementConfig {
    /// Longest one claimed job can take: every chain and store call hitting
    /// its timeout across the full confirmation budget.
    pub fn worst_case_duration(&self) -> Duration {
        let polls = self.max_confirmation_polls;
        // fee estimate and transfer, then one confirmation call per poll
        let rpc_calls = polls.saturating_add(2);
        // recorded-tx lookup, wallet, record, one update per poll, completion
        let store_calls = polls.saturating_add(4);
        let sleeps = polls.saturating_sub(1);

        self.rpc_timeout.saturating_mul(rpc_calls)
            + self.store_timeout.saturating_mul(store_calls)
            + self.confirmation_poll_interval.saturating_mul(sleeps)
    }
}

/// Shared collaborators of every worker in the pool
#[derive(Clone)]
pub struct SettlementDeps {
    pub queue: Arc<JobQueue>,
    pub store: Arc<dyn RewardStore>,
    pub ledger: Arc<dyn RewardLedger>,
    pub fees: Arc<dyn FeeEstimator>,
    pub config: SettlementConfig,
}

pub struct SettlementWorker {
    id: usize,
    deps: SettlementDeps,
}

impl SettlementWorker {
    pub fn new(id: usize, deps: SettlementDeps) -> Self {
        Self { id, deps }
    }

    /// Claim and settle jobs until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("🚀 Settlement worker {} started", self.id);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!("❌ Worker {} failed to process queue: {}", self.id, e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.deps.config.claim_idle) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Settlement worker {} stopped", self.id);
    }

    /// Claim and process at most one job. Returns whether a job was claimed.
    pub async fn tick(&self) -> AppResult<bool> {
        let claimed = with_store_timeout(&self.deps.config, self.deps.queue.claim()).await?;
        let Some(claimed) = claimed else {
            return Ok(false);
        };

        let result = match self.settle(&claimed.job).await {
            Ok(()) => JobResult::Settled,
            Err(SettlementError::Transient(reason)) => JobResult::Transient(reason),
            Err(SettlementError::Permanent(reason)) => JobResult::Permanent(reason),
        };

        match with_store_timeout(&self.deps.config, self.deps.queue.complete(&claimed, result)).await {
            Ok(_) => {}
            Err(AppError::Queue(QueueError::LeaseLost { job_id })) => {
                warn!(
                    "⚠️ Worker {} lost the lease on job {}; another worker owns it now",
                    self.id, job_id
                );
            }
            Err(e) => return Err(e),
        }
        Ok(true)
    }

    #[instrument(skip(self, job), fields(worker = self.id, job_id = %job.id, attempt = job.attempts))]
    async fn settle(&self, job: &RewardJob) -> Result<(), SettlementError> {
        let config = &self.deps.config;

        if let Some(tx) =
            with_store_timeout(config, self.deps.store.transaction_for_job(job.id)).await?
        {
            return match tx.status {
                TxStatus::Confirmed => Ok(()),
                TxStatus::Reverted => Err(SettlementError::Permanent(format!(
                    "transaction {} reverted",
                    tx.tx_hash
                ))),
                TxStatus::Submitted => {
                    info!("🔄 Resuming confirmation of {} for job {}", tx.tx_hash, job.id);
                    self.await_confirmation(job, &tx.tx_hash).await
                }
            };
        }

        let wallet = with_store_timeout(
            config,
            self.deps.store.wallet_for(job.contributor_github_id),
        )
        .await?
        .ok_or_else(|| {
            SettlementError::Permanent(format!(
                "contributor {} has no registered wallet",
                job.contributor_github_id
            ))
        })?;

        let source_chain = self.deps.ledger.source_chain();
        let relay_fee = with_rpc_timeout(
            config,
            self.deps
                .fees
                .estimate_fee(source_chain, job.chain, config.relay_gas_limit),
        )
        .await?
        .with_buffer(config.relay_fee_buffer_bps);

        let request = TransferRequest {
            voucher_id: voucher_id(job.id),
            recipient: wallet.address,
            amount: job.amount,
            currency: job.currency,
            destination_chain: job.chain,
            relay_fee,
        };

        let tx_hash = match with_rpc_timeout(config, self.deps.ledger.transfer(&request)).await {
            Ok(tx_hash) => tx_hash,
            Err(ChainError::AlreadySettled) => {
                return Err(SettlementError::Permanent(
                    "voucher already paid on-chain but no transaction is recorded; reconcile manually"
                        .to_string(),
                ))
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            "📤 Submitted payout {} for job {}: {} {} to {}",
            tx_hash, job.id, job.amount, job.currency, request.recipient
        );

        with_store_timeout(
            config,
            self.deps.store.record_transaction(SettlementTransaction {
                job_id: job.id,
                tx_hash: tx_hash.clone(),
                chain: source_chain,
                destination_chain: job.chain,
                relay_fee_wei: relay_fee.0.to_string(),
                block_confirmations: 0,
                status: TxStatus::Submitted,
                submitted_at: Utc::now(),
                confirmed_at: None,
            }),
        )
        .await?;

        self.await_confirmation(job, &tx_hash).await
    }

    /// Poll until the configured depth is reached, the transaction reverts,
    /// or the poll budget runs out.
    async fn await_confirmation(&self, job: &RewardJob, tx_hash: &str) -> Result<(), SettlementError> {
        let config = &self.deps.config;
        let required = config.required_confirmations.max(1);

        for poll in 1..=config.max_confirmation_polls {
            match with_rpc_timeout(config, self.deps.ledger.confirmations(tx_hash)).await {
                Ok(TxConfirmation::Mined { confirmations }) if confirmations >= required => {
                    with_store_timeout(
                        config,
                        self.deps.store.update_transaction(
                            job.id,
                            TxStatus::Confirmed,
                            confirmations as i64,
                            Utc::now(),
                        ),
                    )
                    .await?;
                    info!("✅ {} confirmed at depth {}", tx_hash, confirmations);
                    return Ok(());
                }
                Ok(TxConfirmation::Mined { confirmations }) => {
                    debug!("{} at depth {}/{}", tx_hash, confirmations, required);
                    with_store_timeout(
                        config,
                        self.deps.store.update_transaction(
                            job.id,
                            TxStatus::Submitted,
                            confirmations as i64,
                            Utc::now(),
                        ),
                    )
                    .await?;
                }
                Ok(TxConfirmation::Pending) => debug!("{} not mined yet (poll {})", tx_hash, poll),
                Ok(TxConfirmation::Reverted(reason)) => {
                    with_store_timeout(
                        config,
                        self.deps
                            .store
                            .update_transaction(job.id, TxStatus::Reverted, 0, Utc::now()),
                    )
                    .await?;
                    return Err(SettlementError::Permanent(reason));
                }
                Err(e) if e.is_transient() => {
                    warn!("⚠️ Confirmation poll {} for {} failed: {}", poll, tx_hash, e)
                }
                Err(e) => return Err(e.into()),
            }

            if poll < config.max_confirmation_polls {
                tokio::time::sleep(config.confirmation_poll_interval).await;
            }
        }

        Err(SettlementError::Transient(format!(
            "transaction {} not confirmed after {} polls",
            tx_hash, config.max_confirmation_polls
        )))
    }
}

async fn with_rpc_timeout<T>(
    config: &SettlementConfig,
    call: impl Future<Output = Result<T, ChainError>>,
) -> Result<T, ChainError> {
    tokio::time::timeout(config.rpc_timeout, call)
        .await
        .unwrap_or(Err(ChainError::Timeout))
}

async fn with_store_timeout<T>(
    config: &SettlementConfig,
    call: impl Future<Output = AppResult<T>>,
) -> AppResult<T> {
    tokio::time::timeout(config.store_timeout, call)
        .await
        .unwrap_or_else(|_| Err(AppError::StoreUnavailable("store call timed out".to_string())))
}

/// Fixed-size pool of settlement workers
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn(
        size: usize,
        deps: SettlementDeps,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        info!("⚙️ Starting {} settlement workers", size);
        (0..size)
            .map(|id| {
                let worker = SettlementWorker::new(id, deps.clone());
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{FixedFeeEstimator, ScriptedLedger};
    use crate::chain::RelayFee;
    use crate::comments::RewardInstruction;
    use crate::ledger::memory::InMemoryLedger;
    use crate::queue::RetryPolicy;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    const WALLET: &str = "0x8ba1f109551bD432803012645Ac136ddd64DBA72";

    struct Harness {
        store: Arc<InMemoryLedger>,
        ledger: Arc<ScriptedLedger>,
        fees: Arc<FixedFeeEstimator>,
        worker: SettlementWorker,
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    fn harness_with(tune: impl FnOnce(&mut SettlementConfig)) -> Harness {
        let mut config = SettlementConfig {
            confirmation_poll_interval: Duration::from_millis(1),
            max_confirmation_polls: 3,
            claim_idle: Duration::from_millis(1),
            ..SettlementConfig::default()
        };
        tune(&mut config);

        let store = Arc::new(InMemoryLedger::new());
        let ledger = Arc::new(ScriptedLedger::new(Chain::Polygon));
        let fees = Arc::new(FixedFeeEstimator::new(1_000));
        let policy = RetryPolicy {
            base_delay: chrono::Duration::zero(),
            jitter_ratio: 0.0,
            ..RetryPolicy::default()
        };
        let queue = Arc::new(JobQueue::new(store.clone(), policy, chrono::Duration::seconds(300)));
        let deps = SettlementDeps {
            queue,
            store: store.clone(),
            ledger: ledger.clone(),
            fees: fees.clone(),
            config,
        };
        Harness {
            store,
            ledger,
            fees,
            worker: SettlementWorker::new(0, deps),
        }
    }

    async fn enqueue(h: &Harness, chain: Chain) -> Uuid {
        h.store
            .upsert_wallet(99, WALLET, Utc::now())
            .await
            .unwrap();
        h.deps_queue()
            .enqueue(&RewardInstruction {
                repository_id: Uuid::new_v4(),
                pr_number: 12,
                comment_id: 1,
                commentor_github_id: 5,
                contributor_github_id: 99,
                amount: dec!(50),
                currency: Currency::Usdc,
                chain,
            })
            .await
            .unwrap()
            .job_id()
    }

    impl Harness {
        fn deps_queue(&self) -> &Arc<JobQueue> {
            &self.worker.deps.queue
        }

        async fn job(&self, id: Uuid) -> RewardJob {
            self.store.get_job(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_happy_path_settles() {
        let h = harness();
        let id = enqueue(&h, Chain::Arbitrum).await;

        assert!(h.worker.tick().await.unwrap());

        let job = h.job(id).await;
        assert_eq!(job.status, JobStatus::Settled);

        let tx = h.store.transaction_for_job(id).await.unwrap().unwrap();
        assert_eq!(tx.status, TxStatus::Confirmed);
        assert_eq!(tx.relay_fee_wei, "1000");

        let submitted = h.ledger.submitted.lock();
        assert_eq!(submitted[0].voucher_id, voucher_id(id));
        assert_eq!(submitted[0].relay_fee, RelayFee(1_000));
        assert_eq!(h.fees.calls.lock()[0], (Chain::Polygon, Chain::Arbitrum, 200_000));
    }

    #[tokio::test]
    async fn test_idle_when_queue_empty() {
        let h = harness();
        assert!(!h.worker.tick().await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_wallet_is_permanent() {
        let h = harness();
        let id = enqueue(&h, Chain::Polygon).await;
        // Contributor 1234 never registered a wallet
        let other = h
            .deps_queue()
            .enqueue(&RewardInstruction {
                repository_id: Uuid::new_v4(),
                pr_number: 13,
                comment_id: 2,
                commentor_github_id: 5,
                contributor_github_id: 1234,
                amount: dec!(5),
                currency: Currency::Usdc,
                chain: Chain::Polygon,
            })
            .await
            .unwrap()
            .job_id();

        h.worker.tick().await.unwrap();
        h.worker.tick().await.unwrap();

        assert_eq!(h.job(id).await.status, JobStatus::Settled);
        let failed = h.job(other).await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.last_error.unwrap().contains("no registered wallet"));
    }

    #[tokio::test]
    async fn test_transient_chain_error_requeues() {
        let h = harness();
        let id = enqueue(&h, Chain::Polygon).await;
        h.ledger.push_transfer(Err(ChainError::NonceContention("nonce too low".into())));

        h.worker.tick().await.unwrap();

        let job = h.job(id).await;
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(h.store.transaction_for_job(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_permanent_chain_error_fails() {
        let h = harness();
        let id = enqueue(&h, Chain::Polygon).await;
        h.ledger.push_transfer(Err(ChainError::InsufficientFunds("vault empty".into())));

        h.worker.tick().await.unwrap();

        assert_eq!(h.job(id).await.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_transient_fee_error_requeues_without_transfer() {
        let h = harness();
        let id = enqueue(&h, Chain::Arbitrum).await;
        h.fees.fail_next(ChainError::Timeout);

        h.worker.tick().await.unwrap();

        let job = h.job(id).await;
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.unwrap().contains("timed out"));
        assert_eq!(h.ledger.submitted_count(), 0);
        assert_eq!(h.ledger.poll_count(), 0);

        h.worker.tick().await.unwrap();
        assert_eq!(h.job(id).await.status, JobStatus::Settled);
        assert_eq!(h.fees.call_count(), 2);
        assert_eq!(h.ledger.submitted_count(), 1);
    }

    #[tokio::test]
    async fn test_permanent_fee_error_fails() {
        let h = harness();
        let id = enqueue(&h, Chain::Arbitrum).await;
        h.fees
            .fail_next(ChainError::InvalidDestination("unsupported chain".into()));

        h.worker.tick().await.unwrap();

        let job = h.job(id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.unwrap().contains("unsupported chain"));
        assert_eq!(h.ledger.submitted_count(), 0);
    }

    #[tokio::test]
    async fn test_stalled_transfer_times_out_and_requeues() {
        let h = harness_with(|config| config.rpc_timeout = Duration::from_millis(20));
        let id = enqueue(&h, Chain::Polygon).await;
        h.ledger.stall_transfers();

        let ticked = tokio::time::timeout(Duration::from_secs(5), h.worker.tick())
            .await
            .expect("rpc timeout bounds the stalled call");
        assert!(ticked.unwrap());

        let job = h.job(id).await;
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.last_error.as_deref(), Some("Chain call timed out"));
        assert!(h.store.transaction_for_job(id).await.unwrap().is_none());
        assert_eq!(h.ledger.poll_count(), 0);
    }

    #[tokio::test]
    async fn test_fee_estimated_fresh_each_attempt() {
        let h = harness();
        enqueue(&h, Chain::Optimism).await;
        h.ledger
            .push_transfer(Err(ChainError::InsufficientRelayFee("stale".into())));

        h.worker.tick().await.unwrap();
        *h.fees.fee.lock() = RelayFee(2_000);
        h.worker.tick().await.unwrap();

        assert_eq!(h.fees.call_count(), 2);
        assert_eq!(h.ledger.submitted.lock()[0].relay_fee, RelayFee(2_000));
    }

    #[tokio::test]
    async fn test_unconfirmed_transaction_resumes_without_resubmitting() {
        let h = harness();
        let id = enqueue(&h, Chain::Polygon).await;
        for _ in 0..3 {
            h.ledger.push_confirmation(Ok(TxConfirmation::Pending));
        }

        h.worker.tick().await.unwrap();
        let job = h.job(id).await;
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.last_error.unwrap().contains("not confirmed"));

        h.ledger
            .push_confirmation(Ok(TxConfirmation::Mined { confirmations: 1 }))
            .push_confirmation(Ok(TxConfirmation::Mined { confirmations: 3 }));
        h.worker.tick().await.unwrap();

        assert_eq!(h.job(id).await.status, JobStatus::Settled);
        assert_eq!(h.ledger.submitted_count(), 1);
        // Three exhausted polls, then two on the resumed attempt
        assert_eq!(h.ledger.poll_count(), 5);
        assert_eq!(
            h.store.transaction_for_job(id).await.unwrap().unwrap().block_confirmations,
            3
        );
    }

    #[tokio::test]
    async fn test_reverted_transaction_fails() {
        let h = harness();
        let id = enqueue(&h, Chain::Polygon).await;
        h.ledger
            .push_confirmation(Ok(TxConfirmation::Reverted("out of gas".into())));

        h.worker.tick().await.unwrap();

        assert_eq!(h.job(id).await.status, JobStatus::Failed);
        let tx = h.store.transaction_for_job(id).await.unwrap().unwrap();
        assert_eq!(tx.status, TxStatus::Reverted);
    }

    #[tokio::test]
    async fn test_already_paid_without_record_needs_reconciliation() {
        let h = harness();
        let id = enqueue(&h, Chain::Polygon).await;
        h.ledger.push_transfer(Err(ChainError::AlreadySettled));

        h.worker.tick().await.unwrap();

        let job = h.job(id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.unwrap().contains("reconcile"));
    }

    #[tokio::test]
    async fn test_store_outage_is_transient() {
        let h = harness();
        let id = enqueue(&h, Chain::Polygon).await;
        let claimed = h.deps_queue().claim().await.unwrap().unwrap();
        h.store.set_fail_writes(true);

        // Recording the transaction fails after broadcast
        let err = h.worker.settle(&claimed.job).await.unwrap_err();
        assert!(err.is_transient());

        h.store.set_fail_writes(false);
        h.deps_queue()
            .complete(&claimed, JobResult::Transient(err.to_string()))
            .await
            .unwrap();
        assert_eq!(h.job(id).await.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.worker.run(rx));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker stops")
            .unwrap();
    }
}
