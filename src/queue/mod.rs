//! Durable reward job queue.
//!
//! Delivery is at-least-once: a claimed job whose worker disappears comes
//! back after the visibility timeout. The settlement worker's on-chain
//! idempotency token makes redelivery safe end to end.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::comments::RewardInstruction;
use crate::error::AppResult;
use crate::ledger::models::*;
use crate::ledger::store::RewardStore;

/// Retry budget and backoff between attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Up to this share of the delay is added at random
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::seconds(30),
            max_delay: Duration::hours(1),
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    /// `base * 2^(attempts-1)`, capped at `max_delay`
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exponent = (attempts.max(1) - 1).min(30) as u32;
        let delay_ms = self
            .base_delay
            .num_milliseconds()
            .saturating_mul(1i64 << exponent);
        Duration::milliseconds(delay_ms.min(self.max_delay.num_milliseconds()))
    }

    /// Backoff plus random jitter
    pub fn delay_for(&self, attempts: i32) -> Duration {
        let delay = self.backoff(attempts);
        let max_jitter_ms = (delay.num_milliseconds() as f64 * self.jitter_ratio) as i64;
        if max_jitter_ms <= 0 {
            return delay;
        }
        delay + Duration::milliseconds(rand::rng().random_range(0..=max_jitter_ms))
    }

    pub fn is_exhausted(&self, attempts: i32) -> bool {
        attempts >= self.max_attempts
    }
}

/// How a worker finished with a claimed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Settled,
    /// Retry after backoff unless the budget is used up
    Transient(String),
    /// Needs manual action, never retried
    Permanent(String),
}

pub struct JobQueue {
    store: Arc<dyn RewardStore>,
    policy: RetryPolicy,
    visibility_timeout: Duration,
}

impl JobQueue {
    pub fn new(store: Arc<dyn RewardStore>, policy: RetryPolicy, visibility_timeout: Duration) -> Self {
        Self {
            store,
            policy,
            visibility_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Idempotent on (PR, repository, contributor) while a job is live.
    #[instrument(skip(self, instruction), fields(pr = instruction.pr_number, contributor = instruction.contributor_github_id))]
    pub async fn enqueue(&self, instruction: &RewardInstruction) -> AppResult<EnqueueOutcome> {
        let outcome = self
            .store
            .enqueue_job(
                NewRewardJob {
                    contributor_github_id: instruction.contributor_github_id,
                    commentor_github_id: instruction.commentor_github_id,
                    repository_id: instruction.repository_id,
                    pr_number: instruction.pr_number,
                    comment_id: instruction.comment_id,
                    amount: instruction.amount,
                    currency: instruction.currency,
                    chain: instruction.chain,
                },
                Utc::now(),
            )
            .await?;

        match outcome {
            EnqueueOutcome::Created(id) => info!(
                "✅ Enqueued reward job {}: {} {} for contributor {}",
                id, instruction.amount, instruction.currency, instruction.contributor_github_id
            ),
            EnqueueOutcome::Existing(id) => info!(
                "Reward job {} already live for PR #{}, not enqueueing again",
                id, instruction.pr_number
            ),
        }
        Ok(outcome)
    }

    pub async fn claim(&self) -> AppResult<Option<ClaimedJob>> {
        self.claim_at(Utc::now()).await
    }

    pub async fn claim_at(&self, now: DateTime<Utc>) -> AppResult<Option<ClaimedJob>> {
        let claimed = self.store.claim_job(now, self.visibility_timeout).await?;
        if let Some(claimed) = &claimed {
            info!(
                "🔄 Claimed job {} (attempt {}/{})",
                claimed.job.id, claimed.job.attempts, self.policy.max_attempts
            );
        }
        Ok(claimed)
    }

    pub async fn complete(&self, claimed: &ClaimedJob, result: JobResult) -> AppResult<RewardJob> {
        self.complete_at(claimed, result, Utc::now()).await
    }

    /// Apply a worker's result. Transient failures are retried with backoff
    /// until the attempt ceiling, whatever the classification said.
    pub async fn complete_at(
        &self,
        claimed: &ClaimedJob,
        result: JobResult,
        now: DateTime<Utc>,
    ) -> AppResult<RewardJob> {
        let job_id = claimed.job.id;
        let attempts = claimed.job.attempts;

        let transition = match result {
            JobResult::Settled => JobTransition::Settled,
            JobResult::Transient(error) if self.policy.is_exhausted(attempts) => {
                JobTransition::Failed {
                    error: format!("retry budget exhausted after {} attempts: {}", attempts, error),
                }
            }
            JobResult::Transient(error) => JobTransition::Retry {
                error,
                available_at: now + self.policy.delay_for(attempts),
            },
            JobResult::Permanent(error) => JobTransition::Failed { error },
        };

        let job = self
            .store
            .complete_job(job_id, claimed.lease_id, transition, now)
            .await?;

        match job.status {
            JobStatus::Settled => info!("✅ Job {} settled", job_id),
            JobStatus::Pending => warn!(
                "⚠️ Job {} requeued after attempt {}: {} (next try at {})",
                job_id,
                attempts,
                job.last_error.as_deref().unwrap_or_default(),
                job.available_at
            ),
            JobStatus::Failed => warn!(
                "❌ Job {} failed and needs manual review: {}",
                job_id,
                job.last_error.as_deref().unwrap_or_default()
            ),
            JobStatus::Processing => {}
        }
        Ok(job)
    }

    /// Return expired leases to the queue
    pub async fn reap(&self) -> AppResult<ReapReport> {
        self.reap_at(Utc::now()).await
    }

    pub async fn reap_at(&self, now: DateTime<Utc>) -> AppResult<ReapReport> {
        let report = self
            .store
            .requeue_expired(now, self.policy.max_attempts)
            .await?;
        if report.requeued > 0 || report.failed > 0 {
            warn!(
                "⚠️ Lease expiry: {} job(s) requeued, {} job(s) failed",
                report.requeued, report.failed
            );
        }
        Ok(report)
    }

    pub async fn get(&self, job_id: Uuid) -> AppResult<Option<RewardJob>> {
        self.store.get_job(job_id).await
    }

    pub async fn list(&self, status: JobStatus, limit: i64) -> AppResult<Vec<RewardJob>> {
        self.store.list_jobs(status, limit).await
    }

    /// Operator requeue of a Failed job
    pub async fn requeue_failed(&self, job_id: Uuid) -> AppResult<RewardJob> {
        let job = self.store.requeue_failed(job_id, Utc::now()).await?;
        info!("🔄 Job {} requeued by operator", job_id);
        Ok(job)
    }
}
