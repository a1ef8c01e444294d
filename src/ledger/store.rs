use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::models::*;
use crate::error::AppResult;

/// Persistence boundary for the webhook pipeline and the settlement workers.
///
/// Every write is keyed by a stable external identifier (GitHub ids, the job
/// composite key, the delivery id) so concurrent or repeated deliveries
/// converge on the same rows. Callers pass `now` explicitly.
#[async_trait]
pub trait RewardStore: Send + Sync {
    // ========== DELIVERY OPERATIONS ==========

    /// Record a verified delivery. Returns `AlreadyApplied` if a previous
    /// delivery with the same id finished successfully.
    async fn begin_delivery(&self, delivery: WebhookDelivery) -> AppResult<DeliveryState>;

    async fn mark_delivery_applied(&self, delivery_id: &str, at: DateTime<Utc>) -> AppResult<()>;

    // ========== INSTALLATION OPERATIONS ==========

    async fn upsert_organization(
        &self,
        org: OrganizationUpsert,
        now: DateTime<Utc>,
    ) -> AppResult<Organization>;

    /// Soft-deactivate an organization and all of its repositories.
    /// Returns false when the organization was never seen.
    async fn deactivate_organization(&self, github_org_id: i64, now: DateTime<Utc>)
        -> AppResult<bool>;

    /// Insert or update by `github_repo_id`; reactivates a deactivated row.
    async fn upsert_repository(
        &self,
        repo: RepositoryUpsert,
        now: DateTime<Utc>,
    ) -> AppResult<Repository>;

    /// Deactivate repositories and drop their maintainer memberships.
    /// Returns the number of repositories touched.
    async fn deactivate_repositories(
        &self,
        github_repo_ids: &[i64],
        now: DateTime<Utc>,
    ) -> AppResult<u64>;

    /// Update the name of a known repository. `None` if it is unknown.
    async fn rename_repository(
        &self,
        github_repo_id: i64,
        name: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Repository>>;

    async fn find_repository(&self, github_repo_id: i64) -> AppResult<Option<Repository>>;

    async fn get_organization(&self, github_org_id: i64) -> AppResult<Option<Organization>>;

    async fn upsert_maintainer(
        &self,
        repository_id: Uuid,
        github_user_id: i64,
        now: DateTime<Utc>,
    ) -> AppResult<()>;

    async fn is_maintainer(&self, repository_id: Uuid, github_user_id: i64) -> AppResult<bool>;

    // ========== WALLET OPERATIONS ==========

    async fn upsert_wallet(
        &self,
        github_user_id: i64,
        address: &str,
        now: DateTime<Utc>,
    ) -> AppResult<ContributorWallet>;

    async fn wallet_for(&self, github_user_id: i64) -> AppResult<Option<ContributorWallet>>;

    async fn save_wallet_challenge(&self, challenge: WalletChallenge) -> AppResult<()>;

    /// Remove and return the challenge for `nonce`, expired or not.
    async fn take_wallet_challenge(&self, nonce: &str) -> AppResult<Option<WalletChallenge>>;

    // ========== JOB OPERATIONS ==========

    /// Idempotent on the job key while a live job holds it, and on the
    /// source comment id forever.
    async fn enqueue_job(&self, job: NewRewardJob, now: DateTime<Utc>) -> AppResult<EnqueueOutcome>;

    /// Atomically move the oldest eligible Pending job to Processing under a
    /// fresh lease and bump its attempt count.
    async fn claim_job(&self, now: DateTime<Utc>, lease_ttl: Duration)
        -> AppResult<Option<ClaimedJob>>;

    /// Apply a transition to a Processing job. Fails with `LeaseLost` when the
    /// caller no longer holds the lease.
    async fn complete_job(
        &self,
        job_id: Uuid,
        lease_id: Uuid,
        transition: JobTransition,
        now: DateTime<Utc>,
    ) -> AppResult<RewardJob>;

    /// Return Processing jobs whose lease expired to Pending, or to Failed if
    /// they already used `max_attempts`.
    async fn requeue_expired(&self, now: DateTime<Utc>, max_attempts: i32) -> AppResult<ReapReport>;

    async fn get_job(&self, job_id: Uuid) -> AppResult<Option<RewardJob>>;

    async fn list_jobs(&self, status: JobStatus, limit: i64) -> AppResult<Vec<RewardJob>>;

    /// Operator action: put a Failed job back to Pending with attempts reset.
    async fn requeue_failed(&self, job_id: Uuid, now: DateTime<Utc>) -> AppResult<RewardJob>;

    // ========== TRANSACTION OPERATIONS ==========

    async fn record_transaction(&self, tx: SettlementTransaction) -> AppResult<()>;

    /// Update the confirmation depth and status of a submitted transaction.
    /// Confirmed and reverted records are never changed again.
    async fn update_transaction(
        &self,
        job_id: Uuid,
        status: TxStatus,
        confirmations: i64,
        now: DateTime<Utc>,
    ) -> AppResult<()>;

    async fn transaction_for_job(&self, job_id: Uuid) -> AppResult<Option<SettlementTransaction>>;
}
