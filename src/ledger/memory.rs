//! In-memory `RewardStore`.
//!
//! Same semantics as the Postgres repository, held in hash maps behind a
//! single mutex so every operation is atomic. Used by tests and by
//! `STORE_BACKEND=memory`. All state is lost on restart.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::models::*;
use super::store::RewardStore;
use crate::error::{AppError, AppResult, QueueError};

#[derive(Default)]
struct Inner {
    deliveries: HashMap<String, WebhookDelivery>,
    /// Keyed by github_org_id
    organizations: HashMap<i64, Organization>,
    /// Keyed by github_repo_id
    repositories: HashMap<i64, Repository>,
    maintainers: HashMap<(Uuid, i64), Maintainer>,
    wallets: HashMap<i64, ContributorWallet>,
    /// Keyed by nonce
    wallet_challenges: HashMap<String, WalletChallenge>,
    jobs: HashMap<Uuid, RewardJob>,
    transactions: HashMap<Uuid, SettlementTransaction>,
}

impl Inner {
    fn live_job_for(&self, key: &JobKey) -> Option<Uuid> {
        self.jobs
            .values()
            .find(|job| !job.status.is_terminal() && job.key() == *key)
            .map(|job| job.id)
    }
}

pub struct InMemoryLedger {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            fail_writes: AtomicBool::new(false),
        }
    }

    fn check_writable(&self) -> AppResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::StoreUnavailable(
                "in-memory ledger is rejecting writes".to_string(),
            ));
        }
        Ok(())
    }
}

/// Inspection and fault-injection hooks for tests
#[cfg(test)]
impl InMemoryLedger {
    /// Make every write fail with `StoreUnavailable` until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn organization_count(&self) -> usize {
        self.inner.lock().organizations.len()
    }

    pub fn repository_count(&self) -> usize {
        self.inner.lock().repositories.len()
    }

    pub fn maintainer_count(&self) -> usize {
        self.inner.lock().maintainers.len()
    }

    pub fn all_jobs(&self) -> Vec<RewardJob> {
        let mut jobs: Vec<_> = self.inner.lock().jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn delivery(&self, delivery_id: &str) -> Option<WebhookDelivery> {
        self.inner.lock().deliveries.get(delivery_id).cloned()
    }

    /// Force a job's lease to expire, as if its worker had crashed.
    pub fn expire_lease(&self, job_id: Uuid, at: DateTime<Utc>) {
        if let Some(job) = self.inner.lock().jobs.get_mut(&job_id) {
            job.lease_expires_at = Some(at);
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RewardStore for InMemoryLedger {
    async fn begin_delivery(&self, delivery: WebhookDelivery) -> AppResult<DeliveryState> {
        self.check_writable()?;
        let mut inner = self.inner.lock();

        let applied = inner
            .deliveries
            .get(&delivery.delivery_id)
            .map(WebhookDelivery::is_applied);
        match applied {
            Some(true) => Ok(DeliveryState::AlreadyApplied),
            Some(false) => Ok(DeliveryState::Fresh),
            None => {
                inner
                    .deliveries
                    .insert(delivery.delivery_id.clone(), delivery);
                Ok(DeliveryState::Fresh)
            }
        }
    }

    async fn mark_delivery_applied(&self, delivery_id: &str, at: DateTime<Utc>) -> AppResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();

        if let Some(delivery) = inner.deliveries.get_mut(delivery_id) {
            delivery.applied_at.get_or_insert(at);
        }
        Ok(())
    }

    async fn upsert_organization(
        &self,
        org: OrganizationUpsert,
        now: DateTime<Utc>,
    ) -> AppResult<Organization> {
        self.check_writable()?;
        let mut inner = self.inner.lock();

        let record = inner
            .organizations
            .entry(org.github_org_id)
            .and_modify(|existing| {
                existing.name = org.name.clone();
                existing.installation_id = org.installation_id;
                existing.is_active = true;
                existing.updated_at = now;
            })
            .or_insert_with(|| Organization {
                id: Uuid::new_v4(),
                github_org_id: org.github_org_id,
                name: org.name.clone(),
                installation_id: org.installation_id,
                is_active: true,
                created_at: now,
                updated_at: now,
            });

        Ok(record.clone())
    }

    async fn deactivate_organization(
        &self,
        github_org_id: i64,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        self.check_writable()?;
        let mut inner = self.inner.lock();

        let org_id = match inner.organizations.get_mut(&github_org_id) {
            Some(org) => {
                org.is_active = false;
                org.updated_at = now;
                org.id
            }
            None => return Ok(false),
        };

        let mut touched = HashSet::new();
        for repo in inner
            .repositories
            .values_mut()
            .filter(|repo| repo.organization_id == org_id)
        {
            repo.is_active = false;
            repo.updated_at = now;
            touched.insert(repo.id);
        }

        inner
            .maintainers
            .retain(|(repository_id, _), _| !touched.contains(repository_id));

        Ok(true)
    }

    async fn upsert_repository(
        &self,
        repo: RepositoryUpsert,
        now: DateTime<Utc>,
    ) -> AppResult<Repository> {
        self.check_writable()?;
        let mut inner = self.inner.lock();

        let record = inner
            .repositories
            .entry(repo.github_repo_id)
            .and_modify(|existing| {
                existing.organization_id = repo.organization_id;
                existing.name = repo.name.clone();
                existing.is_active = true;
                existing.updated_at = now;
            })
            .or_insert_with(|| Repository {
                id: Uuid::new_v4(),
                github_repo_id: repo.github_repo_id,
                organization_id: repo.organization_id,
                name: repo.name.clone(),
                is_active: true,
                created_at: now,
                updated_at: now,
            });

        Ok(record.clone())
    }

    async fn deactivate_repositories(
        &self,
        github_repo_ids: &[i64],
        now: DateTime<Utc>,
    ) -> AppResult<u64> {
        self.check_writable()?;
        let mut inner = self.inner.lock();

        let mut touched = HashSet::new();
        for github_repo_id in github_repo_ids {
            if let Some(repo) = inner.repositories.get_mut(github_repo_id) {
                repo.is_active = false;
                repo.updated_at = now;
                touched.insert(repo.id);
            }
        }

        inner
            .maintainers
            .retain(|(repository_id, _), _| !touched.contains(repository_id));

        Ok(touched.len() as u64)
    }

    async fn rename_repository(
        &self,
        github_repo_id: i64,
        name: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Repository>> {
        self.check_writable()?;
        let mut inner = self.inner.lock();

        Ok(inner.repositories.get_mut(&github_repo_id).map(|repo| {
            repo.name = name.to_string();
            repo.updated_at = now;
            repo.clone()
        }))
    }

    async fn find_repository(&self, github_repo_id: i64) -> AppResult<Option<Repository>> {
        Ok(self.inner.lock().repositories.get(&github_repo_id).cloned())
    }

    async fn get_organization(&self, github_org_id: i64) -> AppResult<Option<Organization>> {
        Ok(self.inner.lock().organizations.get(&github_org_id).cloned())
    }

    async fn upsert_maintainer(
        &self,
        repository_id: Uuid,
        github_user_id: i64,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();

        inner
            .maintainers
            .entry((repository_id, github_user_id))
            .or_insert_with(|| Maintainer {
                id: Uuid::new_v4(),
                repository_id,
                github_user_id,
                created_at: now,
            });
        Ok(())
    }

    async fn is_maintainer(&self, repository_id: Uuid, github_user_id: i64) -> AppResult<bool> {
        Ok(self
            .inner
            .lock()
            .maintainers
            .contains_key(&(repository_id, github_user_id)))
    }

    async fn upsert_wallet(
        &self,
        github_user_id: i64,
        address: &str,
        now: DateTime<Utc>,
    ) -> AppResult<ContributorWallet> {
        self.check_writable()?;
        let wallet = ContributorWallet {
            github_user_id,
            address: address.to_string(),
            updated_at: now,
        };
        self.inner
            .lock()
            .wallets
            .insert(github_user_id, wallet.clone());
        Ok(wallet)
    }

    async fn wallet_for(&self, github_user_id: i64) -> AppResult<Option<ContributorWallet>> {
        Ok(self.inner.lock().wallets.get(&github_user_id).cloned())
    }

    async fn save_wallet_challenge(&self, challenge: WalletChallenge) -> AppResult<()> {
        self.check_writable()?;
        self.inner
            .lock()
            .wallet_challenges
            .insert(challenge.nonce.clone(), challenge);
        Ok(())
    }

    async fn take_wallet_challenge(&self, nonce: &str) -> AppResult<Option<WalletChallenge>> {
        self.check_writable()?;
        Ok(self.inner.lock().wallet_challenges.remove(nonce))
    }

    async fn enqueue_job(&self, job: NewRewardJob, now: DateTime<Utc>) -> AppResult<EnqueueOutcome> {
        self.check_writable()?;
        let mut inner = self.inner.lock();

        if let Some(existing) = inner
            .jobs
            .values()
            .find(|existing| existing.comment_id == job.comment_id)
        {
            return Ok(EnqueueOutcome::Existing(existing.id));
        }
        if let Some(existing) = inner.live_job_for(&job.key()) {
            return Ok(EnqueueOutcome::Existing(existing));
        }

        let id = Uuid::new_v4();
        inner.jobs.insert(
            id,
            RewardJob {
                id,
                contributor_github_id: job.contributor_github_id,
                commentor_github_id: job.commentor_github_id,
                repository_id: job.repository_id,
                pr_number: job.pr_number,
                comment_id: job.comment_id,
                amount: job.amount,
                currency: job.currency,
                chain: job.chain,
                status: JobStatus::Pending,
                attempts: 0,
                last_error: None,
                available_at: now,
                lease_id: None,
                lease_expires_at: None,
                created_at: now,
                updated_at: now,
                completed_at: None,
            },
        );

        Ok(EnqueueOutcome::Created(id))
    }

    async fn claim_job(
        &self,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> AppResult<Option<ClaimedJob>> {
        self.check_writable()?;
        let mut inner = self.inner.lock();

        let next = inner
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending && job.available_at <= now)
            .min_by_key(|job| (job.available_at, job.created_at))
            .map(|job| job.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        let lease_id = Uuid::new_v4();
        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.lease_id = Some(lease_id);
        job.lease_expires_at = Some(now + lease_ttl);
        job.updated_at = now;

        Ok(Some(ClaimedJob {
            job: job.clone(),
            lease_id,
        }))
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        lease_id: Uuid,
        transition: JobTransition,
        now: DateTime<Utc>,
    ) -> AppResult<RewardJob> {
        self.check_writable()?;
        let mut inner = self.inner.lock();

        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;

        if job.status != JobStatus::Processing || job.lease_id != Some(lease_id) {
            return Err(QueueError::LeaseLost { job_id }.into());
        }

        job.status = transition.target_status();
        job.lease_id = None;
        job.lease_expires_at = None;
        job.updated_at = now;
        match transition {
            JobTransition::Settled => {
                job.last_error = None;
                job.completed_at = Some(now);
            }
            JobTransition::Retry {
                error,
                available_at,
            } => {
                job.last_error = Some(error);
                job.available_at = available_at;
            }
            JobTransition::Failed { error } => {
                job.last_error = Some(error);
                job.completed_at = Some(now);
            }
        }

        Ok(job.clone())
    }

    async fn requeue_expired(&self, now: DateTime<Utc>, max_attempts: i32) -> AppResult<ReapReport> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        let mut report = ReapReport::default();

        for job in inner.jobs.values_mut().filter(|job| {
            job.status == JobStatus::Processing
                && job.lease_expires_at.is_some_and(|expires| expires <= now)
        }) {
            job.lease_id = None;
            job.lease_expires_at = None;
            job.updated_at = now;

            if job.attempts >= max_attempts {
                job.status = JobStatus::Failed;
                job.last_error = Some(RETRY_BUDGET_EXHAUSTED.to_string());
                job.completed_at = Some(now);
                report.failed += 1;
            } else {
                job.status = JobStatus::Pending;
                job.available_at = now;
                report.requeued += 1;
            }
        }

        Ok(report)
    }

    async fn get_job(&self, job_id: Uuid) -> AppResult<Option<RewardJob>> {
        Ok(self.inner.lock().jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, status: JobStatus, limit: i64) -> AppResult<Vec<RewardJob>> {
        let inner = self.inner.lock();
        let mut jobs: Vec<_> = inner
            .jobs
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn requeue_failed(&self, job_id: Uuid, now: DateTime<Utc>) -> AppResult<RewardJob> {
        self.check_writable()?;
        let mut inner = self.inner.lock();

        let key = {
            let job = inner
                .jobs
                .get(&job_id)
                .ok_or(QueueError::JobNotFound(job_id))?;
            if job.status != JobStatus::Failed {
                return Err(QueueError::InvalidTransition {
                    job_id,
                    current: job.status,
                    expected: JobStatus::Failed,
                }
                .into());
            }
            job.key()
        };

        if inner.live_job_for(&key).is_some() {
            return Err(AppError::InvalidInput(format!(
                "a live job already exists for PR #{} and contributor {}",
                key.pr_number, key.contributor_github_id
            )));
        }

        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;
        job.status = JobStatus::Pending;
        job.attempts = 0;
        job.available_at = now;
        job.completed_at = None;
        job.last_error = None;
        job.updated_at = now;

        Ok(job.clone())
    }

    async fn record_transaction(&self, tx: SettlementTransaction) -> AppResult<()> {
        self.check_writable()?;
        self.inner
            .lock()
            .transactions
            .entry(tx.job_id)
            .or_insert(tx);
        Ok(())
    }

    async fn update_transaction(
        &self,
        job_id: Uuid,
        status: TxStatus,
        confirmations: i64,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();

        if let Some(tx) = inner
            .transactions
            .get_mut(&job_id)
            .filter(|tx| tx.status == TxStatus::Submitted)
        {
            tx.status = status;
            tx.block_confirmations = confirmations;
            if status == TxStatus::Confirmed {
                tx.confirmed_at = Some(now);
            }
        }
        Ok(())
    }

    async fn transaction_for_job(&self, job_id: Uuid) -> AppResult<Option<SettlementTransaction>> {
        Ok(self.inner.lock().transactions.get(&job_id).cloned())
    }
}
