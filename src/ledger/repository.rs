use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::models::*;
use super::store::RewardStore;
use crate::error::{AppError, AppResult, QueueError};

/// Postgres-backed ledger - the source of truth for installation state and reward jobs
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    async fn find_live_job(
        tx: &mut Transaction<'_, Postgres>,
        job: &NewRewardJob,
    ) -> AppResult<Option<Uuid>> {
        let existing = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM reward_jobs
            WHERE comment_id = $1
               OR (pr_number = $2 AND repository_id = $3 AND contributor_github_id = $4
                   AND status IN ('pending', 'processing'))
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(job.comment_id)
        .bind(job.pr_number)
        .bind(job.repository_id)
        .bind(job.contributor_github_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(existing)
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl RewardStore for LedgerRepository {
    // ========== DELIVERY OPERATIONS ==========

    async fn begin_delivery(&self, delivery: WebhookDelivery) -> AppResult<DeliveryState> {
        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries
                (delivery_id, event_type, action, payload_hash, received_at, verified)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (delivery_id) DO NOTHING
            "#,
        )
        .bind(&delivery.delivery_id)
        .bind(&delivery.event_type)
        .bind(&delivery.action)
        .bind(&delivery.payload_hash)
        .bind(delivery.received_at)
        .bind(delivery.verified)
        .execute(&self.pool)
        .await?;

        let applied_at = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT applied_at FROM webhook_deliveries WHERE delivery_id = $1",
        )
        .bind(&delivery.delivery_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(match applied_at {
            Some(_) => DeliveryState::AlreadyApplied,
            None => DeliveryState::Fresh,
        })
    }

    async fn mark_delivery_applied(&self, delivery_id: &str, at: DateTime<Utc>) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET applied_at = COALESCE(applied_at, $2)
            WHERE delivery_id = $1
            "#,
        )
        .bind(delivery_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========== INSTALLATION OPERATIONS ==========

    async fn upsert_organization(
        &self,
        org: OrganizationUpsert,
        now: DateTime<Utc>,
    ) -> AppResult<Organization> {
        let record = sqlx::query_as::<_, Organization>(
            r#"
            INSERT INTO organizations
                (id, github_org_id, name, installation_id, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, TRUE, $5, $5)
            ON CONFLICT (github_org_id) DO UPDATE
            SET name = EXCLUDED.name,
                installation_id = EXCLUDED.installation_id,
                is_active = TRUE,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(org.github_org_id)
        .bind(&org.name)
        .bind(org.installation_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn deactivate_organization(
        &self,
        github_org_id: i64,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut tx = self.begin_tx().await?;

        let org_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE organizations
            SET is_active = FALSE, updated_at = $2
            WHERE github_org_id = $1
            RETURNING id
            "#,
        )
        .bind(github_org_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(org_id) = org_id else {
            tx.rollback().await?;
            return Ok(false);
        };

        let repos = sqlx::query(
            r#"
            UPDATE repositories
            SET is_active = FALSE, updated_at = $2
            WHERE organization_id = $1
            "#,
        )
        .bind(org_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let maintainers = sqlx::query(
            r#"
            DELETE FROM maintainers
            WHERE repository_id IN (SELECT id FROM repositories WHERE organization_id = $1)
            "#,
        )
        .bind(org_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            "Deactivated organization {}: {} repositories, {} maintainers dropped",
            github_org_id,
            repos.rows_affected(),
            maintainers.rows_affected()
        );
        Ok(true)
    }

    async fn upsert_repository(
        &self,
        repo: RepositoryUpsert,
        now: DateTime<Utc>,
    ) -> AppResult<Repository> {
        let record = sqlx::query_as::<_, Repository>(
            r#"
            INSERT INTO repositories
                (id, github_repo_id, organization_id, name, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, TRUE, $5, $5)
            ON CONFLICT (github_repo_id) DO UPDATE
            SET organization_id = EXCLUDED.organization_id,
                name = EXCLUDED.name,
                is_active = TRUE,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(repo.github_repo_id)
        .bind(repo.organization_id)
        .bind(&repo.name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn deactivate_repositories(
        &self,
        github_repo_ids: &[i64],
        now: DateTime<Utc>,
    ) -> AppResult<u64> {
        let mut tx = self.begin_tx().await?;

        let repo_ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE repositories
            SET is_active = FALSE, updated_at = $2
            WHERE github_repo_id = ANY($1)
            RETURNING id
            "#,
        )
        .bind(github_repo_ids)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM maintainers WHERE repository_id = ANY($1)")
            .bind(&repo_ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(repo_ids.len() as u64)
    }

    async fn rename_repository(
        &self,
        github_repo_id: i64,
        name: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Repository>> {
        let record = sqlx::query_as::<_, Repository>(
            r#"
            UPDATE repositories
            SET name = $2, updated_at = $3
            WHERE github_repo_id = $1
            RETURNING *
            "#,
        )
        .bind(github_repo_id)
        .bind(name)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_repository(&self, github_repo_id: i64) -> AppResult<Option<Repository>> {
        let record = sqlx::query_as::<_, Repository>(
            "SELECT * FROM repositories WHERE github_repo_id = $1",
        )
        .bind(github_repo_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_organization(&self, github_org_id: i64) -> AppResult<Option<Organization>> {
        let record = sqlx::query_as::<_, Organization>(
            "SELECT * FROM organizations WHERE github_org_id = $1",
        )
        .bind(github_org_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn upsert_maintainer(
        &self,
        repository_id: Uuid,
        github_user_id: i64,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO maintainers (id, repository_id, github_user_id, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (repository_id, github_user_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(repository_id)
        .bind(github_user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn is_maintainer(&self, repository_id: Uuid, github_user_id: i64) -> AppResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM maintainers WHERE repository_id = $1 AND github_user_id = $2
            )
            "#,
        )
        .bind(repository_id)
        .bind(github_user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    // ========== WALLET OPERATIONS ==========

    async fn upsert_wallet(
        &self,
        github_user_id: i64,
        address: &str,
        now: DateTime<Utc>,
    ) -> AppResult<ContributorWallet> {
        let wallet = sqlx::query_as::<_, ContributorWallet>(
            r#"
            INSERT INTO contributor_wallets (github_user_id, address, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (github_user_id) DO UPDATE
            SET address = EXCLUDED.address, updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(github_user_id)
        .bind(address)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(wallet)
    }

    async fn wallet_for(&self, github_user_id: i64) -> AppResult<Option<ContributorWallet>> {
        let wallet = sqlx::query_as::<_, ContributorWallet>(
            "SELECT * FROM contributor_wallets WHERE github_user_id = $1",
        )
        .bind(github_user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(wallet)
    }

    async fn save_wallet_challenge(&self, challenge: WalletChallenge) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO wallet_challenges (nonce, github_user_id, address, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&challenge.nonce)
        .bind(challenge.github_user_id)
        .bind(&challenge.address)
        .bind(challenge.created_at)
        .bind(challenge.expires_at)
        .execute(&self.pool)
        .await?;

        // Expired challenges are never presented successfully; drop them here
        sqlx::query("DELETE FROM wallet_challenges WHERE expires_at < $1")
            .bind(challenge.created_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn take_wallet_challenge(&self, nonce: &str) -> AppResult<Option<WalletChallenge>> {
        let challenge = sqlx::query_as::<_, WalletChallenge>(
            "DELETE FROM wallet_challenges WHERE nonce = $1 RETURNING *",
        )
        .bind(nonce)
        .fetch_optional(&self.pool)
        .await?;

        Ok(challenge)
    }

    // ========== JOB OPERATIONS ==========

    async fn enqueue_job(&self, job: NewRewardJob, now: DateTime<Utc>) -> AppResult<EnqueueOutcome> {
        let mut tx = self.begin_tx().await?;

        if let Some(existing) = Self::find_live_job(&mut tx, &job).await? {
            tx.rollback().await?;
            return Ok(EnqueueOutcome::Existing(existing));
        }

        // The partial unique index settles races between concurrent deliveries
        let created = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO reward_jobs (
                id, contributor_github_id, commentor_github_id, repository_id,
                pr_number, comment_id, amount, currency, chain, status,
                attempts, available_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', 0, $10, $10, $10)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job.contributor_github_id)
        .bind(job.commentor_github_id)
        .bind(job.repository_id)
        .bind(job.pr_number)
        .bind(job.comment_id)
        .bind(job.amount)
        .bind(job.currency)
        .bind(job.chain)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match created {
            Some(id) => EnqueueOutcome::Created(id),
            None => {
                let existing = Self::find_live_job(&mut tx, &job).await?.ok_or_else(|| {
                    AppError::Internal("enqueue conflicted without a live job".to_string())
                })?;
                EnqueueOutcome::Existing(existing)
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn claim_job(
        &self,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> AppResult<Option<ClaimedJob>> {
        let lease_id = Uuid::new_v4();

        // SECURITY: SKIP LOCKED makes the claim the single mutual-exclusion point
        let job = sqlx::query_as::<_, RewardJob>(
            r#"
            UPDATE reward_jobs
            SET status = 'processing',
                attempts = attempts + 1,
                lease_id = $2,
                lease_expires_at = $3,
                updated_at = $1
            WHERE id = (
                SELECT id FROM reward_jobs
                WHERE status = 'pending' AND available_at <= $1
                ORDER BY available_at, created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(lease_id)
        .bind(now + lease_ttl)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job.map(|job| ClaimedJob { job, lease_id }))
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        lease_id: Uuid,
        transition: JobTransition,
        now: DateTime<Utc>,
    ) -> AppResult<RewardJob> {
        let status = transition.target_status();
        let (last_error, available_at, completed_at) = match &transition {
            JobTransition::Settled => (None, None, Some(now)),
            JobTransition::Retry {
                error,
                available_at,
            } => (Some(error.clone()), Some(*available_at), None),
            JobTransition::Failed { error } => (Some(error.clone()), None, Some(now)),
        };

        let updated = sqlx::query_as::<_, RewardJob>(
            r#"
            UPDATE reward_jobs
            SET status = $3,
                last_error = $4,
                available_at = COALESCE($5, available_at),
                completed_at = $6,
                lease_id = NULL,
                lease_expires_at = NULL,
                updated_at = $7
            WHERE id = $1 AND lease_id = $2 AND status = 'processing'
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(lease_id)
        .bind(status)
        .bind(last_error)
        .bind(available_at)
        .bind(completed_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(job) => Ok(job),
            None => match self.get_job(job_id).await? {
                Some(_) => Err(QueueError::LeaseLost { job_id }.into()),
                None => Err(QueueError::JobNotFound(job_id).into()),
            },
        }
    }

    async fn requeue_expired(&self, now: DateTime<Utc>, max_attempts: i32) -> AppResult<ReapReport> {
        let statuses = sqlx::query_scalar::<_, JobStatus>(
            r#"
            UPDATE reward_jobs
            SET status = CASE WHEN attempts >= $2 THEN 'failed'::job_status
                              ELSE 'pending'::job_status END,
                last_error = CASE WHEN attempts >= $2 THEN $3 ELSE last_error END,
                completed_at = CASE WHEN attempts >= $2 THEN $1 ELSE NULL END,
                available_at = CASE WHEN attempts >= $2 THEN available_at ELSE $1 END,
                lease_id = NULL,
                lease_expires_at = NULL,
                updated_at = $1
            WHERE status = 'processing' AND lease_expires_at <= $1
            RETURNING status
            "#,
        )
        .bind(now)
        .bind(max_attempts)
        .bind(RETRY_BUDGET_EXHAUSTED)
        .fetch_all(&self.pool)
        .await?;

        let failed = statuses
            .iter()
            .filter(|status| **status == JobStatus::Failed)
            .count() as u64;
        let report = ReapReport {
            requeued: statuses.len() as u64 - failed,
            failed,
        };

        if report != ReapReport::default() {
            info!(
                "🔄 Lease sweep: {} requeued, {} failed",
                report.requeued, report.failed
            );
        }
        Ok(report)
    }

    async fn get_job(&self, job_id: Uuid) -> AppResult<Option<RewardJob>> {
        let job = sqlx::query_as::<_, RewardJob>("SELECT * FROM reward_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    async fn list_jobs(&self, status: JobStatus, limit: i64) -> AppResult<Vec<RewardJob>> {
        let jobs = sqlx::query_as::<_, RewardJob>(
            r#"
            SELECT * FROM reward_jobs
            WHERE status = $1
            ORDER BY updated_at DESC
            LIMIT $2
            "#,
        )
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn requeue_failed(&self, job_id: Uuid, now: DateTime<Utc>) -> AppResult<RewardJob> {
        let result = sqlx::query_as::<_, RewardJob>(
            r#"
            UPDATE reward_jobs
            SET status = 'pending',
                attempts = 0,
                available_at = $2,
                completed_at = NULL,
                last_error = NULL,
                updated_at = $2
            WHERE id = $1 AND status = 'failed'
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await;

        let updated = match result {
            Ok(updated) => updated,
            Err(e) if is_unique_violation(&e) => {
                return Err(AppError::InvalidInput(format!(
                    "a live job already exists for the key of job {}",
                    job_id
                )))
            }
            Err(e) => return Err(e.into()),
        };

        match updated {
            Some(job) => Ok(job),
            None => match self.get_job(job_id).await? {
                Some(job) => Err(QueueError::InvalidTransition {
                    job_id,
                    current: job.status,
                    expected: JobStatus::Failed,
                }
                .into()),
                None => Err(QueueError::JobNotFound(job_id).into()),
            },
        }
    }

    // ========== TRANSACTION OPERATIONS ==========

    async fn record_transaction(&self, tx: SettlementTransaction) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settlement_transactions (
                job_id, tx_hash, chain, destination_chain, relay_fee_wei,
                block_confirmations, status, submitted_at, confirmed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(tx.job_id)
        .bind(&tx.tx_hash)
        .bind(tx.chain)
        .bind(tx.destination_chain)
        .bind(&tx.relay_fee_wei)
        .bind(tx.block_confirmations)
        .bind(tx.status)
        .bind(tx.submitted_at)
        .bind(tx.confirmed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_transaction(
        &self,
        job_id: Uuid,
        status: TxStatus,
        confirmations: i64,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let confirmed_at = (status == TxStatus::Confirmed).then_some(now);

        sqlx::query(
            r#"
            UPDATE settlement_transactions
            SET status = $2, block_confirmations = $3, confirmed_at = $4
            WHERE job_id = $1 AND status = 'submitted'
            "#,
        )
        .bind(job_id)
        .bind(status)
        .bind(confirmations)
        .bind(confirmed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn transaction_for_job(&self, job_id: Uuid) -> AppResult<Option<SettlementTransaction>> {
        let tx = sqlx::query_as::<_, SettlementTransaction>(
            "SELECT * FROM settlement_transactions WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(tx)
    }
}
