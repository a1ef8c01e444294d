use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// EVM chains a reward can be paid out on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "chain_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Polygon,
    Arbitrum,
    Optimism,
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Polygon => "polygon",
            Chain::Arbitrum => "arbitrum",
            Chain::Optimism => "optimism",
        }
    }

    pub fn all() -> Vec<Chain> {
        vec![Chain::Ethereum, Chain::Polygon, Chain::Arbitrum, Chain::Optimism]
    }

    /// EIP-155 chain id used when signing
    pub fn evm_chain_id(&self) -> u64 {
        match self {
            Chain::Ethereum => 1,
            Chain::Polygon => 137,
            Chain::Arbitrum => 42161,
            Chain::Optimism => 10,
        }
    }

    /// Endpoint id of the chain on the bridging protocol
    pub fn bridge_id(&self) -> u16 {
        match self {
            Chain::Ethereum => 101,
            Chain::Polygon => 109,
            Chain::Arbitrum => 110,
            Chain::Optimism => 111,
        }
    }
}

impl FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ethereum" => Ok(Chain::Ethereum),
            "polygon" => Ok(Chain::Polygon),
            "arbitrum" => Ok(Chain::Arbitrum),
            "optimism" => Ok(Chain::Optimism),
            other => Err(format!("unknown chain: {}", other)),
        }
    }
}

/// Reward tokens held by the vault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "currency_code", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    Usdc,
    Usdt,
    Dai,
}

impl Currency {
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Usdc => "USDC",
            Currency::Usdt => "USDT",
            Currency::Dai => "DAI",
        }
    }

    /// Token decimals; an amount may not be more precise than this
    pub fn decimals(&self) -> u32 {
        match self {
            Currency::Usdc | Currency::Usdt => 6,
            Currency::Dai => 18,
        }
    }

    pub fn from_code(code: &str) -> Option<Currency> {
        match code.to_ascii_uppercase().as_str() {
            "USDC" => Some(Currency::Usdc),
            "USDT" => Some(Currency::Usdt),
            "DAI" => Some(Currency::Dai),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::from_code(s).ok_or_else(|| format!("unknown currency: {}", s))
    }
}

// ========== INGESTION RECORDS ==========

/// Audit record of a verified webhook delivery
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookDelivery {
    pub delivery_id: String,
    pub event_type: String,
    pub action: Option<String>,
    pub payload_hash: String,
    pub received_at: DateTime<Utc>,
    pub verified: bool,
    pub applied_at: Option<DateTime<Utc>>,
}

impl WebhookDelivery {
    pub fn is_applied(&self) -> bool {
        self.applied_at.is_some()
    }
}

/// Result of recording a delivery before handling it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// First sighting, or a previous attempt that never finished
    Fresh,
    /// Already applied; the caller must short-circuit
    AlreadyApplied,
}

// ========== INSTALLATION STATE ==========

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub github_org_id: i64,
    pub name: String,
    pub installation_id: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Repository {
    pub id: Uuid,
    /// Stable identity; names change on rename
    pub github_repo_id: i64,
    pub organization_id: Uuid,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Maintainer {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub github_user_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Payout address registered by a contributor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ContributorWallet {
    pub github_user_id: i64,
    pub address: String,
    pub updated_at: DateTime<Utc>,
}

/// Nonce a contributor signs with the wallet they want to register.
/// Single use; consumed by the registration attempt that presents it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct WalletChallenge {
    pub nonce: String,
    pub github_user_id: i64,
    pub address: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Upsert input for organizations, keyed by `github_org_id`
#[derive(Debug, Clone)]
pub struct OrganizationUpsert {
    pub github_org_id: i64,
    pub name: String,
    pub installation_id: i64,
}

/// Upsert input for repositories, keyed by `github_repo_id`
#[derive(Debug, Clone)]
pub struct RepositoryUpsert {
    pub github_repo_id: i64,
    pub organization_id: Uuid,
    pub name: String,
}

// ========== REWARD JOBS ==========

/// Reward job status
///
/// Pending -> Processing -> Settled | Failed, Processing -> Pending on retry.
/// Settled and Failed are terminal for the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Settled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Settled | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "settled" => Ok(JobStatus::Settled),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Key that at most one live job may hold at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub pr_number: i64,
    pub repository_id: Uuid,
    pub contributor_github_id: i64,
}

/// A work item owned by the queue until claimed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RewardJob {
    /// Idempotency key, also the seed of the on-chain voucher id
    pub id: Uuid,
    pub contributor_github_id: i64,
    pub commentor_github_id: i64,
    pub repository_id: Uuid,
    pub pr_number: i64,
    pub comment_id: i64,
    pub amount: Decimal,
    pub currency: Currency,
    pub chain: Chain,
    pub status: JobStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    /// Earliest time the job may be claimed again
    pub available_at: DateTime<Utc>,
    pub lease_id: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RewardJob {
    pub fn key(&self) -> JobKey {
        JobKey {
            pr_number: self.pr_number,
            repository_id: self.repository_id,
            contributor_github_id: self.contributor_github_id,
        }
    }
}

/// Input for enqueueing a job
#[derive(Debug, Clone, PartialEq)]
pub struct NewRewardJob {
    pub contributor_github_id: i64,
    pub commentor_github_id: i64,
    pub repository_id: Uuid,
    pub pr_number: i64,
    pub comment_id: i64,
    pub amount: Decimal,
    pub currency: Currency,
    pub chain: Chain,
}

impl NewRewardJob {
    pub fn key(&self) -> JobKey {
        JobKey {
            pr_number: self.pr_number,
            repository_id: self.repository_id,
            contributor_github_id: self.contributor_github_id,
        }
    }
}

/// Outcome of an enqueue call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(Uuid),
    /// A live job already held the key
    Existing(Uuid),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Existing(id) => *id,
        }
    }
}

/// A job handed to exactly one worker
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub job: RewardJob,
    pub lease_id: Uuid,
}

/// State change applied by `complete`
#[derive(Debug, Clone, PartialEq)]
pub enum JobTransition {
    Settled,
    Retry {
        error: String,
        available_at: DateTime<Utc>,
    },
    Failed {
        error: String,
    },
}

impl JobTransition {
    pub fn target_status(&self) -> JobStatus {
        match self {
            JobTransition::Settled => JobStatus::Settled,
            JobTransition::Retry { .. } => JobStatus::Pending,
            JobTransition::Failed { .. } => JobStatus::Failed,
        }
    }
}

/// `last_error` of a job failed by the lease reaper
pub const RETRY_BUDGET_EXHAUSTED: &str = "retry budget exhausted after lease expiry";

/// Counts from a lease-expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: u64,
    pub failed: u64,
}

// ========== SETTLEMENT TRANSACTIONS ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "tx_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Submitted,
    Confirmed,
    Reverted,
}

/// Voucher / transaction record, 1:1 with a reward job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SettlementTransaction {
    pub job_id: Uuid,
    pub tx_hash: String,
    /// Chain the vault call was sent on
    pub chain: Chain,
    pub destination_chain: Chain,
    /// Relay fee paid, in wei
    pub relay_fee_wei: String,
    pub block_confirmations: i64,
    pub status: TxStatus,
    pub submitted_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}
