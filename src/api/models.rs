use crate::ledger::models::*;
use crate::wallet::WalletProof;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

// ========== REQUEST MODELS ==========

/// Ask for a nonce to sign with the wallet being registered
#[derive(Debug, Deserialize, Validate)]
pub struct WalletChallengeRequest {
    #[validate(range(min = 1, message = "must be a GitHub user id"))]
    pub github_user_id: i64,

    /// 0x-prefixed, 20-byte hex address
    #[validate(custom = "validate_evm_address")]
    pub address: String,
}

/// Register or replace the payout address of a contributor
#[derive(Debug, Deserialize, Validate)]
pub struct RegisterWalletRequest {
    #[validate(range(min = 1, message = "must be a GitHub user id"))]
    pub github_user_id: i64,

    #[validate(custom = "validate_evm_address")]
    pub address: String,

    #[validate(length(min = 1, message = "request a challenge first"))]
    pub nonce: String,

    /// `personal_sign` of the challenge message by `address`
    #[validate(length(min = 1))]
    pub signature: String,

    /// Same message signed by the currently registered address, when replacing it
    #[serde(default)]
    pub current_wallet_signature: Option<String>,
}

impl From<RegisterWalletRequest> for WalletProof {
    fn from(request: RegisterWalletRequest) -> Self {
        Self {
            github_user_id: request.github_user_id,
            address: request.address,
            nonce: request.nonce,
            signature: request.signature,
            current_wallet_signature: request.current_wallet_signature,
        }
    }
}

fn validate_evm_address(address: &str) -> Result<(), ValidationError> {
    let valid = address
        .strip_prefix("0x")
        .is_some_and(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()));
    if valid {
        Ok(())
    } else {
        let mut error = ValidationError::new("evm_address");
        error.message = Some("must be 0x followed by 40 hex characters".into());
        Err(error)
    }
}

/// `GET /api/v1/jobs` filters
#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub store: String,
    pub settlement_enabled: bool,
}

/// Response to a GitHub delivery
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct WebhookResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

/// Read model for one reward job
#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub job: RewardJob,
    pub transaction: Option<SettlementTransaction>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobListResponse {
    pub status: JobStatus,
    pub count: usize,
    pub jobs: Vec<RewardJob>,
}

/// Message to sign for `POST /api/v1/contributors/wallet`
#[derive(Debug, Serialize, Deserialize)]
pub struct WalletChallengeResponse {
    pub nonce: String,
    pub message: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WalletResponse {
    pub github_user_id: i64,
    pub address: String,
    pub updated_at: DateTime<Utc>,
}

impl From<ContributorWallet> for WalletResponse {
    fn from(wallet: ContributorWallet) -> Self {
        Self {
            github_user_id: wallet.github_user_id,
            address: wallet.address,
            updated_at: wallet.updated_at,
        }
    }
}
