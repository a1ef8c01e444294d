use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::models::JobStatus;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("Unauthorized")]
    Unauthorized,
}

impl AppError {
    /// Persistence failures the webhook sender should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Database(_) | AppError::StoreUnavailable(_))
    }
}

/// Webhook boundary errors. Never reach the queue.
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Missing signature header")]
    MissingSignature,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Malformed {event} payload: {source}")]
    MalformedPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable job queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Lease on job {job_id} is no longer held")]
    LeaseLost { job_id: Uuid },

    #[error("Job {job_id} in invalid state: {current:?}, expected: {expected:?}")]
    InvalidTransition {
        job_id: Uuid,
        current: JobStatus,
        expected: JobStatus,
    },
}

/// Errors returned by the reward ledger and fee estimator capabilities
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Chain call timed out")]
    Timeout,

    #[error("Nonce contention: {0}")]
    NonceContention(String),

    #[error("Gas price too low: {0}")]
    Underpriced(String),

    #[error("Insufficient relay fee: {0}")]
    InsufficientRelayFee(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Invalid destination address: {0}")]
    InvalidDestination(String),

    #[error("Amount not representable on-chain: {0}")]
    InvalidAmount(String),

    #[error("Transaction reverted: {0}")]
    Reverted(String),

    #[error("Voucher already settled on-chain")]
    AlreadySettled,
}

impl ChainError {
    /// Whether a retry with a fresh fee estimate can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ChainError::Rpc(_)
            | ChainError::Timeout
            | ChainError::NonceContention(_)
            | ChainError::Underpriced(_)
            | ChainError::InsufficientRelayFee(_) => true,
            ChainError::InsufficientFunds(_)
            | ChainError::InvalidDestination(_)
            | ChainError::InvalidAmount(_)
            | ChainError::Reverted(_)
            | ChainError::AlreadySettled => false,
        }
    }
}

/// Classified outcome of a failed settlement attempt
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Transient settlement failure: {0}")]
    Transient(String),

    #[error("Permanent settlement failure: {0}")]
    Permanent(String),
}

impl SettlementError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SettlementError::Transient(_))
    }
}

impl From<ChainError> for SettlementError {
    fn from(error: ChainError) -> Self {
        if error.is_transient() {
            SettlementError::Transient(error.to_string())
        } else {
            SettlementError::Permanent(error.to_string())
        }
    }
}

impl From<AppError> for SettlementError {
    fn from(error: AppError) -> Self {
        // Store hiccups inside a worker are retried; everything else needs a human.
        if error.is_retryable() {
            SettlementError::Transient(error.to_string())
        } else {
            SettlementError::Permanent(error.to_string())
        }
    }
}

/// Wallet registration errors
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Unknown or already used challenge")]
    ChallengeNotFound,

    #[error("Challenge expired")]
    ChallengeExpired,

    #[error("Challenge was issued for a different user or address")]
    ChallengeMismatch,

    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    #[error("Replacing wallet {current} requires a signature from it")]
    CurrentWalletProofRequired { current: String },
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::Webhook(WebhookError::MissingSignature)
            | AppError::Webhook(WebhookError::InvalidSignature) => (
                StatusCode::UNAUTHORIZED,
                "INVALID_SIGNATURE",
                "Webhook signature verification failed".to_string(),
                None,
            ),
            AppError::Webhook(WebhookError::MalformedPayload { event, source }) => (
                StatusCode::BAD_REQUEST,
                "MALFORMED_PAYLOAD",
                format!("Malformed {} payload: {}", event, source),
                Some(serde_json::json!({"event": event})),
            ),
            AppError::Database(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            AppError::StoreUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "STORE_UNAVAILABLE",
                "Persistence is temporarily unavailable".to_string(),
                None,
            ),
            AppError::Queue(QueueError::JobNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "JOB_NOT_FOUND",
                format!("Job not found: {}", id),
                None,
            ),
            AppError::Queue(QueueError::InvalidTransition {
                job_id,
                current,
                expected,
            }) => (
                StatusCode::CONFLICT,
                "INVALID_JOB_STATE",
                format!("Job {} is {:?}, expected {:?}", job_id, current, expected),
                Some(serde_json::json!({
                    "job_id": job_id,
                    "current": current,
                    "expected": expected,
                })),
            ),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
                None,
            ),
            AppError::InvalidInput(msg) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                msg,
                None,
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Missing or invalid bearer token".to_string(),
                None,
            ),
            AppError::Wallet(WalletError::SignatureVerificationFailed) => (
                StatusCode::UNAUTHORIZED,
                "INVALID_WALLET_SIGNATURE",
                "Signature does not match the wallet address".to_string(),
                None,
            ),
            AppError::Wallet(WalletError::CurrentWalletProofRequired { current }) => (
                StatusCode::FORBIDDEN,
                "CURRENT_WALLET_PROOF_REQUIRED",
                format!("Replacing wallet {} requires a signature from it", current),
                Some(serde_json::json!({"current": current})),
            ),
            AppError::Wallet(e) => (
                StatusCode::BAD_REQUEST,
                "INVALID_CHALLENGE",
                e.to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::InvalidInput(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
