use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::models::*;
use crate::{
    error::{AppError, AppResult, QueueError},
    ledger::{
        models::{DeliveryState, JobStatus, WebhookDelivery},
        store::RewardStore,
    },
    middleware::{bearer_token, AdminAuth, AdminToken, ValidatedJson},
    queue::JobQueue,
    wallet::WalletVerificationService,
    webhooks::{
        events::{HEADER_DELIVERY, HEADER_EVENT, HEADER_SIGNATURE},
        payload_hash, EventHandlers, GitHubEvent, WebhookVerifier,
    },
};

const DEFAULT_LIST_LIMIT: i64 = 100;
const MAX_LIST_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RewardStore>,
    pub queue: Arc<JobQueue>,
    pub verifier: Arc<WebhookVerifier>,
    pub handlers: Arc<EventHandlers>,
    pub wallets: Arc<WalletVerificationService>,
    pub admin_token: AdminToken,
    /// Label of the store backend, reported by /health
    pub store_backend: &'static str,
    pub settlement_enabled: bool,
}

/// POST /webhook - GitHub App deliveries
pub async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookResponse>> {
    let event_type = header_value(&headers, HEADER_EVENT);
    let delivery_header = header_value(&headers, HEADER_DELIVERY);

    // SECURITY: nothing is parsed or stored before the signature checks out
    if let Err(e) = state
        .verifier
        .verify(&body, header_value(&headers, HEADER_SIGNATURE))
    {
        warn!(
            "⚠️ Rejected webhook delivery {} ({}): {}",
            delivery_header.unwrap_or("<none>"),
            event_type.unwrap_or("<none>"),
            e
        );
        return Err(e.into());
    }

    let event_type = event_type
        .ok_or_else(|| AppError::InvalidInput(format!("Missing {} header", HEADER_EVENT)))?;
    let hash = payload_hash(&body);
    let delivery_id = delivery_header
        .map(str::to_string)
        .unwrap_or_else(|| format!("sha256:{}", hash));

    let event = GitHubEvent::classify(event_type, &body).map_err(|e| {
        warn!("⚠️ Delivery {} has a malformed payload: {}", delivery_id, e);
        AppError::from(e)
    })?;

    if event.is_ignored() {
        debug!("Delivery {} ignored: {}", delivery_id, event.name());
        return Ok(Json(WebhookResponse::default()));
    }

    info!("🔔 Delivery {}: {}", delivery_id, event.name());

    let state_before = state
        .store
        .begin_delivery(WebhookDelivery {
            delivery_id: delivery_id.clone(),
            event_type: event_type.to_string(),
            action: event.action().map(str::to_string),
            payload_hash: hash,
            received_at: Utc::now(),
            verified: true,
            applied_at: None,
        })
        .await?;

    if state_before == DeliveryState::AlreadyApplied {
        info!("Delivery {} already applied, skipping", delivery_id);
        return Ok(Json(WebhookResponse {
            status: Some("duplicate".to_string()),
            ..WebhookResponse::default()
        }));
    }

    // A failed handler leaves the delivery unapplied so GitHub's redelivery re-runs it
    let outcome = state.handlers.apply(&event).await.map_err(|e| {
        error!("❌ Delivery {} ({}) failed: {}", delivery_id, event.name(), e);
        e
    })?;

    state
        .store
        .mark_delivery_applied(&delivery_id, Utc::now())
        .await?;

    Ok(Json(WebhookResponse {
        status: Some(outcome.label().to_string()),
        event: Some(event.name()),
        job_id: outcome.job_id(),
    }))
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// GET /api/v1/jobs/:id - Job with its settlement transaction
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<JobResponse>> {
    let job = state
        .queue
        .get(job_id)
        .await?
        .ok_or(QueueError::JobNotFound(job_id))?;
    let transaction = state.store.transaction_for_job(job_id).await?;

    Ok(Json(JobResponse { job, transaction }))
}

/// GET /api/v1/jobs?status=failed - Jobs by status, failed by default
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> AppResult<Json<JobListResponse>> {
    let status = match query.status.as_deref() {
        Some(status) => status.parse::<JobStatus>().map_err(AppError::InvalidInput)?,
        None => JobStatus::Failed,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let jobs = state.queue.list(status, limit).await?;

    Ok(Json(JobListResponse {
        status,
        count: jobs.len(),
        jobs,
    }))
}

/// POST /api/v1/admin/jobs/:id/requeue - Put a failed job back in the queue
pub async fn requeue_job(
    _admin: AdminAuth,
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<JobResponse>> {
    let job = state.queue.requeue_failed(job_id).await?;
    let transaction = state.store.transaction_for_job(job_id).await?;

    Ok(Json(JobResponse { job, transaction }))
}

/// POST /api/v1/contributors/wallet/challenge - Nonce to sign with the wallet
pub async fn wallet_challenge(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<WalletChallengeRequest>,
) -> AppResult<Json<WalletChallengeResponse>> {
    let challenge = state
        .wallets
        .issue_challenge(request.github_user_id, &request.address, Utc::now())
        .await?;

    Ok(Json(WalletChallengeResponse {
        message: WalletVerificationService::verification_message(&challenge),
        nonce: challenge.nonce,
        expires_at: challenge.expires_at,
        expires_in_seconds: state.wallets.challenge_ttl().num_seconds(),
    }))
}

/// POST /api/v1/contributors/wallet - Register a payout address with a signed challenge
pub async fn register_wallet(
    State(state): State<AppState>,
    headers: HeaderMap,
    ValidatedJson(request): ValidatedJson<RegisterWalletRequest>,
) -> AppResult<Json<WalletResponse>> {
    // An operator may replace a wallet whose key the contributor lost
    let operator_override = state.admin_token.authorizes(bearer_token(&headers));

    let wallet = state
        .wallets
        .register(request.into(), operator_override, Utc::now())
        .await?;

    info!(
        "✅ Wallet registered for GitHub user {}: {}",
        wallet.github_user_id, wallet.address
    );
    Ok(Json(wallet.into()))
}

/// GET /health - Health check
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_ok = match state.store.list_jobs(JobStatus::Failed, 1).await {
        Ok(_) => true,
        Err(e) => {
            warn!("⚠️ Health check could not reach the store: {}", e);
            false
        }
    };

    Json(HealthResponse {
        status: if store_ok && state.settlement_enabled {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        timestamp: Utc::now(),
        store: state.store_backend.to_string(),
        settlement_enabled: state.settlement_enabled,
    })
}
