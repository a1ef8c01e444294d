//! End-to-end scenarios: signed deliveries through the HTTP router, into
//! the queue, and out through a settlement worker against a scripted chain.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use crate::bootstrap::assemble_state;
use crate::chain::testing::{FixedFeeEstimator, ScriptedLedger};
use crate::chain::voucher_id;
use crate::config::{Config, StoreBackend};
use crate::error::ChainError;
use crate::ledger::memory::InMemoryLedger;
use crate::ledger::models::*;
use crate::ledger::store::RewardStore;
use crate::server::create_app;
use crate::settlement::{SettlementConfig, SettlementDeps, SettlementWorker};
use crate::wallet::verification::testing as keys;
use crate::webhooks::events::{HEADER_DELIVERY, HEADER_EVENT, HEADER_SIGNATURE};
use crate::webhooks::signature::sign;

const SECRET: &str = "pipeline-secret";
const ADMIN_TOKEN: &str = "pipeline-operator";
const MAINTAINER: i64 = 5;
const CONTRIBUTOR: i64 = 99;
const WALLET: &str = "0x8ba1f109551bD432803012645Ac136ddd64DBA72";

struct Pipeline {
    store: Arc<InMemoryLedger>,
    chain: Arc<ScriptedLedger>,
    app: Router,
    worker: SettlementWorker,
}

fn pipeline() -> Pipeline {
    let config = Config {
        github_webhook_secret: SECRET.to_string(),
        store_backend: StoreBackend::Memory,
        admin_api_token: Some(ADMIN_TOKEN.to_string()),
        retry_base_delay_secs: 0,
        ..Config::default()
    };
    let store = Arc::new(InMemoryLedger::new());
    let state = assemble_state(&config, store.clone(), "memory", true).unwrap();

    let chain = Arc::new(ScriptedLedger::new(Chain::Polygon));
    let deps = SettlementDeps {
        queue: state.queue.clone(),
        store: store.clone(),
        ledger: chain.clone(),
        fees: Arc::new(FixedFeeEstimator::new(0)),
        config: SettlementConfig {
            confirmation_poll_interval: Duration::from_millis(1),
            max_confirmation_polls: 3,
            claim_idle: Duration::from_millis(1),
            ..SettlementConfig::default()
        },
    };

    Pipeline {
        store,
        chain,
        app: create_app(state, &config),
        worker: SettlementWorker::new(0, deps),
    }
}

impl Pipeline {
    async fn deliver(&self, event: &str, delivery: &str, payload: &Value) -> (StatusCode, Value) {
        let bytes = payload.to_string().into_bytes();
        let request = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header(HEADER_EVENT, event)
            .header(HEADER_DELIVERY, delivery)
            .header(HEADER_SIGNATURE, sign(&bytes, SECRET.as_bytes()))
            .header("content-type", "application/json")
            .body(Body::from(bytes))
            .unwrap();
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn post(&self, uri: &str, body: &Value, bearer: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    /// Register the wallet of `key` for the contributor through the signed
    /// challenge flow; returns the registration response status.
    async fn register_wallet(&self, key: &str) -> StatusCode {
        let wallet = keys::signer(key);
        let address = keys::address_of(&wallet);
        let (status, challenge) = self
            .post(
                "/api/v1/contributors/wallet/challenge",
                &json!({ "github_user_id": CONTRIBUTOR, "address": address }),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let message = challenge["message"].as_str().unwrap();
        let (status, _) = self
            .post(
                "/api/v1/contributors/wallet",
                &json!({
                    "github_user_id": CONTRIBUTOR,
                    "address": address,
                    "nonce": challenge["nonce"],
                    "signature": keys::sign(&wallet, message).await,
                }),
                None,
            )
            .await;
        status
    }

    async fn install(&self) {
        let (status, _) = self
            .deliver("installation", "install-1", &installation_created())
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    async fn comment(&self, delivery: &str, comment_id: i64, commentor: i64, body: &str) -> Value {
        let (status, body) = self
            .deliver("issue_comment", delivery, &pr_comment(comment_id, commentor, body))
            .await;
        assert_eq!(status, StatusCode::OK);
        body
    }

    async fn job(&self, id: Uuid) -> RewardJob {
        self.store.get_job(id).await.unwrap().unwrap()
    }
}

fn installation_created() -> Value {
    json!({
        "action": "created",
        "installation": { "id": 1001, "account": { "id": 42, "login": "acme" } },
        "repositories": [{ "id": 7, "name": "widgets", "full_name": "acme/widgets" }],
        "sender": { "id": MAINTAINER, "login": "octocat" }
    })
}

fn pr_comment(comment_id: i64, commentor: i64, body: &str) -> Value {
    json!({
        "action": "created",
        "issue": {
            "number": 12,
            "user": { "id": CONTRIBUTOR, "login": "dev" },
            "pull_request": { "url": "https://api.github.com/repos/acme/widgets/pulls/12" }
        },
        "comment": { "id": comment_id, "body": body, "user": { "id": commentor, "login": "someone" } },
        "repository": { "id": 7, "name": "widgets" }
    })
}

#[tokio::test]
async fn installation_created_then_replayed() {
    let p = pipeline();

    p.install().await;
    let org = p.store.get_organization(42).await.unwrap().unwrap();
    let repo = p.store.find_repository(7).await.unwrap().unwrap();
    assert_eq!(repo.organization_id, org.id);

    // Same event under a new delivery id runs the handler again
    let (status, body) = p
        .deliver("installation", "install-2", &installation_created())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "applied");

    assert_eq!(p.store.organization_count(), 1);
    assert_eq!(p.store.repository_count(), 1);
    assert_eq!(p.store.maintainer_count(), 1);
    assert_eq!(p.store.find_repository(7).await.unwrap().unwrap().id, repo.id);
}

#[tokio::test]
async fn maintainer_comment_creates_one_job() {
    let p = pipeline();
    p.install().await;

    let body = p.comment("c-1", 500, MAINTAINER, "/reward 50 USDC").await;
    assert_eq!(body["status"], "enqueued");

    let jobs = p.store.all_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].amount, dec!(50));
    assert_eq!(jobs[0].currency, Currency::Usdc);
    assert_eq!(jobs[0].contributor_github_id, CONTRIBUTOR);
    assert_eq!(jobs[0].pr_number, 12);
    assert_eq!(body["job_id"], jobs[0].id.to_string());
}

#[tokio::test]
async fn outsider_comment_creates_no_job() {
    let p = pipeline();
    p.install().await;

    let body = p.comment("c-1", 500, 31337, "/reward 50 USDC").await;

    assert_eq!(body["status"], "no_instruction");
    assert!(p.store.all_jobs().is_empty());
}

#[tokio::test]
async fn repeated_comments_share_the_live_job() {
    let p = pipeline();
    p.install().await;

    let first = p.comment("c-1", 500, MAINTAINER, "/reward 50 USDC").await;
    let duplicate = p.comment("c-1", 500, MAINTAINER, "/reward 50 USDC").await;
    let second = p.comment("c-2", 501, MAINTAINER, "/reward 75 USDC").await;

    assert_eq!(duplicate, json!({"status": "duplicate"}));
    assert_eq!(second["status"], "already_enqueued");
    assert_eq!(second["job_id"], first["job_id"]);
    assert_eq!(p.store.all_jobs().len(), 1);
}

#[tokio::test]
async fn comment_to_confirmed_payout() {
    let p = pipeline();
    p.install().await;

    assert_eq!(p.register_wallet(keys::ALICE_KEY).await, StatusCode::OK);

    p.comment("c-1", 500, MAINTAINER, "LGTM, thanks!\n/reward 50 USDC").await;
    let job_id = p.store.all_jobs()[0].id;

    assert!(p.worker.tick().await.unwrap());

    let request = Request::builder()
        .uri(format!("/api/v1/jobs/{}", job_id))
        .body(Body::empty())
        .unwrap();
    let (status, body) = p.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job"]["status"], "settled");
    assert_eq!(body["transaction"]["status"], "confirmed");

    let submitted = p.chain.submitted.lock();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].voucher_id, voucher_id(job_id));
    assert_eq!(
        submitted[0].recipient,
        keys::address_of(&keys::signer(keys::ALICE_KEY))
    );
    assert_eq!(submitted[0].amount, dec!(50));
}

#[tokio::test]
async fn payout_address_cannot_be_hijacked() {
    let p = pipeline();
    p.install().await;
    assert_eq!(p.register_wallet(keys::ALICE_KEY).await, StatusCode::OK);

    // Someone else proves control of their own address for the same user
    assert_eq!(p.register_wallet(keys::MALLORY_KEY).await, StatusCode::FORBIDDEN);

    p.comment("c-1", 500, MAINTAINER, "/reward 50 USDC").await;
    assert!(p.worker.tick().await.unwrap());

    let submitted = p.chain.submitted.lock();
    assert_eq!(submitted.len(), 1);
    assert_eq!(
        submitted[0].recipient,
        keys::address_of(&keys::signer(keys::ALICE_KEY))
    );
}

#[tokio::test]
async fn transient_timeouts_exhaust_the_retry_budget() {
    let p = pipeline();
    p.install().await;
    p.store
        .upsert_wallet(CONTRIBUTOR, WALLET, chrono::Utc::now())
        .await
        .unwrap();
    p.comment("c-1", 500, MAINTAINER, "/reward 50 USDC").await;
    let job_id = p.store.all_jobs()[0].id;

    for _ in 0..4 {
        p.chain.push_transfer(Err(ChainError::Timeout));
    }

    assert!(p.worker.tick().await.unwrap());
    let job = p.job(job_id).await;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);

    for _ in 0..3 {
        assert!(p.worker.tick().await.unwrap());
    }
    let job = p.job(job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 4);

    // Failed is terminal for the workers
    assert!(!p.worker.tick().await.unwrap());
    assert_eq!(p.job(job_id).await.attempts, 4);
    assert_eq!(p.chain.submitted_count(), 0);

    // Visible to operators
    let request = Request::builder()
        .uri("/api/v1/jobs?status=failed")
        .body(Body::empty())
        .unwrap();
    let (_, body) = p.send(request).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["jobs"][0]["id"], job_id.to_string());
}

#[tokio::test]
async fn operator_requeue_settles_failed_job() {
    let p = pipeline();
    p.install().await;
    p.comment("c-1", 500, MAINTAINER, "/reward 50 USDC").await;
    let job_id = p.store.all_jobs()[0].id;

    // No wallet yet: permanent failure
    assert!(p.worker.tick().await.unwrap());
    assert_eq!(p.job(job_id).await.status, JobStatus::Failed);

    p.store
        .upsert_wallet(CONTRIBUTOR, WALLET, chrono::Utc::now())
        .await
        .unwrap();
    let requeue = format!("/api/v1/admin/jobs/{}/requeue", job_id);
    let (status, _) = p.post(&requeue, &json!({}), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(p.job(job_id).await.status, JobStatus::Failed);

    let (status, body) = p.post(&requeue, &json!({}), Some(ADMIN_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job"]["status"], "pending");
    assert_eq!(body["job"]["attempts"], 0);
    assert_eq!(body["job"]["last_error"], Value::Null);

    assert!(p.worker.tick().await.unwrap());
    assert_eq!(p.job(job_id).await.status, JobStatus::Settled);

    // Only failed jobs can be requeued
    let (status, _) = p.post(&requeue, &json!({}), Some(ADMIN_TOKEN)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn uninstall_stops_new_rewards() {
    let p = pipeline();
    p.install().await;

    let mut deleted = installation_created();
    deleted["action"] = json!("deleted");
    let (status, _) = p.deliver("installation", "uninstall-1", &deleted).await;
    assert_eq!(status, StatusCode::OK);

    let body = p.comment("c-1", 500, MAINTAINER, "/reward 50 USDC").await;
    assert_eq!(body["status"], "no_instruction");
    assert!(p.store.all_jobs().is_empty());
    assert!(p.store.get_organization(42).await.unwrap().is_some());
}

#[tokio::test]
async fn store_outage_fails_delivery_for_redelivery() {
    let p = pipeline();
    p.store.set_fail_writes(true);

    let (status, body) = p
        .deliver("installation", "install-1", &installation_created())
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error_code"], "STORE_UNAVAILABLE");

    p.store.set_fail_writes(false);
    let (status, _) = p
        .deliver("installation", "install-1", &installation_created())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(p.store.find_repository(7).await.unwrap().is_some());
}

#[tokio::test]
async fn forged_delivery_changes_nothing() {
    let p = pipeline();
    let bytes = installation_created().to_string().into_bytes();
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header(HEADER_EVENT, "installation")
        .header(HEADER_DELIVERY, "forged")
        .header(HEADER_SIGNATURE, sign(&bytes, b"guessed"))
        .body(Body::from(bytes))
        .unwrap();

    let (status, _) = p.send(request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(p.store.organization_count(), 0);
    assert!(p.store.delivery("forged").is_none());
}
