//! Applies classified events to persisted state.
//!
//! Every handler is an upsert keyed by GitHub ids, so a redelivered event
//! converges on the same rows it produced the first time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::events::*;
use super::router::GitHubEvent;
use crate::comments::{CommentContext, CommentParser, ParseOutcome, RejectReason};
use crate::error::AppResult;
use crate::ledger::models::{EnqueueOutcome, Organization, OrganizationUpsert, RepositoryUpsert};
use crate::ledger::store::RewardStore;
use crate::queue::JobQueue;

/// What applying an event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Installation or repository state updated
    Applied,
    Enqueued(EnqueueOutcome),
    NoInstruction(RejectReason),
    Ignored,
}

impl HandlerOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            HandlerOutcome::Applied => "applied",
            HandlerOutcome::Enqueued(EnqueueOutcome::Created(_)) => "enqueued",
            HandlerOutcome::Enqueued(EnqueueOutcome::Existing(_)) => "already_enqueued",
            HandlerOutcome::NoInstruction(_) => "no_instruction",
            HandlerOutcome::Ignored => "ignored",
        }
    }

    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            HandlerOutcome::Enqueued(outcome) => Some(outcome.job_id()),
            _ => None,
        }
    }
}

/// Installation, repository and comment handlers behind the webhook route
pub struct EventHandlers {
    store: Arc<dyn RewardStore>,
    queue: Arc<JobQueue>,
    parser: CommentParser,
}

impl EventHandlers {
    pub fn new(store: Arc<dyn RewardStore>, queue: Arc<JobQueue>, parser: CommentParser) -> Self {
        Self {
            store,
            queue,
            parser,
        }
    }

    pub async fn apply(&self, event: &GitHubEvent) -> AppResult<HandlerOutcome> {
        self.apply_at(event, Utc::now()).await
    }

    #[instrument(skip(self, event), fields(event = %event.name()))]
    pub async fn apply_at(&self, event: &GitHubEvent, now: DateTime<Utc>) -> AppResult<HandlerOutcome> {
        match event {
            GitHubEvent::InstallationCreated(e) => {
                self.installation_created(e, now).await?;
                Ok(HandlerOutcome::Applied)
            }
            GitHubEvent::InstallationDeleted(e) => {
                self.installation_deleted(e, now).await?;
                Ok(HandlerOutcome::Applied)
            }
            GitHubEvent::RepositoriesAdded(e) => {
                self.repositories_added(e, now).await?;
                Ok(HandlerOutcome::Applied)
            }
            GitHubEvent::RepositoriesRemoved(e) => {
                self.repositories_removed(e, now).await?;
                Ok(HandlerOutcome::Applied)
            }
            GitHubEvent::RepositoryRenamed(e) => {
                self.repository_renamed(e, now).await?;
                Ok(HandlerOutcome::Applied)
            }
            GitHubEvent::PullRequestComment(e) => self.pull_request_comment(e).await,
            GitHubEvent::Ignored { .. } => {
                debug!("Ignoring {}", event.name());
                Ok(HandlerOutcome::Ignored)
            }
        }
    }

    // ========== INSTALLATION OPERATIONS ==========

    async fn installation_created(&self, event: &InstallationEvent, now: DateTime<Utc>) -> AppResult<()> {
        let org = self.upsert_installation(&event.installation, now).await?;
        self.attach_repositories(&org, &event.repositories, event.sender.id, now)
            .await?;

        info!(
            "✅ Installation {} for {} ({} repositories)",
            event.installation.id,
            org.name,
            event.repositories.len()
        );
        Ok(())
    }

    async fn installation_deleted(&self, event: &InstallationEvent, now: DateTime<Utc>) -> AppResult<()> {
        let account = &event.installation.account;
        if self.store.deactivate_organization(account.id, now).await? {
            info!("Installation removed, organization {} deactivated", account.login);
        } else {
            warn!(
                "⚠️ Uninstall for unknown organization {} ({})",
                account.login, account.id
            );
        }
        Ok(())
    }

    async fn repositories_added(
        &self,
        event: &InstallationRepositoriesEvent,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let org = self.upsert_installation(&event.installation, now).await?;
        self.attach_repositories(&org, &event.repositories_added, event.sender.id, now)
            .await?;

        info!(
            "✅ {} repositories added to {}",
            event.repositories_added.len(),
            org.name
        );
        Ok(())
    }

    async fn repositories_removed(
        &self,
        event: &InstallationRepositoriesEvent,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let ids: Vec<i64> = event.repositories_removed.iter().map(|r| r.id).collect();
        let touched = self.store.deactivate_repositories(&ids, now).await?;

        info!(
            "Repositories removed from {}: {} deactivated",
            event.installation.account.login, touched
        );
        Ok(())
    }

    async fn repository_renamed(&self, event: &RepositoryEvent, now: DateTime<Utc>) -> AppResult<()> {
        let repo = &event.repository;
        match self.store.rename_repository(repo.id, &repo.name, now).await? {
            Some(_) => info!("Repository {} renamed to {}", repo.id, repo.name),
            None => warn!("⚠️ Rename for unknown repository {} ({})", repo.id, repo.name),
        }
        Ok(())
    }

    async fn upsert_installation(
        &self,
        installation: &Installation,
        now: DateTime<Utc>,
    ) -> AppResult<Organization> {
        self.store
            .upsert_organization(
                OrganizationUpsert {
                    github_org_id: installation.account.id,
                    name: installation.account.login.clone(),
                    installation_id: installation.id,
                },
                now,
            )
            .await
    }

    /// The installing user becomes a maintainer of every repository it grants.
    async fn attach_repositories(
        &self,
        org: &Organization,
        repositories: &[RepositoryRef],
        sender_id: i64,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        for repo in repositories {
            let stored = self
                .store
                .upsert_repository(
                    RepositoryUpsert {
                        github_repo_id: repo.id,
                        organization_id: org.id,
                        name: repo.name.clone(),
                    },
                    now,
                )
                .await?;
            self.store.upsert_maintainer(stored.id, sender_id, now).await?;
        }
        Ok(())
    }

    // ========== COMMENT OPERATIONS ==========

    async fn pull_request_comment(&self, event: &IssueCommentEvent) -> AppResult<HandlerOutcome> {
        let ctx = CommentContext {
            github_repo_id: event.repository.id,
            pr_number: event.issue.number,
            comment_id: event.comment.id,
            commentor_github_id: event.comment.user.id,
            contributor_github_id: event.issue.user.id,
        };

        match self
            .parser
            .evaluate(self.store.as_ref(), &ctx, &event.comment.body)
            .await?
        {
            ParseOutcome::Instruction(instruction) => {
                let outcome = self.queue.enqueue(&instruction).await?;
                Ok(HandlerOutcome::Enqueued(outcome))
            }
            ParseOutcome::NoInstruction(reason) => Ok(HandlerOutcome::NoInstruction(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::InMemoryLedger;
    use crate::ledger::models::{Chain, Currency, JobStatus};
    use crate::queue::RetryPolicy;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn setup() -> (Arc<InMemoryLedger>, EventHandlers) {
        let store = Arc::new(InMemoryLedger::new());
        let queue = Arc::new(JobQueue::new(
            store.clone(),
            RetryPolicy::default(),
            chrono::Duration::seconds(300),
        ));
        let handlers = EventHandlers::new(
            store.clone(),
            queue,
            CommentParser::new("/reward", Currency::Usdc, Chain::Polygon),
        );
        (store, handlers)
    }

    fn event(event_type: &str, payload: serde_json::Value) -> GitHubEvent {
        GitHubEvent::classify(event_type, payload.to_string().as_bytes()).unwrap()
    }

    fn installation(action: &str) -> GitHubEvent {
        event(
            "installation",
            json!({
                "action": action,
                "installation": { "id": 1001, "account": { "id": 42, "login": "acme" } },
                "repositories": [{ "id": 7, "name": "widgets" }, { "id": 8, "name": "gadgets" }],
                "sender": { "id": 5, "login": "octocat" }
            }),
        )
    }

    fn comment(commentor: i64, body: &str) -> GitHubEvent {
        event(
            "issue_comment",
            json!({
                "action": "created",
                "issue": { "number": 12, "user": { "id": 99, "login": "dev" }, "pull_request": { "url": "x" } },
                "comment": { "id": 555, "body": body, "user": { "id": commentor, "login": "m" } },
                "repository": { "id": 7, "name": "widgets" }
            }),
        )
    }

    #[tokio::test]
    async fn test_installation_created_is_idempotent() {
        let (store, handlers) = setup();
        let created = installation("created");

        assert_eq!(handlers.apply(&created).await.unwrap(), HandlerOutcome::Applied);
        handlers.apply(&created).await.unwrap();

        assert_eq!(store.organization_count(), 1);
        assert_eq!(store.repository_count(), 2);
        assert_eq!(store.maintainer_count(), 2);
        let repo = store.find_repository(7).await.unwrap().unwrap();
        assert!(store.is_maintainer(repo.id, 5).await.unwrap());
    }

    #[tokio::test]
    async fn test_installation_deleted_deactivates() {
        let (store, handlers) = setup();
        handlers.apply(&installation("created")).await.unwrap();
        handlers.apply(&installation("deleted")).await.unwrap();

        assert!(!store.get_organization(42).await.unwrap().unwrap().is_active);
        assert!(!store.find_repository(7).await.unwrap().unwrap().is_active);
        assert_eq!(store.maintainer_count(), 0);

        // Reinstalling grants the installer again, nobody else
        handlers.apply(&installation("created")).await.unwrap();
        assert_eq!(store.maintainer_count(), 2);
        let repo = store.find_repository(7).await.unwrap().unwrap();
        assert!(repo.is_active);
        assert!(store.is_maintainer(repo.id, 5).await.unwrap());
    }

    #[tokio::test]
    async fn test_repositories_added_and_removed() {
        let (store, handlers) = setup();
        let payload = |action: &str| {
            json!({
                "action": action,
                "installation": { "id": 1001, "account": { "id": 42, "login": "acme" } },
                "repositories_added": if action == "added" { json!([{ "id": 9, "name": "new" }]) } else { json!([]) },
                "repositories_removed": if action == "removed" { json!([{ "id": 9, "name": "new" }]) } else { json!([]) },
                "sender": { "id": 6, "login": "admin" }
            })
        };

        handlers
            .apply(&event("installation_repositories", payload("added")))
            .await
            .unwrap();
        let repo = store.find_repository(9).await.unwrap().unwrap();
        assert!(repo.is_active);
        assert!(store.is_maintainer(repo.id, 6).await.unwrap());

        handlers
            .apply(&event("installation_repositories", payload("removed")))
            .await
            .unwrap();
        assert!(!store.find_repository(9).await.unwrap().unwrap().is_active);
        assert!(!store.is_maintainer(repo.id, 6).await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_keeps_identity() {
        let (store, handlers) = setup();
        handlers.apply(&installation("created")).await.unwrap();
        let before = store.find_repository(7).await.unwrap().unwrap();

        let renamed = event(
            "repository",
            json!({
                "action": "renamed",
                "repository": { "id": 7, "name": "sprockets" },
                "sender": { "id": 5, "login": "octocat" }
            }),
        );
        handlers.apply(&renamed).await.unwrap();

        let after = store.find_repository(7).await.unwrap().unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.name, "sprockets");
        assert_eq!(store.repository_count(), 2);
    }

    #[tokio::test]
    async fn test_rename_unknown_repository_is_noop() {
        let (store, handlers) = setup();
        let renamed = event(
            "repository",
            json!({
                "action": "renamed",
                "repository": { "id": 77, "name": "ghost" },
                "sender": { "id": 5, "login": "octocat" }
            }),
        );
        assert_eq!(handlers.apply(&renamed).await.unwrap(), HandlerOutcome::Applied);
        assert_eq!(store.repository_count(), 0);
    }

    #[tokio::test]
    async fn test_comment_from_maintainer_enqueues() {
        let (store, handlers) = setup();
        handlers.apply(&installation("created")).await.unwrap();

        let outcome = handlers.apply(&comment(5, "/reward 50 USDC")).await.unwrap();
        assert_eq!(outcome.label(), "enqueued");

        let jobs = store.all_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].amount, dec!(50));
        assert_eq!(jobs[0].contributor_github_id, 99);
        assert_eq!(jobs[0].commentor_github_id, 5);
        assert_eq!(jobs[0].pr_number, 12);
        assert_eq!(jobs[0].status, JobStatus::Pending);
        assert_eq!(outcome.job_id(), Some(jobs[0].id));
    }

    #[tokio::test]
    async fn test_comment_from_outsider_is_rejected() {
        let (store, handlers) = setup();
        handlers.apply(&installation("created")).await.unwrap();

        let outcome = handlers.apply(&comment(1234, "/reward 50 USDC")).await.unwrap();
        assert_eq!(
            outcome,
            HandlerOutcome::NoInstruction(RejectReason::UnauthorizedCommentor)
        );
        assert!(store.all_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let (store, handlers) = setup();
        store.set_fail_writes(true);

        let err = handlers.apply(&installation("created")).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
