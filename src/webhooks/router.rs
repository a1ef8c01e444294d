//! Classification of verified deliveries.
//!
//! Dispatch is a closed enum over the (event type, action) pairs the
//! pipeline handles. Everything else resolves to `Ignored`, which is a
//! successful no-op for the sender.

use serde::de::DeserializeOwned;

use super::events::*;
use crate::error::WebhookError;

#[derive(Debug, Clone, PartialEq)]
pub enum GitHubEvent {
    InstallationCreated(InstallationEvent),
    InstallationDeleted(InstallationEvent),
    RepositoriesAdded(InstallationRepositoriesEvent),
    RepositoriesRemoved(InstallationRepositoriesEvent),
    RepositoryRenamed(RepositoryEvent),
    /// `issue_comment.created` on a pull request
    PullRequestComment(IssueCommentEvent),
    Ignored {
        event_type: String,
        action: Option<String>,
    },
}

impl GitHubEvent {
    /// Classify a verified body by the `X-GitHub-Event` header and its action.
    ///
    /// Undeclared event types are ignored without looking at the body, so
    /// `ping` and friends never need to be valid JSON for us. A declared
    /// pair with a body that does not match its schema is an error.
    pub fn classify(event_type: &str, body: &[u8]) -> Result<Self, WebhookError> {
        if !matches!(
            event_type,
            "installation" | "installation_repositories" | "repository" | "issue_comment"
        ) {
            return Ok(Self::ignored(event_type, None));
        }

        let envelope: ActionEnvelope = parse(event_type, body)?;
        let action = envelope.action;

        let event = match (event_type, action.as_deref()) {
            ("installation", Some("created")) => {
                GitHubEvent::InstallationCreated(parse(event_type, body)?)
            }
            ("installation", Some("deleted")) => {
                GitHubEvent::InstallationDeleted(parse(event_type, body)?)
            }
            ("installation_repositories", Some("added")) => {
                GitHubEvent::RepositoriesAdded(parse(event_type, body)?)
            }
            ("installation_repositories", Some("removed")) => {
                GitHubEvent::RepositoriesRemoved(parse(event_type, body)?)
            }
            ("repository", Some("renamed")) => {
                GitHubEvent::RepositoryRenamed(parse(event_type, body)?)
            }
            ("issue_comment", Some("created")) => {
                let comment: IssueCommentEvent = parse(event_type, body)?;
                if comment.is_on_pull_request() {
                    GitHubEvent::PullRequestComment(comment)
                } else {
                    Self::ignored(event_type, action)
                }
            }
            _ => Self::ignored(event_type, action),
        };

        Ok(event)
    }

    fn ignored(event_type: &str, action: Option<String>) -> Self {
        GitHubEvent::Ignored {
            event_type: event_type.to_string(),
            action,
        }
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, GitHubEvent::Ignored { .. })
    }

    /// `event.action` label for logs
    pub fn name(&self) -> String {
        match self {
            GitHubEvent::InstallationCreated(_) => "installation.created".to_string(),
            GitHubEvent::InstallationDeleted(_) => "installation.deleted".to_string(),
            GitHubEvent::RepositoriesAdded(_) => "installation_repositories.added".to_string(),
            GitHubEvent::RepositoriesRemoved(_) => "installation_repositories.removed".to_string(),
            GitHubEvent::RepositoryRenamed(_) => "repository.renamed".to_string(),
            GitHubEvent::PullRequestComment(_) => "issue_comment.created".to_string(),
            GitHubEvent::Ignored { event_type, action } => match action {
                Some(action) => format!("{}.{}", event_type, action),
                None => event_type.clone(),
            },
        }
    }

    pub fn action(&self) -> Option<&str> {
        match self {
            GitHubEvent::InstallationCreated(e) | GitHubEvent::InstallationDeleted(e) => {
                Some(&e.action)
            }
            GitHubEvent::RepositoriesAdded(e) | GitHubEvent::RepositoriesRemoved(e) => {
                Some(&e.action)
            }
            GitHubEvent::RepositoryRenamed(e) => Some(&e.action),
            GitHubEvent::PullRequestComment(e) => Some(&e.action),
            GitHubEvent::Ignored { action, .. } => action.as_deref(),
        }
    }
}

fn parse<T: DeserializeOwned>(event_type: &str, body: &[u8]) -> Result<T, WebhookError> {
    serde_json::from_slice(body).map_err(|source| WebhookError::MalformedPayload {
        event: event_type.to_string(),
        source,
    })
}
