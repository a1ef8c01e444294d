//! Typed GitHub webhook payloads.
//!
//! Only the fields the pipeline reads are declared; serde ignores the rest.

use serde::{Deserialize, Serialize};

pub const HEADER_EVENT: &str = "x-github-event";
pub const HEADER_DELIVERY: &str = "x-github-delivery";
pub const HEADER_SIGNATURE: &str = "x-hub-signature-256";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installation {
    pub id: i64,
    pub account: Account,
}

/// Repository as listed in installation payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub full_name: Option<String>,
}

/// Just the action, read before the full payload is parsed
#[derive(Debug, Deserialize)]
pub struct ActionEnvelope {
    #[serde(default)]
    pub action: Option<String>,
}

/// `installation` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationEvent {
    pub action: String,
    pub installation: Installation,
    #[serde(default)]
    pub repositories: Vec<RepositoryRef>,
    pub sender: Account,
}

/// `installation_repositories` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationRepositoriesEvent {
    pub action: String,
    pub installation: Installation,
    #[serde(default)]
    pub repositories_added: Vec<RepositoryRef>,
    #[serde(default)]
    pub repositories_removed: Vec<RepositoryRef>,
    pub sender: Account,
}

/// `repository` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryEvent {
    pub action: String,
    pub repository: RepositoryRef,
    pub sender: Account,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub number: i64,
    pub user: Account,
    /// Present only when the issue is a pull request
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    #[serde(default)]
    pub body: String,
    pub user: Account,
}

/// `issue_comment` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCommentEvent {
    pub action: String,
    pub issue: Issue,
    pub comment: Comment,
    pub repository: RepositoryRef,
}

impl IssueCommentEvent {
    pub fn is_on_pull_request(&self) -> bool {
        self.issue
            .pull_request
            .as_ref()
            .is_some_and(|pr| !pr.is_null())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_comment_on_pull_request() {
        let payload = serde_json::json!({
            "action": "created",
            "issue": {
                "number": 12,
                "user": {"id": 99, "login": "contributor"},
                "pull_request": {"url": "https://api.github.com/repos/acme/widgets/pulls/12"}
            },
            "comment": {"id": 1, "body": "/reward 50 USDC", "user": {"id": 5, "login": "lead"}},
            "repository": {"id": 7, "name": "widgets", "full_name": "acme/widgets"}
        });

        let event: IssueCommentEvent = serde_json::from_value(payload).unwrap();
        assert!(event.is_on_pull_request());
        assert_eq!(event.issue.user.id, 99);
    }

    #[test]
    fn test_issue_comment_on_plain_issue() {
        let payload = serde_json::json!({
            "action": "created",
            "issue": {"number": 3, "user": {"id": 99, "login": "contributor"}},
            "comment": {"id": 1, "body": "hi", "user": {"id": 5, "login": "lead"}},
            "repository": {"id": 7, "name": "widgets"}
        });

        let event: IssueCommentEvent = serde_json::from_value(payload).unwrap();
        assert!(!event.is_on_pull_request());
    }
}
