//! Trigger events and the pull-request context handed to checks.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The event that selects which checks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    Manual,
    PrOpened,
    PrUpdated,
    PrClosed,
    IssueOpened,
    IssueComment,
    Scheduled,
}

impl Default for TriggerEvent {
    fn default() -> Self {
        Self::Manual
    }
}

impl TriggerEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::PrOpened => "pr_opened",
            Self::PrUpdated => "pr_updated",
            Self::PrClosed => "pr_closed",
            Self::IssueOpened => "issue_opened",
            Self::IssueComment => "issue_comment",
            Self::Scheduled => "scheduled",
        }
    }
}

impl std::str::FromStr for TriggerEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "pr_opened" => Ok(Self::PrOpened),
            "pr_updated" => Ok(Self::PrUpdated),
            "pr_closed" => Ok(Self::PrClosed),
            "issue_opened" => Ok(Self::IssueOpened),
            "issue_comment" => Ok(Self::IssueComment),
            "scheduled" => Ok(Self::Scheduled),
            other => Err(format!("unknown trigger event: {other}")),
        }
    }
}

/// The author's relationship to the repository, used by permission
/// predicates. Ordered weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorAssociation {
    None,
    FirstTimer,
    Contributor,
    Collaborator,
    Member,
    Owner,
}

impl Default for AuthorAssociation {
    fn default() -> Self {
        Self::None
    }
}

impl AuthorAssociation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::FirstTimer => "first_timer",
            Self::Contributor => "contributor",
            Self::Collaborator => "collaborator",
            Self::Member => "member",
            Self::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "first_timer" => Self::FirstTimer,
            "contributor" => Self::Contributor,
            "collaborator" => Self::Collaborator,
            "member" => Self::Member,
            "owner" => Self::Owner,
            _ => Self::None,
        }
    }
}

/// One changed file in the pull request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    #[serde(default)]
    pub additions: u32,
    #[serde(default)]
    pub deletions: u32,
    /// `added`, `modified`, `removed`, `renamed`.
    #[serde(default)]
    pub status: String,
}

/// Pull-request context available to providers and templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrInfo {
    #[serde(default)]
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub author_association: AuthorAssociation,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub base_branch: String,
    #[serde(default)]
    pub files: Vec<FileChange>,
}

/// The full input event for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventContext {
    #[serde(default)]
    pub event: TriggerEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<PrInfo>,
    /// Free-form run inputs (`args` in templates).
    #[serde(default)]
    pub inputs: HashMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trips_as_str() {
        for e in [
            TriggerEvent::Manual,
            TriggerEvent::PrOpened,
            TriggerEvent::PrUpdated,
            TriggerEvent::PrClosed,
            TriggerEvent::IssueOpened,
            TriggerEvent::IssueComment,
            TriggerEvent::Scheduled,
        ] {
            let parsed: TriggerEvent = e.as_str().parse().unwrap();
            assert_eq!(parsed, e);
        }
    }

    #[test]
    fn event_parse_rejects_unknown() {
        assert!("pr_reopened".parse::<TriggerEvent>().is_err());
    }

    #[test]
    fn association_ordering() {
        assert!(AuthorAssociation::Owner > AuthorAssociation::Member);
        assert!(AuthorAssociation::Member > AuthorAssociation::Collaborator);
        assert!(AuthorAssociation::Collaborator > AuthorAssociation::Contributor);
        assert!(AuthorAssociation::Contributor > AuthorAssociation::FirstTimer);
        assert!(AuthorAssociation::FirstTimer > AuthorAssociation::None);
    }

    #[test]
    fn association_parse_defaults_to_none() {
        assert_eq!(AuthorAssociation::parse("owner"), AuthorAssociation::Owner);
        assert_eq!(AuthorAssociation::parse("stranger"), AuthorAssociation::None);
    }

    #[test]
    fn event_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&TriggerEvent::IssueComment).unwrap(),
            "\"issue_comment\""
        );
    }
}
