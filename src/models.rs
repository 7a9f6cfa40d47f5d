use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimal GitHub-compatible user representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleUser {
    pub login: String,
    pub id: i64,
    pub avatar_url: String,
    #[serde(rename = "type")]
    pub user_type: String,
}

impl SimpleUser {
    pub fn user(login: &str, id: i64) -> Self {
        Self {
            login: login.to_string(),
            id,
            avatar_url: String::new(),
            user_type: "User".to_string(),
        }
    }

    /// Identity used for comments posted by resolution sessions.
    pub fn bot() -> Self {
        Self {
            login: "attractor-bot".to_string(),
            id: 0,
            avatar_url: String::new(),
            user_type: "Bot".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub id: i64,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "default", default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    #[default]
    Open,
    Closed,
}

impl IssueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl FromStr for IssueState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Invalid issue state: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: i64,
    pub number: i64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub state: IssueState,
    #[serde(default)]
    pub state_reason: Option<String>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub assignees: Vec<SimpleUser>,
    #[serde(default)]
    pub comments: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_by: Option<SimpleUser>,
    #[serde(default = "default_association")]
    pub author_association: String,
    pub user: SimpleUser,
}

impl Issue {
    /// A fresh open issue; `id` and `number` are always the same value.
    pub fn new(number: i64, title: &str, user: SimpleUser, now: DateTime<Utc>) -> Self {
        Self {
            id: number,
            number,
            title: title.to_string(),
            body: None,
            state: IssueState::Open,
            state_reason: None,
            labels: Vec::new(),
            assignees: Vec::new(),
            comments: 0,
            created_at: now,
            updated_at: now,
            closed_at: None,
            closed_by: None,
            author_association: default_association(),
            user,
        }
    }

    /// Close the issue, keeping `state_reason`, `closed_at` and `closed_by`
    /// populated together.
    pub fn close(&mut self, by: SimpleUser, reason: Option<&str>, now: DateTime<Utc>) {
        self.state = IssueState::Closed;
        self.state_reason = Some(reason.unwrap_or("completed").to_string());
        self.closed_at = Some(now);
        self.closed_by = Some(by);
        self.updated_at = now;
    }

    pub fn reopen(&mut self, now: DateTime<Utc>) {
        self.state = IssueState::Open;
        self.state_reason = None;
        self.closed_at = None;
        self.closed_by = None;
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub body: String,
    pub user: SimpleUser,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_association")]
    pub author_association: String,
}

fn default_association() -> String {
    "OWNER".to_string()
}

/// Auto-increment counters stored as `meta.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default = "one")]
    pub next_issue_id: i64,
    #[serde(default = "one")]
    pub next_comment_id: i64,
}

fn one() -> i64 {
    1
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            next_issue_id: 1,
            next_comment_id: 1,
        }
    }
}

/// Contents of `.attractor-store.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreManifest {
    pub store_id: String,
}

/// Paginated list wrapper compatible with GitHub-style responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total_count: usize,
    pub page: usize,
    pub per_page: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    #[default]
    Created,
    Updated,
    Comments,
}

impl FromStr for SortKey {
    type Err = String;

    /// Unknown keys sort by creation time.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "updated" => Self::Updated,
            "comments" => Self::Comments,
            _ => Self::Created,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    #[default]
    Desc,
}

/// Query parameters for listing issues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssueFilters {
    /// `open`, `closed` or `all`; `None` disables the state filter.
    pub state: Option<String>,
    /// Comma-separated label names, all of which must be present.
    pub labels: Option<String>,
    /// `none`, `*` or a login.
    pub assignee: Option<String>,
    pub sort: SortKey,
    pub direction: Direction,
    pub page: usize,
    pub per_page: usize,
}

impl Default for IssueFilters {
    fn default() -> Self {
        Self {
            state: Some("open".to_string()),
            labels: None,
            assignee: None,
            sort: SortKey::Created,
            direction: Direction::Desc,
            page: 1,
            per_page: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of one resolution session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub project: String,
    pub issue_number: i64,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_user_serializes_type_field() {
        let json = serde_json::to_value(SimpleUser::bot()).unwrap();
        assert_eq!(json["type"], "Bot");
        assert_eq!(json["login"], "attractor-bot");
        assert!(json.get("user_type").is_none());
    }

    #[test]
    fn test_label_default_flag_uses_wire_name() {
        let label: Label =
            serde_json::from_str(r#"{"id":1,"name":"bug","color":"d73a4a","default":true}"#)
                .unwrap();
        assert!(label.is_default);
        assert_eq!(label.description, None);
    }

    #[test]
    fn test_issue_close_and_reopen_keep_closed_fields_together() {
        let now = Utc::now();
        let mut issue = Issue::new(4, "Crash", SimpleUser::user("local-user", 1), now);
        assert_eq!(issue.id, issue.number);

        issue.close(SimpleUser::user("local-user", 1), None, now);
        assert_eq!(issue.state, IssueState::Closed);
        assert_eq!(issue.state_reason.as_deref(), Some("completed"));
        assert!(issue.closed_at.is_some());
        assert!(issue.closed_by.is_some());

        issue.reopen(now);
        assert_eq!(issue.state, IssueState::Open);
        assert!(issue.state_reason.is_none());
        assert!(issue.closed_at.is_none());
        assert!(issue.closed_by.is_none());
    }

    #[test]
    fn test_issue_deserializes_with_defaults() {
        let json = r#"{
            "id": 2, "number": 2, "title": "t",
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z",
            "user": {"login": "u", "id": 1, "avatar_url": "", "type": "User"}
        }"#;
        let issue: Issue = serde_json::from_str(json).unwrap();
        assert_eq!(issue.state, IssueState::Open);
        assert_eq!(issue.comments, 0);
        assert_eq!(issue.author_association, "OWNER");
    }

    #[test]
    fn test_sort_key_unknown_falls_back_to_created() {
        assert_eq!("bogus".parse::<SortKey>().unwrap(), SortKey::Created);
        assert_eq!("comments".parse::<SortKey>().unwrap(), SortKey::Comments);
    }

    #[test]
    fn test_session_info_is_camel_case() {
        let info = SessionInfo {
            project: "demo".into(),
            issue_number: 7,
            status: SessionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["issueNumber"], 7);
        assert_eq!(json["status"], "running");
        assert!(json.get("startedAt").is_some());
    }

    #[test]
    fn test_meta_defaults_when_fields_missing() {
        let meta: Meta = serde_json::from_str("{}").unwrap();
        assert_eq!(meta, Meta::default());
    }
}
