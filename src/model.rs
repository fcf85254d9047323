//! Test-management records as they are stored in PostgreSQL and written to the sync tree.
//!
//! Soft-deleted rows never leave the store, so the records carry no `is_deleted`
//! flag. Field order is the on-disk key order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Section {
    pub id: i64,
    pub project_id: i64,
    pub parent_id: Option<i64>,
    pub name: String,
    pub description: Option<String>,
    pub position: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStep {
    pub action: String,
    pub expected: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TestCase {
    pub id: i64,
    pub project_id: i64,
    pub section_id: Option<i64>,
    pub title: String,
    pub preconditions: Option<String>,
    #[sqlx(json)]
    pub steps: Vec<TestStep>,
    pub expected_result: Option<String>,
    pub priority: String,
    pub case_type: String,
    pub status: String,
    pub tags: Vec<String>,
    pub position: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TestPlan {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: String,
    /// Ordered membership; order is the execution order shown to testers
    pub test_case_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub test_case_id: i64,
    pub status: String,
    pub comment: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TestRun {
    pub id: i64,
    pub project_id: i64,
    pub plan_id: Option<i64>,
    pub name: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[sqlx(json)]
    pub results: Vec<RunResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Attachment {
    pub id: i64,
    pub project_id: i64,
    pub test_case_id: Option<i64>,
    pub original_name: String,
    /// File name inside the attachment storage directory. Local to one
    /// installation, so it is not part of the exported row.
    #[serde(default, skip_serializing)]
    pub stored_name: String,
    pub mime_type: Option<String>,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

/// Per-project git sync settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct GitSettings {
    pub project_id: i64,
    pub remote_url: Option<String>,
    pub branch: String,
    pub access_token: Option<String>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_commit: Option<String>,
}

impl GitSettings {
    pub fn new(project_id: i64, branch: impl Into<String>) -> Self {
        Self {
            project_id,
            remote_url: None,
            branch: branch.into(),
            access_token: None,
            author_name: None,
            author_email: None,
            last_sync_at: None,
            last_commit: None,
        }
    }

    pub fn view(&self) -> GitSettingsView {
        GitSettingsView {
            project_id: self.project_id,
            remote_url: self.remote_url.clone(),
            branch: self.branch.clone(),
            has_access_token: self
                .access_token
                .as_deref()
                .is_some_and(|token| !token.is_empty()),
            author_name: self.author_name.clone(),
            author_email: self.author_email.clone(),
            last_sync_at: self.last_sync_at,
            last_commit: self.last_commit.clone(),
        }
    }
}

/// Settings as shown to clients; the token itself never leaves the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitSettingsView {
    pub project_id: i64,
    pub remote_url: Option<String>,
    pub branch: String,
    pub has_access_token: bool,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_commit: Option<String>,
}

/// Partial update accepted from clients. `Some("")` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitSettingsUpdate {
    pub remote_url: Option<String>,
    pub branch: Option<String>,
    pub access_token: Option<String>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Section,
    TestCase,
    TestPlan,
    TestRun,
    Attachment,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Section,
        EntityKind::TestCase,
        EntityKind::TestPlan,
        EntityKind::TestRun,
        EntityKind::Attachment,
    ];

    /// Directory name in the sync tree
    pub fn dir_name(self) -> &'static str {
        match self {
            EntityKind::Section => "sections",
            EntityKind::TestCase => "test_cases",
            EntityKind::TestPlan => "test_plans",
            EntityKind::TestRun => "test_runs",
            EntityKind::Attachment => "attachments",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Section => "sections",
            EntityKind::TestCase => "test_cases",
            EntityKind::TestPlan => "test_plans",
            EntityKind::TestRun => "test_runs",
            EntityKind::Attachment => "attachments",
        }
    }

    pub fn supports_soft_delete(self) -> bool {
        !matches!(self, EntityKind::Attachment)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_view_hides_token() {
        let mut settings = GitSettings::new(4, "main");
        settings.access_token = Some("ghp_secret".to_string());

        let view = settings.view();
        assert!(view.has_access_token);
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("ghp_secret"));
    }

    #[test]
    fn test_empty_token_is_not_a_token() {
        let mut settings = GitSettings::new(4, "main");
        settings.access_token = Some(String::new());
        assert!(!settings.view().has_access_token);
    }

    #[test]
    fn test_entity_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&EntityKind::TestCase).unwrap(),
            "\"test_case\""
        );
        assert_eq!(EntityKind::TestRun.dir_name(), "test_runs");
        assert!(!EntityKind::Attachment.supports_soft_delete());
    }
}
