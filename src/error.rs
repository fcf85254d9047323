//! Typed failures callers branch on. Everything else travels as `anyhow::Error`
//! with context attached; these are recovered with `downcast_ref`.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("project {0} not found")]
    ProjectNotFound(i64),

    #[error("project {0} has no remote configured")]
    NotConfigured(i64),

    #[error("invalid git settings: {0}")]
    InvalidSettings(String),

    #[error("section hierarchy contains a cycle through sections {0:?}")]
    SectionCycle(Vec<i64>),

    #[error("unresolved conflicts in {} path(s): {}", .0.len(), .0.join(", "))]
    UnresolvedConflicts(Vec<String>),

    #[error("{step} timed out after {}s", .timeout.as_secs())]
    Timeout { step: String, timeout: Duration },

    #[error("remote rejected push of {refname}: {message}")]
    PushRejected { refname: String, message: String },
}

impl SyncError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::ProjectNotFound(_) => "project_not_found",
            SyncError::NotConfigured(_) => "not_configured",
            SyncError::InvalidSettings(_) => "invalid_settings",
            SyncError::SectionCycle(_) => "section_cycle",
            SyncError::UnresolvedConflicts(_) => "unresolved_conflicts",
            SyncError::Timeout { .. } => "timeout",
            SyncError::PushRejected { .. } => "push_rejected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = SyncError::UnresolvedConflicts(vec![
            "test_cases/4.json".to_string(),
            "manifest.json".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "unresolved conflicts in 2 path(s): test_cases/4.json, manifest.json"
        );

        let err = SyncError::Timeout {
            step: "fetch".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "fetch timed out after 30s");
        assert_eq!(err.code(), "timeout");
    }
}
