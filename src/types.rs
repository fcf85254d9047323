// Validated Types
// Strongly-typed wrappers that cannot be constructed with invalid data.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A project identifier that refers to an existing-looking row (> 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValidatedProjectId {
    inner: i64,
}

impl ValidatedProjectId {
    pub fn new(id: i64) -> Result<Self> {
        ensure!(id > 0, "Project ID must be positive, got {id}");
        Ok(Self { inner: id })
    }

    pub fn get(&self) -> i64 {
        self.inner
    }
}

impl fmt::Display for ValidatedProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A branch name that git will accept as `refs/heads/<name>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedBranchName {
    inner: String,
}

impl ValidatedBranchName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        crate::validation::branch::validate_branch_name(&name)?;
        Ok(Self { inner: name })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// Full local ref, e.g. `refs/heads/main`
    pub fn local_ref(&self) -> String {
        format!("refs/heads/{}", self.inner)
    }

    /// Remote-tracking ref for `origin`, e.g. `refs/remotes/origin/main`
    pub fn remote_ref(&self) -> String {
        format!("refs/remotes/origin/{}", self.inner)
    }
}

impl fmt::Display for ValidatedBranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

/// A remote URL without embedded credentials
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedRemoteUrl {
    inner: String,
}

impl ValidatedRemoteUrl {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        crate::validation::remote::validate_remote_url(&url)?;
        Ok(Self { inner: url })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn is_https(&self) -> bool {
        self.inner.starts_with("https://")
    }
}

impl fmt::Display for ValidatedRemoteUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

/// A file name safe to place inside a single directory on any platform
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SanitizedFileName {
    inner: String,
}

impl SanitizedFileName {
    const MAX_LEN: usize = 120;

    /// Replace anything outside `[A-Za-z0-9._-]` with `_`, strip leading dots,
    /// and cap the length while keeping the extension.
    pub fn new(raw: &str) -> Self {
        let base = raw
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(raw);

        let mut cleaned: String = base
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        cleaned = cleaned.trim_start_matches('.').to_string();

        if cleaned.len() > Self::MAX_LEN {
            let ext = cleaned
                .rfind('.')
                .map(|idx| cleaned[idx..].to_string())
                .filter(|ext| ext.len() < 16)
                .unwrap_or_default();
            cleaned.truncate(Self::MAX_LEN - ext.len());
            cleaned.push_str(&ext);
        }

        if cleaned.is_empty() {
            cleaned = "file".to_string();
        }

        Self { inner: cleaned }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for SanitizedFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_must_be_positive() {
        assert!(ValidatedProjectId::new(0).is_err());
        assert!(ValidatedProjectId::new(-3).is_err());
        assert_eq!(ValidatedProjectId::new(12).unwrap().get(), 12);
    }

    #[test]
    fn test_branch_refs() {
        let branch = ValidatedBranchName::new("main").unwrap();
        assert_eq!(branch.local_ref(), "refs/heads/main");
        assert_eq!(branch.remote_ref(), "refs/remotes/origin/main");
    }

    #[test]
    fn test_sanitized_file_name() {
        assert_eq!(SanitizedFileName::new("login screen.png").as_str(), "login_screen.png");
        assert_eq!(SanitizedFileName::new("../../etc/passwd").as_str(), "passwd");
        assert_eq!(SanitizedFileName::new("..hidden").as_str(), "hidden");
        assert_eq!(SanitizedFileName::new("").as_str(), "file");
        assert_eq!(SanitizedFileName::new("résumé.pdf").as_str(), "r_sum_.pdf");

        let long = format!("{}.log", "a".repeat(300));
        let sanitized = SanitizedFileName::new(&long);
        assert!(sanitized.as_str().len() <= 120);
        assert!(sanitized.as_str().ends_with(".log"));
    }
}
