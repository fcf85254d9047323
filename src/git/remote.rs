//! Remote URLs with and without credentials.
//!
//! A personal-access token only ever lives in the URL handed to an anonymous
//! libgit2 remote for a single fetch or push. `origin` in `.git/config` keeps
//! the plain URL.

use anyhow::{anyhow, Result};
use std::cell::Cell;
use url::Url;

/// Where to fetch from and push to, plus the optional token for HTTPS.
#[derive(Clone)]
pub struct RemoteSpec {
    pub url: String,
    pub token: Option<String>,
}

impl RemoteSpec {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token: token.filter(|t| !t.is_empty()),
        }
    }

    /// URL to hand to libgit2 for one transfer.
    pub fn authenticated_url(&self) -> Result<String> {
        inject_token(&self.url, self.token.as_deref())
    }

    /// The URL as it may appear in logs.
    pub fn display_url(&self) -> String {
        redact_url(&self.url)
    }

    /// Remove the token from text that may have echoed the authenticated URL.
    pub fn scrub(&self, text: &str) -> String {
        match &self.token {
            Some(token) => text.replace(token.as_str(), "***"),
            None => text.to_string(),
        }
    }

    /// Callbacks answering libgit2's credential prompt with the token, once.
    pub fn callbacks(&self) -> git2::RemoteCallbacks<'_> {
        let mut callbacks = git2::RemoteCallbacks::new();
        if let Some(token) = self.token.as_deref() {
            let attempts = Cell::new(0u8);
            callbacks.credentials(move |_url, username, allowed| {
                attempts.set(attempts.get() + 1);
                if attempts.get() > 1 {
                    return Err(git2::Error::from_str("access token was rejected"));
                }
                if allowed.contains(git2::CredentialType::USER_PASS_PLAINTEXT) {
                    git2::Cred::userpass_plaintext(username.unwrap_or(token), "")
                } else {
                    Err(git2::Error::from_str(
                        "remote does not accept token authentication",
                    ))
                }
            });
        }
        callbacks
    }
}

impl std::fmt::Debug for RemoteSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSpec")
            .field("url", &self.display_url())
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Put `token` into the user-info of an HTTPS URL. Other schemes, scp-like
/// addresses and local paths are returned unchanged.
pub fn inject_token(remote: &str, token: Option<&str>) -> Result<String> {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return Ok(remote.to_string());
    };

    let mut url = match Url::parse(remote) {
        Ok(url) if url.scheme() == "https" => url,
        _ => return Ok(remote.to_string()),
    };

    url.set_username(token)
        .map_err(|_| anyhow!("cannot add credentials to {}", redact_url(remote)))?;
    url.set_password(None)
        .map_err(|_| anyhow!("cannot add credentials to {}", redact_url(remote)))?;
    Ok(url.to_string())
}

/// Replace any user-info in `remote` with `***`.
pub fn redact_url(remote: &str) -> String {
    match Url::parse(remote) {
        Ok(mut url) if !url.username().is_empty() || url.password().is_some() => {
            let _ = url.set_password(None);
            let _ = url.set_username("***");
            url.to_string()
        }
        _ => remote.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_token_into_https() {
        let url = inject_token("https://github.com/acme/qa-data.git", Some("ghp_abc123")).unwrap();
        assert_eq!(url, "https://ghp_abc123@github.com/acme/qa-data.git");
    }

    #[test]
    fn test_inject_token_replaces_existing_user() {
        let url = inject_token("https://bot@gitlab.com/acme/qa.git", Some("glpat-x")).unwrap();
        assert_eq!(url, "https://glpat-x@gitlab.com/acme/qa.git");
    }

    #[test]
    fn test_inject_token_leaves_other_transports_alone() {
        for remote in [
            "http://git.internal/qa.git",
            "ssh://git@github.com/acme/qa.git",
            "git@github.com:acme/qa.git",
            "/srv/git/qa.git",
        ] {
            assert_eq!(inject_token(remote, Some("secret")).unwrap(), remote);
        }
    }

    #[test]
    fn test_no_token_is_identity() {
        let remote = "https://github.com/acme/qa.git";
        assert_eq!(inject_token(remote, None).unwrap(), remote);
        assert_eq!(inject_token(remote, Some("")).unwrap(), remote);
    }

    #[test]
    fn test_redact_url() {
        assert_eq!(
            redact_url("https://ghp_abc123@github.com/acme/qa.git"),
            "https://***@github.com/acme/qa.git"
        );
        assert_eq!(
            redact_url("https://github.com/acme/qa.git"),
            "https://github.com/acme/qa.git"
        );
        assert_eq!(redact_url("git@github.com:acme/qa.git"), "git@github.com:acme/qa.git");
    }

    #[test]
    fn test_spec_debug_and_scrub_hide_token() {
        let spec = RemoteSpec::new("https://github.com/acme/qa.git", Some("ghp_abc123".into()));
        assert!(!format!("{spec:?}").contains("ghp_abc123"));

        let message = format!("failed to fetch {}", spec.authenticated_url().unwrap());
        assert_eq!(
            spec.scrub(&message),
            "failed to fetch https://***@github.com/acme/qa.git"
        );
    }
}
