use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account used to fetch a submission's source.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub token: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.token.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// One grading request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Caller-side submission record this job reports against.
    pub correlation_id: u64,
    /// Assignment repository; selects the judge script.
    pub parent_repo: String,
    pub repo_url: String,
    pub repo_ref: Option<String>,
    pub repo_full_name: String,
    pub credentials: Credentials,
    pub cutoff: Option<DateTime<Utc>>,
    /// Inline judge script overriding the catalog lookup.
    pub script: Option<String>,
}

impl Job {
    pub fn new(
        correlation_id: u64,
        parent_repo: impl Into<String>,
        repo_url: impl Into<String>,
        repo_full_name: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id,
            parent_repo: parent_repo.into(),
            repo_url: repo_url.into(),
            repo_ref: None,
            repo_full_name: repo_full_name.into(),
            credentials: Credentials::default(),
            cutoff: None,
            script: None,
        }
    }

    pub fn with_ref(mut self, repo_ref: &str) -> Self {
        self.repo_ref = normalize_ref(repo_ref);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_cutoff(mut self, cutoff: DateTime<Utc>) -> Self {
        self.cutoff = Some(cutoff);
        self
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    /// Human-readable job handle.
    pub fn job_id(&self) -> String {
        format!("job_{}_{}", self.correlation_id, self.repo_full_name)
    }
}

/// An empty ref or the all-zero hash means "no ref".
pub fn normalize_ref(repo_ref: &str) -> Option<String> {
    let trimmed = repo_ref.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '0') {
        None
    } else {
        Some(trimmed.to_string())
    }
}
