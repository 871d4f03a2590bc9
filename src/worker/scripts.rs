use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::error::{Result, SandboxError};

/// Name of the judge script inside an assignment's directory.
pub const JUDGE_SCRIPT: &str = "judge.sh";

/// Looks up the judge script for an assignment repository.
#[async_trait]
pub trait ScriptCatalog: Send + Sync {
    async fn script_for(&self, parent_repo: &str) -> Result<String>;
}

/// Reads `<root>/<parent_repo>/judge.sh`.
#[derive(Debug, Clone)]
pub struct DirScriptCatalog {
    root: PathBuf,
}

impl DirScriptCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, parent_repo: &str) -> Result<PathBuf> {
        let relative = Path::new(parent_repo);
        if parent_repo.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(SandboxError::Script(format!(
                "invalid repository name {:?}",
                parent_repo
            )));
        }
        Ok(self.root.join(relative).join(JUDGE_SCRIPT))
    }
}

#[async_trait]
impl ScriptCatalog for DirScriptCatalog {
    async fn script_for(&self, parent_repo: &str) -> Result<String> {
        let path = self.path_for(parent_repo)?;
        tokio::fs::read_to_string(&path).await.map_err(|e| {
            SandboxError::Script(format!(
                "no judge script for {} at {}: {}",
                parent_repo,
                path.display(),
                e
            ))
        })
    }
}

/// Fixed in-memory scripts.
#[derive(Debug, Clone, Default)]
pub struct StaticScripts {
    scripts: HashMap<String, String>,
}

impl StaticScripts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, parent_repo: impl Into<String>, script: impl Into<String>) -> Self {
        self.scripts.insert(parent_repo.into(), script.into());
        self
    }
}

#[async_trait]
impl ScriptCatalog for StaticScripts {
    async fn script_for(&self, parent_repo: &str) -> Result<String> {
        self.scripts
            .get(parent_repo)
            .cloned()
            .ok_or_else(|| SandboxError::Script(format!("no judge script for {}", parent_repo)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dir_catalog_reads_judge_script() {
        let dir = tempfile::tempdir().unwrap();
        let repo_dir = dir.path().join("course/hw1");
        std::fs::create_dir_all(&repo_dir).unwrap();
        std::fs::write(repo_dir.join(JUDGE_SCRIPT), "echo 100\n").unwrap();

        let catalog = DirScriptCatalog::new(dir.path());
        assert_eq!(catalog.script_for("course/hw1").await.unwrap(), "echo 100\n");
        assert!(matches!(
            catalog.script_for("course/hw2").await,
            Err(SandboxError::Script(_))
        ));
    }

    #[tokio::test]
    async fn dir_catalog_rejects_traversal() {
        let catalog = DirScriptCatalog::new("/scripts");
        assert!(catalog.script_for("../etc/passwd").await.is_err());
        assert!(catalog.script_for("/abs").await.is_err());
    }

    #[tokio::test]
    async fn static_scripts_lookup() {
        let scripts = StaticScripts::new().with_script("hw1", "echo 1");
        assert_eq!(scripts.script_for("hw1").await.unwrap(), "echo 1");
        assert!(scripts.script_for("hw2").await.is_err());
    }
}
