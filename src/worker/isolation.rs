//! Isolation backends that bind a slot id to an execution environment.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::{ExecConfig, IsolationBackend, IsolationConfig};
use crate::error::{Result, SandboxError};

/// One script launch inside a slot.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    /// Host path of the persisted script, inside [`Isolation::script_dir`].
    pub script: &'a Path,
    /// Directory mounted read-write and used as cwd, if any.
    pub workdir: Option<&'a Path>,
    pub limits: &'a ExecConfig,
}

#[async_trait]
pub trait Isolation: Send + Sync {
    /// Prepare the slot's environment. Called once per slot at startup.
    async fn init(&self, slot: u32) -> Result<()>;

    /// Tear down the slot's environment.
    async fn cleanup(&self, slot: u32) -> Result<()>;

    /// Host directory scripts for this slot are written to.
    fn script_dir(&self, slot: u32) -> PathBuf;

    /// Build the command that runs `invocation` in the slot. Stdio is left
    /// to the caller.
    fn command(&self, slot: u32, invocation: &Invocation<'_>) -> Command;

    fn name(&self) -> &'static str;
}

/// Build the backend selected by `config`.
pub fn from_config(config: &IsolationConfig) -> std::sync::Arc<dyn Isolation> {
    match config.backend {
        IsolationBackend::Isolate => std::sync::Arc::new(Isolate::new(
            config.isolate_binary.clone(),
            config.box_root.clone(),
        )),
        IsolationBackend::HostShell => std::sync::Arc::new(HostShell::new(config.box_root.clone())),
    }
}

/// The `isolate` sandbox: one box per slot.
#[derive(Debug, Clone)]
pub struct Isolate {
    binary: PathBuf,
    root: PathBuf,
}

impl Isolate {
    pub fn new(binary: PathBuf, root: PathBuf) -> Self {
        Self { binary, root }
    }

    async fn box_command(&self, slot: u32, action: &str) -> Result<()> {
        let output = Command::new(&self.binary)
            .arg(action)
            .arg("-b")
            .arg(slot.to_string())
            .output()
            .await
            .map_err(|e| SandboxError::Provision {
                slot,
                reason: format!("failed to run {}: {}", self.binary.display(), e),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(SandboxError::Provision {
                slot,
                reason: format!(
                    "{} {} exited with {:?}: {}",
                    self.binary.display(),
                    action,
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }

    /// Build the argument list for a run. Separate from [`Isolation::command`]
    /// so it can be inspected.
    pub fn run_args(&self, slot: u32, invocation: &Invocation<'_>) -> Vec<String> {
        let limits = invocation.limits;
        let mut args = vec![
            format!("--box-id={}", slot),
            format!("--fsize={}", limits.fsize_kb),
            "--wait".to_string(),
            match limits.max_processes {
                Some(n) => format!("--processes={}", n),
                None => "--processes".to_string(),
            },
            format!("--open-files={}", limits.open_files),
            "--env=PATH".to_string(),
            "--stderr-to-stdout".to_string(),
        ];

        if let Some(dir) = invocation.workdir {
            let dir = dir.display();
            args.push(format!("--chdir={}", dir));
            args.push(format!("--dir={}:rw", dir));
            args.push(format!("--env=CODE_PATH={}", dir));
        }

        // The box directory is mounted at /box inside the sandbox.
        let file_name = invocation
            .script
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_default();
        let inner_script = Path::new("/box/code").join(file_name);

        args.push("--run".to_string());
        args.push("--".to_string());
        args.push(limits.shell.display().to_string());
        args.push(inner_script.display().to_string());
        args
    }
}

#[async_trait]
impl Isolation for Isolate {
    async fn init(&self, slot: u32) -> Result<()> {
        self.box_command(slot, "--init").await
    }

    async fn cleanup(&self, slot: u32) -> Result<()> {
        self.box_command(slot, "--cleanup").await
    }

    fn script_dir(&self, slot: u32) -> PathBuf {
        self.root.join(slot.to_string()).join("box").join("code")
    }

    fn command(&self, slot: u32, invocation: &Invocation<'_>) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.run_args(slot, invocation));
        cmd
    }

    fn name(&self) -> &'static str {
        "isolate"
    }
}

/// Runs scripts with the host shell in a per-slot directory.
///
/// Provides no isolation at all. Only the filesystem layout and the
/// stdout/stderr merge match [`Isolate`].
#[derive(Debug, Clone)]
pub struct HostShell {
    root: PathBuf,
}

impl HostShell {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn slot_dir(&self, slot: u32) -> PathBuf {
        self.root.join(slot.to_string())
    }
}

#[async_trait]
impl Isolation for HostShell {
    async fn init(&self, slot: u32) -> Result<()> {
        tokio::fs::create_dir_all(self.script_dir(slot))
            .await
            .map_err(|e| SandboxError::Provision {
                slot,
                reason: e.to_string(),
            })
    }

    async fn cleanup(&self, slot: u32) -> Result<()> {
        match tokio::fs::remove_dir_all(self.slot_dir(slot)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn script_dir(&self, slot: u32) -> PathBuf {
        self.slot_dir(slot).join("code")
    }

    fn command(&self, slot: u32, invocation: &Invocation<'_>) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("exec sh \"$0\" 2>&1")
            .arg(invocation.script);
        match invocation.workdir {
            Some(dir) => {
                cmd.current_dir(dir).env("CODE_PATH", dir);
            }
            None => {
                cmd.current_dir(self.slot_dir(slot));
            }
        }
        cmd
    }

    fn name(&self) -> &'static str {
        "host-shell"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolate_run_args_without_workdir() {
        let isolate = Isolate::new("isolate".into(), "/var/local/lib/isolate".into());
        let limits = ExecConfig::default();
        let script = isolate.script_dir(3).join("123.sh");
        let args = isolate.run_args(
            3,
            &Invocation {
                script: &script,
                workdir: None,
                limits: &limits,
            },
        );

        assert_eq!(args[0], "--box-id=3");
        assert!(args.contains(&"--fsize=10240".to_string()));
        assert!(args.contains(&"--processes".to_string()));
        assert!(args.contains(&"--open-files=0".to_string()));
        assert!(args.contains(&"--env=PATH".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--chdir")));
        assert_eq!(
            &args[args.len() - 4..],
            &["--run", "--", "/usr/bin/sh", "/box/code/123.sh"]
        );
    }

    #[test]
    fn isolate_run_args_mount_workdir() {
        let isolate = Isolate::new("isolate".into(), "/iso".into());
        let limits = ExecConfig {
            max_processes: Some(64),
            ..Default::default()
        };
        let script = PathBuf::from("/iso/0/box/code/1.sh");
        let workdir = PathBuf::from("/repos/alice/hw1/abc");
        let args = isolate.run_args(
            0,
            &Invocation {
                script: &script,
                workdir: Some(&workdir),
                limits: &limits,
            },
        );

        assert!(args.contains(&"--processes=64".to_string()));
        assert!(args.contains(&"--chdir=/repos/alice/hw1/abc".to_string()));
        assert!(args.contains(&"--dir=/repos/alice/hw1/abc:rw".to_string()));
        assert!(args.contains(&"--env=CODE_PATH=/repos/alice/hw1/abc".to_string()));
    }

    #[test]
    fn isolate_script_dir_layout() {
        let isolate = Isolate::new("isolate".into(), "/iso".into());
        assert_eq!(isolate.script_dir(7), PathBuf::from("/iso/7/box/code"));
    }

    #[tokio::test]
    async fn host_shell_init_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let shell = HostShell::new(dir.path().to_path_buf());

        shell.init(1).await.unwrap();
        assert!(shell.script_dir(1).is_dir());

        shell.cleanup(1).await.unwrap();
        assert!(!dir.path().join("1").exists());

        // Cleaning an absent slot is not an error.
        shell.cleanup(1).await.unwrap();
    }
}
