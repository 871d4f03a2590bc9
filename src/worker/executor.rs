use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ExecConfig;
use crate::worker::isolation::Invocation;
use crate::worker::pool::SlotPool;

/// How long to keep collecting output after a process group is killed.
const KILL_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Pipes still open this long after the script exits are held by its background children.
const LINGER_CHECK: Duration = Duration::from_millis(200);

const TRUNCATION_MARKER: &str = "\n[output truncated]\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// Exited with status 0.
    Succeeded,
    /// Exited non-zero or was killed by a signal.
    Failed,
    /// Exceeded the wall-clock budget and was killed.
    TimedOut,
    /// Never started: script, helper, or spawn failure.
    LaunchFailed,
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecStatus::Succeeded => write!(f, "succeeded"),
            ExecStatus::Failed => write!(f, "failed"),
            ExecStatus::TimedOut => write!(f, "timed_out"),
            ExecStatus::LaunchFailed => write!(f, "launch_failed"),
        }
    }
}

/// Result of one script execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub slot: u32,
    pub status: ExecStatus,
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr, or a description of why the script never ran.
    pub output: String,
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecStatus::Succeeded
    }

    fn launch_failed(slot: u32, output: String, started: Instant) -> Self {
        Self {
            slot,
            status: ExecStatus::LaunchFailed,
            exit_code: None,
            output,
            elapsed: started.elapsed(),
        }
    }
}

/// Runs untrusted scripts inside pool slots.
///
/// Every call reserves a slot, persists the script under the slot's script
/// directory, launches it through the isolation backend, and enforces the
/// wall-clock budget. Per-job problems come back as an [`ExecutionResult`];
/// nothing here returns an error or panics for a bad script.
#[derive(Debug, Clone)]
pub struct Executor {
    pool: Arc<SlotPool>,
    config: ExecConfig,
    sequence: Arc<AtomicU64>,
}

impl Executor {
    pub fn new(pool: Arc<SlotPool>, config: ExecConfig) -> Self {
        Self {
            pool,
            config,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn pool(&self) -> &Arc<SlotPool> {
        &self.pool
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Run `script`, optionally against `workdir`.
    pub async fn run(&self, script: &str, workdir: Option<&Path>) -> ExecutionResult {
        let guard = self.pool.reserve().await;
        let slot = guard.slot();
        let started = Instant::now();

        if let Some(dir) = workdir {
            if let Err(e) = self.install_helper(dir).await {
                tracing::error!(slot, error = %e, "Failed to copy helper into working directory");
                return ExecutionResult::launch_failed(
                    slot,
                    format!("failed to copy helper utility: {}", e),
                    started,
                );
            }
        }

        let script_path = match self.persist_script(slot, script, workdir).await {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(slot, error = %e, "Failed to save script");
                return ExecutionResult::launch_failed(
                    slot,
                    format!("failed to save script: {}", e),
                    started,
                );
            }
        };

        let result = self.launch(slot, &script_path, workdir, started).await;

        if let Err(e) = tokio::fs::remove_file(&script_path).await {
            tracing::warn!(slot, path = %script_path.display(), error = %e, "Failed to remove script");
        }

        tracing::info!(
            slot,
            status = %result.status,
            exit_code = ?result.exit_code,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Script finished"
        );
        drop(guard);
        result
    }

    async fn install_helper(&self, workdir: &Path) -> std::io::Result<()> {
        let Some(helper) = &self.config.helper_path else {
            return Ok(());
        };
        let dest_dir = workdir.join(&self.config.helper_subdir);
        tokio::fs::create_dir_all(&dest_dir).await?;
        let file_name = helper.file_name().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "helper path has no file name")
        })?;
        tokio::fs::copy(helper, dest_dir.join(file_name)).await?;
        Ok(())
    }

    /// Write the script body to a fresh file. A missing directory is created
    /// and the write retried once.
    async fn persist_script(
        &self,
        slot: u32,
        script: &str,
        workdir: Option<&Path>,
    ) -> std::io::Result<PathBuf> {
        let dir = self.isolation_script_dir(slot);
        let path = dir.join(self.script_file_name());
        let body = self.wrap_script(script, workdir);

        match tokio::fs::write(&path, &body).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(slot, dir = %dir.display(), "Creating script directory");
                tokio::fs::create_dir_all(&dir).await?;
                tokio::fs::write(&path, &body).await?;
            }
            Err(e) => return Err(e),
        }

        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777)).await?;
        Ok(path)
    }

    fn isolation_script_dir(&self, slot: u32) -> PathBuf {
        self.pool.isolation().script_dir(slot)
    }

    fn script_file_name(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}.sh", nanos, seq)
    }

    /// Prefix the script with an exit trap removing build artifacts.
    pub fn wrap_script(&self, script: &str, workdir: Option<&Path>) -> String {
        match (&self.config.artifact_dir, workdir) {
            (Some(artifacts), Some(_)) => {
                format!(
                    "trap 'rm -rf \"$CODE_PATH/{}\"' EXIT\n{}",
                    artifacts.replace('\'', ""),
                    script
                )
            }
            _ => script.to_string(),
        }
    }

    async fn launch(
        &self,
        slot: u32,
        script_path: &Path,
        workdir: Option<&Path>,
        started: Instant,
    ) -> ExecutionResult {
        let invocation = Invocation {
            script: script_path,
            workdir,
            limits: &self.config,
        };
        let mut cmd = self.pool.isolation().command(slot, &invocation);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(slot, error = %e, "Failed to launch script");
                return ExecutionResult::launch_failed(
                    slot,
                    format!("failed to launch {}: {}", self.pool.isolation().name(), e),
                    started,
                );
            }
        };

        let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));
        let output = Arc::new(Mutex::new(CapturedOutput::new(self.config.output_limit)));
        let mut collectors = vec![
            spawn_collector(child.stdout.take(), output.clone()),
            spawn_collector(child.stderr.take(), output.clone()),
        ];

        let (status, exit_code) = match tokio::time::timeout(self.config.timeout, child.wait())
            .await
        {
            Ok(Ok(exit)) => {
                // The leader is reaped; only signal its group while members still hold the pipes.
                if !join_collectors(&mut collectors, LINGER_CHECK).await {
                    kill_group(slot, pgid);
                    join_collectors(&mut collectors, KILL_DRAIN_GRACE).await;
                }
                let status = if exit.success() {
                    ExecStatus::Succeeded
                } else {
                    ExecStatus::Failed
                };
                (status, exit.code())
            }
            Ok(Err(e)) => {
                tracing::error!(slot, error = %e, "Failed waiting for script");
                output
                    .lock()
                    .push(format!("\nfailed waiting for script: {}", e).as_bytes());
                for task in &collectors {
                    task.abort();
                }
                (ExecStatus::Failed, None)
            }
            Err(_) => {
                tracing::warn!(slot, timeout_secs = self.config.timeout.as_secs(), "Script timed out");
                kill_group(slot, pgid);
                let _ = child.start_kill();
                let _ = tokio::time::timeout(KILL_DRAIN_GRACE, child.wait()).await;
                join_collectors(&mut collectors, KILL_DRAIN_GRACE).await;
                (ExecStatus::TimedOut, None)
            }
        };

        let output = output.lock().render();
        ExecutionResult {
            slot,
            status,
            exit_code,
            output,
            elapsed: started.elapsed(),
        }
    }
}

/// Combined output of one run, capped at the configured limit.
#[derive(Debug)]
struct CapturedOutput {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CapturedOutput {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.bytes.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(chunk);
        }
    }

    fn render(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

fn kill_group(slot: u32, pgid: Option<Pid>) {
    let Some(pgid) = pgid else {
        return;
    };
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::debug!(slot, error = %e, "killpg failed"),
    }
}

/// Wait for the collectors to hit EOF. Returns false if `within` elapsed first;
/// finished collectors are dropped from `tasks` either way.
async fn join_collectors(tasks: &mut Vec<JoinHandle<()>>, within: Duration) -> bool {
    tokio::time::timeout(within, async {
        while let Some(task) = tasks.last_mut() {
            let _ = task.await;
            tasks.pop();
        }
    })
    .await
    .is_ok()
}

/// Copy a child pipe into the shared buffer until EOF. Bytes past the limit
/// are still read so the writer never blocks on a full pipe.
fn spawn_collector<R>(pipe: Option<R>, sink: Arc<Mutex<CapturedOutput>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink.lock().push(&buf[..n]),
            }
        }
    })
}
