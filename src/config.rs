use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Which isolation primitive backs the slot pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationBackend {
    /// The `isolate` sandbox binary. One isolate box per slot.
    #[default]
    Isolate,
    /// Plain `/bin/sh` in a per-slot directory. No sandboxing; for development
    /// hosts and tests only.
    HostShell,
}

/// Where slot state lives and which binary manages it.
#[derive(Debug, Clone)]
pub struct IsolationConfig {
    pub backend: IsolationBackend,
    /// Path to the `isolate` executable.
    pub isolate_binary: PathBuf,
    /// Root directory holding one subdirectory per slot
    /// (`<root>/<slot>/box` for isolate).
    pub box_root: PathBuf,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            backend: IsolationBackend::Isolate,
            isolate_binary: PathBuf::from("isolate"),
            box_root: PathBuf::from("/var/local/lib/isolate"),
        }
    }
}

impl IsolationConfig {
    /// Unsandboxed backend rooted at `root`.
    pub fn host_shell(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: IsolationBackend::HostShell,
            box_root: root.into(),
            ..Default::default()
        }
    }
}

/// Limits and conventions applied to every script execution.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Hard wall-clock budget for one script.
    pub timeout: Duration,
    /// Largest file the script may create, in KiB.
    pub fsize_kb: u64,
    /// Process ceiling. `None` lets isolate pick its unlimited setting.
    pub max_processes: Option<u32>,
    /// Open-file limit handed to isolate.
    pub open_files: u32,
    /// Interpreter used to run the script inside the slot.
    pub shell: PathBuf,
    /// Helper copied into `<workdir>/<helper_subdir>/` before each run.
    pub helper_path: Option<PathBuf>,
    pub helper_subdir: String,
    /// Directory under the working directory removed when the script exits.
    pub artifact_dir: Option<String>,
    /// Most bytes of combined output kept per run. The rest is drained and dropped.
    pub output_limit: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            fsize_kb: 10240,
            max_processes: None,
            open_files: 0,
            shell: PathBuf::from("/usr/bin/sh"),
            helper_path: None,
            helper_subdir: "utils".to_string(),
            artifact_dir: Some("build".to_string()),
            output_limit: 1024 * 1024,
        }
    }
}

impl ExecConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_helper(mut self, path: impl Into<PathBuf>) -> Self {
        self.helper_path = Some(path.into());
        self
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit = bytes;
        self
    }
}

/// Timing and sizing of the scheduler's instance registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Capacity of each instance's bounded job queue.
    pub queue_capacity: usize,
    /// How often the reaper scans the registry.
    pub reap_interval: Duration,
    /// Silence after which an instance stops receiving jobs.
    pub inactive_after: Duration,
    /// Silence after which an instance is dropped from the registry.
    pub remove_after: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            reap_interval: Duration::from_secs(30),
            inactive_after: Duration::from_secs(60),
            remove_after: Duration::from_secs(300),
        }
    }
}

/// TLS configuration for the scheduler/worker channel.
///
/// When enabled with a CA, the scheduler verifies worker certificates (mTLS).
/// Workers always verify the scheduler against the CA, using `server_name`
/// for the hostname check.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Enable TLS. If false, all other TLS settings are ignored.
    pub enabled: bool,

    /// Path to the CA certificate (PEM format).
    /// Used to verify peer certificates.
    pub ca_cert_path: Option<PathBuf>,

    /// Path to this node's certificate (PEM format).
    pub cert_path: Option<PathBuf>,

    /// Path to this node's private key (PEM format).
    /// Must match the certificate.
    pub key_path: Option<PathBuf>,

    /// Name expected in the scheduler's certificate.
    pub server_name: Option<String>,

    /// Allow insecure connections for development/testing.
    /// When true and TLS files are missing, runs in plaintext mode with warning.
    /// When false and TLS files are missing, fails to start.
    pub allow_insecure: bool,
}

impl TlsConfig {
    /// Check if TLS is properly configured with all required files.
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.ca_cert_path.is_some()
            && self.cert_path.is_some()
            && self.key_path.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub listen_addr: SocketAddr,
    pub registry: RegistryConfig,
    pub tls: TlsConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "0.0.0.0:3001"
                .parse()
                .expect("default listen address is valid"),
            registry: RegistryConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity announced to the scheduler. Stable across reconnects.
    pub instance_id: String,
    /// Scheduler endpoint, `http://` or `https://`.
    pub scheduler_addr: String,
    /// Number of sandbox slots on this node.
    pub capacity: usize,
    /// How often the status reporter checks for load changes.
    pub status_interval: Duration,
    /// Send a status even if nothing changed after this long.
    pub status_force_after: Duration,
    /// Wait after a failed connection attempt.
    pub reconnect_delay: Duration,
    /// Wait after an established stream drops.
    pub retry_delay: Duration,
    /// Upper bound on waiting for in-flight jobs at shutdown.
    pub shutdown_timeout: Duration,
    /// Where submissions are checked out.
    pub repo_root: PathBuf,
    /// Judge scripts, one `<parent_repo>/judge.sh` each.
    pub scripts_dir: PathBuf,
    /// Optional listener for the unary sandbox service.
    pub admin_addr: Option<SocketAddr>,
    pub exec: ExecConfig,
    pub isolation: IsolationConfig,
    pub tls: TlsConfig,
}

/// Number of CPUs, the default slot count.
pub fn default_capacity() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            scheduler_addr: "http://localhost:3001".to_string(),
            capacity: default_capacity(),
            status_interval: Duration::from_millis(300),
            status_force_after: Duration::from_secs(15),
            reconnect_delay: Duration::from_secs(5),
            retry_delay: Duration::from_secs(3),
            shutdown_timeout: Duration::from_secs(30),
            repo_root: PathBuf::from("/tmp/oj-sandbox/repos"),
            scripts_dir: PathBuf::from("/etc/oj-sandbox/scripts"),
            admin_addr: None,
            exec: ExecConfig::default(),
            isolation: IsolationConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(instance_id: impl Into<String>, scheduler_addr: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            scheduler_addr: scheduler_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationConfig) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_exec(mut self, exec: ExecConfig) -> Self {
        self.exec = exec;
        self
    }
}
