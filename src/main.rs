use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tracing_subscriber::EnvFilter;

use oj_sandbox::config::{
    ExecConfig, IsolationBackend, IsolationConfig, RegistryConfig, SchedulerConfig, TlsConfig,
    WorkerConfig,
};
use oj_sandbox::grpc::SchedulerServer;
use oj_sandbox::proto::scheduler_service_client::SchedulerServiceClient;
use oj_sandbox::proto::{JobRequest, StatusRequest};
use oj_sandbox::scheduler::{Credentials, Job};
use oj_sandbox::shutdown::install_shutdown_handler;
use oj_sandbox::sink::TracingSink;
use oj_sandbox::tls::{self, DEFAULT_SERVER_NAME};
use oj_sandbox::worker::{DirScriptCatalog, GitProvisioner, WorkerRuntime};

#[derive(Parser, Debug)]
#[command(name = "oj-sandbox")]
#[command(version)]
#[command(about = "Sandboxed grading-script scheduler and worker")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the scheduler that workers connect to
    Scheduler(SchedulerArgs),

    /// Run a worker node with a pool of sandbox slots
    Worker(WorkerArgs),

    /// Job commands against a running scheduler
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Aggregate slot status across active workers
    Status {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(clap::Args, Debug)]
struct TlsArgs {
    /// Enable TLS on the scheduler/worker channel
    #[arg(long, env = "USE_TLS")]
    tls: bool,

    /// Path to CA certificate (PEM format)
    #[arg(long, env = "TLS_CA_FILE")]
    ca_cert: Option<PathBuf>,

    /// Path to this node's certificate (PEM format)
    #[arg(long, env = "TLS_CERT_FILE")]
    cert: Option<PathBuf>,

    /// Path to this node's private key (PEM format)
    #[arg(long, env = "TLS_KEY_FILE")]
    key: Option<PathBuf>,

    /// Name expected in the scheduler certificate
    #[arg(long, env = "TLS_SERVER_NAME")]
    server_name: Option<String>,

    /// Fall back to plaintext when --tls is set but certificates are missing.
    /// Useful for development. NOT recommended for production.
    #[arg(long)]
    allow_insecure: bool,
}

impl From<TlsArgs> for TlsConfig {
    fn from(args: TlsArgs) -> Self {
        TlsConfig {
            enabled: args.tls,
            ca_cert_path: args.ca_cert,
            cert_path: args.cert,
            key_path: args.key,
            server_name: args.server_name,
            allow_insecure: args.allow_insecure,
        }
    }
}

#[derive(clap::Args, Debug)]
struct SchedulerArgs {
    /// Port to listen on for gRPC
    #[arg(long, env = "SCHEDULER_PORT", default_value = "3001")]
    port: u16,

    /// Bounded queue length per worker instance
    #[arg(long, default_value = "100")]
    queue_capacity: usize,

    /// Seconds between reaper scans
    #[arg(long, default_value = "30")]
    reap_interval: u64,

    /// Seconds without status before a worker stops receiving jobs
    #[arg(long, default_value = "60")]
    inactive_after: u64,

    /// Seconds without status before a worker is removed
    #[arg(long, default_value = "300")]
    remove_after: u64,

    #[command(flatten)]
    tls: TlsArgs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Isolate,
    HostShell,
}

impl From<Backend> for IsolationBackend {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Isolate => IsolationBackend::Isolate,
            Backend::HostShell => IsolationBackend::HostShell,
        }
    }
}

#[derive(clap::Args, Debug)]
struct WorkerArgs {
    /// Identity announced to the scheduler (random if unset)
    #[arg(long, env = "INSTANCE_ID")]
    instance_id: Option<String>,

    /// Scheduler endpoint (use https:// for TLS)
    #[arg(long, env = "SCHEDULER_ADDRESS", default_value = "http://localhost:3001")]
    scheduler_addr: String,

    /// Number of sandbox slots (defaults to the CPU count)
    #[arg(long, env = "SANDBOX_COUNT")]
    sandbox_count: Option<usize>,

    /// Where submissions are checked out
    #[arg(long, env = "REPO_FOLDER", default_value = "/tmp/oj-sandbox/repos")]
    repo_folder: PathBuf,

    /// Directory holding <parent_repo>/judge.sh
    #[arg(long, env = "SCRIPTS_DIR", default_value = "/etc/oj-sandbox/scripts")]
    scripts_dir: PathBuf,

    /// Seconds to wait for in-flight jobs on shutdown
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value = "30")]
    shutdown_timeout: u64,

    /// Isolation backend
    #[arg(long, value_enum, default_value = "isolate")]
    backend: Backend,

    /// Path to the isolate binary
    #[arg(long, env = "ISOLATE_PATH", default_value = "isolate")]
    isolate_path: PathBuf,

    /// Root directory for slot state
    #[arg(long, env = "ISOLATE_BOX_ROOT", default_value = "/var/local/lib/isolate")]
    box_root: PathBuf,

    /// Wall-clock budget per script, in seconds
    #[arg(long, env = "EXEC_TIMEOUT", default_value = "60")]
    exec_timeout: u64,

    /// Most bytes of script output kept per run
    #[arg(long, env = "OUTPUT_LIMIT", default_value = "1048576")]
    output_limit: usize,

    /// Helper copied into every working directory before a run
    #[arg(long, env = "HELPER_PATH")]
    helper: Option<PathBuf>,

    /// Port for the unary sandbox service (disabled if unset)
    #[arg(long, env = "ADMIN_PORT")]
    admin_port: Option<u16>,

    #[command(flatten)]
    tls: TlsArgs,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(clap::Args, Debug)]
struct ClientArgs {
    /// Scheduler address (use https:// for TLS)
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:3001")]
    addr: String,

    /// Path to CA certificate (PEM format) for TLS
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (PEM format) for mTLS
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to client private key (PEM format) for mTLS
    #[arg(long)]
    key: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Queue a submission on the least-loaded worker
    Submit(SubmitArgs),
}

#[derive(clap::Args, Debug)]
struct SubmitArgs {
    /// Assignment the submission belongs to; selects the judge script
    #[arg(long)]
    parent_repo: String,

    /// Clone URL of the submission
    #[arg(long)]
    repo_url: String,

    /// Submission name, e.g. "org/student-repo"
    #[arg(long)]
    full_name: String,

    /// Commit to grade (latest before the cutoff if unset)
    #[arg(long = "ref")]
    repo_ref: Option<String>,

    /// Caller's id, echoed back with the result
    #[arg(long, default_value = "0")]
    correlation_id: u64,

    /// Username for the clone
    #[arg(long, env = "SUBMITTER_USERNAME", default_value = "")]
    username: String,

    /// Token for the clone
    #[arg(long, env = "SUBMITTER_TOKEN", default_value = "", hide_env_values = true)]
    token: String,

    /// Ignore commits after this time (RFC 3339)
    #[arg(long)]
    cutoff: Option<chrono::DateTime<chrono::Utc>>,

    /// Run this script instead of the assignment's judge script
    #[arg(long)]
    script_file: Option<PathBuf>,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct SubmitOutput {
    accepted: bool,
    instance_id: String,
    job_id: String,
    message: String,
}

#[derive(Serialize)]
struct StatusOutput {
    available: i32,
    waiting: i32,
    processing: i32,
    total: i32,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn create_client_channel(args: &ClientArgs) -> Result<Channel, Box<dyn std::error::Error>> {
    let endpoint = Channel::from_shared(args.addr.clone())?;

    let has_tls = args.ca_cert.is_some() || args.addr.starts_with("https://");
    if !has_tls {
        return Ok(endpoint.connect().await?);
    }

    let mut tls_config = ClientTlsConfig::new().domain_name(DEFAULT_SERVER_NAME);
    if let Some(ca_path) = &args.ca_cert {
        let ca_cert = Certificate::from_pem(tokio::fs::read(ca_path).await?);
        tls_config = tls_config.ca_certificate(ca_cert);
    }
    if let (Some(cert_path), Some(key_path)) = (&args.cert, &args.key) {
        let cert = tokio::fs::read(cert_path).await?;
        let key = tokio::fs::read(key_path).await?;
        tls_config = tls_config.identity(Identity::from_pem(cert, key));
    }

    Ok(endpoint.tls_config(tls_config)?.connect().await?)
}

// =============================================================================
// Scheduler
// =============================================================================

async fn run_scheduler(args: SchedulerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let tls_config = TlsConfig::from(args.tls);
    let tls_identity = tls::load_optional(&tls_config).await?;

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let registry = RegistryConfig {
        queue_capacity: args.queue_capacity,
        reap_interval: Duration::from_secs(args.reap_interval),
        inactive_after: Duration::from_secs(args.inactive_after),
        remove_after: Duration::from_secs(args.remove_after),
    };
    let config = SchedulerConfig {
        listen_addr,
        registry,
        tls: tls_config,
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        tls_enabled = tls_identity.is_some(),
        queue_capacity = config.registry.queue_capacity,
        "Starting oj-sandbox scheduler"
    );

    let shutdown = install_shutdown_handler()?;
    SchedulerServer::new(config, Arc::new(TracingSink))
        .with_tls(tls_identity)
        .run(shutdown)
        .await?;
    Ok(())
}

// =============================================================================
// Worker
// =============================================================================

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let tls_config = TlsConfig::from(args.tls);
    let tls_identity = tls::load_optional(&tls_config).await?;

    let mut config = WorkerConfig::new(
        args.instance_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        args.scheduler_addr,
    );
    if let Some(count) = args.sandbox_count {
        config = config.with_capacity(count);
    }
    let mut exec = ExecConfig::default()
        .with_timeout(Duration::from_secs(args.exec_timeout))
        .with_output_limit(args.output_limit);
    if let Some(helper) = args.helper {
        exec = exec.with_helper(helper);
    }
    config = config
        .with_exec(exec)
        .with_isolation(IsolationConfig {
            backend: args.backend.into(),
            isolate_binary: args.isolate_path,
            box_root: args.box_root,
        });
    config.repo_root = args.repo_folder;
    config.scripts_dir = args.scripts_dir;
    config.shutdown_timeout = Duration::from_secs(args.shutdown_timeout);
    config.admin_addr = match args.admin_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };
    config.tls = tls_config;

    tracing::info!(
        instance_id = %config.instance_id,
        scheduler = %config.scheduler_addr,
        capacity = config.capacity,
        tls_enabled = tls_identity.is_some(),
        admin_addr = ?config.admin_addr,
        "Starting oj-sandbox worker"
    );

    let shutdown = install_shutdown_handler()?;
    let provisioner = Arc::new(GitProvisioner::new(config.repo_root.clone()));
    let scripts = Arc::new(DirScriptCatalog::new(config.scripts_dir.clone()));
    let runtime = WorkerRuntime::start(config, provisioner, scripts, Arc::new(TracingSink))
        .await?
        .with_tls(tls_identity);
    runtime.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(
    client: &mut SchedulerServiceClient<Channel>,
    args: SubmitArgs,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut job = Job::new(
        args.correlation_id,
        args.parent_repo,
        args.repo_url,
        args.full_name,
    )
    .with_credentials(Credentials::new(args.username, args.token));
    if let Some(repo_ref) = &args.repo_ref {
        job = job.with_ref(repo_ref);
    }
    if let Some(cutoff) = args.cutoff {
        job = job.with_cutoff(cutoff);
    }
    if let Some(path) = &args.script_file {
        job = job.with_script(tokio::fs::read_to_string(path).await?);
    }
    let job_id = job.job_id();

    let resp = client
        .reserve_job(JobRequest::from(job))
        .await?
        .into_inner();

    match output_format {
        OutputFormat::Json => {
            let output = SubmitOutput {
                accepted: resp.accepted,
                instance_id: resp.instance_id.clone(),
                job_id,
                message: resp.message.clone(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if resp.accepted {
                println!("Job queued successfully!");
                println!("Job ID:   {}", job_id);
                println!("Instance: {}", resp.instance_id);
            }
        }
    }

    if !resp.accepted {
        eprintln!("Error: Job not queued: {}", resp.message);
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_status(
    client: &mut SchedulerServiceClient<Channel>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let resp = client
        .get_global_status(StatusRequest {})
        .await?
        .into_inner();

    match output_format {
        OutputFormat::Json => {
            let output = StatusOutput {
                available: resp.available_count,
                waiting: resp.waiting_count,
                processing: resp.processing_count,
                total: resp.total_count,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Sandbox Status");
            println!("{}", "=".repeat(30));
            println!("{:<12} {}", "Available:", resp.available_count);
            println!("{:<12} {}", "Waiting:", resp.waiting_count);
            println!("{:<12} {}", "Processing:", resp.processing_count);
            println!("{:<12} {}", "Total:", resp.total_count);
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Scheduler(scheduler_args) => {
            init_logging();
            run_scheduler(scheduler_args).await?;
        }
        Commands::Worker(worker_args) => {
            init_logging();
            run_worker(worker_args).await?;
        }
        Commands::Job { client, command } => {
            let channel = create_client_channel(&client).await?;
            let mut grpc_client = SchedulerServiceClient::new(channel);

            match command {
                JobCommands::Submit(submit) => {
                    handle_job_submit(&mut grpc_client, submit, &client.output).await?;
                }
            }
        }
        Commands::Status { client } => {
            let channel = create_client_channel(&client).await?;
            let mut grpc_client = SchedulerServiceClient::new(channel);
            handle_status(&mut grpc_client, &client.output).await?;
        }
    }

    Ok(())
}
