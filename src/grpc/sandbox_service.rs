use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::task::TaskTracker;
use tonic::{Request, Response, Status};

use crate::proto;
use crate::proto::sandbox_service_server::SandboxService;
use crate::worker::pool::SlotPool;
use crate::worker::runner::JobRunner;

/// Unary calls served by a worker node for local or operator use.
///
/// Jobs started here share the pool and the in-flight tracker with jobs that
/// arrive over the scheduler stream, so shutdown drains both.
#[derive(Clone)]
pub struct SandboxFacade {
    pool: Arc<SlotPool>,
    runner: JobRunner,
    tasks: TaskTracker,
}

impl SandboxFacade {
    pub fn new(pool: Arc<SlotPool>, runner: JobRunner, tasks: TaskTracker) -> Self {
        Self {
            pool,
            runner,
            tasks,
        }
    }
}

fn checked_path(repo: &str, path: &str) -> Result<PathBuf, Status> {
    if repo.is_empty() {
        return Err(Status::invalid_argument("repo is required"));
    }
    if path.is_empty() {
        return Err(Status::invalid_argument("path is required"));
    }
    let path = PathBuf::from(path);
    if !path.is_dir() {
        return Err(Status::not_found(format!(
            "{} is not a directory",
            path.display()
        )));
    }
    Ok(path)
}

#[tonic::async_trait]
impl SandboxService for SandboxFacade {
    async fn execute_code(
        &self,
        request: Request<proto::ExecuteCodeRequest>,
    ) -> Result<Response<proto::ExecuteCodeResponse>, Status> {
        let req = request.into_inner();
        let workdir = checked_path(&req.repo, &req.path)?;

        let judged = self
            .runner
            .judge_and_record(req.correlation_id, &req.repo, &workdir)
            .await;
        let output = match judged.execution {
            Some(execution) => execution.output,
            None => judged.outcome.message.clone(),
        };

        Ok(Response::new(proto::ExecuteCodeResponse {
            success: judged.outcome.is_success(),
            output,
            score: judged.outcome.verdict.score(),
        }))
    }

    async fn add_job(
        &self,
        request: Request<proto::AddJobRequest>,
    ) -> Result<Response<proto::AddJobResponse>, Status> {
        let req = request.into_inner();
        let workdir = checked_path(&req.repo, &req.path)?;
        let job_id = format!("job_{}_{}", req.correlation_id, req.repo);

        if self.tasks.is_closed() {
            return Ok(Response::new(proto::AddJobResponse {
                success: false,
                message: "worker is shutting down".to_string(),
                job_id,
            }));
        }

        let runner = self.runner.clone();
        let correlation_id = req.correlation_id;
        let repo = req.repo;
        self.tasks.spawn(async move {
            runner
                .judge_and_record(correlation_id, &repo, &workdir)
                .await;
        });
        tracing::info!(job_id = %job_id, "Job accepted");

        Ok(Response::new(proto::AddJobResponse {
            success: true,
            message: "accepted".to_string(),
            job_id,
        }))
    }

    async fn get_status(
        &self,
        _request: Request<proto::StatusRequest>,
    ) -> Result<Response<proto::StatusResponse>, Status> {
        Ok(Response::new(self.pool.status().into()))
    }

    async fn health_check(
        &self,
        _request: Request<proto::StatusRequest>,
    ) -> Result<Response<proto::StatusResponse>, Status> {
        let status = self.pool.status();
        if status.total == 0 {
            return Err(Status::unavailable("no sandbox slots"));
        }
        Ok(Response::new(status.into()))
    }
}
