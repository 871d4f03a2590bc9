use std::path::Path;
use std::sync::Arc;

use crate::scheduler::job::Job;
use crate::sink::{FailureCode, JobOutcome, ResultSink, Verdict};
use crate::worker::executor::{ExecutionResult, Executor};
use crate::worker::grading;
use crate::worker::provision::{Provisioner, SourceRequest};
use crate::worker::scripts::ScriptCatalog;

/// Outcome of judging a directory, plus the raw execution when one happened.
#[derive(Debug, Clone)]
pub struct Judged {
    pub outcome: JobOutcome,
    pub execution: Option<ExecutionResult>,
}

/// Takes a job from source to recorded outcome.
#[derive(Clone)]
pub struct JobRunner {
    executor: Executor,
    provisioner: Arc<dyn Provisioner>,
    scripts: Arc<dyn ScriptCatalog>,
    sink: Arc<dyn ResultSink>,
}

impl JobRunner {
    pub fn new(
        executor: Executor,
        provisioner: Arc<dyn Provisioner>,
        scripts: Arc<dyn ScriptCatalog>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            executor,
            provisioner,
            scripts,
            sink,
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Provision, judge, record, and clean up one dispatched job.
    ///
    /// The outcome is recorded in the sink exactly once before returning.
    pub async fn run_job(&self, job: &Job) -> JobOutcome {
        tracing::info!(
            correlation_id = job.correlation_id,
            repo = %job.repo_full_name,
            parent = %job.parent_repo,
            "Running job"
        );

        let request = SourceRequest::from(job);
        let outcome = match self.provisioner.provision(&request).await {
            Ok(path) => {
                let judged = self
                    .judge_dir(job.correlation_id, &job.parent_repo, job.script.clone(), &path)
                    .await;
                self.provisioner.discard(&path).await;
                judged.outcome
            }
            Err(e) => JobOutcome::failed(
                job.correlation_id,
                FailureCode::Checkout,
                format!("Failed to fetch {}: {}", job.repo_full_name, e),
            ),
        };

        self.sink.record(outcome.clone()).await;
        outcome
    }

    /// Judge an existing directory and record the outcome.
    pub async fn judge_and_record(
        &self,
        correlation_id: u64,
        parent_repo: &str,
        workdir: &Path,
    ) -> Judged {
        let judged = self.judge_dir(correlation_id, parent_repo, None, workdir).await;
        self.sink.record(judged.outcome.clone()).await;
        judged
    }

    async fn judge_dir(
        &self,
        correlation_id: u64,
        parent_repo: &str,
        inline_script: Option<String>,
        workdir: &Path,
    ) -> Judged {
        let script = match inline_script {
            Some(script) => script,
            None => match self.scripts.script_for(parent_repo).await {
                Ok(script) => script,
                Err(e) => {
                    return Judged {
                        outcome: JobOutcome::failed(
                            correlation_id,
                            FailureCode::Script,
                            e.to_string(),
                        ),
                        execution: None,
                    }
                }
            },
        };

        let execution = self.executor.run(&script, Some(workdir)).await;
        let verdict = grading::grade(&execution, Some(workdir)).await;
        let outcome = match verdict {
            Verdict::Scored(score) => {
                JobOutcome::scored(correlation_id, score, execution.output.clone())
            }
            Verdict::Failed(code) => JobOutcome::failed(
                correlation_id,
                code,
                format!("{}: {}", execution.status, execution.output),
            ),
        };

        Judged {
            outcome,
            execution: Some(execution),
        }
    }
}
