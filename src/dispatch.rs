use std::sync::Arc;

use crate::config::RegistryConfig;
use crate::error::Result;
use crate::scheduler::job::Job;
use crate::scheduler::registry::{InstanceRegistry, InstanceSummary};
use crate::worker::pool::PoolStatus;

/// Entry point for callers that want work graded.
///
/// Cheap to clone. Each dispatcher is bound to the registry it was built
/// with, so independent schedulers can coexist in one process.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<InstanceRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<InstanceRegistry>) -> Self {
        Self { registry }
    }

    /// Dispatcher over a fresh, empty registry.
    pub fn with_config(config: RegistryConfig) -> Self {
        Self::new(Arc::new(InstanceRegistry::new(config)))
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Route a job to the least-loaded active instance. Returns its id.
    ///
    /// A failure here is final for this attempt; the caller decides whether
    /// to mark the job failed or try again later.
    pub async fn reserve_job(&self, job: Job) -> Result<String> {
        self.registry.reserve_job(job).await
    }

    pub async fn status(&self) -> PoolStatus {
        self.registry.global_status().await
    }

    pub async fn instances(&self) -> Vec<InstanceSummary> {
        self.registry.instances().await
    }

    pub async fn active_instances(&self) -> usize {
        self.registry.active_count().await
    }
}
