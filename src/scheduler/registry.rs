use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RegistryConfig;
use crate::error::{Result, SandboxError};
use crate::scheduler::job::Job;
use crate::worker::pool::PoolStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Active,
    /// Silent past the staleness window; kept but not selected.
    Inactive,
}

/// Registry entry for one connected worker.
#[derive(Debug)]
struct WorkerInstance {
    capacity: u32,
    status: Option<PoolStatus>,
    last_seen: Instant,
    connected_at: DateTime<Utc>,
    state: InstanceState,
    session: u64,
    jobs: mpsc::Sender<Job>,
    closed: CancellationToken,
}

impl WorkerInstance {
    fn is_selectable(&self) -> bool {
        self.state == InstanceState::Active && self.status.is_some()
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// What the connection handler needs to serve a newly registered instance.
#[derive(Debug)]
pub struct InstanceHandle {
    pub instance_id: String,
    /// Distinguishes this connection from earlier ones with the same id.
    pub session: u64,
    /// Jobs routed to this instance, in order.
    pub jobs: mpsc::Receiver<Job>,
    /// Fires when the entry is removed or replaced.
    pub closed: CancellationToken,
}

/// Read-only view of one entry.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub instance_id: String,
    pub capacity: u32,
    pub state: InstanceState,
    pub status: Option<PoolStatus>,
    pub queued: usize,
    pub idle_ms: u64,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    pub deactivated: Vec<String>,
    pub removed: Vec<String>,
}

/// Connected worker instances, keyed by instance id.
///
/// Inserts and removals take the write lock; selection and aggregation only
/// read. No lock is held across an await other than the lock itself, and
/// job hand-off uses `try_send`, so a full queue fails instead of blocking.
#[derive(Debug)]
pub struct InstanceRegistry {
    instances: RwLock<HashMap<String, WorkerInstance>>,
    config: RegistryConfig,
    sessions: AtomicU64,
}

impl InstanceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            config,
            sessions: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Add an instance, replacing (and closing) any entry with the same id.
    pub async fn register(&self, instance_id: &str, capacity: u32) -> InstanceHandle {
        let session = self.sessions.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let closed = CancellationToken::new();

        let entry = WorkerInstance {
            capacity,
            status: None,
            last_seen: Instant::now(),
            connected_at: Utc::now(),
            state: InstanceState::Active,
            session,
            jobs: tx,
            closed: closed.clone(),
        };

        let previous = self
            .instances
            .write()
            .await
            .insert(instance_id.to_string(), entry);
        if let Some(previous) = previous {
            tracing::warn!(instance_id, "Instance reconnected, closing previous session");
            previous.close();
        }
        tracing::info!(instance_id, capacity, session, "Instance registered");

        InstanceHandle {
            instance_id: instance_id.to_string(),
            session,
            jobs: rx,
            closed,
        }
    }

    /// Store a status snapshot and refresh the heartbeat. Reactivates an
    /// inactive instance.
    pub async fn record_status(
        &self,
        instance_id: &str,
        session: u64,
        status: PoolStatus,
    ) -> Result<()> {
        let mut instances = self.instances.write().await;
        let entry = instances
            .get_mut(instance_id)
            .filter(|e| e.session == session)
            .ok_or_else(|| SandboxError::InstanceNotFound(instance_id.to_string()))?;

        if entry.state == InstanceState::Inactive {
            tracing::info!(instance_id, "Instance active again");
        }
        entry.status = Some(status);
        entry.last_seen = Instant::now();
        entry.state = InstanceState::Active;
        Ok(())
    }

    /// Remove an instance if `session` still owns the entry.
    pub async fn remove(&self, instance_id: &str, session: u64) -> bool {
        let mut instances = self.instances.write().await;
        match instances.get(instance_id) {
            Some(entry) if entry.session == session => {
                if let Some(entry) = instances.remove(instance_id) {
                    entry.close();
                }
                tracing::info!(instance_id, session, "Instance removed");
                true
            }
            _ => false,
        }
    }

    /// Queue a job on the active instance reporting the most free slots.
    ///
    /// Returns the chosen instance id. Fails without retrying when no
    /// instance is eligible or the chosen queue is full.
    pub async fn reserve_job(&self, job: Job) -> Result<String> {
        let instances = self.instances.read().await;
        let (instance_id, entry) = instances
            .iter()
            .filter(|(_, e)| e.is_selectable())
            .max_by_key(|(_, e)| e.status.map(|s| s.available).unwrap_or(0))
            .ok_or(SandboxError::NoActiveInstance)?;

        let correlation_id = job.correlation_id;
        match entry.jobs.try_send(job) {
            Ok(()) => {
                tracing::info!(correlation_id, instance_id = %instance_id, "Job queued");
                Ok(instance_id.clone())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(correlation_id, instance_id = %instance_id, "Instance queue full");
                Err(SandboxError::QueueFull(instance_id.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(SandboxError::InstanceNotFound(instance_id.clone()))
            }
        }
    }

    /// Sum of the latest snapshots of all active instances.
    pub async fn global_status(&self) -> PoolStatus {
        self.instances
            .read()
            .await
            .values()
            .filter(|e| e.is_selectable())
            .filter_map(|e| e.status)
            .fold(PoolStatus::default(), PoolStatus::merge)
    }

    pub async fn active_count(&self) -> usize {
        self.instances
            .read()
            .await
            .values()
            .filter(|e| e.state == InstanceState::Active)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    pub async fn contains(&self, instance_id: &str) -> bool {
        self.instances.read().await.contains_key(instance_id)
    }

    pub async fn instances(&self) -> Vec<InstanceSummary> {
        let now = Instant::now();
        let mut out: Vec<InstanceSummary> = self
            .instances
            .read()
            .await
            .iter()
            .map(|(id, e)| InstanceSummary {
                instance_id: id.clone(),
                capacity: e.capacity,
                state: e.state,
                status: e.status,
                queued: e.jobs.max_capacity() - e.jobs.capacity(),
                idle_ms: now.duration_since(e.last_seen).as_millis() as u64,
                connected_at: e.connected_at,
            })
            .collect();
        out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        out
    }

    /// Deactivate instances silent past `inactive_after` and remove those
    /// silent past `remove_after`.
    pub async fn reap(&self) -> ReapReport {
        let now = Instant::now();
        let mut report = ReapReport::default();
        let mut instances = self.instances.write().await;

        instances.retain(|id, entry| {
            let silence = now.duration_since(entry.last_seen);
            if silence > self.config.remove_after {
                entry.close();
                report.removed.push(id.clone());
                return false;
            }
            if silence > self.config.inactive_after && entry.state == InstanceState::Active {
                entry.state = InstanceState::Inactive;
                report.deactivated.push(id.clone());
            }
            true
        });
        drop(instances);

        for id in &report.deactivated {
            tracing::warn!(instance_id = %id, "Instance silent, marked inactive");
        }
        for id in &report.removed {
            tracing::warn!(instance_id = %id, "Instance silent too long, removed");
        }
        report
    }

    /// Run [`reap`](Self::reap) every `reap_interval` until cancelled.
    pub async fn run_reaper(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.reap_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.reap().await;
                }
            }
        }
        tracing::debug!("Reaper stopped");
    }

    /// Remove every instance, closing their queues.
    pub async fn close_all(&self) {
        let drained: Vec<(String, WorkerInstance)> =
            self.instances.write().await.drain().collect();
        for (id, entry) in drained {
            entry.close();
            tracing::debug!(instance_id = %id, "Instance closed");
        }
    }
}

