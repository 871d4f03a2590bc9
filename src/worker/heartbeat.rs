use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::wire::WorkerEvent;
use crate::worker::pool::{PoolStatus, SlotPool};
use crate::worker::runtime::Outbox;

/// Pushes pool status to the scheduler.
///
/// Checks every `interval`, but only sends when the status changed or
/// `force_after` elapsed since the last send, so an idle node still reports
/// often enough to stay active.
pub struct StatusReporter {
    interval: Duration,
    force_after: Duration,
}

impl StatusReporter {
    pub fn new(interval: Duration, force_after: Duration) -> Self {
        Self {
            interval,
            force_after,
        }
    }

    /// Run until cancelled or the outbox closes.
    pub async fn run(&self, pool: Arc<SlotPool>, outbox: Outbox, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        let mut last: Option<(PoolStatus, Instant)> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let status = pool.status();
            let now = Instant::now();
            if !self.should_send(last, status, now) {
                continue;
            }
            if !outbox.send(WorkerEvent::Status(status)).await {
                // Stream gone, stop sending
                break;
            }
            last = Some((status, now));
        }
    }

    pub fn should_send(
        &self,
        last: Option<(PoolStatus, Instant)>,
        current: PoolStatus,
        now: Instant,
    ) -> bool {
        match last {
            None => true,
            Some((sent, at)) => sent != current || now.duration_since(at) >= self.force_after,
        }
    }
}
