use std::sync::Arc;
use std::time::Duration;

use oj_sandbox::config::RegistryConfig;
use oj_sandbox::dispatch::Dispatcher;
use oj_sandbox::error::SandboxError;
use oj_sandbox::proto::scheduler_message::Kind;
use oj_sandbox::scheduler::{Forwarder, InstanceRegistry, InstanceState, Job};
use oj_sandbox::sink::{ChannelSink, FailureCode, Verdict};
use oj_sandbox::worker::PoolStatus;
use tokio::sync::mpsc;

fn status(available: u32, total: u32) -> PoolStatus {
    PoolStatus {
        available,
        waiting: 0,
        processing: total - available,
        total,
    }
}

fn job(correlation_id: u64) -> Job {
    Job::new(
        correlation_id,
        "course/hw1",
        "https://git.example.com/org/repo.git",
        "org/repo",
    )
}

fn registry() -> InstanceRegistry {
    InstanceRegistry::new(RegistryConfig::default())
}

#[tokio::test]
async fn test_selects_instance_with_most_available_slots() {
    let registry = registry();
    let a = registry.register("A", 4).await;
    let b = registry.register("B", 8).await;
    registry.record_status("A", a.session, status(3, 4)).await.unwrap();
    registry.record_status("B", b.session, status(7, 8)).await.unwrap();

    assert_eq!(registry.reserve_job(job(1)).await.unwrap(), "B");

    // Selection follows the latest snapshot.
    registry.record_status("B", b.session, status(1, 8)).await.unwrap();
    assert_eq!(registry.reserve_job(job(2)).await.unwrap(), "A");
}

#[tokio::test]
async fn test_instance_without_status_is_not_selected() {
    let registry = registry();
    let _a = registry.register("A", 4).await;

    let result = registry.reserve_job(job(1)).await;
    assert!(matches!(result, Err(SandboxError::NoActiveInstance)));
}

#[tokio::test]
async fn test_empty_registry_has_no_active_instance() {
    let registry = registry();
    let result = registry.reserve_job(job(1)).await;
    assert!(matches!(result, Err(SandboxError::NoActiveInstance)));
    assert_eq!(registry.global_status().await, PoolStatus::default());
}

#[tokio::test]
async fn test_full_queue_fails_without_blocking() {
    let registry = InstanceRegistry::new(RegistryConfig {
        queue_capacity: 1,
        ..Default::default()
    });
    let a = registry.register("A", 1).await;
    registry.record_status("A", a.session, status(1, 1)).await.unwrap();

    registry.reserve_job(job(1)).await.unwrap();
    let result = registry.reserve_job(job(2)).await;
    assert!(matches!(result, Err(SandboxError::QueueFull(id)) if id == "A"));
}

#[tokio::test]
async fn test_queued_jobs_keep_order() {
    let registry = registry();
    let mut a = registry.register("A", 2).await;
    registry.record_status("A", a.session, status(2, 2)).await.unwrap();

    for id in 1..=3 {
        registry.reserve_job(job(id)).await.unwrap();
    }
    for id in 1..=3 {
        assert_eq!(a.jobs.recv().await.unwrap().correlation_id, id);
    }
}

#[tokio::test]
async fn test_global_status_sums_active_instances() {
    let registry = registry();
    let a = registry.register("A", 4).await;
    let b = registry.register("B", 8).await;
    registry.record_status("A", a.session, status(3, 4)).await.unwrap();
    registry.record_status("B", b.session, status(7, 8)).await.unwrap();

    let total = registry.global_status().await;
    assert_eq!(total.available, 10);
    assert_eq!(total.processing, 2);
    assert_eq!(total.total, 12);
    assert_eq!(registry.active_count().await, 2);
}

#[tokio::test]
async fn test_global_status_saturates_on_huge_reports() {
    let registry = registry();
    let huge = i32::MAX as u32;
    let mut handles = Vec::new();
    for id in ["A", "B", "C"] {
        let handle = registry.register(id, 1).await;
        registry
            .record_status(
                id,
                handle.session,
                PoolStatus {
                    available: huge,
                    waiting: huge,
                    processing: huge,
                    total: huge,
                },
            )
            .await
            .unwrap();
        handles.push(handle);
    }

    let total = registry.global_status().await;
    assert_eq!(total.available, u32::MAX);
    assert_eq!(total.waiting, u32::MAX);
    assert_eq!(total.processing, u32::MAX);
    assert_eq!(total.total, u32::MAX);
}

#[tokio::test]
async fn test_reconnect_replaces_and_closes_previous_session() {
    let registry = registry();
    let first = registry.register("A", 2).await;
    let second = registry.register("A", 4).await;

    assert!(first.closed.is_cancelled());
    assert!(!second.closed.is_cancelled());
    assert_ne!(first.session, second.session);
    assert_eq!(registry.len().await, 1);

    // The old connection's teardown must not remove the new entry.
    assert!(!registry.remove("A", first.session).await);
    assert!(registry.contains("A").await);
    assert!(registry
        .record_status("A", first.session, status(2, 2))
        .await
        .is_err());

    assert!(registry.remove("A", second.session).await);
    assert!(second.closed.is_cancelled());
    assert!(registry.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_reaper_deactivates_then_removes_silent_instances() {
    let registry = registry();
    let a = registry.register("A", 2).await;
    let b = registry.register("B", 2).await;
    registry.record_status("A", a.session, status(2, 2)).await.unwrap();
    registry.record_status("B", b.session, status(1, 2)).await.unwrap();

    tokio::time::advance(Duration::from_secs(30)).await;
    registry.record_status("B", b.session, status(1, 2)).await.unwrap();

    tokio::time::advance(Duration::from_secs(31)).await;
    let report = registry.reap().await;
    assert_eq!(report.deactivated, vec!["A".to_string()]);
    assert!(report.removed.is_empty());

    // Inactive instances are skipped even with more free slots.
    assert_eq!(registry.reserve_job(job(1)).await.unwrap(), "B");
    let summaries = registry.instances().await;
    assert_eq!(summaries[0].instance_id, "A");
    assert_eq!(summaries[0].state, InstanceState::Inactive);

    tokio::time::advance(Duration::from_secs(240)).await;
    let report = registry.reap().await;
    assert_eq!(report.removed, vec!["A".to_string()]);
    assert!(a.closed.is_cancelled());
    assert!(!registry.contains("A").await);
}

#[tokio::test(start_paused = true)]
async fn test_status_reactivates_inactive_instance() {
    let registry = registry();
    let a = registry.register("A", 2).await;
    registry.record_status("A", a.session, status(2, 2)).await.unwrap();

    tokio::time::advance(Duration::from_secs(61)).await;
    registry.reap().await;
    assert!(matches!(
        registry.reserve_job(job(1)).await,
        Err(SandboxError::NoActiveInstance)
    ));

    registry.record_status("A", a.session, status(2, 2)).await.unwrap();
    assert_eq!(registry.reserve_job(job(2)).await.unwrap(), "A");
}

#[tokio::test(start_paused = true)]
async fn test_reaper_task_runs_on_interval() {
    let registry = Arc::new(registry());
    let a = registry.register("A", 2).await;
    registry.record_status("A", a.session, status(2, 2)).await.unwrap();

    let shutdown = tokio_util::sync::CancellationToken::new();
    let reaper = tokio::spawn(registry.clone().run_reaper(shutdown.clone()));

    tokio::time::sleep(Duration::from_secs(331)).await;
    assert!(registry.is_empty().await);

    shutdown.cancel();
    reaper.await.unwrap();
}

#[tokio::test]
async fn test_forwarder_delivers_queued_jobs_in_order() {
    let registry = registry();
    let a = registry.register("A", 2).await;
    let session = a.session;
    registry.record_status("A", session, status(2, 2)).await.unwrap();
    registry.reserve_job(job(1)).await.unwrap();
    registry.reserve_job(job(2)).await.unwrap();

    let (sink, mut outcomes) = ChannelSink::new();
    let (tx, mut rx) = mpsc::channel(8);
    let forwarder = Forwarder::new("A".into(), a.jobs, a.closed, tx, Arc::new(sink));
    let task = tokio::spawn(forwarder.run());

    for expected in [1, 2] {
        let message = rx.recv().await.unwrap().unwrap();
        assert_eq!(message.instance_id, "A");
        match message.kind {
            Some(Kind::JobRequest(req)) => assert_eq!(req.correlation_id, expected),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    registry.remove("A", session).await;
    assert_eq!(task.await.unwrap(), 2);
    assert!(outcomes.try_recv().is_err());
}

#[tokio::test]
async fn test_removed_instance_fails_queued_jobs() {
    let registry = registry();
    let a = registry.register("A", 2).await;
    registry.record_status("A", a.session, status(2, 2)).await.unwrap();
    registry.reserve_job(job(1)).await.unwrap();
    registry.reserve_job(job(2)).await.unwrap();
    registry.remove("A", a.session).await;

    let (sink, mut outcomes) = ChannelSink::new();
    let (tx, _rx) = mpsc::channel(8);
    let delivered = Forwarder::new("A".into(), a.jobs, a.closed, tx, Arc::new(sink))
        .run()
        .await;
    assert_eq!(delivered, 0);

    for expected in [1, 2] {
        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.correlation_id, expected);
        assert_eq!(outcome.verdict, Verdict::Failed(FailureCode::Dispatch));
        assert!(outcome.message.contains("A"));
    }
    assert!(outcomes.try_recv().is_err());
}

#[tokio::test]
async fn test_closed_stream_fails_the_job_being_sent() {
    let registry = registry();
    let a = registry.register("A", 2).await;
    registry.record_status("A", a.session, status(2, 2)).await.unwrap();
    registry.reserve_job(job(5)).await.unwrap();

    let (sink, mut outcomes) = ChannelSink::new();
    let (tx, rx) = mpsc::channel(8);
    drop(rx);
    Forwarder::new("A".into(), a.jobs, a.closed, tx, Arc::new(sink))
        .run()
        .await;

    let outcome = outcomes.recv().await.unwrap();
    assert_eq!(outcome.correlation_id, 5);
    assert_eq!(outcome.verdict, Verdict::Failed(FailureCode::Dispatch));
}

#[tokio::test]
async fn test_dispatchers_are_independent() {
    let first = Dispatcher::with_config(RegistryConfig::default());
    let second = Dispatcher::with_config(RegistryConfig::default());

    let a = first.registry().register("A", 1).await;
    first
        .registry()
        .record_status("A", a.session, status(1, 1))
        .await
        .unwrap();

    assert_eq!(first.reserve_job(job(1)).await.unwrap(), "A");
    assert!(matches!(
        second.reserve_job(job(2)).await,
        Err(SandboxError::NoActiveInstance)
    ));
    assert_eq!(first.active_instances().await, 1);
    assert_eq!(second.active_instances().await, 0);

    let cloned = first.clone();
    assert_eq!(cloned.status().await.total, 1);
}
