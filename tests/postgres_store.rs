//! Runs against the database in `DATABASE_URL`; skipped when it is unset.
//! The `analysis_jobs` and `analysis_progress` tables are truncated first.

use analysisq::db::{PgProgressStore, PgStore};
use analysisq::progress::{ProgressStore, ProgressTracker, Retention};
use analysisq::store::{Backoff, JobFailure, JobStore, ReclaimOutcome, StoreSettings};
use analysisq::{ErrorKind, JobRequest, JobStatus, Priority};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

async fn store(lease: Duration) -> Option<PgStore> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let settings = StoreSettings {
        lease_duration: lease,
        default_max_attempts: 3,
        backoff: Backoff {
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: false,
        },
    };
    Some(PgStore::connect(&url, settings).await.unwrap())
}

#[tokio::test]
async fn postgres_store_lifecycle() {
    let Some(store) = store(Duration::from_millis(200)).await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    sqlx::query("TRUNCATE analysis_jobs")
        .execute(store.pool())
        .await
        .unwrap();

    // Dedup: one active job per key.
    let first = store.enqueue(JobRequest::song("1", Priority::Low)).await.unwrap();
    let again = store.enqueue(JobRequest::song("1", Priority::Low)).await.unwrap();
    assert_eq!(first, again);

    // Priority, then FIFO.
    let high = store.enqueue(JobRequest::song("2", Priority::High)).await.unwrap();
    let medium = store.enqueue(JobRequest::song("3", Priority::Medium)).await.unwrap();
    let order: Vec<_> = [
        store.dequeue("w:1").await.unwrap().unwrap(),
        store.dequeue("w:2").await.unwrap().unwrap(),
        store.dequeue("w:3").await.unwrap().unwrap(),
    ]
    .into_iter()
    .map(|job| job.job_id)
    .collect();
    assert_eq!(order, vec![high, medium, first]);
    assert!(store.dequeue("w:4").await.unwrap().is_none());

    // Only the lease holder settles a job.
    assert!(store.complete(high, "w:2").await.unwrap_err().is_ownership());
    store.complete(high, "w:1").await.unwrap();
    let done = store.get(high).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.lease_owner.is_none());

    // Transient failures retry until attempts run out.
    let transient = || JobFailure::retryable(ErrorKind::Transient, "502 from analyzer");
    assert_eq!(store.fail(medium, "w:2", transient()).await.unwrap(), JobStatus::Queued);
    for (owner, expected) in [("w:11", JobStatus::Queued), ("w:12", JobStatus::Failed)] {
        let job = store.dequeue(owner).await.unwrap().unwrap();
        assert_eq!(job.job_id, medium);
        assert_eq!(store.fail(medium, owner, transient()).await.unwrap(), expected);
    }
    let failed = store.get(medium).await.unwrap().unwrap();
    assert_eq!(failed.attempt_count, 3);
    assert_eq!(failed.error_kind, Some(ErrorKind::Transient));
    assert!(store.dequeue("w:13").await.unwrap().is_none());

    // Completed jobs free their dedup key.
    let rerun = store.enqueue(JobRequest::song("2", Priority::High)).await.unwrap();
    assert_ne!(rerun, high);

    // An expired lease is reclaimed exactly once.
    let lease = store.renew_lease(first, "w:3").await.unwrap();
    assert!(!lease.cancel_requested);
    tokio::time::sleep(Duration::from_millis(300)).await;
    let reclaimed = store.reclaim_expired().await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].job_id, first);
    assert_eq!(reclaimed[0].outcome, ReclaimOutcome::Requeued { attempt_count: 1 });
    assert!(store.reclaim_expired().await.unwrap().is_empty());
    assert!(store.renew_lease(first, "w:3").await.unwrap_err().is_ownership());

    // Cancelling: queued goes straight to cancelled, in progress is flagged.
    assert_eq!(store.cancel(first).await.unwrap(), JobStatus::Cancelled);
    let job = store.dequeue("w:99").await.unwrap().unwrap();
    assert_eq!(job.job_id, rerun);
    assert_eq!(store.cancel(rerun).await.unwrap(), JobStatus::InProgress);
    assert!(store.renew_lease(rerun, "w:99").await.unwrap().cancel_requested);
    store.acknowledge_cancel(rerun, "w:99").await.unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.cancelled, 2);
    assert_eq!(stats.queued + stats.in_progress, 0);

    assert_eq!(
        store
            .purge_terminal(Duration::from_secs(3600), Duration::ZERO)
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn postgres_progress_survives_the_tracker() {
    let Some(store) = store(Duration::from_secs(60)).await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    sqlx::query("TRUNCATE analysis_progress")
        .execute(store.pool())
        .await
        .unwrap();
    let progress_store = Arc::new(PgProgressStore::new(store.pool().clone()));
    let retention = Retention {
        finished: Duration::from_secs(3600),
        cancelled: Duration::ZERO,
    };

    let running = Uuid::new_v4();
    let cancelled = Uuid::new_v4();
    {
        let tracker = ProgressTracker::new(progress_store.clone(), retention.clone());
        tracker.start(running, 4).await;
        tracker.begin_item(running, "a").await;
        tracker.advance(running, "a", "Analyzed 1 of 4").await;
        tracker.start(cancelled, 1).await;
        tracker.finish(cancelled, JobStatus::Cancelled, "Cancelled").await;
    }

    // A fresh tracker, as after a restart, reads the last snapshot.
    let tracker = ProgressTracker::new(progress_store.clone(), retention);
    let record = tracker.get_status(running).await.unwrap().unwrap();
    assert_eq!(record.percent_complete, 25.0);
    assert_eq!(record.completed_items, 1);
    assert_eq!(record.current_item.as_deref(), Some("a"));
    assert_eq!(record.message, "Analyzed 1 of 4");
    assert!(record.eta_seconds.is_some());

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM analysis_progress WHERE job_id = $1")
        .bind(running)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(rows, 3);

    assert_eq!(tracker.purge_expired().await.unwrap(), 1);
    assert!(tracker.get_status(cancelled).await.unwrap().is_none());
    assert!(progress_store.latest(running).await.unwrap().is_some());
}
