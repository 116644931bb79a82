use crate::analyzer::{Analyzer, SubjectSource};
use crate::error::StoreError;
use crate::limiter::RateLimiter;
use crate::progress::ProgressTracker;
use crate::store::{JobStore, ReclaimOutcome, Reclaimed};
use crate::worker::{self, Dispatch, WorkMessage, WorkerContext};
use crate::writer::ResultWriter;
use crate::JobStatus;
use anyhow::{ensure, Error};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

/// Shared handles used by the dispatcher, the reaper, the workers and the API.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn JobStore>,
    pub analyzer: Arc<dyn Analyzer>,
    pub subjects: Arc<dyn SubjectSource>,
    pub writer: Arc<dyn ResultWriter>,
    pub limiter: Arc<RateLimiter>,
    pub progress: Arc<ProgressTracker>,
    /// Nudges the dispatcher when new work may be ready.
    pub wake: Arc<Notify>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub workers: u16,
    /// Prefix of every lease owner token handed out by this process.
    pub instance: String,
    pub lease_duration: Duration,
    pub poll_interval: Duration,
    pub reaper_interval: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            workers: 3,
            instance: default_instance(),
            lease_duration: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            reaper_interval: Duration::from_secs(5),
        }
    }
}

pub fn default_instance() -> String {
    format!("analysisq-{}", std::process::id())
}

pub async fn serve(
    cancel_token: CancellationToken,
    services: Services,
    settings: ServerSettings,
) -> Result<(), Error> {
    ensure!(!settings.lease_duration.is_zero(), "lease duration must be positive");
    ensure!(!settings.poll_interval.is_zero(), "poll interval must be positive");
    ensure!(!settings.reaper_interval.is_zero(), "reaper interval must be positive");

    let workers_count = settings.workers.max(1);
    let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
    let (send_to_queue, recv_from_queue) =
        async_channel::bounded::<Dispatch>(workers_count as usize);

    let context = WorkerContext {
        store: services.store.clone(),
        analyzer: services.analyzer.clone(),
        subjects: services.subjects.clone(),
        writer: services.writer.clone(),
        limiter: services.limiter.clone(),
        progress: services.progress.clone(),
        renew_every: (settings.lease_duration / 3).max(Duration::from_millis(1)),
    };

    let mut workers = vec![];
    for index in 0..workers_count {
        let context = context.clone();
        let send_to_server = send_to_server.clone();
        let cancel_token = cancel_token.clone();
        let recv_from_queue = recv_from_queue.clone();
        let join_handle = tokio::spawn(
            async move {
                worker::start(context, cancel_token, recv_from_queue, send_to_server).await;
            }
            .instrument(info_span!("worker", worker = index)),
        );
        workers.push(join_handle);
    }

    // Runs immediately, so leases abandoned by a previous process come back first.
    workers.push(tokio::spawn(
        reap(cancel_token.clone(), services.clone(), settings.reaper_interval)
            .instrument(info_span!("reaper")),
    ));

    let mut free_workers = workers_count as usize;
    info!(workers = workers_count, instance = %settings.instance, "Server started");

    loop {
        // Each dispatched job carries the permit for its first call, so a job
        // is only leased when the analyzer can take it right away. While a
        // half-open trial is out no further permit is granted.
        while free_workers > 0 {
            let permit = match services.limiter.acquire() {
                Ok(permit) => permit,
                Err(denied) => {
                    trace!(denied = ?denied, "No analyzer budget, not dispatching");
                    break;
                }
            };
            let owner = format!("{}:{}", settings.instance, Uuid::new_v4());
            match services.store.dequeue(&owner).await {
                Ok(Some(job)) => {
                    debug!(
                        job_id = %job.job_id,
                        priority = ?job.priority,
                        trial = permit.is_trial(),
                        "Dispatching job"
                    );
                    send_to_queue.send(Dispatch { job, permit }).await?;
                    free_workers -= 1;
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "Could not dequeue");
                    break;
                }
            }
        }

        // Without budget, sleep until the limiter expects some. A pending
        // half-open trial has no estimate, so fall back to polling.
        let wait = services
            .limiter
            .time_until_available()
            .filter(|d| !d.is_zero())
            .map(|d| d.min(settings.poll_interval))
            .unwrap_or(settings.poll_interval);

        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            chan_msg = recv_from_worker.recv() => {
                match chan_msg {
                    None => {
                        debug!("Worker channel closed unexpectedly, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(WorkMessage::JobFinished(job_id, outcome)) => {
                        debug!(job_id = %job_id, outcome = ?outcome, "Worker free");
                        free_workers += 1;
                    },
                }
            },
            _ = sleep(wait) => {},
            _ = services.wake.notified() => {},
        }
    }

    send_to_queue.close();

    // Wait for all workers to complete
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Server stopped.");

    Ok(())
}

async fn reap(cancel_token: CancellationToken, services: Services, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Reaper Cancelled");
                break;
            },
            _ = ticker.tick() => {
                if let Err(err) = reap_once(&services).await {
                    warn!(error = %err, "Reaper pass failed");
                }
            }
        }
    }
}

/// One reaper pass: reclaim expired leases, then drop expired records.
pub async fn reap_once(services: &Services) -> Result<Vec<Reclaimed>, StoreError> {
    let reclaimed = services.store.reclaim_expired().await?;
    for Reclaimed { job_id, outcome } in &reclaimed {
        match outcome {
            ReclaimOutcome::Requeued { attempt_count } => {
                warn!(job_id = %job_id, attempt_count, "Lease expired, job requeued");
                services
                    .progress
                    .set_message(*job_id, "Worker lost, retrying")
                    .await;
            }
            ReclaimOutcome::Failed => {
                error!(job_id = %job_id, "Lease expired on the final attempt, job failed");
                services
                    .progress
                    .finish(*job_id, JobStatus::Failed, "Failed: worker lost on the final attempt")
                    .await;
            }
            ReclaimOutcome::Cancelled => {
                info!(job_id = %job_id, "Lease expired with a pending cancel, job cancelled");
                services
                    .progress
                    .finish(*job_id, JobStatus::Cancelled, "Cancelled")
                    .await;
            }
        }
    }

    let purged_progress = services.progress.purge_expired().await?;
    let retention = services.progress.retention();
    let purged_jobs = services
        .store
        .purge_terminal(retention.finished, retention.cancelled)
        .await?;
    if purged_progress > 0 || purged_jobs > 0 {
        debug!(purged_progress, purged_jobs, "Purged expired records");
    }

    if !reclaimed.is_empty() {
        services.wake.notify_one();
    }
    Ok(reclaimed)
}
