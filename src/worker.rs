use crate::analyzer::{AnalysisResult, AnalyzeError, Analyzer, SubjectSource};
use crate::error::StoreError;
use crate::limiter::{Denied, FailureKind, Permit, RateLimiter};
use crate::progress::ProgressTracker;
use crate::store::{JobFailure, JobStore, Lease};
use crate::writer::ResultWriter;
use crate::{AnalysisJob, ErrorKind, JobId, JobStatus};
use async_channel::Receiver;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{interval_at, sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::*;

/// A leased job and the analyzer call reserved for it by the dispatcher.
#[derive(Debug)]
pub struct Dispatch {
    pub job: AnalysisJob,
    pub permit: Permit,
}

#[derive(Debug)]
pub enum WorkMessage {
    JobFinished(JobId, JobOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { succeeded: usize, failed: usize },
    Requeued,
    Failed,
    Cancelled,
    /// The worker stopped without settling the job; its lease will expire
    /// and the reaper takes it back.
    Abandoned,
}

/// Everything a worker needs, shared by the whole pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub analyzer: Arc<dyn Analyzer>,
    pub subjects: Arc<dyn SubjectSource>,
    pub writer: Arc<dyn ResultWriter>,
    pub limiter: Arc<RateLimiter>,
    pub progress: Arc<ProgressTracker>,
    /// How often a lease is renewed while a call or wait is in flight.
    pub renew_every: Duration,
}

pub async fn start(
    ctx: WorkerContext,
    cancel_token: CancellationToken,
    recv_from_queue: Receiver<Dispatch>,
    send_to_server: UnboundedSender<WorkMessage>,
) {
    let worker = Worker { ctx, cancel_token };
    loop {
        tokio::select! {
            _ = worker.cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            job = recv_from_queue.recv() => {
                match job {
                    Err(err) => {
                        error!(message = "Error receiving job by worker, exiting", error = ?err);
                        break;
                    },
                    Ok(Dispatch { job, permit }) => {
                        let job_id = job.job_id;
                        let outcome = worker
                            .process(job, permit)
                            .instrument(info_span!("job", job_id = %job_id))
                            .await;
                        debug!(job_id = %job_id, outcome = ?outcome, "Job settled");
                        if send_to_server.send(WorkMessage::JobFinished(job_id, outcome)).is_err() {
                            debug!("Dispatcher gone, worker exiting");
                            break;
                        }
                    }
                }
            }
        }
    }
    info!("Worker stopped.");
}

#[derive(Debug)]
enum Interrupt {
    LeaseLost,
    Shutdown,
}

#[derive(Debug, Clone)]
pub(crate) struct ItemOutcome {
    pub subject_id: String,
    pub result: Result<AnalysisResult, AnalyzeError>,
}

#[derive(Debug)]
pub(crate) enum Decision {
    Complete,
    Retry(JobFailure),
    Fatal(JobFailure),
}

/// Settles an attempt from its per-item outcomes.
///
/// Item failures that cannot be retried are recorded and the rest of the
/// batch still counts. Retryable failures retry the whole job while attempts
/// remain; on the last attempt whatever succeeded is kept.
pub(crate) fn decide(job: &AnalysisJob, items: &[ItemOutcome]) -> Decision {
    let succeeded = items.iter().filter(|i| i.result.is_ok()).count();
    let retryable: Vec<&AnalyzeError> = items
        .iter()
        .filter_map(|i| i.result.as_ref().err())
        .filter(|e| e.is_retryable())
        .collect();

    if retryable.is_empty() {
        if succeeded > 0 {
            return Decision::Complete;
        }
        let message = items
            .iter()
            .find_map(|i| i.result.as_ref().err().map(|e| format!("{}: {e}", i.subject_id)))
            .unwrap_or_else(|| "no subjects analyzed".to_string());
        return Decision::Fatal(JobFailure::fatal(ErrorKind::Validation, message));
    }

    let last_attempt = job.attempt_count + 1 >= job.max_attempts;
    if last_attempt && succeeded > 0 {
        return Decision::Complete;
    }

    let retry_after = retryable.iter().filter_map(|e| e.retry_after()).max();
    let first = retryable[0];
    let kind = if retry_after.is_some() {
        ErrorKind::RateLimited
    } else {
        first.kind()
    };
    let message = format!("{} of {} subjects failed: {first}", retryable.len(), items.len());
    Decision::Retry(JobFailure::retryable(kind, message).with_retry_after(retry_after))
}

struct Worker {
    ctx: WorkerContext,
    cancel_token: CancellationToken,
}

impl Worker {
    async fn process(&self, job: AnalysisJob, permit: Permit) -> JobOutcome {
        let Some(owner) = job.lease_owner.clone() else {
            error!("Received a job without a lease");
            return JobOutcome::Abandoned;
        };
        match self.run(&job, &owner, permit).await {
            Ok(outcome) => outcome,
            Err(Interrupt::LeaseLost) => {
                warn!("Lost the lease, leaving the job to its new owner");
                JobOutcome::Abandoned
            }
            Err(Interrupt::Shutdown) => {
                info!("Shutting down mid-job, the lease will be reclaimed");
                JobOutcome::Abandoned
            }
        }
    }

    async fn run(&self, job: &AnalysisJob, owner: &str, permit: Permit) -> Result<JobOutcome, Interrupt> {
        let job_id = job.job_id;
        let total = job.subject_ids.len();
        info!(
            subjects = total,
            attempt = job.attempt_count + 1,
            max_attempts = job.max_attempts,
            "Processing job"
        );
        self.ctx.progress.start(job_id, total).await;

        // Spent on the first call; an unused one goes back to the limiter.
        let mut reserved = Some(permit);
        let mut items: Vec<ItemOutcome> = Vec::with_capacity(total);
        for (index, subject_id) in job.subject_ids.iter().enumerate() {
            let lease = self.checkpoint(job_id, owner).await?;
            if lease.map(|l| l.cancel_requested).unwrap_or(false) {
                return self.finish_cancelled(job, owner, &items).await;
            }

            self.ctx.progress.begin_item(job_id, subject_id).await;
            match self.analyze_item(job, owner, subject_id, &mut reserved).await? {
                Some(outcome) => {
                    let message = match &outcome.result {
                        Ok(_) => format!("Analyzed {} of {total}", index + 1),
                        Err(e) => format!("Item {subject_id} failed: {e}"),
                    };
                    items.push(outcome);
                    self.ctx.progress.advance(job_id, subject_id, message).await;
                }
                None => {
                    // Circuit open: the rest of this attempt would be denied too.
                    warn!(remaining = total - index, "Analyzer circuit open, stopping attempt");
                    for remaining in &job.subject_ids[index..] {
                        items.push(ItemOutcome {
                            subject_id: remaining.clone(),
                            result: Err(AnalyzeError::Transient("analyzer circuit open".into())),
                        });
                    }
                    break;
                }
            }
        }

        self.finalize(job, owner, items).await
    }

    /// Renews the lease. Store outages are tolerated (the lease may still be
    /// valid), losing ownership is not.
    async fn renew(&self, job_id: JobId, owner: &str) -> Result<Option<Lease>, Interrupt> {
        match self.ctx.store.renew_lease(job_id, owner).await {
            Ok(lease) => Ok(Some(lease)),
            Err(StoreError::NotOwner { .. }) | Err(StoreError::NotFound(_)) => Err(Interrupt::LeaseLost),
            Err(err) => {
                warn!(error = %err, "Could not renew lease");
                Ok(None)
            }
        }
    }

    async fn checkpoint(&self, job_id: JobId, owner: &str) -> Result<Option<Lease>, Interrupt> {
        if self.cancel_token.is_cancelled() {
            return Err(Interrupt::Shutdown);
        }
        self.renew(job_id, owner).await
    }

    /// Runs `fut` while renewing the lease in the background. Shutdown
    /// drops `fut`.
    async fn leased<F: Future>(&self, job_id: JobId, owner: &str, fut: F) -> Result<F::Output, Interrupt> {
        tokio::select! {
            out = self.renewing(job_id, owner, fut) => out,
            _ = self.cancel_token.cancelled() => Err(Interrupt::Shutdown),
        }
    }

    /// Runs `fut` to the end while renewing the lease, unless the lease is lost.
    async fn renewing<F: Future>(&self, job_id: JobId, owner: &str, fut: F) -> Result<F::Output, Interrupt> {
        tokio::pin!(fut);
        let mut renew = interval_at(Instant::now() + self.ctx.renew_every, self.ctx.renew_every);
        loop {
            tokio::select! {
                out = &mut fut => return Ok(out),
                _ = renew.tick() => {
                    self.renew(job_id, owner).await?;
                },
            }
        }
    }

    /// Waits out throttling and a half-open trial held by another job.
    /// Returns the denial while the circuit is open.
    async fn acquire(&self, job_id: JobId, owner: &str) -> Result<Result<Permit, Denied>, Interrupt> {
        loop {
            match self.ctx.limiter.acquire() {
                Ok(permit) => return Ok(Ok(permit)),
                Err(denied) if denied.is_throttle() || denied == Denied::TrialInFlight => {
                    let wait = denied
                        .retry_in()
                        .unwrap_or(Duration::from_millis(100))
                        .max(Duration::from_millis(10));
                    trace!(wait = ?wait, "Waiting for analyzer budget");
                    self.leased(job_id, owner, sleep(wait)).await?;
                }
                Err(denied) => return Ok(Err(denied)),
            }
        }
    }

    /// `None` when the limiter refuses calls because the endpoint is failing.
    async fn analyze_item(
        &self,
        job: &AnalysisJob,
        owner: &str,
        subject_id: &str,
        reserved: &mut Option<Permit>,
    ) -> Result<Option<ItemOutcome>, Interrupt> {
        let outcome = |result: Result<AnalysisResult, AnalyzeError>| {
            Ok::<_, Interrupt>(Some(ItemOutcome {
                subject_id: subject_id.to_string(),
                result,
            }))
        };

        let subject = match self.ctx.subjects.resolve(job.subject_type, subject_id).await {
            Ok(subject) => subject,
            Err(err) => return outcome(Err(err)),
        };

        let permit = match reserved.take() {
            Some(permit) => permit,
            None => match self.acquire(job.job_id, owner).await? {
                Ok(permit) => permit,
                Err(denied) => {
                    debug!(denied = ?denied, "Analyzer call denied");
                    return Ok(None);
                }
            },
        };

        let result = self
            .leased(job.job_id, owner, self.ctx.analyzer.analyze(&subject))
            .await?;

        match &result {
            Ok(_) | Err(AnalyzeError::Validation(_)) => permit.success(),
            Err(AnalyzeError::RateLimited { retry_after }) => {
                permit.failure(FailureKind::RateLimited, *retry_after)
            }
            Err(_) => permit.failure(FailureKind::Transient, None),
        }
        if let Err(err) = &result {
            warn!(subject_id, error = %err, "Subject analysis failed");
        }
        outcome(result)
    }

    async fn save_results(&self, items: &[ItemOutcome]) -> Result<usize, String> {
        let mut saved = 0;
        for item in items {
            if let Ok(result) = &item.result {
                self.ctx
                    .writer
                    .save(&item.subject_id, result)
                    .await
                    .map_err(|e| format!("saving result for {}: {e}", item.subject_id))?;
                saved += 1;
            }
        }
        Ok(saved)
    }

    async fn finish_cancelled(
        &self,
        job: &AnalysisJob,
        owner: &str,
        items: &[ItemOutcome],
    ) -> Result<JobOutcome, Interrupt> {
        let job_id = job.job_id;
        info!(analyzed = items.len(), "Cancellation observed");

        if let Err(err) = self.renewing(job_id, owner, self.save_results(items)).await? {
            warn!(error = %err, "Could not keep partial results of cancelled job");
        }

        match self.ctx.store.acknowledge_cancel(job_id, owner).await {
            Ok(()) => {
                self.ctx
                    .progress
                    .finish(
                        job_id,
                        JobStatus::Cancelled,
                        format!("Cancelled after {} of {} subjects", items.len(), job.subject_ids.len()),
                    )
                    .await;
                Ok(JobOutcome::Cancelled)
            }
            Err(err) => {
                error!(error = %err, "Could not mark job cancelled");
                Ok(JobOutcome::Abandoned)
            }
        }
    }

    async fn finalize(
        &self,
        job: &AnalysisJob,
        owner: &str,
        items: Vec<ItemOutcome>,
    ) -> Result<JobOutcome, Interrupt> {
        let job_id = job.job_id;
        match decide(job, &items) {
            Decision::Complete => {
                // Nothing becomes visible unless we still hold the job.
                self.renew(job_id, owner).await?;

                let saved = match self.renewing(job_id, owner, self.save_results(&items)).await? {
                    Ok(saved) => saved,
                    Err(message) => {
                        error!(error = %message, "Result writer failed");
                        let failure = JobFailure::fatal(ErrorKind::ResultWrite, message);
                        return Ok(self.fail(job_id, owner, failure).await);
                    }
                };
                self.renew(job_id, owner).await?;

                if let Err(err) = self.ctx.store.complete(job_id, owner).await {
                    error!(error = %err, "Could not mark job completed");
                    return Ok(JobOutcome::Abandoned);
                }

                let failed = items.len() - saved;
                info!(succeeded = saved, failed, "Job completed");
                self.ctx
                    .progress
                    .finish(
                        job_id,
                        JobStatus::Completed,
                        format!("Analyzed {saved} of {} subjects", items.len()),
                    )
                    .await;
                Ok(JobOutcome::Completed {
                    succeeded: saved,
                    failed,
                })
            }
            Decision::Retry(failure) | Decision::Fatal(failure) => {
                Ok(self.fail(job_id, owner, failure).await)
            }
        }
    }

    async fn fail(&self, job_id: JobId, owner: &str, failure: JobFailure) -> JobOutcome {
        let message = failure.message.clone();
        match self.ctx.store.fail(job_id, owner, failure).await {
            Ok(JobStatus::Queued) => {
                info!(error = %message, "Job will be retried");
                self.ctx
                    .progress
                    .set_message(job_id, format!("Retrying after error: {message}"))
                    .await;
                JobOutcome::Requeued
            }
            Ok(JobStatus::Cancelled) => {
                info!(error = %message, "Attempt failed after a cancel request, job cancelled");
                self.ctx
                    .progress
                    .finish(job_id, JobStatus::Cancelled, "Cancelled")
                    .await;
                JobOutcome::Cancelled
            }
            Ok(_) => {
                warn!(error = %message, "Job failed");
                self.ctx
                    .progress
                    .finish(job_id, JobStatus::Failed, format!("Failed: {message}"))
                    .await;
                JobOutcome::Failed
            }
            Err(err) => {
                error!(error = %err, "Could not record job failure");
                JobOutcome::Abandoned
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobRequest, Priority};

    fn job(attempt_count: i32, max_attempts: i32) -> AnalysisJob {
        let mut job = AnalysisJob::from_request(
            JobRequest::playlist(["a", "b", "c"], Priority::Medium),
            max_attempts as u32,
        );
        job.attempt_count = attempt_count;
        job
    }

    fn ok(id: &str) -> ItemOutcome {
        ItemOutcome {
            subject_id: id.into(),
            result: Ok(AnalysisResult {
                score: 90.0,
                verdict: "freely_listen".into(),
                themes: vec![],
                concerns: vec![],
                scripture_refs: vec![],
            }),
        }
    }

    fn err(id: &str, e: AnalyzeError) -> ItemOutcome {
        ItemOutcome {
            subject_id: id.into(),
            result: Err(e),
        }
    }

    #[test]
    fn validation_failures_do_not_sink_the_batch() {
        let items = vec![ok("a"), err("b", AnalyzeError::Validation("empty lyrics".into())), ok("c")];
        assert!(matches!(decide(&job(0, 3), &items), Decision::Complete));
    }

    #[test]
    fn all_validation_failures_are_fatal() {
        let items = vec![err("a", AnalyzeError::Validation("bad".into()))];
        match decide(&job(0, 3), &items) {
            Decision::Fatal(failure) => {
                assert_eq!(failure.kind, ErrorKind::Validation);
                assert!(!failure.retryable);
                assert!(failure.message.starts_with("a:"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn transient_failures_retry_while_attempts_remain() {
        let items = vec![ok("a"), err("b", AnalyzeError::Timeout), ok("c")];
        match decide(&job(1, 3), &items) {
            Decision::Retry(failure) => {
                assert_eq!(failure.kind, ErrorKind::Timeout);
                assert!(failure.retryable);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn last_attempt_keeps_partial_results() {
        let items = vec![ok("a"), err("b", AnalyzeError::Timeout), ok("c")];
        assert!(matches!(decide(&job(2, 3), &items), Decision::Complete));
    }

    #[test]
    fn last_attempt_without_successes_still_reports_retryable() {
        let items = vec![err("a", AnalyzeError::Transient("502".into()))];
        assert!(matches!(decide(&job(2, 3), &items), Decision::Retry(_)));
    }

    #[test]
    fn rate_limit_hint_is_carried_to_the_store() {
        let items = vec![
            err("a", AnalyzeError::Transient("502".into())),
            err("b", AnalyzeError::RateLimited { retry_after: Some(Duration::from_secs(9)) }),
        ];
        match decide(&job(0, 3), &items) {
            Decision::Retry(failure) => {
                assert_eq!(failure.kind, ErrorKind::RateLimited);
                assert_eq!(failure.retry_after, Some(Duration::from_secs(9)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
