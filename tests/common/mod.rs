#![allow(dead_code)]

use analysisq::analyzer::{AnalysisResult, AnalyzeError, Analyzer, PassthroughSubjects, Subject};
use analysisq::limiter::{RateLimiter, RateLimiterConfig};
use analysisq::progress::ProgressTracker;
use analysisq::server::{ServerSettings, Services};
use analysisq::store::{Backoff, JobStore, MemoryStore, StoreSettings};
use analysisq::writer::MemoryResultWriter;
use analysisq::{AnalysisJob, JobId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub fn result(score: f64) -> AnalysisResult {
    AnalysisResult {
        score,
        verdict: "freely_listen".into(),
        themes: vec!["grace".into()],
        concerns: vec![],
        scripture_refs: vec!["Ephesians 2:8".into()],
    }
}

/// Answers from a per-subject script, then succeeds.
#[derive(Default)]
pub struct FakeAnalyzer {
    script: Mutex<HashMap<String, VecDeque<Result<AnalysisResult, AnalyzeError>>>>,
    always: Mutex<HashMap<String, AnalyzeError>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl FakeAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        FakeAnalyzer {
            delay,
            ..Self::default()
        }
    }

    pub fn then(self, subject_id: &str, outcome: Result<AnalysisResult, AnalyzeError>) -> Self {
        self.script
            .lock()
            .entry(subject_id.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn always_failing(self, subject_id: &str, err: AnalyzeError) -> Self {
        self.always.lock().insert(subject_id.to_string(), err);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for FakeAnalyzer {
    fn endpoint(&self) -> &str {
        "fake://analyzer"
    }

    async fn analyze(&self, subject: &Subject) -> Result<AnalysisResult, AnalyzeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = self.always.lock().get(&subject.id) {
            return Err(err.clone());
        }
        let scripted = self
            .script
            .lock()
            .get_mut(&subject.id)
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or_else(|| Ok(result(80.0)))
    }
}

pub fn fast_store(lease: Duration) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(StoreSettings {
        lease_duration: lease,
        default_max_attempts: 3,
        backoff: Backoff {
            base: Duration::from_millis(10),
            max: Duration::from_millis(50),
            jitter: false,
        },
    }))
}

pub fn open_limiter() -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(
        "fake://analyzer",
        RateLimiterConfig {
            capacity: 100,
            refill_per_sec: 1000.0,
            ..RateLimiterConfig::default()
        },
    ))
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub analyzer: Arc<FakeAnalyzer>,
    pub writer: Arc<MemoryResultWriter>,
    pub progress: Arc<ProgressTracker>,
    pub limiter: Arc<RateLimiter>,
    pub services: Services,
}

impl Harness {
    pub fn new(store: Arc<MemoryStore>, analyzer: FakeAnalyzer) -> Self {
        Self::with_writer(store, analyzer, MemoryResultWriter::new())
    }

    pub fn with_writer(store: Arc<MemoryStore>, analyzer: FakeAnalyzer, writer: MemoryResultWriter) -> Self {
        let analyzer = Arc::new(analyzer);
        let writer = Arc::new(writer);
        let progress = Arc::new(ProgressTracker::default());
        let limiter = open_limiter();
        let services = Services {
            store: store.clone(),
            analyzer: analyzer.clone(),
            subjects: Arc::new(PassthroughSubjects),
            writer: writer.clone(),
            limiter: limiter.clone(),
            progress: progress.clone(),
            wake: Arc::new(Notify::new()),
        };
        Harness {
            store,
            analyzer,
            writer,
            progress,
            limiter,
            services,
        }
    }

    /// Runs the pool against `limiter` instead of an unlimited one.
    pub fn limited_by(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.services.limiter = limiter.clone();
        self.limiter = limiter;
        self
    }

    pub fn settings(&self, workers: u16) -> ServerSettings {
        ServerSettings {
            workers,
            instance: "test".into(),
            lease_duration: self.store.settings().lease_duration,
            poll_interval: Duration::from_millis(20),
            reaper_interval: Duration::from_millis(50),
        }
    }
}

/// Polls until the job reaches a terminal status.
pub async fn wait_terminal(store: &dyn JobStore, job_id: JobId) -> AnalysisJob {
    wait_for(store, job_id, |job| job.status.is_terminal()).await
}

pub async fn wait_for(
    store: &dyn JobStore,
    job_id: JobId,
    done: impl Fn(&AnalysisJob) -> bool,
) -> AnalysisJob {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = store.get(job_id).await.unwrap().expect("job exists");
        if done(&job) {
            return job;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting on {job:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
