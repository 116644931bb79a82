//! Call budget for the analysis endpoint.
//!
//! A token bucket bounds the request rate and a circuit breaker stops calls
//! while the endpoint keeps failing. Both live behind one lock so a grant is
//! a single atomic decision.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Burst capacity.
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
    /// Consecutive transient failures that open the circuit. Rate-limit
    /// responses count half.
    pub failure_threshold: u32,
    pub base_cooldown: Duration,
    pub max_cooldown: Duration,
    /// Pause applied after a 429 without a usable `Retry-After`.
    pub default_rate_limit_pause: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        RateLimiterConfig {
            capacity: 5,
            refill_per_sec: 1.0,
            failure_threshold: 5,
            base_cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(600),
            default_rate_limit_pause: Duration::from_secs(30),
        }
    }
}

impl RateLimiterConfig {
    pub fn with_rps(rps: f64, capacity: u32) -> Result<Self, String> {
        if !rps.is_finite() || rps <= 0.0 {
            return Err(format!("rate limit must be a positive finite number, got {rps}"));
        }
        Ok(RateLimiterConfig {
            capacity: capacity.max(1),
            refill_per_sec: rps,
            ..Default::default()
        })
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64, now: Instant) -> Self {
        TokenBucket {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_per_sec,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Returns a token taken by `try_acquire` that was never spent.
    fn refund(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }

    pub fn time_until_available(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    RateLimited,
}

impl FailureKind {
    fn weight(self) -> u32 {
        match self {
            FailureKind::Transient => 2,
            FailureKind::RateLimited => 1,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_score: u32,
    open_score: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    base_cooldown: Duration,
    max_cooldown: Duration,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, base_cooldown: Duration, max_cooldown: Duration) -> Self {
        CircuitBreaker {
            state: CircuitState::Closed,
            failure_score: 0,
            open_score: failure_threshold.max(1) * FailureKind::Transient.weight(),
            opened_at: None,
            cooldown: base_cooldown,
            base_cooldown,
            max_cooldown: max_cooldown.max(base_cooldown),
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn cooldown_remaining(&self, now: Instant) -> Duration {
        self.opened_at
            .map(|at| self.cooldown.saturating_sub(now.saturating_duration_since(at)))
            .unwrap_or(Duration::ZERO)
    }

    /// Whether a call would be let through right now, without committing.
    fn would_pass(&self, now: Instant) -> Result<(), Denied> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if !self.trial_in_flight => Ok(()),
            CircuitState::HalfOpen => Err(Denied::TrialInFlight),
            CircuitState::Open => {
                let retry_in = self.cooldown_remaining(now);
                if retry_in.is_zero() {
                    Ok(())
                } else {
                    Err(Denied::CircuitOpen { retry_in })
                }
            }
        }
    }

    /// Commits a pass decided by `would_pass`.
    fn pass(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => false,
            CircuitState::Open | CircuitState::HalfOpen => {
                if self.state == CircuitState::Open {
                    info!("Circuit breaker half-open, allowing one trial call");
                }
                self.state = CircuitState::HalfOpen;
                self.trial_in_flight = true;
                true
            }
        }
    }

    fn release_trial(&mut self) {
        self.trial_in_flight = false;
    }

    fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => self.failure_score = 0,
            CircuitState::HalfOpen => {
                info!("Circuit breaker closed after successful trial");
                self.state = CircuitState::Closed;
                self.failure_score = 0;
                self.opened_at = None;
                self.cooldown = self.base_cooldown;
                self.trial_in_flight = false;
            }
            // A call granted before the circuit opened; its result is stale.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&mut self, kind: FailureKind, now: Instant) {
        match self.state {
            CircuitState::Closed => {
                self.failure_score += kind.weight();
                if self.failure_score >= self.open_score {
                    warn!(
                        cooldown = ?self.cooldown,
                        "Circuit breaker opened after consecutive failures"
                    );
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                self.cooldown = (self.cooldown * 2).min(self.max_cooldown);
                warn!(cooldown = ?self.cooldown, "Circuit breaker trial failed, reopening");
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
                self.trial_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denied {
    /// The bucket is empty.
    Exhausted { retry_in: Duration },
    /// The endpoint asked us to back off.
    Paused { retry_in: Duration },
    CircuitOpen { retry_in: Duration },
    /// Half-open and the single trial call has not reported back.
    TrialInFlight,
}

impl Denied {
    /// Denials that clear on their own shortly, as opposed to the endpoint
    /// being unhealthy.
    pub fn is_throttle(&self) -> bool {
        matches!(self, Denied::Exhausted { .. } | Denied::Paused { .. })
    }

    pub fn retry_in(&self) -> Option<Duration> {
        match self {
            Denied::Exhausted { retry_in }
            | Denied::Paused { retry_in }
            | Denied::CircuitOpen { retry_in } => Some(*retry_in),
            Denied::TrialInFlight => None,
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    bucket: TokenBucket,
    breaker: CircuitBreaker,
    paused_until: Option<Instant>,
}

impl LimiterState {
    fn check(&mut self, now: Instant) -> Result<(), Denied> {
        if let Some(until) = self.paused_until {
            if until > now {
                return Err(Denied::Paused {
                    retry_in: until - now,
                });
            }
            self.paused_until = None;
        }
        self.breaker.would_pass(now)?;
        let retry_in = self.bucket.time_until_available(now);
        if retry_in.is_zero() {
            Ok(())
        } else {
            Err(Denied::Exhausted { retry_in })
        }
    }
}

/// Token bucket plus circuit breaker for one endpoint.
#[derive(Debug)]
pub struct RateLimiter {
    endpoint: String,
    state: Mutex<LimiterState>,
    default_rate_limit_pause: Duration,
}

impl RateLimiter {
    pub fn new(endpoint: impl Into<String>, config: RateLimiterConfig) -> Self {
        let now = Instant::now();
        RateLimiter {
            endpoint: endpoint.into(),
            state: Mutex::new(LimiterState {
                bucket: TokenBucket::new(config.capacity, config.refill_per_sec, now),
                breaker: CircuitBreaker::new(
                    config.failure_threshold,
                    config.base_cooldown,
                    config.max_cooldown,
                ),
                paused_until: None,
            }),
            default_rate_limit_pause: config.default_rate_limit_pause,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Takes a token and, when half-open, the trial slot. The permit can be
    /// handed to another task together with the job it was taken for.
    pub fn acquire(self: &Arc<Self>) -> Result<Permit, Denied> {
        self.acquire_at(Instant::now())
    }

    pub(crate) fn acquire_at(self: &Arc<Self>, now: Instant) -> Result<Permit, Denied> {
        let mut state = self.state.lock();
        state.check(now)?;
        state.bucket.try_acquire(now);
        let trial = state.breaker.pass();
        Ok(Permit {
            limiter: Arc::clone(self),
            trial,
            settled: false,
        })
    }

    /// How long until `acquire` may succeed. `None` while a half-open trial
    /// is outstanding, since that depends on the trial's result.
    pub fn time_until_available(&self) -> Option<Duration> {
        match self.state.lock().check(Instant::now()) {
            Ok(()) => Some(Duration::ZERO),
            Err(denied) => denied.retry_in(),
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.state.lock().breaker.state()
    }

    fn settle(&self, trial: bool, outcome: Option<(FailureKind, Option<Duration>)>, now: Instant) {
        let mut state = self.state.lock();
        match outcome {
            None => state.breaker.record_success(),
            Some((kind, retry_after)) => {
                if kind == FailureKind::RateLimited {
                    let pause = retry_after.unwrap_or(self.default_rate_limit_pause);
                    let until = now + pause;
                    if state.paused_until.map(|p| p < until).unwrap_or(true) {
                        warn!(endpoint = %self.endpoint, pause = ?pause, "Endpoint rate limited, pausing calls");
                        state.paused_until = Some(until);
                    }
                }
                state.breaker.record_failure(kind, now);
            }
        }
        if trial {
            state.breaker.release_trial();
        }
    }
}

/// A granted call. Report how it went with [`Permit::success`] or
/// [`Permit::failure`]. Dropping it unreported hands the token back and frees
/// a half-open trial, without counting for or against the endpoint.
#[must_use]
pub struct Permit {
    limiter: Arc<RateLimiter>,
    trial: bool,
    settled: bool,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("endpoint", &self.limiter.endpoint)
            .field("trial", &self.trial)
            .finish()
    }
}

impl Permit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.limiter.settle(self.trial, None, Instant::now());
    }

    pub fn failure(self, kind: FailureKind, retry_after: Option<Duration>) {
        self.failure_at(kind, retry_after, Instant::now())
    }

    pub(crate) fn failure_at(mut self, kind: FailureKind, retry_after: Option<Duration>, now: Instant) {
        self.settled = true;
        self.limiter.settle(self.trial, Some((kind, retry_after)), now);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.limiter.state.lock();
        state.bucket.refund();
        if self.trial {
            state.breaker.release_trial();
        }
    }
}

/// Limiters keyed by endpoint identity, sharing one default configuration.
#[derive(Debug, Clone, Default)]
pub struct RateLimiterRegistry {
    limiters: Arc<Mutex<HashMap<String, Arc<RateLimiter>>>>,
    default_config: RateLimiterConfig,
}

impl RateLimiterRegistry {
    pub fn new(default_config: RateLimiterConfig) -> Self {
        RateLimiterRegistry {
            limiters: Arc::default(),
            default_config,
        }
    }

    pub fn get(&self, endpoint: &str) -> Arc<RateLimiter> {
        self.limiters
            .lock()
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::new(endpoint, self.default_config.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: u32, threshold: u32) -> RateLimiterConfig {
        RateLimiterConfig {
            capacity,
            refill_per_sec: 1.0,
            failure_threshold: threshold,
            base_cooldown: Duration::from_secs(10),
            max_cooldown: Duration::from_secs(25),
            default_rate_limit_pause: Duration::from_secs(5),
        }
    }

    #[test]
    fn bucket_grants_burst_then_refills() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2, 4.0, start);
        assert!(bucket.try_acquire(start));
        assert!(bucket.try_acquire(start));
        assert!(!bucket.try_acquire(start));
        assert_eq!(bucket.time_until_available(start), Duration::from_millis(250));
        assert!(bucket.try_acquire(start + Duration::from_millis(260)));
    }

    #[test]
    fn with_rps_rejects_nonsense() {
        assert!(RateLimiterConfig::with_rps(0.0, 1).is_err());
        assert!(RateLimiterConfig::with_rps(f64::NAN, 1).is_err());
        assert_eq!(RateLimiterConfig::with_rps(2.5, 0).unwrap().capacity, 1);
    }

    #[test]
    fn opens_after_threshold_then_allows_one_trial() {
        let limiter = Arc::new(RateLimiter::new("test", config(100, 3)));
        let start = Instant::now();

        for _ in 0..3 {
            let permit = limiter.acquire_at(start).unwrap();
            permit.failure_at(FailureKind::Transient, None, start);
        }
        assert_eq!(limiter.circuit_state(), CircuitState::Open);

        let denied = limiter.acquire_at(start + Duration::from_secs(5)).err();
        assert!(matches!(denied, Some(Denied::CircuitOpen { .. })));

        let after_cooldown = start + Duration::from_secs(10);
        let trial = limiter.acquire_at(after_cooldown).unwrap();
        assert!(trial.is_trial());
        assert_eq!(limiter.circuit_state(), CircuitState::HalfOpen);
        assert_eq!(
            limiter.acquire_at(after_cooldown).err(),
            Some(Denied::TrialInFlight)
        );

        trial.success();
        assert_eq!(limiter.circuit_state(), CircuitState::Closed);
        assert!(limiter.acquire_at(after_cooldown).is_ok());
    }

    #[test]
    fn failed_trial_doubles_cooldown_up_to_cap() {
        let limiter = Arc::new(RateLimiter::new("test", config(100, 1)));
        let mut now = Instant::now();
        limiter
            .acquire_at(now)
            .unwrap()
            .failure_at(FailureKind::Transient, None, now);

        let mut cooldowns = vec![];
        for _ in 0..3 {
            let cooldown = limiter.state.lock().breaker.cooldown();
            cooldowns.push(cooldown);
            now += cooldown;
            let trial = limiter.acquire_at(now).unwrap();
            assert!(trial.is_trial());
            trial.failure_at(FailureKind::Transient, None, now);
            assert_eq!(limiter.circuit_state(), CircuitState::Open);
        }
        assert_eq!(
            cooldowns,
            vec![
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(25)
            ]
        );
    }

    #[test]
    fn rate_limits_open_the_circuit_less_eagerly() {
        let mut cfg = config(100, 2);
        cfg.default_rate_limit_pause = Duration::ZERO;
        let limiter = Arc::new(RateLimiter::new("test", cfg));
        let now = Instant::now();

        for _ in 0..3 {
            limiter
                .acquire_at(now)
                .unwrap()
                .failure_at(FailureKind::RateLimited, Some(Duration::ZERO), now);
        }
        assert_eq!(limiter.circuit_state(), CircuitState::Closed);

        limiter
            .acquire_at(now)
            .unwrap()
            .failure_at(FailureKind::RateLimited, Some(Duration::ZERO), now);
        assert_eq!(limiter.circuit_state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let limiter = Arc::new(RateLimiter::new("test", config(100, 2)));
        let now = Instant::now();
        limiter
            .acquire_at(now)
            .unwrap()
            .failure_at(FailureKind::Transient, None, now);
        limiter.acquire_at(now).unwrap().success();
        limiter
            .acquire_at(now)
            .unwrap()
            .failure_at(FailureKind::Transient, None, now);
        assert_eq!(limiter.circuit_state(), CircuitState::Closed);
    }

    #[test]
    fn retry_after_pauses_all_calls() {
        let limiter = Arc::new(RateLimiter::new("test", config(100, 10)));
        let now = Instant::now();
        limiter
            .acquire_at(now)
            .unwrap()
            .failure_at(FailureKind::RateLimited, Some(Duration::from_secs(3)), now);

        match limiter.acquire_at(now + Duration::from_secs(1)) {
            Err(Denied::Paused { retry_in }) => assert_eq!(retry_in, Duration::from_secs(2)),
            other => panic!("expected pause, got {:?}", other.map(|_| ())),
        }
        assert!(limiter.acquire_at(now + Duration::from_secs(3)).is_ok());
    }

    #[test]
    fn dropped_trial_permit_frees_the_trial() {
        let limiter = Arc::new(RateLimiter::new("test", config(100, 1)));
        let now = Instant::now();
        limiter
            .acquire_at(now)
            .unwrap()
            .failure_at(FailureKind::Transient, None, now);

        let later = now + Duration::from_secs(10);
        let trial = limiter.acquire_at(later).unwrap();
        drop(trial);
        assert_eq!(limiter.circuit_state(), CircuitState::HalfOpen);
        assert!(limiter.acquire_at(later).unwrap().is_trial());
    }

    #[test]
    fn exhausted_bucket_denies_with_wait() {
        let limiter = Arc::new(RateLimiter::new("test", config(1, 5)));
        let now = Instant::now();
        limiter.acquire_at(now).unwrap().success();
        match limiter.acquire_at(now) {
            Err(denied @ Denied::Exhausted { .. }) => assert!(denied.is_throttle()),
            other => panic!("expected exhausted, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn unreported_permit_hands_its_token_back() {
        let limiter = Arc::new(RateLimiter::new("test", config(1, 5)));
        let now = Instant::now();
        let permit = limiter.acquire_at(now).unwrap();
        assert!(matches!(limiter.acquire_at(now), Err(Denied::Exhausted { .. })));
        drop(permit);
        limiter.acquire_at(now).unwrap().success();
        assert!(matches!(limiter.acquire_at(now), Err(Denied::Exhausted { .. })));
    }

    #[test]
    fn registry_shares_limiters_per_endpoint() {
        let registry = RateLimiterRegistry::new(config(3, 5));
        let a = registry.get("http://a");
        let again = registry.get("http://a");
        let b = registry.get("http://b");
        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(b.endpoint(), "http://b");
    }
}
