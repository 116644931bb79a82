use crate::limiter::RateLimiterConfig;
use crate::progress::Retention;
use crate::server::{default_instance, ServerSettings};
use crate::store::{Backoff, StoreSettings, MAX_ATTEMPTS_LIMIT};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about = "Background song and playlist analysis queue")]
pub struct Config {
    #[arg(
        short = 'c',
        long = "connect_url",
        env = "ANALYSISQ_CONNECT_URL",
        help = "PostgreSQL Connection URL; jobs are kept in memory when unset"
    )]
    pub connect_url: Option<String>,

    #[arg(
        short = 'l',
        long,
        env = "ANALYSISQ_LISTEN",
        help = "Address of the HTTP API",
        default_value = "127.0.0.1:8080"
    )]
    pub listen: SocketAddr,

    #[arg(
        short = 'n',
        long = "number_active",
        env = "ANALYSISQ_WORKERS",
        help = "Number of Active Jobs in Parallel",
        default_value = "3",
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub workers: u16,

    #[arg(long, env = "ANALYSISQ_INSTANCE", help = "Lease owner prefix for this process")]
    pub instance: Option<String>,

    #[arg(
        long,
        env = "ANALYSISQ_ANALYZER_ENDPOINT",
        help = "URL of the analysis endpoint",
        default_value = "http://127.0.0.1:9000/analyze"
    )]
    pub analyzer_endpoint: String,

    #[arg(long, env = "ANALYSISQ_ANALYZER_TIMEOUT_SECS", default_value = "30")]
    pub analyzer_timeout_secs: u64,

    #[arg(
        long,
        env = "ANALYSISQ_LEASE_SECS",
        default_value = "60",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub lease_secs: u64,

    #[arg(
        long,
        env = "ANALYSISQ_MAX_ATTEMPTS",
        default_value = "3",
        value_parser = clap::value_parser!(u32).range(1..=MAX_ATTEMPTS_LIMIT as i64)
    )]
    pub max_attempts: u32,

    #[arg(long, env = "ANALYSISQ_BACKOFF_BASE_MS", default_value = "1000")]
    pub backoff_base_ms: u64,

    #[arg(long, env = "ANALYSISQ_BACKOFF_MAX_MS", default_value = "60000")]
    pub backoff_max_ms: u64,

    #[arg(
        long,
        env = "ANALYSISQ_REAPER_INTERVAL_SECS",
        default_value = "5",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub reaper_interval_secs: u64,

    #[arg(
        long,
        env = "ANALYSISQ_POLL_INTERVAL_MS",
        default_value = "500",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub poll_interval_ms: u64,

    #[arg(
        long,
        env = "ANALYSISQ_RATE_LIMIT_RPS",
        help = "Analyzer calls per second",
        default_value = "1.0"
    )]
    pub rate_limit_rps: f64,

    #[arg(long, env = "ANALYSISQ_RATE_LIMIT_BURST", default_value = "5")]
    pub rate_limit_burst: u32,

    #[arg(
        long,
        env = "ANALYSISQ_BREAKER_THRESHOLD",
        help = "Consecutive transient failures that open the circuit",
        default_value = "5"
    )]
    pub breaker_threshold: u32,

    #[arg(long, env = "ANALYSISQ_BREAKER_COOLDOWN_SECS", default_value = "30")]
    pub breaker_cooldown_secs: u64,

    #[arg(long, env = "ANALYSISQ_BREAKER_MAX_COOLDOWN_SECS", default_value = "600")]
    pub breaker_max_cooldown_secs: u64,

    #[arg(
        long,
        env = "ANALYSISQ_RATE_LIMIT_PAUSE_SECS",
        help = "Pause after a 429 without Retry-After",
        default_value = "30"
    )]
    pub rate_limit_pause_secs: u64,

    #[arg(
        long,
        env = "ANALYSISQ_RETENTION_HOURS",
        help = "How long finished jobs stay visible",
        default_value = "24"
    )]
    pub retention_hours: u64,

    #[arg(long, env = "ANALYSISQ_JAEGER_ENDPOINT", help = "Jaeger collector URL")]
    pub jaeger_endpoint: Option<String>,
}

impl Config {
    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            lease_duration: Duration::from_secs(self.lease_secs),
            default_max_attempts: self.max_attempts,
            backoff: Backoff {
                base: Duration::from_millis(self.backoff_base_ms),
                max: Duration::from_millis(self.backoff_max_ms),
                jitter: true,
            },
        }
    }

    pub fn rate_limiter(&self) -> Result<RateLimiterConfig, String> {
        let mut config = RateLimiterConfig::with_rps(self.rate_limit_rps, self.rate_limit_burst)?;
        config.failure_threshold = self.breaker_threshold;
        config.base_cooldown = Duration::from_secs(self.breaker_cooldown_secs);
        config.max_cooldown = Duration::from_secs(self.breaker_max_cooldown_secs);
        config.default_rate_limit_pause = Duration::from_secs(self.rate_limit_pause_secs);
        Ok(config)
    }

    pub fn retention(&self) -> Retention {
        Retention {
            finished: Duration::from_secs(self.retention_hours * 60 * 60),
            cancelled: Duration::ZERO,
        }
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            workers: self.workers,
            instance: self.instance.clone().unwrap_or_else(default_instance),
            lease_duration: Duration::from_secs(self.lease_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            reaper_interval: Duration::from_secs(self.reaper_interval_secs),
        }
    }
}
