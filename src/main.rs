use anyhow::{anyhow, Error};
use clap::Parser;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, Instrument};

use analysisq::analyzer::{Analyzer, HttpAnalyzer, PassthroughSubjects};
use analysisq::api::{self, AppState};
use analysisq::config::Config;
use analysisq::db::{PgProgressStore, PgStore};
use analysisq::limiter::RateLimiterRegistry;
use analysisq::progress::{MemoryProgressStore, ProgressStore, ProgressTracker};
use analysisq::server::{self, Services};
use analysisq::store::{JobStore, MemoryStore};
use analysisq::telemetry;
use analysisq::writer::{LogResultWriter, PgResultWriter, ResultWriter};

#[instrument(skip_all)]
async fn setup(config: Config, cancel_token: CancellationToken) -> Result<(), Error> {
    let store_settings = config.store_settings();
    let (store, writer, progress_store): (
        Arc<dyn JobStore>,
        Arc<dyn ResultWriter>,
        Arc<dyn ProgressStore>,
    ) = match &config.connect_url {
        Some(connect_url) => {
            let store = PgStore::connect(connect_url, store_settings).await?;
            let writer: Arc<dyn ResultWriter> = Arc::new(PgResultWriter::new(store.pool().clone()));
            let progress_store: Arc<dyn ProgressStore> =
                Arc::new(PgProgressStore::new(store.pool().clone()));
            let store: Arc<dyn JobStore> = Arc::new(store);
            (store, writer, progress_store)
        }
        None => {
            info!("No connect_url given, keeping jobs in memory");
            let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new(store_settings));
            let writer: Arc<dyn ResultWriter> = Arc::new(LogResultWriter);
            let progress_store: Arc<dyn ProgressStore> = Arc::new(MemoryProgressStore::default());
            (store, writer, progress_store)
        }
    };

    let analyzer = HttpAnalyzer::new(
        config.analyzer_endpoint.clone(),
        Duration::from_secs(config.analyzer_timeout_secs),
    )?;
    let limiters = RateLimiterRegistry::new(config.rate_limiter().map_err(|e| anyhow!(e))?);
    let limiter = limiters.get(analyzer.endpoint());
    let progress = Arc::new(ProgressTracker::new(progress_store, config.retention()));
    let wake = Arc::new(Notify::new());

    let services = Services {
        store: store.clone(),
        analyzer: Arc::new(analyzer),
        subjects: Arc::new(PassthroughSubjects),
        writer,
        limiter,
        progress: progress.clone(),
        wake: wake.clone(),
    };

    let api_spawn = {
        let state = AppState {
            store,
            progress,
            wake,
        };
        let cancel_token = cancel_token.clone();
        let listen = config.listen;
        tokio::spawn(
            async move {
                if let Err(err) = api::listen(listen, state, cancel_token.clone()).await {
                    error!("Error serving API: {}", err);
                    cancel_token.cancel();
                }
            }
            .instrument(info_span!("api")),
        )
    };

    let server_result = server::serve(cancel_token.clone(), services, config.server_settings())
        .instrument(info_span!("server"))
        .await;
    if let Err(err) = &server_result {
        error!("Error running server: {}", err);
        cancel_token.cancel();
    }

    api_spawn.await?;
    server_result
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "analysisq=debug,tower_http=info");
    }

    let config = Config::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let signal_token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        signal_token.cancel();
    });

    let app = tokio::spawn(setup(config, token));
    app.await??;
    info!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
