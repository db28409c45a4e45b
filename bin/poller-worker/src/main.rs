//! Metric poller worker process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Json, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use poller_availability::AvailabilityFsm;
use poller_cache::{ChannelRtc, InMemoryAvailabilityBus, InMemoryConfigCache, InMemoryPreprocessor, RtcCommand};
use poller_common::PollerType;
use poller_config::PollerConfig;
use poller_dispatch::{CheckDispatcher, DriverRegistry};
use poller_http::HttpAsyncEngine;
use poller_loop::{CycleStats, HttpExecutor, PollerLoop, SyncExecutor};
use poller_macro::StaticMacroExpander;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    cycles: Vec<PollerSnapshot>,
}

#[derive(Serialize)]
struct PollerSnapshot {
    poller_type: String,
    last_cycle: Option<CycleStatsDto>,
}

#[derive(Serialize)]
struct CycleStatsDto {
    fetched: usize,
    activated: usize,
    deactivated: usize,
    submissions: usize,
    requeues: usize,
}

impl From<CycleStats> for CycleStatsDto {
    fn from(stats: CycleStats) -> Self {
        Self {
            fetched: stats.fetched,
            activated: stats.activated,
            deactivated: stats.deactivated,
            submissions: stats.submissions,
            requeues: stats.requeues,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    poller_common::logging::init_logging("poller-worker");
    info!("Starting metric poller worker");

    let config = PollerConfig::load()?;
    info!(?config, "Poller configuration loaded");

    PrometheusBuilder::new().install()?;

    let cache: Arc<InMemoryConfigCache> = Arc::new(InMemoryConfigCache::new(Vec::new()));
    let expander = Arc::new(StaticMacroExpander::new());
    let preprocessor = Arc::new(InMemoryPreprocessor::new());
    let bus = Arc::new(InMemoryAvailabilityBus::new());
    let fsm = AvailabilityFsm::from_config(&config.availability);

    let fetch_timeout = Duration::from_millis(config.cache.fetch_timeout_ms);

    let (normal_rtc, normal_shutdown_tx) = ChannelRtc::new();
    let normal_dispatcher = CheckDispatcher::new(DriverRegistry::default());
    let mut normal_loop = PollerLoop::new(
        PollerType::Normal,
        config.poller.poller_delay_secs,
        fetch_timeout,
        cache.clone(),
        expander.clone(),
        preprocessor.clone(),
        bus.clone(),
        Arc::new(normal_rtc),
        fsm,
        Box::new(SyncExecutor::new(normal_dispatcher)),
    );
    let normal_stats = normal_loop.stats_handle();

    let (http_rtc, http_shutdown_tx) = ChannelRtc::new();
    let http_engine = HttpAsyncEngine::new(&config.http)?;
    let mut http_loop = PollerLoop::new(
        PollerType::HttpAgent,
        config.poller.poller_delay_secs,
        fetch_timeout,
        cache.clone(),
        expander.clone(),
        preprocessor.clone(),
        bus.clone(),
        Arc::new(http_rtc),
        fsm,
        Box::new(HttpExecutor::new(http_engine)),
    );
    let http_stats = http_loop.stats_handle();

    tokio::spawn(async move { normal_loop.run().await });
    let http_tick_interval = Duration::from_millis(config.http.tick_interval_ms);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(http_tick_interval);
        loop {
            interval.tick().await;
            http_loop.run_http_tick().await;
        }
    });

    let app = Router::new()
        .route(
            "/health",
            get(move || {
                let normal_stats = normal_stats.clone();
                let http_stats = http_stats.clone();
                async move {
                    Json(HealthResponse {
                        status: "UP".to_string(),
                        cycles: vec![
                            PollerSnapshot {
                                poller_type: "normal".to_string(),
                                last_cycle: normal_stats.read().clone().map(CycleStatsDto::from),
                            },
                            PollerSnapshot {
                                poller_type: "http".to_string(),
                                last_cycle: http_stats.read().clone().map(CycleStatsDto::from),
                            },
                        ],
                    })
                }
            }),
        )
        .route("/health/live", get(|| async { Json(serde_json::json!({"status": "UP"})) }))
        .route("/health/ready", get(|| async { Json(serde_json::json!({"status": "UP"})) }));

    let addr = SocketAddr::from(([0, 0, 0, 0], 8090));
    info!(?addr, "HTTP health server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(normal_shutdown_tx, http_shutdown_tx))
        .await?;

    info!("Poller worker stopped");
    Ok(())
}

async fn shutdown_signal(normal_tx: mpsc::Sender<RtcCommand>, http_tx: mpsc::Sender<RtcCommand>) {
    tokio::signal::ctrl_c().await.expect("failed to install CTRL+C handler");
    info!("Shutdown signal received");
    let _ = normal_tx.send(RtcCommand::Shutdown).await;
    let _ = http_tx.send(RtcCommand::Shutdown).await;
}
