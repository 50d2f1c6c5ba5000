mod auth;
mod bridge;
mod broadcast;
mod cv;
mod db;
mod extractor;
mod media;
mod node_conn;
mod proxy;
mod registry;
mod session;
mod storage;
mod streams;
mod transport;
mod web;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use unblink_protocol::RelayConfig;

use crate::broadcast::EventBroadcaster;
use crate::cv::CvEventBus;
use crate::db::Db;
use crate::node_conn::NodeTable;
use crate::registry::ServiceRegistry;
use crate::session::SessionManager;
use crate::storage::StorageManager;
use crate::streams::RealtimeStreamManager;
use crate::web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration from the environment
    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Configuration error: {e}");
            std::process::exit(1);
        }
    };
    // Validate configuration semantics
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    std::fs::create_dir_all(&config.app_dir)
        .with_context(|| format!("Failed to create {}", config.app_dir.display()))?;

    // Persistence and registries
    let db = Arc::new(Db::open(&config.db_path())?);
    let services = Arc::new(ServiceRegistry::new());
    let nodes = Arc::new(NodeTable::new());
    let broadcaster = Arc::new(EventBroadcaster::new());
    let bus = Arc::new(CvEventBus::new(
        Arc::clone(&db),
        Arc::clone(&services),
        Arc::clone(&broadcaster),
    ));
    let storage = Arc::new(StorageManager::new(&config.frames_dir(), Arc::clone(&db))?);
    let sessions = Arc::new(SessionManager::new(config.stun_urls.clone()));

    // Realtime streams react to announces and disconnects
    let (stream_events, stream_rx) = tokio::sync::mpsc::unbounded_channel();
    let stream_manager = RealtimeStreamManager::new(
        Arc::clone(&nodes),
        Arc::clone(&sessions),
        Arc::clone(&storage),
        Arc::clone(&bus),
        config.frame_interval_seconds,
        config.batch_size,
        config.auto_request_realtime_stream,
    );
    Arc::clone(&stream_manager).spawn(stream_rx);

    // Optional frame retention
    if config.frame_retention_seconds > 0 {
        storage.spawn_retention_sweeper(config.frame_retention_seconds);
        tracing::info!(
            retention_seconds = config.frame_retention_seconds,
            "Frame retention sweeper running"
        );
    } else {
        tracing::info!("Frame retention disabled (FRAME_RETENTION_SECONDS = 0)");
    }

    let relay_addr: SocketAddr = ([0, 0, 0, 0], config.relay_port).into();
    let api_addr: SocketAddr = ([0, 0, 0, 0], config.api_port).into();

    let state = Arc::new(AppState {
        config,
        db,
        services,
        nodes,
        sessions: Arc::clone(&sessions),
        bus,
        storage,
        broadcaster,
        streams: Arc::clone(&stream_manager),
        stream_events,
        started_at: std::time::Instant::now(),
    });

    let trace = || {
        TraceLayer::new_for_http()
            .make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "request",
                    method = %request.method(),
                    path = %request.uri().path(),
                    request_id = %request_id,
                )
            })
            .on_response(
                |response: &axum::http::Response<_>,
                 latency: std::time::Duration,
                 _span: &tracing::Span| {
                    tracing::event!(
                        Level::DEBUG,
                        status = %response.status().as_u16(),
                        duration_ms = %latency.as_millis(),
                        "completed"
                    );
                },
            )
    };

    let relay_app = web::build_relay_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(trace())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));
    let api_app = web::build_api_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(trace())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let relay_listener = TcpListener::bind(relay_addr)
        .await
        .with_context(|| format!("Failed to bind relay listener on {relay_addr}"))?;
    let api_listener = TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("Failed to bind API listener on {api_addr}"))?;

    tracing::info!("===========================================");
    tracing::info!("  Unblink Relay v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Nodes/workers on http://{relay_addr}");
    tracing::info!("  API on http://{api_addr}");
    tracing::info!("===========================================");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let relay_server = axum::serve(relay_listener, relay_app);
    let api_server = axum::serve(api_listener, api_app);

    tokio::select! {
        result = relay_server => {
            result.context("Relay listener failed")?;
        }
        result = api_server => {
            result.context("API listener failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }

    // Tear down live sessions and streams before exiting
    sessions.shutdown().await;
    stream_manager.shutdown().await;
    tracing::info!("Unblink relay shut down cleanly");

    Ok(())
}
