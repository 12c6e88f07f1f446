mod access;
mod config;
mod cors;
mod error;
mod metrics;
mod rooms;
mod ws;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header::CONTENT_TYPE, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use ws::SessionRegistry;

use crate::access::RoomAccessStore;
use crate::config::{ActivityConfig, ConnectionLimits, RelayConfig};
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode, RelayError,
};
use crate::metrics::{PresenceGauges, RelayMetrics};
use crate::rooms::RoomManager;

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
struct ObservabilityState {
    metrics: Arc<RelayMetrics>,
    rooms: Arc<RoomManager>,
    sessions: Arc<SessionRegistry>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_filter))
        .init();

    let relay_metrics = Arc::new(RelayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&relay_metrics));

    let access = config.room_access().context("invalid FLOWPRESENCE_RELAY_ROOM_ACL")?;
    let rooms = Arc::new(RoomManager::new());
    let sessions = Arc::new(SessionRegistry::default());

    spawn_idle_sweep(Arc::clone(&rooms), config.activity);

    let app = build_router(relay_metrics, rooms, sessions, access, config.limits, config.cors_origins.as_deref());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        room_acl = config.room_acl.is_some(),
        idle_after_secs = config.activity.idle_after.as_secs(),
        away_after_secs = config.activity.away_after.as_secs(),
        max_connections_per_user = config.limits.max_connections_per_user,
        message_rate_limit = config.limits.message_rate_limit,
        "starting presence relay"
    );

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.context("relay server exited unexpectedly")
}

fn build_router(
    relay_metrics: Arc<RelayMetrics>,
    rooms: Arc<RoomManager>,
    sessions: Arc<SessionRegistry>,
    access: RoomAccessStore,
    limits: ConnectionLimits,
    cors_origins: Option<&str>,
) -> Router {
    let observability = ObservabilityState {
        metrics: relay_metrics,
        rooms: Arc::clone(&rooms),
        sessions: Arc::clone(&sessions),
    };

    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_endpoint))
            .with_state(observability)
            .merge(ws::router(rooms, sessions, access, limits)),
    )
    .layer(cors::cors_layer(cors_origins))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

/// Demote members whose last activity is older than the configured
/// thresholds. Runs for the lifetime of the process.
fn spawn_idle_sweep(rooms: Arc<RoomManager>, activity: ActivityConfig) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(activity.check_interval);
        interval.reset();
        loop {
            interval.tick().await;
            let changes = rooms.sweep_idle(tokio::time::Instant::now(), activity).await;
            if changes > 0 {
                metrics::record_status_changes(changes);
                debug!(changes, "idle sweep updated member status");
            }
        }
    });
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn metrics_endpoint(State(state): State<ObservabilityState>) -> impl IntoResponse {
    let gauges = PresenceGauges {
        active_rooms: state.rooms.room_count().await,
        active_sessions: state.sessions.active_sessions().await,
    };
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], state.metrics.render_prometheus(gauges))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            RelayError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let status = response.status().as_u16();
    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics::record_http_request(method.as_str(), &path, status, latency_ms);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}
