mod admission;
mod auth;
mod config;
mod coordinator;
mod db;
mod error;
mod metrics;
mod replication;
mod rooms;
mod ws;

use std::net::SocketAddr;
use std::{sync::Arc, time::Instant};

use anyhow::Context;
use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::admission::AdmissionGateway;
use crate::auth::jwt::JwtAccessTokenService;
use crate::config::{GatewayConfig, LogFormat};
use crate::coordinator::Coordinator;
use crate::error::{attach_trace_id_header, trace_id_from_headers_or_generate, with_trace_id_scope};
use crate::metrics::{GatewayMetrics, RoomKind};
use crate::replication::ReplicationHost;
use crate::rooms::RoomHub;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env();
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set TANDEM_GATEWAY_JWT_SECRET in production");
    }

    let jwt_service =
        Arc::new(JwtAccessTokenService::new(&config.jwt_secret).context("invalid gateway JWT secret")?);
    let coordinator = Coordinator::connect(config.database_url.as_deref())
        .await
        .context("failed to initialize admission coordinator")?;
    let sweeper = coordinator::spawn_sweeper(coordinator.clone(), config.sweep_interval);

    let metrics = Arc::new(GatewayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&metrics));

    let admission = AdmissionGateway::new(&config, jwt_service, coordinator);
    let app = build_router(admission, metrics);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind gateway listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting gateway server");

    let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited unexpectedly");
    sweeper.abort();
    served
}

fn init_tracing(config: &GatewayConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn build_router(admission: AdmissionGateway, metrics: Arc<GatewayMetrics>) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(render_metrics).with_state(metrics))
            .merge(ws::router(admission.clone(), Arc::new(RoomHub::new(RoomKind::Command))))
            .merge(replication::router(admission, Arc::new(ReplicationHost::default()))),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn render_metrics(State(metrics): State<Arc<GatewayMetrics>>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render_prometheus(),
    )
        .into_response()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(?error, "failed to install Ctrl+C handler");
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
                error!(?error, "failed to install SIGTERM handler");
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
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let trace_id = trace_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_trace_id_scope(trace_id.clone(), next.run(request)).await;
    attach_trace_id_header(&mut response, &trace_id);

    info!(
        trace_id = %trace_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
