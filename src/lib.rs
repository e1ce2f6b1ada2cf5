use std::future::Future;
use std::sync::Arc;

use axum::extract::Request;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info_span, warn, Level};

use crate::config::Config;
use crate::route::AppState;
use crate::session::manager::Manager;

use error::AppError;

pub mod config;
pub mod log;
pub mod signal;

mod error;
mod metrics;
mod recorder;
mod result;
mod route;
mod session;

pub async fn server_up<F>(cfg: Config, listener: TcpListener, signal: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Err(err) = tokio::fs::create_dir_all(&cfg.record.output_dir).await {
        warn!(
            "output directory {} is not usable: {}",
            cfg.record.output_dir.display(),
            err
        );
    }

    let app_state = AppState {
        sessions: Arc::new(Manager::new(cfg.clone())),
        config: cfg.clone(),
    };
    let app = Router::new()
        .merge(route::offer::route())
        .route("/metrics", get(metrics))
        .with_state(app_state.clone())
        .layer(if cfg.http.cors {
            // browsers post offers cross-origin, answer the preflight for them
            CorsLayer::permissive()
        } else {
            CorsLayer::new()
        })
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    info_span!(
                        "http_request",
                        uri = ?request.uri(),
                        method = ?request.method(),
                    )
                })
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO)),
        );

    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
        .unwrap_or_else(|e| error!("Application error: {e}"));

    // seal any recordings that are still running
    app_state.sessions.shutdown().await;
}

pub fn metrics_register() {
    metrics::REGISTRY
        .register(Box::new(metrics::SESSIONS.clone()))
        .unwrap();
    metrics::REGISTRY
        .register(Box::new(metrics::VIDEO_FRAMES.clone()))
        .unwrap();
    metrics::REGISTRY
        .register(Box::new(metrics::AUDIO_FRAMES.clone()))
        .unwrap();
    metrics::REGISTRY
        .register(Box::new(metrics::DROPPED_PACKETS.clone()))
        .unwrap();
}

async fn metrics() -> String {
    metrics::ENCODER
        .encode_to_string(&metrics::REGISTRY.gather())
        .unwrap_or_default()
}
