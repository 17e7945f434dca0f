use std::future::ready;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::broadcast::Broadcaster;
use crate::prometheus::{setup_metrics_recorder, track_metrics};
use crate::publisher::Publisher;
use crate::upload;

#[derive(Clone)]
pub struct State {
    pub broadcaster: Broadcaster,
    pub salt: Option<Arc<str>>,
    pub max_payload_bytes: usize,
}

async fn index() -> &'static str {
    "gateway"
}

/// Used by the monitoring script to decide whether the gateway stays in rotation.
/// It does not look at the publisher.
async fn health_check() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn router(
    publisher: Arc<dyn Publisher + Send + Sync>,
    salt: Option<String>,
    publish_concurrency_limit: Option<usize>,
    max_payload_bytes: usize,
    metrics: bool,
) -> Router {
    let state = State {
        broadcaster: Broadcaster::new(publisher, publish_concurrency_limit),
        salt: salt.filter(|salt| !salt.is_empty()).map(Arc::from),
        max_payload_bytes,
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/health_check", get(health_check))
        .route("/health_check/", get(health_check))
        .route("/upload", post(upload::upload))
        .route("/upload/", post(upload::upload))
        .layer(DefaultBodyLimit::max(max_payload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when the gateway is used as a library (during tests etc)
    // does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
