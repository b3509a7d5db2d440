mod detect;
mod metrics;
mod root;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(root::root))
        .route("/health", get(root::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/detect", post(detect::detect))
}
