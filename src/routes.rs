//! Route table for the control plane.
//!
//! Control endpoints live under `/admin`; `/events` streams bus traffic as
//! SSE; everything else falls through to the inference proxy.

use crate::client::HttpClient;
use crate::{AppState, handlers};
use axum::Router;
use axum::routing::{any, get, post};
use tracing::{info, instrument};

#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + Send + Sync + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    Router::new()
        .route("/v1/models", get(handlers::models))
        .route("/admin/switch/{recipe}", post(handlers::switch_model))
        .route("/admin/cancel", post(handlers::cancel_launch))
        .route("/admin/evict", post(handlers::evict))
        .route("/admin/process", get(handlers::current_process))
        .route("/events", get(handlers::events_default))
        .route("/events/{channel}", get(handlers::events_channel))
        .route("/{*path}", any(handlers::proxy_handler))
        .with_state(state)
}
