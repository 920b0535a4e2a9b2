//! Switchboard - a control plane for a single GPU-resident inference backend
//!
//! One GPU, one backend at a time. The library manages the full lifecycle of
//! the managed process (vLLM, llama.cpp or Ollama): preemptible switching
//! between stored recipes, OpenAI-compatible request proxying with in-flight
//! SSE rewriting, and live status fanout over Server-Sent Events.

use axum::Router;
use std::sync::Arc;

pub mod client;
pub mod config;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod orchestrator;
pub mod process;
pub mod routes;
pub mod sse;
pub mod sync;
#[doc(hidden)]
pub mod test_utils;
pub mod transform;

use client::{HttpClient, HyperClient};
use config::Config;
use events::EventBus;
use orchestrator::{BackendSpawner, DetachedSpawner, Orchestrator};
use process::{ProcessLister, SysinfoLister};

/// Shared application state: the HTTP client used for proxying, the
/// orchestrator, and the event bus.
#[derive(Clone)]
pub struct AppState<T: HttpClient + Clone> {
    pub http_client: T,
    pub orchestrator: Arc<Orchestrator<T>>,
    pub events: Arc<EventBus>,
    /// Host managed backends bind on, used to build upstream URIs
    pub backend_host: String,
}

impl AppState<HyperClient> {
    /// Production state: hyper client, real process table, detached spawner.
    pub fn new(config: &Config) -> Self {
        Self::with_parts(
            config,
            client::create_hyper_client(),
            Box::new(SysinfoLister),
            Box::new(DetachedSpawner),
        )
    }
}

impl<T: HttpClient + Clone> AppState<T> {
    /// State with injected process-table and spawn capabilities, for tests.
    pub fn with_parts(
        config: &Config,
        http_client: T,
        lister: Box<dyn ProcessLister>,
        spawner: Box<dyn BackendSpawner>,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        let orchestrator = Arc::new(Orchestrator::new(
            config,
            http_client.clone(),
            lister,
            spawner,
            Arc::clone(&events),
        ));
        Self {
            http_client,
            orchestrator,
            events,
            backend_host: config.host.clone(),
        }
    }
}

/// Build the full application router.
pub fn build_app<T: HttpClient + Clone + Send + Sync + 'static>(state: AppState<T>) -> Router {
    routes::build_router(state)
}
