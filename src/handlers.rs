//! Axum handlers: the inference proxy path and the control endpoints.

use crate::AppState;
use crate::client::HttpClient;
use crate::errors::SwitchError;
use crate::events::{DEFAULT_CHANNEL, Subscription};
use crate::transform::TransformStream;
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, instrument};

const MODEL_OVERRIDE_HEADER: &str = "model-override";

#[derive(Debug, Deserialize)]
struct ExtractedModel {
    model: String,
}

/// Forwards inference requests to the managed backend, switching first when
/// the requested model is not the one currently resident.
///
/// Streamed responses are rewritten in flight; everything else passes
/// through untouched.
#[instrument(skip(state, req))]
pub async fn proxy_handler<T: HttpClient + Clone>(
    State(state): State<AppState<T>>,
    mut req: axum::extract::Request,
) -> Result<Response, StatusCode> {
    let mut body_bytes =
        match axum::body::to_bytes(std::mem::take(req.body_mut()), usize::MAX).await {
            Ok(bytes) => bytes,
            Err(_) => return Err(StatusCode::BAD_REQUEST),
        };

    // Model precedence: override header, then the JSON body. A request
    // without a model (health checks and the like) is forwarded as-is to
    // whatever backend is running.
    let model = match req.headers().get(MODEL_OVERRIDE_HEADER) {
        Some(value) => match value.to_str() {
            Ok(value) => Some(value.to_string()),
            Err(_) => return Err(StatusCode::BAD_REQUEST),
        },
        None => serde_json::from_slice::<ExtractedModel>(&body_bytes)
            .ok()
            .map(|extracted| extracted.model),
    };

    if let Some(ref model) = model {
        info!(model, "inference request");
        match state.orchestrator.ensure_model(model).await {
            Ok(()) => {}
            Err(SwitchError::RecipeNotFound(_)) => return Err(StatusCode::NOT_FOUND),
            Err(SwitchError::Cancelled(_)) => return Err(StatusCode::CONFLICT),
            Err(e) => {
                error!(model, error = %e, "failed to bring up backend");
                return Err(StatusCode::SERVICE_UNAVAILABLE);
            }
        }
    }

    let Some(handle) = state.orchestrator.current_process().await else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    // The backend only answers to its served model name; rewrite the body's
    // model field when the client addressed it some other way.
    if let (Some(model), Some(served)) = (&model, &handle.served_model_name) {
        if model != served && !body_bytes.is_empty() {
            if let Ok(mut body) = serde_json::from_slice::<serde_json::Value>(&body_bytes) {
                if let Some(object) = body.as_object_mut() {
                    if object.contains_key("model") {
                        debug!(from = %model, to = %served, "rewriting model field");
                        object.insert("model".to_string(), json!(served));
                        body_bytes = match serde_json::to_vec(&body) {
                            Ok(bytes) => axum::body::Bytes::from(bytes),
                            Err(_) => return Err(StatusCode::BAD_REQUEST),
                        };
                        req.headers_mut().insert(
                            header::CONTENT_LENGTH,
                            header::HeaderValue::from(body_bytes.len()),
                        );
                    }
                }
            }
        }
    }

    *req.body_mut() = Body::from(body_bytes);

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|v| v.as_str())
        .unwrap_or(req.uri().path());
    let upstream = format!(
        "http://{}:{}{}",
        state.backend_host, handle.port, path_and_query
    );
    let upstream_uri = match Uri::try_from(&upstream) {
        Ok(uri) => uri,
        Err(_) => {
            error!(%upstream, "invalid upstream uri");
            return Err(StatusCode::BAD_REQUEST);
        }
    };
    *req.uri_mut() = upstream_uri;

    let response = match state.http_client.request(req).await {
        Ok(response) => response,
        Err(e) => {
            error!(%upstream, error = %e, "error forwarding request to backend");
            return Err(StatusCode::BAD_GATEWAY);
        }
    };

    let is_event_stream = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"));
    if !is_event_stream {
        return Ok(response);
    }

    // Length changes as chunks are rewritten.
    let (mut parts, body) = response.into_parts();
    parts.headers.remove(header::CONTENT_LENGTH);
    let transformed = TransformStream::new(body.into_data_stream());
    Ok(Response::from_parts(parts, Body::from_stream(transformed)))
}

/// OpenAI-compatible model listing built from the stored recipes.
#[instrument(skip(state))]
pub async fn models<T: HttpClient + Clone>(
    State(state): State<AppState<T>>,
) -> impl IntoResponse {
    let data: Vec<serde_json::Value> = state
        .orchestrator
        .recipe_ids()
        .into_iter()
        .map(|id| {
            let served = state
                .orchestrator
                .recipe(&id)
                .and_then(|r| r.served_model_name.clone())
                .unwrap_or_else(|| id.clone());
            json!({
                "id": served,
                "object": "model",
                "created": 0,
                "owned_by": "switchboard",
                "recipe": id,
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": data }))
}

/// Explicit switch. Blocks until the launch reaches a terminal state.
#[instrument(skip(state))]
pub async fn switch_model<T: HttpClient + Clone>(
    State(state): State<AppState<T>>,
    Path(recipe): Path<String>,
) -> impl IntoResponse {
    let result = state.orchestrator.switch_to(&recipe).await;
    let status = if result.success {
        StatusCode::OK
    } else if result.message.contains("recipe not found") {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(result))
}

#[derive(Debug, Deserialize)]
pub struct CancelParams {
    pub recipe: Option<String>,
}

#[instrument(skip(state))]
pub async fn cancel_launch<T: HttpClient + Clone>(
    State(state): State<AppState<T>>,
    Query(params): Query<CancelParams>,
) -> impl IntoResponse {
    let cancelled = state.orchestrator.cancel_launch(params.recipe.as_deref()).await;
    Json(json!({ "cancelled": cancelled }))
}

#[derive(Debug, Deserialize)]
pub struct EvictParams {
    #[serde(default)]
    pub force: bool,
}

#[instrument(skip(state))]
pub async fn evict<T: HttpClient + Clone>(
    State(state): State<AppState<T>>,
    Query(params): Query<EvictParams>,
) -> impl IntoResponse {
    let evicted = state.orchestrator.evict(params.force).await;
    Json(json!({ "evicted": evicted }))
}

/// The backend currently occupying the GPU, derived from the process table.
#[instrument(skip(state))]
pub async fn current_process<T: HttpClient + Clone>(
    State(state): State<AppState<T>>,
) -> impl IntoResponse {
    Json(state.orchestrator.current_process().await)
}

/// Live status events for the default channel.
pub async fn events_default<T: HttpClient + Clone>(
    State(state): State<AppState<T>>,
) -> Response {
    sse_response(state.events.subscribe(DEFAULT_CHANNEL))
}

/// Live status events for a named channel.
pub async fn events_channel<T: HttpClient + Clone>(
    State(state): State<AppState<T>>,
    Path(channel): Path<String>,
) -> Response {
    sse_response(state.events.subscribe(&channel))
}

fn sse_response(subscription: Subscription) -> Response {
    let stream = futures_util::stream::unfold(subscription, |subscription| async move {
        let event = subscription.next().await?;
        Some((
            Ok::<_, std::convert::Infallible>(event.to_sse_frame()),
            subscription,
        ))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
