//! HTTP surface.
//!
//! A small loopback API: SSE subscriptions, the load handshake, the
//! viewer-to-worker relay, and the bundled static assets. Request bodies use
//! the original line formats (`EVENTTYPE:payload`, `path:id`, `level:msg`).
//!
//! POST handlers acknowledge with 200 and process afterwards; processing
//! problems are logged, never surfaced to the client. Dynamic relay
//! contexts registered through `/new` cannot be added to an axum router once
//! it serves, so they live in a map consulted by the fallback handler.

use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{Method, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use dashmap::DashMap;
use liveview_core::EventType;
use serde::Deserialize;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::assets;
use crate::broker::EventBroker;

/// Upper bound for relayed request bodies.
const BODY_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AppState {
    pub broker: Arc<EventBroker>,
    /// Relay contexts registered via `/new`: path to correlation id.
    pub relay_contexts: Arc<DashMap<String, String>>,
}

impl AppState {
    pub fn new(broker: Arc<EventBroker>) -> Self {
        Self {
            broker,
            relay_contexts: Arc::new(DashMap::new()),
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/events", get(events_handler))
        .route("/loaded", post(loaded_handler))
        .route("/receive", post(receive_handler))
        .route("/log", post(log_handler))
        .route("/new", post(new_handler))
        .fallback(fallback_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// `web` (default) subscribes a viewer; `java` claims the worker channel.
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

async fn events_handler(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = if query
        .kind
        .as_deref()
        .is_some_and(|kind| kind.eq_ignore_ascii_case("java"))
    {
        info!("worker channel connected");
        state.broker.claim_worker_channel()
    } else {
        let (id, rx) = state.broker.subscribe_viewer();
        info!(%id, "viewer connected");
        rx
    };

    let stream = UnboundedReceiverStream::new(rx).map(|frame| Ok(Event::default().data(frame)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn loaded_handler(State(state): State<AppState>, _body: String) -> StatusCode {
    state.broker.acknowledge_load();
    StatusCode::OK
}

async fn receive_handler(State(state): State<AppState>, body: String) -> StatusCode {
    let Some((kind, payload)) = body.split_once(':') else {
        warn!("malformed /receive body, expected 'EVENTTYPE:payload'");
        return StatusCode::OK;
    };

    match EventType::from_str(kind) {
        Ok(EventType::Load) => {
            debug!(resource = payload, "received load request");
            state.broker.load(payload).await;
        }
        Ok(event) => {
            debug!(%event, "received event");
            state.broker.dispatch_to_viewers(event, payload);
        }
        Err(error) => warn!(%error, "ignoring /receive event"),
    }
    StatusCode::OK
}

async fn log_handler(body: String) -> StatusCode {
    let Some((level, message)) = body.split_once(':') else {
        warn!("malformed /log body, expected 'level:message'");
        return StatusCode::OK;
    };

    match level.to_ascii_lowercase().as_str() {
        "error" => tracing::error!(target: "viewer", "{message}"),
        "warn" | "warning" => tracing::warn!(target: "viewer", "{message}"),
        "debug" => tracing::debug!(target: "viewer", "{message}"),
        _ => tracing::info!(target: "viewer", "{message}"),
    }
    StatusCode::OK
}

async fn new_handler(State(state): State<AppState>, body: String) -> StatusCode {
    let Some((path, id)) = body.split_once(':') else {
        warn!("malformed /new body, expected 'path:id'");
        return StatusCode::OK;
    };

    let path = normalize_context_path(path);
    if state.relay_contexts.contains_key(&path) {
        debug!(%path, "relay context already exists");
    } else {
        info!(%path, "registered relay context");
        state.relay_contexts.insert(path, id.to_string());
    }
    StatusCode::OK
}

/// Everything not routed above: relayed POSTs to dynamic contexts and the
/// bundled static assets.
async fn fallback_handler(State(state): State<AppState>, request: Request) -> Response {
    let path = request.uri().path().to_string();

    if request.method() == Method::GET {
        return serve_asset(&path);
    }
    if request.method() == Method::POST {
        return relay_response(&state, &path, request.into_body()).await;
    }

    warn!(%path, method = %request.method(), "method not allowed");
    StatusCode::METHOD_NOT_ALLOWED.into_response()
}

async fn relay_response(state: &AppState, path: &str, body: Body) -> Response {
    let Some(id) = state.relay_contexts.get(path).map(|entry| entry.value().clone()) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let bytes = match axum::body::to_bytes(body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!(%path, %error, "failed to read relayed body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    let Ok(data) = String::from_utf8(bytes.to_vec()) else {
        warn!(%path, "relayed body is not valid UTF-8");
        return StatusCode::BAD_REQUEST.into_response();
    };

    state.broker.relay_to_worker(&id, path, &data);
    StatusCode::OK.into_response()
}

fn serve_asset(path: &str) -> Response {
    match assets::lookup(path) {
        Some(asset) => (
            [(header::CONTENT_TYPE, asset.content_type)],
            asset.body,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn normalize_context_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> AppState {
        AppState::new(Arc::new(EventBroker::new(50001)))
    }

    #[tokio::test]
    async fn receive_broadcasts_non_load_events() {
        let state = test_state();
        let (_id, mut rx) = state.broker.subscribe_viewer();

        let status = receive_handler(State(state), "WRITE:hello".to_string()).await;

        assert_eq!(status, StatusCode::OK);
        let frame = rx.try_recv().unwrap();
        assert!(frame.starts_with("WRITE:"));
    }

    #[tokio::test]
    async fn receive_ignores_unknown_event_types() {
        let state = test_state();
        let (_id, mut rx) = state.broker.subscribe_viewer();

        let status = receive_handler(State(state), "BOGUS:data".to_string()).await;

        assert_eq!(status, StatusCode::OK);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn loaded_resolves_pending_ack() {
        let state = test_state();
        let broker = Arc::clone(&state.broker);
        let (_id, _rx) = broker.subscribe_viewer();

        let load_broker = Arc::clone(&broker);
        let load = tokio::spawn(async move { load_broker.load("lib.js").await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        loaded_handler(State(state), String::new()).await;
        load.await.unwrap();

        assert_eq!(broker.loaded_resources(), ["lib.js"]);
    }

    #[tokio::test]
    async fn new_keeps_first_registration_for_a_path() {
        let state = test_state();

        new_handler(State(state.clone()), "cb:first".to_string()).await;
        new_handler(State(state.clone()), "/cb:second".to_string()).await;

        assert_eq!(state.relay_contexts.len(), 1);
        assert_eq!(state.relay_contexts.get("/cb").unwrap().value(), "first");
    }

    #[tokio::test]
    async fn relayed_post_reaches_worker_channel() {
        let state = test_state();
        let mut worker = state.broker.claim_worker_channel();
        state
            .relay_contexts
            .insert("/cb".to_string(), "corr7".to_string());

        let response = relay_response(&state, "/cb", Body::from("clicked")).await;

        assert_eq!(response.status(), StatusCode::OK);
        let frame = worker.try_recv().unwrap();
        assert!(frame.starts_with("corr7:"));
    }

    #[tokio::test]
    async fn unregistered_post_path_is_not_found() {
        let state = test_state();
        let response = relay_response(&state, "/nope", Body::from("x")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn root_serves_the_index_page() {
        let response = serve_asset("/");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_asset_is_not_found() {
        let response = serve_asset("/missing.js");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
