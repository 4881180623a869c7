//! HTTP routes: discovery, Full-tree snapshot and the WebSocket upgrade.

use std::sync::Arc;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use signalk_core::{build_full_tree, SnapshotSource};
use signalk_protocol::{DiscoveryResponse, SubscribeMode};

use crate::hub::HubHandle;
use crate::session::run_session;
use crate::ServerConfig;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub snapshot: Arc<dyn SnapshotSource>,
    pub config: Arc<ServerConfig>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/signalk", get(discovery))
        .route("/signalk/v3/api", get(full_tree))
        .route("/signalk/v3/api/", get(full_tree))
        .route("/signalk/v1/stream", get(stream))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn discovery(State(state): State<AppState>, headers: HeaderMap) -> Json<DiscoveryResponse> {
    let authority = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or(&state.config.listen);
    Json(DiscoveryResponse::new(
        authority,
        &state.config.name,
        &state.config.version,
    ))
}

async fn full_tree(State(state): State<AppState>) -> Response {
    let snapshot = state.snapshot.clone();
    let rows = match tokio::task::spawn_blocking(move || snapshot.latest()).await {
        Ok(Ok(rows)) => rows,
        Ok(Err(e)) => {
            error!(error = %e, "snapshot query failed");
            return (StatusCode::BAD_REQUEST, "snapshot unavailable").into_response();
        }
        Err(e) => {
            error!(error = %e, "snapshot task failed");
            return (StatusCode::BAD_REQUEST, "snapshot unavailable").into_response();
        }
    };
    Json(build_full_tree(
        &rows,
        &state.config.self_context,
        &state.config.version,
    ))
    .into_response()
}

/// Query parameters of the stream upgrade. Unrecognized values fall back
/// to the defaults instead of rejecting the upgrade.
#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    pub subscribe: SubscribeMode,
    #[serde(rename = "sendCachedValues", default)]
    pub send_cached_values: Option<String>,
}

impl StreamParams {
    /// Cached values are sent unless the client says `false`, `0` or `no`.
    pub fn send_cached(&self) -> bool {
        match self.send_cached_values.as_deref() {
            Some(value) => !matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "false" | "0" | "no"
            ),
            None => true,
        }
    }
}

async fn stream(
    ws: WebSocketUpgrade,
    Query(params): Query<StreamParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let send_cached = params.send_cached();
    ws.on_upgrade(move |socket| run_session(socket, state.hub, params.subscribe, send_cached))
}
