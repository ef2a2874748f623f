//! The admin HTTP control surface.

use crate::auth::AuthStrategy;
use crate::content::ContentServices;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use std::collections::HashMap;
use std::sync::Arc;
use torii_api::*;
use torii_backup::{BackupEngine, ConsolidationState};
use torii_core::{AssignmentQueue, DomainIdentity};

/// Everything the admin routes need.
pub struct HttpState {
    /// The settings store.
    pub settings: SettingsStore,
    /// The node registry.
    pub registry: DynNodeRegistry,
    /// The assignment queue.
    pub queue: Arc<AssignmentQueue>,
    /// The backup engine.
    pub engine: Arc<BackupEngine>,
    /// The content services.
    pub content: Arc<ContentServices>,
    /// The metaverse client backing the reverse proxy.
    pub metaverse: DynMetaverseClient,
    /// The domain identity.
    pub identity: Arc<DomainIdentity>,
    /// The resolved auth strategy.
    pub auth: AuthStrategy,
    /// Process exit requests (restart) go here.
    pub shutdown: tokio::sync::mpsc::UnboundedSender<i32>,
}

/// Build the admin router over the shared state.
pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/id", get(get_id))
        .route("/oauth", get(oauth_callback))
        .route("/nodes.json", get(get_nodes))
        .route("/nodes/{id}", get(get_node).delete(delete_node))
        .route("/nodes/{id}/", delete(delete_node))
        .route("/nodes/", delete(delete_all_nodes))
        .route("/assignments.json", get(get_assignments))
        .route("/assignment", post(post_assignment))
        .route("/content/upload", post(post_content_upload))
        .route("/settings.json", get(get_settings).post(post_settings))
        .route("/api/backups", get(get_backups).post(post_backup))
        .route("/api/backups/{id}", delete(delete_backup))
        .route("/api/backups/download/{id}", get(download_backup))
        .route("/api/backups/recover/{id}", post(recover_backup))
        .route("/restart", get(get_restart))
        .route("/api/domains", get(proxy_get).put(proxy_put))
        .route("/api/domains/{*rest}", get(proxy_get).put(proxy_put))
        .route("/api/places", get(proxy_get).put(proxy_put))
        .route("/api/places/{*rest}", get(proxy_get).put(proxy_put))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ))
        .with_state(state)
}

/// Everything except `/id` and the OAuth callback requires
/// authentication.
async fn require_auth(
    State(state): State<Arc<HttpState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if path == "/id" || path == "/oauth" {
        return next.run(request).await;
    }

    match &state.auth {
        AuthStrategy::Open => next.run(request).await,
        AuthStrategy::Basic { .. } => {
            let authorization = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            if state.auth.check_basic(authorization) {
                next.run(request).await
            } else {
                (
                    StatusCode::UNAUTHORIZED,
                    [(
                        header::WWW_AUTHENTICATE,
                        "Basic realm=\"torii domain controller\"",
                    )],
                    "unauthorized",
                )
                    .into_response()
            }
        }
        AuthStrategy::OAuth(oauth) => {
            let cookie = request
                .headers()
                .get(header::COOKIE)
                .and_then(|v| v.to_str().ok());
            if oauth.check_cookie(cookie) {
                next.run(request).await
            } else {
                let host = request
                    .headers()
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("localhost");
                Redirect::temporary(&oauth.begin(host)).into_response()
            }
        }
    }
}

fn internal(err: ToriiError) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}

async fn get_id(State(state): State<Arc<HttpState>>) -> String {
    state.identity.id().to_string()
}

async fn oauth_callback(
    State(state): State<Arc<HttpState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let oauth = match &state.auth {
        AuthStrategy::OAuth(oauth) => oauth.clone(),
        _ => {
            return (
                StatusCode::NOT_FOUND,
                "oauth is not configured for this domain",
            )
                .into_response()
        }
    };

    let (code, oauth_state) = match (
        params.get("code").cloned(),
        params.get("state").cloned(),
    ) {
        (Some(code), Some(state)) => (code, state),
        _ => {
            return (StatusCode::BAD_REQUEST, "missing code or state")
                .into_response()
        }
    };
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost")
        .to_string();

    match oauth.callback(code, oauth_state, host).await {
        Ok(cookie) => (
            StatusCode::FOUND,
            [
                (header::SET_COOKIE, cookie.as_str()),
                (header::LOCATION, "/nodes.json"),
            ],
        )
            .into_response(),
        Err(err) => {
            (StatusCode::UNAUTHORIZED, err.to_string()).into_response()
        }
    }
}

fn node_json(node: &NodeInfo) -> serde_json::Value {
    serde_json::json!({
        "uuid": node.id,
        "local_id": node.local_id,
        "type": node.node_type.name(),
        "public_socket": node.sockets.public.to_string(),
        "local_socket": node.sockets.local.to_string(),
        "active_socket": node.active_socket.to_string(),
        "permissions": node.permissions,
        "username": node.verified_username(),
        "version": node.version,
        "wake_timestamp": node.wake_timestamp,
        "uptime_secs": node.wake_timestamp.elapsed().as_secs(),
    })
}

async fn get_nodes(
    State(state): State<Arc<HttpState>>,
) -> Result<Json<serde_json::Value>, Response> {
    let mut nodes = Vec::new();
    state
        .registry
        .for_each(Box::new(|node| nodes.push(node_json(node))))
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "nodes": nodes })))
}

fn parse_node_id(raw: &str) -> Result<NodeId, Response> {
    raw.trim_end_matches(".json")
        .trim_end_matches('/')
        .parse()
        .map_err(|_| {
            (StatusCode::BAD_REQUEST, "malformed node uuid")
                .into_response()
        })
}

async fn get_node(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let id = parse_node_id(&id)?;
    let node = state
        .registry
        .get(id)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            (StatusCode::NOT_FOUND, "no such node").into_response()
        })?;
    let stats = state
        .registry
        .get_stats(id)
        .await
        .map_err(internal)?
        .unwrap_or(serde_json::Value::Null);

    let mut out = node_json(&node);
    out["stats"] = stats;
    Ok(Json(out))
}

async fn delete_node(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, Response> {
    let id = parse_node_id(&id)?;
    match state.registry.remove(id).await.map_err(internal)? {
        Some(_) => Ok(StatusCode::OK),
        None => Ok(StatusCode::NOT_FOUND),
    }
}

async fn delete_all_nodes(
    State(state): State<Arc<HttpState>>,
) -> Result<StatusCode, Response> {
    let nodes = state.registry.get_all().await.map_err(internal)?;
    for node in nodes {
        let _ = state.registry.remove(node.id).await;
    }
    Ok(StatusCode::OK)
}

async fn get_assignments(
    State(state): State<Arc<HttpState>>,
) -> Json<serde_json::Value> {
    Json(state.queue.snapshot())
}

#[derive(serde::Deserialize)]
struct AssignmentParams {
    #[serde(default = "one")]
    count: usize,
    #[serde(default)]
    pool: String,
}

fn one() -> usize {
    1
}

async fn post_assignment(
    State(state): State<Arc<HttpState>>,
    Query(params): Query<AssignmentParams>,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, Response> {
    if body.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "empty script")
            .into_response());
    }
    let ids = state
        .queue
        .create_scripted(params.count.clamp(1, 512), params.pool, body)
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "assignments": ids })))
}

#[derive(serde::Deserialize)]
struct UploadParams {
    #[serde(default = "default_upload_name")]
    filename: String,
}

fn default_upload_name() -> String {
    "models.json.gz".into()
}

async fn post_content_upload(
    State(state): State<Arc<HttpState>>,
    Query(params): Query<UploadParams>,
    body: axum::body::Bytes,
) -> Result<StatusCode, Response> {
    state
        .content
        .apply_upload(&params.filename, body)
        .await
        .map_err(|err| {
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        })?;
    Ok(StatusCode::OK)
}

async fn get_settings(
    State(state): State<Arc<HttpState>>,
) -> Json<serde_json::Value> {
    Json(state.settings.snapshot())
}

async fn post_settings(
    State(state): State<Arc<HttpState>>,
    Json(patch): Json<serde_json::Value>,
) -> Result<StatusCode, Response> {
    state
        .settings
        .recurse_and_overwrite(patch)
        .map_err(internal)?;
    Ok(StatusCode::OK)
}

async fn get_backups(
    State(state): State<Arc<HttpState>>,
) -> Result<Json<serde_json::Value>, Response> {
    let backups = state.engine.list().map_err(internal)?;
    Ok(Json(serde_json::json!({
        "backups": backups,
        "rules": state.engine.rules(),
    })))
}

#[derive(serde::Deserialize)]
struct BackupParams {
    #[serde(default = "default_backup_name")]
    name: String,
}

fn default_backup_name() -> String {
    "admin".into()
}

async fn post_backup(
    State(state): State<Arc<HttpState>>,
    Query(params): Query<BackupParams>,
) -> Result<Json<serde_json::Value>, Response> {
    let id = state
        .engine
        .create_manual(&params.name)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "id": id })))
}

async fn delete_backup(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, Response> {
    state.engine.delete(&id).map_err(|err| {
        (StatusCode::NOT_FOUND, err.to_string()).into_response()
    })?;
    Ok(StatusCode::OK)
}

async fn download_backup(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> Response {
    match state.engine.consolidation_state(&id) {
        Some(ConsolidationState::CompleteWithSuccess { path }) => {
            match tokio::fs::read(&path).await {
                Ok(data) => (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/zip")],
                    data,
                )
                    .into_response(),
                Err(err) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    err.to_string(),
                )
                    .into_response(),
            }
        }
        Some(ConsolidationState::CompleteWithError { error }) => {
            (StatusCode::INTERNAL_SERVER_ERROR, error).into_response()
        }
        Some(ConsolidationState::InProgress) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "state": "in_progress" })),
        )
            .into_response(),
        None => match state.engine.clone().consolidate(&id) {
            Ok(()) => (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "state": "in_progress" })),
            )
                .into_response(),
            Err(err) => {
                (StatusCode::BAD_REQUEST, err.to_string()).into_response()
            }
        },
    }
}

async fn recover_backup(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, Response> {
    state.engine.recover(&id).await.map_err(|err| {
        (StatusCode::BAD_REQUEST, err.to_string()).into_response()
    })?;
    Ok(StatusCode::OK)
}

async fn get_restart(State(state): State<Arc<HttpState>>) -> StatusCode {
    tracing::info!("restart requested over the admin surface");
    let _ = state.shutdown.send(crate::EXIT_CODE_REBOOT);
    StatusCode::OK
}

async fn proxy_get(
    State(state): State<Arc<HttpState>>,
    request: Request,
) -> Response {
    proxy(state, "GET", request, None).await
}

async fn proxy_put(
    State(state): State<Arc<HttpState>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, 1024 * 1024).await {
        Ok(body) => body,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, err.to_string())
                .into_response()
        }
    };
    let body: Option<serde_json::Value> = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice(&body) {
            Ok(body) => Some(body),
            Err(err) => {
                return (StatusCode::BAD_REQUEST, err.to_string())
                    .into_response()
            }
        }
    };
    proxy(state, "PUT", Request::from_parts(parts, Default::default()), body)
        .await
}

/// Forward `/api/domains` and `/api/places` to the metaverse under
/// its v1 prefix, authenticated with the domain's access token.
async fn proxy(
    state: Arc<HttpState>,
    method: &str,
    request: Request,
    body: Option<serde_json::Value>,
) -> Response {
    let path = format!(
        "/api/v1{}",
        request.uri().path().trim_start_matches("/api"),
    );
    match state
        .metaverse
        .proxy(method.to_string(), path, body)
        .await
    {
        Ok((status, body)) => (
            StatusCode::from_u16(status)
                .unwrap_or(StatusCode::BAD_GATEWAY),
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(err) => {
            (StatusCode::BAD_GATEWAY, err.to_string()).into_response()
        }
    }
}
