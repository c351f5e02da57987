//! The gateway HTTP surface.
//!
//! Client-facing XRPC under `/xrpc/{name}`, the internal execution API
//! under `/internal/*`, and the admin push API under `/admin/*`. Admin
//! mutations are idempotent replace-alls; cross-component updates arrive
//! either over HTTP or through the in-process admin channel.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use avaast_core::{DeployedEndpoint, EndpointKind, ResourceRef, TrafficRule};

use crate::auth::sticky_key_from_bearer;
use crate::error::XrpcError;
use crate::exec::ExecutionService;
use crate::router::DynamicRouter;
use crate::shaper::TrafficShaper;
use crate::subscription::SubscriptionManager;

/// Shared state for every gateway handler.
#[derive(Clone)]
pub struct GatewayState {
    pub router: Arc<DynamicRouter>,
    pub shaper: Arc<TrafficShaper>,
    pub exec: Arc<ExecutionService>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(
        router: Arc<DynamicRouter>,
        shaper: Arc<TrafficShaper>,
        exec: Arc<ExecutionService>,
        subscriptions: Arc<SubscriptionManager>,
    ) -> Self {
        Self {
            router,
            shaper,
            exec,
            subscriptions,
            started_at: Instant::now(),
        }
    }
}

/// Cross-component admin pushes from the controller.
#[derive(Debug)]
pub enum AdminCommand {
    ReplaceEndpoints(Vec<DeployedEndpoint>),
    ReplaceTraffic(Vec<TrafficRule>),
}

/// Apply admin commands arriving over the in-process channel.
pub fn spawn_admin_loop(
    state: GatewayState,
    mut rx: mpsc::Receiver<AdminCommand>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                AdminCommand::ReplaceEndpoints(endpoints) => {
                    let count = state.router.replace_all(endpoints);
                    info!(count, "endpoints replaced via admin channel");
                }
                AdminCommand::ReplaceTraffic(rules) => {
                    if let Err(e) = state.shaper.update_rules(rules) {
                        warn!(error = %e, "traffic update rejected");
                    }
                }
            }
        }
    })
}

/// Build the complete gateway router.
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/xrpc/{name}", get(xrpc_get).post(xrpc_post))
        .route("/admin/endpoints", post(admin_endpoints))
        .route("/admin/traffic", post(admin_traffic))
        .route("/admin/status", get(admin_status))
        .route("/internal/query", post(internal_query))
        .route("/internal/function", post(internal_function))
        .route("/internal/search", post(internal_search))
        .route("/internal/subscribe", post(internal_subscribe))
        .route("/internal/deploy/status", get(internal_deploy_status))
        .route("/internal/health", get(internal_health))
        .with_state(state)
}

fn select_deploy(state: &GatewayState, headers: &HeaderMap) -> Result<ResourceRef, XrpcError> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let sticky = sticky_key_from_bearer(bearer);
    state
        .shaper
        .select_deploy(sticky.as_deref())
        .ok_or_else(|| XrpcError::ServiceUnavailable("no active deploy".to_string()))
}

// ── Client-facing XRPC ─────────────────────────────────────────────

/// GET /xrpc/{name} — computed, search, and subscription endpoints.
async fn xrpc_get(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, XrpcError> {
    let endpoint = state.router.resolve(&name)?;
    if !endpoint.kind.is_read() {
        return Err(XrpcError::MethodMismatch(format!(
            "{name} is a function endpoint; use POST"
        )));
    }
    let deploy = select_deploy(&state, &headers)?;

    match endpoint.kind {
        EndpointKind::Computed => {
            let outcome = state.exec.execute_query(&name, &deploy, &params).await?;
            Ok(Json(outcome).into_response())
        }
        EndpointKind::SearchIndex => {
            let outcome = state.exec.execute_search(&name, &deploy, &params).await?;
            Ok(Json(outcome).into_response())
        }
        EndpointKind::Subscription => {
            subscribe_sse(&state, &name, &deploy, params, &headers).await
        }
        EndpointKind::Function => unreachable!("read check above"),
    }
}

/// POST /xrpc/{name} — function endpoints.
async fn xrpc_post(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, XrpcError> {
    let endpoint = state.router.resolve(&name)?;
    if endpoint.kind.is_read() {
        return Err(XrpcError::MethodMismatch(format!(
            "{name} is a read endpoint; use GET"
        )));
    }
    let deploy = select_deploy(&state, &headers)?;
    let result = state.exec.execute_function(&name, &deploy, &body).await?;
    Ok(Json(result).into_response())
}

/// Attach an SSE subscriber. WebSocket upgrades are explicitly refused.
async fn subscribe_sse(
    state: &GatewayState,
    name: &str,
    deploy: &ResourceRef,
    params: HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<Response, XrpcError> {
    let wants_upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if wants_upgrade {
        return Err(XrpcError::NotImplemented(
            "WebSocket is not supported; connect with Accept: text/event-stream".to_string(),
        ));
    }
    let accepts_sse = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);
    if !accepts_sse {
        return Err(XrpcError::InvalidRequest(
            "subscription endpoints require Accept: text/event-stream".to_string(),
        ));
    }

    // The spec is read from the selected deploy's manifest, so the
    // registration always reflects the version this caller routed to.
    let spec = state.exec.subscription_spec(name, deploy).await?;
    state.subscriptions.register(name, spec);
    let (id, rx) = state.subscriptions.subscribe(name, params)?;
    Ok(sse_response(id, rx))
}

// ── Admin API (internal callers only) ──────────────────────────────

#[derive(Deserialize)]
struct EndpointsPayload {
    endpoints: Vec<DeployedEndpoint>,
}

/// POST /admin/endpoints — replace-all endpoint registration.
async fn admin_endpoints(
    State(state): State<GatewayState>,
    Json(payload): Json<EndpointsPayload>,
) -> Json<serde_json::Value> {
    let count = state.router.replace_all(payload.endpoints);
    Json(serde_json::json!({"ok": true, "count": count}))
}

#[derive(Deserialize)]
struct RulesPayload {
    rules: Vec<TrafficRule>,
}

/// POST /admin/traffic — replace-all traffic rules.
async fn admin_traffic(
    State(state): State<GatewayState>,
    Json(payload): Json<RulesPayload>,
) -> Result<Json<serde_json::Value>, XrpcError> {
    let count = payload.rules.len();
    state.shaper.update_rules(payload.rules)?;
    Ok(Json(serde_json::json!({"ok": true, "count": count})))
}

/// GET /admin/status
async fn admin_status(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "uptime": state.started_at.elapsed().as_secs(),
        "registeredEndpoints": state.router.endpoint_names(),
        "trafficRules": state.shaper.rules(),
    }))
}

// ── Internal execution API ─────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InternalCallRequest {
    endpoint_name: String,
    deploy_ref: ResourceRef,
    #[serde(default)]
    params: serde_json::Value,
}

fn string_params(params: &serde_json::Value) -> HashMap<String, String> {
    match params {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let s = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), s)
            })
            .collect(),
        _ => HashMap::new(),
    }
}

/// POST /internal/query
async fn internal_query(
    State(state): State<GatewayState>,
    Json(req): Json<InternalCallRequest>,
) -> Result<Response, XrpcError> {
    let params = string_params(&req.params);
    let outcome = state
        .exec
        .execute_query(&req.endpoint_name, &req.deploy_ref, &params)
        .await?;
    Ok(Json(outcome).into_response())
}

/// POST /internal/search
async fn internal_search(
    State(state): State<GatewayState>,
    Json(req): Json<InternalCallRequest>,
) -> Result<Response, XrpcError> {
    let params = string_params(&req.params);
    let outcome = state
        .exec
        .execute_search(&req.endpoint_name, &req.deploy_ref, &params)
        .await?;
    Ok(Json(outcome).into_response())
}

/// POST /internal/function
async fn internal_function(
    State(state): State<GatewayState>,
    Json(req): Json<InternalCallRequest>,
) -> Result<Response, XrpcError> {
    let result = state
        .exec
        .execute_function(&req.endpoint_name, &req.deploy_ref, &req.params)
        .await?;
    Ok(Json(result).into_response())
}

/// POST /internal/subscribe — attach a subscriber, bypassing the shaper.
async fn internal_subscribe(
    State(state): State<GatewayState>,
    Json(req): Json<InternalCallRequest>,
) -> Result<Response, XrpcError> {
    let spec = state
        .exec
        .subscription_spec(&req.endpoint_name, &req.deploy_ref)
        .await?;
    state.subscriptions.register(&req.endpoint_name, spec);
    let params = string_params(&req.params);
    let (id, rx) = state.subscriptions.subscribe(&req.endpoint_name, params)?;
    Ok(sse_response(id, rx))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeployStatusEntry {
    #[serde(rename = "ref")]
    resource: ResourceRef,
    state: avaast_deploy::DeployState,
    #[serde(skip_serializing_if = "Option::is_none")]
    activated_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// GET /internal/deploy/status
async fn internal_deploy_status(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let statuses = state.exec.orchestrator().all_statuses().await;
    let deploys: Vec<DeployStatusEntry> = statuses
        .into_iter()
        .map(|s| DeployStatusEntry {
            resource: s.resource,
            state: s.state,
            activated_at: s.activated_at,
        })
        .collect();
    Json(serde_json::json!({"deploys": deploys}))
}

/// GET /internal/health
async fn internal_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Build the SSE response: one `connected` frame, then notifications.
fn sse_response(subscriber_id: u64, rx: mpsc::Receiver<serde_json::Value>) -> Response {
    let connected = Event::default()
        .event("connected")
        .data(serde_json::json!({"subscriberId": subscriber_id}).to_string());
    let notifications = futures_util::stream::unfold(rx, |mut rx| async move {
        let frame = rx.recv().await?;
        let event = Event::default()
            .event("notification")
            .id(chrono::Utc::now().timestamp_millis().to_string())
            .data(frame.to_string());
        Some((Ok::<_, Infallible>(event), rx))
    });
    let stream = futures_util::stream::once(async move { Ok::<_, Infallible>(connected) })
        .chain(notifications);
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}
