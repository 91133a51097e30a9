//! HTTP handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::AppState;
use super::error::{ApiError, ApiResult};
use crate::agent::{AgentIdentity, InvocationCredential, ProfileUpdate, RegisterRequest};
use crate::backend::BackendSnapshot;
use crate::queue::{DirectMode, DirectOutcome, DirectQueueEntry, QueueFilter};
use crate::router::InvocationRequest;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Debug, Serialize)]
pub struct InvokeResponse {
    /// Recipients a delivery was started for. Outcomes arrive as events.
    pub recipients: Vec<String>,
}

pub async fn invoke(
    State(state): State<AppState>,
    Json(request): Json<InvocationRequest>,
) -> (StatusCode, Json<InvokeResponse>) {
    let recipients = state.router.invoke(request);
    (StatusCode::ACCEPTED, Json(InvokeResponse { recipients }))
}

pub async fn list_agents(State(state): State<AppState>) -> ApiResult<Json<Vec<AgentIdentity>>> {
    Ok(Json(state.agents.list().await?))
}

pub async fn register_agent(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AgentIdentity>)> {
    let agent = state.agents.register(request).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub pid: u32,
    #[serde(default)]
    pub tty: String,
    #[serde(default)]
    pub credential: Option<InvocationCredential>,
}

pub async fn connect_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<ConnectRequest>,
) -> ApiResult<Json<AgentIdentity>> {
    let agent = state
        .agents
        .connect(&name, request.pid, &request.tty, request.credential)
        .await?;
    Ok(Json(agent))
}

pub async fn disconnect_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<AgentIdentity>> {
    Ok(Json(state.agents.disconnect(&name).await?))
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub agent: String,
    /// Direct messages picked up by this heartbeat, rendered for the agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<String>,
}

/// Bump last-seen and hand over any queued direct messages.
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<HeartbeatResponse>> {
    state.agents.heartbeat(&name).await?;
    let pending = state.queue.pickup(&name).await?;
    Ok(Json(HeartbeatResponse {
        agent: name,
        pending,
    }))
}

pub async fn update_profile(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(update): Json<ProfileUpdate>,
) -> ApiResult<Json<AgentIdentity>> {
    Ok(Json(state.agents.update_profile(&name, &update).await?))
}

#[derive(Debug, Serialize)]
pub struct GhostResponse {
    pub agent: String,
    pub ghost: bool,
}

pub async fn agent_ghost(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<GhostResponse>> {
    let ghost = state.router.is_ghost(&name).await?;
    Ok(Json(GhostResponse { agent: name, ghost }))
}

#[derive(Debug, Serialize)]
pub struct InvocableResponse {
    pub agent: String,
    pub invocable: bool,
}

pub async fn agent_invocable(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<InvocableResponse>> {
    if state.agents.get(&name).await?.is_none() {
        return Err(ApiError::not_found(format!("agent {name}")));
    }
    let invocable = state.router.is_invocable(&name).await?;
    Ok(Json(InvocableResponse {
        agent: name,
        invocable,
    }))
}

#[derive(Debug, Serialize)]
pub struct GhostsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refreshed_at: Option<DateTime<Utc>>,
    pub ghosts: HashMap<String, bool>,
}

/// Cached ghost map; empty until the first refresh.
pub async fn ghosts(State(state): State<AppState>) -> Json<GhostsResponse> {
    Json(GhostsResponse {
        refreshed_at: state.ghosts.refreshed_at().await,
        ghosts: state.ghosts.snapshot().await,
    })
}

#[derive(Debug, Deserialize)]
pub struct DirectRequest {
    pub from: String,
    pub to: String,
    pub text: String,
    #[serde(default)]
    pub mode: Option<DirectMode>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

pub async fn direct_message(
    State(state): State<AppState>,
    Json(request): Json<DirectRequest>,
) -> ApiResult<Json<DirectOutcome>> {
    let mode = request.mode.unwrap_or(state.direct_mode);
    let outcome = state
        .router
        .direct_message(
            &request.from,
            &request.to,
            &request.text,
            mode,
            request.timeout_secs.map(Duration::from_secs),
        )
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub responder: String,
    pub response: String,
}

pub async fn respond_direct(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RespondRequest>,
) -> ApiResult<Json<DirectQueueEntry>> {
    let entry = state
        .router
        .respond_direct(&id, &request.responder, &request.response)
        .await?;
    Ok(Json(entry))
}

#[derive(Debug, Serialize)]
pub struct PickupResponse {
    pub agent: String,
    pub messages: Vec<DirectQueueEntry>,
}

/// Take the agent's pending direct messages, marking them delivered.
pub async fn pickup(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> ApiResult<Json<PickupResponse>> {
    let messages = state.queue.take_pending(&agent).await?;
    Ok(Json(PickupResponse { agent, messages }))
}

pub async fn queue_status(
    State(state): State<AppState>,
    Query(filter): Query<QueueFilter>,
) -> ApiResult<Json<Vec<DirectQueueEntry>>> {
    Ok(Json(state.router.queue_status(&filter).await?))
}

#[derive(Debug, Serialize)]
pub struct BackendsResponse {
    pub opencode: Option<BackendSnapshot>,
    /// CLI binaries one-shot delivery would run, by type.
    pub subprocess: HashMap<String, String>,
}

pub async fn backends(State(state): State<AppState>) -> Json<BackendsResponse> {
    let opencode = match &state.supervisor {
        Some(supervisor) => Some(supervisor.snapshot().await),
        None => None,
    };
    Json(BackendsResponse {
        opencode,
        subprocess: state.cli_binaries(),
    })
}

pub async fn start_opencode(State(state): State<AppState>) -> ApiResult<Json<BackendSnapshot>> {
    let supervisor = state
        .supervisor
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("opencode server is disabled"))?;
    supervisor.start().await?;
    Ok(Json(supervisor.snapshot().await))
}

pub async fn stop_opencode(State(state): State<AppState>) -> ApiResult<Json<BackendSnapshot>> {
    let supervisor = state
        .supervisor
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("opencode server is disabled"))?;
    supervisor.stop().await;
    Ok(Json(supervisor.snapshot().await))
}
