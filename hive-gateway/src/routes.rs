//! HTTP route handlers for the tool API.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use hive::agent::AgentSnapshot;
use hive::core::commitment::{Check, Commitment};
use hive::core::types::{AgentId, DoneBehavior};
use hive::events::{Event, EventBus};
use hive::orchestrator::{Ack, ToolError};
use hive::spawner::{Initiator, SpawnConfig, SpawnError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/workers", get(list_workers).post(summon_worker))
        .route("/workers/{id}", get(get_worker).delete(dismiss_worker))
        .route("/workers/{id}/messages", post(send_message))
        .route("/workers/{id}/commitments", post(add_commitment))
        .route("/tree", get(get_tree))
        .route("/history", get(get_history))
}

/// Tool errors rendered as `{"error": ...}` with a matching status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<ToolError> for ApiError {
    fn from(err: ToolError) -> Self {
        let status = match &err {
            ToolError::NotFound(_) => StatusCode::NOT_FOUND,
            ToolError::AgentGone(_) => StatusCode::GONE,
            ToolError::AgentTerminal { .. } | ToolError::Verifying(_) => StatusCode::CONFLICT,
            ToolError::RootImmortal => StatusCode::FORBIDDEN,
            ToolError::Spawn(spawn) => match spawn {
                SpawnError::NameTaken(_) | SpawnError::ParentTerminal { .. } => StatusCode::CONFLICT,
                SpawnError::InvalidName(_) | SpawnError::MissingAssignment => StatusCode::BAD_REQUEST,
                SpawnError::ParentNotFound(_) => StatusCode::NOT_FOUND,
                SpawnError::CapacityExceeded(_) | SpawnError::NoRoot => StatusCode::SERVICE_UNAVAILABLE,
                SpawnError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

fn parse_id(raw: &str) -> Result<AgentId, ApiError> {
    AgentId::parse(raw).map_err(|_| ApiError::bad_request(format!("invalid agent id '{raw}'")))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitmentSpec {
    pub description: String,
    pub command: String,
}

impl CommitmentSpec {
    fn into_commitment(self) -> Result<Commitment, ApiError> {
        if self.description.trim().is_empty() || self.command.trim().is_empty() {
            return Err(ApiError::bad_request(
                "commitment description and command must be non-empty",
            ));
        }
        Ok(Commitment::new(self.description.trim(), Check::shell(self.command.trim())))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SummonRequest {
    pub assignment: Option<String>,
    pub name: Option<String>,
    /// Delegating agent. Defaults to the root when an assignment is given.
    pub parent: Option<String>,
    pub commitments: Vec<CommitmentSpec>,
    pub token_budget: Option<u64>,
    pub done_behavior: DoneBehavior,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummonResponse {
    pub id: AgentId,
    pub name: String,
}

/// POST /api/workers - summon a worker.
async fn summon_worker(
    State(state): State<AppState>,
    Json(request): Json<SummonRequest>,
) -> Result<(StatusCode, Json<SummonResponse>), ApiError> {
    let orchestrator = &state.orchestrator;
    let initiator = match (&request.parent, &request.assignment) {
        (Some(parent), _) => Initiator::Parent(parse_id(parent)?),
        (None, Some(_)) => Initiator::Parent(orchestrator.root().id()),
        (None, None) => Initiator::User,
    };
    let initial_commitments = request
        .commitments
        .into_iter()
        .map(CommitmentSpec::into_commitment)
        .collect::<Result<Vec<_>, _>>()?;
    let config = SpawnConfig {
        assignment: request.assignment,
        token_budget: request.token_budget,
        name: request.name,
        initial_commitments,
        done_behavior: request.done_behavior,
    };
    let id = orchestrator.summon(initiator, config).await?;
    let name = orchestrator
        .agent(id)
        .map(|handle| handle.name().to_string())
        .unwrap_or_default();
    Ok((StatusCode::CREATED, Json(SummonResponse { id, name })))
}

/// GET /api/workers - snapshots of every live agent, root first.
async fn list_workers(State(state): State<AppState>) -> Json<Vec<AgentSnapshot>> {
    Json(state.orchestrator.status())
}

/// GET /api/workers/{id}
async fn get_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AgentSnapshot>, ApiError> {
    let id = parse_id(&id)?;
    state
        .orchestrator
        .agent(id)
        .map(|handle| Json(handle.snapshot()))
        .ok_or_else(|| ToolError::NotFound(id).into())
}

/// DELETE /api/workers/{id} - dismiss a worker.
async fn dismiss_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Ack>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.dismiss_worker(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub text: String,
}

/// POST /api/workers/{id}/messages - deliver a user message.
async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<MessageRequest>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    if request.text.trim().is_empty() {
        return Err(ApiError::bad_request("message text must be non-empty"));
    }
    state.orchestrator.send_message(id, &request.text)?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /api/workers/{id}/commitments
async fn add_commitment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(spec): Json<CommitmentSpec>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    let commitment = spec.into_commitment()?;
    state.orchestrator.add_commitment(id, commitment).await?;
    Ok(StatusCode::CREATED)
}

/// GET /api/tree - indented text view of the tree.
async fn get_tree(State(state): State<AppState>) -> String {
    state.orchestrator.tree()
}

/// GET /api/history - every persisted notification, oldest first.
async fn get_history(State(state): State<AppState>) -> Result<Json<Vec<Event>>, ApiError> {
    EventBus::replay(state.orchestrator.store().as_ref())
        .map(Json)
        .map_err(|err| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        })
}
