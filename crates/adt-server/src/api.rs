use crate::dispatcher::DispatchError;
use crate::registry::RouteError;
use crate::{ws, AppState};
use adt_core::protocol::{AgentId, CommandId};
use adt_core::rest::{
    AgentRegisterResponse, AgentSummary, AgentsResponse, ApiError, CommandsResponse,
    ConnectionStatus, MachineInfo, SubmitCommand, SubmitRecurringCommand, SubmitResponse,
};
use adt_storage::StorageError;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::{error, info};

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/agents", get(list_agents).post(register_agent))
        .route("/agents/:id/cmd", get(list_commands).post(submit_command))
        .route("/agents/:id/reccmd", post(submit_recurring_command))
        .route("/agents/:id/ws", get(ws::agent_ws_handler));
    Router::new().nest("/api/v1", api).with_state(state)
}

#[derive(Debug)]
pub struct ApiFailure {
    status: StatusCode,
    body: ApiError,
}

impl ApiFailure {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ApiError::new(i64::from(status.as_u16()), message),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<JsonRejection> for ApiFailure {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<StorageError> for ApiFailure {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            other => {
                error!(event = "storage_error", error = %other);
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
            }
        }
    }
}

impl From<DispatchError> for ApiFailure {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Storage(err) => err.into(),
            DispatchError::Undelivered { command_id, source } => {
                let status = match source {
                    RouteError::AgentNotFound(_) => StatusCode::NOT_FOUND,
                    RouteError::QueueFull(_) | RouteError::RegistryClosed => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    RouteError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                Self::new(status, format!("command {command_id} stored; {source}"))
            }
        }
    }
}

async fn healthcheck() -> Json<Value> {
    Json(json!({ "status": "alive" }))
}

async fn register_agent(
    State(state): State<AppState>,
    payload: Result<Json<MachineInfo>, JsonRejection>,
) -> Result<Json<AgentRegisterResponse>, ApiFailure> {
    let Json(machine) = payload?;
    if machine.hostname.trim().is_empty() {
        return Err(ApiFailure::bad_request("hostname must not be empty"));
    }
    let agent_id = state.store().register_agent(&machine)?;
    info!(event = "agent_created", agent_id, hostname = %machine.hostname);
    Ok(Json(AgentRegisterResponse {
        status: "ok".to_string(),
        agent_id,
    }))
}

async fn list_agents(State(state): State<AppState>) -> Result<Json<AgentsResponse>, ApiFailure> {
    let live = state.registry().connected();
    let agents = state
        .store()
        .list_agents()?
        .into_iter()
        .map(|record| AgentSummary {
            status: if live.contains(&record.id) {
                ConnectionStatus::Online
            } else {
                ConnectionStatus::Offline
            },
            id: record.id,
            name: record.name,
            hostname: record.hostname,
            os: record.os,
            username: record.username,
            display_name: record.display_name,
            os_user_id: record.os_user_id,
            os_user_group_id: record.os_group_id,
            home_directory: record.home_directory,
        })
        .collect();
    Ok(Json(AgentsResponse { agents }))
}

async fn list_commands(
    State(state): State<AppState>,
    Path(agent_id): Path<AgentId>,
) -> Result<Json<CommandsResponse>, ApiFailure> {
    if !state.store().agent_exists(agent_id)? {
        return Err(ApiFailure::new(
            StatusCode::NOT_FOUND,
            format!("agent {agent_id} not found"),
        ));
    }
    let commands = state.store().list_commands(agent_id)?;
    Ok(Json(CommandsResponse { commands }))
}

async fn submit_command(
    State(state): State<AppState>,
    Path(agent_id): Path<AgentId>,
    payload: Result<Json<SubmitCommand>, JsonRejection>,
) -> Result<Json<SubmitResponse>, ApiFailure> {
    let Json(body) = payload?;
    if body.command.trim().is_empty() {
        return Err(ApiFailure::bad_request("command must not be empty"));
    }
    let command_id = state
        .dispatcher
        .submit_command(agent_id, &body.command)
        .await?;
    Ok(Json(sent(command_id)))
}

async fn submit_recurring_command(
    State(state): State<AppState>,
    Path(agent_id): Path<AgentId>,
    payload: Result<Json<SubmitRecurringCommand>, JsonRejection>,
) -> Result<Json<SubmitResponse>, ApiFailure> {
    let Json(body) = payload?;
    if body.command.trim().is_empty() {
        return Err(ApiFailure::bad_request("command must not be empty"));
    }
    if body.interval == 0 {
        return Err(ApiFailure::bad_request("interval must be at least one second"));
    }
    let command_id = state
        .dispatcher
        .submit_recurring_command(agent_id, &body.command, body.interval)
        .await?;
    Ok(Json(sent(command_id)))
}

fn sent(command_id: CommandId) -> SubmitResponse {
    SubmitResponse {
        status: "sent".to_string(),
        command_id,
    }
}
