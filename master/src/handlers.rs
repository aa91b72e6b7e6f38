use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::api::{
    ClientQuery, CompleteResponse, ComputeRequest, ComputeResponse, ErrorResponse, LoginRequest,
    LoginResponse, LogoutRequest, LogoutResponse, NextResultResponse, ServersResponse,
    StateRequest, SubmitResponse,
};
use common::results::ResultId;
use common::HspError;
use std::sync::Arc;
use tracing::{info, warn};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/login", post(login))
        .route("/api/v1/logout", post(logout))
        .route("/api/v1/compute", post(compute))
        .route("/api/v1/computations", post(set_computation))
        .route("/api/v1/results/next", get(next_result))
        .route(
            "/api/v1/results/:session_id/:computation_id/complete",
            get(is_complete),
        )
        .route("/api/v1/servers", get(list_servers))
        .route("/api/v1/state/save", post(save_state))
        .route("/api/v1/state/load", post(load_state))
        .route("/api/v1/shutdown", post(shutdown))
        .with_state(state)
}

/* ---------------- errores ---------------- */

pub struct ApiError(StatusCode, String);

impl ApiError {
    fn unknown_client(id: &str) -> Self {
        ApiError(StatusCode::NOT_FOUND, format!("cliente {} desconocido", id))
    }
}

impl From<HspError> for ApiError {
    fn from(e: HspError) -> Self {
        let status = match &e {
            HspError::Protocol(_) | HspError::ComputationsExhausted => StatusCode::CONFLICT,
            HspError::Compute(_) => StatusCode::UNPROCESSABLE_ENTITY,
            HspError::Transport(_) => StatusCode::BAD_GATEWAY,
            HspError::Store(_) | HspError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

type ClientHandle = Arc<tokio::sync::Mutex<common::hsp::HspClient>>;

fn client(state: &AppState, id: &str) -> Result<ClientHandle, ApiError> {
    state.client(id).ok_or_else(|| ApiError::unknown_client(id))
}

/* ---------------- handlers HTTP ---------------- */

// Abre sesión; espera si otro cliente tiene la sesión activa
async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    // si la conexión se corta mientras espera turno, soltar el cliente
    // libera su lugar en la cola
    let mut hsp_client = state.cluster.client();
    let session = hsp_client
        .login(req.profile.clone(), req.environment)
        .await?;

    let client_id = uuid::Uuid::new_v4().to_string();
    let handle: ClientHandle = Arc::new(tokio::sync::Mutex::new(hsp_client));
    common::lock(&state.clients).insert(client_id.clone(), handle);
    info!(
        "cliente {} ({}) en la sesión {}",
        client_id, req.profile.name, session.session_id
    );
    Ok(Json(LoginResponse { client_id, session }))
}

async fn logout(
    State(state): State<AppState>,
    Json(req): Json<LogoutRequest>,
) -> Result<Json<LogoutResponse>, ApiError> {
    let handle = client(&state, &req.client_id)?;
    let invoice = handle.lock().await.logout().await?;
    common::lock(&state.clients).remove(&req.client_id);
    info!(
        "cliente {} cerró la sesión {} ({} tareas)",
        req.client_id,
        invoice.session_id,
        invoice.tasks_executed()
    );
    Ok(Json(LogoutResponse { invoice }))
}

// Ejecuta un cómputo y responde con su valor
async fn compute(
    State(state): State<AppState>,
    Json(req): Json<ComputeRequest>,
) -> Result<Json<ComputeResponse>, ApiError> {
    let handle = client(&state, &req.client_id)?;
    let value = handle.lock().await.compute(req.task.into_task()).await?;
    Ok(Json(ComputeResponse { value }))
}

async fn set_computation(
    State(state): State<AppState>,
    Json(req): Json<ComputeRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let handle = client(&state, &req.client_id)?;
    let result_id = handle.lock().await.set_computation(req.task.into_task())?;
    Ok(Json(SubmitResponse { result_id }))
}

async fn next_result(
    State(state): State<AppState>,
    Query(q): Query<ClientQuery>,
) -> Result<Json<NextResultResponse>, ApiError> {
    let handle = client(&state, &q.client_id)?;
    let result = handle.lock().await.get_result().await?;
    Ok(Json(NextResultResponse { result }))
}

async fn is_complete(
    State(state): State<AppState>,
    Path((session_id, computation_id)): Path<(i64, i16)>,
    Query(q): Query<ClientQuery>,
) -> Result<Json<CompleteResponse>, ApiError> {
    let handle = client(&state, &q.client_id)?;
    let result_id = ResultId {
        session_id,
        computation_id,
    };
    let complete = handle.lock().await.is_complete(&result_id)?;
    Ok(Json(CompleteResponse { complete }))
}

async fn list_servers(State(state): State<AppState>) -> Json<ServersResponse> {
    Json(ServersResponse {
        root: state.cluster.root(),
        servers: state.cluster.hsp().servers(),
    })
}

async fn save_state(
    State(state): State<AppState>,
    Json(req): Json<StateRequest>,
) -> Result<StatusCode, ApiError> {
    state.cluster.hsp().save_state(&req.set_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn load_state(
    State(state): State<AppState>,
    Json(req): Json<StateRequest>,
) -> Result<StatusCode, ApiError> {
    state.cluster.hsp().load_state(&req.set_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn shutdown(State(state): State<AppState>) -> StatusCode {
    warn!("apagado pedido por HTTP");
    state.cluster.shutdown();
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use common::cluster::{ClusterConfig, LocalCluster};
    use common::TaskRegistry;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn app() -> Router {
        let cluster = LocalCluster::start(ClusterConfig::default(), TaskRegistry::with_builtins())
            .await
            .unwrap();
        build_router(AppState::new(cluster))
    }

    async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn login_compute_logout_por_http() {
        let app = app().await;

        let (status, body) =
            post_json(&app, "/api/v1/login", json!({"profile": {"name": "http"}})).await;
        assert_eq!(status, StatusCode::OK);
        let client_id = body["client_id"].as_str().unwrap().to_string();

        let (status, body) = post_json(
            &app,
            "/api/v1/compute",
            json!({"client_id": client_id, "task": {"kind": "fib", "payload": {"n": 7}}}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"], json!(13));

        let (status, body) =
            post_json(&app, "/api/v1/logout", json!({"client_id": client_id})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["invoice"]["computations"], json!(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cliente_desconocido_es_404() {
        let app = app().await;
        let (status, body) =
            post_json(&app, "/api/v1/logout", json!({"client_id": "nadie"})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nadie"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn get_result_sin_computos_es_409() {
        let app = app().await;
        let (_, body) =
            post_json(&app, "/api/v1/login", json!({"profile": {"name": "http"}})).await;
        let client_id = body["client_id"].as_str().unwrap().to_string();

        let req = Request::builder()
            .uri(format!("/api/v1/results/next?client_id={}", client_id))
            .body(Body::empty())
            .unwrap();
        let res = app.clone().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);
    }
}
