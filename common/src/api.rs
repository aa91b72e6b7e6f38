// Tipos de la API HTTP del master hacia los clientes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::environment::{ClientProfile, Environment, SessionInfo};
use crate::results::{ComputationResult, ResultId};
use crate::stats::Invoice;
use crate::task::Task;
use crate::topology::NeighborInfo;

pub type ClientId = String;

/// Cómputo tal como lo manda el cliente.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub kind: String,
    pub payload: Value,
    /// Clase de servicio externo que debe ejecutarla
    #[serde(default)]
    pub service: Option<String>,
}

impl TaskSpec {
    pub fn into_task(self) -> Task {
        match self.service {
            Some(service) => Task::external(self.kind, self.payload, service),
            None => Task::new(self.kind, self.payload),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub profile: ClientProfile,
    #[serde(default)]
    pub environment: Environment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub client_id: ClientId,
    pub session: SessionInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeRequest {
    pub client_id: ClientId,
    pub task: TaskSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeResponse {
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub result_id: ResultId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientQuery {
    pub client_id: ClientId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextResultResponse {
    pub result: ComputationResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutRequest {
    pub client_id: ClientId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutResponse {
    pub invoice: Invoice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRequest {
    pub set_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServersResponse {
    pub root: Option<String>,
    pub servers: Vec<NeighborInfo>,
}

/// Cuerpo de toda respuesta de error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
