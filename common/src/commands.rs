use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::environment::{SessionInfo, Shared};
use crate::results::{ComputationResult, TaskInfo};
use crate::stats::ServiceTaskStats;
use crate::task::{ArgIndex, Task};
use crate::task_id::TaskId;
use crate::topology::{Direction, NeighborInfo, Placement};
use crate::NodeId;

/// Buzón de un nodo. Cada departamento procesa sus comandos en orden de
/// llegada y en paralelo con los demás.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Department {
    /// Comandos de control
    Asap,
    /// Pedidos de tareas (pueden bloquear)
    Requests,
    /// Resultados del host interno
    Internal,
    /// Ejecución de tareas
    Compute,
}

/// Mensajes entre nodos. El remitente viaja aparte.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    // ---- servidor de tareas ----
    Spawn {
        task: Task,
    },
    SetArg {
        task_id: TaskId,
        index: ArgIndex,
        value: Value,
        critical_path_ms: u64,
    },
    ProcessResult {
        info: TaskInfo,
    },
    RequestTask,
    RequestTasks {
        factor: usize,
    },
    ReceiveTasks {
        tasks: Vec<Task>,
    },
    /// El propio servidor se avisa que su cola quedó vacía
    IssueRequestTasks,
    LoginClient {
        info: SessionInfo,
    },
    LogoutClient,
    RegisterHost,
    UnregisterHost {
        host: NodeId,
    },
    RegisterNeighbor {
        neighbor: NeighborInfo,
        direction: Direction,
    },
    AddServiceTaskStats {
        stats: ServiceTaskStats,
    },
    UpdateProviders {
        providers: HashMap<String, NodeId>,
    },
    Pause,
    SaveState {
        set_id: String,
    },
    LoadState {
        set_id: String,
    },

    // ---- servidor y host ----
    KillTask {
        task_id: TaskId,
    },
    SetShared {
        shared: Shared,
    },
    Ping,
    Shutdown,

    // ---- host ----
    ExecuteTask {
        task: Task,
        input_index: Option<u16>,
    },

    // ---- hsp ----
    RegisterTaskServer {
        service: Option<String>,
    },
    PutResult {
        result: ComputationResult,
    },
    Ready,

    /// Varios comandos que se entregan en orden
    Batch {
        commands: Vec<Command>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Spawn { .. } => "spawn",
            Command::SetArg { .. } => "set_arg",
            Command::ProcessResult { .. } => "process_result",
            Command::RequestTask => "request_task",
            Command::RequestTasks { .. } => "request_tasks",
            Command::ReceiveTasks { .. } => "receive_tasks",
            Command::IssueRequestTasks => "issue_request_tasks",
            Command::LoginClient { .. } => "login_client",
            Command::LogoutClient => "logout_client",
            Command::RegisterHost => "register_host",
            Command::UnregisterHost { .. } => "unregister_host",
            Command::RegisterNeighbor { .. } => "register_neighbor",
            Command::AddServiceTaskStats { .. } => "add_service_task_stats",
            Command::UpdateProviders { .. } => "update_providers",
            Command::Pause => "pause",
            Command::SaveState { .. } => "save_state",
            Command::LoadState { .. } => "load_state",
            Command::KillTask { .. } => "kill_task",
            Command::SetShared { .. } => "set_shared",
            Command::Ping => "ping",
            Command::Shutdown => "shutdown",
            Command::ExecuteTask { .. } => "execute_task",
            Command::RegisterTaskServer { .. } => "register_task_server",
            Command::PutResult { .. } => "put_result",
            Command::Ready => "ready",
            Command::Batch { .. } => "batch",
        }
    }
}

/// Respuesta de una llamada sincrónica.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Ack,
    Pong,
    Session {
        info: Option<SessionInfo>,
        hsp: NodeId,
    },
    Placement {
        placement: Placement,
    },
    Rejected {
        reason: String,
    },
}
