use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::ComputeError;
use crate::task::{ArgIndex, Task};
use crate::task_id::TaskId;
use crate::NodeId;

/// Valor que un host entrega directo en el TaskInfo cuando el sucesor vive
/// en su mismo servidor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Successor {
    pub task_id: TaskId,
    pub index: ArgIndex,
    pub value: Value,
}

/// Reporte de una tarea terminada por un host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub host: NodeId,
    pub task_id: TaskId,
    pub kind: String,
    pub execute_ms: u64,
    pub critical_path_ms: u64,
    /// Subtareas + compose (última), si la tarea se descompuso
    pub children: Option<Vec<Task>>,
    pub successor: Option<Successor>,
}

impl TaskInfo {
    pub fn new(host: NodeId, task: &Task, execute_ms: u64) -> Self {
        Self {
            host,
            task_id: task.task_id.clone(),
            kind: task.kind.clone(),
            execute_ms,
            critical_path_ms: task.predecessor_critical_path_ms + execute_ms,
            children: None,
            successor: None,
        }
    }
}

/// Identifica un cómputo de la sesión (sesión + número de cómputo).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultId {
    pub session_id: i64,
    pub computation_id: i16,
}

impl From<&TaskId> for ResultId {
    fn from(id: &TaskId) -> Self {
        Self {
            session_id: id.session_id(),
            computation_id: id.computation_id(),
        }
    }
}

impl fmt::Display for ResultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.session_id, self.computation_id)
    }
}

/// Resultado final de un cómputo: el valor de la raíz o la falla que lo
/// abortó.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationResult {
    pub result_id: ResultId,
    pub task_id: TaskId,
    pub outcome: Result<Value, ComputeError>,
    pub critical_path_ms: u64,
}

impl ComputationResult {
    pub fn value(task_id: TaskId, value: Value, critical_path_ms: u64) -> Self {
        Self {
            result_id: ResultId::from(&task_id),
            task_id,
            outcome: Ok(value),
            critical_path_ms,
        }
    }

    pub fn failure(task_id: TaskId, error: ComputeError) -> Self {
        Self {
            result_id: ResultId::from(&task_id),
            task_id,
            outcome: Err(error),
            critical_path_ms: 0,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.outcome.is_err()
    }
}
