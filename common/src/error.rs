use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task_id::TaskId;
use crate::NodeId;

/// Llamadas del cliente fuera de orden.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("el cliente no ha iniciado sesión")]
    NotLoggedIn,
    #[error("el cliente ya inició sesión")]
    AlreadyLoggedIn,
    #[error("no hay cómputo solicitado")]
    NoComputationRequested,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("nodo {0} desconocido")]
    Unreachable(NodeId),
    #[error("nodo {0} desconectado")]
    Disconnected(NodeId),
    #[error("timeout hablando con {to} ({after_ms} ms)")]
    Timeout { to: NodeId, after_ms: u64 },
    #[error("error HTTP con {to}: {message}")]
    Http { to: NodeId, message: String },
    #[error("respuesta inesperada de {to}: {message}")]
    Rejected { to: NodeId, message: String },
}

/// Falla de un cómputo. Viaja dentro de los resultados hasta el Hsp.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ComputeError {
    #[error("la tarea {task_id} falló: {message}")]
    Task { task_id: TaskId, message: String },
    #[error("no hay lógica registrada para el tipo {kind}")]
    UnknownKind { kind: String },
    #[error("no hay servidor para tareas {service}")]
    NoProvider { service: String },
    #[error("la tarea {task_id} pidió otra entrada y no quedan entradas pendientes")]
    NoMoreInputs { task_id: TaskId },
    #[error("la sesión terminó antes de entregar el resultado")]
    SessionEnded,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum HspError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Compute(#[from] ComputeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("la sesión agotó los ids de cómputo")]
    ComputationsExhausted,
    #[error("{0}")]
    Unexpected(String),
}
