use std::sync::{Mutex, MutexGuard};

pub mod api;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod environment;
pub mod error;
pub mod failure;
pub mod host;
pub mod hsp;
pub mod http;
pub mod killed;
pub mod neighbor;
pub mod network;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod results;
pub mod session;
pub mod stats;
pub mod store;
pub mod task;
pub mod task_id;
pub mod task_server;
pub mod topology;

/// Id de un nodo en la red. `nombre@host:puerto` si vive en otro proceso.
pub type NodeId = String;

pub use environment::{Environment, SessionInfo, Shared};
pub use error::{ComputeError, HspError, ProtocolError, TransportError};
pub use registry::{ExecContext, Outcome, TaskLogic, TaskRegistry};
pub use results::ComputationResult;
pub use task::Task;
pub use task_id::TaskId;

/// Toma el lock aunque otro hilo haya entrado en pánico con él.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
