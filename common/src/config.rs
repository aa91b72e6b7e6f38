//! Configuración por variables de entorno, con valores por defecto para
//! correr todo local.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HOST_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SERVER_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_LIVENESS_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_WORKER_PROCESSORS: usize = 2;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

/// - En Docker: MASTER_URL=http://master:8080
/// - Local: http://localhost:8080
pub fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

pub fn master_bind() -> String {
    env::var("MASTER_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
}

/// `host:puerto` con el que los workers llegan al master.
pub fn master_advertise() -> String {
    env::var("MASTER_ADVERTISE").unwrap_or_else(|_| "localhost:8080".to_string())
}

pub fn worker_bind() -> String {
    env::var("WORKER_BIND").unwrap_or_else(|_| "0.0.0.0:9090".to_string())
}

pub fn worker_advertise() -> String {
    env::var("WORKER_ADVERTISE").unwrap_or_else(|_| "localhost:9090".to_string())
}

/// Servidor de tareas al que se unen los hosts de un worker.
pub fn worker_task_server() -> String {
    env::var("WORKER_TASK_SERVER").unwrap_or_else(|_| format!("ts-0@{}", master_advertise()))
}

pub fn worker_hosts() -> usize {
    env_or("WORKER_HOSTS", 1)
}

pub fn worker_processors() -> usize {
    env_or("WORKER_PROCESSORS", DEFAULT_WORKER_PROCESSORS)
}

pub fn worker_cacheable_kind() -> Option<String> {
    env::var("WORKER_CACHEABLE_KIND").ok().filter(|s| !s.is_empty())
}

pub fn worker_prefetch() -> bool {
    env_or("WORKER_PREFETCH", true)
}

/// Servidores de tareas que levanta el master.
pub fn master_task_servers() -> usize {
    env_or("MASTER_TASK_SERVERS", 1)
}

/// Hosts en proceso por servidor (0 = sólo workers remotos).
pub fn master_local_hosts() -> usize {
    env_or("MASTER_LOCAL_HOSTS", 0)
}

pub fn host_timeout() -> Duration {
    Duration::from_millis(env_or("HOST_TIMEOUT_MS", DEFAULT_HOST_TIMEOUT_MS))
}

pub fn server_timeout() -> Duration {
    Duration::from_millis(env_or("SERVER_TIMEOUT_MS", DEFAULT_SERVER_TIMEOUT_MS))
}

pub fn liveness_interval() -> Duration {
    Duration::from_secs(env_or("LIVENESS_INTERVAL_SECS", DEFAULT_LIVENESS_INTERVAL_SECS))
}

/// Directorio de los snapshots de save/load. Sin valor se guardan en
/// memoria.
pub fn state_dir() -> Option<PathBuf> {
    env::var("STATE_DIR").ok().map(PathBuf::from)
}
