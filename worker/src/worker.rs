use anyhow::Result;
use common::config;
use common::host::{Host, HostConfig};
use common::http::mail_router;
use common::network::Network;
use common::TaskRegistry;
use reqwest::Client;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio::time::sleep;
use tracing::{info, warn};

const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Loop principal del worker.
/// - Levanta el endpoint de correo para que el servidor de tareas le hable.
/// - Espera a que el master esté arriba.
/// - Registra WORKER_HOSTS hosts en WORKER_TASK_SERVER.
/// - Termina cuando todos sus hosts recibieron Shutdown.
pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("worker=debug,common=info,reqwest=info")
        .init();

    let network = Network::new();
    let registry = Arc::new(TaskRegistry::with_builtins());

    let listener = TcpListener::bind(config::worker_bind()).await?;
    info!("worker escuchando en {}", listener.local_addr()?);
    let app = mail_router(network.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("servidor HTTP del worker terminó: {}", e);
        }
    });

    wait_for_master(&config::master_base_url()).await;

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let advertise = config::worker_advertise();
    let task_server = config::worker_task_server();

    let mut hosts = Vec::new();
    for n in 0..config::worker_hosts() {
        let id = host_id(&hostname, n, &advertise);
        let host = register_host(&network, &registry, id, &task_server).await;
        hosts.push(host);
    }
    info!(
        "worker {} con {} hosts unidos a {}",
        hostname,
        hosts.len(),
        task_server
    );

    // los hosts se desconectan solos al recibir Shutdown
    while !network.local_nodes().is_empty() {
        sleep(Duration::from_secs(1)).await;
    }
    let executed: u64 = hosts.iter().map(|h| h.executed()).sum();
    info!("worker apagado, {} tareas ejecutadas", executed);
    Ok(())
}

fn host_id(hostname: &str, n: usize, advertise: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let name = if hostname.is_empty() { "host" } else { hostname };
    format!("{}-{}-{}@{}", name, n, &suffix[..8], advertise)
}

async fn wait_for_master(base_url: &str) {
    let client = Client::new();
    let url = format!("{}/health", base_url);
    loop {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => return,
            Ok(resp) => warn!("master respondió {}, reintentando...", resp.status()),
            Err(e) => warn!("master no disponible ({}), reintentando...", e),
        }
        sleep(RETRY_DELAY).await;
    }
}

async fn register_host(
    network: &Network,
    registry: &Arc<TaskRegistry>,
    id: String,
    task_server: &str,
) -> Arc<Host> {
    loop {
        let config = HostConfig::from_env(id.clone(), task_server);
        match Host::start(network.clone(), registry.clone(), config).await {
            Ok(host) => return host,
            Err(e) => {
                warn!("no se pudo registrar {} en {}: {}", id, task_server, e);
                sleep(RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_del_host_es_alcanzable_por_http() {
        let id = host_id("nodo", 3, "10.0.0.5:9090");
        assert!(id.starts_with("nodo-3-"));
        assert_eq!(common::network::remote_authority(&id), Some("10.0.0.5:9090"));
    }
}
