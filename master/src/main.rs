mod state;
mod handlers;
mod monitor;

use crate::state::AppState;
use common::cluster::{ClusterConfig, LocalCluster};
use common::config;
use common::http::mail_router;
use common::network::Network;
use common::store::{FileStateStore, MemoryStateStore, StateStore};
use common::TaskRegistry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("master=debug,common=info,axum=info")
        .init();

    let store: Arc<dyn StateStore> = match config::state_dir() {
        Some(dir) => {
            info!("estado guardado en {}", dir.display());
            Arc::new(FileStateStore::new(dir))
        }
        None => Arc::new(MemoryStateStore::new()),
    };

    let cluster_config = ClusterConfig {
        servers: config::master_task_servers(),
        hosts_per_server: config::master_local_hosts(),
        processors: config::worker_processors(),
        cacheable_kind: config::worker_cacheable_kind(),
        prefetch: config::worker_prefetch(),
        advertise: Some(config::master_advertise()),
    };
    let network = Network::new();
    let cluster = LocalCluster::start_on(
        network.clone(),
        Arc::new(TaskRegistry::with_builtins()),
        store,
        cluster_config,
    )
    .await?;
    info!("servidor raíz: {:?}", cluster.root());

    let state = AppState::new(cluster);

    // API de clientes + correo entre nodos
    let app = handlers::build_router(state.clone())
        .merge(mail_router(network))
        .layer(tower_http::trace::TraceLayer::new_for_http());

    // chequeo de hosts en segundo plano
    let monitor_state = state.clone();
    tokio::spawn(async move {
        monitor::monitor_hosts(monitor_state).await;
    });

    let listener = TcpListener::bind(config::master_bind()).await?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
