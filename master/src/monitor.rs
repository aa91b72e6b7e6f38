use crate::state::AppState;
use common::config;
use tracing::debug;

// Pinga periódicamente a los hosts de cada servidor local. Los que no
// contestan se dan de baja y sus tareas vuelven a la cola.
pub async fn monitor_hosts(state: AppState) {
    loop {
        tokio::time::sleep(config::liveness_interval()).await;

        for server in state.cluster.servers() {
            debug!(
                "chequeando {} hosts de {}",
                server.hosts().len(),
                server.id()
            );
            server.probe_hosts().await;
        }
    }
}
