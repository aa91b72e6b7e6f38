use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::config;
use crate::error::HspError;
use crate::host::{Host, HostConfig};
use crate::hsp::{Hsp, HspClient};
use crate::network::Network;
use crate::registry::TaskRegistry;
use crate::store::{MemoryStateStore, StateStore};
use crate::task_server::{TaskServer, TaskServerConfig};
use crate::{lock, NodeId};

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub servers: usize,
    pub hosts_per_server: usize,
    pub processors: usize,
    pub cacheable_kind: Option<String>,
    pub prefetch: bool,
    /// `host:puerto` que se agrega a los ids para que otros procesos los
    /// alcancen por HTTP
    pub advertise: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            servers: 1,
            hosts_per_server: 1,
            processors: config::DEFAULT_WORKER_PROCESSORS,
            cacheable_kind: None,
            prefetch: true,
            advertise: None,
        }
    }
}

/// Hsp, servidores de tareas y hosts en un mismo proceso.
pub struct LocalCluster {
    config: ClusterConfig,
    network: Network,
    registry: Arc<TaskRegistry>,
    store: Arc<dyn StateStore>,
    hsp: Arc<Hsp>,
    servers: Mutex<Vec<Arc<TaskServer>>>,
    hosts: Mutex<Vec<Arc<Host>>>,
    next_server: AtomicUsize,
    next_host: AtomicUsize,
}

impl LocalCluster {
    /// Cluster en memoria, con estado guardado en memoria.
    pub async fn start(config: ClusterConfig, registry: TaskRegistry) -> Result<Self, HspError> {
        Self::start_on(
            Network::new(),
            Arc::new(registry),
            Arc::new(MemoryStateStore::new()),
            config,
        )
        .await
    }

    pub async fn start_on(
        network: Network,
        registry: Arc<TaskRegistry>,
        store: Arc<dyn StateStore>,
        config: ClusterConfig,
    ) -> Result<Self, HspError> {
        let hsp_id = node_id("hsp", config.advertise.as_deref());
        let hsp = Hsp::start(network.clone(), hsp_id, store.clone());

        let cluster = Self {
            config: config.clone(),
            network,
            registry,
            store,
            hsp,
            servers: Mutex::new(Vec::new()),
            hosts: Mutex::new(Vec::new()),
            next_server: AtomicUsize::new(0),
            next_host: AtomicUsize::new(0),
        };

        for _ in 0..config.servers {
            let server = cluster.add_server(None).await?;
            for _ in 0..config.hosts_per_server {
                cluster.add_host(server.id()).await?;
            }
        }
        info!(
            "cluster listo: {} servidores, {} hosts",
            config.servers,
            config.servers * config.hosts_per_server
        );
        Ok(cluster)
    }

    /// Suma un servidor de tareas. Con `service` queda como servidor
    /// externo de esa clase.
    pub async fn add_server(&self, service: Option<String>) -> Result<Arc<TaskServer>, HspError> {
        let n = self.next_server.fetch_add(1, Ordering::SeqCst);
        let id = node_id(&format!("ts-{}", n), self.config.advertise.as_deref());
        let config = match service {
            Some(service) => TaskServerConfig::external(id, self.hsp.id().clone(), service),
            None => TaskServerConfig::new(id, self.hsp.id().clone()),
        };
        let server = TaskServer::start(
            self.network.clone(),
            self.registry.clone(),
            self.store.clone(),
            config,
        )
        .await?;
        lock(&self.servers).push(server.clone());
        Ok(server)
    }

    pub async fn add_host(&self, task_server: &str) -> Result<Arc<Host>, HspError> {
        let n = self.next_host.fetch_add(1, Ordering::SeqCst);
        let id = node_id(&format!("host-{}", n), self.config.advertise.as_deref());
        let config = HostConfig {
            processors: self.config.processors,
            cacheable_kind: self.config.cacheable_kind.clone(),
            prefetch: self.config.prefetch,
            ..HostConfig::new(id, task_server)
        };
        let host = Host::start(self.network.clone(), self.registry.clone(), config).await?;
        lock(&self.hosts).push(host.clone());
        Ok(host)
    }

    pub fn client(&self) -> HspClient {
        self.hsp.client()
    }

    pub fn hsp(&self) -> &Arc<Hsp> {
        &self.hsp
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn servers(&self) -> Vec<Arc<TaskServer>> {
        lock(&self.servers).clone()
    }

    pub fn server(&self, id: &str) -> Option<Arc<TaskServer>> {
        lock(&self.servers).iter().find(|s| s.id() == id).cloned()
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        lock(&self.hosts).clone()
    }

    /// Id del servidor raíz, al que se unen los workers remotos.
    pub fn root(&self) -> Option<NodeId> {
        self.hsp.root()
    }

    pub fn shutdown(&self) {
        self.hsp.shutdown();
    }
}

fn node_id(name: &str, advertise: Option<&str>) -> NodeId {
    match advertise {
        Some(authority) => format!("{}@{}", name, authority),
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_con_y_sin_direccion() {
        assert_eq!(node_id("ts-0", None), "ts-0");
        assert_eq!(node_id("ts-0", Some("10.0.0.1:8080")), "ts-0@10.0.0.1:8080");
    }

    #[tokio::test]
    async fn arranca_servidores_y_hosts() {
        let config = ClusterConfig {
            servers: 2,
            hosts_per_server: 2,
            ..Default::default()
        };
        let cluster = LocalCluster::start(config, TaskRegistry::with_builtins())
            .await
            .unwrap();

        assert_eq!(cluster.servers().len(), 2);
        assert_eq!(cluster.hosts().len(), 4);
        assert_eq!(cluster.root(), Some("ts-0".to_string()));
        for s in cluster.servers() {
            assert_eq!(s.hosts().len(), 2);
        }
    }
}
