use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::commands::{Command, Department, Reply};
use crate::config;
use crate::environment::{SessionInfo, Shared};
use crate::error::{HspError, StoreError};
use crate::host::Host;
use crate::neighbor::NeighborManager;
use crate::network::{Network, Role, Service};
use crate::registry::TaskRegistry;
use crate::results::TaskInfo;
use crate::session::{Assignment, Routing, Session, SessionSnapshot};
use crate::stats::{HostTaskStats, ServiceTaskStats};
use crate::store::StateStore;
use crate::task::Task;
use crate::task_id::TaskId;
use crate::topology::Placement;
use crate::{lock, NodeId};

#[derive(Debug, Clone)]
pub struct TaskServerConfig {
    pub id: NodeId,
    pub hsp: NodeId,
    /// Clase de servicio externo que atiende (None = parte de la malla)
    pub service: Option<String>,
    pub internal_processors: usize,
}

impl TaskServerConfig {
    pub fn new(id: impl Into<NodeId>, hsp: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            hsp: hsp.into(),
            service: None,
            internal_processors: 1,
        }
    }

    pub fn external(id: impl Into<NodeId>, hsp: impl Into<NodeId>, service: impl Into<String>) -> Self {
        Self {
            service: Some(service.into()),
            ..Self::new(id, hsp)
        }
    }
}

struct HostRecord {
    internal: bool,
    tasks: HashSet<TaskId>,
    stats: HostTaskStats,
}

impl HostRecord {
    fn new(host: &str, internal: bool) -> Self {
        Self {
            internal,
            tasks: HashSet::new(),
            stats: HostTaskStats::new(host.to_string(), internal),
        }
    }
}

/// Logout en curso: faltan las estadísticas de `remaining` hijos.
struct LogoutJoin {
    remaining: usize,
    stats: ServiceTaskStats,
}

/// Servidor de tareas: dueño de una sesión, atiende a sus hosts y a sus
/// vecinos del overlay.
pub struct TaskServer {
    id: NodeId,
    hsp: NodeId,
    service: Option<String>,
    network: Network,
    session: Session,
    neighbors: Mutex<NeighborManager>,
    hosts: Mutex<HashMap<NodeId, HostRecord>>,
    internal_host: Arc<Host>,
    logout: Mutex<Option<LogoutJoin>>,
    /// Vecinos a los que ya se les pidió tareas y no contestaron
    diffusion_pending: Mutex<HashSet<NodeId>>,
    store: Arc<dyn StateStore>,
}

impl TaskServer {
    /// Registra el servidor en la red, arranca su host interno y se ubica
    /// en el overlay a través del Hsp.
    pub async fn start(
        network: Network,
        registry: Arc<TaskRegistry>,
        store: Arc<dyn StateStore>,
        config: TaskServerConfig,
    ) -> Result<Arc<Self>, HspError> {
        let internal_host = Host::start_internal(
            network.clone(),
            registry.clone(),
            &config.id,
            &config.hsp,
            config.internal_processors,
        );
        let routing = Routing {
            hsp: config.hsp.clone(),
            service: config.service.clone(),
            internal_host: Some(internal_host.id().clone()),
            ..Default::default()
        };

        let mut hosts = HashMap::new();
        hosts.insert(
            internal_host.id().clone(),
            HostRecord::new(internal_host.id(), true),
        );

        let server = Arc::new(Self {
            id: config.id.clone(),
            hsp: config.hsp.clone(),
            service: config.service.clone(),
            session: Session::new(config.id.clone(), network.clone(), registry, routing),
            neighbors: Mutex::new(NeighborManager::detached(config.id.clone())),
            hosts: Mutex::new(hosts),
            internal_host,
            logout: Mutex::new(None),
            diffusion_pending: Mutex::new(HashSet::new()),
            store,
            network: network.clone(),
        });
        network.register(
            config.id.clone(),
            Role::TaskServer,
            server.clone(),
            &[
                (Department::Asap, 1),
                (Department::Requests, 1),
                (Department::Internal, 1),
            ],
        );

        let reply = network
            .call(
                &config.id,
                &config.hsp,
                Command::RegisterTaskServer {
                    service: config.service.clone(),
                },
                config::server_timeout(),
            )
            .await?;
        match reply {
            Reply::Placement { placement } => server.join(placement),
            other => {
                network.disconnect(&config.id);
                return Err(HspError::Unexpected(format!(
                    "registro de {} rechazado: {:?}",
                    config.id, other
                )));
            }
        }
        Ok(server)
    }

    fn join(&self, placement: Placement) {
        info!(
            "servidor {} ubicado en {} (raíz externa: {:?})",
            self.id,
            placement.me.point,
            placement.root.as_ref().map(|r| &r.id)
        );
        *lock(&self.neighbors) = NeighborManager::from_placement(&placement);
        self.session.set_root(placement.root.map(|r| r.id));
        self.session.set_providers(placement.providers);
        if let Some(info) = placement.session {
            self.session.login(info.clone());
            self.internal_host_login(info);
        }
    }

    fn internal_host_login(&self, info: SessionInfo) {
        let _ = self.network.send_to(
            &self.id,
            self.internal_host.id(),
            Department::Asap,
            Command::LoginClient { info },
        );
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn neighbors(&self) -> NeighborManager {
        lock(&self.neighbors).clone()
    }

    /// Hosts registrados, sin el interno.
    pub fn hosts(&self) -> Vec<NodeId> {
        let mut hosts: Vec<NodeId> = lock(&self.hosts)
            .iter()
            .filter(|(_, r)| !r.internal)
            .map(|(id, _)| id.clone())
            .collect();
        hosts.sort();
        hosts
    }

    /// Tareas que el servidor cree que están en `host`.
    pub fn assigned_to(&self, host: &str) -> Vec<TaskId> {
        lock(&self.hosts)
            .get(host)
            .map(|r| r.tasks.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Pinga a los hosts externos. Los que no contestan pasan por el
    /// manejador de fallas de la red.
    pub async fn probe_hosts(&self) {
        for host in self.hosts() {
            match self
                .network
                .call(&self.id, &host, Command::Ping, config::host_timeout())
                .await
            {
                Ok(Reply::Pong) => {}
                Ok(other) => warn!("{}: {} contestó {:?} a un ping", self.id, host, other),
                Err(e) => warn!("{}: host {} no responde: {}", self.id, host, e),
            }
        }
    }

    fn record(&self, assignments: Vec<Assignment>) {
        if assignments.is_empty() {
            return;
        }
        let mut hosts = lock(&self.hosts);
        for a in assignments {
            if let Some(r) = hosts.get_mut(&a.host) {
                r.tasks.insert(a.task_id);
            }
        }
    }

    fn process_result(&self, info: TaskInfo) {
        let current = self.session.session_id() == Some(info.task_id.session_id());
        if let Some(r) = lock(&self.hosts).get_mut(&info.host) {
            r.tasks.remove(&info.task_id);
            if current {
                r.stats.record(info.execute_ms);
            }
        }
        let assigned = self.session.process_result(info);
        self.record(assigned);
    }

    async fn serve_host(&self, host: &str) {
        if !lock(&self.hosts).contains_key(host) {
            warn!("{}: pedido de tarea de un host no registrado {}", self.id, host);
            return;
        }

        let task = self.session.request_task(host).await;
        let registered = match lock(&self.hosts).get_mut(host) {
            Some(r) => {
                r.tasks.insert(task.task_id.clone());
                true
            }
            None => false,
        };
        if !registered {
            info!("{}: {} se fue, {} vuelve a la cola", self.id, host, task.task_id);
            self.session.unassign(&task.task_id);
            return;
        }

        let input_index = task.trigger;
        let _ = self
            .network
            .send(&self.id, host, Command::ExecuteTask { task, input_index });
    }

    async fn serve_neighbor(&self, neighbor: &str, factor: usize) {
        // los demás pedidos en espera compiten por las mismas tareas
        let factor = factor.max(2) + self.network.pending(&self.id, Department::Requests);
        let tasks = self.session.request_tasks(factor).await;
        debug!("{}: {} tareas para {}", self.id, tasks.len(), neighbor);
        let _ = self
            .network
            .send(&self.id, neighbor, Command::ReceiveTasks { tasks });
    }

    /// La cola quedó vacía: pide tareas a los vecinos que no tengan un
    /// pedido pendiente.
    fn issue_request_tasks(&self) {
        let neighbors = lock(&self.neighbors).neighbors();
        let targets: Vec<NodeId> = {
            let mut pending = lock(&self.diffusion_pending);
            neighbors
                .into_iter()
                .filter(|n| pending.insert(n.clone()))
                .collect()
        };
        for n in targets {
            debug!("{}: pido tareas a {}", self.id, n);
            let _ = self
                .network
                .send(&self.id, &n, Command::RequestTasks { factor: 2 });
        }
    }

    fn receive_tasks(&self, from: &str, tasks: Vec<Task>) {
        lock(&self.diffusion_pending).remove(from);
        debug!("{}: llegan {} tareas de {}", self.id, tasks.len(), from);
        self.session.receive_tasks(tasks);
    }

    /// Login en este nodo, después en los hijos del árbol y los hosts.
    async fn login(&self, info: SessionInfo) {
        self.session.login(info.clone());
        for r in lock(&self.hosts).values_mut() {
            r.tasks.clear();
            r.stats = HostTaskStats::new(r.stats.host.clone(), r.internal);
        }
        lock(&self.diffusion_pending).clear();
        *lock(&self.logout) = None;

        let children = lock(&self.neighbors).children();
        for child in children {
            let command = Command::LoginClient { info: info.clone() };
            if let Err(e) = self
                .network
                .call(&self.id, &child, command, config::server_timeout())
                .await
            {
                warn!("{}: login no llegó a {}: {}", self.id, child, e);
            }
        }

        let hosts: Vec<(NodeId, bool)> = lock(&self.hosts)
            .iter()
            .map(|(id, r)| (id.clone(), r.internal))
            .collect();
        for (host, internal) in hosts {
            let timeout = if internal {
                config::server_timeout()
            } else {
                config::host_timeout()
            };
            let command = Command::LoginClient { info: info.clone() };
            if let Err(e) = self.network.call(&self.id, &host, command, timeout).await {
                warn!("{}: login no llegó al host {}: {}", self.id, host, e);
            }
        }
    }

    fn logout(&self) {
        let hosts: Vec<HostTaskStats> = {
            let hosts = lock(&self.hosts);
            let mut stats: Vec<HostTaskStats> = hosts.values().map(|r| r.stats.clone()).collect();
            stats.sort_by(|a, b| a.host.cmp(&b.host));
            stats
        };
        let children = lock(&self.neighbors).children();
        let stats = ServiceTaskStats::new(self.id.clone(), hosts);

        if children.is_empty() {
            self.report_stats(stats);
            return;
        }
        *lock(&self.logout) = Some(LogoutJoin {
            remaining: children.len(),
            stats,
        });
        for child in children {
            let _ = self.network.send(&self.id, &child, Command::LogoutClient);
        }
    }

    fn add_child_stats(&self, child: ServiceTaskStats) {
        let done = {
            let mut join = lock(&self.logout);
            let Some(j) = join.as_mut() else {
                warn!("{}: estadísticas de {} fuera de un logout", self.id, child.task_server);
                return;
            };
            j.stats.add_child(child);
            j.remaining = j.remaining.saturating_sub(1);
            if j.remaining == 0 {
                join.take().map(|j| j.stats)
            } else {
                None
            }
        };
        if let Some(stats) = done {
            self.report_stats(stats);
        }
    }

    /// Manda las estadísticas del subárbol hacia arriba y cierra la sesión
    /// local.
    fn report_stats(&self, stats: ServiceTaskStats) {
        let parent = lock(&self.neighbors).parent().cloned();
        let to = parent.unwrap_or_else(|| self.hsp.clone());
        let _ = self
            .network
            .send(&self.id, &to, Command::AddServiceTaskStats { stats });

        let hosts: Vec<NodeId> = {
            let mut hosts = lock(&self.hosts);
            for r in hosts.values_mut() {
                r.tasks.clear();
                r.stats = HostTaskStats::new(r.stats.host.clone(), r.internal);
            }
            hosts.keys().cloned().collect()
        };
        for host in hosts {
            let _ = self.network.send(&self.id, &host, Command::LogoutClient);
        }
        self.session.clear();
        info!("{}: logout completo", self.id);
    }

    fn register_host(&self, host: &str) -> Reply {
        lock(&self.hosts)
            .entry(host.to_string())
            .or_insert_with(|| HostRecord::new(host, false));
        info!("{}: host {} registrado", self.id, host);
        Reply::Session {
            info: self.session.info(),
            hsp: self.hsp.clone(),
        }
    }

    fn unregister_host(&self, node: &str) {
        let removed = lock(&self.hosts).remove(node);
        if let Some(record) = removed {
            warn!(
                "{}: host {} dado de baja, {} tareas vuelven a la cola",
                self.id,
                node,
                record.tasks.len()
            );
            for task_id in record.tasks {
                self.session.unassign(&task_id);
            }
            return;
        }

        let neighbors = lock(&self.neighbors).all_peers();
        if neighbors.iter().any(|n| n == node) {
            // no hay re-enganche automático del subárbol
            warn!("{}: el servidor vecino {} no responde", self.id, node);
            lock(&self.diffusion_pending).remove(node);
        } else {
            debug!("{}: baja de un nodo desconocido {}", self.id, node);
        }
    }

    /// Reenvía a todos los vecinos y hosts menos al que avisó.
    fn broadcast(&self, from: &str, command: Command) {
        let mut targets = lock(&self.neighbors).all_peers();
        targets.extend(lock(&self.hosts).keys().cloned());
        for to in targets.iter().filter(|t| t.as_str() != from) {
            let _ = self.network.send(&self.id, to, command.clone());
        }
    }

    fn kill(&self, from: &str, task_id: TaskId) {
        if self.session.kill(task_id.clone()) {
            self.broadcast(from, Command::KillTask { task_id });
        }
    }

    fn set_shared(&self, from: &str, shared: Shared) {
        if self.session.offer_shared(shared.clone()) {
            debug!("{}: shared versión {}", self.id, shared.version);
            self.broadcast(from, Command::SetShared { shared });
        }
    }

    fn update_providers(&self, providers: HashMap<String, NodeId>) {
        self.session.set_providers(providers.clone());
        let children = lock(&self.neighbors).children();
        for child in children {
            let command = Command::UpdateProviders {
                providers: providers.clone(),
            };
            let _ = self.network.send(&self.id, &child, command);
        }
    }

    fn pause(&self) {
        self.network
            .pause(&self.id, &[Department::Requests, Department::Internal]);
        debug!("{}: en pausa", self.id);
        let _ = self.network.send(&self.id, &self.hsp, Command::Ready);
    }

    fn resume(&self) {
        self.network
            .resume(&self.id, &[Department::Requests, Department::Internal]);
    }

    fn save_state(&self, set_id: &str) -> Result<(), StoreError> {
        let snapshot = serde_json::to_value(self.session.snapshot())?;
        let result = self.store.save(&self.id, set_id, &snapshot);
        self.resume();
        result
    }

    fn load_state(&self, set_id: &str) -> Result<(), StoreError> {
        let loaded = self.store.load(&self.id, set_id);
        let result = match loaded {
            Ok(Some(value)) => {
                let snapshot: SessionSnapshot = serde_json::from_value(value)?;
                for r in lock(&self.hosts).values_mut() {
                    r.tasks.clear();
                }
                let info = snapshot.info.clone();
                self.session.restore(snapshot);
                if let Some(info) = info {
                    self.internal_host_login(info);
                }
                Ok(())
            }
            Ok(None) => {
                warn!("{}: no hay estado guardado en {}", self.id, set_id);
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.resume();
        result
    }

    fn shutdown(&self, from: &str) {
        let mut targets = lock(&self.neighbors).children();
        targets.extend(self.hosts());
        for to in targets.iter().filter(|t| t.as_str() != from) {
            let _ = self.network.send(&self.id, to, Command::Shutdown);
        }
        info!("{}: apagando", self.id);
        self.network.disconnect(&self.id);
    }
}

#[async_trait]
impl Service for TaskServer {
    fn department(&self, command: &Command) -> Department {
        match command {
            Command::RequestTask | Command::RequestTasks { .. } => Department::Requests,
            _ => Department::Asap,
        }
    }

    async fn handle(&self, from: NodeId, command: Command) -> Reply {
        match command {
            Command::Spawn { task } => {
                let assigned = self.session.spawn(task);
                self.record(assigned);
            }
            Command::SetArg {
                task_id,
                index,
                value,
                critical_path_ms,
            } => self.session.set_arg(task_id, index, value, critical_path_ms),
            Command::ProcessResult { info } => self.process_result(info),
            Command::RequestTask => self.serve_host(&from).await,
            Command::RequestTasks { factor } => self.serve_neighbor(&from, factor).await,
            Command::ReceiveTasks { tasks } => self.receive_tasks(&from, tasks),
            Command::IssueRequestTasks => self.issue_request_tasks(),
            Command::LoginClient { info } => self.login(info).await,
            Command::LogoutClient => self.logout(),
            Command::RegisterHost => return self.register_host(&from),
            Command::UnregisterHost { host } => self.unregister_host(&host),
            Command::RegisterNeighbor {
                neighbor,
                direction,
            } => {
                debug!("{}: vecino {} al {:?}", self.id, neighbor.id, direction);
                lock(&self.neighbors).set_neighbor(neighbor, direction);
            }
            Command::AddServiceTaskStats { stats } => self.add_child_stats(stats),
            Command::UpdateProviders { providers } => self.update_providers(providers),
            Command::Pause => self.pause(),
            Command::SaveState { set_id } => {
                if let Err(e) = self.save_state(&set_id) {
                    warn!("{}: no se pudo guardar {}: {}", self.id, set_id, e);
                    return Reply::Rejected {
                        reason: e.to_string(),
                    };
                }
            }
            Command::LoadState { set_id } => {
                if let Err(e) = self.load_state(&set_id) {
                    warn!("{}: no se pudo cargar {}: {}", self.id, set_id, e);
                    return Reply::Rejected {
                        reason: e.to_string(),
                    };
                }
            }
            Command::KillTask { task_id } => self.kill(&from, task_id),
            Command::SetShared { shared } => self.set_shared(&from, shared),
            Command::Ping => return Reply::Pong,
            Command::Shutdown => self.shutdown(&from),
            other => {
                warn!("{}: comando inesperado {}", self.id, other.name());
                return Reply::Rejected {
                    reason: format!("{} no lo atiende un servidor de tareas", other.name()),
                };
            }
        }
        Reply::Ack
    }
}
