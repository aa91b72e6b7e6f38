use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::commands::{Command, Department, Reply};
use crate::config;
use crate::environment::{ClientProfile, Environment, SessionInfo};
use crate::error::{ComputeError, HspError, ProtocolError, StoreError};
use crate::network::{Network, Role, Service};
use crate::protocol::{ClientCall, ClientState, ProtocolChecker};
use crate::results::{ComputationResult, ResultId};
use crate::stats::{Invoice, ServiceTaskStats};
use crate::store::StateStore;
use crate::task::Task;
use crate::topology::{NeighborInfo, Placement, TopologyManager};
use crate::{lock, NodeId};

struct ActiveSession {
    ticket: u64,
    info: SessionInfo,
    client: String,
    begin: DateTime<Utc>,
    computations: u32,
    next_computation: i16,
    /// Resultados sin retirar, en orden de llegada
    results: VecDeque<ComputationResult>,
    failure: Option<ComputeError>,
    /// Presente cuando la sesión ya se cerró en los servidores
    invoice: Option<Invoice>,
}

#[derive(Default)]
struct HspState {
    topology: TopologyManager,
    providers: HashMap<String, NodeId>,
    next_ticket: u64,
    /// Tickets liberados antes de que les llegara el turno
    released: BTreeSet<u64>,
    last_session_id: i64,
    active: Option<ActiveSession>,
    stats_waiter: Option<oneshot::Sender<ServiceTaskStats>>,
}

/// Lo que guarda el Hsp en un save/load.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HspSnapshot {
    info: Option<SessionInfo>,
    computations: u32,
    next_computation: i16,
    results: Vec<ComputationResult>,
}

/// Coordinador raíz: única entrada de los clientes. Reparte el overlay de
/// servidores, recibe los resultados y serializa los logins.
pub struct Hsp {
    id: NodeId,
    me: Weak<Hsp>,
    network: Network,
    store: Arc<dyn StateStore>,
    state: Mutex<HspState>,
    /// Se incrementa con cada resultado o cambio de sesión
    results: watch::Sender<u64>,
    /// Ticket de login que tiene el turno
    turn: watch::Sender<u64>,
    ready: watch::Sender<usize>,
    logout_gate: tokio::sync::Mutex<()>,
}

impl Hsp {
    pub fn start(network: Network, id: impl Into<NodeId>, store: Arc<dyn StateStore>) -> Arc<Self> {
        let id = id.into();
        let hsp = Arc::new_cyclic(|me| Self {
            id: id.clone(),
            me: me.clone(),
            network: network.clone(),
            store,
            state: Mutex::new(HspState::default()),
            results: watch::Sender::new(0),
            turn: watch::Sender::new(0),
            ready: watch::Sender::new(0),
            logout_gate: tokio::sync::Mutex::new(()),
        });
        network.register(id, Role::Hsp, hsp.clone(), &[(Department::Asap, 1)]);
        hsp
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn client(self: &Arc<Self>) -> HspClient {
        HspClient::new(self.clone())
    }

    /// Servidor raíz del overlay.
    pub fn root(&self) -> Option<NodeId> {
        lock(&self.state).topology.root().map(|r| r.id.clone())
    }

    pub fn servers(&self) -> Vec<NeighborInfo> {
        lock(&self.state).topology.servers()
    }

    pub fn providers(&self) -> HashMap<String, NodeId> {
        lock(&self.state).providers.clone()
    }

    pub fn session_id(&self) -> Option<i64> {
        lock(&self.state).active.as_ref().map(|a| a.info.session_id)
    }

    fn register_task_server(&self, from: NodeId, service: Option<String>) -> Reply {
        let (placement, notices, root) = {
            let mut st = lock(&self.state);
            let (me, neighbors, root, notices) = st.topology.add(from.clone(), service.clone());
            if let (Some(service), Some(_)) = (&service, &root) {
                st.providers.insert(service.clone(), from.clone());
            }
            let session = st
                .active
                .as_ref()
                .filter(|a| a.invoice.is_none())
                .map(|a| a.info.clone());
            let placement = Placement {
                me,
                neighbors,
                root: root.clone(),
                session,
                providers: st.providers.clone(),
            };
            (placement, notices, root)
        };

        info!("servidor {} registrado en {}", from, placement.me.point);
        for n in notices {
            let _ = self.network.send(
                &self.id,
                &n.target,
                Command::RegisterNeighbor {
                    neighbor: n.neighbor,
                    direction: n.direction,
                },
            );
        }
        if let Some(root) = root {
            let _ = self.network.send(
                &self.id,
                &root.id,
                Command::UpdateProviders {
                    providers: placement.providers.clone(),
                },
            );
        }
        Reply::Placement { placement }
    }

    fn put_result(&self, result: ComputationResult) {
        let failed = {
            let mut st = lock(&self.state);
            match st.active.as_mut() {
                Some(a)
                    if a.info.session_id == result.result_id.session_id && a.invoice.is_none() =>
                {
                    let mut failed = false;
                    if let Err(e) = &result.outcome {
                        warn!("cómputo {} falló: {}", result.result_id, e);
                        if a.failure.is_none() {
                            a.failure = Some(e.clone());
                            failed = true;
                        }
                    } else {
                        debug!("resultado de {}", result.result_id);
                    }
                    a.results.push_back(result);
                    failed
                }
                _ => {
                    info!("descarto resultado de una sesión anterior: {}", result.result_id);
                    false
                }
            }
        };
        self.results.send_modify(|v| *v += 1);

        // una falla cierra la sesión en los servidores
        if failed {
            if let Some(hsp) = self.me.upgrade() {
                tokio::spawn(async move {
                    hsp.end_session().await;
                });
            }
        }
    }

    fn add_service_task_stats(&self, stats: ServiceTaskStats) {
        match lock(&self.state).stats_waiter.take() {
            Some(tx) => {
                let _ = tx.send(stats);
            }
            None => warn!("estadísticas de {} sin logout en curso", stats.task_server),
        }
    }

    fn take_ticket(&self) -> u64 {
        let mut st = lock(&self.state);
        let ticket = st.next_ticket;
        st.next_ticket += 1;
        ticket
    }

    /// Espera el turno del ticket y abre la sesión en todo el overlay.
    async fn begin_session(
        &self,
        ticket: u64,
        profile: ClientProfile,
        environment: Environment,
    ) -> Result<SessionInfo, HspError> {
        let mut turn = self.turn.subscribe();
        turn.wait_for(|t| *t == ticket)
            .await
            .map(|_| ())
            .map_err(|_| HspError::Unexpected("hsp cerrado".into()))?;

        let (info, root) = {
            let mut st = lock(&self.state);
            let session_id = Utc::now().timestamp_millis().max(st.last_session_id + 1);
            st.last_session_id = session_id;
            let info = SessionInfo {
                session_id,
                environment,
            };
            st.active = Some(ActiveSession {
                ticket,
                info: info.clone(),
                client: profile.name.clone(),
                begin: Utc::now(),
                computations: 0,
                next_computation: 0,
                results: VecDeque::new(),
                failure: None,
                invoice: None,
            });
            (info, st.topology.root().map(|r| r.id.clone()))
        };
        info!("login de {} (sesión {})", profile.name, info.session_id);

        if let Some(root) = root {
            let command = Command::LoginClient { info: info.clone() };
            self.network
                .call(&self.id, &root, command, config::server_timeout())
                .await?;
        }
        Ok(info)
    }

    /// Le da al cómputo su id y lo manda a la raíz.
    fn submit(&self, mut task: Task) -> Result<ResultId, HspError> {
        let (root, session_id, next) = {
            let mut st = lock(&self.state);
            let root = st.topology.root().map(|r| r.id.clone());
            let a = st.active.as_mut().ok_or(ProtocolError::NotLoggedIn)?;
            if a.invoice.is_some() {
                return Err(ComputeError::SessionEnded.into());
            }
            if let Some(e) = &a.failure {
                return Err(e.clone().into());
            }
            let root = root.ok_or_else(|| HspError::Unexpected("no hay servidores de tareas".into()))?;
            let computation = a.next_computation;
            let next = computation
                .checked_add(1)
                .ok_or(HspError::ComputationsExhausted)?;
            task.init(a.info.session_id, computation, root.clone());
            (root, a.info.session_id, next)
        };

        let result_id = ResultId::from(&task.task_id);
        debug!("cómputo {} a {}", result_id, root);
        self.network
            .send(&self.id, &root, Command::Spawn { task })?;

        // el id sólo se consume si el cómputo salió
        let mut st = lock(&self.state);
        if let Some(a) = st.active.as_mut().filter(|a| a.info.session_id == session_id) {
            a.next_computation = next;
            a.computations += 1;
        }
        Ok(result_id)
    }

    /// Espera el resultado `wanted`, o el primero que llegue si es None.
    async fn wait_result(&self, wanted: Option<&ResultId>) -> Result<ComputationResult, HspError> {
        let mut changes = self.results.subscribe();
        loop {
            {
                let mut st = lock(&self.state);
                let Some(a) = st.active.as_mut() else {
                    return Err(ComputeError::SessionEnded.into());
                };
                let position = match wanted {
                    Some(id) => a.results.iter().position(|r| &r.result_id == id),
                    None => (!a.results.is_empty()).then_some(0),
                };
                if let Some(result) = position.and_then(|p| a.results.remove(p)) {
                    return Ok(result);
                }
                if let Some(e) = &a.failure {
                    return Err(e.clone().into());
                }
                if a.invoice.is_some() {
                    return Err(ComputeError::SessionEnded.into());
                }
            }
            changes
                .changed()
                .await
                .map_err(|_| HspError::Unexpected("hsp cerrado".into()))?;
        }
    }

    fn is_complete(&self, result_id: &ResultId) -> bool {
        lock(&self.state)
            .active
            .as_ref()
            .map_or(false, |a| a.results.iter().any(|r| &r.result_id == result_id))
    }

    /// Cierra la sesión en el overlay y arma la factura. Idempotente: la
    /// segunda vez devuelve la misma factura.
    async fn end_session(&self) -> Option<Invoice> {
        let _gate = self.logout_gate.lock().await;

        let (rx, root) = {
            let mut st = lock(&self.state);
            let a = st.active.as_ref()?;
            if let Some(invoice) = &a.invoice {
                return Some(invoice.clone());
            }
            let (tx, rx) = oneshot::channel();
            st.stats_waiter = Some(tx);
            (rx, st.topology.root().map(|r| r.id.clone()))
        };

        let stats = match root {
            Some(root) if self.network.send(&self.id, &root, Command::LogoutClient).is_ok() => {
                match tokio::time::timeout(config::server_timeout(), rx).await {
                    Ok(Ok(stats)) => Some(stats),
                    _ => {
                        warn!("no llegaron las estadísticas del logout");
                        None
                    }
                }
            }
            _ => None,
        };

        let invoice = {
            let mut st = lock(&self.state);
            st.stats_waiter = None;
            let a = st.active.as_mut()?;
            let invoice = Invoice {
                session_id: a.info.session_id,
                client: a.client.clone(),
                begin: a.begin,
                end: Utc::now(),
                computations: a.computations,
                stats,
            };
            a.invoice = Some(invoice.clone());
            invoice
        };
        self.results.send_modify(|v| *v += 1);
        info!("sesión {} cerrada", invoice.session_id);
        Some(invoice)
    }

    /// Libera el ticket. El turno avanza sobre todos los tickets ya
    /// liberados; uno liberado antes de su turno queda anotado.
    fn release(&self, ticket: u64) {
        {
            let mut st = lock(&self.state);
            if st.active.as_ref().map(|a| a.ticket) == Some(ticket) {
                st.active = None;
            }
            st.released.insert(ticket);
            let mut turn = *self.turn.borrow();
            while st.released.remove(&turn) {
                turn += 1;
            }
            self.turn.send_replace(turn);
        }
        self.results.send_modify(|v| *v += 1);
    }

    /// True si el ticket tiene una sesión abierta en los servidores.
    fn owns_open_session(&self, ticket: u64) -> bool {
        lock(&self.state)
            .active
            .as_ref()
            .map_or(false, |a| a.ticket == ticket && a.invoice.is_none())
    }

    /// Pausa todos los servidores y espera sus `Ready`.
    async fn pause_all(&self) -> Result<Vec<NodeId>, HspError> {
        let servers: Vec<NodeId> = self.servers().into_iter().map(|s| s.id).collect();
        self.ready.send_replace(0);
        let mut ready = self.ready.subscribe();
        for s in &servers {
            self.network.send(&self.id, s, Command::Pause)?;
        }
        let n = servers.len();
        tokio::time::timeout(config::server_timeout(), ready.wait_for(|r| *r >= n))
            .await
            .map_err(|_| HspError::Unexpected("los servidores no confirmaron la pausa".into()))?
            .map(|_| ())
            .map_err(|_| HspError::Unexpected("hsp cerrado".into()))?;
        Ok(servers)
    }

    async fn broadcast_call(&self, servers: &[NodeId], command: Command) -> Result<(), HspError> {
        for s in servers {
            match self
                .network
                .call(&self.id, s, command.clone(), config::server_timeout())
                .await?
            {
                Reply::Ack => {}
                Reply::Rejected { reason } => return Err(HspError::Unexpected(reason)),
                other => {
                    return Err(HspError::Unexpected(format!("{} contestó {:?}", s, other)));
                }
            }
        }
        Ok(())
    }

    /// Guarda el estado de todo el sistema bajo `set_id`.
    pub async fn save_state(&self, set_id: &str) -> Result<(), HspError> {
        let servers = self.pause_all().await?;

        let snapshot = {
            let st = lock(&self.state);
            match st.active.as_ref() {
                Some(a) => HspSnapshot {
                    info: Some(a.info.clone()),
                    computations: a.computations,
                    next_computation: a.next_computation,
                    results: a.results.iter().cloned().collect(),
                },
                None => HspSnapshot {
                    info: None,
                    computations: 0,
                    next_computation: 0,
                    results: Vec::new(),
                },
            }
        };
        let value = serde_json::to_value(snapshot).map_err(StoreError::from)?;
        let saved = self.store.save(&self.id, set_id, &value);

        // los servidores se reanudan al guardar, aunque falle lo del Hsp
        self.broadcast_call(
            &servers,
            Command::SaveState {
                set_id: set_id.to_string(),
            },
        )
        .await?;
        saved?;
        info!("estado guardado en {}", set_id);
        Ok(())
    }

    /// Restaura el estado guardado en `set_id`.
    pub async fn load_state(&self, set_id: &str) -> Result<(), HspError> {
        let value = self
            .store
            .load(&self.id, set_id)?
            .ok_or_else(|| HspError::Unexpected(format!("no hay estado guardado en {}", set_id)))?;
        let snapshot: HspSnapshot = serde_json::from_value(value).map_err(StoreError::from)?;

        let servers = self.pause_all().await?;
        {
            let mut st = lock(&self.state);
            if let Some(a) = st.active.as_mut() {
                if let Some(info) = snapshot.info {
                    a.info = info;
                }
                a.computations = snapshot.computations;
                a.next_computation = snapshot.next_computation;
                a.results = snapshot.results.into_iter().collect();
                a.failure = None;
            }
        }
        self.broadcast_call(
            &servers,
            Command::LoadState {
                set_id: set_id.to_string(),
            },
        )
        .await?;
        self.results.send_modify(|v| *v += 1);
        info!("estado restaurado de {}", set_id);
        Ok(())
    }

    /// Apaga el overlay desde la raíz.
    pub fn shutdown(&self) {
        if let Some(root) = self.root() {
            let _ = self.network.send(&self.id, &root, Command::Shutdown);
        }
        info!("hsp apagando");
        self.network.disconnect(&self.id);
    }
}

#[async_trait]
impl Service for Hsp {
    fn department(&self, _command: &Command) -> Department {
        Department::Asap
    }

    async fn handle(&self, from: NodeId, command: Command) -> Reply {
        match command {
            Command::RegisterTaskServer { service } => return self.register_task_server(from, service),
            Command::PutResult { result } => self.put_result(result),
            Command::AddServiceTaskStats { stats } => self.add_service_task_stats(stats),
            Command::Ready => {
                self.ready.send_modify(|r| *r += 1);
            }
            Command::Ping => return Reply::Pong,
            other => {
                warn!("hsp: comando inesperado {} de {}", other.name(), from);
                return Reply::Rejected {
                    reason: format!("{} no lo atiende el hsp", other.name()),
                };
            }
        }
        Reply::Ack
    }
}

/// Lugar en la cola de logins. Al soltarlo sin `release` (login cancelado,
/// cliente abandonado) cierra la sesión que tuviera abierta y cede el turno.
struct LoginTicket {
    hsp: Arc<Hsp>,
    ticket: u64,
    released: bool,
}

impl LoginTicket {
    fn take(hsp: &Arc<Hsp>) -> Self {
        Self {
            hsp: hsp.clone(),
            ticket: hsp.take_ticket(),
            released: false,
        }
    }

    fn release(mut self) {
        self.released = true;
        self.hsp.release(self.ticket);
    }
}

impl Drop for LoginTicket {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let ticket = self.ticket;
        if !self.hsp.owns_open_session(ticket) {
            self.hsp.release(ticket);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let hsp = self.hsp.clone();
                warn!("sesión del ticket {} abandonada, cerrándola", ticket);
                runtime.spawn(async move {
                    hsp.end_session().await;
                    hsp.release(ticket);
                });
            }
            Err(_) => self.hsp.release(ticket),
        }
    }
}

/// Conexión de un cliente con el Hsp. Valida el orden de las llamadas.
pub struct HspClient {
    hsp: Arc<Hsp>,
    checker: ProtocolChecker,
    ticket: Option<LoginTicket>,
}

impl HspClient {
    pub fn new(hsp: Arc<Hsp>) -> Self {
        Self {
            hsp,
            checker: ProtocolChecker::new(),
            ticket: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.checker.state()
    }

    /// Espera su turno en la cola de logins.
    pub async fn login(
        &mut self,
        profile: ClientProfile,
        environment: Environment,
    ) -> Result<SessionInfo, HspError> {
        self.checker.check(ClientCall::Login)?;
        let ticket = LoginTicket::take(&self.hsp);
        match self.hsp.begin_session(ticket.ticket, profile, environment).await {
            Ok(info) => {
                self.ticket = Some(ticket);
                Ok(info)
            }
            Err(e) => {
                self.checker.force_logout();
                ticket.release();
                Err(e)
            }
        }
    }

    /// Ejecuta un cómputo y espera su valor.
    pub async fn compute(&mut self, task: Task) -> Result<serde_json::Value, HspError> {
        self.checker.check(ClientCall::Compute)?;
        let result_id = self.hsp.submit(task)?;
        let result = self.hsp.wait_result(Some(&result_id)).await?;
        Ok(result.outcome?)
    }

    /// Lanza un cómputo sin esperar. Si no sale, el cliente queda igual.
    pub fn set_computation(&mut self, task: Task) -> Result<ResultId, HspError> {
        let mut checker = self.checker.clone();
        checker.check(ClientCall::SetComputation)?;
        let result_id = self.hsp.submit(task)?;
        self.checker = checker;
        Ok(result_id)
    }

    /// Primer resultado disponible de los lanzados con `set_computation`.
    pub async fn get_result(&mut self) -> Result<ComputationResult, HspError> {
        self.checker.check(ClientCall::GetResult)?;
        let result = self.hsp.wait_result(None).await?;
        if let Err(e) = &result.outcome {
            return Err(e.clone().into());
        }
        Ok(result)
    }

    pub fn is_complete(&mut self, result_id: &ResultId) -> Result<bool, HspError> {
        self.checker.check(ClientCall::IsComplete)?;
        Ok(self.hsp.is_complete(result_id))
    }

    pub async fn logout(&mut self) -> Result<Invoice, HspError> {
        self.checker.check(ClientCall::Logout)?;
        let Some(ticket) = self.ticket.take() else {
            return Err(ProtocolError::NotLoggedIn.into());
        };
        let invoice = self.hsp.end_session().await;
        ticket.release();
        invoice.ok_or_else(|| HspError::Unexpected("la sesión ya no existe".into()))
    }
}
