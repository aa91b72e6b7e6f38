use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::commands::{Command, Department, Reply};
use crate::config;
use crate::environment::{Environment, SessionInfo, Shared};
use crate::error::{ComputeError, TransportError};
use crate::killed::KilledTasks;
use crate::network::{Network, Role, Service};
use crate::registry::{ExecContext, Outcome, TaskRegistry};
use crate::results::{ComputationResult, Successor, TaskInfo};
use crate::task::Task;
use crate::task_id::TaskId;
use crate::{lock, NodeId};

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub id: NodeId,
    pub task_server: NodeId,
    pub processors: usize,
    /// Tipo de tarea que el host se guarda para ejecutar sin ida y vuelta
    pub cacheable_kind: Option<String>,
    pub prefetch: bool,
}

impl HostConfig {
    pub fn new(id: impl Into<NodeId>, task_server: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            task_server: task_server.into(),
            processors: config::DEFAULT_WORKER_PROCESSORS,
            cacheable_kind: None,
            prefetch: true,
        }
    }

    /// Valores de WORKER_PROCESSORS, WORKER_CACHEABLE_KIND y WORKER_PREFETCH.
    pub fn from_env(id: impl Into<NodeId>, task_server: impl Into<NodeId>) -> Self {
        Self {
            processors: config::worker_processors(),
            cacheable_kind: config::worker_cacheable_kind(),
            prefetch: config::worker_prefetch(),
            ..Self::new(id, task_server)
        }
    }
}

struct HostState {
    session: Option<SessionInfo>,
    hsp: NodeId,
    killed: KilledTasks,
}

/// Nodo que ejecuta tareas. Cada procesador del departamento `Compute`
/// corre una tarea a la vez.
pub struct Host {
    id: NodeId,
    task_server: NodeId,
    network: Network,
    registry: Arc<TaskRegistry>,
    internal: bool,
    cacheable_kind: Option<String>,
    prefetch: bool,
    state: Mutex<HostState>,
    executed: AtomicU64,
}

impl Host {
    /// Registra el host en la red y en su servidor de tareas, y pide una
    /// tarea por procesador.
    pub async fn start(
        network: Network,
        registry: Arc<TaskRegistry>,
        config: HostConfig,
    ) -> Result<Arc<Self>, TransportError> {
        let host = Arc::new(Self {
            id: config.id.clone(),
            task_server: config.task_server.clone(),
            network: network.clone(),
            registry,
            internal: false,
            cacheable_kind: config.cacheable_kind,
            prefetch: config.prefetch,
            state: Mutex::new(HostState {
                session: None,
                hsp: String::new(),
                killed: KilledTasks::new(),
            }),
            executed: AtomicU64::new(0),
        });
        let processors = config.processors.max(1);
        network.register(
            config.id.clone(),
            Role::Host,
            host.clone(),
            &[(Department::Asap, 1), (Department::Compute, processors)],
        );

        let reply = network
            .call(
                &config.id,
                &config.task_server,
                Command::RegisterHost,
                config::server_timeout(),
            )
            .await?;
        match reply {
            Reply::Session { info, hsp } => {
                let mut st = lock(&host.state);
                st.hsp = hsp;
                st.session = info;
            }
            other => {
                network.disconnect(&config.id);
                return Err(TransportError::Rejected {
                    to: config.task_server,
                    message: format!("{:?}", other),
                });
            }
        }

        for _ in 0..processors {
            host.request_task();
        }
        info!(
            "host {} unido a {} ({} procesadores)",
            host.id, host.task_server, processors
        );
        Ok(host)
    }

    /// Host interno de un servidor: ejecuta las tareas marcadas para correr
    /// en el servidor y no pide tareas.
    pub fn start_internal(
        network: Network,
        registry: Arc<TaskRegistry>,
        task_server: &str,
        hsp: &str,
        processors: usize,
    ) -> Arc<Self> {
        let id = format!("internal:{}", task_server);
        let host = Arc::new(Self {
            id: id.clone(),
            task_server: task_server.to_string(),
            network: network.clone(),
            registry,
            internal: true,
            cacheable_kind: None,
            prefetch: false,
            state: Mutex::new(HostState {
                session: None,
                hsp: hsp.to_string(),
                killed: KilledTasks::new(),
            }),
            executed: AtomicU64::new(0),
        });
        network.register(
            id,
            Role::Host,
            host.clone(),
            &[(Department::Asap, 1), (Department::Compute, processors.max(1))],
        );
        host
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn task_server(&self) -> &NodeId {
        &self.task_server
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn session_id(&self) -> Option<i64> {
        lock(&self.state).session.as_ref().map(|s| s.session_id)
    }

    pub fn shared(&self) -> Option<Shared> {
        lock(&self.state)
            .session
            .as_ref()
            .and_then(|s| s.environment.shared.clone())
    }

    /// Tareas ejecutadas desde que arrancó.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }

    fn request_task(&self) {
        if !self.internal {
            let _ = self
                .network
                .send(&self.id, &self.task_server, Command::RequestTask);
        }
    }

    /// Envía al servidor; el host interno usa el departamento `Internal`.
    fn send_to_server(&self, command: Command) {
        let _ = if self.internal {
            self.network
                .send_to(&self.id, &self.task_server, Department::Internal, command)
        } else {
            self.network.send(&self.id, &self.task_server, command)
        };
    }

    async fn execute(&self, task: Task, input_index: Option<u16>) {
        let (environment, current) = {
            let st = lock(&self.state);
            if st.killed.contains(&task.task_id) {
                drop(st);
                debug!("{}: {} está muerta", self.id, task.task_id);
                self.request_task();
                return;
            }
            match &st.session {
                Some(s) if s.session_id == task.task_id.session_id() => {
                    (s.environment.clone(), true)
                }
                _ => (Environment::default(), false),
            }
        };
        if !current {
            debug!("{}: {} no es de la sesión actual", self.id, task.task_id);
            self.request_task();
            return;
        }

        let prefetched =
            !self.internal && self.prefetch && self.registry.is_atomic(&task, &environment);
        if prefetched {
            self.request_task();
        }

        let Some(logic) = self.registry.get(&task.kind) else {
            let error = ComputeError::UnknownKind {
                kind: task.kind.clone(),
            };
            self.fail(&task.task_id, error, prefetched);
            return;
        };

        let started = Instant::now();
        let id = task.task_id.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let mut task = task;
            let mut ctx = ExecContext::new(environment);
            let outcome = match input_index {
                Some(index) => logic.execute_incremental(&mut task, index, &mut ctx),
                None => logic.execute(&mut task, &mut ctx),
            };
            (task, outcome, ctx.take_proposed_shared())
        })
        .await;
        let execute_ms = started.elapsed().as_millis() as u64;

        let (mut task, outcome, proposed) = match joined {
            Ok(done) => done,
            Err(e) => {
                let error = ComputeError::Task {
                    task_id: id.clone(),
                    message: e.to_string(),
                };
                self.fail(&id, error, prefetched);
                return;
            }
        };
        self.executed.fetch_add(1, Ordering::SeqCst);

        if let Some(shared) = proposed {
            self.propose_shared(shared);
        }

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                let error = ComputeError::Task {
                    task_id: id.clone(),
                    message: format!("{:#}", e),
                };
                self.fail(&id, error, prefetched);
                return;
            }
        };

        let mut kill = None;
        if input_index.is_some() {
            if outcome == Outcome::NeedMoreInputs {
                if task.unset_inputs() == 0 {
                    self.fail(&id, ComputeError::NoMoreInputs { task_id: id.clone() }, prefetched);
                } else if !prefetched {
                    self.request_task();
                }
                return;
            }
            if task.unset_inputs() != 0 {
                // ya no hacen falta las hermanas que faltan
                if let Some(parent) = id.parent_id() {
                    lock(&self.state).killed.insert(parent.clone());
                    kill = Some(Command::KillTask { task_id: parent });
                }
            }
        }

        let mut info = TaskInfo::new(self.id.clone(), &task, execute_ms);
        let mut cached = None;
        match outcome {
            Outcome::Compose(compose) => {
                task.init_compose(compose);
                let mut children = task.take_children();
                for child in children.iter_mut() {
                    child.predecessor_critical_path_ms = info.critical_path_ms;
                }
                if let Some(kind) = &self.cacheable_kind {
                    cached = promote_cacheable(&mut children, kind, &self.id);
                }
                info.children = Some(children);
            }
            Outcome::Value(value) => {
                let Some(successor) = task.successor().cloned() else {
                    warn!("{}: {} no tiene sucesor", self.id, id);
                    if !prefetched {
                        self.request_task();
                    }
                    return;
                };
                let server = task
                    .task_server
                    .clone()
                    .unwrap_or_else(|| self.task_server.clone());
                if server == self.task_server {
                    info.successor = Some(Successor {
                        task_id: successor,
                        index: task.successor_index(),
                        value,
                    });
                } else {
                    let _ = self.network.send(
                        &self.id,
                        &server,
                        Command::SetArg {
                            task_id: successor,
                            index: task.successor_index(),
                            value,
                            critical_path_ms: info.critical_path_ms,
                        },
                    );
                }
            }
            Outcome::NeedMoreInputs => {
                let error = ComputeError::Task {
                    task_id: id.clone(),
                    message: "pidió más entradas fuera de una ejecución incremental".into(),
                };
                self.fail(&id, error, prefetched);
                return;
            }
        }

        let mut commands = vec![Command::ProcessResult { info }];
        if !self.internal && !prefetched && cached.is_none() {
            commands.push(Command::RequestTask);
        }
        // la compose o el valor se procesan antes de matar a las hermanas
        commands.extend(kill);
        self.send_to_server(Command::Batch { commands });

        // recién ahora: el servidor ya sabe que la tarea cacheada existe
        if let Some(child) = cached {
            let _ = self.network.send_to(
                &self.id,
                &self.id,
                Department::Compute,
                Command::ExecuteTask {
                    task: child,
                    input_index: None,
                },
            );
        }
    }

    /// Reporta la falla al Hsp si la tarea es de la sesión actual.
    fn fail(&self, task_id: &TaskId, error: ComputeError, prefetched: bool) {
        let (current, hsp) = {
            let st = lock(&self.state);
            let current = st.session.as_ref().map(|s| s.session_id) == Some(task_id.session_id());
            (current, st.hsp.clone())
        };
        if current {
            warn!("{}: {}", self.id, error);
            let _ = self.network.send(
                &self.id,
                &hsp,
                Command::PutResult {
                    result: ComputationResult::failure(task_id.clone(), error),
                },
            );
        } else {
            info!("{}: ignorando error de una sesión anterior: {}", self.id, error);
        }
        if !prefetched {
            self.request_task();
        }
    }

    fn propose_shared(&self, shared: Shared) {
        let adopted = {
            let mut st = lock(&self.state);
            match st.session.as_mut() {
                Some(s) => s.environment.offer_shared(shared.clone()),
                None => false,
            }
        };
        if adopted {
            self.send_to_server(Command::SetShared { shared });
        }
    }

    fn login(&self, info: SessionInfo) {
        let mut st = lock(&self.state);
        debug!("{}: sesión {}", self.id, info.session_id);
        st.session = Some(info);
        st.killed.clear();
    }

    fn logout(&self) {
        let mut st = lock(&self.state);
        st.session = None;
        st.killed.clear();
    }

    fn shutdown(&self) {
        if self.internal {
            debug!("{}: host interno, ignoro el shutdown", self.id);
            return;
        }
        info!("{}: apagando", self.id);
        self.network.disconnect(&self.id);
    }
}

#[async_trait]
impl Service for Host {
    fn department(&self, command: &Command) -> Department {
        match command {
            Command::ExecuteTask { .. } => Department::Compute,
            _ => Department::Asap,
        }
    }

    async fn handle(&self, _from: NodeId, command: Command) -> Reply {
        match command {
            Command::ExecuteTask { task, input_index } => self.execute(task, input_index).await,
            Command::LoginClient { info } => self.login(info),
            Command::LogoutClient => self.logout(),
            Command::KillTask { task_id } => {
                lock(&self.state).killed.insert(task_id);
            }
            Command::SetShared { shared } => {
                if let Some(s) = lock(&self.state).session.as_mut() {
                    s.environment.offer_shared(shared);
                }
            }
            Command::Ping => return Reply::Pong,
            Command::Shutdown => self.shutdown(),
            other => {
                warn!("{}: comando inesperado {}", self.id, other.name());
                return Reply::Rejected {
                    reason: format!("{} no lo atiende un host", other.name()),
                };
            }
        }
        Reply::Ack
    }
}

/// Mueve al frente el primer hijo de tipo `kind` (nunca la compose, que va
/// última) y devuelve una copia para ejecutarla en este host. La copia no
/// sabe dónde vive la compose: su valor vuelve por el servidor del host.
pub fn promote_cacheable(children: &mut Vec<Task>, kind: &str, host: &str) -> Option<Task> {
    let last = children.len().checked_sub(1)?;
    let index = children[..last].iter().position(|c| c.kind == kind)?;

    let mut child = children.remove(index);
    child.cached = true;
    child.spawning_host = Some(host.to_string());
    child.host = Some(host.to_string());
    children.insert(0, child.clone());
    Some(child)
}
