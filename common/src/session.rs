use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::commands::{Command, Department};
use crate::environment::{SessionInfo, Shared};
use crate::error::ComputeError;
use crate::killed::KilledTasks;
use crate::network::Network;
use crate::queue::PriorityTaskQueue;
use crate::registry::TaskRegistry;
use crate::results::{ComputationResult, TaskInfo};
use crate::task::{ArgIndex, Task};
use crate::task_id::TaskId;
use crate::{lock, NodeId};

/// Tarea entregada a un host sin pasar por la cola.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub host: NodeId,
    pub task_id: TaskId,
}

/// A quién le corresponde cada tarea.
#[derive(Debug, Clone, Default)]
pub struct Routing {
    pub hsp: NodeId,
    /// Clase de servicio que atiende este servidor, si es externo
    pub service: Option<String>,
    pub root: Option<NodeId>,
    pub internal_host: Option<NodeId>,
    pub providers: HashMap<String, NodeId>,
}

/// Lo que se guarda en un save/load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub info: Option<SessionInfo>,
    pub tasks: Vec<Task>,
}

#[derive(Default)]
struct SessionState {
    info: Option<SessionInfo>,
    tasks: HashMap<TaskId, Task>,
    killed: KilledTasks,
    routing: Routing,
}

/// Mensajes que se mandan al soltar el lock.
#[derive(Default)]
struct Outbox {
    mail: Vec<(NodeId, Option<Department>, Command)>,
    assignments: Vec<Assignment>,
}

impl Outbox {
    fn send(&mut self, to: &str, command: Command) {
        self.mail.push((to.to_string(), None, command));
    }

    fn send_to(&mut self, to: &str, department: Department, command: Command) {
        self.mail.push((to.to_string(), Some(department), command));
    }
}

/// Estado de un cliente en un servidor de tareas: tareas vivas, cola de
/// tareas sin asignar y tareas muertas.
///
/// spawn, set_arg, process_result y unassign se excluyen entre sí con el
/// lock de la sesión; la cola tiene su propio lock.
pub struct Session {
    me: NodeId,
    network: Network,
    registry: Arc<TaskRegistry>,
    state: Mutex<SessionState>,
    queue: Arc<PriorityTaskQueue>,
}

impl Session {
    pub fn new(me: NodeId, network: Network, registry: Arc<TaskRegistry>, routing: Routing) -> Self {
        let queue = if routing.service.is_some() {
            // los externos no piden tareas a nadie
            PriorityTaskQueue::new()
        } else {
            let (net, id) = (network.clone(), me.clone());
            PriorityTaskQueue::with_diffusion(move || {
                let _ = net.send(&id, &id, Command::IssueRequestTasks);
            })
        };

        Self {
            me,
            network,
            registry,
            state: Mutex::new(SessionState {
                routing,
                ..Default::default()
            }),
            queue: Arc::new(queue),
        }
    }

    pub fn queue(&self) -> &PriorityTaskQueue {
        &self.queue
    }

    pub fn info(&self) -> Option<SessionInfo> {
        lock(&self.state).info.clone()
    }

    pub fn session_id(&self) -> Option<i64> {
        lock(&self.state).info.as_ref().map(|i| i.session_id)
    }

    pub fn hsp(&self) -> NodeId {
        lock(&self.state).routing.hsp.clone()
    }

    pub fn set_root(&self, root: Option<NodeId>) {
        lock(&self.state).routing.root = root;
    }

    pub fn set_internal_host(&self, host: NodeId) {
        lock(&self.state).routing.internal_host = Some(host);
    }

    pub fn set_providers(&self, providers: HashMap<String, NodeId>) {
        lock(&self.state).routing.providers = providers;
    }

    pub fn providers(&self) -> HashMap<String, NodeId> {
        lock(&self.state).routing.providers.clone()
    }

    /// Nueva sesión: se descarta todo lo del cliente anterior.
    pub fn login(&self, info: SessionInfo) {
        let mut st = lock(&self.state);
        info!("{}: login de la sesión {}", self.me, info.session_id);
        st.info = Some(info);
        st.tasks.clear();
        st.killed.clear();
        self.queue.clear();
    }

    pub fn clear(&self) {
        let mut st = lock(&self.state);
        st.info = None;
        st.tasks.clear();
        st.killed.clear();
        self.queue.clear();
    }

    /// Adopta el valor si es más nuevo.
    pub fn offer_shared(&self, shared: Shared) -> bool {
        let mut st = lock(&self.state);
        match st.info.as_mut() {
            Some(info) => info.environment.offer_shared(shared),
            None => false,
        }
    }

    /// Marca el prefijo como muerto. Devuelve `false` si ya se conocía.
    pub fn kill(&self, task_id: TaskId) -> bool {
        let mut st = lock(&self.state);
        if st.killed.contains(&task_id) {
            return false;
        }
        debug!("{}: kill {}", self.me, task_id);
        st.killed.insert(task_id)
    }

    pub fn is_killed(&self, task_id: &TaskId) -> bool {
        lock(&self.state).killed.contains(task_id)
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        lock(&self.state).tasks.contains_key(task_id)
    }

    pub fn task(&self, task_id: &TaskId) -> Option<Task> {
        lock(&self.state).tasks.get(task_id).cloned()
    }

    pub fn live_tasks(&self) -> usize {
        lock(&self.state).tasks.len()
    }

    pub fn spawn(&self, task: Task) -> Vec<Assignment> {
        let mut out = Outbox::default();
        {
            let mut st = lock(&self.state);
            self.spawn_locked(&mut st, task, &mut out);
        }
        self.flush(out)
    }

    pub fn set_arg(&self, task_id: TaskId, index: ArgIndex, value: Value, critical_path_ms: u64) {
        let mut out = Outbox::default();
        {
            let mut st = lock(&self.state);
            self.set_arg_locked(&mut st, task_id, index, value, critical_path_ms, &mut out);
        }
        self.flush(out);
    }

    /// Resultado de un host. Devuelve las tareas cacheadas que quedaron
    /// asignadas al host que las generó.
    pub fn process_result(&self, info: TaskInfo) -> Vec<Assignment> {
        let mut out = Outbox::default();
        {
            let mut st = lock(&self.state);
            self.process_result_locked(&mut st, info, &mut out);
        }
        self.flush(out)
    }

    /// Devuelve a la cola una tarea de un host caído. Una compose incremental
    /// con entradas sin valor no vuelve: la despacha la próxima entrada.
    pub fn unassign(&self, task_id: &TaskId) -> bool {
        let mut st = lock(&self.state);
        if st.killed.contains(task_id) {
            return false;
        }
        match st.tasks.get_mut(task_id) {
            Some(task) if !task.is_ready() => {
                task.host = None;
                debug!("{}: {} espera entradas, no vuelve a la cola", self.me, task_id);
                false
            }
            Some(task) => {
                task.host = None;
                task.cached = false;
                self.queue.put(task.clone());
                debug!("{}: {} vuelve a la cola", self.me, task_id);
                true
            }
            None => false,
        }
    }

    /// Espera una tarea para `host`. Las tareas muertas o de otra sesión
    /// se descartan al salir de la cola.
    pub async fn request_task(&self, host: &str) -> Task {
        loop {
            let task = self.queue.remove().await;
            let mut st = lock(&self.state);
            if !Self::is_live(&st, &task.task_id) {
                debug!("{}: descarto {} al asignar", self.me, task.task_id);
                continue;
            }
            match st.tasks.get_mut(&task.task_id) {
                Some(stored) => {
                    stored.host = Some(host.to_string());
                    let mut task = task;
                    task.host = Some(host.to_string());
                    return task;
                }
                None => continue,
            }
        }
    }

    /// Parte de la cola para un vecino. Las tareas dejan de vivir acá.
    pub async fn request_tasks(&self, factor: usize) -> Vec<Task> {
        let tasks = self.queue.remove_tasks(factor).await;
        let mut st = lock(&self.state);
        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            if !Self::is_live(&st, &task.task_id) {
                continue;
            }
            // una tarea incremental sigue viva acá hasta completar sus entradas
            if st.tasks.get(&task.task_id).map_or(false, Task::is_ready) {
                st.tasks.remove(&task.task_id);
            }
            out.push(task);
        }
        out
    }

    /// Tareas que llegan de un vecino por difusión.
    pub fn receive_tasks(&self, tasks: Vec<Task>) {
        let mut st = lock(&self.state);
        for mut task in tasks {
            if !Self::is_live(&st, &task.task_id) {
                continue;
            }
            task.host = None;
            st.tasks.insert(task.task_id.clone(), task.clone());
            self.queue.put(task);
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let st = lock(&self.state);
        let mut tasks: Vec<Task> = st.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        SessionSnapshot {
            info: st.info.clone(),
            tasks,
        }
    }

    /// Reemplaza el estado con un snapshot. Las tareas listas vuelven a la
    /// cola sin host.
    pub fn restore(&self, snapshot: SessionSnapshot) {
        let mut st = lock(&self.state);
        self.queue.clear();
        st.killed.clear();
        st.info = snapshot.info;
        st.tasks.clear();
        for mut task in snapshot.tasks {
            task.host = None;
            task.cached = false;
            if task.is_ready() {
                self.queue.put(task.clone());
            }
            st.tasks.insert(task.task_id.clone(), task);
        }
        info!("{}: {} tareas restauradas", self.me, st.tasks.len());
    }

    fn is_live(st: &SessionState, task_id: &TaskId) -> bool {
        st.info.as_ref().map(|i| i.session_id) == Some(task_id.session_id())
            && !st.killed.contains(task_id)
    }

    /// Servidor que debe guardar la tarea.
    fn target(&self, st: &SessionState, task: &Task) -> Result<NodeId, ComputeError> {
        let routing = &st.routing;
        match (&task.service, &routing.service) {
            (Some(wanted), Some(mine)) if wanted == mine => Ok(self.me.clone()),
            (Some(wanted), _) => routing
                .providers
                .get(wanted)
                .cloned()
                .ok_or_else(|| ComputeError::NoProvider {
                    service: wanted.clone(),
                }),
            (None, Some(_)) => Ok(routing.root.clone().unwrap_or_else(|| self.me.clone())),
            (None, None) => Ok(self.me.clone()),
        }
    }

    fn spawn_locked(&self, st: &mut SessionState, mut task: Task, out: &mut Outbox) {
        if !Self::is_live(st, &task.task_id) {
            debug!("{}: spawn ignorado para {}", self.me, task.task_id);
            return;
        }

        let target = match self.target(st, &task) {
            Ok(target) => target,
            Err(e) => {
                warn!("{}: {}", self.me, e);
                let hsp = st.routing.hsp.clone();
                out.send(
                    &hsp,
                    Command::PutResult {
                        result: ComputationResult::failure(task.task_id.clone(), e),
                    },
                );
                return;
            }
        };
        if target != self.me {
            task.cached = false;
            out.send(&target, Command::Spawn { task });
            return;
        }

        if task.cached {
            if let Some(host) = task.spawning_host.clone() {
                task.host = Some(host.clone());
                out.assignments.push(Assignment {
                    host,
                    task_id: task.task_id.clone(),
                });
                st.tasks.insert(task.task_id.clone(), task);
                return;
            }
            task.cached = false;
        }

        let ready = task.is_ready();
        let id = task.task_id.clone();
        st.tasks.insert(id.clone(), task);
        if ready {
            self.dispatch(st, &id, None, out);
        }
    }

    /// Encola la tarea o la manda al host interno.
    fn dispatch(&self, st: &mut SessionState, task_id: &TaskId, trigger: Option<u16>, out: &mut Outbox) {
        let Some(task) = st.tasks.get_mut(task_id) else {
            return;
        };
        let on_server = task.service.is_none()
            && st.info.as_ref().map_or(false, |info| {
                self.registry.execute_on_server(task, &info.environment)
            });

        let mut copy = task.clone();
        copy.trigger = trigger;
        match (&st.routing.internal_host, on_server) {
            (Some(internal), true) => {
                task.host = Some(internal.clone());
                copy.host = Some(internal.clone());
                out.assignments.push(Assignment {
                    host: internal.clone(),
                    task_id: task_id.clone(),
                });
                let internal = internal.clone();
                out.send_to(
                    &internal,
                    Department::Compute,
                    Command::ExecuteTask {
                        task: copy,
                        input_index: trigger,
                    },
                );
            }
            _ => self.queue.put(copy),
        }
    }

    fn set_arg_locked(
        &self,
        st: &mut SessionState,
        task_id: TaskId,
        index: ArgIndex,
        value: Value,
        critical_path_ms: u64,
        out: &mut Outbox,
    ) {
        if !Self::is_live(st, &task_id) {
            debug!("{}: set_arg ignorado para {}", self.me, task_id);
            return;
        }

        let slot = match index {
            ArgIndex::Result => {
                info!("{}: resultado del cómputo {}", self.me, task_id);
                let hsp = st.routing.hsp.clone();
                out.send(
                    &hsp,
                    Command::PutResult {
                        result: ComputationResult::value(task_id, value, critical_path_ms),
                    },
                );
                return;
            }
            ArgIndex::Slot(slot) => slot,
        };

        let incremental = {
            let env = st.info.as_ref().map(|i| &i.environment);
            let Some(task) = st.tasks.get_mut(&task_id) else {
                // la compose ya terminó: llegada tardía o repetida
                debug!("{}: set_arg sin sucesor vivo {}", self.me, task_id);
                return;
            };
            if !task.set_input(slot, value) {
                debug!("{}: entrada {} de {} ya estaba", self.me, slot, task_id);
                return;
            }
            task.predecessor_critical_path_ms = task.predecessor_critical_path_ms.max(critical_path_ms);
            match env {
                Some(env) => self.registry.executes_incrementally(task, env),
                None => false,
            }
        };

        let ready = st.tasks.get(&task_id).map_or(false, Task::is_ready);
        if incremental {
            self.dispatch(st, &task_id, Some(slot), out);
        } else if ready {
            self.dispatch(st, &task_id, None, out);
        }
    }

    fn process_result_locked(&self, st: &mut SessionState, info: TaskInfo, out: &mut Outbox) {
        if !Self::is_live(st, &info.task_id) {
            debug!("{}: resultado descartado de {}", self.me, info.task_id);
            return;
        }
        let Some(done) = st.tasks.remove(&info.task_id) else {
            debug!("{}: resultado repetido de {}", self.me, info.task_id);
            return;
        };

        let TaskInfo {
            critical_path_ms,
            children,
            successor,
            ..
        } = info;

        if let Some(mut children) = children {
            let Some(mut compose) = children.pop() else {
                return;
            };
            compose.predecessor_critical_path_ms = critical_path_ms;
            // el host puede no saber dónde vive el sucesor (hijo cacheado)
            if done.task_server.is_some() {
                compose.task_server = done.task_server.clone();
            }
            let compose_server = self.target(st, &compose).unwrap_or_else(|_| self.me.clone());
            self.spawn_locked(st, compose, out);

            for mut child in children {
                child.task_server = Some(compose_server.clone());
                child.predecessor_critical_path_ms = critical_path_ms;
                self.spawn_locked(st, child, out);
            }
        } else if let Some(s) = successor {
            match done.task_server.filter(|server| *server != self.me) {
                Some(server) => out.send(
                    &server,
                    Command::SetArg {
                        task_id: s.task_id,
                        index: s.index,
                        value: s.value,
                        critical_path_ms,
                    },
                ),
                None => self.set_arg_locked(st, s.task_id, s.index, s.value, critical_path_ms, out),
            }
        }
    }

    fn flush(&self, out: Outbox) -> Vec<Assignment> {
        for (to, department, command) in out.mail {
            let _ = match department {
                Some(d) => self.network.send_to(&self.me, &to, d, command),
                None => self.network.send(&self.me, &to, command),
            };
        }
        out.assignments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::registry::{ExecContext, Outcome, TaskLogic};
    use crate::results::Successor;
    use serde_json::json;

    fn session_with(registry: TaskRegistry) -> Session {
        let s = Session::new(
            "ts".into(),
            Network::new(),
            Arc::new(registry),
            Routing {
                hsp: "hsp".into(),
                ..Default::default()
            },
        );
        s.login(SessionInfo {
            session_id: 7,
            environment: Environment::default(),
        });
        s
    }

    fn session() -> Session {
        session_with(TaskRegistry::with_builtins())
    }

    fn root(kind: &str, payload: Value) -> Task {
        let mut t = Task::new(kind, payload);
        t.init(7, 0, "ts".into());
        t
    }

    /// Simula lo que hace el host al descomponer `parent`.
    fn decompose(parent: &mut Task, n: usize) -> Vec<Task> {
        for i in 0..n {
            parent.compute(Task::new("value", json!(i)));
        }
        parent.init_compose(Task::new("sum", Value::Null));
        parent.take_children()
    }

    #[tokio::test]
    async fn raiz_lista_va_a_la_cola() {
        let s = session();
        s.spawn(root("value", json!(1)));
        assert_eq!(s.queue().len(), 1);
        assert_eq!(s.live_tasks(), 1);
    }

    #[tokio::test]
    async fn compose_queda_pendiente_y_se_despacha_con_sus_entradas() {
        let s = session();
        let mut parent = root("fib", json!({"n": 2}));
        s.spawn(parent.clone());
        let t = s.request_task("h").await;
        assert_eq!(t.host.as_deref(), Some("h"));

        let children = decompose(&mut parent, 2);
        let compose_id = children[2].task_id.clone();
        let mut info = TaskInfo::new("h".into(), &t, 3);
        info.children = Some(children);
        s.process_result(info);

        // dos hijos en cola, la compose esperando entradas
        assert_eq!(s.queue().len(), 2);
        assert!(!s.queue().contains(&compose_id));
        let compose = s.task(&compose_id).unwrap();
        assert_eq!(compose.num_inputs(), 2);

        s.set_arg(compose_id.clone(), ArgIndex::Slot(0), json!(1), 5);
        assert!(!s.queue().contains(&compose_id));
        s.set_arg(compose_id.clone(), ArgIndex::Slot(1), json!(2), 9);
        assert!(s.queue().contains(&compose_id));
        assert_eq!(s.task(&compose_id).unwrap().predecessor_critical_path_ms, 9);
    }

    #[tokio::test]
    async fn set_arg_repetido_no_despacha_dos_veces() {
        let s = session();
        let mut parent = root("fib", json!({"n": 2}));
        s.spawn(parent.clone());
        let t = s.request_task("h").await;
        let children = decompose(&mut parent, 1);
        let compose_id = children[1].task_id.clone();
        let mut info = TaskInfo::new("h".into(), &t, 1);
        info.children = Some(children);
        s.process_result(info);
        let _hijo = s.request_task("h").await;

        s.set_arg(compose_id.clone(), ArgIndex::Slot(0), json!(4), 1);
        s.set_arg(compose_id.clone(), ArgIndex::Slot(0), json!(4), 1);
        assert_eq!(s.queue().len(), 1);

        // compose terminada: el set_arg tardío se ignora
        let compose = s.request_task("h").await;
        s.process_result(TaskInfo::new("h".into(), &compose, 1));
        s.set_arg(compose_id.clone(), ArgIndex::Slot(0), json!(4), 1);
        assert!(s.queue().is_empty());
        assert!(!s.contains(&compose_id));
    }

    #[tokio::test]
    async fn tareas_bajo_un_prefijo_muerto_se_descartan() {
        let s = session();
        let mut parent = root("fib", json!({"n": 2}));
        s.spawn(parent.clone());
        let t = s.request_task("h").await;
        let children = decompose(&mut parent, 2);
        let hijo = children[0].clone();

        assert!(s.kill(parent.task_id.clone()));
        assert!(!s.kill(parent.task_id.clone()));

        let mut info = TaskInfo::new("h".into(), &t, 1);
        info.children = Some(children);
        s.process_result(info);
        s.spawn(hijo.clone());
        s.set_arg(hijo.task_id.child(0), ArgIndex::Slot(0), json!(1), 0);

        assert!(s.queue().is_empty());
        assert!(!s.contains(&hijo.task_id));
    }

    #[tokio::test]
    async fn unassign_devuelve_la_tarea_a_la_cola() {
        let s = session();
        let t = root("value", json!(1));
        s.spawn(t.clone());
        let asignada = s.request_task("h").await;
        assert!(s.queue().is_empty());

        assert!(s.unassign(&asignada.task_id));
        assert!(s.queue().contains(&t.task_id));
        assert_eq!(s.task(&t.task_id).unwrap().host, None);
    }

    #[tokio::test]
    async fn hijo_cacheado_se_asigna_al_host_que_lo_genero() {
        let s = session();
        let mut parent = root("fib", json!({"n": 2}));
        s.spawn(parent.clone());
        let t = s.request_task("h").await;
        let mut children = decompose(&mut parent, 2);
        children[0].cached = true;
        children[0].spawning_host = Some("h".into());
        let cached_id = children[0].task_id.clone();

        let mut info = TaskInfo::new("h".into(), &t, 1);
        info.children = Some(children);
        let assigned = s.process_result(info);

        assert_eq!(
            assigned,
            vec![Assignment {
                host: "h".into(),
                task_id: cached_id.clone()
            }]
        );
        assert!(!s.queue().contains(&cached_id));
        assert_eq!(s.queue().len(), 1);
    }

    #[tokio::test]
    async fn resultado_directo_llega_a_la_compose() {
        let s = session();
        let mut parent = root("fib", json!({"n": 2}));
        s.spawn(parent.clone());
        let t = s.request_task("h").await;
        let children = decompose(&mut parent, 1);
        let compose_id = children[1].task_id.clone();
        let mut info = TaskInfo::new("h".into(), &t, 1);
        info.children = Some(children);
        s.process_result(info);

        let hijo = s.request_task("h").await;
        let mut info = TaskInfo::new("h".into(), &hijo, 2);
        info.successor = Some(Successor {
            task_id: compose_id.clone(),
            index: ArgIndex::Slot(0),
            value: json!(10),
        });
        s.process_result(info);

        assert!(s.queue().contains(&compose_id));
        assert_eq!(s.task(&compose_id).unwrap().input(0), Some(&json!(10)));
    }

    struct Incremental;

    impl TaskLogic for Incremental {
        fn execute(&self, _task: &mut Task, _ctx: &mut ExecContext) -> anyhow::Result<Outcome> {
            Ok(Outcome::Value(json!(0)))
        }

        fn executes_incrementally(&self, _task: &Task, _env: &Environment) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn incremental_se_despacha_en_cada_entrada() {
        let mut registry = TaskRegistry::with_builtins();
        registry.register("inc", Incremental);
        let s = session_with(registry);

        let mut parent = root("fib", json!({"n": 2}));
        s.spawn(parent.clone());
        let t = s.request_task("h").await;
        parent.compute(Task::new("value", json!(1)));
        parent.compute(Task::new("value", json!(2)));
        parent.init_compose(Task::new("inc", Value::Null));
        let children = parent.take_children();
        let compose_id = children[2].task_id.clone();
        let mut info = TaskInfo::new("h".into(), &t, 1);
        info.children = Some(children);
        s.process_result(info);
        while !s.queue().is_empty() {
            s.request_task("h").await;
        }

        s.set_arg(compose_id.clone(), ArgIndex::Slot(1), json!(2), 0);
        let primera = s.request_task("h").await;
        assert_eq!(primera.task_id, compose_id);
        assert_eq!(primera.trigger, Some(1));
        assert_eq!(primera.unset_inputs(), 1);
    }

    #[tokio::test]
    async fn compose_incompleta_de_host_caido_espera_su_proxima_entrada() {
        let mut registry = TaskRegistry::with_builtins();
        registry.register("inc", Incremental);
        let s = session_with(registry);

        let mut parent = root("fib", json!({"n": 2}));
        s.spawn(parent.clone());
        let t = s.request_task("h").await;
        parent.compute(Task::new("value", json!(1)));
        parent.compute(Task::new("value", json!(2)));
        parent.init_compose(Task::new("inc", Value::Null));
        let children = parent.take_children();
        let compose_id = children[2].task_id.clone();
        let mut info = TaskInfo::new("h".into(), &t, 1);
        info.children = Some(children);
        s.process_result(info);
        while !s.queue().is_empty() {
            s.request_task("h").await;
        }
        s.set_arg(compose_id.clone(), ArgIndex::Slot(1), json!(2), 0);
        let _ = s.request_task("h").await;

        // el host pidió más entradas y se cayó
        assert!(!s.unassign(&compose_id));
        assert!(s.queue().is_empty());
        assert_eq!(s.task(&compose_id).unwrap().host, None);

        s.set_arg(compose_id.clone(), ArgIndex::Slot(0), json!(1), 0);
        let lista = s.request_task("h2").await;
        assert_eq!(lista.task_id, compose_id);
        assert_eq!(lista.unset_inputs(), 0);
    }

    /// Reenvía lo que recibe a un canal.
    struct Inbox(tokio::sync::mpsc::UnboundedSender<Command>);

    #[async_trait::async_trait]
    impl crate::network::Service for Inbox {
        fn department(&self, _command: &Command) -> Department {
            Department::Asap
        }

        async fn handle(&self, _from: NodeId, command: Command) -> crate::commands::Reply {
            let _ = self.0.send(command);
            crate::commands::Reply::Ack
        }
    }

    #[tokio::test]
    async fn valor_de_hijo_cacheado_va_al_servidor_de_su_compose() {
        let network = Network::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        network.register(
            "ts-gpu".into(),
            crate::network::Role::TaskServer,
            Arc::new(Inbox(tx)),
            &[(Department::Asap, 1)],
        );
        let s = Session::new(
            "ts".into(),
            network,
            Arc::new(TaskRegistry::with_builtins()),
            Routing {
                hsp: "hsp".into(),
                providers: HashMap::from([("gpu".to_string(), "ts-gpu".to_string())]),
                ..Default::default()
            },
        );
        s.login(SessionInfo {
            session_id: 7,
            environment: Environment::default(),
        });

        let mut parent = root("fib", json!({"n": 2}));
        s.spawn(parent.clone());
        let t = s.request_task("h").await;
        parent.compute(Task::new("fib", json!({"n": 1})));
        parent.compute(Task::new("value", json!(0)));
        parent.init_compose(Task::external("sum", Value::Null, "gpu"));
        let mut children = parent.take_children();
        let compose_id = children[2].task_id.clone();
        let copia = crate::host::promote_cacheable(&mut children, "fib", "h").unwrap();
        let mut info = TaskInfo::new("h".into(), &t, 1);
        info.children = Some(children);
        s.process_result(info);

        // la compose se fue al proveedor
        match rx.recv().await {
            Some(Command::Spawn { task }) => assert_eq!(task.task_id, compose_id),
            other => panic!("esperaba el spawn de la compose: {:?}", other.map(|c| c.name())),
        }

        // el host sólo conoce a su servidor y le devuelve el valor
        let mut info = TaskInfo::new("h".into(), &copia, 1);
        info.successor = Some(Successor {
            task_id: compose_id.clone(),
            index: ArgIndex::Slot(0),
            value: json!(1),
        });
        s.process_result(info);
        match rx.recv().await {
            Some(Command::SetArg { task_id, index, value, .. }) => {
                assert_eq!(task_id, compose_id);
                assert_eq!(index, ArgIndex::Slot(0));
                assert_eq!(value, json!(1));
            }
            other => panic!("esperaba el set_arg: {:?}", other.map(|c| c.name())),
        }
    }

    #[tokio::test]
    async fn snapshot_y_restore_reencolan_las_listas() {
        let s = session();
        s.spawn(root("value", json!(3)));
        let _ = s.request_task("h").await;
        let snap = s.snapshot();
        assert_eq!(snap.tasks.len(), 1);

        let otra = session();
        otra.restore(snap);
        assert_eq!(otra.queue().len(), 1);
        assert_eq!(otra.session_id(), Some(7));
    }
}
