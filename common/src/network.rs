use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::commands::{Command, Department, Reply};
use crate::error::TransportError;
use crate::failure::RecoveryHandler;
use crate::http::{self, Envelope};
use crate::{lock, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Hsp,
    TaskServer,
    Host,
}

/// Nodo direccionable en la red.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn department(&self, command: &Command) -> Department;

    async fn handle(&self, from: NodeId, command: Command) -> Reply;
}

/// Se invoca cuando falla un envío o una llamada.
pub trait FailureHandler: Send + Sync {
    fn handle(&self, network: &Network, error: &TransportError, from: &str, to: &str);
}

struct Letter {
    from: NodeId,
    command: Command,
    reply: Option<oneshot::Sender<Reply>>,
}

struct Desk {
    tx: mpsc::UnboundedSender<Letter>,
    pending: Arc<AtomicUsize>,
    paused: watch::Sender<bool>,
}

struct Mailbox {
    role: Role,
    service: Arc<dyn Service>,
    desks: HashMap<Department, Desk>,
}

struct NetworkInner {
    nodes: Mutex<HashMap<NodeId, Arc<Mailbox>>>,
    failure: Mutex<Arc<dyn FailureHandler>>,
    http: reqwest::Client,
    outbound: Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
}

/// Red de nodos. Los ids `nombre@host:puerto` que no son locales se
/// entregan por HTTP.
#[derive(Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

/// Parte `host:puerto` de un id remoto.
pub fn remote_authority(id: &str) -> Option<&str> {
    id.rsplit_once('@')
        .map(|(_, authority)| authority)
        .filter(|a| !a.is_empty())
}

impl Network {
    pub fn new() -> Self {
        Self::with_failure_handler(Arc::new(RecoveryHandler))
    }

    pub fn with_failure_handler(handler: Arc<dyn FailureHandler>) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                nodes: Mutex::new(HashMap::new()),
                failure: Mutex::new(handler),
                http: reqwest::Client::new(),
                outbound: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn set_failure_handler(&self, handler: Arc<dyn FailureHandler>) {
        *lock(&self.inner.failure) = handler;
    }

    /// Registra un nodo local y arranca un loop por procesador de cada
    /// departamento. Debe llamarse dentro de un runtime de tokio.
    pub fn register(
        &self,
        id: NodeId,
        role: Role,
        service: Arc<dyn Service>,
        departments: &[(Department, usize)],
    ) {
        let mut desks = HashMap::new();
        for &(department, processors) in departments {
            let (tx, rx) = mpsc::unbounded_channel();
            let (paused, paused_rx) = watch::channel(false);
            let pending = Arc::new(AtomicUsize::new(0));
            let rx = Arc::new(tokio::sync::Mutex::new(rx));

            for _ in 0..processors.max(1) {
                tokio::spawn(run_department(
                    id.clone(),
                    department,
                    service.clone(),
                    rx.clone(),
                    paused_rx.clone(),
                    pending.clone(),
                ));
            }
            desks.insert(
                department,
                Desk {
                    tx,
                    pending,
                    paused,
                },
            );
        }

        debug!("nodo {} registrado ({:?})", id, role);
        lock(&self.inner.nodes).insert(
            id,
            Arc::new(Mailbox {
                role,
                service,
                desks,
            }),
        );
    }

    /// Saca un nodo local de la red. Sus departamentos terminan al vaciarse.
    pub fn disconnect(&self, id: &str) -> bool {
        let removed = lock(&self.inner.nodes).remove(id).is_some();
        if removed {
            debug!("nodo {} desconectado", id);
        }
        removed
    }

    pub fn is_local(&self, id: &str) -> bool {
        lock(&self.inner.nodes).contains_key(id)
    }

    pub fn role(&self, id: &str) -> Option<Role> {
        lock(&self.inner.nodes).get(id).map(|m| m.role)
    }

    pub fn local_nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = lock(&self.inner.nodes).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Comandos encolados y todavía no tomados en un departamento.
    pub fn pending(&self, id: &str, department: Department) -> usize {
        lock(&self.inner.nodes)
            .get(id)
            .and_then(|m| m.desks.get(&department))
            .map_or(0, |d| d.pending.load(Ordering::SeqCst))
    }

    pub fn pause(&self, id: &str, departments: &[Department]) {
        self.set_paused(id, departments, true);
    }

    pub fn resume(&self, id: &str, departments: &[Department]) {
        self.set_paused(id, departments, false);
    }

    fn set_paused(&self, id: &str, departments: &[Department], value: bool) {
        let nodes = lock(&self.inner.nodes);
        if let Some(mailbox) = nodes.get(id) {
            for d in departments {
                if let Some(desk) = mailbox.desks.get(d) {
                    desk.paused.send_replace(value);
                }
            }
        }
    }

    /// Envío sin respuesta. Un `Batch` se reparte en orden.
    pub fn send(&self, from: &str, to: &str, command: Command) -> Result<(), TransportError> {
        let result = self.route(from, to, None, command);
        if let Err(e) = &result {
            self.fail(e, from, to);
        }
        result
    }

    /// Como `send`, pero a un departamento fijo de un nodo local.
    pub fn send_to(
        &self,
        from: &str,
        to: &str,
        department: Department,
        command: Command,
    ) -> Result<(), TransportError> {
        let result = self.route(from, to, Some(department), command);
        if let Err(e) = &result {
            self.fail(e, from, to);
        }
        result
    }

    /// Envío con respuesta y timeout.
    pub async fn call(
        &self,
        from: &str,
        to: &str,
        command: Command,
        timeout: Duration,
    ) -> Result<Reply, TransportError> {
        let result = self.call_inner(from, to, command, timeout).await;
        if let Err(e) = &result {
            self.fail(e, from, to);
        }
        result
    }

    fn route(
        &self,
        from: &str,
        to: &str,
        department: Option<Department>,
        command: Command,
    ) -> Result<(), TransportError> {
        if let Command::Batch { commands } = command {
            for c in commands {
                self.route(from, to, department, c)?;
            }
            return Ok(());
        }
        if self.is_local(to) {
            return self.deliver(from, to, department, command, None);
        }
        match remote_authority(to) {
            Some(authority) => self.enqueue_remote(authority, Envelope::new(from, to, command)),
            None => Err(TransportError::Unreachable(to.to_string())),
        }
    }

    fn deliver(
        &self,
        from: &str,
        to: &str,
        department: Option<Department>,
        command: Command,
        reply: Option<oneshot::Sender<Reply>>,
    ) -> Result<(), TransportError> {
        let mailbox = lock(&self.inner.nodes)
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(to.to_string()))?;

        let department = department.unwrap_or_else(|| mailbox.service.department(&command));
        let desk = mailbox
            .desks
            .get(&department)
            .or_else(|| mailbox.desks.get(&Department::Asap))
            .ok_or_else(|| TransportError::Disconnected(to.to_string()))?;

        desk.pending.fetch_add(1, Ordering::SeqCst);
        desk.tx
            .send(Letter {
                from: from.to_string(),
                command,
                reply,
            })
            .map_err(|_| {
                desk.pending.fetch_sub(1, Ordering::SeqCst);
                TransportError::Disconnected(to.to_string())
            })
    }

    async fn call_inner(
        &self,
        from: &str,
        to: &str,
        command: Command,
        timeout: Duration,
    ) -> Result<Reply, TransportError> {
        if self.is_local(to) {
            let (tx, rx) = oneshot::channel();
            self.deliver(from, to, None, command, Some(tx))?;
            return match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(_)) => Err(TransportError::Disconnected(to.to_string())),
                Err(_) => Err(TransportError::Timeout {
                    to: to.to_string(),
                    after_ms: timeout.as_millis() as u64,
                }),
            };
        }
        match remote_authority(to) {
            Some(authority) => {
                let envelope = Envelope::new(from, to, command);
                http::post_call(&self.inner.http, authority, &envelope, timeout).await
            }
            None => Err(TransportError::Unreachable(to.to_string())),
        }
    }

    fn enqueue_remote(&self, authority: &str, envelope: Envelope) -> Result<(), TransportError> {
        let to = envelope.to.clone();
        let mut outbound = lock(&self.inner.outbound);
        let tx = outbound.entry(authority.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(http::run_outbound(
                self.clone(),
                self.inner.http.clone(),
                authority.to_string(),
                rx,
            ));
            tx
        });
        tx.send(envelope)
            .map_err(|_| TransportError::Disconnected(to))
    }

    pub(crate) fn fail(&self, error: &TransportError, from: &str, to: &str) {
        let handler = lock(&self.inner.failure).clone();
        handler.handle(self, error, from, to);
    }

    /// Correo que llegó por HTTP. Sólo se entrega a nodos locales.
    pub fn accept(&self, envelope: Envelope) -> Result<(), TransportError> {
        let Envelope { from, to, command } = envelope;
        if !self.is_local(&to) {
            return Err(TransportError::Unreachable(to));
        }
        self.route(&from, &to, None, command)
    }

    /// Llamada que llegó por HTTP.
    pub async fn accept_call(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Reply, TransportError> {
        let Envelope { from, to, command } = envelope;
        if !self.is_local(&to) {
            return Err(TransportError::Unreachable(to));
        }
        self.call_inner(&from, &to, command, timeout).await
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_department(
    id: NodeId,
    department: Department,
    service: Arc<dyn Service>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Letter>>>,
    mut paused: watch::Receiver<bool>,
    pending: Arc<AtomicUsize>,
) {
    loop {
        let letter = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(letter) = letter else {
            break;
        };

        // si el nodo ya no existe el sender se cayó y seguimos de largo
        let _ = paused.wait_for(|p| !*p).await;
        pending.fetch_sub(1, Ordering::SeqCst);

        let name = letter.command.name();
        let reply = service.handle(letter.from, letter.command).await;
        if let Some(tx) = letter.reply {
            if tx.send(reply).is_err() {
                warn!("{}: nadie esperaba la respuesta de {}", id, name);
            }
        }
    }
    debug!("{}: departamento {:?} cerrado", id, department);
}
