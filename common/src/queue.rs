use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::lock;
use crate::task::Task;
use crate::task_id::TaskId;

/// Sobre este tamaño se sacan tareas del nivel más bajo para frenar el
/// ritmo de spawn.
pub const THRESHOLD: usize = 200;

type DiffusionHook = Box<dyn Fn() + Send + Sync>;

/// Tareas listas sin asignar, agrupadas por nivel.
pub struct PriorityTaskQueue {
    levels: Mutex<Levels>,
    available: Notify,
    on_empty: Option<DiffusionHook>,
    /// Un pedido de difusión por período vacío
    diffusion_armed: AtomicBool,
    waiters: AtomicUsize,
}

#[derive(Default)]
struct Levels {
    buckets: BTreeMap<u16, Vec<Task>>,
    size: usize,
}

impl Levels {
    fn pop(&mut self) -> Option<Task> {
        let level = if self.size > THRESHOLD {
            *self.buckets.keys().next()?
        } else {
            *self.buckets.keys().next_back()?
        };
        let bucket = self.buckets.get_mut(&level)?;
        let task = bucket.pop()?;
        if bucket.is_empty() {
            self.buckets.remove(&level);
        }
        self.size -= 1;
        Some(task)
    }
}

impl PriorityTaskQueue {
    pub fn new() -> Self {
        Self {
            levels: Mutex::new(Levels::default()),
            available: Notify::new(),
            on_empty: None,
            diffusion_armed: AtomicBool::new(true),
            waiters: AtomicUsize::new(0),
        }
    }

    /// `on_empty` se llama cuando `remove` encuentra la cola vacía.
    pub fn with_diffusion(on_empty: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            on_empty: Some(Box::new(on_empty)),
            ..Self::new()
        }
    }

    pub fn put(&self, task: Task) {
        {
            let mut levels = lock(&self.levels);
            levels.buckets.entry(task.level).or_default().push(task);
            levels.size += 1;
        }
        self.diffusion_armed.store(true, Ordering::SeqCst);
        self.available.notify_one();
    }

    pub fn try_remove(&self) -> Option<Task> {
        lock(&self.levels).pop()
    }

    /// Espera hasta que haya una tarea. No tiene timeout.
    pub async fn remove(&self) -> Task {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.try_remove() {
                return task;
            }

            if let Some(hook) = &self.on_empty {
                if self.diffusion_armed.swap(false, Ordering::SeqCst) {
                    hook();
                }
            }

            self.waiters.fetch_add(1, Ordering::SeqCst);
            notified.await;
            self.waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Entrega hasta `max(1, len / factor)` tareas a un vecino. Sólo espera
    /// por la primera; si la cola se vacía antes, devuelve menos en lugar de
    /// bloquear al vecino por cada tarea que falte.
    pub async fn remove_tasks(&self, factor: usize) -> Vec<Task> {
        let n = (self.len() / factor.max(1)).max(1);
        let mut out = Vec::with_capacity(n);
        out.push(self.remove().await);
        // el resto sin esperar: otro consumidor pudo vaciar la cola
        while out.len() < n {
            match self.try_remove() {
                Some(task) => out.push(task),
                None => break,
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        lock(&self.levels).size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        lock(&self.levels)
            .buckets
            .values()
            .any(|b| b.iter().any(|t| &t.task_id == task_id))
    }

    pub fn clear(&self) {
        let mut levels = lock(&self.levels);
        levels.buckets.clear();
        levels.size = 0;
    }
}

impl Default for PriorityTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
