use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::environment::{Environment, Shared};
use crate::task::Task;

/// Lo que devuelve la ejecución de una tarea.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Valor terminal, va a la ranura del sucesor
    Value(Value),
    /// La tarea se descompuso con `Task::compute`; esta es la compose
    Compose(Task),
    /// Sólo en ejecución incremental: faltan entradas
    NeedMoreInputs,
}

/// Lo que una tarea ve del host mientras corre.
#[derive(Debug, Clone)]
pub struct ExecContext {
    environment: Environment,
    proposed: Option<Shared>,
}

impl ExecContext {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            proposed: None,
        }
    }

    pub fn input(&self) -> &Value {
        &self.environment.input
    }

    pub fn shared(&self) -> Option<&Shared> {
        self.environment.shared.as_ref()
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Propone un valor compartido; sólo se propaga si es más nuevo.
    pub fn set_shared(&mut self, shared: Shared) {
        if self.environment.offer_shared(shared.clone()) {
            self.proposed = Some(shared);
        }
    }

    pub fn take_proposed_shared(&mut self) -> Option<Shared> {
        self.proposed.take()
    }
}

/// Lógica de un tipo de tarea.
pub trait TaskLogic: Send + Sync {
    fn execute(&self, task: &mut Task, ctx: &mut ExecContext) -> Result<Outcome>;

    /// Se invoca al llegar cada entrada si `executes_incrementally`.
    fn execute_incremental(
        &self,
        task: &mut Task,
        index: u16,
        ctx: &mut ExecContext,
    ) -> Result<Outcome> {
        let _ = index;
        if task.is_ready() {
            self.execute(task, ctx)
        } else {
            Ok(Outcome::NeedMoreInputs)
        }
    }

    /// No se descompone (habilita prefetch en el host).
    fn is_atomic(&self, _task: &Task, _env: &Environment) -> bool {
        false
    }

    fn executes_incrementally(&self, _task: &Task, _env: &Environment) -> bool {
        false
    }

    /// Se ejecuta en el host interno del servidor en vez de encolarse.
    fn execute_on_server(&self, _task: &Task, _env: &Environment) -> bool {
        false
    }
}

/// Registro `kind -> lógica`, inyectado en hosts y servidores.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    logic: HashMap<String, Arc<dyn TaskLogic>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registro con las tareas de demo (`fib`, `sum`, `value`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("fib", FibTask);
        registry.register("sum", SumTask);
        registry.register("value", ValueTask);
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, logic: impl TaskLogic + 'static) {
        self.logic.insert(kind.into(), Arc::new(logic));
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn TaskLogic>> {
        self.logic.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.logic.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn is_atomic(&self, task: &Task, env: &Environment) -> bool {
        self.get(&task.kind).map_or(false, |l| l.is_atomic(task, env))
    }

    pub fn executes_incrementally(&self, task: &Task, env: &Environment) -> bool {
        self.get(&task.kind)
            .map_or(false, |l| l.executes_incrementally(task, env))
    }

    pub fn execute_on_server(&self, task: &Task, env: &Environment) -> bool {
        self.get(&task.kind)
            .map_or(false, |l| l.execute_on_server(task, env))
    }
}

/* --------- tareas de demo --------- */

fn payload_u64(task: &Task, field: &str) -> Result<u64> {
    task.payload
        .get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow!("payload sin campo numérico '{}'", field))
}

/// Fibonacci por descomposición: `{"n": N}`.
pub struct FibTask;

impl TaskLogic for FibTask {
    fn execute(&self, task: &mut Task, _ctx: &mut ExecContext) -> Result<Outcome> {
        let n = payload_u64(task, "n")?;
        if n < 2 {
            return Ok(Outcome::Value(json!(n)));
        }
        task.compute(Task::new("fib", json!({ "n": n - 1 })));
        task.compute(Task::new("fib", json!({ "n": n - 2 })));
        Ok(Outcome::Compose(Task::new("sum", Value::Null)))
    }

    fn is_atomic(&self, task: &Task, _env: &Environment) -> bool {
        payload_u64(task, "n").map_or(true, |n| n < 2)
    }
}

/// Suma sus entradas numéricas.
pub struct SumTask;

impl TaskLogic for SumTask {
    fn execute(&self, task: &mut Task, _ctx: &mut ExecContext) -> Result<Outcome> {
        let mut total: i64 = 0;
        for (i, input) in task.inputs().iter().enumerate() {
            let v = input
                .as_ref()
                .and_then(Value::as_i64)
                .ok_or_else(|| anyhow!("entrada {} no numérica", i))?;
            total += v;
        }
        Ok(Outcome::Value(json!(total)))
    }

    fn is_atomic(&self, _task: &Task, _env: &Environment) -> bool {
        true
    }
}

/// Devuelve su payload tal cual.
pub struct ValueTask;

impl TaskLogic for ValueTask {
    fn execute(&self, task: &mut Task, _ctx: &mut ExecContext) -> Result<Outcome> {
        Ok(Outcome::Value(task.payload.clone()))
    }

    fn is_atomic(&self, _task: &Task, _env: &Environment) -> bool {
        true
    }
}
