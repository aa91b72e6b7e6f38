use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task_id::TaskId;
use crate::NodeId;

/// Ranura de destino del valor de una tarea.
///
/// `Result` indica que el valor es el resultado final del cómputo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgIndex {
    Result,
    Slot(u16),
}

/// Nodo del grafo de tareas.
///
/// El comportamiento lo aporta la lógica registrada para `kind`; acá sólo
/// vive el estado del grafo: entradas, hijos, sucesor y tiempos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub kind: String,
    pub payload: Value,

    pub task_id: TaskId,
    /// Distancia a la raíz del cómputo (prioridad en la cola)
    pub level: u16,

    inputs: Vec<Option<Value>>,
    unset_inputs: usize,
    children: Vec<Task>,

    successor: Option<TaskId>,
    successor_index: ArgIndex,

    /// Servidor que guarda al sucesor de esta tarea
    pub task_server: Option<NodeId>,
    pub host: Option<NodeId>,

    pub cached: bool,
    pub spawning_host: Option<NodeId>,

    pub predecessor_critical_path_ms: u64,

    /// Clase de servicio externo que debe atender esta tarea (si aplica)
    pub service: Option<String>,
    /// Entrada que disparó una ejecución incremental
    pub trigger: Option<u16>,
}

impl Task {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            task_id: TaskId::default(),
            level: 0,
            inputs: Vec::new(),
            unset_inputs: 0,
            children: Vec::new(),
            successor: None,
            successor_index: ArgIndex::Result,
            task_server: None,
            host: None,
            cached: false,
            spawning_host: None,
            predecessor_critical_path_ms: 0,
            service: None,
            trigger: None,
        }
    }

    /// Tarea atendida por un servidor externo de la clase `service`.
    pub fn external(kind: impl Into<String>, payload: Value, service: impl Into<String>) -> Self {
        let mut task = Self::new(kind, payload);
        task.service = Some(service.into());
        task
    }

    /// Prepara la tarea raíz de un cómputo: su sucesor es ella misma con
    /// índice `Result`.
    pub fn init(&mut self, session_id: i64, computation_id: i16, task_server: NodeId) {
        self.task_id = TaskId::new(session_id, computation_id);
        self.successor = Some(self.task_id.clone());
        self.successor_index = ArgIndex::Result;
        self.level = 0;
        self.task_server = Some(task_server);
    }

    /// Declara una subtarea. Su salida va a la compose (hijo 0) en la ranura
    /// igual a la cantidad de hijos previos.
    pub fn compute(&mut self, mut child: Task) -> TaskId {
        let slot = self.children.len() as u16;
        child.successor = Some(self.task_id.child(0));
        child.successor_index = ArgIndex::Slot(slot);
        child.task_id = self.task_id.child(slot as i16 + 1);
        child.level = self.level + 1;
        let id = child.task_id.clone();
        self.children.push(child);
        id
    }

    /// Agrega la compose al final de los hijos, con tantas entradas como
    /// subtareas declaradas.
    pub fn init_compose(&mut self, mut compose: Task) {
        let n = self.children.len();
        compose.task_server = self.task_server.clone();
        compose.successor = self.successor.clone();
        compose.successor_index = self.successor_index;
        compose.task_id = self.task_id.child(0);
        compose.level = self.level;
        compose.inputs = vec![None; n];
        compose.unset_inputs = n;
        self.children.push(compose);
    }

    /// Escribe una entrada. Devuelve `false` si la ranura no existe o ya
    /// tenía valor.
    pub fn set_input(&mut self, index: u16, value: Value) -> bool {
        match self.inputs.get_mut(index as usize) {
            Some(slot @ None) => {
                *slot = Some(value);
                self.unset_inputs -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn input(&self, index: usize) -> Option<&Value> {
        self.inputs.get(index).and_then(|v| v.as_ref())
    }

    pub fn inputs(&self) -> &[Option<Value>] {
        &self.inputs
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn unset_inputs(&self) -> usize {
        self.unset_inputs
    }

    pub fn is_ready(&self) -> bool {
        self.unset_inputs == 0
    }

    pub fn children(&self) -> &[Task] {
        &self.children
    }

    pub fn take_children(&mut self) -> Vec<Task> {
        std::mem::take(&mut self.children)
    }

    pub fn successor(&self) -> Option<&TaskId> {
        self.successor.as_ref()
    }

    pub fn successor_index(&self) -> ArgIndex {
        self.successor_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raiz() -> Task {
        let mut t = Task::new("fib", json!({"n": 5}));
        t.init(42, 3, "ts-0".to_string());
        t
    }

    #[test]
    fn init_apunta_el_sucesor_a_si_misma() {
        let t = raiz();
        assert_eq!(t.successor(), Some(&TaskId::new(42, 3)));
        assert_eq!(t.successor_index(), ArgIndex::Result);
        assert_eq!(t.level, 0);
    }

    #[test]
    fn compute_numera_hijos_desde_uno() {
        let mut t = raiz();
        let a = t.compute(Task::new("fib", json!({"n": 4})));
        let b = t.compute(Task::new("fib", json!({"n": 3})));

        assert_eq!(a, TaskId::new(42, 3).child(1));
        assert_eq!(b, TaskId::new(42, 3).child(2));
        let hijos = t.children();
        assert_eq!(hijos[1].successor(), Some(&TaskId::new(42, 3).child(0)));
        assert_eq!(hijos[1].successor_index(), ArgIndex::Slot(1));
        assert_eq!(hijos[0].level, 1);
    }

    #[test]
    fn compose_queda_ultima_con_sufijo_cero() {
        for n in 1..5 {
            let mut t = raiz();
            for _ in 0..n {
                t.compute(Task::new("fib", json!({"n": 1})));
            }
            t.init_compose(Task::new("sum", Value::Null));

            let compose = t.children().last().unwrap();
            assert!(compose.task_id.is_compose());
            assert_eq!(compose.task_id, TaskId::new(42, 3).child(0));
            assert_eq!(compose.num_inputs(), n);
            assert_eq!(compose.unset_inputs(), n);
            assert_eq!(compose.successor(), Some(&TaskId::new(42, 3)));
            assert_eq!(compose.successor_index(), ArgIndex::Result);
            assert_eq!(compose.task_server.as_deref(), Some("ts-0"));
        }
    }

    #[test]
    fn set_input_ignora_ranura_repetida() {
        let mut t = raiz();
        t.compute(Task::new("fib", json!({"n": 1})));
        t.compute(Task::new("fib", json!({"n": 0})));
        t.init_compose(Task::new("sum", Value::Null));
        let mut compose = t.take_children().pop().unwrap();

        assert!(compose.set_input(0, json!(1)));
        assert!(!compose.set_input(0, json!(9)));
        assert!(!compose.set_input(7, json!(9)));
        assert_eq!(compose.unset_inputs(), 1);
        assert!(compose.set_input(1, json!(0)));
        assert!(compose.is_ready());
        assert_eq!(compose.input(0), Some(&json!(1)));
    }
}
