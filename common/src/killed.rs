use serde::{Deserialize, Serialize};

use crate::task_id::TaskId;

/// Conjunto de prefijos de tareas muertas.
///
/// Marcar es O(1); consultar recorre los k prefijos marcados.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilledTasks {
    prefixes: Vec<TaskId>,
}

impl KilledTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Devuelve `false` si el id ya estaba marcado.
    pub fn insert(&mut self, task_id: TaskId) -> bool {
        if self.prefixes.contains(&task_id) {
            return false;
        }
        self.prefixes.push(task_id);
        true
    }

    /// Verdadero si algún ancestro (o el propio id) fue marcado.
    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.prefixes.iter().any(|k| k.is_ancestor(task_id))
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    pub fn clear(&mut self) {
        self.prefixes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marca_todo_el_subarbol() {
        let padre = TaskId::new(5, 0).child(2);
        let mut killed = KilledTasks::new();
        assert!(killed.insert(padre.clone()));

        assert!(killed.contains(&padre));
        assert!(killed.contains(&padre.child(1).child(3)));
        assert!(killed.contains(&padre.child(0)));
        assert!(!killed.contains(&TaskId::new(5, 0).child(1)));
        assert!(!killed.contains(&TaskId::new(5, 0)));
    }

    #[test]
    fn insertar_dos_veces_no_duplica() {
        let id = TaskId::new(1, 1);
        let mut killed = KilledTasks::new();
        assert!(killed.insert(id.clone()));
        assert!(!killed.insert(id));
        assert_eq!(killed.len(), 1);
    }
}
