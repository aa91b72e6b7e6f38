use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identificador jerárquico de una tarea.
///
/// `path` es la secuencia de índices de hijo desde la raíz del cómputo.
/// Un path que termina en `0` identifica una tarea compose.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    session_id: i64,
    computation_id: i16,
    path: Vec<i16>,
}

impl TaskId {
    /// Id de la tarea raíz de un cómputo.
    pub fn new(session_id: i64, computation_id: i16) -> Self {
        Self {
            session_id,
            computation_id,
            path: Vec::new(),
        }
    }

    pub fn from_parts(session_id: i64, computation_id: i16, path: Vec<i16>) -> Self {
        Self {
            session_id,
            computation_id,
            path,
        }
    }

    pub fn child(&self, index: i16) -> TaskId {
        let mut path = self.path.clone();
        path.push(index);
        TaskId {
            session_id: self.session_id,
            computation_id: self.computation_id,
            path,
        }
    }

    /// `None` para la raíz del cómputo.
    pub fn parent_id(&self) -> Option<TaskId> {
        if self.path.is_empty() {
            return None;
        }
        let mut path = self.path.clone();
        path.pop();
        Some(TaskId {
            session_id: self.session_id,
            computation_id: self.computation_id,
            path,
        })
    }

    /// Verdadero si `self` es prefijo (estricto o igual) de `other`.
    pub fn is_ancestor(&self, other: &TaskId) -> bool {
        self.session_id == other.session_id
            && self.computation_id == other.computation_id
            && self.path.len() <= other.path.len()
            && other.path.starts_with(&self.path)
    }

    pub fn computation_equals(&self, other: &TaskId) -> bool {
        self.session_id == other.session_id && self.computation_id == other.computation_id
    }

    pub fn is_compose(&self) -> bool {
        self.path.last() == Some(&0)
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    pub fn computation_id(&self) -> i16 {
        self.computation_id
    }

    pub fn path(&self) -> &[i16] {
        &self.path
    }

    pub fn depth(&self) -> usize {
        self.path.len()
    }
}

impl Ord for TaskId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.session_id
            .cmp(&other.session_id)
            .then(self.computation_id.cmp(&other.computation_id))
            .then(self.path.len().cmp(&other.path.len()))
            .then_with(|| self.path.cmp(&other.path))
    }
}

impl PartialOrd for TaskId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.session_id, self.computation_id)?;
        for p in &self.path {
            write!(f, ".{}", p)?;
        }
        Ok(())
    }
}
