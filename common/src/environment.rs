use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Valor compartido entre todas las tareas de una sesión.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shared {
    pub version: u64,
    pub value: Value,
}

impl Shared {
    pub fn new(version: u64, value: Value) -> Self {
        Self { version, value }
    }

    pub fn is_newer_than(&self, current: Option<&Shared>) -> bool {
        current.map_or(true, |c| self.version > c.version)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    /// Entrada global del cliente, de sólo lectura para las tareas
    pub input: Value,
    pub shared: Option<Shared>,
}

impl Environment {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            shared: None,
        }
    }

    /// Adopta `shared` si es más nuevo. Devuelve si hubo cambio.
    pub fn offer_shared(&mut self, shared: Shared) -> bool {
        if shared.is_newer_than(self.shared.as_ref()) {
            self.shared = Some(shared);
            true
        } else {
            false
        }
    }
}

/// Lo que un nodo necesita saber de la sesión activa.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: i64,
    pub environment: Environment,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientProfile {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shared_solo_acepta_versiones_mayores() {
        let mut env = Environment::new(json!(null));
        assert!(env.offer_shared(Shared::new(2, json!(10))));
        assert!(!env.offer_shared(Shared::new(2, json!(5))));
        assert!(!env.offer_shared(Shared::new(1, json!(5))));
        assert!(env.offer_shared(Shared::new(3, json!(4))));
        assert_eq!(env.shared, Some(Shared::new(3, json!(4))));
    }
}
