use tracing::warn;

use crate::commands::{Command, Department};
use crate::error::TransportError;
use crate::network::{FailureHandler, Network, Role};

/// Manejador por defecto: si un servidor de tareas no puede hablar con un
/// nodo, se avisa a sí mismo para darlo de baja. El servidor decide si era
/// un host (se reasignan sus tareas) o un vecino (sólo se loguea).
pub struct RecoveryHandler;

impl FailureHandler for RecoveryHandler {
    fn handle(&self, network: &Network, error: &TransportError, from: &str, to: &str) {
        match network.role(from) {
            Some(Role::TaskServer) if from != to => {
                warn!("{} no puede hablar con {}: {}", from, to, error);
                let _ = network.send_to(
                    from,
                    from,
                    Department::Asap,
                    Command::UnregisterHost {
                        host: to.to_string(),
                    },
                );
            }
            _ => warn!("falla de transporte {} -> {}: {}", from, to, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Reply;
    use crate::network::Service;
    use crate::{lock, NodeId};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct Server {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Service for Server {
        fn department(&self, _command: &Command) -> Department {
            Department::Asap
        }

        async fn handle(&self, _from: NodeId, command: Command) -> Reply {
            if let Command::UnregisterHost { host } = command {
                lock(&self.seen).push(host);
            }
            Reply::Ack
        }
    }

    #[tokio::test]
    async fn servidor_recibe_baja_del_nodo_caido() {
        let net = Network::new();
        let ts = Arc::new(Server {
            seen: Mutex::new(Vec::new()),
        });
        net.register("ts".into(), Role::TaskServer, ts.clone(), &[(Department::Asap, 1)]);

        assert!(net.send("ts", "host-perdido", Command::Ping).is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*lock(&ts.seen), vec!["host-perdido".to_string()]);
    }
}
