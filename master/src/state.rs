// master/src/state.rs

use common::api::ClientId;
use common::cluster::LocalCluster;
use common::hsp::HspClient;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<LocalCluster>,
    // clientes con sesión abierta (o esperando turno de login)
    pub clients: Arc<Mutex<HashMap<ClientId, Arc<tokio::sync::Mutex<HspClient>>>>>,
}

impl AppState {
    pub fn new(cluster: LocalCluster) -> Self {
        Self {
            cluster: Arc::new(cluster),
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn client(&self, id: &str) -> Option<Arc<tokio::sync::Mutex<HspClient>>> {
        common::lock(&self.clients).get(id).cloned()
    }
}
