use axum::{extract::State, http::StatusCode, routing::{get, post}, Json, Router};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::commands::{Command, Reply};
use crate::config;
use crate::error::TransportError;
use crate::network::Network;
use crate::NodeId;

/// Comando entre procesos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub command: Command,
}

impl Envelope {
    pub fn new(from: &str, to: &str, command: Command) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            command,
        }
    }
}

/// Rutas para recibir correo de nodos remotos.
pub fn mail_router(network: Network) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/mail", post(receive_mail))
        .route("/api/v1/call", post(receive_call))
        .with_state(network)
}

async fn health() -> &'static str {
    "ok"
}

async fn receive_mail(
    State(network): State<Network>,
    Json(envelope): Json<Envelope>,
) -> StatusCode {
    debug!(
        "correo {} -> {} ({})",
        envelope.from,
        envelope.to,
        envelope.command.name()
    );
    match network.accept(envelope) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            warn!("correo rechazado: {}", e);
            StatusCode::NOT_FOUND
        }
    }
}

async fn receive_call(
    State(network): State<Network>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<Reply>, (StatusCode, String)> {
    network
        .accept_call(envelope, config::server_timeout())
        .await
        .map(Json)
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))
}

fn http_error(to: &str, e: impl std::fmt::Display) -> TransportError {
    TransportError::Http {
        to: to.to_string(),
        message: e.to_string(),
    }
}

pub(crate) async fn post_mail(
    client: &reqwest::Client,
    authority: &str,
    envelope: &Envelope,
) -> Result<(), TransportError> {
    let url = format!("http://{}/api/v1/mail", authority);
    let resp = client
        .post(&url)
        .json(envelope)
        .timeout(config::server_timeout())
        .send()
        .await
        .map_err(|e| http_error(&envelope.to, e))?;

    if resp.status().is_success() {
        Ok(())
    } else {
        Err(http_error(&envelope.to, resp.status()))
    }
}

pub(crate) async fn post_call(
    client: &reqwest::Client,
    authority: &str,
    envelope: &Envelope,
    timeout: Duration,
) -> Result<Reply, TransportError> {
    let url = format!("http://{}/api/v1/call", authority);
    let resp = client
        .post(&url)
        .json(envelope)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout {
                    to: envelope.to.clone(),
                    after_ms: timeout.as_millis() as u64,
                }
            } else {
                http_error(&envelope.to, e)
            }
        })?;

    if !resp.status().is_success() {
        return Err(http_error(&envelope.to, resp.status()));
    }
    resp.json::<Reply>()
        .await
        .map_err(|e| http_error(&envelope.to, e))
}

/// Cola de salida hacia un proceso remoto: un POST a la vez, en orden.
pub(crate) async fn run_outbound(
    network: Network,
    client: reqwest::Client,
    authority: String,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = rx.recv().await {
        if let Err(e) = post_mail(&client, &authority, &envelope).await {
            network.fail(&e, &envelope.from, &envelope.to);
        }
    }
}
