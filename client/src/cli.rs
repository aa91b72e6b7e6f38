use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::api::{
    ComputeRequest, ComputeResponse, ErrorResponse, LoginRequest, LoginResponse, LogoutRequest,
    LogoutResponse, NextResultResponse, ServersResponse, StateRequest, SubmitResponse, TaskSpec,
};
use common::config;
use common::environment::ClientProfile;
use common::Environment;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para lanzar cómputos contra el master")]
struct Cli {
    /// Nombre con el que se abre la sesión
    #[arg(long, default_value = "cli")]
    name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Calcula fibonacci(N) descomponiendo en tareas
    Fib {
        #[arg(value_name = "N")]
        n: u64,
    },
    /// Lanza cómputos de un tipo cualquiera y espera todos los resultados
    Submit {
        #[arg(long)]
        kind: String,

        /// Payload JSON de la tarea raíz
        #[arg(long, default_value = "null")]
        payload: String,

        /// Clase de servidor externo que debe ejecutarla
        #[arg(long)]
        service: Option<String>,

        #[arg(long, default_value_t = 1)]
        count: usize,

        /// Entrada global de la sesión (JSON)
        #[arg(long, default_value = "null")]
        input: String,
    },
    /// Guarda el estado del sistema
    Save {
        #[arg(value_name = "SET_ID")]
        set_id: String,
    },
    /// Restaura un estado guardado
    Load {
        #[arg(value_name = "SET_ID")]
        set_id: String,
    },
    /// Lista los servidores de tareas del overlay
    Servers,
    /// Apaga el overlay
    Shutdown,
}

/// Cliente HTTP del master.
struct Master {
    http: Client,
    base_url: String,
}

impl Master {
    fn new(base_url: String) -> Self {
        Self {
            http: Client::new(),
            base_url,
        }
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.post(&url).json(body).send().await?;
        parse(resp).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.get(&url).send().await?;
        parse(resp).await
    }

    async fn post_empty<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.post(&url).json(body).send().await?;
        check(resp).await.map(|_| ())
    }

    async fn login(&self, name: &str, input: Value) -> Result<String> {
        let req = LoginRequest {
            profile: ClientProfile { name: name.into() },
            environment: Environment::new(input),
        };
        let resp: LoginResponse = self.post("/api/v1/login", &req).await?;
        println!("sesión {} abierta", resp.session.session_id);
        Ok(resp.client_id)
    }

    async fn logout(&self, client_id: &str) -> Result<()> {
        let req = LogoutRequest {
            client_id: client_id.into(),
        };
        let resp: LogoutResponse = self.post("/api/v1/logout", &req).await?;
        print!("{}", resp.invoice);
        Ok(())
    }
}

async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = match resp.json::<ErrorResponse>().await {
        Ok(e) => e.error,
        Err(_) => status.to_string(),
    };
    bail!("el master respondió {}: {}", status, message)
}

async fn parse<T: DeserializeOwned>(resp: Response) -> Result<T> {
    Ok(check(resp).await?.json().await?)
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let master = Master::new(config::master_base_url());

    match cli.command {
        Commands::Fib { n } => {
            let client_id = master.login(&cli.name, Value::Null).await?;
            let req = ComputeRequest {
                client_id: client_id.clone(),
                task: TaskSpec {
                    kind: "fib".into(),
                    payload: json!({ "n": n }),
                    service: None,
                },
            };
            let computed: Result<ComputeResponse> = master.post("/api/v1/compute", &req).await;
            match computed {
                Ok(resp) => println!("fib({}) = {}", n, resp.value),
                Err(e) => println!("el cómputo falló: {:#}", e),
            }
            master.logout(&client_id).await?;
        }

        Commands::Submit {
            kind,
            payload,
            service,
            count,
            input,
        } => {
            let payload: Value =
                serde_json::from_str(&payload).context("payload no es JSON válido")?;
            let input: Value = serde_json::from_str(&input).context("input no es JSON válido")?;
            let client_id = master.login(&cli.name, input).await?;

            for _ in 0..count {
                let req = ComputeRequest {
                    client_id: client_id.clone(),
                    task: TaskSpec {
                        kind: kind.clone(),
                        payload: payload.clone(),
                        service: service.clone(),
                    },
                };
                let resp: SubmitResponse = master.post("/api/v1/computations", &req).await?;
                println!("cómputo {} lanzado", resp.result_id);
            }

            for _ in 0..count {
                let path = format!("/api/v1/results/next?client_id={}", client_id);
                match master.get::<NextResultResponse>(&path).await {
                    Ok(resp) => {
                        let r = resp.result;
                        match r.outcome {
                            Ok(value) => println!(
                                "{} = {} (camino crítico {} ms)",
                                r.result_id, value, r.critical_path_ms
                            ),
                            Err(e) => println!("{} falló: {}", r.result_id, e),
                        }
                    }
                    Err(e) => {
                        println!("sesión terminada: {:#}", e);
                        break;
                    }
                }
            }
            master.logout(&client_id).await?;
        }

        Commands::Save { set_id } => {
            master
                .post_empty("/api/v1/state/save", &StateRequest { set_id: set_id.clone() })
                .await?;
            println!("estado guardado en {}", set_id);
        }

        Commands::Load { set_id } => {
            master
                .post_empty("/api/v1/state/load", &StateRequest { set_id: set_id.clone() })
                .await?;
            println!("estado {} restaurado", set_id);
        }

        Commands::Servers => {
            let resp: ServersResponse = master.get("/api/v1/servers").await?;
            println!("raíz: {}", resp.root.as_deref().unwrap_or("-"));
            for s in resp.servers {
                println!(
                    "  {:<32} {}  {}",
                    s.id,
                    s.point,
                    s.service.as_deref().unwrap_or("")
                );
            }
        }

        Commands::Shutdown => {
            master.post_empty("/api/v1/shutdown", &json!({})).await?;
            println!("apagando el overlay");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsea_submit_con_servicio() {
        let cli = Cli::parse_from([
            "client", "--name", "ana", "submit", "--kind", "fib", "--payload", "{\"n\":5}",
            "--service", "gpu", "--count", "3",
        ]);
        assert_eq!(cli.name, "ana");
        match cli.command {
            Commands::Submit {
                kind,
                service,
                count,
                ..
            } => {
                assert_eq!(kind, "fib");
                assert_eq!(service.as_deref(), Some("gpu"));
                assert_eq!(count, 3);
            }
            _ => panic!("esperaba submit"),
        }
    }
}
