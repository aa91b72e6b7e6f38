use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use common::cluster::{ClusterConfig, LocalCluster};
use common::environment::ClientProfile;
use common::registry::FibTask;
use common::{
    ComputeError, Environment, ExecContext, HspError, Outcome, Shared, Task, TaskId, TaskLogic,
    TaskRegistry,
};
use tokio::sync::oneshot;

const PLAZO: Duration = Duration::from_secs(20);

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + PLAZO;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("no se cumplió: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn profile() -> ClientProfile {
    ClientProfile {
        name: "pruebas".into(),
    }
}

fn fib(n: u64) -> Task {
    Task::new("fib", json!({ "n": n }))
}

/// Devuelve la primera entrada que llega y descarta el resto.
struct First;

impl TaskLogic for First {
    fn execute(&self, task: &mut Task, _ctx: &mut ExecContext) -> Result<Outcome> {
        task.inputs()
            .iter()
            .flatten()
            .next()
            .cloned()
            .map(Outcome::Value)
            .ok_or_else(|| anyhow!("sin entradas"))
    }

    fn execute_incremental(
        &self,
        task: &mut Task,
        index: u16,
        _ctx: &mut ExecContext,
    ) -> Result<Outcome> {
        let value = task.input(index as usize).cloned().unwrap_or(Value::Null);
        Ok(Outcome::Value(value))
    }

    fn is_atomic(&self, _task: &Task, _env: &Environment) -> bool {
        true
    }

    fn executes_incrementally(&self, _task: &Task, _env: &Environment) -> bool {
        true
    }
}

/// Un hijo `value` por elemento del payload, compuestos con `first`.
struct AnyOf;

impl TaskLogic for AnyOf {
    fn execute(&self, task: &mut Task, _ctx: &mut ExecContext) -> Result<Outcome> {
        let items = task.payload.as_array().cloned().unwrap_or_default();
        for item in items {
            task.compute(Task::new("value", item));
        }
        Ok(Outcome::Compose(Task::new("first", Value::Null)))
    }
}

/// Publica un valor compartido y devuelve su payload.
struct Publish;

impl TaskLogic for Publish {
    fn execute(&self, task: &mut Task, ctx: &mut ExecContext) -> Result<Outcome> {
        ctx.set_shared(Shared::new(1, task.payload.clone()));
        Ok(Outcome::Value(task.payload.clone()))
    }

    fn is_atomic(&self, _task: &Task, _env: &Environment) -> bool {
        true
    }
}

/// La primera ejecución se queda esperando hasta que la liberen.
struct BlockOnce {
    first: AtomicBool,
    entered: Mutex<Option<oneshot::Sender<()>>>,
    release: Mutex<Option<oneshot::Receiver<()>>>,
}

impl TaskLogic for BlockOnce {
    fn execute(&self, _task: &mut Task, _ctx: &mut ExecContext) -> Result<Outcome> {
        if self.first.swap(false, Ordering::SeqCst) {
            if let Some(tx) = self.entered.lock().unwrap().take() {
                let _ = tx.send(());
            }
            let rx = self.release.lock().unwrap().take();
            if let Some(rx) = rx {
                let _ = rx.blocking_recv();
            }
        }
        Ok(Outcome::Value(json!("listo")))
    }
}

/// Fibonacci cuya suma la hace el servidor de la clase "gpu".
struct GpuFib;

impl TaskLogic for GpuFib {
    fn execute(&self, task: &mut Task, _ctx: &mut ExecContext) -> Result<Outcome> {
        let n = task.payload["n"].as_u64().ok_or_else(|| anyhow!("falta n"))?;
        if n < 2 {
            return Ok(Outcome::Value(json!(n)));
        }
        task.compute(fib(n - 1));
        task.compute(fib(n - 2));
        Ok(Outcome::Compose(Task::external("sum", Value::Null, "gpu")))
    }
}

fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::with_builtins();
    registry.register("first", First);
    registry.register("any", AnyOf);
    registry.register("publish", Publish);
    registry
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn valor_directo_y_factura_con_una_tarea() {
    let cluster = LocalCluster::start(ClusterConfig::default(), registry())
        .await
        .unwrap();
    let mut client = cluster.client();
    client.login(profile(), Environment::default()).await.unwrap();

    let value = tokio::time::timeout(PLAZO, client.compute(Task::new("value", json!([1, 2]))))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, json!([1, 2]));

    let invoice = client.logout().await.unwrap();
    assert_eq!(invoice.tasks_executed(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fib_con_un_servidor_y_un_host() {
    let cluster = LocalCluster::start(ClusterConfig::default(), registry())
        .await
        .unwrap();
    let mut client = cluster.client();
    client.login(profile(), Environment::default()).await.unwrap();

    let value = tokio::time::timeout(PLAZO, client.compute(fib(10)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, json!(55));

    let invoice = client.logout().await.unwrap();
    assert_eq!(invoice.client, "pruebas");
    assert_eq!(invoice.computations, 1);
    // fib(10) ejecuta 177 tareas fib y 88 sumas
    assert!(invoice.tasks_executed() > 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fib_en_una_malla_de_cuatro_servidores() {
    let config = ClusterConfig {
        servers: 4,
        hosts_per_server: 2,
        ..Default::default()
    };
    let cluster = LocalCluster::start(config, registry()).await.unwrap();
    let mut client = cluster.client();
    client.login(profile(), Environment::default()).await.unwrap();

    let value = tokio::time::timeout(PLAZO, client.compute(fib(15)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, json!(610));

    let invoice = client.logout().await.unwrap();
    let stats = invoice.stats.expect("estadísticas del logout");
    assert_eq!(stats.servers(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn varios_computos_sin_esperar() {
    let cluster = LocalCluster::start(ClusterConfig::default(), registry())
        .await
        .unwrap();
    let mut client = cluster.client();
    client.login(profile(), Environment::default()).await.unwrap();

    let a = client.set_computation(fib(8)).unwrap();
    let b = client.set_computation(Task::new("value", json!("hola"))).unwrap();
    assert_ne!(a, b);

    let mut values = Vec::new();
    for _ in 0..2 {
        let result = tokio::time::timeout(PLAZO, client.get_result())
            .await
            .unwrap()
            .unwrap();
        values.push((result.result_id, result.outcome.unwrap()));
    }
    values.sort_by_key(|(id, _)| id.computation_id);
    assert_eq!(values[0], (a, json!(21)));
    assert_eq!(values[1], (b, json!("hola")));

    client.logout().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn host_caido_devuelve_su_tarea_a_la_cola() {
    let (entered_tx, entered_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    let mut registry = registry();
    registry.register(
        "block",
        BlockOnce {
            first: AtomicBool::new(true),
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(Some(release_rx)),
        },
    );

    let cluster = LocalCluster::start(ClusterConfig::default(), registry)
        .await
        .unwrap();
    let server = cluster.servers()[0].clone();
    let lost = cluster.hosts()[0].clone();

    let mut client = cluster.client();
    let info = client.login(profile(), Environment::default()).await.unwrap();
    client
        .set_computation(Task::new("block", Value::Null))
        .unwrap();
    tokio::time::timeout(PLAZO, entered_rx).await.unwrap().unwrap();

    let root = TaskId::new(info.session_id, 0);
    assert_eq!(server.assigned_to(lost.id()), vec![root.clone()]);

    cluster.network().disconnect(lost.id());
    server.probe_hosts().await;
    eventually("la tarea vuelve a la cola", || {
        server.session().queue().contains(&root)
    })
    .await;
    assert!(!server.hosts().contains(lost.id()));

    cluster.add_host(server.id()).await.unwrap();
    let result = tokio::time::timeout(PLAZO, client.get_result())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.outcome, Ok(json!("listo")));

    let _ = release_tx.send(());
    client.logout().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn servidor_externo_atiende_su_clase_de_tareas() {
    let cluster = LocalCluster::start(ClusterConfig::default(), registry())
        .await
        .unwrap();
    let external = cluster.add_server(Some("gpu".into())).await.unwrap();
    cluster.add_host(external.id()).await.unwrap();
    assert_eq!(
        cluster.hsp().providers().get("gpu"),
        Some(external.id())
    );

    let mut client = cluster.client();
    client.login(profile(), Environment::default()).await.unwrap();
    let value = tokio::time::timeout(
        PLAZO,
        client.compute(Task::external("value", json!(7), "gpu")),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(value, json!(7));

    client.logout().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn clase_sin_servidor_termina_la_sesion() {
    let cluster = LocalCluster::start(ClusterConfig::default(), registry())
        .await
        .unwrap();
    let mut client = cluster.client();
    client.login(profile(), Environment::default()).await.unwrap();

    let err = tokio::time::timeout(
        PLAZO,
        client.compute(Task::external("value", json!(1), "tpu")),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(
        err,
        HspError::Compute(ComputeError::NoProvider { ref service }) if service == "tpu"
    ));

    let err = client.compute(fib(3)).await.unwrap_err();
    assert!(matches!(err, HspError::Compute(_)));

    let invoice = client.logout().await.unwrap();
    assert_eq!(invoice.computations, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tipo_desconocido_es_una_falla_del_computo() {
    let cluster = LocalCluster::start(ClusterConfig::default(), registry())
        .await
        .unwrap();
    let mut client = cluster.client();
    client.login(profile(), Environment::default()).await.unwrap();

    let err = tokio::time::timeout(PLAZO, client.compute(Task::new("nada", Value::Null)))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(
        err,
        HspError::Compute(ComputeError::UnknownKind { .. })
    ));
    client.logout().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compose_incremental_devuelve_la_primera_entrada() {
    let cluster = LocalCluster::start(ClusterConfig::default(), registry())
        .await
        .unwrap();
    let mut client = cluster.client();
    client.login(profile(), Environment::default()).await.unwrap();

    let value = tokio::time::timeout(PLAZO, client.compute(Task::new("any", json!([1, 2, 3]))))
        .await
        .unwrap()
        .unwrap();
    assert!([json!(1), json!(2), json!(3)].contains(&value));
    client.logout().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn valor_compartido_llega_a_todos_los_hosts() {
    let config = ClusterConfig {
        servers: 2,
        hosts_per_server: 1,
        ..Default::default()
    };
    let cluster = LocalCluster::start(config, registry()).await.unwrap();
    let mut client = cluster.client();
    client.login(profile(), Environment::default()).await.unwrap();

    let value = tokio::time::timeout(PLAZO, client.compute(Task::new("publish", json!(42))))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, json!(42));

    for host in cluster.hosts() {
        eventually("el host adopta el valor compartido", || {
            host.shared().map(|s| s.value) == Some(json!(42))
        })
        .await;
    }
    client.logout().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hijo_cacheado_con_compose_en_servidor_externo() {
    let config = ClusterConfig {
        cacheable_kind: Some("fib".into()),
        ..Default::default()
    };
    let mut registry = TaskRegistry::with_builtins();
    registry.register("gpu_fib", GpuFib);
    let cluster = LocalCluster::start(config, registry).await.unwrap();
    let external = cluster.add_server(Some("gpu".into())).await.unwrap();
    cluster.add_host(external.id()).await.unwrap();

    let mut client = cluster.client();
    client.login(profile(), Environment::default()).await.unwrap();
    let value = tokio::time::timeout(PLAZO, client.compute(Task::new("gpu_fib", json!({ "n": 10 }))))
        .await
        .expect("el valor del hijo cacheado debe llegar a la compose")
        .unwrap();
    assert_eq!(value, json!(55));

    // y una tarea de la clase externa que se descompone con cache
    let value = tokio::time::timeout(PLAZO, client.compute(Task::external("fib", json!({ "n": 8 }), "gpu")))
        .await
        .expect("el cómputo externo con cache debe terminar")
        .unwrap();
    assert_eq!(value, json!(21));
    client.logout().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cache_de_hijos_no_cambia_el_resultado() {
    let config = ClusterConfig {
        cacheable_kind: Some("fib".into()),
        ..Default::default()
    };
    let mut registry = TaskRegistry::new();
    registry.register("fib", FibTask);
    registry.register("sum", common::registry::SumTask);
    let cluster = LocalCluster::start(config, registry).await.unwrap();
    let mut client = cluster.client();
    client.login(profile(), Environment::default()).await.unwrap();

    let value = tokio::time::timeout(PLAZO, client.compute(fib(12)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, json!(144));
    client.logout().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn guardar_y_cargar_estado() {
    let cluster = LocalCluster::start(ClusterConfig::default(), registry())
        .await
        .unwrap();
    let mut client = cluster.client();
    client.login(profile(), Environment::default()).await.unwrap();
    assert_eq!(client.compute(fib(5)).await.unwrap(), json!(5));

    cluster.hsp().save_state("s1").await.unwrap();
    cluster.hsp().load_state("s1").await.unwrap();
    assert!(cluster.hsp().load_state("no-existe").await.is_err());

    let value = tokio::time::timeout(PLAZO, client.compute(fib(6)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, json!(8));
    client.logout().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn login_llega_a_servidores_que_se_suman_despues() {
    let cluster = LocalCluster::start(ClusterConfig::default(), registry())
        .await
        .unwrap();
    let mut client = cluster.client();
    let info = client.login(profile(), Environment::default()).await.unwrap();

    let late = cluster.add_server(None).await.unwrap();
    assert_eq!(late.session().session_id(), Some(info.session_id));
    cluster.add_host(late.id()).await.unwrap();

    let value = tokio::time::timeout(PLAZO, client.compute(fib(9)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, json!(34));
    client.logout().await.unwrap();
}
