//! End-to-end transfer tests against in-memory warehouses.

use std::io::Write;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::MakeWriter;

use warehouse_transfer::drivers::{MemoryConnectorFactory, MemoryWarehouse};
use warehouse_transfer::registry::{MemoryRegistry, TableStatus};
use warehouse_transfer::{
    ConnectorCatalog, CredentialMap, JobRecord, JobRegistry, JobStatus, LocalEngine,
    OrchestratorSettings, Row, SubmitJobRequest, TransferOrchestrator, TransferService,
    WarehouseKind,
};

struct Harness {
    source: MemoryWarehouse,
    destination: MemoryWarehouse,
    registry: Arc<dyn JobRegistry>,
    orchestrator: Arc<TransferOrchestrator>,
    service: TransferService,
}

fn harness() -> Harness {
    let source = MemoryWarehouse::new();
    let destination = MemoryWarehouse::new();
    let mut catalog = ConnectorCatalog::new();
    catalog.register(Arc::new(MemoryConnectorFactory::new(
        WarehouseKind::Postgres,
        source.clone(),
    )));
    catalog.register(Arc::new(MemoryConnectorFactory::new(
        WarehouseKind::Clickhouse,
        destination.clone(),
    )));
    let catalog = Arc::new(catalog);
    let registry: Arc<dyn JobRegistry> = Arc::new(MemoryRegistry::new());
    let orchestrator = Arc::new(TransferOrchestrator::new(
        registry.clone(),
        catalog.clone(),
        OrchestratorSettings::default(),
    ));
    let engine = Arc::new(LocalEngine::new(orchestrator.clone()));
    Harness {
        source,
        destination,
        registry: registry.clone(),
        orchestrator,
        service: TransferService::new(registry, engine, catalog),
    }
}

fn map(value: Value) -> CredentialMap {
    match value {
        Value::Object(m) => m,
        _ => panic!("expected object"),
    }
}

fn request() -> SubmitJobRequest {
    serde_json::from_value(json!({
        "organization": "acme",
        "source": "postgres",
        "source_warehouse": "postgres",
        "import_warehouse": "clickhouse",
        "dataset_name": "analytics",
        "source_credentials": {
            "host": "pg.internal", "port": 5432, "database": "app",
            "user": "etl", "password": "pg-password-1"
        },
        "link_credentials": {
            "host": "ch.internal", "database": "lake",
            "user": "loader", "password": "ch-password-2"
        }
    }))
    .unwrap()
}

fn users() -> Vec<Row> {
    vec![
        Row::named([("id", "1"), ("email", "ada@example.com")]),
        Row::named([("id", "2"), ("email", "grace@example.com")]),
    ]
}

#[tokio::test]
async fn test_single_table_transfer_completes() {
    let h = harness();
    h.source.insert("users", users());

    let result = h.service.submit_job(request()).await.unwrap().wait().await.unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.tables_attempted, 1);
    assert_eq!(result.tables_succeeded, 1);
    assert_eq!(result.rows_per_table.get("users"), Some(&2));
    assert_eq!(
        h.destination.columns("users").unwrap(),
        vec!["id".to_string(), "email".to_string()]
    );
    assert_eq!(h.destination.rows("users").unwrap(), users());
    assert_eq!(h.source.open_sessions() + h.destination.open_sessions(), 0);
}

#[tokio::test]
async fn test_missing_password_fails_before_connecting() {
    let h = harness();
    h.source.insert("users", users());
    let mut req = request();
    req.source_credentials.remove("password");

    let result = h.service.submit_job(req).await.unwrap().wait().await.unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    assert!(result.first_error.unwrap().contains("password"));
    assert_eq!(h.source.stats().connects, 0);
    assert_eq!(h.destination.stats().connects, 0);
}

#[tokio::test]
async fn test_source_without_tables_completes_empty() {
    let h = harness();

    let result = h.service.submit_job(request()).await.unwrap().wait().await.unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.tables_attempted, 0);
    assert_eq!(result.rows_transferred, 0);
    assert_eq!(h.destination.stats().connects, 0);
}

#[tokio::test]
async fn test_one_failing_table_does_not_stop_the_others() {
    let h = harness();
    h.source.insert("a", vec![Row::named([("id", "1")])]);
    h.source.insert("b", vec![Row::named([("id", "2")])]);
    h.source.insert("c", vec![Row::named([("id", "3")])]);
    h.source.fail_reads("b", 100);

    let result = h.service.submit_job(request()).await.unwrap().wait().await.unwrap();

    assert_eq!(result.status, JobStatus::PartialFailure);
    assert_eq!(result.tables_succeeded, 2);
    assert_eq!(result.failed_tables, vec!["b".to_string()]);
    assert!(h.destination.has_table("a"));
    assert!(!h.destination.has_table("b"));
    assert!(h.destination.has_table("c"));

    let view = h.service.job_status(&result_job_id()).await.unwrap();
    let b = view.tables.iter().find(|t| t.name == "b").unwrap();
    assert_eq!(b.status, TableStatus::Failed);
    assert_eq!(b.attempts, 3);
}

fn result_job_id() -> String {
    request().job_id()
}

#[tokio::test]
async fn test_rerun_into_existing_destination_is_idempotent() {
    let h = harness();
    h.source.insert("users", users());

    let first = h.service.submit_job(request()).await.unwrap().wait().await.unwrap();
    assert_eq!(first.status, JobStatus::Completed);

    // A finished job id may be submitted again.
    let second = h.service.submit_job(request()).await.unwrap().wait().await.unwrap();
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(h.destination.rows("users").unwrap().len(), 2);
}

#[tokio::test]
async fn test_positional_rows_get_generated_columns() {
    let h = harness();
    h.source.insert(
        "events",
        vec![
            Row::Positional(vec!["1".into(), "login".into()]),
            Row::Positional(vec!["2".into(), "logout".into()]),
        ],
    );

    let result = h.service.submit_job(request()).await.unwrap().wait().await.unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(
        h.destination.columns("events").unwrap(),
        vec!["COLUMN_0".to_string(), "COLUMN_1".to_string()]
    );
}

#[tokio::test]
async fn test_finished_job_returns_stored_result() {
    let h = harness();
    h.source.insert("a", vec![Row::named([("id", "1")])]);
    h.source.insert("b", vec![Row::named([("id", "2")])]);

    let req = request();
    let job = JobRecord::new(
        req.job_id(),
        req.organization.clone(),
        req.source.clone(),
        req.source_warehouse,
        req.import_warehouse,
        req.dataset_name.clone(),
        req.source_credentials.clone(),
        req.link_credentials.clone(),
    );
    h.registry.insert_job(&job).await.unwrap();

    let result = h
        .orchestrator
        .run(&job.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status, JobStatus::Completed);

    // A finished job returns its stored result without reconnecting.
    let connects = h.source.stats().connects;
    let again = h
        .orchestrator
        .run(&job.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again.rows_transferred, result.rows_transferred);
    assert_eq!(h.source.stats().connects, connects);
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[tokio::test]
async fn test_secrets_never_reach_the_logs() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let h = harness();
    h.source.insert("users", users());
    let req = request();
    let job_id = req.job_id();
    let job = JobRecord::new(
        job_id.clone(),
        req.organization,
        req.source,
        req.source_warehouse,
        req.import_warehouse,
        req.dataset_name,
        req.source_credentials,
        req.link_credentials,
    );
    h.registry.insert_job(&job).await.unwrap();
    h.orchestrator
        .run(&job_id, &CancellationToken::new())
        .await
        .unwrap();

    let output = logs.contents();
    assert!(output.contains("Resolving postgres credentials"));
    assert!(output.contains("****"));
    assert!(!output.contains("pg-password-1"));
    assert!(!output.contains("ch-password-2"));

    let registered = map(json!({"password": "x"}));
    assert_eq!(
        warehouse_transfer::mask_credentials(&registered)["password"],
        "****"
    );
}
