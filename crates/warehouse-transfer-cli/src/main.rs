//! warehouse-transfer CLI - API server and worker for warehouse-to-warehouse table transfers.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warehouse_transfer::registry::{self, JobStatus};
use warehouse_transfer::service::verify_connection;
use warehouse_transfer::{
    resolve, Config, ConnectorCatalog, CredentialMap, LocalEngine, OrchestratorSettings,
    SubmitJobRequest, TransferError, TransferOrchestrator, TransferResult, TransferService,
    WarehouseKind,
};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code for a job that ran but did not complete every table.
const EXIT_JOB_INCOMPLETE: u8 = 8;

#[derive(Parser)]
#[command(name = "warehouse-transfer")]
#[command(about = "Copy every table of one data warehouse into another")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API and run submitted jobs
    Serve {
        /// Override server.bind from the configuration
        #[arg(long)]
        bind: Option<String>,
    },

    /// Submit a job from a request file and wait for its result
    Run {
        /// YAML or JSON job request
        #[arg(long)]
        job: PathBuf,
    },

    /// Show the status of a job
    Status {
        /// Job id, e.g. acme_postgres_workflow
        job_id: String,
    },

    /// Store reusable source credentials and print their id
    RegisterSource {
        #[arg(long)]
        organization: String,

        /// Warehouse kind: postgres, clickhouse, snowflake
        #[arg(long)]
        kind: WarehouseKind,

        /// YAML or JSON credential map
        #[arg(long)]
        credentials: PathBuf,
    },

    /// Validate a credential map without submitting a job
    CheckCredentials {
        /// Warehouse kind: postgres, clickhouse, snowflake
        #[arg(long)]
        kind: WarehouseKind,

        /// YAML or JSON credential map
        #[arg(long)]
        credentials: PathBuf,

        /// Also open a session and list the visible tables
        #[arg(long)]
        connect: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, TransferError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);
    let cancel_token = setup_signal_handler();

    // Credential checks don't need a registry
    if let Commands::CheckCredentials {
        kind,
        credentials,
        connect,
    } = &cli.command
    {
        check_credentials(*kind, credentials, *connect, cli.output_json, &cancel_token).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    let registry = registry::open(&config.registry).await?;
    let catalog = Arc::new(ConnectorCatalog::with_builtins());
    let orchestrator = Arc::new(TransferOrchestrator::new(
        registry.clone(),
        catalog.clone(),
        OrchestratorSettings::from(&config.execution),
    ));
    let engine = Arc::new(LocalEngine::new(orchestrator));
    let service = Arc::new(TransferService::new(registry, engine.clone(), catalog));

    match cli.command {
        Commands::CheckCredentials { .. } => unreachable!(), // Handled above

        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            let recovered = engine.recover().await?;
            if !recovered.is_empty() {
                info!("Resumed {} unfinished jobs", recovered.len());
            }

            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!("Listening on {}", bind);
            axum::serve(listener, warehouse_transfer::server::router(service))
                .with_graceful_shutdown(cancel_token.clone().cancelled_owned())
                .await?;

            info!("Waiting for running jobs to stop");
            engine.shutdown().await;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Run { job } => {
            let request: SubmitJobRequest = read_document(&job)?;
            let handle = service.submit_job(request).await?;
            let job_id = handle.job_id().to_string();

            let wait = handle.wait();
            tokio::pin!(wait);
            let result = tokio::select! {
                result = &mut wait => result?,
                _ = cancel_token.cancelled() => {
                    warn!("Cancelling job {}", job_id);
                    service.cancel_job(&job_id).await?;
                    wait.await?
                }
            };

            print_result(&job_id, &result, cli.output_json)?;
            Ok(match result.status {
                JobStatus::Completed => ExitCode::SUCCESS,
                JobStatus::Cancelled => ExitCode::from(TransferError::Cancelled.exit_code()),
                _ => ExitCode::from(EXIT_JOB_INCOMPLETE),
            })
        }

        Commands::Status { job_id } => {
            let view = service.job_status(&job_id).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                println!("Job {}: {}", view.id, view.status);
                println!(
                    "  {} -> {} ({})",
                    view.source_warehouse, view.import_warehouse, view.dataset_name
                );
                for table in &view.tables {
                    println!(
                        "  {:<32} {:?} rows={} attempts={}",
                        table.name, table.status, table.rows_transferred, table.attempts
                    );
                }
                if let Some(ref err) = view.error {
                    println!("  Error: {}", err);
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::RegisterSource {
            organization,
            kind,
            credentials,
        } => {
            let map: CredentialMap = read_document(&credentials)?;
            let id = service.register_source(&organization, kind, map).await?;
            if cli.output_json {
                println!("{}", serde_json::json!({ "id": id }));
            } else {
                println!("{}", id);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn check_credentials(
    kind: WarehouseKind,
    path: &Path,
    connect: bool,
    output_json: bool,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    let map: CredentialMap = read_document(path)?;
    let resolved = resolve(kind, &map)?;

    let tables = if connect {
        let catalog = ConnectorCatalog::with_builtins();
        Some(verify_connection(&catalog, kind, &map, cancel).await?)
    } else {
        None
    };

    if output_json {
        println!(
            "{}",
            serde_json::json!({
                "kind": kind,
                "endpoint": resolved.endpoint(),
                "valid": true,
                "tables": tables,
            })
        );
    } else {
        println!("Credentials for {} are complete ({})", kind, resolved.endpoint());
        if let Some(tables) = tables {
            println!("  Connected, {} tables visible", tables.len());
            for table in tables {
                println!("    {}", table);
            }
        }
    }
    Ok(())
}

/// Read a YAML (or JSON) document from `path`.
fn read_document<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, TransferError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

fn print_result(job_id: &str, result: &TransferResult, output_json: bool) -> Result<(), TransferError> {
    if output_json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!("\nJob {} finished: {}", job_id, result.status);
    println!("  Duration: {:.2}s", result.duration_ms as f64 / 1000.0);
    println!(
        "  Tables: {}/{}",
        result.tables_succeeded, result.tables_attempted
    );
    println!("  Rows: {}", result.rows_transferred);
    if !result.failed_tables.is_empty() {
        println!("  Failed tables: {:?}", result.failed_tables);
    }
    if let Some(ref err) = result.first_error {
        println!("  First error: {}", err);
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT or SIGTERM.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Shutting down gracefully...", name);
                    token.cancel();
                });
            }
            Err(e) => warn!("Failed to install {} handler: {}", name, e),
        }
    }

    cancel_token
}

/// Cancel the returned token on Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
            token.cancel();
        }
    });

    cancel_token
}
