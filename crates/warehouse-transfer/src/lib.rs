//! # warehouse-transfer
//!
//! Copies every table of one data warehouse into another.
//!
//! A transfer job resolves credentials for both ends, enumerates the source
//! tables, and moves each table with a fresh pair of sessions:
//!
//! - **Connectors** for PostgreSQL, ClickHouse and Snowflake behind one
//!   [`Connector`] trait, built through an explicit [`ConnectorCatalog`]
//! - **Schema inference** from extracted rows; destination columns are text
//! - **Durable progress** in a [`JobRegistry`] (memory, signed JSON file or
//!   PostgreSQL) so an interrupted job resumes after its last completed table
//! - **Step execution** with timeouts, retry with backoff and cancellation
//! - **HTTP API** and service facade for submitting and inspecting jobs
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use warehouse_transfer::{
//!     Config, ConnectorCatalog, LocalEngine, OrchestratorSettings, SubmitJobRequest,
//!     TransferOrchestrator, TransferService,
//! };
//!
//! # async fn example(request: SubmitJobRequest) -> warehouse_transfer::Result<()> {
//! let config = Config::load("config.yaml")?;
//! let registry = warehouse_transfer::registry::open(&config.registry).await?;
//! let catalog = Arc::new(ConnectorCatalog::with_builtins());
//! let orchestrator = Arc::new(TransferOrchestrator::new(
//!     registry.clone(),
//!     catalog.clone(),
//!     OrchestratorSettings::from(&config.execution),
//! ));
//! let engine = Arc::new(LocalEngine::new(orchestrator));
//! let service = TransferService::new(registry, engine, catalog);
//!
//! let result = service.submit_job(request).await?.wait().await?;
//! println!("Transferred {} rows", result.rows_transferred);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod credentials;
pub mod drivers;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod server;
pub mod service;
pub mod transfer;

// Re-exports for convenient access
pub use crate::core::{Connector, ConnectorCatalog, ConnectorFactory, Row, SqlValue, TableDescriptor};
pub use config::{Config, LoadMode};
pub use credentials::{mask_credentials, resolve, CredentialMap, Credentials, WarehouseKind};
pub use engine::{ExecutionEngine, JobHandle, LocalEngine, RetryPolicy};
pub use error::{Result, TransferError};
pub use orchestrator::{OrchestratorSettings, TransferOrchestrator, TransferResult};
pub use registry::{JobRecord, JobRegistry, JobStatus, JobStatusView, TableStatus};
pub use service::{SubmitJobRequest, TransferService};
