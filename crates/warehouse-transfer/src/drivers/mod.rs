//! Warehouse driver implementations.
//!
//! Each driver implements [`Connector`](crate::core::Connector) for one
//! warehouse kind and exposes a factory registered in
//! [`ConnectorCatalog::with_builtins`](crate::core::ConnectorCatalog::with_builtins):
//!
//! - [`postgres`]: PostgreSQL via `tokio-postgres`
//! - [`clickhouse`]: ClickHouse HTTP interface
//! - [`snowflake`]: Snowflake session REST protocol
//! - [`memory`]: process-local warehouse for tests and dry runs
//! - [`common`]: shared TLS and HTTP utilities
//!
//! # Adding New Warehouses
//!
//! 1. Add a variant to `WarehouseKind` and its required credential fields
//! 2. Create a module under `drivers/` implementing `Connector`
//! 3. Add a `ConnectorFactory` and register it in `ConnectorCatalog::with_builtins()`

pub mod clickhouse;
pub mod common;
pub mod memory;
pub mod postgres;
pub mod snowflake;

pub use clickhouse::{ClickhouseConnector, ClickhouseConnectorFactory};
pub use memory::{MemoryConnectorFactory, MemoryWarehouse};
pub use postgres::{PostgresConnector, PostgresConnectorFactory};
pub use snowflake::{SnowflakeConnector, SnowflakeConnectorFactory};
