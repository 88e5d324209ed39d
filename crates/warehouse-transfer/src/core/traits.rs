//! Core traits for warehouse-agnostic table transfer.
//!
//! - [`Connector`]: the capability set every warehouse backend provides
//! - [`ConnectorFactory`]: builds a connector from resolved credentials
//!
//! # Design Patterns
//!
//! - **Abstract Factory**: one factory per warehouse kind, selected from the
//!   [`ConnectorCatalog`](super::catalog::ConnectorCatalog)
//! - **Template Method**: [`Connector::replace_rows`] is defined in terms of
//!   [`Connector::clear_table`] and [`Connector::insert_rows`]

use async_trait::async_trait;

use crate::credentials::{Credentials, WarehouseKind};
use crate::error::Result;

use super::schema::TableDescriptor;
use super::value::{Row, SqlValue};

/// Uniform capability interface over one warehouse session.
///
/// A connector exclusively owns its session, so every operation takes
/// `&mut self`. `connect` must precede any other call; data operations on an
/// unconnected connector fail with a `Connection` error. Backend failures
/// surface as `Connection`, `Query` or `Schema` errors.
#[async_trait]
pub trait Connector: Send {
    /// Warehouse kind served by this connector.
    fn kind(&self) -> WarehouseKind;

    /// Open a live session.
    async fn connect(&mut self) -> Result<()>;

    /// Release every resource opened by `connect`.
    ///
    /// Idempotent: safe after a failed connect and on repeated calls.
    async fn close(&mut self) -> Result<()>;

    /// Execute a parameterized statement.
    ///
    /// Returns `Some(rows)` when the statement produces a result set.
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<Vec<Row>>>;

    /// Visible tables, in warehouse-native order.
    async fn list_tables(&mut self) -> Result<Vec<String>>;

    /// Every row of `table`, fully materialized.
    async fn read_table(&mut self, table: &str) -> Result<Vec<Row>>;

    /// Create `table` with unbounded text columns unless it already exists.
    async fn create_table_if_absent(&mut self, table: &TableDescriptor) -> Result<()>;

    /// Append rows. Not idempotent.
    ///
    /// Returns the number of rows written.
    async fn insert_rows(&mut self, table: &TableDescriptor, rows: &[Row]) -> Result<u64>;

    /// Remove all rows from `table`; no-op when it does not exist.
    async fn clear_table(&mut self, table: &str) -> Result<()>;

    /// Replace the contents of `table` with `rows`.
    ///
    /// Re-running this after a partial failure leaves exactly `rows` in the
    /// table. Backends with transactional DDL may override this to make the
    /// swap atomic.
    async fn replace_rows(&mut self, table: &TableDescriptor, rows: &[Row]) -> Result<u64> {
        self.clear_table(&table.name).await?;
        self.insert_rows(table, rows).await
    }
}

/// Builds connectors for one warehouse kind.
pub trait ConnectorFactory: Send + Sync {
    /// Warehouse kind this factory serves.
    fn kind(&self) -> WarehouseKind;

    /// Create an unconnected connector for `credentials`.
    ///
    /// Never performs I/O.
    fn create(&self, credentials: &Credentials) -> Result<Box<dyn Connector>>;
}
