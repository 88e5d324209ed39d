//! In-memory warehouse for tests and local dry runs.
//!
//! A [`MemoryWarehouse`] is a cloneable handle over process-local tables.
//! Connectors created from it share the same tables, count every
//! connect/close call, and can be told to fail or stall on demand.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::schema::TableDescriptor;
use crate::core::traits::{Connector, ConnectorFactory};
use crate::core::value::{Row, SqlValue};
use crate::credentials::{Credentials, WarehouseKind};
use crate::error::{Result, TransferError};

/// Call counters observed on a [`MemoryWarehouse`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connectors_created: usize,
    pub connects: usize,
    pub closes: usize,
    pub reads: usize,
    pub creates: usize,
    pub inserts: usize,
    pub clears: usize,
}

#[derive(Debug, Default)]
struct MemoryTable {
    name: String,
    columns: Vec<String>,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct State {
    /// Tables in creation order.
    tables: Vec<MemoryTable>,
    stats: MemoryStats,
    open_sessions: usize,
    connect_failures: usize,
    read_failures: HashMap<String, usize>,
    insert_failures: HashMap<String, usize>,
    read_delay: Option<Duration>,
    statements: Vec<String>,
}

impl State {
    fn table(&self, name: &str) -> Option<&MemoryTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    fn table_mut(&mut self, name: &str) -> Option<&mut MemoryTable> {
        self.tables.iter_mut().find(|t| t.name == name)
    }

    fn ensure_table(&mut self, name: &str, columns: &[String]) -> &mut MemoryTable {
        if let Some(pos) = self.tables.iter().position(|t| t.name == name) {
            return &mut self.tables[pos];
        }
        self.tables.push(MemoryTable {
            name: name.to_string(),
            columns: columns.to_vec(),
            rows: Vec::new(),
        });
        let last = self.tables.len() - 1;
        &mut self.tables[last]
    }
}

/// Decrement an injected failure budget, returning whether this call fails.
fn take_failure(budget: &mut HashMap<String, usize>, table: &str) -> bool {
    match budget.get_mut(table) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

/// Shared in-memory warehouse.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<Mutex<State>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create an empty table with the given columns (no-op if it exists).
    pub fn create_table(&self, name: &str, columns: &[&str]) {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        self.lock().ensure_table(name, &columns);
    }

    /// Append rows to `name`, creating the table if needed.
    pub fn insert(&self, name: &str, rows: Vec<Row>) {
        let mut state = self.lock();
        let columns: Vec<String> = rows
            .first()
            .map(|row| row.to_text_pairs().into_iter().map(|(k, _)| k).collect())
            .unwrap_or_default();
        state.ensure_table(name, &columns).rows.extend(rows);
    }

    /// Current rows of `name`, if the table exists.
    pub fn rows(&self, name: &str) -> Option<Vec<Row>> {
        self.lock().table(name).map(|t| t.rows.clone())
    }

    /// Declared columns of `name`, if the table exists.
    pub fn columns(&self, name: &str) -> Option<Vec<String>> {
        self.lock().table(name).map(|t| t.columns.clone())
    }

    /// Table names in creation order.
    pub fn table_names(&self) -> Vec<String> {
        self.lock().tables.iter().map(|t| t.name.clone()).collect()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.lock().table(name).is_some()
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats
    }

    /// Sessions connected and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    /// Statements passed to `query` that were not table reads.
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    /// Make the next `n` connect calls fail with a connection error.
    pub fn fail_connects(&self, n: usize) {
        self.lock().connect_failures = n;
    }

    /// Make the next `n` reads of `table` fail with a transient query error.
    pub fn fail_reads(&self, table: &str, n: usize) {
        self.lock().read_failures.insert(table.to_string(), n);
    }

    /// Make the next `n` inserts into `table` fail with a transient query error.
    pub fn fail_inserts(&self, table: &str, n: usize) {
        self.lock().insert_failures.insert(table.to_string(), n);
    }

    /// Stall every table read by `delay`.
    pub fn set_read_delay(&self, delay: Duration) {
        self.lock().read_delay = Some(delay);
    }

    /// Unconnected connector reporting `kind`.
    pub fn connector(&self, kind: WarehouseKind) -> Box<dyn Connector> {
        self.lock().stats.connectors_created += 1;
        Box::new(MemoryConnector {
            kind,
            warehouse: self.clone(),
            connected: false,
        })
    }
}

/// Connector over a [`MemoryWarehouse`].
pub struct MemoryConnector {
    kind: WarehouseKind,
    warehouse: MemoryWarehouse,
    connected: bool,
}

impl MemoryConnector {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(TransferError::connection(self.kind, "not connected"))
        }
    }

    fn missing_table(&self, table: &str) -> TransferError {
        TransferError::query(self.kind, format!("table '{}' does not exist", table))
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn kind(&self) -> WarehouseKind {
        self.kind
    }

    async fn connect(&mut self) -> Result<()> {
        let mut state = self.warehouse.lock();
        state.stats.connects += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(TransferError::connection(self.kind, "connection refused"));
        }
        if !self.connected {
            self.connected = true;
            state.open_sessions += 1;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.warehouse.lock();
        state.stats.closes += 1;
        if self.connected {
            self.connected = false;
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
        Ok(())
    }

    async fn query(&mut self, sql: &str, _params: &[SqlValue]) -> Result<Option<Vec<Row>>> {
        self.ensure_connected()?;
        let trimmed = sql.trim();
        let prefix = "select * from ";
        let is_read = trimmed
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix));
        if is_read {
            let table = trimmed[prefix.len()..].trim().trim_matches('"').to_string();
            return self.read_table(&table).await.map(Some);
        }
        self.warehouse.lock().statements.push(trimmed.to_string());
        Ok(None)
    }

    async fn list_tables(&mut self) -> Result<Vec<String>> {
        self.ensure_connected()?;
        Ok(self.warehouse.table_names())
    }

    async fn read_table(&mut self, table: &str) -> Result<Vec<Row>> {
        self.ensure_connected()?;
        let delay = self.warehouse.lock().read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.warehouse.lock();
        state.stats.reads += 1;
        if take_failure(&mut state.read_failures, table) {
            return Err(TransferError::transient_query(
                self.kind,
                format!("injected read failure for '{}'", table),
            ));
        }
        match state.table(table) {
            Some(t) => Ok(t.rows.clone()),
            None => Err(self.missing_table(table)),
        }
    }

    async fn create_table_if_absent(&mut self, table: &TableDescriptor) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.warehouse.lock();
        state.stats.creates += 1;
        state.ensure_table(&table.name, &table.columns);
        Ok(())
    }

    async fn insert_rows(&mut self, table: &TableDescriptor, rows: &[Row]) -> Result<u64> {
        self.ensure_connected()?;
        let mut state = self.warehouse.lock();
        state.stats.inserts += 1;
        if take_failure(&mut state.insert_failures, &table.name) {
            return Err(TransferError::transient_query(
                self.kind,
                format!("injected insert failure for '{}'", table.name),
            ));
        }
        let projected: Vec<Row> = rows
            .iter()
            .map(|row| {
                Row::Named(
                    table
                        .columns
                        .iter()
                        .cloned()
                        .zip(table.project(row).into_iter().map(SqlValue::from))
                        .collect(),
                )
            })
            .collect();
        let target = state
            .table_mut(&table.name)
            .ok_or_else(|| self.missing_table(&table.name))?;
        target.rows.extend(projected);
        Ok(rows.len() as u64)
    }

    async fn clear_table(&mut self, table: &str) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.warehouse.lock();
        state.stats.clears += 1;
        if let Some(t) = state.table_mut(table) {
            t.rows.clear();
        }
        Ok(())
    }
}

/// Factory handing out connectors over one shared [`MemoryWarehouse`].
pub struct MemoryConnectorFactory {
    kind: WarehouseKind,
    warehouse: MemoryWarehouse,
}

impl MemoryConnectorFactory {
    pub fn new(kind: WarehouseKind, warehouse: MemoryWarehouse) -> Self {
        Self { kind, warehouse }
    }
}

impl ConnectorFactory for MemoryConnectorFactory {
    fn kind(&self) -> WarehouseKind {
        self.kind
    }

    fn create(&self, credentials: &Credentials) -> Result<Box<dyn Connector>> {
        if credentials.kind() != self.kind {
            return Err(TransferError::Config(format!(
                "{} credentials passed to the {} connector",
                credentials.kind(),
                self.kind
            )));
        }
        Ok(self.warehouse.connector(self.kind))
    }
}
