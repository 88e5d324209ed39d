//! Per-table transfer step.
//!
//! One table moves in three phases, each on its own scoped connection:
//!
//! 1. **Extract**: read every row of the source table
//! 2. **Materialize**: infer a text-only schema and create the destination
//!    table if absent
//! 3. **Load**: write the rows according to the configured [`LoadMode`]
//!
//! An empty source table is skipped: nothing is created at the destination.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::LoadMode;
use crate::core::{infer, with_connection, ConnectorCatalog, Row};
use crate::credentials::Credentials;
use crate::error::Result;

/// Outcome of one successful table step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOutcome {
    /// Rows written to the destination.
    Transferred { rows: u64 },
    /// Source table was empty.
    Skipped,
}

/// Moves single tables between two resolved warehouses.
#[derive(Clone)]
pub struct TableTransfer {
    catalog: Arc<ConnectorCatalog>,
    source: Credentials,
    destination: Credentials,
    load_mode: LoadMode,
}

impl TableTransfer {
    pub fn new(
        catalog: Arc<ConnectorCatalog>,
        source: Credentials,
        destination: Credentials,
        load_mode: LoadMode,
    ) -> Self {
        Self {
            catalog,
            source,
            destination,
            load_mode,
        }
    }

    /// Transfer `table` with fresh source and destination sessions.
    ///
    /// Both sessions are closed before this returns, whatever the outcome.
    pub async fn run(&self, table: &str, cancel: &CancellationToken) -> Result<TableOutcome> {
        let rows = self.extract(table, cancel).await?;
        debug!("Read {} rows from {}.{}", rows.len(), self.source.kind(), table);

        let Some(descriptor) = infer(table, &rows)? else {
            info!("{}: source table is empty, skipping", table);
            return Ok(TableOutcome::Skipped);
        };

        let destination = self.catalog.create(&self.destination)?;
        let load_mode = self.load_mode;
        let written = with_connection(destination, cancel, move |conn| {
            Box::pin(async move {
                conn.create_table_if_absent(&descriptor).await?;
                match load_mode {
                    LoadMode::Replace => conn.replace_rows(&descriptor, &rows).await,
                    LoadMode::Append => conn.insert_rows(&descriptor, &rows).await,
                }
            })
        })
        .await?;

        Ok(TableOutcome::Transferred { rows: written })
    }

    async fn extract(&self, table: &str, cancel: &CancellationToken) -> Result<Vec<Row>> {
        let source = self.catalog.create(&self.source)?;
        let name = table.to_string();
        with_connection(source, cancel, move |conn| {
            Box::pin(async move { conn.read_table(&name).await })
        })
        .await
    }
}

impl std::fmt::Debug for TableTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableTransfer")
            .field("source", &self.source.kind())
            .field("destination", &self.destination.kind())
            .field("load_mode", &self.load_mode)
            .finish()
    }
}
