//! Connector catalog for explicit dependency injection.
//!
//! The [`ConnectorCatalog`] maps each [`WarehouseKind`] to the factory that
//! builds its connectors. It is explicitly constructed and handed to the
//! orchestrator rather than living in a process-wide registry, so tests can
//! swap in the in-memory warehouse for any kind.

use std::collections::HashMap;
use std::sync::Arc;

use crate::credentials::{Credentials, WarehouseKind};
use crate::drivers::{ClickhouseConnectorFactory, PostgresConnectorFactory, SnowflakeConnectorFactory};
use crate::error::{Result, TransferError};

use super::traits::{Connector, ConnectorFactory};

/// Registry of connector factories keyed by warehouse kind.
///
/// # Example
///
/// ```rust,ignore
/// let mut catalog = ConnectorCatalog::with_builtins();
/// catalog.register(Arc::new(MemoryConnectorFactory::new(WarehouseKind::Clickhouse, warehouse)));
///
/// let orchestrator = TransferOrchestrator::new(registry, Arc::new(catalog), settings);
/// ```
#[derive(Default, Clone)]
pub struct ConnectorCatalog {
    factories: HashMap<WarehouseKind, Arc<dyn ConnectorFactory>>,
}

impl ConnectorCatalog {
    /// Create a new empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a catalog with the Postgres, ClickHouse and Snowflake drivers.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register(Arc::new(PostgresConnectorFactory));
        catalog.register(Arc::new(ClickhouseConnectorFactory));
        catalog.register(Arc::new(SnowflakeConnectorFactory));
        catalog
    }

    /// Register a factory under its kind, replacing any previous one.
    pub fn register(&mut self, factory: Arc<dyn ConnectorFactory>) {
        self.factories.insert(factory.kind(), factory);
    }

    /// Factory for `kind`, if registered.
    pub fn factory(&self, kind: WarehouseKind) -> Option<&Arc<dyn ConnectorFactory>> {
        self.factories.get(&kind)
    }

    /// Whether `kind` has a registered factory.
    pub fn supports(&self, kind: WarehouseKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<WarehouseKind> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Build an unconnected connector for `credentials`.
    pub fn create(&self, credentials: &Credentials) -> Result<Box<dyn Connector>> {
        let kind = credentials.kind();
        let factory = self.factories.get(&kind).ok_or_else(|| {
            TransferError::Config(format!("No connector registered for warehouse kind '{}'", kind))
        })?;
        factory.create(credentials)
    }
}

impl std::fmt::Debug for ConnectorCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorCatalog")
            .field("kinds", &self.kinds())
            .finish()
    }
}
