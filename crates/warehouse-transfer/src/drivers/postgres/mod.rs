//! PostgreSQL driver.
//!
//! - [`PostgresConnector`]: session-scoped connector over `tokio-postgres`
//! - [`PostgresConnectorFactory`]: builds connectors from resolved credentials

mod connector;
mod copy;

pub use connector::PostgresConnector;

use crate::core::traits::{Connector, ConnectorFactory};
use crate::credentials::{Credentials, WarehouseKind};
use crate::error::{Result, TransferError};

/// Factory for [`PostgresConnector`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresConnectorFactory;

impl ConnectorFactory for PostgresConnectorFactory {
    fn kind(&self) -> WarehouseKind {
        WarehouseKind::Postgres
    }

    fn create(&self, credentials: &Credentials) -> Result<Box<dyn Connector>> {
        match credentials {
            Credentials::Postgres(c) => Ok(Box::new(PostgresConnector::new(c.clone()))),
            other => Err(TransferError::Config(format!(
                "{} credentials passed to the postgres connector",
                other.kind()
            ))),
        }
    }
}
