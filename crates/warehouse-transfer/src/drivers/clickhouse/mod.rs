//! ClickHouse driver (HTTP interface).

mod connector;
mod format;

pub use connector::ClickhouseConnector;

use crate::core::traits::{Connector, ConnectorFactory};
use crate::credentials::{Credentials, WarehouseKind};
use crate::error::{Result, TransferError};

/// Factory for [`ClickhouseConnector`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ClickhouseConnectorFactory;

impl ConnectorFactory for ClickhouseConnectorFactory {
    fn kind(&self) -> WarehouseKind {
        WarehouseKind::Clickhouse
    }

    fn create(&self, credentials: &Credentials) -> Result<Box<dyn Connector>> {
        match credentials {
            Credentials::Clickhouse(c) => Ok(Box::new(ClickhouseConnector::new(c.clone()))),
            other => Err(TransferError::Config(format!(
                "{} credentials passed to the clickhouse connector",
                other.kind()
            ))),
        }
    }
}
