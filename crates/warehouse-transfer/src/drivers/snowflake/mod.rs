//! Snowflake driver (session REST protocol).

mod connector;
mod protocol;

pub use connector::SnowflakeConnector;

use crate::core::traits::{Connector, ConnectorFactory};
use crate::credentials::{Credentials, WarehouseKind};
use crate::error::{Result, TransferError};

/// Factory for [`SnowflakeConnector`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SnowflakeConnectorFactory;

impl ConnectorFactory for SnowflakeConnectorFactory {
    fn kind(&self) -> WarehouseKind {
        WarehouseKind::Snowflake
    }

    fn create(&self, credentials: &Credentials) -> Result<Box<dyn Connector>> {
        match credentials {
            Credentials::Snowflake(c) => Ok(Box::new(SnowflakeConnector::new(c.clone()))),
            other => Err(TransferError::Config(format!(
                "{} credentials passed to the snowflake connector",
                other.kind()
            ))),
        }
    }
}
