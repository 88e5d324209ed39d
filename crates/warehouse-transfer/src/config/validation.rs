//! Configuration validation.

use std::net::SocketAddr;

use super::{Config, RegistryBackend};
use crate::error::{Result, TransferError};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Registry validation
    match config.registry.backend {
        RegistryBackend::Memory => {}
        RegistryBackend::File => {
            if config.registry.path.as_os_str().is_empty() {
                return Err(TransferError::Config("registry.path is required".into()));
            }
            match config.registry.signing_key.as_deref() {
                Some(key) if !key.is_empty() => {}
                _ => {
                    return Err(TransferError::Config(
                        "registry.signing_key is required for the file backend".into(),
                    ))
                }
            }
        }
        RegistryBackend::Postgres => {
            let Some(pg) = &config.registry.postgres else {
                return Err(TransferError::Config(
                    "registry.postgres is required for the postgres backend".into(),
                ));
            };
            if pg.host.is_empty() {
                return Err(TransferError::Config("registry.postgres.host is required".into()));
            }
            if pg.database.is_empty() {
                return Err(TransferError::Config(
                    "registry.postgres.database is required".into(),
                ));
            }
            if pg.user.is_empty() {
                return Err(TransferError::Config("registry.postgres.user is required".into()));
            }
            if pg.max_connections == 0 {
                return Err(TransferError::Config(
                    "registry.postgres.max_connections must be at least 1".into(),
                ));
            }
        }
    }

    // Execution validation
    let execution = &config.execution;
    if execution.enumerate_timeout_secs == 0 {
        return Err(TransferError::Config(
            "execution.enumerate_timeout_secs must be at least 1".into(),
        ));
    }
    if execution.table_timeout_secs == 0 {
        return Err(TransferError::Config(
            "execution.table_timeout_secs must be at least 1".into(),
        ));
    }
    if execution.credential_timeout_secs == 0 {
        return Err(TransferError::Config(
            "execution.credential_timeout_secs must be at least 1".into(),
        ));
    }
    if execution.retry.max_attempts == 0 {
        return Err(TransferError::Config(
            "execution.retry.max_attempts must be at least 1".into(),
        ));
    }
    if !execution.retry.backoff_coefficient.is_finite() || execution.retry.backoff_coefficient < 1.0
    {
        return Err(TransferError::Config(
            "execution.retry.backoff_coefficient must be at least 1.0".into(),
        ));
    }
    if execution.retry.max_interval_ms < execution.retry.initial_interval_ms {
        return Err(TransferError::Config(
            "execution.retry.max_interval_ms must not be less than initial_interval_ms".into(),
        ));
    }

    // Server validation
    if config.server.bind.parse::<SocketAddr>().is_err() {
        return Err(TransferError::Config(format!(
            "server.bind must be a socket address, got '{}'",
            config.server.bind
        )));
    }

    Ok(())
}
