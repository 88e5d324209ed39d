//! Scoped connector sessions.
//!
//! A connection never escapes the step that opened it: [`with_connection`]
//! connects, runs the body, and closes the connector on every exit path,
//! including failure and cancellation.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, TransferError};

use super::traits::Connector;

/// Upper bound on how long a release path may block.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `body` against a freshly connected `connector`, then always close it.
///
/// If `cancel` fires while connecting or while `body` runs, the in-flight
/// future is dropped, the connector is still closed, and the result is
/// `TransferError::Cancelled`. A close failure is logged and never masks the
/// body's outcome.
///
/// ```rust,ignore
/// let tables = with_connection(connector, &cancel, |conn| {
///     Box::pin(async move { conn.list_tables().await })
/// })
/// .await?;
/// ```
pub async fn with_connection<T, F>(
    mut connector: Box<dyn Connector>,
    cancel: &CancellationToken,
    body: F,
) -> Result<T>
where
    F: for<'c> FnOnce(&'c mut dyn Connector) -> BoxFuture<'c, Result<T>>,
{
    let kind = connector.kind();

    let outcome = if cancel.is_cancelled() {
        Err(TransferError::Cancelled)
    } else {
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            result = connector.connect() => result,
        };

        match connected {
            Ok(()) => {
                debug!("{} session opened", kind);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(TransferError::Cancelled),
                    result = body(connector.as_mut()) => result,
                }
            }
            Err(e) => Err(e),
        }
    };

    match tokio::time::timeout(CLOSE_TIMEOUT, connector.close()).await {
        Ok(Ok(())) => debug!("{} session closed", kind),
        Ok(Err(e)) => warn!("Failed to close {} session: {}", kind, e),
        Err(_) => warn!("Closing {} session timed out after {:?}", kind, CLOSE_TIMEOUT),
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::WarehouseKind;
    use crate::drivers::memory::MemoryWarehouse;

    #[tokio::test]
    async fn test_close_runs_after_success() {
        let warehouse = MemoryWarehouse::new();
        warehouse.create_table("users", &["id"]);
        let connector = warehouse.connector(WarehouseKind::Postgres);

        let tables = with_connection(connector, &CancellationToken::new(), |conn| {
            Box::pin(async move { conn.list_tables().await })
        })
        .await
        .unwrap();

        assert_eq!(tables, vec!["users".to_string()]);
        let stats = warehouse.stats();
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.closes, 1);
        assert_eq!(warehouse.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_close_runs_after_body_error() {
        let warehouse = MemoryWarehouse::new();
        let connector = warehouse.connector(WarehouseKind::Postgres);

        let result = with_connection(connector, &CancellationToken::new(), |conn| {
            Box::pin(async move { conn.read_table("missing").await })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(warehouse.open_sessions(), 0);
        assert_eq!(warehouse.stats().closes, 1);
    }

    #[tokio::test]
    async fn test_close_runs_after_failed_connect() {
        let warehouse = MemoryWarehouse::new();
        warehouse.fail_connects(1);
        let connector = warehouse.connector(WarehouseKind::Clickhouse);

        let result: Result<()> = with_connection(connector, &CancellationToken::new(), |_conn| {
            Box::pin(async move { Ok(()) })
        })
        .await;

        assert!(matches!(result, Err(TransferError::Connection { .. })));
        assert_eq!(warehouse.stats().closes, 1);
    }

    #[tokio::test]
    async fn test_cancellation_still_releases() {
        let warehouse = MemoryWarehouse::new();
        let connector = warehouse.connector(WarehouseKind::Snowflake);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let result: Result<()> = with_connection(connector, &cancel, |_conn| {
            Box::pin(async move {
                trigger.cancel();
                futures::future::pending::<()>().await;
                Ok(())
            })
        })
        .await;

        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(warehouse.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_already_cancelled_never_connects() {
        let warehouse = MemoryWarehouse::new();
        let connector = warehouse.connector(WarehouseKind::Postgres);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> =
            with_connection(connector, &cancel, |_conn| Box::pin(async move { Ok(()) })).await;

        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(warehouse.stats().connects, 0);
    }
}
