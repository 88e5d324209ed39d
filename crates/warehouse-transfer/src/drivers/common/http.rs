//! HTTP plumbing shared by the ClickHouse and Snowflake connectors.

use std::time::Duration;

use reqwest::{Client, StatusCode};

use crate::credentials::WarehouseKind;
use crate::error::{Result, TransferError};

/// Per-request timeout for warehouse HTTP calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the HTTP client owned by one connector session.
pub fn build_client(kind: WarehouseKind) -> Result<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .gzip(true)
        .user_agent(concat!("warehouse-transfer/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| TransferError::connection(kind, format!("building HTTP client: {}", e)))
}

/// Map a transport failure (DNS, refused, TLS, timeout) to a connection error.
pub fn transport_error(kind: WarehouseKind, e: reqwest::Error) -> TransferError {
    TransferError::connection(kind, format!("HTTP request failed: {}", e))
}

/// Whether an HTTP status signals a condition worth retrying.
pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Map a non-success HTTP status to a typed error.
///
/// 401/403 are authentication failures, reported as connection errors.
pub fn status_error(kind: WarehouseKind, status: StatusCode, body: &str) -> TransferError {
    let message = format!("HTTP {}: {}", status, truncate(body.trim(), 500));
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        TransferError::connection(kind, message)
    } else if is_transient_status(status) {
        TransferError::transient_query(kind, message)
    } else {
        TransferError::query(kind, message)
    }
}

/// Shorten long server messages for logs and job status.
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
