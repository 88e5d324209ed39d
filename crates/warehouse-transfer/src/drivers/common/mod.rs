//! Utilities shared across warehouse drivers.
//!
//! - [`tls`]: TLS configuration for PostgreSQL sessions
//! - [`http`]: HTTP client construction and status classification

pub mod http;
pub mod tls;

pub use tls::{make_tls_connect, SslMode};
