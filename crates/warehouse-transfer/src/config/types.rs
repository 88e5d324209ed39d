//! Configuration type definitions.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::drivers::common::tls::SslMode;
use crate::engine::RetryPolicy;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where job and source records are persisted.
    pub registry: RegistryConfig,

    /// Step budgets, retry policy and load mode.
    pub execution: ExecutionConfig,

    /// HTTP surface.
    pub server: ServerConfig,
}

/// Registry backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    /// Process-local; records are lost on exit.
    Memory,
    /// Signed JSON document on disk.
    #[default]
    File,
    /// Tables in a PostgreSQL database.
    Postgres,
}

impl RegistryBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryBackend::Memory => "memory",
            RegistryBackend::File => "file",
            RegistryBackend::Postgres => "postgres",
        }
    }
}

/// Registry configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub backend: RegistryBackend,

    /// Registry file (file backend, default: "jobs.json").
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,

    /// HMAC key for the registry file (file backend).
    #[serde(default)]
    pub signing_key: Option<String>,

    /// Database settings (postgres backend).
    #[serde(default)]
    pub postgres: Option<PgRegistryConfig>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::default(),
            path: default_registry_path(),
            signing_key: None,
            postgres: None,
        }
    }
}

impl fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("backend", &self.backend)
            .field("path", &self.path)
            .field(
                "signing_key",
                &self.signing_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("postgres", &self.postgres)
            .finish()
    }
}

/// PostgreSQL registry connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct PgRegistryConfig {
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    pub database: String,

    pub user: String,

    #[serde(default)]
    pub password: String,

    /// SSL mode (default: disable).
    #[serde(default)]
    pub ssl_mode: SslMode,

    /// Pool size (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl fmt::Debug for PgRegistryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgRegistryConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// How a table step writes into the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Remove existing rows, then insert. Safe to retry.
    #[default]
    Replace,
    /// Append rows. A retried step may duplicate rows.
    Append,
}

/// Step execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Table enumeration budget (default: 300).
    pub enumerate_timeout_secs: u64,

    /// Per-table transfer budget (default: 1800).
    pub table_timeout_secs: u64,

    /// Credential resolution budget (default: 10).
    pub credential_timeout_secs: u64,

    pub retry: RetryConfig,

    pub load_mode: LoadMode,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            enumerate_timeout_secs: 300,
            table_timeout_secs: 1800,
            credential_timeout_secs: 10,
            retry: RetryConfig::default(),
            load_mode: LoadMode::default(),
        }
    }
}

impl ExecutionConfig {
    pub fn enumerate_timeout(&self) -> Duration {
        Duration::from_secs(self.enumerate_timeout_secs)
    }

    pub fn table_timeout(&self) -> Duration {
        Duration::from_secs(self.table_timeout_secs)
    }

    pub fn credential_timeout(&self) -> Duration {
        Duration::from_secs(self.credential_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.retry.max_attempts)
            .with_initial_interval(Duration::from_millis(self.retry.initial_interval_ms))
            .with_backoff_coefficient(self.retry.backoff_coefficient)
            .with_max_interval(Duration::from_millis(self.retry.max_interval_ms))
    }
}

/// Retry policy as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub max_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_ms: 1000,
            backoff_coefficient: 2.0,
            max_interval_ms: 30_000,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (default: "0.0.0.0:8000").
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("jobs.json")
}

fn default_pg_port() -> u16 {
    5432
}

fn default_max_connections() -> usize {
    4
}
