//! Warehouse credentials: raw maps, typed variants and the resolver.
//!
//! Requests carry credentials as loosely-typed JSON objects. [`resolve`]
//! validates such a map against the required-field set of its
//! [`WarehouseKind`] and returns a typed [`Credentials`] value. Nothing
//! downstream ever sees a partial credential set: connectors are only
//! constructed from resolved values.

mod mask;

pub use mask::{is_secret_key, mask_credentials, MASK};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::drivers::common::tls::SslMode;
use crate::error::{Result, TransferError};

/// Raw credential map as received from a request or registry record.
pub type CredentialMap = serde_json::Map<String, Value>;

/// Supported warehouse backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarehouseKind {
    Postgres,
    Clickhouse,
    Snowflake,
}

impl WarehouseKind {
    /// All built-in kinds.
    pub const ALL: [WarehouseKind; 3] = [
        WarehouseKind::Postgres,
        WarehouseKind::Clickhouse,
        WarehouseKind::Snowflake,
    ];

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            WarehouseKind::Postgres => "postgres",
            WarehouseKind::Clickhouse => "clickhouse",
            WarehouseKind::Snowflake => "snowflake",
        }
    }

    /// Required credential keys, in declaration order.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            WarehouseKind::Postgres => &["host", "port", "database", "user", "password"],
            WarehouseKind::Clickhouse => &["host", "database", "user", "password"],
            WarehouseKind::Snowflake => &[
                "account",
                "user",
                "password",
                "database",
                "schema",
                "warehouse",
            ],
        }
    }
}

impl fmt::Display for WarehouseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WarehouseKind {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(WarehouseKind::Postgres),
            "clickhouse" => Ok(WarehouseKind::Clickhouse),
            "snowflake" => Ok(WarehouseKind::Snowflake),
            other => Err(TransferError::Config(format!(
                "Unknown warehouse kind: '{}'. Supported kinds: postgres, clickhouse, snowflake",
                other
            ))),
        }
    }
}

/// PostgreSQL credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct PostgresCredentials {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Schema whose tables are read and written (default: "public").
    pub schema: String,
    /// TLS mode (`sslmode` or `ssl_mode` key, default disable).
    pub ssl_mode: SslMode,
}

/// ClickHouse credentials (HTTP interface).
#[derive(Clone, PartialEq, Eq)]
pub struct ClickhouseCredentials {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub secure: bool,
}

/// Snowflake credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct SnowflakeCredentials {
    pub account: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub schema: String,
    pub warehouse: String,
    pub role: Option<String>,
}

/// Validated credentials, one variant per warehouse kind.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Postgres(PostgresCredentials),
    Clickhouse(ClickhouseCredentials),
    Snowflake(SnowflakeCredentials),
}

impl Credentials {
    /// Warehouse kind of these credentials.
    pub fn kind(&self) -> WarehouseKind {
        match self {
            Credentials::Postgres(_) => WarehouseKind::Postgres,
            Credentials::Clickhouse(_) => WarehouseKind::Clickhouse,
            Credentials::Snowflake(_) => WarehouseKind::Snowflake,
        }
    }

    /// Human-readable endpoint for logs (never includes secrets).
    pub fn endpoint(&self) -> String {
        match self {
            Credentials::Postgres(c) => format!("{}:{}/{}", c.host, c.port, c.database),
            Credentials::Clickhouse(c) => format!("{}:{}/{}", c.host, c.port, c.database),
            Credentials::Snowflake(c) => {
                format!("{}/{}.{} ({})", c.account, c.database, c.schema, c.warehouse)
            }
        }
    }
}

impl fmt::Debug for PostgresCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

impl fmt::Debug for ClickhouseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClickhouseCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("secure", &self.secure)
            .finish()
    }
}

impl fmt::Debug for SnowflakeCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnowflakeCredentials")
            .field("account", &self.account)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("warehouse", &self.warehouse)
            .field("role", &self.role)
            .finish()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Postgres(c) => c.fmt(f),
            Credentials::Clickhouse(c) => c.fmt(f),
            Credentials::Snowflake(c) => c.fmt(f),
        }
    }
}

/// Alternate spellings accepted for canonical keys.
fn aliases(key: &str) -> &'static [&'static str] {
    match key {
        "database" => &["dbname"],
        "user" => &["username"],
        _ => &[],
    }
}

/// Look up a field (or one of its aliases), treating null and "" as absent.
fn lookup<'a>(map: &'a CredentialMap, key: &str) -> Option<&'a Value> {
    std::iter::once(key)
        .chain(aliases(key).iter().copied())
        .filter_map(|k| map.get(k))
        .find(|v| match v {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        })
}

/// Required fields absent from `map`, in declaration order.
pub fn missing_fields(kind: WarehouseKind, map: &CredentialMap) -> Vec<String> {
    kind.required_fields()
        .iter()
        .filter(|key| lookup(map, key).is_none())
        .map(|key| key.to_string())
        .collect()
}

/// Typed field reader over a credential map that has passed the presence check.
struct Fields<'a> {
    kind: WarehouseKind,
    map: &'a CredentialMap,
}

impl<'a> Fields<'a> {
    fn string(&self, key: &str) -> Result<String> {
        self.opt_string(key)?.ok_or_else(|| TransferError::MissingCredentialFields {
            kind: self.kind,
            missing: vec![key.to_string()],
        })
    }

    fn opt_string(&self, key: &str) -> Result<Option<String>> {
        match lookup(self.map, key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(_) => Err(self.invalid(key, "expected a string")),
        }
    }

    fn opt_port(&self, key: &str) -> Result<Option<u16>> {
        let parsed = match lookup(self.map, key) {
            None => return Ok(None),
            Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Some(Value::String(s)) => s.trim().parse::<u16>().ok(),
            Some(_) => None,
        };
        match parsed {
            Some(0) | None => Err(self.invalid(key, "expected a port number between 1 and 65535")),
            Some(port) => Ok(Some(port)),
        }
    }

    fn opt_bool(&self, key: &str) -> Result<Option<bool>> {
        match lookup(self.map, key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Some(true)),
                "false" | "no" | "0" => Ok(Some(false)),
                _ => Err(self.invalid(key, "expected a boolean")),
            },
            Some(Value::Number(n)) => match n.as_u64() {
                Some(0) => Ok(Some(false)),
                Some(1) => Ok(Some(true)),
                _ => Err(self.invalid(key, "expected a boolean")),
            },
            Some(_) => Err(self.invalid(key, "expected a boolean")),
        }
    }

    fn opt_ssl_mode(&self) -> Result<SslMode> {
        let (key, raw) = match self.opt_string("sslmode")? {
            Some(raw) => ("sslmode", raw),
            None => match self.opt_string("ssl_mode")? {
                Some(raw) => ("ssl_mode", raw),
                None => return Ok(SslMode::Disable),
            },
        };
        raw.parse::<SslMode>().map_err(|_| {
            self.invalid(
                key,
                &format!(
                    "unsupported value '{}' (expected disable, require, verify-ca or verify-full)",
                    raw
                ),
            )
        })
    }

    fn invalid(&self, key: &str, message: &str) -> TransferError {
        TransferError::InvalidCredential {
            kind: self.kind,
            field: key.to_string(),
            message: message.to_string(),
        }
    }
}

/// Validate a raw credential map and convert it into typed [`Credentials`].
///
/// Fails with [`TransferError::MissingCredentialFields`] naming exactly the
/// absent required keys, or [`TransferError::InvalidCredential`] for a
/// malformed value. Logs a masked view of the map.
pub fn resolve(kind: WarehouseKind, map: &CredentialMap) -> Result<Credentials> {
    let masked = Value::Object(mask_credentials(map));
    info!("Resolving {} credentials: {}", kind, masked);

    let missing = missing_fields(kind, map);
    if !missing.is_empty() {
        return Err(TransferError::MissingCredentialFields { kind, missing });
    }

    let fields = Fields { kind, map };
    let credentials = match kind {
        WarehouseKind::Postgres => Credentials::Postgres(PostgresCredentials {
            host: fields.string("host")?,
            port: fields.opt_port("port")?.unwrap_or(5432),
            database: fields.string("database")?,
            user: fields.string("user")?,
            password: fields.string("password")?,
            schema: fields
                .opt_string("schema")?
                .unwrap_or_else(|| "public".to_string()),
            ssl_mode: fields.opt_ssl_mode()?,
        }),
        WarehouseKind::Clickhouse => {
            let secure = fields.opt_bool("secure")?.unwrap_or(false);
            let default_port = if secure { 8443 } else { 8123 };
            Credentials::Clickhouse(ClickhouseCredentials {
                host: fields.string("host")?,
                port: fields.opt_port("port")?.unwrap_or(default_port),
                database: fields.string("database")?,
                user: fields.string("user")?,
                password: fields.string("password")?,
                secure,
            })
        }
        WarehouseKind::Snowflake => Credentials::Snowflake(SnowflakeCredentials {
            account: fields.string("account")?,
            user: fields.string("user")?,
            password: fields.string("password")?,
            database: fields.string("database")?,
            schema: fields.string("schema")?,
            warehouse: fields.string("warehouse")?,
            role: fields.opt_string("role")?,
        }),
    };

    Ok(credentials)
}
