//! Identifier validation and quoting shared by the warehouse drivers.
//!
//! Table and column names come from source warehouses and cannot be bound as
//! statement parameters, so every generated statement quotes them here.
//! Names are validated first (non-empty, no NUL, bounded length) and then
//! wrapped in the backend's quote character with embedded quotes doubled.

use crate::error::{Result, TransferError};

/// Maximum identifier length accepted for any backend.
/// - PostgreSQL: 63 bytes
/// - ClickHouse: no hard limit
/// - Snowflake: 255 characters
const MAX_IDENTIFIER_LENGTH: usize = 255;

/// Validate an identifier for security issues.
///
/// # Errors
///
/// Returns `TransferError::Config` for empty names, names containing NUL
/// bytes, or names longer than the backend-neutral limit.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TransferError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(TransferError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(TransferError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} characters: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier.
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quote a ClickHouse identifier using backticks.
///
/// Backslashes are escaped too since ClickHouse treats them as escapes
/// inside quoted identifiers.
pub fn quote_clickhouse(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!(
        "`{}`",
        name.replace('\\', "\\\\").replace('`', "\\`")
    ))
}

/// Quote a Snowflake identifier.
///
/// Quoted Snowflake identifiers are case-sensitive, which keeps source
/// column names exactly as extracted.
pub fn quote_snowflake(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Qualify a PostgreSQL table name with its schema.
pub fn qualify_pg(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?))
}

/// Qualify a ClickHouse table name with its database.
pub fn qualify_clickhouse(database: &str, table: &str) -> Result<String> {
    Ok(format!(
        "{}.{}",
        quote_clickhouse(database)?,
        quote_clickhouse(table)?
    ))
}

/// Qualify a Snowflake table name with database and schema.
pub fn qualify_snowflake(database: &str, schema: &str, table: &str) -> Result<String> {
    Ok(format!(
        "{}.{}.{}",
        quote_snowflake(database)?,
        quote_snowflake(schema)?,
        quote_snowflake(table)?
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_bad_names() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("bad\0name").is_err());
        assert!(validate_identifier(&"x".repeat(256)).is_err());
    }

    #[test]
    fn test_quote_escaping() {
        assert_eq!(quote_pg("users").unwrap(), "\"users\"");
        assert_eq!(quote_pg("a\"b").unwrap(), "\"a\"\"b\"");
        assert_eq!(quote_clickhouse("a`b").unwrap(), "`a\\`b`");
        assert_eq!(quote_snowflake("Mixed Case").unwrap(), "\"Mixed Case\"");
    }

    #[test]
    fn test_qualified_names() {
        assert_eq!(qualify_pg("public", "users").unwrap(), "\"public\".\"users\"");
        assert_eq!(
            qualify_clickhouse("analytics", "users").unwrap(),
            "`analytics`.`users`"
        );
        assert_eq!(
            qualify_snowflake("RAW", "PUBLIC", "users").unwrap(),
            "\"RAW\".\"PUBLIC\".\"users\""
        );
    }
}
