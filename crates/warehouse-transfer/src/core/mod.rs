//! Core abstractions for warehouse-agnostic table transfer.
//!
//! - [`value`]: cell values, rows and the text coercion policy
//! - [`schema`]: destination table descriptors and schema inference
//! - [`traits`]: the `Connector` capability set and `ConnectorFactory`
//! - [`catalog`]: kind-keyed factory registry for dependency injection
//! - [`scope`]: connect / run / always-close session helper
//! - [`identifier`]: identifier validation and quoting
//!
//! Drivers under `drivers/` implement these abstractions; the orchestrator
//! only ever talks to `dyn Connector` values built through the catalog.

pub mod catalog;
pub mod identifier;
pub mod schema;
pub mod scope;
pub mod traits;
pub mod value;

pub use catalog::ConnectorCatalog;
pub use schema::{infer, TableDescriptor};
pub use scope::with_connection;
pub use traits::{Connector, ConnectorFactory};
pub use value::{Row, SqlValue};
