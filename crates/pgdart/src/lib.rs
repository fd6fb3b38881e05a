//! PostgreSQL wire-protocol client.
//!
//! `pgdart` implements the PostgreSQL frontend/backend protocol (version
//! 3.0) from scratch over a single TCP connection. It provides:
//!
//! - Message framing and parsing for arbitrarily chunked byte streams
//! - Authentication (trust, cleartext, MD5, SCRAM-SHA-256)
//! - The simple query protocol with structured results
//! - Connection management with an explicit state machine
//!
//! Results are delivered as text-format values; type-aware decoding,
//! the extended query protocol, TLS, and pooling are out of scope.
//!
//! # Example
//!
//! ```rust,ignore
//! use pgdart::{PgConfig, PgConnection};
//!
//! let config = PgConfig::new("localhost", "postgres", "mydb").password("secret");
//! let mut conn = PgConnection::connect(config)?;
//! let result = conn.query("SELECT 1 AS n")?;
//! assert_eq!(result.rows[0].get_str("n"), Some("1"));
//! conn.close()?;
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod protocol;

pub use config::PgConfig;
pub use connection::{ConnectionState, PgConnection, QueryResult, TransactionStatusState};
pub use pgdart_core::error::{
    ConnectionError, ConnectionErrorKind, ProtocolError, QueryError, QueryErrorKind,
};
pub use pgdart_core::{ColumnInfo, Error, Result, Row, Value};
pub use protocol::FieldDescription;
