//! Core types for the pgdart PostgreSQL driver.
//!
//! This crate provides the data model shared by the wire-protocol driver:
//!
//! - `Error` and its structured sub-errors for connection, query, and
//!   protocol failures
//! - `Row` / `ColumnInfo` for positional and name-based column access
//! - `Value` for the text/NULL value model of the simple query protocol

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    ConnectionError, ConnectionErrorKind, Error, ProtocolError, QueryError, QueryErrorKind, Result,
};
pub use row::{ColumnInfo, Row};
pub use value::Value;
