//! Core types shared by the dbwire client crates.
//!
//! - [`Error`] - the error taxonomy (transport, protocol, SQL, transaction-lost,
//!   exhaustion) and its classification helpers
//! - [`Value`] - dynamically-typed SQL values used for parameters and columns
//! - [`Row`] / [`ColumnInfo`] - decoded result rows
//! - [`IsolationLevel`] - transaction isolation levels

pub mod error;
pub mod isolation;
pub mod row;
pub mod value;

pub use error::{
    BatchError, ConfigError, ConnectionError, ConnectionErrorKind, Error, ProtocolError,
    QueryError, QueryErrorKind, Result, TRANSACTION_LOST_MESSAGE, TransactionError,
    TransactionErrorKind, TypeError,
};
pub use isolation::IsolationLevel;
pub use row::{ColumnInfo, Row};
pub use value::Value;
