//! Error types for dbwire operations.
//!
//! The taxonomy mirrors how the client reacts to a failure:
//!
//! - transport errors (timeout, reset, TLS) close the physical connection and
//!   make the logical session eligible for failover;
//! - protocol errors (malformed packets, bad sequence numbers, corrupt
//!   compressed frames) always close the physical connection;
//! - server SQL errors leave the connection usable;
//! - transaction-lost errors report that an open transaction could not be
//!   carried across a reconnect;
//! - exhaustion errors report that no candidate host accepted a connection.

use std::fmt;

/// Message used whenever an open transaction cannot survive a reconnect.
pub const TRANSACTION_LOST_MESSAGE: &str = "In progress transaction was lost";

/// The primary error type for all dbwire operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, timeout, exhaustion)
    Connection(ConnectionError),
    /// Server-reported SQL errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Protocol errors (wire-level)
    Protocol(ProtocolError),
    /// Batch execution stopped part way through
    Batch(BatchError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection refused
    Refused,
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// Socket read or write exceeded the configured timeout
    Timeout,
    /// SSL/TLS negotiation failed
    Ssl,
    /// The connection was closed by the caller
    Closed,
    /// Every candidate host failed within the retry budget
    NoHostAvailable,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// Server error code (e.g. 1062 for a duplicate key)
    pub code: u16,
    pub sqlstate: Option<String>,
    pub message: String,
    pub sql: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Data too large for column
    DataTruncation,
    /// Deadlock detected
    Deadlock,
    /// Statement was interrupted by a kill command
    Interrupted,
    /// Statement exceeded its query timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
    pub source: Option<Box<Error>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// The open transaction did not survive a reconnect
    Lost,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// A batch stopped at a failing item.
///
/// `update_counts` holds the affected-row counts of the items that completed
/// before the failure, in submission order.
#[derive(Debug)]
pub struct BatchError {
    pub update_counts: Vec<u64>,
    pub cause: Box<Error>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build the "In progress transaction was lost" error.
    pub fn transaction_lost(cause: Option<Error>) -> Self {
        Error::Transaction(TransactionError {
            kind: TransactionErrorKind::Lost,
            message: TRANSACTION_LOST_MESSAGE.to_string(),
            source: cause.map(Box::new),
        })
    }

    /// Build the error returned after every candidate host failed.
    pub fn no_host_available(attempts: u32, last: Option<Error>) -> Self {
        let message = match &last {
            Some(err) => format!("No host available after {attempts} attempts: {err}"),
            None => format!("No host available after {attempts} attempts"),
        };
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::NoHostAvailable,
            message,
            source: last.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        })
    }

    /// Build the error returned by any call on a closed connection.
    pub fn closed() -> Self {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Closed,
            message: "connection is closed".to_string(),
            source: None,
        })
    }

    /// Is this a retryable error (deadlock, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(q.kind, QueryErrorKind::Deadlock | QueryErrorKind::Timeout),
            Error::Connection(c) => matches!(c.kind, ConnectionErrorKind::Timeout),
            _ => false,
        }
    }

    /// Does this error leave the physical connection unusable?
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Connection(_) | Error::Protocol(_) | Error::Io(_) => true,
            Error::Query(q) => q.is_connection_closed(),
            Error::Batch(b) => b.cause.is_fatal(),
            _ => false,
        }
    }

    /// Was the physical connection lost in a way that failover can repair?
    ///
    /// Protocol corruption is fatal but never retried on another host, and an
    /// explicit close or exhausted host list is final.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Disconnected
                    | ConnectionErrorKind::Timeout
                    | ConnectionErrorKind::Connect
                    | ConnectionErrorKind::Refused
            ),
            Error::Io(_) => true,
            Error::Query(q) => q.is_connection_closed(),
            _ => false,
        }
    }

    /// Is this the transaction-lost error?
    pub fn is_transaction_lost(&self) -> bool {
        matches!(self, Error::Transaction(t) if t.kind == TransactionErrorKind::Lost)
    }

    /// Get SQLSTATE if available (e.g., "23000" for an integrity violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            Error::Batch(b) => b.cause.sqlstate(),
            _ => None,
        }
    }

    /// Get the server error code if available.
    pub fn code(&self) -> Option<u16> {
        match self {
            Error::Query(q) => Some(q.code),
            Error::Batch(b) => b.cause.code(),
            _ => None,
        }
    }
}

impl QueryError {
    /// Build a query error from the three fields of a server error packet.
    pub fn from_server(code: u16, sqlstate: &str, message: impl Into<String>) -> Self {
        let sqlstate = if sqlstate.is_empty() {
            None
        } else {
            Some(sqlstate.to_string())
        };
        Self {
            kind: QueryErrorKind::classify(code, sqlstate.as_deref()),
            code,
            sqlstate,
            message: message.into(),
            sql: None,
        }
    }

    /// Attach the SQL text that produced this error.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Did the server close the session while reporting this error?
    pub fn is_connection_closed(&self) -> bool {
        // 1053 server shutdown, 1152 aborted connection, 1927 connection killed
        matches!(self.code, 1053 | 1152 | 1927)
            || self
                .sqlstate
                .as_deref()
                .is_some_and(|state| state.starts_with("08"))
    }

    /// Is this a duplicate key violation?
    pub fn is_duplicate_key(&self) -> bool {
        self.code == 1062
    }
}

impl QueryErrorKind {
    /// Map a server error code and SQLSTATE onto a coarse kind.
    pub fn classify(code: u16, sqlstate: Option<&str>) -> Self {
        match code {
            1213 => return QueryErrorKind::Deadlock,
            1317 => return QueryErrorKind::Interrupted,
            1064 | 1149 => return QueryErrorKind::Syntax,
            1146 | 1054 | 1049 => return QueryErrorKind::NotFound,
            1044 | 1045 | 1142 | 1143 => return QueryErrorKind::Permission,
            1406 => return QueryErrorKind::DataTruncation,
            3024 => return QueryErrorKind::Timeout,
            _ => {}
        }
        match sqlstate.map(|s| s.get(..2).unwrap_or(s)) {
            Some("23") => QueryErrorKind::Constraint,
            Some("42") => QueryErrorKind::Syntax,
            Some("22") => QueryErrorKind::DataTruncation,
            Some("40") => QueryErrorKind::Deadlock,
            Some("28") => QueryErrorKind::Permission,
            _ => QueryErrorKind::Database,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "{}", e.message),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Batch(e) => write!(f, "{}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Transaction(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Batch(e) => Some(e.cause.as_ref()),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "({} / {}) {}", self.code, sqlstate, self.message)
        } else {
            write!(f, "({}) {}", self.code, self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Batch failed after {} successful item(s): {}",
            self.update_counts.len(),
            self.cause
        )
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<BatchError> for Error {
    fn from(err: BatchError) -> Self {
        Error::Batch(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for dbwire operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn disconnected() -> Error {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: "connection reset".to_string(),
            source: None,
        })
    }

    #[test]
    fn test_query_error_classification() {
        let dup = QueryError::from_server(1062, "23000", "Duplicate entry '1' for key 'PRIMARY'");
        assert_eq!(dup.kind, QueryErrorKind::Constraint);
        assert!(dup.is_duplicate_key());

        let syntax = QueryError::from_server(1064, "42000", "You have an error in your SQL syntax");
        assert_eq!(syntax.kind, QueryErrorKind::Syntax);

        let killed = QueryError::from_server(1317, "70100", "Query execution was interrupted");
        assert_eq!(killed.kind, QueryErrorKind::Interrupted);
        assert!(!killed.is_connection_closed());

        let unknown = QueryError::from_server(9999, "", "odd");
        assert_eq!(unknown.kind, QueryErrorKind::Database);
        assert_eq!(unknown.sqlstate, None);
    }

    #[test]
    fn test_server_close_errors_are_fatal() {
        let err = Error::Query(QueryError::from_server(1927, "70100", "Connection was killed"));
        assert!(err.is_fatal());
        assert!(err.is_connection_loss());

        let state_08 = Error::Query(QueryError::from_server(2013, "08S01", "lost"));
        assert!(state_08.is_fatal());

        let ordinary = Error::Query(QueryError::from_server(1146, "42S02", "no such table"));
        assert!(!ordinary.is_fatal());
        assert!(!ordinary.is_connection_loss());
    }

    #[test]
    fn test_connection_loss_flags() {
        assert!(disconnected().is_connection_loss());
        assert!(disconnected().is_fatal());

        let protocol = Error::Protocol(ProtocolError {
            message: "bad sequence".to_string(),
            raw_data: None,
            source: None,
        });
        assert!(protocol.is_fatal());
        assert!(!protocol.is_connection_loss());

        assert!(!Error::closed().is_connection_loss());
        assert!(!Error::no_host_available(4, None).is_connection_loss());
    }

    #[test]
    fn test_transaction_lost_message() {
        let err = Error::transaction_lost(Some(disconnected()));
        assert!(err.is_transaction_lost());
        assert_eq!(err.to_string(), TRANSACTION_LOST_MESSAGE);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_no_host_available_message() {
        let err = Error::no_host_available(4, Some(disconnected()));
        let text = err.to_string();
        assert!(text.contains("No host available after 4 attempts"), "{text}");
        assert!(matches!(
            err,
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::NoHostAvailable,
                ..
            })
        ));
    }

    #[test]
    fn test_batch_error_delegates() {
        let err = Error::Batch(BatchError {
            update_counts: vec![1, 1],
            cause: Box::new(Error::Query(QueryError::from_server(
                1062, "23000", "Duplicate",
            ))),
        });
        assert_eq!(err.code(), Some(1062));
        assert_eq!(err.sqlstate(), Some("23000"));
        assert!(!err.is_fatal());
        assert!(err.to_string().starts_with("Batch failed after 2"));
    }
}
