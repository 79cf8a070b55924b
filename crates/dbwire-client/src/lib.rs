//! MySQL-protocol database client with failover and transaction replay.
//!
//! This crate speaks the MySQL wire protocol over blocking `std::net`
//! sockets. It provides:
//!
//! - Packet framing with sequence numbers, optional zstd compression and TLS
//! - Authentication (mysql_native_password, caching_sha2_password,
//!   sha256_password) through a pluggable credential source
//! - Text and binary query protocols, streaming results, multi-results
//! - A reference-counted, LRU-bounded prepared statement cache with
//!   client-side fallback
//! - Failover across candidate hosts with a shared denylist
//! - Transparent replay of an open transaction after connection loss
//! - Query timeouts enforced through a separate kill session
//!
//! # Example
//!
//! ```rust,ignore
//! use dbwire_client::{Command, Configuration, Connection, HaMode, HostAddress};
//!
//! let config = Configuration::new()
//!     .addresses(HostAddress::parse_list("db1:3306,db2:3306")?)
//!     .ha_mode(HaMode::Sequential)
//!     .transaction_replay(true)
//!     .user("app")
//!     .database("shop");
//!
//! let conn = Connection::connect(config)?;
//! conn.execute(&Command::query("BEGIN"), true)?;
//! conn.execute(&Command::query("INSERT INTO orders (id) VALUES (1)"), true)?;
//! conn.execute(&Command::query("COMMIT"), true)?;
//! ```

pub mod auth;
pub mod cache;
pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod context;
pub mod engine;
pub mod failover;
pub mod protocol;
pub mod replay;
pub mod timeout;
pub mod tls;
pub mod transport;
pub mod types;

pub use auth::{CredentialPlugin, Credentials, PasswordCredentials};
pub use cache::{PreparedStatementHandle, StatementCache};
pub use client::{AbortHandle, Client, SessionPolicy};
pub use codec::{CodecRegistry, DefaultCodecs};
pub use command::{Command, Completion, ResultSet, UpdateResult};
pub use config::{Configuration, HaMode, HostAddress, SslMode, TlsConfig};
pub use connection::Connection;
pub use context::SessionContext;
pub use engine::{EngineState, PrepareOutcome, ProtocolEngine};
pub use failover::{FailoverCoordinator, HostRegistry};
pub use replay::{ReplayState, TransactionLog};

pub use dbwire_core::{Error, IsolationLevel, Result, Row, Value};

/// Connect a [`Client`] per `config`.
pub fn connect(config: Configuration) -> Result<Client> {
    Client::connect(config)
}
