//! Client configuration.
//!
//! [`Configuration`] is an explicit record of every option the client
//! understands. Options can be set three ways:
//! - builder methods (`Configuration::new().host("db1", 3306).user("app")`)
//! - by name through [`Configuration::set`], driven by the static
//!   [`OPTIONS`] table
//! - deserialized with serde (`#[serde(default)]` fills the rest)
//!
//! The codec registry and credential plugin are injected values, and clones
//! of a configuration share one [`HostRegistry`] so the denylist is common to
//! every connection built from it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::{CredentialPlugin, PasswordCredentials};
use crate::codec::{CodecRegistry, DefaultCodecs};
use crate::failover::HostRegistry;
use crate::protocol::capabilities;
use crate::protocol::charset;
use dbwire_core::error::ConfigError;
use dbwire_core::{Error, IsolationLevel, Result};

/// Default server port.
pub const DEFAULT_PORT: u16 = 3306;

/// A candidate server address. Identity is `(host, port)`; health data
/// lives in the [`HostRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
}

impl HostAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port` or `[v6addr]:port`.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(config_error("empty host address"));
        }
        if let Some(rest) = text.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| config_error(format!("unterminated IPv6 address '{text}'")))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(config_error(format!("invalid host address '{text}'"))),
            };
            return Ok(Self::new(host, port));
        }
        match text.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => Ok(Self::new(host, parse_port(port)?)),
            _ => Ok(Self::new(text, DEFAULT_PORT)),
        }
    }

    /// Parse a comma-separated host list.
    pub fn parse_list(text: &str) -> Result<Vec<Self>> {
        text.split(',')
            .filter(|s| !s.trim().is_empty())
            .map(Self::parse)
            .collect()
    }

    /// `host:port` form used for socket connects.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.socket_addr())
    }
}

fn parse_port(text: &str) -> Result<u16> {
    text.parse()
        .map_err(|_| config_error(format!("invalid port '{text}'")))
}

/// How multiple candidate hosts are used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaMode {
    /// Single host; only `retries_all_down` governs reconnects
    #[default]
    None,
    /// Try hosts in order and stick with the first that answers
    Sequential,
    /// Weighted-random choice favouring lightly loaded hosts
    LoadBalance,
}

impl FromStr for HaMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "" | "none" => Ok(HaMode::None),
            "sequential" => Ok(HaMode::Sequential),
            "loadbalance" => Ok(HaMode::LoadBalance),
            _ => Err(config_error(format!("unknown HA mode '{s}'"))),
        }
    }
}

/// SSL mode for connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    /// Do not use SSL
    #[default]
    Disable,
    /// Prefer SSL if available, fall back to non-SSL
    Preferred,
    /// Require SSL connection
    Required,
    /// Require SSL and verify server certificate
    VerifyCa,
    /// Require SSL and verify server certificate matches hostname
    VerifyIdentity,
}

impl SslMode {
    /// Check if SSL should be attempted.
    pub const fn should_try_ssl(self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    /// Check if SSL is required.
    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }
}

impl FromStr for SslMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "disable" | "disabled" | "false" => Ok(SslMode::Disable),
            "preferred" | "prefer" => Ok(SslMode::Preferred),
            "required" | "require" | "trust" | "true" => Ok(SslMode::Required),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-identity" | "verify-full" => Ok(SslMode::VerifyIdentity),
            _ => Err(config_error(format!("unknown SSL mode '{s}'"))),
        }
    }
}

/// TLS material and verification options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// CA certificate (PEM) used to verify the server
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate (PEM) for mutual TLS
    pub client_cert_path: Option<PathBuf>,
    /// Client private key (PEM) for mutual TLS
    pub client_key_path: Option<PathBuf>,
    /// Accept any server certificate
    pub danger_skip_verify: bool,
    /// Override the SNI / verification name
    pub server_name: Option<String>,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(path.into());
        self
    }

    pub fn client_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_key_path = Some(path.into());
        self
    }

    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.danger_skip_verify = skip;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

fn default_codecs() -> Arc<dyn CodecRegistry> {
    Arc::new(DefaultCodecs)
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Candidate hosts, in priority order
    pub addresses: Vec<HostAddress>,
    pub ha_mode: HaMode,
    pub user: String,
    pub password: Option<String>,
    /// Database selected at connect time
    pub database: Option<String>,

    pub connect_timeout: Duration,
    /// Read/write timeout on the socket; `None` blocks indefinitely
    pub socket_timeout: Option<Duration>,
    /// Per-command timeout enforced with a kill connection
    pub query_timeout: Option<Duration>,

    /// Connection attempts allowed before reporting no host available
    pub retries_all_down: u32,
    /// Sleep between passes over the host list
    pub wait_reconnect_timeout: Duration,
    /// How long a failed host stays denylisted
    pub denied_list_timeout: Duration,

    pub transaction_replay: bool,
    /// Commands recorded per transaction before replay is abandoned
    pub transaction_replay_size: usize,

    pub use_server_prep_stmts: bool,
    pub cache_prep_stmts: bool,
    pub prep_stmt_cache_size: usize,

    /// Rows fetched per round trip; 0 buffers the whole result
    pub fetch_size: usize,
    pub allow_multi_queries: bool,
    /// Coalesce independent commands into one round trip
    pub use_pipeline: bool,
    pub use_compression: bool,
    pub compression_level: u8,
    pub max_packet_size: u32,
    pub charset: u8,
    /// Isolation level applied to every new session
    pub transaction_isolation: Option<IsolationLevel>,

    pub ssl_mode: SslMode,
    pub tls: TlsConfig,
    pub connection_attributes: BTreeMap<String, String>,

    #[serde(skip, default = "default_codecs")]
    pub codecs: Arc<dyn CodecRegistry>,
    #[serde(skip)]
    pub credentials: Option<Arc<dyn CredentialPlugin>>,
    #[serde(skip)]
    registry: Arc<HostRegistry>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            addresses: vec![HostAddress::new("localhost", DEFAULT_PORT)],
            ha_mode: HaMode::None,
            user: String::new(),
            password: None,
            database: None,
            connect_timeout: Duration::from_secs(30),
            socket_timeout: None,
            query_timeout: None,
            retries_all_down: 120,
            wait_reconnect_timeout: Duration::from_millis(250),
            denied_list_timeout: Duration::from_secs(60),
            transaction_replay: false,
            transaction_replay_size: 64,
            use_server_prep_stmts: true,
            cache_prep_stmts: true,
            prep_stmt_cache_size: 250,
            fetch_size: 0,
            allow_multi_queries: false,
            use_pipeline: true,
            use_compression: false,
            compression_level: crate::protocol::compress::DEFAULT_ZSTD_LEVEL,
            max_packet_size: 64 * 1024 * 1024,
            charset: charset::DEFAULT_CHARSET,
            transaction_isolation: None,
            ssl_mode: SslMode::default(),
            tls: TlsConfig::default(),
            connection_attributes: BTreeMap::new(),
            codecs: default_codecs(),
            credentials: None,
            registry: Arc::new(HostRegistry::default()),
        }
    }
}

impl Configuration {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from `(name, value)` pairs.
    pub fn from_options<I, K, V>(options: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (name, value) in options {
            config.set(name.as_ref(), value.as_ref())?;
        }
        Ok(config)
    }

    /// Set one option by its external name (see [`OPTIONS`]).
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let option = OPTIONS
            .iter()
            .find(|o| o.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| config_error(format!("unknown option '{name}'")))?;
        (option.apply)(self, value.trim()).map_err(|e| match e {
            Error::Config(c) => config_error(format!("option '{name}': {}", c.message)),
            other => other,
        })
    }

    /// Replace the host list with a single host.
    pub fn host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.addresses = vec![HostAddress::new(host, port)];
        self
    }

    /// Replace the host list.
    pub fn addresses(mut self, addresses: Vec<HostAddress>) -> Self {
        self.addresses = addresses;
        self
    }

    pub fn ha_mode(mut self, mode: HaMode) -> Self {
        self.ha_mode = mode;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn socket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn query_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn retries_all_down(mut self, retries: u32) -> Self {
        self.retries_all_down = retries;
        self
    }

    pub fn wait_reconnect_timeout(mut self, wait: Duration) -> Self {
        self.wait_reconnect_timeout = wait;
        self
    }

    pub fn denied_list_timeout(mut self, timeout: Duration) -> Self {
        self.denied_list_timeout = timeout;
        self
    }

    pub fn transaction_replay(mut self, enabled: bool) -> Self {
        self.transaction_replay = enabled;
        self
    }

    pub fn transaction_replay_size(mut self, size: usize) -> Self {
        self.transaction_replay_size = size;
        self
    }

    pub fn use_server_prep_stmts(mut self, enabled: bool) -> Self {
        self.use_server_prep_stmts = enabled;
        self
    }

    pub fn cache_prep_stmts(mut self, enabled: bool) -> Self {
        self.cache_prep_stmts = enabled;
        self
    }

    pub fn prep_stmt_cache_size(mut self, size: usize) -> Self {
        self.prep_stmt_cache_size = size;
        self
    }

    pub fn fetch_size(mut self, size: usize) -> Self {
        self.fetch_size = size;
        self
    }

    pub fn allow_multi_queries(mut self, enabled: bool) -> Self {
        self.allow_multi_queries = enabled;
        self
    }

    pub fn use_pipeline(mut self, enabled: bool) -> Self {
        self.use_pipeline = enabled;
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.use_compression = enabled;
        self
    }

    pub fn max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn transaction_isolation(mut self, level: IsolationLevel) -> Self {
        self.transaction_isolation = Some(level);
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.connection_attributes.insert(key.into(), value.into());
        self
    }

    /// Inject the codec registry.
    pub fn codecs(mut self, codecs: Arc<dyn CodecRegistry>) -> Self {
        self.codecs = codecs;
        self
    }

    /// Inject the credential plugin. Without one, `user`/`password` are used.
    pub fn credential_plugin(mut self, plugin: Arc<dyn CredentialPlugin>) -> Self {
        self.credentials = Some(plugin);
        self
    }

    /// The credential plugin used for handshakes.
    pub fn credential_source(&self) -> Arc<dyn CredentialPlugin> {
        match &self.credentials {
            Some(plugin) => Arc::clone(plugin),
            None => Arc::new(PasswordCredentials::new(
                self.user.clone(),
                self.password.clone(),
            )),
        }
    }

    /// Health state shared by every clone of this configuration.
    pub fn host_registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    /// Check option combinations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.addresses.is_empty() {
            return Err(config_error("at least one host address is required"));
        }
        if self.ha_mode == HaMode::None && self.addresses.len() > 1 {
            return Err(config_error(
                "multiple hosts require haMode sequential or loadbalance",
            ));
        }
        if self.transaction_replay && self.transaction_replay_size == 0 {
            return Err(config_error("transactionReplaySize must be positive"));
        }
        Ok(())
    }

    /// Build capability flags based on configuration.
    pub fn capability_flags(&self) -> u32 {
        use capabilities::{
            CLIENT_CONNECT_ATTRS, CLIENT_CONNECT_WITH_DB, CLIENT_MULTI_STATEMENTS, CLIENT_SSL,
            CLIENT_ZSTD_COMPRESSION_ALGORITHM, DEFAULT_CLIENT_FLAGS,
        };

        let mut flags = DEFAULT_CLIENT_FLAGS;

        if self.database.is_some() {
            flags |= CLIENT_CONNECT_WITH_DB;
        }
        if self.ssl_mode.should_try_ssl() {
            flags |= CLIENT_SSL;
        }
        if self.use_compression {
            flags |= CLIENT_ZSTD_COMPRESSION_ALGORITHM;
        }
        if self.allow_multi_queries {
            flags |= CLIENT_MULTI_STATEMENTS;
        }
        if !self.connection_attributes.is_empty() {
            flags |= CLIENT_CONNECT_ATTRS;
        }

        flags
    }
}

/// One entry of the option table: external name and a parse-and-assign
/// function.
pub struct ConfigOption {
    pub name: &'static str,
    pub description: &'static str,
    apply: fn(&mut Configuration, &str) -> Result<()>,
}

impl fmt::Debug for ConfigOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigOption")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" | "" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(config_error(format!("expected a boolean, got '{value}'"))),
    }
}

fn parse_num<T: FromStr>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| config_error(format!("expected a number, got '{value}'")))
}

fn parse_millis(value: &str) -> Result<Duration> {
    parse_num::<u64>(value).map(Duration::from_millis)
}

/// Zero disables the timeout.
fn parse_optional_millis(value: &str) -> Result<Option<Duration>> {
    let millis = parse_num::<u64>(value)?;
    Ok((millis > 0).then(|| Duration::from_millis(millis)))
}

fn parse_attributes(value: &str) -> Result<BTreeMap<String, String>> {
    value
        .split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            pair.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| config_error(format!("expected key:value, got '{pair}'")))
        })
        .collect()
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Every option settable by name.
pub static OPTIONS: &[ConfigOption] = &[
    ConfigOption {
        name: "addresses",
        description: "comma-separated host[:port] list",
        apply: |c, v| {
            c.addresses = HostAddress::parse_list(v)?;
            Ok(())
        },
    },
    ConfigOption {
        name: "haMode",
        description: "none, sequential or loadbalance",
        apply: |c, v| {
            c.ha_mode = v.parse()?;
            Ok(())
        },
    },
    ConfigOption {
        name: "user",
        description: "user name",
        apply: |c, v| {
            c.user = v.to_string();
            Ok(())
        },
    },
    ConfigOption {
        name: "password",
        description: "password",
        apply: |c, v| {
            c.password = Some(v.to_string());
            Ok(())
        },
    },
    ConfigOption {
        name: "database",
        description: "database selected at connect time",
        apply: |c, v| {
            c.database = non_empty(v);
            Ok(())
        },
    },
    ConfigOption {
        name: "connectTimeout",
        description: "connect timeout in milliseconds",
        apply: |c, v| {
            c.connect_timeout = parse_millis(v)?;
            Ok(())
        },
    },
    ConfigOption {
        name: "socketTimeout",
        description: "socket read/write timeout in milliseconds, 0 for none",
        apply: |c, v| {
            c.socket_timeout = parse_optional_millis(v)?;
            Ok(())
        },
    },
    ConfigOption {
        name: "queryTimeout",
        description: "per-command timeout in milliseconds, 0 for none",
        apply: |c, v| {
            c.query_timeout = parse_optional_millis(v)?;
            Ok(())
        },
    },
    ConfigOption {
        name: "retriesAllDown",
        description: "connection attempts before giving up",
        apply: |c, v| {
            c.retries_all_down = parse_num(v)?;
            Ok(())
        },
    },
    ConfigOption {
        name: "waitReconnectTimeout",
        description: "sleep between passes over the host list, in milliseconds",
        apply: |c, v| {
            c.wait_reconnect_timeout = parse_millis(v)?;
            Ok(())
        },
    },
    ConfigOption {
        name: "deniedListTimeout",
        description: "denylist duration for a failed host, in milliseconds",
        apply: |c, v| {
            c.denied_list_timeout = parse_millis(v)?;
            Ok(())
        },
    },
    ConfigOption {
        name: "transactionReplay",
        description: "replay open transactions after a reconnect",
        apply: |c, v| {
            c.transaction_replay = parse_bool(v)?;
            Ok(())
        },
    },
    ConfigOption {
        name: "transactionReplaySize",
        description: "maximum commands recorded per transaction",
        apply: |c, v| {
            c.transaction_replay_size = parse_num(v)?;
            Ok(())
        },
    },
    ConfigOption {
        name: "useServerPrepStmts",
        description: "prepare statements on the server",
        apply: |c, v| {
            c.use_server_prep_stmts = parse_bool(v)?;
            Ok(())
        },
    },
    ConfigOption {
        name: "cachePrepStmts",
        description: "cache prepared statements by SQL text",
        apply: |c, v| {
            c.cache_prep_stmts = parse_bool(v)?;
            Ok(())
        },
    },
    ConfigOption {
        name: "prepStmtCacheSize",
        description: "prepared statement cache capacity",
        apply: |c, v| {
            c.prep_stmt_cache_size = parse_num(v)?;
            Ok(())
        },
    },
    ConfigOption {
        name: "defaultFetchSize",
        description: "rows per round trip, 0 to buffer whole results",
        apply: |c, v| {
            c.fetch_size = parse_num(v)?;
            Ok(())
        },
    },
    ConfigOption {
        name: "allowMultiQueries",
        description: "allow several statements per query",
        apply: |c, v| {
            c.allow_multi_queries = parse_bool(v)?;
            Ok(())
        },
    },
    ConfigOption {
        name: "disablePipeline",
        description: "send commands one round trip at a time",
        apply: |c, v| {
            c.use_pipeline = !parse_bool(v)?;
            Ok(())
        },
    },
    ConfigOption {
        name: "useCompression",
        description: "negotiate zstd compression",
        apply: |c, v| {
            c.use_compression = parse_bool(v)?;
            Ok(())
        },
    },
    ConfigOption {
        name: "compressionLevel",
        description: "zstd compression level",
        apply: |c, v| {
            c.compression_level = parse_num(v)?;
            Ok(())
        },
    },
    ConfigOption {
        name: "maxAllowedPacket",
        description: "max packet size announced in the handshake",
        apply: |c, v| {
            c.max_packet_size = parse_num(v)?;
            Ok(())
        },
    },
    ConfigOption {
        name: "transactionIsolation",
        description: "isolation level applied to new sessions",
        apply: |c, v| {
            c.transaction_isolation = Some(
                IsolationLevel::parse(v)
                    .ok_or_else(|| config_error(format!("unknown isolation level '{v}'")))?,
            );
            Ok(())
        },
    },
    ConfigOption {
        name: "sslMode",
        description: "disable, preferred, required, verify-ca or verify-identity",
        apply: |c, v| {
            c.ssl_mode = v.parse()?;
            Ok(())
        },
    },
    ConfigOption {
        name: "serverSslCert",
        description: "CA certificate path",
        apply: |c, v| {
            c.tls.ca_cert_path = non_empty(v).map(PathBuf::from);
            Ok(())
        },
    },
    ConfigOption {
        name: "clientCert",
        description: "client certificate path",
        apply: |c, v| {
            c.tls.client_cert_path = non_empty(v).map(PathBuf::from);
            Ok(())
        },
    },
    ConfigOption {
        name: "clientKey",
        description: "client private key path",
        apply: |c, v| {
            c.tls.client_key_path = non_empty(v).map(PathBuf::from);
            Ok(())
        },
    },
    ConfigOption {
        name: "trustServerCertificate",
        description: "skip server certificate verification",
        apply: |c, v| {
            c.tls.danger_skip_verify = parse_bool(v)?;
            Ok(())
        },
    },
    ConfigOption {
        name: "connectionAttributes",
        description: "key:value pairs sent at handshake",
        apply: |c, v| {
            c.connection_attributes = parse_attributes(v)?;
            Ok(())
        },
    },
];

pub(crate) fn config_error(message: impl Into<String>) -> Error {
    Error::Config(ConfigError {
        message: message.into(),
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Configuration::default();
        assert_eq!(config.ha_mode, HaMode::None);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.socket_timeout, None);
        assert_eq!(config.retries_all_down, 120);
        assert_eq!(config.wait_reconnect_timeout, Duration::from_millis(250));
        assert_eq!(config.denied_list_timeout, Duration::from_secs(60));
        assert!(!config.transaction_replay);
        assert_eq!(config.transaction_replay_size, 64);
        assert!(config.use_server_prep_stmts);
        assert!(config.cache_prep_stmts);
        assert_eq!(config.prep_stmt_cache_size, 250);
        assert_eq!(config.fetch_size, 0);
        assert_eq!(config.ssl_mode, SslMode::Disable);
    }

    #[test]
    fn test_builder() {
        let config = Configuration::new()
            .host("db.example.com", 3307)
            .user("myuser")
            .password("secret")
            .database("testdb")
            .transaction_replay(true)
            .attribute("program_name", "myapp");

        assert_eq!(config.addresses, vec![HostAddress::new("db.example.com", 3307)]);
        assert_eq!(config.user, "myuser");
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert!(config.transaction_replay);
        assert_eq!(
            config.connection_attributes.get("program_name").map(String::as_str),
            Some("myapp")
        );
    }

    #[test]
    fn test_set_by_name() {
        let config = Configuration::from_options([
            ("addresses", "db1:3306, db2:3307"),
            ("haMode", "sequential"),
            ("retriesAllDown", "4"),
            ("waitReconnectTimeout", "10"),
            ("transactionReplay", "true"),
            ("disablePipeline", "true"),
            ("socketTimeout", "0"),
            ("transactionIsolation", "READ-COMMITTED"),
            ("connectionAttributes", "app:test,env:ci"),
        ])
        .unwrap();

        assert_eq!(config.addresses.len(), 2);
        assert_eq!(config.addresses[1], HostAddress::new("db2", 3307));
        assert_eq!(config.ha_mode, HaMode::Sequential);
        assert_eq!(config.retries_all_down, 4);
        assert_eq!(config.wait_reconnect_timeout, Duration::from_millis(10));
        assert!(config.transaction_replay);
        assert!(!config.use_pipeline);
        assert_eq!(config.socket_timeout, None);
        assert_eq!(config.transaction_isolation, Some(IsolationLevel::ReadCommitted));
        assert_eq!(config.connection_attributes.len(), 2);
    }

    #[test]
    fn test_set_rejects_unknown_and_invalid() {
        let mut config = Configuration::new();
        let err = config.set("noSuchOption", "1").unwrap_err();
        assert!(err.to_string().contains("noSuchOption"));
        assert!(config.set("retriesAllDown", "many").is_err());
        assert!(config.set("haMode", "roundrobin").is_err());
        // Option names are case-insensitive
        config.set("RETRIESALLDOWN", "7").unwrap();
        assert_eq!(config.retries_all_down, 7);
    }

    #[test]
    fn test_option_names_unique() {
        let mut names: Vec<_> = OPTIONS.iter().map(|o| o.name.to_ascii_lowercase()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), OPTIONS.len());
    }

    #[test]
    fn test_host_address_parse() {
        assert_eq!(HostAddress::parse("db1").unwrap(), HostAddress::new("db1", 3306));
        assert_eq!(HostAddress::parse("db1:3310").unwrap(), HostAddress::new("db1", 3310));
        assert_eq!(HostAddress::parse("[::1]:3307").unwrap(), HostAddress::new("::1", 3307));
        assert_eq!(HostAddress::new("::1", 3307).socket_addr(), "[::1]:3307");
        assert!(HostAddress::parse("db1:notaport").is_err());
        assert!(HostAddress::parse("").is_err());
    }

    #[test]
    fn test_validate() {
        assert!(Configuration::new().validate().is_ok());
        let multi = Configuration::new().addresses(vec![
            HostAddress::new("a", 1),
            HostAddress::new("b", 2),
        ]);
        assert!(multi.validate().is_err());
        assert!(multi.ha_mode(HaMode::LoadBalance).validate().is_ok());
        assert!(Configuration::new().addresses(vec![]).validate().is_err());
    }

    #[test]
    fn test_clones_share_host_registry() {
        let config = Configuration::new();
        let clone = config.clone();
        assert!(Arc::ptr_eq(config.host_registry(), clone.host_registry()));
    }

    #[test]
    fn test_capability_flags() {
        use crate::protocol::capabilities::*;

        let config = Configuration::new().database("test").compression(true);
        let flags = config.capability_flags();
        assert!(flags & CLIENT_CONNECT_WITH_DB != 0);
        assert!(flags & CLIENT_ZSTD_COMPRESSION_ALGORITHM != 0);
        assert!(flags & CLIENT_PROTOCOL_41 != 0);
        assert!(flags & CLIENT_SSL == 0);
        assert!(flags & CLIENT_MULTI_STATEMENTS == 0);
    }

    #[test]
    fn test_ssl_mode_parse() {
        assert_eq!("verify_ca".parse::<SslMode>().unwrap(), SslMode::VerifyCa);
        assert_eq!("REQUIRED".parse::<SslMode>().unwrap(), SslMode::Required);
        assert!(SslMode::VerifyIdentity.is_required());
        assert!(!SslMode::Preferred.is_required());
        assert!("sometimes".parse::<SslMode>().is_err());
    }

    #[test]
    fn test_serde_defaults_fill_missing_fields() {
        let config: Configuration =
            serde_json::from_str(r#"{"user": "app", "ha_mode": "loadbalance"}"#).unwrap();
        assert_eq!(config.user, "app");
        assert_eq!(config.ha_mode, HaMode::LoadBalance);
        assert_eq!(config.prep_stmt_cache_size, 250);
    }
}
