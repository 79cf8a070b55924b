//! Thread-safe logical connection.
//!
//! [`Connection`] wraps a [`Client`] in a mutex so it can be shared across
//! threads; commands from different threads run one at a time, never
//! interleaved. It adds the query timeout and an abort that works while
//! another thread is blocked in a command.
//!
//! # Example
//!
//! ```ignore
//! let conn = Connection::connect(Configuration::new().host("db1", 3306).user("app"))?;
//! let rows = conn.query("SELECT id, name FROM users")?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::cache::PreparedStatementHandle;
use crate::client::{AbortHandle, Client};
use crate::command::{Command, Completion, ResultSet};
use crate::config::Configuration;
use crate::context::SessionContext;
use crate::timeout::{TimeoutGuard, TimeoutHandler};
use dbwire_core::{Result, Row, Value};

/// A shared logical connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Mutex<Client>>,
    abort: AbortHandle,
    timeouts: Option<Arc<TimeoutHandler>>,
    query_timeout: Option<Duration>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("inner", &"Arc<Mutex<Client>>")
            .field("query_timeout", &self.query_timeout)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect per `config`.
    pub fn connect(config: Configuration) -> Result<Self> {
        let timeouts = match config.query_timeout {
            Some(_) => Some(Arc::new(TimeoutHandler::start(config.clone())?)),
            None => None,
        };
        let query_timeout = config.query_timeout;
        let client = Client::connect(config)?;
        Ok(Self {
            abort: client.abort_handle(),
            inner: Arc::new(Mutex::new(client)),
            timeouts,
            query_timeout,
        })
    }

    /// Execute one command.
    pub fn execute(&self, command: &Command, can_pipeline: bool) -> Result<Completion> {
        let mut client = self.inner.lock();
        let guard = self.arm(&client);
        let result = client.execute(command, can_pipeline);
        finish(guard, result)
    }

    /// Run a query and read every row.
    pub fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let mut client = self.inner.lock();
        let guard = self.arm(&client);
        let result = read_all(&mut client, &Command::query(sql));
        finish(guard, result)
    }

    /// Run a statement and return its affected-row count.
    pub fn execute_update(&self, sql: &str) -> Result<u64> {
        self.execute(&Command::query(sql), true)
            .map(|completion| completion.update_count())
    }

    /// Prepare a statement through the statement cache.
    pub fn prepare(&self, sql: &str) -> Result<Arc<PreparedStatementHandle>> {
        self.inner.lock().prepare(sql)
    }

    /// Execute a prepared statement and read every row it returns.
    pub fn query_prepared(
        &self,
        statement: &Arc<PreparedStatementHandle>,
        params: Vec<Value>,
    ) -> Result<Vec<Row>> {
        let mut client = self.inner.lock();
        let guard = self.arm(&client);
        let result = read_all(&mut client, &Command::execute(statement, params));
        finish(guard, result)
    }

    /// Release a prepared statement handle.
    pub fn close_statement(&self, statement: &PreparedStatementHandle) {
        self.inner.lock().close_statement(statement);
    }

    /// Execute a batch; see [`Client::execute_batch`].
    pub fn execute_batch(&self, commands: &[Command]) -> Result<Vec<u64>> {
        let mut client = self.inner.lock();
        let guard = self.arm(&client);
        let result = client.execute_batch(commands);
        finish(guard, result)
    }

    pub fn fetch_more(&self, result: &ResultSet) -> Result<bool> {
        self.inner.lock().fetch_more(result)
    }

    pub fn next_result(&self) -> Result<Option<Completion>> {
        self.inner.lock().next_result()
    }

    pub fn reset(&self) -> Result<()> {
        self.inner.lock().reset()
    }

    /// Close the connection immediately, even while another thread is
    /// blocked in a command on it.
    pub fn abort(&self) {
        self.abort.abort();
        if let Some(mut client) = self.inner.try_lock() {
            client.abort();
        }
    }

    /// Close gracefully, waiting for a running command to finish.
    pub fn close(&self) {
        self.inner.lock().close();
    }

    /// Is the connection closed? A connection busy in another thread is
    /// reported open unless it was aborted.
    pub fn is_closed(&self) -> bool {
        self.abort.is_aborted() || self.inner.try_lock().is_some_and(|c| c.is_closed())
    }

    pub fn get_context(&self) -> SessionContext {
        self.inner.lock().get_context()
    }

    /// Lock the client for a sequence of calls.
    pub fn lock(&self) -> MutexGuard<'_, Client> {
        self.inner.lock()
    }

    fn arm(&self, client: &Client) -> Option<TimeoutGuard> {
        let (handler, timeout) = (self.timeouts.as_ref()?, self.query_timeout?);
        let host = client.host()?;
        Some(handler.arm(host, client.get_context().thread_id, timeout))
    }
}

fn finish<T>(guard: Option<TimeoutGuard>, result: Result<T>) -> Result<T> {
    match guard {
        Some(guard) => guard.finish(result),
        None => result,
    }
}

/// Execute `command` and drain its result set.
fn read_all(client: &mut Client, command: &Command) -> Result<Vec<Row>> {
    let Some(result) = client.execute(command, true)?.into_result_set() else {
        return Ok(Vec::new());
    };
    let mut rows = result.drain_buffered();
    while !result.is_complete() {
        client.fetch_more(&result)?;
        rows.extend(result.drain_buffered());
    }
    Ok(rows)
}
