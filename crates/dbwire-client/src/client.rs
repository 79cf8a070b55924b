//! The logical client.
//!
//! A [`Client`] owns at most one live [`ProtocolEngine`] and decides, through
//! its [`SessionPolicy`], what happens when that engine's connection fails:
//!
//! - `None`: the client closes; later calls fail with "connection is closed".
//! - `Failover`: a new session is opened through the [`FailoverCoordinator`].
//!   The failed command is not re-sent, and an open transaction is reported
//!   lost.
//! - `Replay`: like `Failover`, but an open transaction is replayed from the
//!   [`TransactionLog`] and the interrupted command is retried once.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use regex::Regex;

use crate::cache::{PreparedStatementHandle, StatementCache};
use crate::command::{Command, Completion, ResultSet};
use crate::config::{Configuration, HaMode, HostAddress};
use crate::context::{SessionContext, state_flags};
use crate::engine::{PrepareOutcome, ProtocolEngine};
use crate::failover::FailoverCoordinator;
use crate::replay::TransactionLog;
use crate::transport::connection_error;
use dbwire_core::error::{BatchError, ConnectionErrorKind};
use dbwire_core::{Error, IsolationLevel, Result};

/// What the client does when its physical connection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPolicy {
    None,
    Failover,
    Replay,
}

impl SessionPolicy {
    /// Replay when enabled, failover with an HA mode, otherwise none.
    pub fn from_config(config: &Configuration) -> Self {
        if config.transaction_replay {
            SessionPolicy::Replay
        } else if config.ha_mode != HaMode::None {
            SessionPolicy::Failover
        } else {
            SessionPolicy::None
        }
    }
}

/// Session settings re-applied to every replacement session.
#[derive(Debug, Clone)]
struct LogicalSession {
    database: Option<String>,
    autocommit: bool,
    isolation: Option<IsolationLevel>,
}

impl LogicalSession {
    fn from_config(config: &Configuration) -> Self {
        Self {
            database: config.database.clone(),
            autocommit: true,
            isolation: config.transaction_isolation,
        }
    }
}

/// Outcome of replacing a failed session.
enum Recovery {
    /// New session; no transaction was open
    Reconnected(Error),
    /// New session with the open transaction replayed
    Replayed(Error),
}

/// Aborts a client from another thread.
///
/// Shutting the socket down wakes a thread blocked in a read; the client
/// then closes instead of failing over.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
    socket: Arc<Mutex<Option<TcpStream>>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        if let Some(socket) = self.socket.lock().take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn attach(&self, socket: Option<TcpStream>) {
        *self.socket.lock() = socket;
    }
}

/// A logical database session.
pub struct Client {
    config: Configuration,
    policy: SessionPolicy,
    coordinator: FailoverCoordinator,
    engine: Option<ProtocolEngine>,
    cache: StatementCache,
    log: TransactionLog,
    session: LogicalSession,
    last_context: SessionContext,
    abort: AbortHandle,
    closed: bool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("policy", &self.policy)
            .field("engine", &self.engine)
            .field("cached_statements", &self.cache.len())
            .field("replay_state", &self.log.state())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect to the first available host.
    #[tracing::instrument(level = "debug", skip(config), fields(mode = ?config.ha_mode))]
    pub fn connect(config: Configuration) -> Result<Self> {
        config.validate()?;
        let coordinator = FailoverCoordinator::new(&config);
        let engine = coordinator.connect(&config)?;

        let mut client = Self {
            policy: SessionPolicy::from_config(&config),
            cache: StatementCache::new(config.prep_stmt_cache_size, config.cache_prep_stmts),
            log: TransactionLog::new(config.transaction_replay_size),
            session: LogicalSession::from_config(&config),
            last_context: engine.context().clone(),
            abort: AbortHandle::default(),
            closed: false,
            engine: None,
            coordinator,
            config,
        };
        client.install(engine);
        if let Some(level) = client.session.isolation {
            if let Some(engine) = client.engine.as_mut() {
                apply_isolation(engine, level)?;
            }
            client.refresh_context();
        }
        Ok(client)
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn statement_cache(&self) -> &StatementCache {
        &self.cache
    }

    pub fn transaction_log(&self) -> &TransactionLog {
        &self.log
    }

    /// Handle for aborting this client from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Execute one command.
    ///
    /// Without `can_pipeline`, statement closes queued by earlier calls are
    /// flushed on their own before the command is written.
    pub fn execute(&mut self, command: &Command, can_pipeline: bool) -> Result<Completion> {
        self.ensure_open()?;
        match command {
            Command::Prepare(sql) => return self.prepare(sql).map(Completion::Prepared),
            Command::Reset => return self.reset().map(|()| Completion::Nothing),
            Command::CloseStatement(id) => {
                self.close_server_statement(*id, can_pipeline);
                return Ok(Completion::Nothing);
            }
            _ => {}
        }

        let pipeline = can_pipeline && self.config.use_pipeline;
        let result = self.run(|engine| {
            if !pipeline {
                engine.flush_deferred()?;
            }
            engine.execute(command)
        });
        match result {
            Ok(completion) => {
                let in_transaction = self.current_context().in_transaction();
                self.after_success(command, in_transaction);
                Ok(completion)
            }
            Err(e) => {
                self.refresh_context();
                Err(e)
            }
        }
    }

    /// Prepare `sql`, reusing a cached statement when possible.
    ///
    /// A server refusal is not an error: the statement is prepared
    /// client-side instead, for the lifetime of the handle. Release the
    /// handle with [`close_statement`](Self::close_statement).
    pub fn prepare(&mut self, sql: &str) -> Result<Arc<PreparedStatementHandle>> {
        self.ensure_open()?;
        if let Some(handle) = self.cache.acquire(sql) {
            return Ok(handle);
        }

        let (handle, generation) = if self.config.use_server_prep_stmts {
            let (outcome, generation) =
                self.run(|engine| Ok((engine.prepare(sql)?, engine.generation())))?;
            let handle = match outcome {
                PrepareOutcome::Prepared(ok) => PreparedStatementHandle::server(sql, &ok, generation),
                PrepareOutcome::Rejected(e) => {
                    tracing::warn!(
                        code = e.code,
                        error = %e,
                        "Server prepare failed, using client-side prepare"
                    );
                    PreparedStatementHandle::client(sql)
                }
            };
            (Arc::new(handle), generation)
        } else {
            (Arc::new(PreparedStatementHandle::client(sql)), self.generation())
        };

        for statement_id in self.cache.insert(sql, &handle, generation) {
            self.close_server_statement(statement_id, true);
        }
        Ok(handle)
    }

    /// Release a handle returned by [`prepare`](Self::prepare).
    ///
    /// The server statement is closed once no reference remains and the
    /// cache no longer holds it. Never fails.
    pub fn close_statement(&mut self, handle: &PreparedStatementHandle) {
        let generation = self.generation();
        if let Some(statement_id) = self.cache.release(handle, generation) {
            self.close_server_statement(statement_id, true);
        }
    }

    /// Execute a batch, returning one update count per command.
    ///
    /// On failure the error is [`Error::Batch`] carrying the counts of the
    /// items that completed before the failing one.
    pub fn execute_batch(&mut self, commands: &[Command]) -> Result<Vec<u64>> {
        self.ensure_open()?;
        let mut counts = Vec::with_capacity(commands.len());
        let mut next = 0;
        let mut replayed = false;

        while next < commands.len() {
            if let Err(e) = self.ensure_engine() {
                return Err(batch_error(counts, e));
            }
            let mut in_transaction = self.last_context.in_transaction();
            let responses = match self.engine.as_mut() {
                Some(engine) => engine.execute_batch(&commands[next..], self.config.use_pipeline),
                None => return Err(batch_error(counts, Error::closed())),
            };

            let mut failure = None;
            for (offset, response) in responses.into_iter().enumerate() {
                let command = &commands[next + offset];
                match response.result {
                    Ok(completion) if failure.is_none() => {
                        counts.push(completion.update_count());
                        self.after_success(command, response.in_transaction);
                        in_transaction = response.in_transaction;
                    }
                    // Pipelined items after a failure still ran on the server
                    Ok(_) => self.after_success(command, response.in_transaction),
                    Err(e) if failure.is_none() => failure = Some((next + offset, e)),
                    Err(e) => tracing::debug!(error = %e, "Batch item failed after earlier failure"),
                }
            }
            self.refresh_context();

            let Some((index, error)) = failure else {
                next = commands.len();
                continue;
            };
            if !error.is_fatal() {
                return Err(batch_error(counts, error));
            }
            if replayed {
                let lost = if in_transaction {
                    self.discard_engine();
                    self.abandon_transaction(error)
                } else {
                    self.recover_quietly(error)
                };
                return Err(batch_error(counts, lost));
            }
            match self.recover(in_transaction, error) {
                Ok(Recovery::Replayed(_)) => {
                    replayed = true;
                    next = index;
                }
                Ok(Recovery::Reconnected(cause)) => return Err(batch_error(counts, cause)),
                Err(e) => return Err(batch_error(counts, e)),
            }
        }
        Ok(counts)
    }

    /// Read the next batch of rows of a streaming result.
    pub fn fetch_more(&mut self, result: &ResultSet) -> Result<bool> {
        self.ensure_open()?;
        let outcome = self.engine_mut()?.fetch_more(result);
        self.finish_read(outcome)
    }

    /// Read the next result of a multi-statement.
    pub fn next_result(&mut self) -> Result<Option<Completion>> {
        self.ensure_open()?;
        let outcome = self.engine_mut()?.next_result();
        self.finish_read(outcome)
    }

    /// Reset the session (COM_RESET_CONNECTION).
    ///
    /// Session variables, autocommit and isolation return to their
    /// configured values; server statements are dropped and re-prepared on
    /// next use.
    pub fn reset(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.run(|engine| engine.execute(&Command::Reset))?;
        self.log.clear();
        let database = self.session.database.take();
        self.session = LogicalSession::from_config(&self.config);
        self.session.database = database;
        if let Some(level) = self.session.isolation {
            self.run(|engine| apply_isolation(engine, level))?;
        }
        self.refresh_context();
        Ok(())
    }

    /// Close the connection immediately, without COM_QUIT.
    pub fn abort(&mut self) {
        self.abort.abort();
        self.closed = true;
        self.log.clear();
        self.discard_engine();
    }

    /// Close the connection gracefully.
    pub fn close(&mut self) {
        self.closed = true;
        self.log.clear();
        if let Some(mut engine) = self.engine.take() {
            engine.close();
            self.coordinator.registry().connection_closed(engine.host());
        }
        self.abort.attach(None);
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.abort.is_aborted()
    }

    /// Host of the live session.
    pub fn host(&self) -> Option<&HostAddress> {
        self.engine.as_ref().map(ProtocolEngine::host)
    }

    /// Snapshot of the current session state.
    pub fn get_context(&self) -> SessionContext {
        self.current_context().clone()
    }

    fn current_context(&self) -> &SessionContext {
        self.engine
            .as_ref()
            .map_or(&self.last_context, ProtocolEngine::context)
    }

    fn generation(&self) -> u64 {
        self.engine.as_ref().map_or(0, ProtocolEngine::generation)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::closed())
        } else {
            Ok(())
        }
    }

    fn engine_mut(&mut self) -> Result<&mut ProtocolEngine> {
        self.engine.as_mut().ok_or_else(Error::closed)
    }

    fn refresh_context(&mut self) {
        if let Some(engine) = &self.engine {
            self.last_context = engine.context().clone();
        }
    }

    /// Run `op` on a live engine, replacing a failed session per the policy.
    ///
    /// After a replay the operation is retried exactly once.
    fn run<T>(&mut self, mut op: impl FnMut(&mut ProtocolEngine) -> Result<T>) -> Result<T> {
        self.ensure_engine()?;
        match op(self.engine_mut()?) {
            Err(e) if e.is_fatal() => match self.fail_over(e)? {
                Recovery::Reconnected(cause) => Err(cause),
                Recovery::Replayed(cause) => {
                    tracing::debug!(error = %cause, "Retrying interrupted command after replay");
                    match op(self.engine_mut()?) {
                        Err(e) if e.is_fatal() => {
                            self.discard_engine();
                            Err(self.abandon_transaction(e))
                        }
                        other => other,
                    }
                }
            },
            other => other,
        }
    }

    /// Make sure the engine's idle socket is still open, reconnecting when
    /// it is not. Nothing has been sent, so no command is at risk.
    fn ensure_engine(&mut self) -> Result<()> {
        if self.engine.as_ref().is_some_and(ProtocolEngine::is_alive) {
            return Ok(());
        }
        if self.abort.is_aborted() {
            self.closed = true;
            return Err(Error::closed());
        }
        tracing::debug!(
            thread_id = self.last_context.thread_id,
            "Connection lost while idle"
        );
        let cause = connection_error(
            ConnectionErrorKind::Disconnected,
            "Connection lost while idle".to_string(),
            None,
        );
        self.fail_over(cause).map(|_| ())
    }

    fn fail_over(&mut self, cause: Error) -> Result<Recovery> {
        let in_transaction = self.last_context.in_transaction();
        self.recover(in_transaction, cause)
    }

    /// Replace a failed session.
    fn recover(&mut self, in_transaction: bool, cause: Error) -> Result<Recovery> {
        self.discard_engine();
        if self.abort.is_aborted() {
            self.closed = true;
            self.log.clear();
            return Err(Error::closed());
        }
        if self.policy == SessionPolicy::None {
            self.closed = true;
            self.log.clear();
            return Err(cause);
        }
        if in_transaction && (self.policy != SessionPolicy::Replay || self.log.is_poisoned()) {
            return Err(self.abandon_transaction(cause));
        }

        if let Err(e) = self.reconnect() {
            tracing::warn!(error = %e, "Reconnect failed, closing client");
            self.closed = true;
            self.log.clear();
            return Err(e);
        }
        if !in_transaction {
            self.log.clear();
            return Ok(Recovery::Reconnected(cause));
        }
        match self.replay() {
            Ok(()) => Ok(Recovery::Replayed(cause)),
            Err(e) => {
                tracing::warn!(error = %e, "Transaction replay failed");
                Err(self.abandon_transaction(e))
            }
        }
    }

    /// Give up on the open transaction, keeping the client usable for a
    /// new one when a session can be had.
    fn abandon_transaction(&mut self, cause: Error) -> Error {
        self.log.clear();
        match self.engine.as_mut() {
            Some(engine) if !engine.is_closed() => {
                if let Err(e) = engine.execute(&Command::query("ROLLBACK")) {
                    tracing::warn!(error = %e, "Rollback after lost transaction failed");
                }
                self.refresh_context();
            }
            _ => {
                self.discard_engine();
                if self.policy != SessionPolicy::None && !self.abort.is_aborted() {
                    if let Err(e) = self.reconnect() {
                        tracing::warn!(error = %e, "Reconnect failed, closing client");
                        self.closed = true;
                    }
                } else {
                    self.closed = true;
                }
            }
        }
        Error::transaction_lost(Some(cause))
    }

    /// Reconnect for later calls and hand back `cause` unchanged.
    fn recover_quietly(&mut self, cause: Error) -> Error {
        match self.recover(false, cause) {
            Ok(Recovery::Reconnected(cause) | Recovery::Replayed(cause)) | Err(cause) => cause,
        }
    }

    fn finish_read<T>(&mut self, outcome: Result<T>) -> Result<T> {
        match outcome {
            Err(e) if e.is_fatal() => match self.fail_over(e)? {
                Recovery::Reconnected(cause) | Recovery::Replayed(cause) => Err(cause),
            },
            other => {
                self.refresh_context();
                other
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(old_thread_id = self.last_context.thread_id))]
    fn reconnect(&mut self) -> Result<()> {
        let mut engine = self.coordinator.connect(&self.config)?;
        self.restore_session(&mut engine)?;
        tracing::info!(
            host = %engine.host(),
            old_thread_id = self.last_context.thread_id,
            thread_id = engine.context().thread_id,
            "Reconnected"
        );
        self.install(engine);
        Ok(())
    }

    /// Bring a new session to the logical session's settings.
    fn restore_session(&self, engine: &mut ProtocolEngine) -> Result<()> {
        if let Some(database) = &self.session.database {
            if engine.context().database.as_ref() != Some(database) {
                engine.execute(&Command::ChangeDb(database.clone()))?;
            }
        }
        if !self.session.autocommit {
            engine.execute(&Command::query("SET autocommit=0"))?;
        }
        if let Some(level) = self.session.isolation {
            apply_isolation(engine, level)?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(commands = self.log.len()))]
    fn replay(&mut self) -> Result<()> {
        let commands = self.log.begin_replay();
        let engine = self.engine.as_mut().ok_or_else(Error::closed)?;
        for command in &commands {
            match command {
                Command::Execute { statement, params } if statement.is_closed() => {
                    engine.execute_detached(statement, params)?;
                }
                _ => {
                    engine.execute(command)?;
                }
            }
        }
        let thread_id = engine.context().thread_id;
        self.log.end_replay();
        self.refresh_context();
        tracing::info!(commands = commands.len(), thread_id, "Transaction replayed");
        Ok(())
    }

    fn install(&mut self, engine: ProtocolEngine) {
        self.coordinator.registry().connection_opened(engine.host());
        self.abort.attach(engine.abort_handle());
        self.last_context = engine.context().clone();
        self.engine = Some(engine);
    }

    fn discard_engine(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.shutdown();
            self.coordinator.registry().connection_closed(engine.host());
        }
    }

    fn close_server_statement(&mut self, statement_id: u32, deferred: bool) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        if let Err(e) = engine.close_statement(statement_id, deferred && self.config.use_pipeline) {
            tracing::warn!(statement_id, error = %e, "Ignoring statement close failure");
        }
    }

    /// Bookkeeping after the server acknowledged `command`.
    fn after_success(&mut self, command: &Command, in_transaction: bool) {
        self.refresh_context();
        self.session.autocommit = self.last_context.autocommit();

        match command {
            Command::ChangeDb(database) => self.session.database = Some(database.clone()),
            Command::Query(sql) => match parse_session_statement(sql) {
                Some(SessionStatement::Use(database)) => {
                    self.session.database = Some(database.clone());
                    if let Some(engine) = self.engine.as_mut() {
                        let context = engine.context_mut();
                        context.database = Some(database);
                        context.add_state_flag(state_flags::DATABASE);
                    }
                }
                Some(SessionStatement::Isolation(level)) => {
                    self.session.isolation = Some(level);
                    if let Some(engine) = self.engine.as_mut() {
                        let context = engine.context_mut();
                        context.transaction_isolation = Some(level);
                        context.add_state_flag(state_flags::TRANSACTION_ISOLATION);
                    }
                }
                None => {}
            },
            _ => {}
        }
        self.refresh_context();

        if self.policy == SessionPolicy::Replay {
            self.log.record(command, in_transaction);
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.engine.is_some() {
            self.close();
        }
    }
}

fn batch_error(update_counts: Vec<u64>, cause: Error) -> Error {
    match cause {
        batch @ Error::Batch(_) => batch,
        cause => Error::Batch(BatchError {
            update_counts,
            cause: Box::new(cause),
        }),
    }
}

fn apply_isolation(engine: &mut ProtocolEngine, level: IsolationLevel) -> Result<()> {
    engine.execute(&Command::query(format!(
        "SET SESSION TRANSACTION ISOLATION LEVEL {}",
        level.as_sql()
    )))?;
    let context = engine.context_mut();
    context.transaction_isolation = Some(level);
    context.add_state_flag(state_flags::TRANSACTION_ISOLATION);
    Ok(())
}

/// Session-level statements the client must re-apply after a reconnect.
#[derive(Debug, PartialEq, Eq)]
enum SessionStatement {
    Use(String),
    Isolation(IsolationLevel),
}

fn session_statement_regex() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?i)^\s*(?:USE\s+`?([^`\s;]+)`?|SET\s+SESSION\s+TRANSACTION\s+ISOLATION\s+LEVEL\s+(READ\s+UNCOMMITTED|READ\s+COMMITTED|REPEATABLE\s+READ|SERIALIZABLE))\s*;?\s*$",
            )
            .map_err(|e| tracing::warn!(error = %e, "Invalid session statement pattern"))
            .ok()
        })
        .as_ref()
}

fn parse_session_statement(sql: &str) -> Option<SessionStatement> {
    let captures = session_statement_regex()?.captures(sql)?;
    if let Some(database) = captures.get(1) {
        return Some(SessionStatement::Use(database.as_str().to_string()));
    }
    let level = captures
        .get(2)?
        .as_str()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    IsolationLevel::parse(&level).map(SessionStatement::Isolation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_selection() {
        let config = Configuration::new();
        assert_eq!(SessionPolicy::from_config(&config), SessionPolicy::None);

        let config = Configuration::new().ha_mode(HaMode::Sequential);
        assert_eq!(SessionPolicy::from_config(&config), SessionPolicy::Failover);

        let config = Configuration::new().transaction_replay(true);
        assert_eq!(SessionPolicy::from_config(&config), SessionPolicy::Replay);
    }

    #[test]
    fn test_parse_session_statements() {
        assert_eq!(
            parse_session_statement("USE `shop`;"),
            Some(SessionStatement::Use("shop".into()))
        );
        assert_eq!(
            parse_session_statement("  use archive"),
            Some(SessionStatement::Use("archive".into()))
        );
        assert_eq!(
            parse_session_statement("SET SESSION TRANSACTION ISOLATION LEVEL read   committed"),
            Some(SessionStatement::Isolation(IsolationLevel::ReadCommitted))
        );
        // Applies to the next transaction only
        assert_eq!(
            parse_session_statement("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"),
            None
        );
        assert_eq!(parse_session_statement("SELECT 'USE shop'"), None);
    }

    #[test]
    fn test_batch_error_keeps_counts_and_nesting() {
        let err = batch_error(vec![1, 1], Error::Custom("boom".into()));
        match err {
            Error::Batch(b) => {
                assert_eq!(b.update_counts, vec![1, 1]);
                let again = batch_error(vec![9], Error::Batch(b));
                assert!(matches!(again, Error::Batch(ref inner) if inner.update_counts == vec![1, 1]));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_abort_handle_marks_aborted() {
        let handle = AbortHandle::default();
        assert!(!handle.is_aborted());
        handle.abort();
        assert!(handle.is_aborted());
        assert!(handle.clone().is_aborted());
    }
}
