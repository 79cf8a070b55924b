//! Command protocol engine.
//!
//! One engine drives one physical session: it performs the handshake,
//! writes commands and decodes their responses, and keeps the
//! [`SessionContext`] current.
//!
//! ```text
//! IDLE -> SENDING -> AWAITING_RESPONSE -> DECODING_RESULT | DONE | ERROR
//! ```
//!
//! Result rows are pulled in batches of `fetch_size` (all at once when it
//! is zero). A streaming result that is still open when the next command is
//! issued is read to the end into its cursor's buffer first, and any
//! unread follow-on results of a multi-statement are discarded.

// Packet and chunk counts fit in the sequence byte
#![allow(clippy::cast_possible_truncation)]

use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::auth::{self, CredentialPlugin, Credentials, caching_sha2, plugins};
use crate::cache::PreparedStatementHandle;
use crate::codec::{self, CodecRegistry};
use crate::command::{Command, Completion, ResultSet, UpdateResult};
use crate::config::{Configuration, HostAddress};
use crate::context::{SessionContext, state_flags};
use crate::protocol::compress::CompressedStream;
use crate::protocol::prepared::{
    StmtPrepareOk, build_stmt_close_packet, build_stmt_execute_packet, build_stmt_prepare_packet,
    parse_stmt_prepare_ok,
};
use crate::protocol::writer::packet_count;
use crate::protocol::{
    CommandCode, MAX_PACKET_SIZE, OkPacket, PacketReader, PacketType, PacketWriter, capabilities,
    is_row_terminator, server_status,
};
use crate::tls;
use crate::transport::{PacketTransport, Socket, Wire};
use crate::types::ColumnDef;
use dbwire_core::error::ProtocolError;
use dbwire_core::{Error, QueryError, Result, Value};

/// Position of the engine in the command cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Sending,
    AwaitingResponse,
    DecodingResult,
    Done,
    /// The physical connection failed and was closed
    Error,
}

/// Typed outcome of a server-side prepare.
///
/// Transport failures are `Err`; a server refusal is an ordinary value the
/// caller branches on.
#[derive(Debug)]
pub enum PrepareOutcome {
    Prepared(StmtPrepareOk),
    Rejected(QueryError),
}

/// Response to one item of a batch.
#[derive(Debug)]
pub struct BatchResponse {
    pub result: Result<Completion>,
    /// Transaction status right after this item
    pub in_transaction: bool,
}

/// Server greeting (protocol version 10).
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_data: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    pub auth_plugin: String,
}

#[derive(Debug)]
struct Stream {
    result: ResultSet,
    binary: bool,
}

/// Encoded batch item, ready for the wire.
struct Request {
    payload: Vec<u8>,
    binary: bool,
    sql: String,
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Session generations are unique process-wide, so a statement id can be
/// tied to the exact session that issued it.
fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// Drives one physical session.
pub struct ProtocolEngine {
    transport: PacketTransport<Wire>,
    context: SessionContext,
    host: HostAddress,
    codecs: Arc<dyn CodecRegistry>,
    fetch_size: usize,
    state: EngineState,
    stream: Option<Stream>,
    /// Protocol of the follow-on result announced by MORE_RESULTS
    pending_more: Option<bool>,
    pending_closes: Vec<u32>,
    generation: u64,
    closed: bool,
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("host", &self.host)
            .field("thread_id", &self.context.thread_id)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ProtocolEngine {
    /// Open a session to `host`: TCP connect, optional TLS upgrade,
    /// authentication, optional compression.
    #[tracing::instrument(level = "debug", skip(config), fields(host = %host))]
    pub fn connect(config: &Configuration, host: &HostAddress) -> Result<Self> {
        let socket = Socket::connect(host, config.connect_timeout)?;
        let max_message = usize::try_from(config.max_packet_size).unwrap_or(usize::MAX);
        let mut transport = PacketTransport::new(Wire::Raw(socket)).with_max_message(max_message);

        let handshake = parse_handshake(&transport.receive()?)?;
        let mut client_caps = config.capability_flags() & handshake.capabilities;

        let secure = tls::negotiate(config.ssl_mode, handshake.capabilities)?;
        if secure {
            client_caps |= capabilities::CLIENT_SSL;
            transport.send(&tls::build_ssl_request_payload(
                client_caps,
                config.max_packet_size,
                config.charset,
            ))?;
            let sequence = transport.sequence_id();
            let server_name = config
                .tls
                .server_name
                .clone()
                .unwrap_or_else(|| host.host.clone());
            let socket = into_socket(transport.into_inner())?.upgrade_tls(
                &config.tls,
                &server_name,
                config.ssl_mode,
            )?;
            transport = PacketTransport::new(Wire::Raw(socket)).with_max_message(max_message);
            transport.set_sequence(sequence);
        } else {
            client_caps &= !capabilities::CLIENT_SSL;
        }

        let plugin = config.credential_source();
        let credentials = plugin.credentials(host)?;
        let auth_response = plugin.auth_response(
            &handshake.auth_plugin,
            &handshake.auth_data,
            &credentials,
            secure,
        )?;
        transport.send(&build_handshake_response(
            config,
            &handshake,
            client_caps,
            &credentials,
            &auth_response,
        ))?;

        let ok = authenticate(
            &mut transport,
            plugin.as_ref(),
            &credentials,
            &handshake,
            secure,
        )?;

        let socket = into_socket(transport.into_inner())?;
        socket.set_timeout(config.socket_timeout)?;
        let wire = if client_caps & capabilities::CLIENT_ZSTD_COMPRESSION_ALGORITHM != 0 {
            Wire::Compressed(CompressedStream::new(socket, config.compression_level))
        } else {
            Wire::Raw(socket)
        };

        let mut context = SessionContext::new(
            handshake.connection_id,
            client_caps,
            ok.status_flags,
            handshake.server_version,
            config.charset,
        );
        context.database.clone_from(&config.database);

        tracing::info!(
            host = %host,
            thread_id = context.thread_id,
            server_version = %context.server_version,
            tls = secure,
            compressed = wire.is_compressed(),
            "Connected"
        );

        Ok(Self {
            transport: PacketTransport::new(wire).with_max_message(max_message),
            context,
            host: host.clone(),
            codecs: Arc::clone(&config.codecs),
            fetch_size: config.fetch_size,
            state: EngineState::Idle,
            stream: None,
            pending_more: None,
            pending_closes: Vec::new(),
            generation: next_generation(),
            closed: false,
        })
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub(crate) fn context_mut(&mut self) -> &mut SessionContext {
        &mut self.context
    }

    pub fn host(&self) -> &HostAddress {
        &self.host
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Identifies this session for prepared statement ids.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_compressed(&self) -> bool {
        self.transport.get_ref().is_compressed()
    }

    /// A second handle on the TCP socket, used to abort from another thread.
    pub fn abort_handle(&self) -> Option<TcpStream> {
        self.transport.get_ref().socket().tcp().try_clone().ok()
    }

    /// Is the idle socket still open?
    ///
    /// A non-blocking peek sees EOF (or an unsolicited error packet) when
    /// the server dropped the session while nothing was in flight.
    pub fn is_alive(&self) -> bool {
        if self.closed {
            return false;
        }
        if self.stream.is_some() || self.pending_more.is_some() {
            return true;
        }
        let tcp = self.transport.get_ref().socket().tcp();
        if tcp.set_nonblocking(true).is_err() {
            return false;
        }
        let mut buf = [0u8; 1];
        let alive = match tcp.peek(&mut buf) {
            Ok(0) => false,
            // Plain sessions never receive unsolicited data; TLS may have
            // unread records such as session tickets.
            Ok(_) => self.transport.get_ref().socket().is_tls(),
            Err(e) => e.kind() == std::io::ErrorKind::WouldBlock,
        };
        let _ = tcp.set_nonblocking(false);
        alive
    }

    /// Execute one command.
    pub fn execute(&mut self, command: &Command) -> Result<Completion> {
        self.ensure_usable()?;
        tracing::debug!(
            command = command.name(),
            thread_id = self.context.thread_id,
            "Executing command"
        );
        let result = self.dispatch(command);
        self.settle(result)
    }

    /// Execute a statement whose handle was closed after the call was
    /// logged. Its SQL is prepared for this call only and the server
    /// statement closed in front of the next command.
    pub fn execute_detached(
        &mut self,
        handle: &PreparedStatementHandle,
        params: &[Value],
    ) -> Result<Completion> {
        self.ensure_usable()?;
        let result = self.dispatch_detached(handle, params);
        self.settle(result)
    }

    /// Prepare `sql` on the server.
    pub fn prepare(&mut self, sql: &str) -> Result<PrepareOutcome> {
        self.ensure_usable()?;
        let result = self.prepare_on_server(sql);
        self.settle(result)
    }

    /// Read the next batch of rows of `result` into its buffer.
    ///
    /// Returns whether rows remain on the wire.
    pub fn fetch_more(&mut self, result: &ResultSet) -> Result<bool> {
        let current = self
            .stream
            .as_ref()
            .is_some_and(|stream| stream.result.same_stream(result));
        if !current {
            return if result.is_complete() {
                Ok(false)
            } else {
                Err(Error::Custom(
                    "Result set is no longer readable: its connection was lost".to_string(),
                ))
            };
        }
        self.ensure_usable()?;
        let Some(stream) = self.stream.take() else {
            return Ok(false);
        };
        self.state = EngineState::AwaitingResponse;
        let limit = self.batch_limit();
        let read = self.read_rows(&stream, limit);
        let more = self.settle(read)?;
        if more {
            self.stream = Some(stream);
        }
        Ok(more)
    }

    /// Read the next result of a multi-statement, if the server has one.
    pub fn next_result(&mut self) -> Result<Option<Completion>> {
        self.ensure_usable()?;
        if let Some(stream) = self.stream.take() {
            let drained = self.read_rows(&stream, usize::MAX);
            self.settle(drained)?;
        }
        match self.pending_more.take() {
            Some(binary) => {
                let result = self.read_completion(binary, None);
                self.settle(result).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Close a server statement.
    ///
    /// With `deferred`, the close is written in front of the next command
    /// instead of on its own. COM_STMT_CLOSE has no response.
    pub fn close_statement(&mut self, statement_id: u32, deferred: bool) -> Result<()> {
        self.ensure_usable()?;
        if deferred && !self.is_compressed() {
            self.pending_closes.push(statement_id);
            return Ok(());
        }
        let result = self
            .begin()
            .and_then(|()| self.transport.send(&build_stmt_close_packet(statement_id)));
        self.state = EngineState::Done;
        self.settle(result)
    }

    /// Write statement closes queued by [`close_statement`](Self::close_statement)
    /// without waiting for the next command.
    pub fn flush_deferred(&mut self) -> Result<()> {
        self.ensure_usable()?;
        if self.pending_closes.is_empty() {
            return Ok(());
        }
        let result = self.begin().and_then(|()| self.transport.flush());
        self.state = EngineState::Done;
        self.settle(result)
    }

    /// Execute a batch, stopping at the first failure.
    ///
    /// With `pipeline`, all items are written before any response is read
    /// and the responses are matched to items in order; every item is then
    /// answered even after a SQL error. Fewer responses than commands come
    /// back only after a fatal error, which is the last response.
    pub fn execute_batch(&mut self, commands: &[Command], pipeline: bool) -> Vec<BatchResponse> {
        let pipelinable = pipeline
            && commands.len() > 1
            && !self.is_compressed()
            && commands
                .iter()
                .all(|c| matches!(c, Command::Query(_) | Command::Execute { .. }));

        if pipelinable {
            match self.encode_batch(commands) {
                Ok(requests) => return self.run_pipelined(&requests),
                Err(e) => {
                    let result = self.settle(Err(e));
                    return vec![BatchResponse {
                        result,
                        in_transaction: self.context.in_transaction(),
                    }];
                }
            }
        }

        let mut responses = Vec::with_capacity(commands.len());
        for command in commands {
            let result = self.execute(command).and_then(|completion| {
                self.drain_pending()?;
                Ok(completion)
            });
            let failed = result.is_err();
            responses.push(BatchResponse {
                result,
                in_transaction: self.context.in_transaction(),
            });
            if failed {
                break;
            }
        }
        responses
    }

    /// Send COM_QUIT and close the socket.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.reset_sequences();
        let _ = self.transport.send(&[CommandCode::Quit as u8]);
        self.shutdown();
        tracing::debug!(thread_id = self.context.thread_id, "Closed session");
    }

    /// Close the socket without saying goodbye.
    pub fn shutdown(&mut self) {
        self.transport.get_ref().shutdown();
        self.closed = true;
        self.stream = None;
        self.pending_more = None;
        self.state = EngineState::Done;
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.closed {
            Err(Error::closed())
        } else {
            Ok(())
        }
    }

    /// Close the physical connection on a fatal error.
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                tracing::warn!(
                    host = %self.host,
                    thread_id = self.context.thread_id,
                    error = %e,
                    "Closing connection after fatal error"
                );
                self.shutdown();
                self.state = EngineState::Error;
            }
        }
        result
    }

    fn batch_limit(&self) -> usize {
        if self.fetch_size == 0 {
            usize::MAX
        } else {
            self.fetch_size
        }
    }

    fn reset_sequences(&mut self) {
        self.transport.reset_sequence();
        self.transport.get_mut().reset_compression_sequence();
    }

    /// Make the wire ready for a new command.
    fn begin(&mut self) -> Result<()> {
        self.drain_pending()?;
        for statement_id in std::mem::take(&mut self.pending_closes) {
            self.reset_sequences();
            self.transport
                .write_message(&build_stmt_close_packet(statement_id))?;
        }
        self.reset_sequences();
        self.state = EngineState::Sending;
        Ok(())
    }

    /// Read whatever the previous command left on the wire.
    fn drain_pending(&mut self) -> Result<()> {
        loop {
            if let Some(stream) = self.stream.take() {
                self.read_rows(&stream, usize::MAX)?;
                continue;
            }
            let Some(binary) = self.pending_more.take() else {
                return Ok(());
            };
            match self.read_completion(binary, None) {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!(error = %e, "Discarding error from an unread result"),
            }
        }
    }

    fn dispatch(&mut self, command: &Command) -> Result<Completion> {
        match command {
            Command::Query(sql) => {
                self.begin()?;
                self.transport
                    .send(&command_payload(CommandCode::Query, sql.as_bytes()))?;
                self.read_completion(false, Some(sql))
            }
            Command::Prepare(sql) => match self.prepare_on_server(sql)? {
                PrepareOutcome::Prepared(ok) => Ok(Completion::Prepared(Arc::new(
                    PreparedStatementHandle::server(sql.as_str(), &ok, self.generation),
                ))),
                PrepareOutcome::Rejected(e) => Err(Error::Query(e)),
            },
            Command::Execute { statement, params } => self.execute_statement(statement, params),
            Command::ChangeDb(database) => {
                self.begin()?;
                self.transport
                    .send(&command_payload(CommandCode::InitDb, database.as_bytes()))?;
                self.read_completion(false, None)?;
                self.context.database = Some(database.clone());
                self.context.add_state_flag(state_flags::DATABASE);
                Ok(Completion::Nothing)
            }
            Command::Ping => {
                self.begin()?;
                self.transport.send(&[CommandCode::Ping as u8])?;
                self.read_completion(false, None)?;
                Ok(Completion::Nothing)
            }
            Command::Reset => {
                self.begin()?;
                self.transport
                    .send(&[CommandCode::ResetConnection as u8])?;
                self.read_completion(false, None)?;
                // The server dropped every prepared statement of the session
                self.generation = next_generation();
                self.context.clear_state_flags();
                self.context.transaction_isolation = None;
                Ok(Completion::Nothing)
            }
            Command::CloseStatement(statement_id) => {
                self.begin()?;
                self.transport
                    .send(&build_stmt_close_packet(*statement_id))?;
                self.state = EngineState::Done;
                Ok(Completion::Nothing)
            }
        }
    }

    fn prepare_on_server(&mut self, sql: &str) -> Result<PrepareOutcome> {
        self.begin()?;
        self.transport.send(&build_stmt_prepare_packet(sql))?;
        self.state = EngineState::AwaitingResponse;

        let payload = self.transport.receive()?;
        if payload.first() == Some(&0xFF) {
            self.state = EngineState::Done;
            let error = server_error(&payload, Some(sql));
            return match error {
                Error::Query(q) if !q.is_connection_closed() => Ok(PrepareOutcome::Rejected(q)),
                other => Err(other),
            };
        }

        let ok = parse_stmt_prepare_ok(&payload)
            .ok_or_else(|| protocol_error("Malformed COM_STMT_PREPARE response"))?;
        self.skip_definitions(usize::from(ok.num_params))?;
        self.skip_definitions(usize::from(ok.num_columns))?;
        self.state = EngineState::Done;
        tracing::debug!(
            statement_id = ok.statement_id,
            params = ok.num_params,
            "Prepared statement"
        );
        Ok(PrepareOutcome::Prepared(ok))
    }

    fn skip_definitions(&mut self, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        for _ in 0..count {
            self.transport.receive()?;
        }
        if !self
            .context
            .has_capability(capabilities::CLIENT_DEPRECATE_EOF)
        {
            self.transport.receive()?;
        }
        Ok(())
    }

    /// The server statement id for `handle` in this session, preparing it
    /// again if it was issued by an earlier session. `None` means execute
    /// through the text protocol.
    fn statement_id(&mut self, handle: &PreparedStatementHandle) -> Result<Option<u32>> {
        if handle.is_client_side() {
            return Ok(None);
        }
        if let Some(id) = handle.server_id(self.generation) {
            return Ok(Some(id));
        }
        match self.prepare_on_server(handle.sql())? {
            PrepareOutcome::Prepared(ok) => {
                handle.rebind(ok.statement_id, self.generation);
                tracing::debug!(
                    statement_id = ok.statement_id,
                    thread_id = self.context.thread_id,
                    "Re-prepared statement for new session"
                );
                Ok(Some(ok.statement_id))
            }
            PrepareOutcome::Rejected(e) => {
                tracing::warn!(
                    error = %e,
                    "Server prepare failed, statement switches to client-side"
                );
                handle.fall_back();
                Ok(None)
            }
        }
    }

    fn dispatch_detached(
        &mut self,
        handle: &PreparedStatementHandle,
        params: &[Value],
    ) -> Result<Completion> {
        let sql = handle.sql();
        let statement_id = if handle.is_client_side() {
            None
        } else {
            match self.prepare_on_server(sql)? {
                PrepareOutcome::Prepared(ok) => Some(ok.statement_id),
                PrepareOutcome::Rejected(e) => {
                    tracing::debug!(error = %e, "Server prepare failed, executing as text");
                    None
                }
            }
        };

        let Some(statement_id) = statement_id else {
            let text = self.interpolate(sql, params)?;
            self.begin()?;
            self.transport
                .send(&command_payload(CommandCode::Query, text.as_bytes()))?;
            return self.read_completion(false, Some(&text));
        };

        self.begin()?;
        self.transport.send(&build_stmt_execute_packet(
            statement_id,
            params,
            self.codecs.as_ref(),
        ))?;
        let completion = self.read_completion(true, Some(sql));
        if !completion.as_ref().is_err_and(Error::is_fatal) {
            self.close_statement(statement_id, true)?;
        }
        completion
    }

    fn execute_statement(
        &mut self,
        handle: &PreparedStatementHandle,
        params: &[Value],
    ) -> Result<Completion> {
        let request = self.encode_statement(handle, params)?;
        self.begin()?;
        self.transport.send(&request.payload)?;
        self.read_completion(request.binary, Some(&request.sql))
    }

    fn encode_statement(
        &mut self,
        handle: &PreparedStatementHandle,
        params: &[Value],
    ) -> Result<Request> {
        if handle.is_closed() {
            return Err(Error::Custom(format!(
                "Prepared statement is closed: {}",
                handle.sql()
            )));
        }
        if params.len() != handle.param_count() {
            return Err(Error::Custom(format!(
                "Statement expects {} parameters, got {}",
                handle.param_count(),
                params.len()
            )));
        }

        match self.statement_id(handle)? {
            Some(id) => Ok(Request {
                payload: build_stmt_execute_packet(id, params, self.codecs.as_ref()),
                binary: true,
                sql: handle.sql().to_string(),
            }),
            None => {
                let sql = self.interpolate(handle.sql(), params)?;
                Ok(Request {
                    payload: command_payload(CommandCode::Query, sql.as_bytes()),
                    binary: false,
                    sql,
                })
            }
        }
    }

    fn interpolate(&self, sql: &str, params: &[Value]) -> Result<String> {
        codec::interpolate(
            self.codecs.as_ref(),
            sql,
            params,
            self.context.no_backslash_escapes(),
        )
        .ok_or_else(|| {
            Error::Custom(format!(
                "Parameter count mismatch: {} supplied for '{sql}'",
                params.len()
            ))
        })
    }

    fn encode_batch(&mut self, commands: &[Command]) -> Result<Vec<Request>> {
        commands
            .iter()
            .map(|command| match command {
                Command::Query(sql) => Ok(Request {
                    payload: command_payload(CommandCode::Query, sql.as_bytes()),
                    binary: false,
                    sql: sql.clone(),
                }),
                Command::Execute { statement, params } => self.encode_statement(statement, params),
                other => Err(Error::Custom(format!(
                    "{} cannot be pipelined",
                    other.name()
                ))),
            })
            .collect()
    }

    fn run_pipelined(&mut self, requests: &[Request]) -> Vec<BatchResponse> {
        let written = self.begin().and_then(|()| {
            for request in requests {
                self.reset_sequences();
                self.transport.write_message(&request.payload)?;
            }
            self.transport.flush()
        });
        if let Err(e) = self.settle(written) {
            return vec![BatchResponse {
                result: Err(e),
                in_transaction: self.context.in_transaction(),
            }];
        }
        tracing::debug!(items = requests.len(), "Pipelined batch written");

        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            self.transport
                .set_sequence(packet_count(request.payload.len(), MAX_PACKET_SIZE) as u8);
            let result = self
                .read_completion(request.binary, Some(&request.sql))
                .and_then(|completion| {
                    self.drain_pending()?;
                    Ok(completion)
                });
            let result = self.settle(result);
            let fatal = result.as_ref().is_err_and(Error::is_fatal);
            responses.push(BatchResponse {
                result,
                in_transaction: self.context.in_transaction(),
            });
            if fatal {
                break;
            }
        }
        responses
    }

    /// Read the response to the command just sent.
    fn read_completion(&mut self, binary: bool, sql: Option<&str>) -> Result<Completion> {
        self.state = EngineState::AwaitingResponse;
        let payload = self.transport.receive()?;
        let Some(&first) = payload.first() else {
            return Err(protocol_error("Empty response packet"));
        };

        match PacketType::from_first_byte(first, payload.len() as u32) {
            PacketType::Ok => {
                let ok = parse_ok(&payload)?;
                self.apply_status(ok.status_flags, ok.warnings, binary);
                Ok(Completion::Update(UpdateResult::from_ok(&ok)))
            }
            PacketType::Error => {
                self.pending_more = None;
                self.state = EngineState::Done;
                Err(server_error(&payload, sql))
            }
            PacketType::LocalInfile => {
                // Refuse by sending an empty file, then read the verdict
                self.transport.send(&[])?;
                let verdict = self.transport.receive()?;
                match verdict.first() {
                    Some(0x00) => {
                        let ok = parse_ok(&verdict)?;
                        self.apply_status(ok.status_flags, ok.warnings, binary);
                    }
                    Some(0xFF) => self.state = EngineState::Done,
                    _ => return Err(protocol_error("Unexpected response after LOCAL INFILE")),
                }
                Err(Error::Custom(
                    "LOCAL INFILE requests are not supported".to_string(),
                ))
            }
            PacketType::Eof => Err(protocol_error("Unexpected EOF packet")),
            PacketType::Data => self.read_result_header(&payload, binary),
        }
    }

    fn read_result_header(&mut self, payload: &[u8], binary: bool) -> Result<Completion> {
        let column_count = PacketReader::new(payload)
            .read_lenenc_int()
            .ok_or_else(|| protocol_error("Invalid column count"))?;
        let column_count = usize::try_from(column_count)
            .map_err(|_| protocol_error("Column count out of range"))?;

        let mut definitions = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let packet = self.transport.receive()?;
            definitions.push(
                ColumnDef::parse(&packet)
                    .ok_or_else(|| protocol_error("Malformed column definition"))?,
            );
        }
        if !self
            .context
            .has_capability(capabilities::CLIENT_DEPRECATE_EOF)
        {
            let eof = self.transport.receive()?;
            if eof.first() != Some(&0xFE) {
                return Err(protocol_error("Missing EOF after column definitions"));
            }
        }

        self.state = EngineState::DecodingResult;
        let stream = Stream {
            result: ResultSet::new(definitions),
            binary,
        };
        let limit = self.batch_limit();
        if self.read_rows(&stream, limit)? {
            let result = stream.result.clone();
            self.stream = Some(stream);
            Ok(Completion::Query(result))
        } else {
            Ok(Completion::Query(stream.result))
        }
    }

    /// Read up to `limit` rows into the stream's buffer.
    fn read_rows(&mut self, stream: &Stream, limit: usize) -> Result<bool> {
        let definitions = Arc::clone(stream.result.definitions());
        for _ in 0..limit {
            let payload = self.transport.receive()?;

            if is_row_terminator(&payload) {
                let (status, warnings) = if self
                    .context
                    .has_capability(capabilities::CLIENT_DEPRECATE_EOF)
                {
                    let ok = parse_ok(&payload)?;
                    (ok.status_flags, ok.warnings)
                } else {
                    let eof = PacketReader::new(&payload)
                        .parse_eof_packet()
                        .ok_or_else(|| protocol_error("Malformed EOF packet"))?;
                    (eof.status_flags, eof.warnings)
                };
                stream.result.finish();
                self.apply_status(status, warnings, stream.binary);
                return Ok(false);
            }

            if payload.first() == Some(&0xFF) {
                self.pending_more = None;
                self.state = EngineState::Done;
                return Err(server_error(&payload, None));
            }

            let values = if stream.binary {
                decode_binary_row(self.codecs.as_ref(), &payload, &definitions)?
            } else {
                decode_text_row(self.codecs.as_ref(), &payload, &definitions)?
            };
            stream.result.push(values);
        }
        Ok(true)
    }

    fn apply_status(&mut self, status: u16, warnings: u16, binary: bool) {
        self.context.update_status(status, warnings);
        if status & server_status::SERVER_STATUS_AUTOCOMMIT == 0 {
            self.context.add_state_flag(state_flags::AUTOCOMMIT);
        }
        self.pending_more =
            (status & server_status::SERVER_MORE_RESULTS_EXISTS != 0).then_some(binary);
        self.state = EngineState::Done;
    }
}

impl Drop for ProtocolEngine {
    fn drop(&mut self) {
        if !self.closed {
            self.transport.get_ref().shutdown();
        }
    }
}

fn into_socket(wire: Wire) -> Result<Socket> {
    match wire {
        Wire::Raw(socket) => Ok(socket),
        Wire::Compressed(_) => Err(protocol_error(
            "Compression cannot be active during the handshake",
        )),
    }
}

fn command_payload(command: CommandCode, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + body.len());
    payload.push(command as u8);
    payload.extend_from_slice(body);
    payload
}

/// Parse the initial handshake packet.
pub fn parse_handshake(payload: &[u8]) -> Result<ServerHandshake> {
    let mut reader = PacketReader::new(payload);

    if reader.peek() == Some(0xFF) {
        let err = reader
            .parse_err_packet()
            .ok_or_else(|| protocol_error("Invalid error packet in handshake"))?;
        return Err(auth::auth_error(format!(
            "Server refused connection: {} ({})",
            err.error_message, err.error_code
        )));
    }

    let protocol_version = reader
        .read_u8()
        .ok_or_else(|| protocol_error("Missing protocol version"))?;
    if protocol_version != 10 {
        return Err(protocol_error(format!(
            "Unsupported protocol version: {protocol_version}"
        )));
    }

    let server_version = reader
        .read_null_string()
        .ok_or_else(|| protocol_error("Missing server version"))?;
    let connection_id = reader
        .read_u32_le()
        .ok_or_else(|| protocol_error("Missing connection ID"))?;
    let auth_data_1 = reader
        .read_bytes(8)
        .ok_or_else(|| protocol_error("Missing auth data"))?;
    reader.skip(1);

    let caps_lower = reader
        .read_u16_le()
        .ok_or_else(|| protocol_error("Missing capability flags"))?;
    let charset = reader.read_u8().unwrap_or(0);
    let status_flags = reader.read_u16_le().unwrap_or(0);
    let caps_upper = reader.read_u16_le().unwrap_or(0);
    let capabilities = u32::from(caps_lower) | (u32::from(caps_upper) << 16);

    let auth_data_len = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        usize::from(reader.read_u8().unwrap_or(0))
    } else {
        0
    };
    reader.skip(10);

    let mut auth_data = auth_data_1.to_vec();
    if capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        let len2 = auth_data_len.saturating_sub(8).max(13);
        if let Some(part2) = reader.read_bytes(len2.min(reader.remaining())) {
            auth_data.extend_from_slice(part2.strip_suffix(&[0]).unwrap_or(part2));
        }
    }

    let auth_plugin = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        reader.read_null_string().unwrap_or_default()
    } else {
        plugins::MYSQL_NATIVE_PASSWORD.to_string()
    };

    Ok(ServerHandshake {
        protocol_version,
        server_version,
        connection_id,
        auth_data,
        capabilities,
        charset,
        status_flags,
        auth_plugin,
    })
}

/// Build the HandshakeResponse41 payload.
pub fn build_handshake_response(
    config: &Configuration,
    handshake: &ServerHandshake,
    client_caps: u32,
    credentials: &Credentials,
    auth_response: &[u8],
) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u32_le(client_caps);
    writer.write_u32_le(config.max_packet_size);
    writer.write_u8(config.charset);
    writer.write_zeros(23);
    writer.write_null_string(&credentials.user);

    if client_caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        writer.write_lenenc_bytes(auth_response);
    } else {
        // Scrambles are 20 or 32 bytes
        writer.write_u8(auth_response.len() as u8);
        writer.write_bytes(auth_response);
    }

    if client_caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
        writer.write_null_string(config.database.as_deref().unwrap_or(""));
    }

    if client_caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        writer.write_null_string(&handshake.auth_plugin);
    }

    if client_caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
        let mut attrs = PacketWriter::new();
        for (key, value) in &config.connection_attributes {
            attrs.write_lenenc_string(key);
            attrs.write_lenenc_string(value);
        }
        writer.write_lenenc_bytes(attrs.as_bytes());
    }

    if client_caps & capabilities::CLIENT_ZSTD_COMPRESSION_ALGORITHM != 0 {
        writer.write_u8(config.compression_level);
    }

    writer.into_bytes()
}

/// Run the authentication exchange until the server accepts or refuses.
fn authenticate(
    transport: &mut PacketTransport<Wire>,
    plugin: &dyn CredentialPlugin,
    credentials: &Credentials,
    handshake: &ServerHandshake,
    secure: bool,
) -> Result<OkPacket> {
    let mut plugin_name = handshake.auth_plugin.clone();
    let mut seed = handshake.auth_data.clone();

    loop {
        let payload = transport.receive()?;
        match payload.first() {
            Some(0x00) => return parse_ok(&payload),
            Some(0xFF) => {
                let err = PacketReader::new(&payload)
                    .parse_err_packet()
                    .ok_or_else(|| protocol_error("Invalid error packet"))?;
                return Err(auth::auth_error(format!(
                    "Authentication failed: {} ({})",
                    err.error_message, err.error_code
                )));
            }
            Some(0xFE) => {
                let mut reader = PacketReader::new(&payload[1..]);
                plugin_name = reader
                    .read_null_string()
                    .ok_or_else(|| protocol_error("Missing plugin name in auth switch"))?;
                let data = reader.read_rest();
                seed = data.strip_suffix(&[0]).unwrap_or(data).to_vec();
                tracing::debug!(plugin = %plugin_name, "Auth switch requested");
                let response = plugin.auth_response(&plugin_name, &seed, credentials, secure)?;
                transport.send(&response)?;
            }
            Some(0x01) => {
                let data = &payload[1..];
                match data {
                    [caching_sha2::FAST_AUTH_SUCCESS] => {}
                    [caching_sha2::PERFORM_FULL_AUTH] if secure => {
                        transport.send(&auth::full_auth_cleartext(credentials))?;
                    }
                    [caching_sha2::PERFORM_FULL_AUTH] => {
                        transport.send(&[caching_sha2::REQUEST_PUBLIC_KEY])?;
                    }
                    key if key.starts_with(b"-----BEGIN") => {
                        let encrypted = auth::sha256_password_rsa(
                            credentials.password.as_deref().unwrap_or(""),
                            &seed,
                            key,
                            true,
                        )?;
                        transport.send(&encrypted)?;
                    }
                    _ => {
                        return Err(protocol_error(format!(
                            "Unexpected auth data for plugin '{plugin_name}'"
                        )));
                    }
                }
            }
            Some(other) => {
                return Err(protocol_error(format!(
                    "Unknown auth response: {other:02X}"
                )));
            }
            None => return Err(protocol_error("Empty authentication response")),
        }
    }
}

/// Decode one text-protocol row.
pub fn decode_text_row(
    codecs: &dyn CodecRegistry,
    payload: &[u8],
    columns: &[ColumnDef],
) -> Result<Vec<Value>> {
    let mut reader = PacketReader::new(payload);
    columns
        .iter()
        .map(|column| match reader.read_lenenc_column() {
            Some(None) => Ok(Value::Null),
            Some(Some(data)) => Ok(codecs.decode_text(column, data)),
            None => Err(protocol_error(format!(
                "Truncated text row at column '{}'",
                column.name
            ))),
        })
        .collect()
}

/// Decode one binary-protocol row.
///
/// Layout: 0x00 header, NULL bitmap with a 2-bit offset, then the non-NULL
/// values back to back.
pub fn decode_binary_row(
    codecs: &dyn CodecRegistry,
    payload: &[u8],
    columns: &[ColumnDef],
) -> Result<Vec<Value>> {
    if payload.first() != Some(&0x00) {
        return Err(protocol_error("Binary row does not start with 0x00"));
    }
    let bitmap_len = (columns.len() + 7 + 2) / 8;
    let bitmap = payload
        .get(1..=bitmap_len)
        .ok_or_else(|| protocol_error("Truncated NULL bitmap"))?;

    let mut pos = 1 + bitmap_len;
    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
            continue;
        }
        let rest = payload.get(pos..).unwrap_or(&[]);
        let (value, used) = codecs.decode_binary(column, rest).ok_or_else(|| {
            protocol_error(format!(
                "Truncated binary value for column '{}'",
                column.name
            ))
        })?;
        pos += used;
        values.push(value);
    }
    Ok(values)
}

fn parse_ok(payload: &[u8]) -> Result<OkPacket> {
    PacketReader::new(payload)
        .parse_ok_packet()
        .ok_or_else(|| protocol_error("Malformed OK packet"))
}

fn server_error(payload: &[u8], sql: Option<&str>) -> Error {
    match PacketReader::new(payload).parse_err_packet() {
        Some(err) => {
            let error = QueryError::from_server(err.error_code, &err.sql_state, err.error_message);
            Error::Query(match sql {
                Some(sql) => error.with_sql(sql),
                None => error,
            })
        }
        None => protocol_error("Malformed error packet"),
    }
}

fn protocol_error(message: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: message.into(),
        raw_data: None,
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DefaultCodecs;
    use crate::types::FieldType;

    fn greeting() -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string("8.0.36-dbwire");
        w.write_u32_le(42);
        w.write_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]);
        w.write_u8(0);
        let caps = capabilities::DEFAULT_CLIENT_FLAGS
            | capabilities::CLIENT_SSL
            | capabilities::CLIENT_CONNECT_WITH_DB;
        w.write_u16_le((caps & 0xFFFF) as u16);
        w.write_u8(45);
        w.write_u16_le(server_status::SERVER_STATUS_AUTOCOMMIT);
        w.write_u16_le((caps >> 16) as u16);
        w.write_u8(21);
        w.write_zeros(10);
        w.write_bytes(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 0]);
        w.write_null_string(plugins::CACHING_SHA2_PASSWORD);
        w.into_bytes()
    }

    fn column(name: &str, column_type: FieldType) -> ColumnDef {
        ColumnDef {
            schema: String::new(),
            table: "t".into(),
            name: name.into(),
            org_name: name.into(),
            charset: 45,
            column_length: 20,
            column_type,
            flags: 0,
            decimals: 0,
        }
    }

    #[test]
    fn test_parse_handshake() {
        let hs = parse_handshake(&greeting()).unwrap();
        assert_eq!(hs.protocol_version, 10);
        assert_eq!(hs.server_version, "8.0.36-dbwire");
        assert_eq!(hs.connection_id, 42);
        assert_eq!(hs.auth_data, (1..=20).collect::<Vec<u8>>());
        assert_eq!(hs.auth_plugin, plugins::CACHING_SHA2_PASSWORD);
        assert!(hs.capabilities & capabilities::CLIENT_SSL != 0);
        assert_eq!(hs.status_flags, server_status::SERVER_STATUS_AUTOCOMMIT);
    }

    #[test]
    fn test_parse_handshake_rejects_error_and_old_protocol() {
        let mut err = PacketWriter::new();
        err.write_u8(0xFF);
        err.write_u16_le(1040);
        err.write_bytes(b"Too many connections");
        assert!(parse_handshake(err.as_bytes()).is_err());

        let mut old = greeting();
        old[0] = 9;
        assert!(matches!(parse_handshake(&old), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_handshake_response_layout() {
        let config = Configuration::new()
            .user("app")
            .database("shop")
            .attribute("_client_name", "dbwire");
        let hs = parse_handshake(&greeting()).unwrap();
        let caps = config.capability_flags() & hs.capabilities;
        let creds = Credentials::new("app", None);
        let payload = build_handshake_response(&config, &hs, caps, &creds, &[]);

        let mut reader = PacketReader::new(&payload);
        assert_eq!(reader.read_u32_le(), Some(caps));
        assert_eq!(reader.read_u32_le(), Some(config.max_packet_size));
        assert_eq!(reader.read_u8(), Some(config.charset));
        reader.skip(23);
        assert_eq!(reader.read_null_string().as_deref(), Some("app"));
        assert_eq!(reader.read_lenenc_bytes(), Some(Vec::new()));
        assert_eq!(reader.read_null_string().as_deref(), Some("shop"));
        assert_eq!(
            reader.read_null_string().as_deref(),
            Some(plugins::CACHING_SHA2_PASSWORD)
        );
    }

    #[test]
    fn test_decode_text_row_with_null() {
        let columns = [column("id", FieldType::Long), column("name", FieldType::VarString)];
        let mut w = PacketWriter::new();
        w.write_lenenc_string("7");
        w.write_u8(0xFB);
        let values = decode_text_row(&DefaultCodecs, w.as_bytes(), &columns).unwrap();
        assert_eq!(values, vec![Value::Int(7), Value::Null]);

        let truncated = [0x01, b'7'];
        assert!(decode_text_row(&DefaultCodecs, &truncated, &columns).is_err());
    }

    #[test]
    fn test_decode_binary_row_bitmap_offset() {
        let columns = [
            column("a", FieldType::LongLong),
            column("b", FieldType::VarString),
            column("c", FieldType::Tiny),
        ];
        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        // column b (index 1) is NULL: bit 3
        w.write_u8(1 << 3);
        w.write_u64_le(99);
        w.write_u8(5);
        let values = decode_binary_row(&DefaultCodecs, w.as_bytes(), &columns).unwrap();
        assert_eq!(values, vec![Value::BigInt(99), Value::Null, Value::TinyInt(5)]);

        assert!(decode_binary_row(&DefaultCodecs, &[0x01, 0x00], &columns).is_err());
    }

    #[test]
    fn test_server_error_carries_sql() {
        let mut w = PacketWriter::new();
        w.write_u8(0xFF);
        w.write_u16_le(1146);
        w.write_u8(b'#');
        w.write_bytes(b"42S02");
        w.write_bytes(b"Table 'shop.nope' doesn't exist");
        match server_error(w.as_bytes(), Some("SELECT * FROM nope")) {
            Error::Query(q) => {
                assert_eq!(q.code, 1146);
                assert_eq!(q.sqlstate.as_deref(), Some("42S02"));
                assert_eq!(q.sql.as_deref(), Some("SELECT * FROM nope"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
