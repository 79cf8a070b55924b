//! In-process MySQL protocol server for integration tests.
//!
//! Speaks just enough of the protocol for the client: a native-password
//! handshake that accepts any credentials, text and binary result sets of
//! BIGINT columns, transactions over integer tables, prepared statements,
//! `KILL QUERY`, `SELECT SLEEP(n)` and multi-statement queries. Every
//! session runs on its own thread.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use dbwire_client::protocol::{PacketReader, PacketWriter, capabilities, server_status};
use dbwire_client::{Configuration, HostAddress};

const SERVER_CAPABILITIES: u32 = capabilities::DEFAULT_CLIENT_FLAGS
    | capabilities::CLIENT_CONNECT_WITH_DB
    | capabilities::CLIENT_MULTI_STATEMENTS
    | capabilities::CLIENT_CONNECT_ATTRS;

/// Marker that makes a prepare fail with "not supported".
pub const NO_PREPARE: &str = "/*noprep*/";

struct SessionHandle {
    stream: TcpStream,
    killed: Arc<AtomicBool>,
}

#[derive(Default)]
struct Shared {
    tables: HashMap<String, Vec<i64>>,
    sessions: HashMap<u32, SessionHandle>,
    queries: Vec<(u32, String)>,
    prepare_attempts: usize,
    statement_closes: usize,
    crash_on: Option<String>,
    reject_on: Option<String>,
}

/// A running fake server. Sessions stay up until dropped by the client,
/// by [`FakeServer::drop_connections`] or by a crash marker.
pub struct FakeServer {
    addr: SocketAddr,
    shared: Arc<Mutex<Shared>>,
    stopped: Arc<AtomicBool>,
}

impl FakeServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake server");
        let addr = listener.local_addr().expect("fake server address");
        let shared = Arc::new(Mutex::new(Shared::default()));
        let stopped = Arc::new(AtomicBool::new(false));
        let next_thread_id = Arc::new(AtomicU32::new(100));

        let accept_shared = Arc::clone(&shared);
        let accept_stopped = Arc::clone(&stopped);
        thread::spawn(move || {
            for stream in listener.incoming() {
                if accept_stopped.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(stream) = stream else { continue };
                let thread_id = next_thread_id.fetch_add(1, Ordering::SeqCst);
                let shared = Arc::clone(&accept_shared);
                thread::spawn(move || {
                    let _ = Session::run(stream, thread_id, &shared);
                    lock(&shared).sessions.remove(&thread_id);
                });
            }
        });

        Self {
            addr,
            shared,
            stopped,
        }
    }

    pub fn address(&self) -> HostAddress {
        HostAddress::new("127.0.0.1", self.addr.port())
    }

    /// Configuration for a client of this server.
    pub fn config(&self) -> Configuration {
        Configuration::new()
            .addresses(vec![self.address()])
            .user("app")
            .connect_timeout(Duration::from_secs(2))
            .socket_timeout(Some(Duration::from_secs(10)))
            .retries_all_down(3)
            .wait_reconnect_timeout(Duration::from_millis(10))
    }

    /// Committed rows of `table`, in insert order.
    pub fn table(&self, table: &str) -> Vec<i64> {
        lock(&self.shared)
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop every open session, as a server restart would.
    pub fn drop_connections(&self) {
        let sessions: Vec<SessionHandle> = lock(&self.shared)
            .sessions
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in sessions {
            let _ = session.stream.shutdown(Shutdown::Both);
        }
        // Let the FIN reach the client before it probes the socket
        thread::sleep(Duration::from_millis(50));
    }

    /// Drop the session that receives the next query containing `marker`,
    /// without answering it. Fires once.
    pub fn crash_on(&self, marker: &str) {
        lock(&self.shared).crash_on = Some(marker.to_string());
    }

    /// Fail every later query containing `marker` with a deadlock error.
    pub fn reject_on(&self, marker: &str) {
        lock(&self.shared).reject_on = Some(marker.to_string());
    }

    pub fn prepare_attempts(&self) -> usize {
        lock(&self.shared).prepare_attempts
    }

    pub fn statement_closes(&self) -> usize {
        lock(&self.shared).statement_closes
    }

    pub fn open_sessions(&self) -> usize {
        lock(&self.shared).sessions.len()
    }

    /// Queries received by session `thread_id`, in order.
    pub fn queries_of(&self, thread_id: u32) -> Vec<String> {
        lock(&self.shared)
            .queries
            .iter()
            .filter(|(id, _)| *id == thread_id)
            .map(|(_, sql)| sql.clone())
            .collect()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        // Wake the accept loop
        let _ = TcpStream::connect(self.addr);
        self.drop_connections();
    }
}

/// A local port nothing listens on.
pub fn unused_address() -> HostAddress {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind free port");
    let port = listener.local_addr().expect("free port address").port();
    drop(listener);
    HostAddress::new("127.0.0.1", port)
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Session<'a> {
    stream: TcpStream,
    sequence: u8,
    thread_id: u32,
    shared: &'a Mutex<Shared>,
    killed: Arc<AtomicBool>,
    client_capabilities: u32,
    more_results: bool,
    in_transaction: bool,
    autocommit: bool,
    pending: Vec<(String, i64)>,
    statements: HashMap<u32, String>,
    next_statement: u32,
}

enum Reply {
    Ok(u64),
    Rows(&'static str, Vec<i64>),
    Err(u16, &'static str, String),
}

impl<'a> Session<'a> {
    fn run(stream: TcpStream, thread_id: u32, shared: &'a Mutex<Shared>) -> io::Result<()> {
        let killed = Arc::new(AtomicBool::new(false));
        lock(shared).sessions.insert(
            thread_id,
            SessionHandle {
                stream: stream.try_clone()?,
                killed: Arc::clone(&killed),
            },
        );
        let mut session = Session {
            stream,
            sequence: 0,
            thread_id,
            shared,
            killed,
            client_capabilities: 0,
            more_results: false,
            in_transaction: false,
            autocommit: true,
            pending: Vec::new(),
            statements: HashMap::new(),
            next_statement: 1,
        };
        session.handshake()?;
        session.serve()
    }

    fn handshake(&mut self) -> io::Result<()> {
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string("8.0.36-fake");
        w.write_u32_le(self.thread_id);
        w.write_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]);
        w.write_u8(0);
        w.write_u16_le((SERVER_CAPABILITIES & 0xFFFF) as u16);
        w.write_u8(45);
        w.write_u16_le(server_status::SERVER_STATUS_AUTOCOMMIT);
        w.write_u16_le((SERVER_CAPABILITIES >> 16) as u16);
        w.write_u8(21);
        w.write_zeros(10);
        w.write_bytes(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 0]);
        w.write_null_string("mysql_native_password");
        self.write(w.as_bytes())?;

        // Any credentials are accepted
        let response = self.read()?;
        self.client_capabilities = PacketReader::new(&response).read_u32_le().unwrap_or(0);
        self.ok(0)
    }

    fn serve(&mut self) -> io::Result<()> {
        loop {
            self.sequence = 0;
            let packet = self.read()?;
            let Some((&command, body)) = packet.split_first() else {
                return Ok(());
            };
            match command {
                // COM_QUIT
                0x01 => return Ok(()),
                // COM_INIT_DB, COM_PING
                0x02 | 0x0E => self.ok(0)?,
                0x03 => {
                    let sql = String::from_utf8_lossy(body).into_owned();
                    self.query(&sql, false)?;
                }
                // COM_RESET_CONNECTION
                0x1F => {
                    self.pending.clear();
                    self.in_transaction = false;
                    self.autocommit = true;
                    self.statements.clear();
                    self.ok(0)?;
                }
                0x16 => self.prepare(&String::from_utf8_lossy(body))?,
                0x17 => self.execute(body)?,
                // COM_STMT_CLOSE has no response
                0x19 => {
                    let mut reader = PacketReader::new(body);
                    if let Some(id) = reader.read_u32_le() {
                        self.statements.remove(&id);
                    }
                    lock(self.shared).statement_closes += 1;
                }
                other => self.err(1047, "08S01", format!("Unknown command {other:#04x}"))?,
            }
        }
    }

    fn prepare(&mut self, sql: &str) -> io::Result<()> {
        lock(self.shared).prepare_attempts += 1;
        if sql.contains(NO_PREPARE) {
            return self.err(
                1295,
                "HY000",
                "This command is not supported in the prepared statement protocol yet".into(),
            );
        }
        let id = self.next_statement;
        self.next_statement += 1;
        self.statements.insert(id, sql.to_string());

        let params = sql.matches('?').count();
        let columns = usize::from(sql.trim_start().to_ascii_uppercase().starts_with("SELECT"));
        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        w.write_u32_le(id);
        w.write_u16_le(columns as u16);
        w.write_u16_le(params as u16);
        w.write_u8(0);
        w.write_u16_le(0);
        self.write(w.as_bytes())?;
        for _ in 0..params {
            self.write(&column_definition("?"))?;
        }
        for _ in 0..columns {
            self.write(&column_definition("v"))?;
        }
        Ok(())
    }

    fn execute(&mut self, body: &[u8]) -> io::Result<()> {
        let mut reader = PacketReader::new(body);
        let id = reader.read_u32_le().unwrap_or(0);
        let Some(sql) = self.statements.get(&id).cloned() else {
            return self.err(
                1243,
                "HY000",
                format!("Unknown prepared statement handler ({id}) given to mysqld_stmt_execute"),
            );
        };
        reader.skip(5);
        let count = sql.matches('?').count();
        let mut params = Vec::with_capacity(count);
        if count > 0 {
            let bitmap = reader.read_bytes(count.div_ceil(8)).unwrap_or(&[]).to_vec();
            let bound = reader.read_u8().unwrap_or(0);
            let mut types = Vec::with_capacity(count);
            if bound == 1 {
                for _ in 0..count {
                    types.push(reader.read_u8().unwrap_or(0));
                    reader.skip(1);
                }
            }
            for i in 0..count {
                if bitmap.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0) {
                    params.push("NULL".to_string());
                    continue;
                }
                let text = match types.get(i).copied().unwrap_or(0x08) {
                    0x01 => reader.read_u8().map(|v| (v as i8).to_string()),
                    0x02 => reader.read_u16_le().map(|v| (v as i16).to_string()),
                    0x03 => reader.read_u32_le().map(|v| (v as i32).to_string()),
                    0x08 => reader.read_u64_le().map(|v| (v as i64).to_string()),
                    _ => reader.read_lenenc_string().map(|s| format!("'{s}'")),
                };
                params.push(text.unwrap_or_default());
            }
        }

        let mut bound = String::new();
        let mut values = params.into_iter();
        for ch in sql.chars() {
            if ch == '?' {
                bound.push_str(&values.next().unwrap_or_default());
            } else {
                bound.push(ch);
            }
        }
        self.query(&bound, true)
    }

    fn query(&mut self, sql: &str, binary: bool) -> io::Result<()> {
        {
            let mut shared = lock(self.shared);
            shared.queries.push((self.thread_id, sql.to_string()));
            if shared
                .crash_on
                .as_deref()
                .is_some_and(|marker| sql.contains(marker))
            {
                shared.crash_on = None;
                shared.sessions.remove(&self.thread_id);
                drop(shared);
                let _ = self.stream.shutdown(Shutdown::Both);
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "crash"));
            }
            if shared
                .reject_on
                .as_deref()
                .is_some_and(|marker| sql.contains(marker))
            {
                drop(shared);
                return self.err(
                    1213,
                    "40001",
                    "Deadlock found when trying to get lock; try restarting transaction".into(),
                );
            }
        }
        self.killed.store(false, Ordering::SeqCst);

        let multi = !binary
            && self.client_capabilities & capabilities::CLIENT_MULTI_STATEMENTS != 0;
        let statements: Vec<&str> = if multi {
            sql.split(';').filter(|s| !s.trim().is_empty()).collect()
        } else {
            vec![sql]
        };
        let last = statements.len().saturating_sub(1);
        for (index, statement) in statements.into_iter().enumerate() {
            self.more_results = index < last;
            let reply = self.evaluate(statement);
            let failed = matches!(reply, Reply::Err(..));
            if failed {
                self.more_results = false;
            }
            match reply {
                Reply::Ok(affected) => self.ok(affected)?,
                Reply::Rows(column, rows) => self.rows(column, &rows, binary)?,
                Reply::Err(code, state, message) => self.err(code, state, message)?,
            }
            if failed {
                break;
            }
        }
        self.more_results = false;
        Ok(())
    }

    fn evaluate(&mut self, sql: &str) -> Reply {
        let text = strip_comments(sql);
        let text = text.trim().trim_end_matches(';').trim();
        let upper = text.to_ascii_uppercase();

        match upper.as_str() {
            "BEGIN" | "START TRANSACTION" => {
                self.commit();
                self.in_transaction = true;
                return Reply::Ok(0);
            }
            "COMMIT" => {
                self.commit();
                return Reply::Ok(0);
            }
            "ROLLBACK" => {
                self.pending.clear();
                self.in_transaction = false;
                return Reply::Ok(0);
            }
            _ => {}
        }

        if let Some(value) = upper.strip_prefix("SET AUTOCOMMIT=") {
            self.autocommit = value.trim() == "1";
            if self.autocommit {
                self.commit();
            }
            return Reply::Ok(0);
        }
        if upper.starts_with("SET ") || upper.starts_with("USE ") {
            return Reply::Ok(0);
        }
        if let Some(id) = upper.strip_prefix("KILL QUERY ") {
            let target = id.trim().parse::<u32>().ok();
            let shared = lock(self.shared);
            return match target.and_then(|id| shared.sessions.get(&id)) {
                Some(session) => {
                    session.killed.store(true, Ordering::SeqCst);
                    Reply::Ok(0)
                }
                None => Reply::Err(1094, "HY000", format!("Unknown thread id: {id}")),
            };
        }
        if let Some(table) = upper.strip_prefix("CREATE TABLE ") {
            lock(self.shared)
                .tables
                .entry(table.trim().to_ascii_lowercase())
                .or_default();
            return Reply::Ok(0);
        }

        // Any other statement opens an implicit transaction when autocommit is off
        if !self.autocommit {
            self.in_transaction = true;
        }

        if let Some(seconds) = upper
            .strip_prefix("SELECT SLEEP(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let seconds: f64 = seconds.trim().parse().unwrap_or(0.0);
            return self.sleep(Duration::from_secs_f64(seconds));
        }
        match upper.as_str() {
            "SELECT 1" => return Reply::Rows("1", vec![1]),
            "SELECT CONNECTION_ID()" => {
                return Reply::Rows("CONNECTION_ID()", vec![i64::from(self.thread_id)]);
            }
            _ => {}
        }
        if let Some(table) = upper.strip_prefix("SELECT V FROM ") {
            let table = table.trim().to_ascii_lowercase();
            let mut rows = lock(self.shared)
                .tables
                .get(&table)
                .cloned()
                .unwrap_or_default();
            rows.extend(
                self.pending
                    .iter()
                    .filter(|(t, _)| *t == table)
                    .map(|(_, v)| *v),
            );
            return Reply::Rows("v", rows);
        }
        if upper.starts_with("INSERT INTO ") {
            return self.insert(&text["INSERT INTO ".len()..]);
        }

        Reply::Err(
            1064,
            "42000",
            format!("You have an error in your SQL syntax near '{text}'"),
        )
    }

    /// `<table> VALUES (1), (2)`
    fn insert(&mut self, rest: &str) -> Reply {
        let syntax = || {
            Reply::Err(
                1064,
                "42000",
                format!("You have an error in your SQL syntax near '{rest}'"),
            )
        };
        let Some((table, values)) = rest.split_once(' ') else {
            return syntax();
        };
        let Some(values) = values.trim().get(6..).filter(|_| {
            values.trim().to_ascii_uppercase().starts_with("VALUES")
        }) else {
            return syntax();
        };
        let mut parsed = Vec::new();
        for group in values.split(',') {
            let group = group.trim().trim_start_matches('(').trim_end_matches(')');
            match group.trim().parse::<i64>() {
                Ok(v) => parsed.push(v),
                Err(_) => return syntax(),
            }
        }

        let table = table.trim().trim_matches('`').to_ascii_lowercase();
        let count = parsed.len() as u64;
        if self.in_transaction {
            self.pending
                .extend(parsed.into_iter().map(|v| (table.clone(), v)));
        } else {
            lock(self.shared)
                .tables
                .entry(table)
                .or_default()
                .extend(parsed);
        }
        Reply::Ok(count)
    }

    fn sleep(&mut self, duration: Duration) -> Reply {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.killed.swap(false, Ordering::SeqCst) {
                return Reply::Err(1317, "70100", "Query execution was interrupted".into());
            }
            thread::sleep(Duration::from_millis(5));
        }
        Reply::Rows("SLEEP", vec![0])
    }

    fn commit(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        let mut shared = lock(self.shared);
        for (table, value) in pending {
            shared.tables.entry(table).or_default().push(value);
        }
        self.in_transaction = false;
    }

    fn status(&self) -> u16 {
        let mut status = 0;
        if self.in_transaction {
            status |= server_status::SERVER_STATUS_IN_TRANS;
        }
        if self.autocommit {
            status |= server_status::SERVER_STATUS_AUTOCOMMIT;
        }
        if self.more_results {
            status |= server_status::SERVER_MORE_RESULTS_EXISTS;
        }
        status
    }

    fn ok(&mut self, affected: u64) -> io::Result<()> {
        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        w.write_lenenc_int(affected);
        w.write_lenenc_int(0);
        w.write_u16_le(self.status());
        w.write_u16_le(0);
        self.write(w.as_bytes())
    }

    fn err(&mut self, code: u16, state: &str, message: String) -> io::Result<()> {
        let mut w = PacketWriter::new();
        w.write_u8(0xFF);
        w.write_u16_le(code);
        w.write_u8(b'#');
        w.write_bytes(state.as_bytes());
        w.write_bytes(message.as_bytes());
        self.write(w.as_bytes())
    }

    fn rows(&mut self, column: &str, rows: &[i64], binary: bool) -> io::Result<()> {
        let mut w = PacketWriter::new();
        w.write_lenenc_int(1);
        self.write(w.as_bytes())?;
        self.write(&column_definition(column))?;
        for value in rows {
            let mut w = PacketWriter::new();
            if binary {
                w.write_u8(0x00);
                // NULL bitmap for one column, offset 2
                w.write_u8(0x00);
                w.write_u64_le(*value as u64);
            } else {
                w.write_lenenc_string(&value.to_string());
            }
            self.write(w.as_bytes())?;
        }
        let mut w = PacketWriter::new();
        w.write_u8(0xFE);
        w.write_lenenc_int(0);
        w.write_lenenc_int(0);
        w.write_u16_le(self.status());
        w.write_u16_le(0);
        self.write(w.as_bytes())
    }

    fn read(&mut self) -> io::Result<Vec<u8>> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header)?;
        let len = usize::from(header[0]) | usize::from(header[1]) << 8 | usize::from(header[2]) << 16;
        self.sequence = header[3].wrapping_add(1);
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        Ok(payload)
    }

    fn write(&mut self, payload: &[u8]) -> io::Result<()> {
        let len = payload.len();
        let mut packet = Vec::with_capacity(4 + len);
        packet.extend_from_slice(&[len as u8, (len >> 8) as u8, (len >> 16) as u8, self.sequence]);
        packet.extend_from_slice(payload);
        self.sequence = self.sequence.wrapping_add(1);
        self.stream.write_all(&packet)?;
        self.stream.flush()
    }
}

/// A BIGINT column definition.
fn column_definition(name: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_lenenc_string("def");
    w.write_lenenc_string("test");
    w.write_lenenc_string("t");
    w.write_lenenc_string("t");
    w.write_lenenc_string(name);
    w.write_lenenc_string(name);
    w.write_lenenc_int(0x0C);
    w.write_u16_le(63);
    w.write_u32_le(20);
    w.write_u8(0x08);
    w.write_u16_le(0);
    w.write_u8(0);
    w.write_zeros(2);
    w.into_bytes()
}

fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start..].find("*/") {
            Some(end) => rest = &rest[start + end + 2..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}
