//! Commands and their completions.
//!
//! A [`Command`] is the unit of work the engine executes and the replay log
//! records; it owns its parameters so a logged command is unaffected by
//! later changes to the caller's buffers.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::PreparedStatementHandle;
use crate::protocol::OkPacket;
use crate::types::ColumnDef;
use dbwire_core::{ColumnInfo, Row, Value};

/// One request to the server.
#[derive(Debug, Clone)]
pub enum Command {
    /// COM_QUERY with SQL text
    Query(String),
    /// Prepare through the statement cache
    Prepare(String),
    /// Execute a prepared statement with bound parameters
    Execute {
        statement: Arc<PreparedStatementHandle>,
        params: Vec<Value>,
    },
    /// COM_INIT_DB
    ChangeDb(String),
    Ping,
    /// COM_RESET_CONNECTION
    Reset,
    /// COM_STMT_CLOSE; the server sends no response
    CloseStatement(u32),
}

impl Command {
    pub fn query(sql: impl Into<String>) -> Self {
        Command::Query(sql.into())
    }

    pub fn execute(statement: &Arc<PreparedStatementHandle>, params: Vec<Value>) -> Self {
        Command::Execute {
            statement: Arc::clone(statement),
            params,
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Query(_) => "query",
            Command::Prepare(_) => "prepare",
            Command::Execute { .. } => "execute",
            Command::ChangeDb(_) => "change_db",
            Command::Ping => "ping",
            Command::Reset => "reset",
            Command::CloseStatement(_) => "close_statement",
        }
    }

    /// The SQL text this command carries, if any.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Command::Query(sql) | Command::Prepare(sql) => Some(sql),
            Command::Execute { statement, .. } => Some(statement.sql()),
            _ => None,
        }
    }

    /// Does this command change session state a replay must reproduce?
    pub fn is_replayable(&self) -> bool {
        matches!(
            self,
            Command::Query(_) | Command::Execute { .. } | Command::ChangeDb(_)
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::ChangeDb(db) => write!(f, "change_db({db})"),
            Command::CloseStatement(id) => write!(f, "close_statement({id})"),
            other => match other.sql() {
                Some(sql) => write!(f, "{}({sql})", other.name()),
                None => f.write_str(other.name()),
            },
        }
    }
}

/// Outcome of a statement that returned no rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    /// Auto-increment values generated by the statement, in order
    pub generated_keys: Vec<u64>,
    pub warnings: u16,
    pub info: String,
}

impl UpdateResult {
    /// Build from an OK packet.
    ///
    /// A multi-row insert reports only its first generated id; the rest are
    /// consecutive, one per affected row.
    pub fn from_ok(ok: &OkPacket) -> Self {
        let generated_keys = if ok.last_insert_id == 0 {
            Vec::new()
        } else {
            (0..ok.affected_rows.max(1))
                .map(|i| ok.last_insert_id + i)
                .collect()
        };
        Self {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            generated_keys,
            warnings: ok.warnings,
            info: ok.info.clone(),
        }
    }
}

/// What `execute` produced.
#[derive(Debug, Clone)]
pub enum Completion {
    Update(UpdateResult),
    Query(ResultSet),
    Prepared(Arc<PreparedStatementHandle>),
    Nothing,
}

impl Completion {
    /// Affected rows for updates, zero otherwise.
    pub fn update_count(&self) -> u64 {
        match self {
            Completion::Update(update) => update.affected_rows,
            _ => 0,
        }
    }

    pub fn into_result_set(self) -> Option<ResultSet> {
        match self {
            Completion::Query(rs) => Some(rs),
            _ => None,
        }
    }

    pub fn into_update(self) -> Option<UpdateResult> {
        match self {
            Completion::Update(update) => Some(update),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct RowBuffer {
    rows: VecDeque<Row>,
    complete: bool,
    received: u64,
}

/// Cursor over the rows of one result set.
///
/// Rows arrive in batches of `fetch_size` (all at once when it is zero).
/// The engine appends to the shared buffer; when another command needs the
/// wire, the rest of the stream is read into the buffer first, so a cursor
/// never loses rows. Clones share the same buffer.
#[derive(Debug, Clone)]
pub struct ResultSet {
    columns: Arc<ColumnInfo>,
    definitions: Arc<[ColumnDef]>,
    buffer: Arc<Mutex<RowBuffer>>,
}

impl ResultSet {
    pub(crate) fn new(definitions: Vec<ColumnDef>) -> Self {
        let names = definitions.iter().map(|c| c.name.clone()).collect();
        Self {
            columns: Arc::new(ColumnInfo::new(names)),
            definitions: definitions.into(),
            buffer: Arc::new(Mutex::new(RowBuffer::default())),
        }
    }

    pub fn columns(&self) -> &Arc<ColumnInfo> {
        &self.columns
    }

    pub fn column_definitions(&self) -> &[ColumnDef] {
        &self.definitions
    }

    /// Has the server sent the last row?
    pub fn is_complete(&self) -> bool {
        self.buffer.lock().complete
    }

    /// Rows buffered and not yet taken.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().rows.len()
    }

    /// Rows received from the server so far.
    pub fn rows_received(&self) -> u64 {
        self.buffer.lock().received
    }

    /// Take the next buffered row without touching the wire.
    pub fn next_buffered(&self) -> Option<Row> {
        self.buffer.lock().rows.pop_front()
    }

    /// Take every buffered row.
    pub fn drain_buffered(&self) -> Vec<Row> {
        self.buffer.lock().rows.drain(..).collect()
    }

    /// Take every buffered row, consuming the cursor.
    pub fn into_rows(self) -> Vec<Row> {
        self.drain_buffered()
    }

    pub(crate) fn push(&self, values: Vec<Value>) {
        let row = Row::with_columns(Arc::clone(&self.columns), values);
        let mut buffer = self.buffer.lock();
        buffer.rows.push_back(row);
        buffer.received += 1;
    }

    pub(crate) fn finish(&self) {
        self.buffer.lock().complete = true;
    }

    pub(crate) fn definitions(&self) -> &Arc<[ColumnDef]> {
        &self.definitions
    }

    /// Do both cursors read the same stream?
    pub(crate) fn same_stream(&self, other: &ResultSet) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }
}
