//! Prepared statement cache.
//!
//! Maps normalized SQL text to a shared [`PreparedStatementHandle`]. The
//! cache is strict LRU bounded by `prepStmtCacheSize`, but an entry whose
//! handle is still referenced is skipped by the eviction scan and looked at
//! again on the next insertion.
//!
//! Server statement ids are only valid inside the session that issued them.
//! Each handle remembers the session generation its id belongs to; a handle
//! used in a later session is re-prepared by the engine, and a stale id is
//! never sent in a `CloseStatement`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::prepared::StmtPrepareOk;
use crate::types::count_placeholders;

/// Cache key for `sql`: trimmed, with whitespace runs outside quoted
/// strings and identifiers collapsed to one space.
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;
    let mut chars = sql.trim().chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == '\\' && q != '`' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == q {
                    quote = None;
                }
            }
            None if c.is_whitespace() => pending_space = true,
            None => {
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                if matches!(c, '\'' | '"' | '`') {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ServerBinding {
    statement_id: u32,
    generation: u64,
}

/// A prepared statement shared by every cursor executing the same SQL.
#[derive(Debug)]
pub struct PreparedStatementHandle {
    sql: String,
    param_count: usize,
    binding: Mutex<Option<ServerBinding>>,
    client_side: AtomicBool,
    ref_count: AtomicUsize,
    evicted: AtomicBool,
    closed: AtomicBool,
}

impl PreparedStatementHandle {
    /// A handle backed by a server-side statement from session `generation`.
    pub(crate) fn server(sql: impl Into<String>, ok: &StmtPrepareOk, generation: u64) -> Self {
        Self {
            sql: sql.into(),
            param_count: usize::from(ok.num_params),
            binding: Mutex::new(Some(ServerBinding {
                statement_id: ok.statement_id,
                generation,
            })),
            client_side: AtomicBool::new(false),
            ref_count: AtomicUsize::new(1),
            evicted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// A handle whose parameters are substituted into the SQL text locally.
    pub(crate) fn client(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        Self {
            param_count: count_placeholders(&sql),
            sql,
            binding: Mutex::new(None),
            client_side: AtomicBool::new(true),
            ref_count: AtomicUsize::new(1),
            evicted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }

    /// Does this handle execute through the text protocol?
    ///
    /// Once true it stays true for the lifetime of the handle.
    pub fn is_client_side(&self) -> bool {
        self.client_side.load(Ordering::Acquire)
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Has the handle been released for good?
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The most recent server statement id, whatever session it belongs to.
    pub fn statement_id(&self) -> Option<u32> {
        self.binding.lock().map(|b| b.statement_id)
    }

    /// The statement id if it was issued by session `generation`.
    pub(crate) fn server_id(&self, generation: u64) -> Option<u32> {
        self.binding
            .lock()
            .filter(|b| b.generation == generation)
            .map(|b| b.statement_id)
    }

    /// Record a fresh server-side prepare of the same SQL.
    pub(crate) fn rebind(&self, statement_id: u32, generation: u64) {
        *self.binding.lock() = Some(ServerBinding {
            statement_id,
            generation,
        });
    }

    /// Switch permanently to client-side execution.
    pub(crate) fn fall_back(&self) {
        *self.binding.lock() = None;
        self.client_side.store(true, Ordering::Release);
    }

    pub(crate) fn retain(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference, returning how many remain.
    pub(crate) fn release(&self) -> usize {
        let previous = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub(crate) fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::Release);
    }

    /// Mark the handle closed and return the id to close on the wire, if
    /// this call closed it and the id belongs to session `generation`.
    pub(crate) fn take_close_id(&self, generation: u64) -> Option<u32> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.server_id(generation)
    }
}

#[derive(Debug)]
struct CacheEntry {
    handle: Arc<PreparedStatementHandle>,
    tick: u64,
}

/// LRU cache of prepared statements for one logical connection.
///
/// Guarded by the connection lock, so it needs no interior locking itself.
#[derive(Debug)]
pub struct StatementCache {
    capacity: usize,
    enabled: bool,
    entries: HashMap<String, CacheEntry>,
    lru: BTreeMap<u64, String>,
    tick: u64,
}

impl StatementCache {
    pub fn new(capacity: usize, enabled: bool) -> Self {
        Self {
            capacity,
            enabled: enabled && capacity > 0,
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            tick: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn contains(&self, sql: &str) -> bool {
        self.entries.contains_key(&normalize_sql(sql))
    }

    /// Look up `sql`, bumping its recency and its reference count.
    pub fn acquire(&mut self, sql: &str) -> Option<Arc<PreparedStatementHandle>> {
        let key = normalize_sql(sql);
        let tick = self.next_tick();
        let entry = self.entries.get_mut(&key)?;
        self.lru.remove(&entry.tick);
        entry.tick = tick;
        self.lru.insert(tick, key);
        entry.handle.retain();
        Some(Arc::clone(&entry.handle))
    }

    /// Insert a freshly prepared handle.
    ///
    /// Returns the server statement ids that must be closed because their
    /// entries were evicted. With caching disabled the handle is detached
    /// immediately and closes when its last reference goes.
    pub fn insert(
        &mut self,
        sql: &str,
        handle: &Arc<PreparedStatementHandle>,
        generation: u64,
    ) -> Vec<u32> {
        if !self.enabled {
            handle.mark_evicted();
            return Vec::new();
        }

        let key = normalize_sql(sql);
        let tick = self.next_tick();
        let mut to_close = Vec::new();

        if let Some(previous) = self.entries.insert(
            key.clone(),
            CacheEntry {
                handle: Arc::clone(handle),
                tick,
            },
        ) {
            self.lru.remove(&previous.tick);
            Self::evict_handle(&previous.handle, generation, &mut to_close);
        }
        self.lru.insert(tick, key);

        if self.entries.len() > self.capacity {
            let candidates: Vec<(u64, String)> = self
                .lru
                .iter()
                .filter(|(_, key)| {
                    self.entries
                        .get(*key)
                        .is_some_and(|entry| entry.handle.ref_count() == 0)
                })
                .map(|(tick, key)| (*tick, key.clone()))
                .collect();

            for (tick, key) in candidates {
                if self.entries.len() <= self.capacity {
                    break;
                }
                self.lru.remove(&tick);
                if let Some(entry) = self.entries.remove(&key) {
                    tracing::debug!(sql = %key, "Evicting prepared statement");
                    Self::evict_handle(&entry.handle, generation, &mut to_close);
                }
            }
        }

        to_close
    }

    /// Drop one reference to `handle`.
    ///
    /// Returns the statement id to close when this was the last reference
    /// to an evicted (or uncached) handle.
    pub fn release(&mut self, handle: &PreparedStatementHandle, generation: u64) -> Option<u32> {
        if handle.release() == 0 && handle.is_evicted() {
            handle.take_close_id(generation)
        } else {
            None
        }
    }

    fn evict_handle(handle: &PreparedStatementHandle, generation: u64, to_close: &mut Vec<u32>) {
        handle.mark_evicted();
        if handle.ref_count() == 0 {
            if let Some(id) = handle.take_close_id(generation) {
                to_close.push(id);
            }
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_handle(sql: &str, id: u32) -> Arc<PreparedStatementHandle> {
        let ok = StmtPrepareOk {
            statement_id: id,
            num_columns: 0,
            num_params: 1,
            warnings: 0,
        };
        Arc::new(PreparedStatementHandle::server(sql, &ok, 1))
    }

    #[test]
    fn test_normalize_sql() {
        assert_eq!(
            normalize_sql("  SELECT *\n  FROM t\tWHERE id = ?  "),
            "SELECT * FROM t WHERE id = ?"
        );
        assert_eq!(
            normalize_sql("SELECT  'a  b',\n `c  d`"),
            "SELECT 'a  b', `c  d`"
        );
        assert_ne!(normalize_sql("SELECT 'a  b'"), normalize_sql("SELECT 'a b'"));
    }

    #[test]
    fn test_acquire_hits_normalized_key() {
        let mut cache = StatementCache::new(4, true);
        let handle = server_handle("SELECT ?", 1);
        assert!(cache.insert("SELECT ?", &handle, 1).is_empty());

        let hit = cache.acquire("SELECT   ?").unwrap();
        assert!(Arc::ptr_eq(&hit, &handle));
        assert_eq!(handle.ref_count(), 2);
    }

    #[test]
    fn test_cache_bound_closes_each_evicted_once() {
        let cap = 3;
        let extra = 4;
        let mut cache = StatementCache::new(cap, true);
        let mut closed = Vec::new();

        for i in 0..(cap + extra) {
            let id = u32::try_from(i).unwrap() + 1;
            let sql = format!("SELECT {i}");
            let handle = server_handle(&sql, id);
            closed.extend(cache.insert(&sql, &handle, 1));
            assert_eq!(cache.release(&handle, 1), None);
            assert!(cache.len() <= cap);
        }

        assert_eq!(cache.len(), cap);
        assert_eq!(closed, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_referenced_entry_survives_eviction() {
        let mut cache = StatementCache::new(1, true);
        let busy = server_handle("SELECT 1", 1);
        cache.insert("SELECT 1", &busy, 1);

        let next = server_handle("SELECT 2", 2);
        let closed = cache.insert("SELECT 2", &next, 1);
        assert!(closed.is_empty());
        assert_eq!(cache.len(), 2);

        // Releasing the busy one makes it evictable on the next insertion.
        assert_eq!(cache.release(&busy, 1), None);
        assert_eq!(cache.release(&next, 1), None);
        let third = server_handle("SELECT 3", 3);
        let closed = cache.insert("SELECT 3", &third, 1);
        assert_eq!(closed, vec![1, 2]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evicted_in_use_closes_on_release() {
        let mut cache = StatementCache::new(1, true);
        let first = server_handle("SELECT 1", 7);
        cache.insert("SELECT 1", &first, 1);
        // Re-inserting the same key replaces and evicts the referenced entry.
        let replacement = server_handle("SELECT 1", 9);
        assert!(cache.insert("SELECT 1", &replacement, 1).is_empty());
        assert!(first.is_evicted());
        assert_eq!(cache.release(&first, 1), Some(7));
        assert!(first.is_closed());
        assert_eq!(cache.release(&first, 1), None);
    }

    #[test]
    fn test_stale_generation_is_never_closed() {
        let mut cache = StatementCache::new(0, true);
        let handle = server_handle("SELECT 1", 5);
        cache.insert("SELECT 1", &handle, 2);
        assert!(handle.is_evicted());
        assert_eq!(cache.release(&handle, 2), None);
        assert!(handle.is_closed());
    }

    #[test]
    fn test_fall_back_is_permanent() {
        let handle = server_handle("SELECT ?", 3);
        assert_eq!(handle.server_id(1), Some(3));
        handle.fall_back();
        assert!(handle.is_client_side());
        assert_eq!(handle.server_id(1), None);
        assert_eq!(handle.statement_id(), None);
    }

    #[test]
    fn test_client_handle_counts_placeholders() {
        let handle = PreparedStatementHandle::client("INSERT INTO t VALUES (?, '?', ?)");
        assert!(handle.is_client_side());
        assert_eq!(handle.param_count(), 2);
    }
}
