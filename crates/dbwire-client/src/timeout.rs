//! Query timeout handler.
//!
//! A blocked socket read cannot be interrupted from another thread, so an
//! expired command is stopped from the server side: a worker thread opens a
//! second session to the same host and sends `KILL QUERY <thread id>`. The
//! victim then receives an "interrupted" error (or its normal result, if
//! the kill came too late) and its guard reports the timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use crate::command::Command;
use crate::config::{Configuration, HostAddress};
use crate::engine::ProtocolEngine;
use crate::transport::io_error;
use dbwire_core::{Error, QueryError, QueryErrorKind, Result};

enum Message {
    Arm { id: u64, deadline: Instant, target: KillTarget },
    Disarm { id: u64 },
}

struct KillTarget {
    host: HostAddress,
    thread_id: u32,
    fired: Arc<AtomicBool>,
}

/// Owns the worker thread that kills expired commands.
#[derive(Debug)]
pub struct TimeoutHandler {
    sender: Sender<Message>,
    next_id: AtomicU64,
}

impl TimeoutHandler {
    /// Start the worker. Kill sessions are opened with `config`.
    pub fn start(config: Configuration) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        thread::Builder::new()
            .name("dbwire-timeout".to_string())
            .spawn(move || run_worker(&config, &receiver))
            .map_err(|e| io_error(e, "Failed to start query timeout worker"))?;
        Ok(Self {
            sender,
            next_id: AtomicU64::new(1),
        })
    }

    /// Arm a timer for a command running on `thread_id` at `host`.
    ///
    /// Dropping the guard disarms it.
    pub fn arm(&self, host: &HostAddress, thread_id: u32, timeout: Duration) -> TimeoutGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let fired = Arc::new(AtomicBool::new(false));
        let armed = self
            .sender
            .send(Message::Arm {
                id,
                deadline: Instant::now() + timeout,
                target: KillTarget {
                    host: host.clone(),
                    thread_id,
                    fired: Arc::clone(&fired),
                },
            })
            .is_ok();
        if !armed {
            tracing::warn!("Query timeout worker is gone, command runs without timeout");
        }
        TimeoutGuard {
            sender: self.sender.clone(),
            id,
            fired,
            timeout,
        }
    }
}

/// A running command's timer.
#[derive(Debug)]
pub struct TimeoutGuard {
    sender: Sender<Message>,
    id: u64,
    fired: Arc<AtomicBool>,
    timeout: Duration,
}

impl TimeoutGuard {
    /// Did the timer expire and send the kill?
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Turn the command's outcome into a timeout error if the timer fired.
    ///
    /// Fatal errors are kept: the session is gone either way.
    pub fn finish<T>(self, result: Result<T>) -> Result<T> {
        if !self.fired() {
            return result;
        }
        match result {
            Err(e) if e.is_fatal() => Err(e),
            _ => Err(timeout_error(self.timeout)),
        }
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Disarm { id: self.id });
    }
}

fn timeout_error(timeout: Duration) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Timeout,
        code: 1317,
        sqlstate: Some("70100".to_string()),
        message: format!(
            "Query execution was interrupted (query timeout of {} ms exceeded)",
            timeout.as_millis()
        ),
        sql: None,
    })
}

fn run_worker(config: &Configuration, receiver: &Receiver<Message>) {
    let mut armed: Vec<(u64, Instant, KillTarget)> = Vec::new();
    loop {
        let next_deadline = armed.iter().map(|(_, deadline, _)| *deadline).min();
        let message = match next_deadline {
            Some(deadline) => {
                receiver.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match message {
            Ok(Message::Arm {
                id,
                deadline,
                target,
            }) => armed.push((id, deadline, target)),
            Ok(Message::Disarm { id }) => armed.retain(|(armed_id, _, _)| *armed_id != id),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }

        let now = Instant::now();
        let (expired, pending): (Vec<_>, Vec<_>) = armed
            .drain(..)
            .partition(|(_, deadline, _)| *deadline <= now);
        armed = pending;
        for (_, _, target) in expired {
            kill(config, &target);
        }
    }
}

fn kill(config: &Configuration, target: &KillTarget) {
    target.fired.store(true, Ordering::SeqCst);
    let result = ProtocolEngine::connect(config, &target.host).and_then(|mut engine| {
        let outcome = engine.execute(&Command::query(format!("KILL QUERY {}", target.thread_id)));
        engine.close();
        outcome
    });
    match result {
        Ok(_) => tracing::info!(
            host = %target.host,
            thread_id = target.thread_id,
            "Killed query after timeout"
        ),
        Err(e) => tracing::warn!(
            host = %target.host,
            thread_id = target.thread_id,
            error = %e,
            "Failed to kill timed out query"
        ),
    }
}
