//! Prepared statements, batches, timeouts and abort against the fake server.

mod support;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dbwire_client::{Client, Command, Completion, Connection, Error, HaMode, Value};
use dbwire_core::error::QueryErrorKind;

use support::{FakeServer, NO_PREPARE};

fn rows(client: &mut Client, command: &Command) -> Vec<i64> {
    let completion = client.execute(command, true).unwrap();
    let Completion::Query(result) = completion else {
        panic!("expected a result set, got {completion:?}");
    };
    result
        .into_rows()
        .iter()
        .map(|row| row.get_as::<i64>(0).unwrap())
        .collect()
}

#[test]
fn rejected_prepare_falls_back_to_client_side_once() {
    let server = FakeServer::start();
    let mut client = Client::connect(server.config()).unwrap();

    let sql = format!("INSERT INTO t VALUES (?) {NO_PREPARE}");
    let statement = client.prepare(&sql).unwrap();
    assert!(statement.is_client_side());
    assert_eq!(statement.param_count(), 1);

    for value in [5, 6] {
        let done = client
            .execute(&Command::execute(&statement, vec![Value::BigInt(value)]), true)
            .unwrap();
        assert_eq!(done.update_count(), 1);
    }
    assert_eq!(server.prepare_attempts(), 1);
    assert_eq!(server.table("t"), vec![5, 6]);
}

#[test]
fn statement_is_reprepared_on_new_session() {
    let server = FakeServer::start();
    let mut client = Client::connect(server.config().ha_mode(HaMode::Sequential)).unwrap();

    let statement = client.prepare("INSERT INTO t VALUES (?)").unwrap();
    assert!(!statement.is_client_side());
    client
        .execute(&Command::execute(&statement, vec![Value::Int(1)]), true)
        .unwrap();

    server.drop_connections();
    client
        .execute(&Command::execute(&statement, vec![Value::Int(2)]), true)
        .unwrap();

    assert_eq!(server.prepare_attempts(), 2);
    assert!(!statement.is_client_side());
    assert_eq!(server.table("t"), vec![1, 2]);
}

#[test]
fn prepared_select_decodes_binary_rows() {
    let server = FakeServer::start();
    let mut client = Client::connect(server.config()).unwrap();
    client
        .execute_batch(&[
            Command::query("INSERT INTO t VALUES (10)"),
            Command::query("INSERT INTO t VALUES (-20)"),
        ])
        .unwrap();

    let statement = client.prepare("SELECT v FROM t").unwrap();
    assert_eq!(
        rows(&mut client, &Command::execute(&statement, Vec::new())),
        vec![10, -20]
    );

    // Same SQL hits the cache
    let again = client.prepare("SELECT  v  FROM t").unwrap();
    assert!(Arc::ptr_eq(&statement, &again));
    assert_eq!(server.prepare_attempts(), 1);
}

#[test]
fn cache_bound_closes_evicted_statements() {
    let server = FakeServer::start();
    let mut client = Client::connect(server.config().prep_stmt_cache_size(2)).unwrap();

    for table in ["a", "b", "c"] {
        let statement = client
            .prepare(&format!("INSERT INTO {table} VALUES (?)"))
            .unwrap();
        client
            .execute(&Command::execute(&statement, vec![Value::Int(1)]), true)
            .unwrap();
        client.close_statement(&statement);
    }
    assert_eq!(client.statement_cache().len(), 2);
    assert!(!client.statement_cache().contains("INSERT INTO a VALUES (?)"));

    // The close travels in front of the next command
    client.execute(&Command::query("SELECT 1"), true).unwrap();
    assert_eq!(server.statement_closes(), 1);
}

#[test]
fn pipelined_batch_reports_counts_up_to_failure() {
    let server = FakeServer::start();
    let mut client = Client::connect(server.config()).unwrap();

    let batch = [
        Command::query("INSERT INTO t VALUES (1)"),
        Command::query("INSERT INTO t VALUES (oops)"),
        Command::query("INSERT INTO t VALUES (3)"),
    ];
    match client.execute_batch(&batch) {
        Err(Error::Batch(b)) => {
            assert_eq!(b.update_counts, vec![1]);
            assert_eq!(b.cause.code(), Some(1064));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    // Every pipelined item reached the server
    assert_eq!(server.table("t"), vec![1, 3]);
    assert!(!client.is_closed());
}

#[test]
fn sequential_batch_stops_at_failure() {
    let server = FakeServer::start();
    let mut client = Client::connect(server.config().use_pipeline(false)).unwrap();

    let batch = [
        Command::query("INSERT INTO t VALUES (1), (2)"),
        Command::query("INSERT INTO t VALUES (oops)"),
        Command::query("INSERT INTO t VALUES (3)"),
    ];
    match client.execute_batch(&batch) {
        Err(Error::Batch(b)) => assert_eq!(b.update_counts, vec![2]),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(server.table("t"), vec![1, 2]);
}

#[test]
fn batch_replays_transaction_and_resumes() {
    let server = FakeServer::start();
    let mut client = Client::connect(server.config().transaction_replay(true)).unwrap();

    client.execute(&Command::query("BEGIN"), true).unwrap();
    client
        .execute(&Command::query("INSERT INTO t VALUES (1)"), true)
        .unwrap();
    server.drop_connections();

    let counts = client
        .execute_batch(&[
            Command::query("INSERT INTO t VALUES (2)"),
            Command::query("INSERT INTO t VALUES (3)"),
        ])
        .unwrap();
    assert_eq!(counts, vec![1, 1]);
    client.execute(&Command::query("COMMIT"), true).unwrap();
    assert_eq!(server.table("t"), vec![1, 2, 3]);
}

#[test]
fn multi_statement_results_arrive_in_order() {
    let server = FakeServer::start();
    let mut client = Client::connect(server.config().allow_multi_queries(true)).unwrap();

    let sql = "INSERT INTO t VALUES (1), (2); SELECT v FROM t; INSERT INTO t VALUES (3)";
    let first = client.execute(&Command::query(sql), true).unwrap();
    assert_eq!(first.update_count(), 2);
    assert!(client.get_context().more_results());

    let Some(Completion::Query(result)) = client.next_result().unwrap() else {
        panic!("expected a result set");
    };
    let values: Vec<i64> = result
        .into_rows()
        .iter()
        .map(|row| row.get_as::<i64>(0).unwrap())
        .collect();
    assert_eq!(values, vec![1, 2]);

    let third = client.next_result().unwrap().expect("third result");
    assert_eq!(third.update_count(), 1);
    assert!(client.next_result().unwrap().is_none());
    assert!(!client.get_context().more_results());
    assert_eq!(server.table("t"), vec![1, 2, 3]);
}

#[test]
fn unread_results_are_discarded_by_next_command() {
    let server = FakeServer::start();
    let mut client = Client::connect(server.config().allow_multi_queries(true)).unwrap();

    client
        .execute(
            &Command::query("INSERT INTO t VALUES (1); INSERT INTO t VALUES (2)"),
            true,
        )
        .unwrap();
    assert_eq!(rows(&mut client, &Command::query("SELECT 1")), vec![1]);
    assert_eq!(server.table("t"), vec![1, 2]);
}

#[test]
fn query_timeout_kills_long_query() {
    let server = FakeServer::start();
    let config = server
        .config()
        .query_timeout(Some(Duration::from_millis(200)));
    let conn = Connection::connect(config).unwrap();

    let started = Instant::now();
    match conn.query("SELECT SLEEP(5)") {
        Err(Error::Query(q)) => {
            assert_eq!(q.kind, QueryErrorKind::Timeout);
            assert!(q.message.contains("200 ms"), "{}", q.message);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(4));

    // The session survives the kill
    let rows = conn.query("SELECT 1").unwrap();
    assert_eq!(rows[0].get_as::<i64>(0).unwrap(), 1);
    assert!(!conn.is_closed());
}

#[test]
fn abort_interrupts_blocked_command() {
    let server = FakeServer::start();
    let conn = Connection::connect(server.config()).unwrap();

    let worker = {
        let conn = conn.clone();
        thread::spawn(move || conn.query("SELECT SLEEP(5)"))
    };
    thread::sleep(Duration::from_millis(150));
    let started = Instant::now();
    conn.abort();

    let result = worker.join().unwrap();
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(conn.is_closed());
}

#[test]
fn streaming_result_is_fetched_in_batches() {
    let server = FakeServer::start();
    let mut client = Client::connect(server.config().fetch_size(2)).unwrap();
    client
        .execute(&Command::query("INSERT INTO t VALUES (1), (2), (3), (4), (5)"), true)
        .unwrap();

    let Completion::Query(result) = client
        .execute(&Command::query("SELECT v FROM t"), true)
        .unwrap()
    else {
        panic!("expected a result set");
    };
    assert_eq!(result.buffered(), 2);
    assert!(!result.is_complete());

    let mut seen = result.drain_buffered().len();
    while client.fetch_more(&result).unwrap() {
        seen += result.drain_buffered().len();
    }
    seen += result.drain_buffered().len();
    assert_eq!(seen, 5);
    assert!(result.is_complete());

    // The next command still works after a fully read stream
    client.execute(&Command::query("SELECT 1"), true).unwrap();
}

#[test]
fn unread_stream_is_buffered_before_next_command() {
    let server = FakeServer::start();
    let mut client = Client::connect(server.config().fetch_size(1)).unwrap();
    client
        .execute(&Command::query("INSERT INTO t VALUES (1), (2), (3)"), true)
        .unwrap();

    let Completion::Query(result) = client
        .execute(&Command::query("SELECT v FROM t"), true)
        .unwrap()
    else {
        panic!("expected a result set");
    };
    client.execute(&Command::query("SELECT 1"), true).unwrap();

    assert!(result.is_complete());
    let values: Vec<i64> = result
        .drain_buffered()
        .iter()
        .map(|row| row.get_as::<i64>(0).unwrap())
        .collect();
    assert_eq!(values, vec![1, 2, 3]);
}
