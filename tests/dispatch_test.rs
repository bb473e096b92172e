// End-to-end checks through the command dispatcher, the way a connection
// drives it: one CommandEnvelope in, a buffer of responses out.
use myrustql::core::{Privileges, ThrottleKind};
use myrustql::network::constants::status;
use myrustql::network::{Command, CommandEnvelope, Response, ResponseBuffer};
use myrustql::session::KillState;
use myrustql::transaction::MdlDuration;
use myrustql::{Dispatcher, Flow, ServerConfig, ServerError, ServerInstance, Session};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn session_for(instance: &ServerInstance, user: &str) -> Session {
    let mut s = instance
        .open_session(
            instance.users.get(user).unwrap(),
            "localhost",
            myrustql::network::constants::capability::SERVER_DEFAULT,
        )
        .unwrap();
    s.set_db(Some("test".to_string()));
    s
}

fn command(instance: &ServerInstance, s: &mut Session, cmd: Command, payload: &[u8]) -> (Flow, Vec<Response>) {
    let mut out = ResponseBuffer::new();
    let envelope = CommandEnvelope::from_command(cmd, payload.to_vec());
    let flow = Dispatcher::new(instance).dispatch(s, &envelope, &mut out);
    (flow, out.take())
}

fn query(instance: &ServerInstance, s: &mut Session, sql: &str) -> Vec<Response> {
    command(instance, s, Command::Query, sql.as_bytes()).1
}

fn rows(instance: &ServerInstance, s: &mut Session, sql: &str) -> usize {
    query(instance, s, sql)
        .iter()
        .find_map(Response::result_set)
        .map_or(0, |rs| rs.row_count())
}

#[test]
fn test_finalize_runs_once_per_command() {
    let instance = ServerInstance::new(ServerConfig::default());
    let mut s = session_for(&instance, "root");
    let commands: [(Command, &[u8]); 6] = [
        (Command::Query, b"SELECT 1; SELECT 2"),
        (Command::Query, b"NOT SQL"),
        (Command::Ping, b""),
        (Command::InitDb, b"missing_db"),
        (Command::StmtSendLongData, b"\x09\x00\x00\x00\x00\x00data"),
        (Command::Daemon, b""),
    ];
    for (i, (cmd, payload)) in commands.into_iter().enumerate() {
        command(&instance, &mut s, cmd, payload);
        assert_eq!(s.finalized_commands(), i as u64 + 1, "after {cmd:?}");
    }
    assert_eq!(s.mdl().count(MdlDuration::Statement), 0);
}

#[test]
fn test_batch_stops_at_failing_statement() {
    let instance = ServerInstance::new(ServerConfig::default());
    let mut s = session_for(&instance, "root");
    let responses = query(&instance, &mut s, "SELECT 1; BAD SYNTAX; SELECT 2");
    assert_eq!(responses.len(), 2);
    assert!(matches!(
        &responses[0],
        Response::ResultSet { status: flags, .. } if flags & status::MORE_RESULTS_EXISTS != 0
    ));
    assert_eq!(responses[1].error_code(), Some(1064));
    assert_eq!(s.finalized_commands(), 1);
}

#[test]
fn test_zero_length_packet_is_unknown_command() {
    let instance = ServerInstance::new(ServerConfig::default());
    let mut s = session_for(&instance, "root");
    let mut out = ResponseBuffer::new();
    let envelope = CommandEnvelope::from_packet(bytes::Bytes::new());
    let flow = Dispatcher::new(&instance).dispatch(&mut s, &envelope, &mut out);
    assert_eq!(flow, Flow::Continue);
    assert_eq!(out.responses()[0].error_code(), Some(ServerError::UnknownCommand.code()));
    assert_eq!(s.finalized_commands(), 1);
}

#[test]
fn test_commit_boundary_releases_transactional_locks() {
    let instance = ServerInstance::new(ServerConfig::default());
    let mut s = session_for(&instance, "root");
    query(&instance, &mut s, "CREATE TABLE t1 (a)");
    query(&instance, &mut s, "BEGIN");
    query(&instance, &mut s, "SELECT * FROM t1");
    assert!(s.transaction().is_explicit());
    assert_eq!(s.mdl().count(MdlDuration::Transaction), 1);

    let responses = query(&instance, &mut s, "CREATE TABLE t2 (b)");
    assert!(responses[0].is_ok());
    assert!(!s.transaction().is_explicit());
    assert_eq!(s.mdl().count(MdlDuration::Transaction), 0);
}

#[test]
fn test_set_autocommit_only_acts_on_change() {
    let instance = ServerInstance::new(ServerConfig::default());
    let mut s = session_for(&instance, "root");
    query(&instance, &mut s, "CREATE TABLE t1 (a)");
    query(&instance, &mut s, "SET autocommit = 0");
    query(&instance, &mut s, "INSERT INTO t1 VALUES (1)");

    // repeating the current value leaves the open transaction alone
    let responses = query(&instance, &mut s, "SET autocommit = 0");
    let flags = responses[0].status().unwrap();
    assert_eq!(flags & (status::IN_TRANS | status::AUTOCOMMIT), status::IN_TRANS);

    let responses = query(&instance, &mut s, "SET autocommit = 1");
    let flags = responses[0].status().unwrap();
    assert_eq!(flags & (status::IN_TRANS | status::AUTOCOMMIT), status::AUTOCOMMIT);

    let mut other = session_for(&instance, "root");
    assert_eq!(rows(&instance, &mut other, "SELECT * FROM t1"), 1);
}

#[test]
fn test_session_read_only_round_trip() {
    let instance = ServerInstance::new(ServerConfig::default());
    let mut s = session_for(&instance, "root");
    query(&instance, &mut s, "CREATE TABLE t1 (a)");

    query(&instance, &mut s, "SET SESSION transaction_read_only = 1");
    assert!(s.transaction().session_read_only());
    assert!(s.variables().get_bool("transaction_read_only"));
    let responses = query(&instance, &mut s, "INSERT INTO t1 VALUES (1)");
    assert_eq!(responses[0].error_code(), Some(ServerError::ReadOnlyTransaction.code()));

    query(&instance, &mut s, "SET SESSION transaction_read_only = 0");
    assert!(!s.transaction().session_read_only());
    assert!(query(&instance, &mut s, "INSERT INTO t1 VALUES (1)")[0].is_ok());
}

#[test]
fn test_global_read_only_spares_temporary_tables() {
    let instance = ServerInstance::new(ServerConfig::default());
    instance.users.create_user("app", "", Privileges::NONE).unwrap();
    instance.users.grant("app", Privileges::DB_ALL, Some("test")).unwrap();
    let mut root = session_for(&instance, "root");
    let mut app = session_for(&instance, "app");
    query(&instance, &mut app, "CREATE TABLE t1 (a)");
    query(&instance, &mut app, "CREATE TEMPORARY TABLE scratch (a)");
    query(&instance, &mut root, "SET GLOBAL read_only = 1");

    let responses = query(&instance, &mut app, "INSERT INTO t1 VALUES (1)");
    assert_eq!(responses[0].error_code(), Some(1290));
    assert!(query(&instance, &mut app, "INSERT INTO scratch VALUES (1)")[0].is_ok());
    assert!(query(&instance, &mut root, "INSERT INTO t1 VALUES (1)")[0].is_ok());
}

#[test]
fn test_kill_query_stops_batch() {
    let instance = Arc::new(ServerInstance::new(ServerConfig::default()));
    let mut victim = session_for(&instance, "root");
    let mut admin = session_for(&instance, "root");
    query(&instance, &mut victim, "CREATE TABLE t1 (a)");
    let id = victim.id();

    let worker = {
        let instance = Arc::clone(&instance);
        thread::spawn(move || {
            let out = command(
                &instance,
                &mut victim,
                Command::Query,
                b"SELECT SLEEP(5); INSERT INTO t1 VALUES (1)",
            );
            (victim, out)
        })
    };
    thread::sleep(Duration::from_millis(200));
    let kill = format!("KILL QUERY {id}");
    assert!(query(&instance, &mut admin, &kill)[0].is_ok());

    let (mut victim, (flow, responses)) = worker.join().unwrap();
    assert_eq!(flow, Flow::Continue);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].error_code(), Some(ServerError::QueryInterrupted.code()));
    assert_eq!(rows(&instance, &mut admin, "SELECT * FROM t1"), 0);

    // a query kill does not outlive its command
    assert!(query(&instance, &mut victim, "INSERT INTO t1 VALUES (2)")[0].is_ok());

    instance.registry.kill(id, KillState::ConnectionKilled).unwrap();
    let (flow, responses) = command(&instance, &mut victim, Command::Query, b"SELECT 1");
    assert_eq!(flow, Flow::Terminate);
    assert!(responses.is_empty());
}

#[test]
fn test_write_ceiling_throttles_and_super_bypasses() {
    let mut config = ServerConfig::default();
    config.limits.max_running_writes = 1;
    let instance = ServerInstance::new(config);
    instance.users.create_user("app", "", Privileges::NONE).unwrap();
    instance.users.grant("app", Privileges::DB_ALL, Some("test")).unwrap();
    let mut app = session_for(&instance, "app");
    let mut root = session_for(&instance, "root");
    query(&instance, &mut app, "CREATE TABLE t1 (a)");

    let held = instance.admission.try_admit(ThrottleKind::Write).unwrap();
    let responses = query(&instance, &mut app, "INSERT INTO t1 VALUES (1)");
    assert_eq!(responses[0].error_code(), Some(myrustql::core::ER_QUERY_THROTTLED));
    assert!(query(&instance, &mut app, "SELECT * FROM t1")[0].result_set().is_some());
    assert!(query(&instance, &mut root, "INSERT INTO t1 VALUES (1)")[0].is_ok());
    assert_eq!(instance.admission.rejected(ThrottleKind::Write), 1);

    drop(held);
    assert!(query(&instance, &mut app, "INSERT INTO t1 VALUES (2)")[0].is_ok());
}

#[test]
fn test_deadlock_victim_loses_whole_transaction() {
    let instance = Arc::new(ServerInstance::new(ServerConfig::default()));
    let mut a = session_for(&instance, "root");
    let mut b = session_for(&instance, "root");
    query(&instance, &mut a, "CREATE TABLE t1 (a)");
    query(&instance, &mut a, "CREATE TABLE t2 (a)");
    query(&instance, &mut a, "SET lock_wait_timeout = 10");
    query(&instance, &mut b, "SET lock_wait_timeout = 10");

    query(&instance, &mut a, "BEGIN");
    query(&instance, &mut a, "INSERT INTO t1 VALUES (1)");
    query(&instance, &mut b, "BEGIN");
    query(&instance, &mut b, "INSERT INTO t2 VALUES (1)");

    let waiter = {
        let instance = Arc::clone(&instance);
        thread::spawn(move || {
            let responses = query(&instance, &mut a, "INSERT INTO t2 VALUES (2)");
            query(&instance, &mut a, "COMMIT");
            responses
        })
    };
    thread::sleep(Duration::from_millis(200));

    let responses = query(&instance, &mut b, "INSERT INTO t1 VALUES (2)");
    assert_eq!(responses[0].error_code(), Some(ServerError::Deadlock.code()));
    assert!(!b.transaction().is_explicit());

    let waited = waiter.join().unwrap();
    assert!(waited[0].is_ok(), "{waited:?}");
    assert_eq!(rows(&instance, &mut b, "SELECT * FROM t1"), 1);
    assert_eq!(rows(&instance, &mut b, "SELECT * FROM t2"), 1);
}
