use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use dax_relational::{
    params, Backend, BoxError, Connection, DaxError, ErrorKind, PoolConfig, RelationalClient,
    ResultSet, Value,
};

const INSERT: &str = "insert into t(x) values(%s)";
const INSERT_RETURNING: &str = "insert into t(x) values(%s) returning id";
const SELECT_ALL: &str = "select id, x from t order by id";
const SELECT_BY_X: &str = "select id, x from t where x = %s";
const COUNT: &str = "select count(*) from t";
const SLEEP: &str = "select pg_sleep(%s)";
const CRASH: &str = "select crash()";

#[derive(Debug, PartialEq)]
enum MemoryError {
    UniqueViolation(i64),
    Syntax(String),
    ConnectionLost,
    SerializationFailure,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::UniqueViolation(x) => write!(f, "duplicate key value x={}", x),
            MemoryError::Syntax(sql) => write!(f, "syntax error in `{}`", sql),
            MemoryError::ConnectionLost => write!(f, "connection lost"),
            MemoryError::SerializationFailure => {
                write!(f, "could not serialize access due to concurrent update")
            }
        }
    }
}

impl std::error::Error for MemoryError {}

#[derive(Default)]
struct Shared {
    connects: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    resets: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    next_id: AtomicI64,
    fail_connect: AtomicBool,
    fail_commit: AtomicBool,
    table: Mutex<Vec<(i64, i64)>>,
}

impl Shared {
    fn count(&self, counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Single-table backend with a unique constraint on `x`. Writes become
/// visible on commit.
#[derive(Clone, Default)]
struct MemoryBackend {
    shared: Arc<Shared>,
}

struct MemoryConnection {
    shared: Arc<Shared>,
    pending: Vec<(i64, i64)>,
    broken: bool,
}

impl Backend for MemoryBackend {
    type Connection = MemoryConnection;

    fn connect(&self) -> Result<MemoryConnection, BoxError> {
        if self.shared.fail_connect.load(Ordering::SeqCst) {
            return Err(MemoryError::ConnectionLost.into());
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            shared: self.shared.clone(),
            pending: Vec::new(),
            broken: false,
        })
    }
}

impl MemoryConnection {
    fn run(&mut self, statement: &str, params: &[Value]) -> Result<ResultSet, MemoryError> {
        match statement {
            INSERT | INSERT_RETURNING => {
                let x = first_int(statement, params)?;
                {
                    let table = self.shared.table.lock().expect("table");
                    if table.iter().chain(self.pending.iter()).any(|(_, v)| *v == x) {
                        return Err(MemoryError::UniqueViolation(x));
                    }
                }
                let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                self.pending.push((id, x));
                if statement == INSERT_RETURNING {
                    Ok(ResultSet {
                        columns: vec!["id".to_string()],
                        rows: vec![vec![Value::Int(id)]],
                        rows_affected: 1,
                    })
                } else {
                    Ok(ResultSet {
                        rows_affected: 1,
                        ..ResultSet::default()
                    })
                }
            }
            SELECT_ALL | SELECT_BY_X => {
                let filter = if statement == SELECT_BY_X {
                    Some(first_int(statement, params)?)
                } else {
                    None
                };
                let table = self.shared.table.lock().expect("table");
                let rows: Vec<Vec<Value>> = table
                    .iter()
                    .filter(|(_, x)| filter.map_or(true, |want| *x == want))
                    .map(|(id, x)| vec![Value::Int(*id), Value::Int(*x)])
                    .collect();
                Ok(ResultSet {
                    columns: vec!["id".to_string(), "x".to_string()],
                    rows_affected: rows.len() as u64,
                    rows,
                })
            }
            COUNT => {
                let count = self.shared.table.lock().expect("table").len() as i64;
                Ok(ResultSet {
                    columns: vec!["count".to_string()],
                    rows: vec![vec![Value::Int(count)]],
                    rows_affected: 1,
                })
            }
            SLEEP => {
                let millis = first_int(statement, params)?;
                thread::sleep(Duration::from_millis(millis as u64));
                Ok(ResultSet {
                    columns: vec!["pg_sleep".to_string()],
                    rows: vec![vec![Value::Null]],
                    rows_affected: 1,
                })
            }
            CRASH => {
                self.broken = true;
                Err(MemoryError::ConnectionLost)
            }
            other => Err(MemoryError::Syntax(other.to_string())),
        }
    }
}

fn first_int(statement: &str, params: &[Value]) -> Result<i64, MemoryError> {
    params
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| MemoryError::Syntax(statement.to_string()))
}

impl Connection for MemoryConnection {
    fn execute(&mut self, statement: &str, params: &[Value]) -> Result<ResultSet, BoxError> {
        let now = self.shared.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.peak_active.fetch_max(now, Ordering::SeqCst);
        let result = self.run(statement, params);
        self.shared.active.fetch_sub(1, Ordering::SeqCst);
        result.map_err(Into::into)
    }

    fn commit(&mut self) -> Result<(), BoxError> {
        if self.broken {
            return Err(MemoryError::ConnectionLost.into());
        }
        if self.shared.fail_commit.load(Ordering::SeqCst) {
            return Err(MemoryError::SerializationFailure.into());
        }
        self.shared.commits.fetch_add(1, Ordering::SeqCst);
        let mut table = self.shared.table.lock().expect("table");
        table.append(&mut self.pending);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), BoxError> {
        if self.broken {
            return Err(MemoryError::ConnectionLost.into());
        }
        self.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.pending.clear();
        Ok(())
    }

    fn reset(&mut self) -> Result<(), BoxError> {
        self.shared.resets.fetch_add(1, Ordering::SeqCst);
        self.pending.clear();
        Ok(())
    }

    fn is_broken(&mut self) -> bool {
        self.broken
    }
}

fn client_with(min_idle: usize, max_size: usize) -> (RelationalClient<MemoryBackend>, Arc<Shared>) {
    let backend = MemoryBackend::default();
    let shared = backend.shared.clone();
    let config = PoolConfig {
        min_idle,
        max_size,
        max_idle: None,
    };
    let client = RelationalClient::with_backend(backend, config).expect("client");
    (client, shared)
}

fn memory_error(err: &DaxError) -> &MemoryError {
    err.backend_error()
        .and_then(|e| e.downcast_ref::<MemoryError>())
        .expect("memory backend error")
}

#[test]
fn execute_commits_once_and_releases_once() {
    let (client, shared) = client_with(0, 2);

    assert!(client.execute(INSERT, &params![7]).expect("execute"));

    assert_eq!(shared.count(&shared.commits), 1);
    assert_eq!(shared.count(&shared.rollbacks), 0);
    assert_eq!(shared.count(&shared.resets), 1);
    let status = client.status();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.idle, 1);
}

#[test]
fn failed_execute_rolls_back_and_returns_original_error() {
    let (client, shared) = client_with(0, 1);
    client.execute(INSERT, &params![5]).expect("first insert");

    let err = client.execute(INSERT, &params![5]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Query);
    assert_eq!(memory_error(&err), &MemoryError::UniqueViolation(5));

    assert_eq!(shared.count(&shared.commits), 1);
    assert_eq!(shared.count(&shared.rollbacks), 1);
    assert_eq!(shared.count(&shared.resets), 2);
    assert_eq!(client.status().in_use, 0);

    // The single pooled connection is still usable.
    assert!(client.execute(INSERT, &params![6]).expect("after failure"));
    assert_eq!(shared.count(&shared.commits), 2);
    assert_eq!(shared.count(&shared.connects), 1);
}

#[test]
fn failed_commit_returns_error_and_releases_connection() {
    let (client, shared) = client_with(0, 1);
    shared.fail_commit.store(true, Ordering::SeqCst);

    let err = client.execute(INSERT, &params![9]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Query);
    assert_eq!(memory_error(&err), &MemoryError::SerializationFailure);
    assert_eq!(shared.count(&shared.commits), 0);
    // The statement itself succeeded, so no explicit rollback is issued;
    // the reset on return discards the pending row.
    assert_eq!(shared.count(&shared.rollbacks), 0);
    assert_eq!(shared.count(&shared.resets), 1);
    assert_eq!(client.status().in_use, 0);

    shared.fail_commit.store(false, Ordering::SeqCst);
    let count = client.query_scalar(COUNT, &[]).expect("count");
    assert_eq!(count, Some(Value::Int(0)));

    assert!(client.execute(INSERT, &params![9]).expect("retry"));
    assert_eq!(shared.count(&shared.commits), 1);
    assert_eq!(shared.count(&shared.connects), 1);
}

#[test]
fn execute_returning_yields_generated_id() {
    let (client, shared) = client_with(0, 1);

    let row = client
        .execute_returning(INSERT_RETURNING, &params![5])
        .expect("execute_returning")
        .expect("row");
    assert_eq!(row.get("id"), Some(&Value::Int(1)));
    assert_eq!(row.len(), 1);
    assert_eq!(shared.count(&shared.commits), 1);

    let stored = client
        .query_one(SELECT_BY_X, &params![5])
        .expect("query")
        .expect("stored row");
    assert_eq!(stored.get("id"), Some(&Value::Int(1)));
}

#[test]
fn execute_returning_failure_rolls_back() {
    let (client, shared) = client_with(0, 1);
    client.execute(INSERT, &params![1]).expect("seed");

    let err = client.execute_returning(INSERT_RETURNING, &params![1]).unwrap_err();
    assert_eq!(memory_error(&err), &MemoryError::UniqueViolation(1));
    assert_eq!(shared.count(&shared.rollbacks), 1);
    assert_eq!(client.status().in_use, 0);
}

#[test]
fn query_one_without_match_returns_none() {
    let (client, _shared) = client_with(0, 1);
    let row = client.query_one(SELECT_BY_X, &params![42]).expect("query");
    assert!(row.is_none());
}

#[test]
fn query_all_keeps_backend_order_and_count() {
    let (client, shared) = client_with(0, 2);
    for x in [30, 10, 20] {
        client.execute(INSERT, &params![x]).expect("insert");
    }

    let rows = client.query_all(SELECT_ALL, &[]).expect("query_all");
    assert_eq!(rows.len(), 3);
    let xs: Vec<i64> = rows
        .iter()
        .map(|row| row.get("x").and_then(Value::as_i64).expect("x"))
        .collect();
    assert_eq!(xs, [30, 10, 20]);
    let columns: Vec<&str> = rows[0].columns().collect();
    assert_eq!(columns, ["id", "x"]);

    // Reads never commit; their connection is reset on return.
    assert_eq!(shared.count(&shared.commits), 3);
    assert_eq!(shared.count(&shared.resets), 4);
}

#[test]
fn query_scalar_returns_first_column() {
    let (client, _shared) = client_with(0, 1);
    client.execute(INSERT, &params![1]).expect("insert");
    client.execute(INSERT, &params![2]).expect("insert");

    let count = client.query_scalar(COUNT, &[]).expect("scalar");
    assert_eq!(count, Some(Value::Int(2)));
}

#[test]
fn failed_read_releases_connection() {
    let (client, shared) = client_with(0, 1);
    let err = client.query_all("select nonsense", &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Query);
    assert!(matches!(memory_error(&err), MemoryError::Syntax(_)));
    assert_eq!(client.status().in_use, 0);
    assert_eq!(shared.count(&shared.resets), 1);
    assert_eq!(shared.count(&shared.rollbacks), 0);
}

#[test]
fn second_execute_waits_for_single_connection() {
    let (client, shared) = client_with(0, 1);

    let first = {
        let client = client.clone();
        thread::spawn(move || client.execute(SLEEP, &params![200]))
    };
    thread::sleep(Duration::from_millis(40));

    let started = Instant::now();
    let second = client.execute(INSERT, &params![9]).expect("second execute");
    let waited = started.elapsed();

    assert!(first.join().expect("join").expect("first execute"));
    assert!(second);
    assert!(waited >= Duration::from_millis(100), "waited {:?}", waited);
    assert_eq!(shared.count(&shared.commits), 2);
    assert_eq!(shared.count(&shared.connects), 1);
    assert_eq!(shared.count(&shared.peak_active), 1);
}

#[test]
fn concurrent_executes_respect_pool_maximum() {
    let (client, shared) = client_with(0, 2);

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let client = client.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    client.execute(SLEEP, &params![2]).expect("execute");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("join");
    }

    assert!(shared.count(&shared.peak_active) <= 2);
    assert!(shared.count(&shared.connects) <= 2);
    assert_eq!(shared.count(&shared.commits), 30);
    assert_eq!(client.status().in_use, 0);
}

#[test]
fn manual_acquire_and_release() {
    let (client, shared) = client_with(0, 1);
    client.execute(INSERT, &params![1]).expect("insert");
    client.execute(INSERT, &params![2]).expect("insert");

    let mut session = client.acquire().expect("acquire");
    assert_eq!(client.status().in_use, 1);

    let count = session.execute(SELECT_ALL, &[]).expect("select");
    assert_eq!(count, 2);
    assert_eq!(session.cursor().description(), ["id", "x"]);
    assert_eq!(session.cursor().rowcount(), Some(2));
    let first = session.cursor().fetch_many(1);
    assert_eq!(first.len(), 1);
    let rest = session.fetch_all();
    assert_eq!(rest.len(), 1);
    assert!(session.fetch_one().is_none());

    client.release(session);
    assert_eq!(client.status().in_use, 0);
    assert_eq!(shared.count(&shared.resets), 3);
}

#[test]
fn uncommitted_session_work_is_discarded_on_release() {
    let (client, _shared) = client_with(0, 1);
    {
        let mut session = client.acquire().expect("acquire");
        session.execute(INSERT, &params![3]).expect("insert");
    }
    let count = client.query_scalar(COUNT, &[]).expect("count");
    assert_eq!(count, Some(Value::Int(0)));
}

#[test]
fn broken_connection_is_not_reused() {
    let (client, shared) = client_with(0, 1);

    let err = client.query_one(CRASH, &[]).unwrap_err();
    assert_eq!(memory_error(&err), &MemoryError::ConnectionLost);
    assert_eq!(client.status().total, 0);

    client.query_one(COUNT, &[]).expect("fresh connection");
    assert_eq!(shared.count(&shared.connects), 2);
}

#[test]
fn minimum_connections_open_at_construction() {
    let (client, shared) = client_with(2, 4);
    assert_eq!(shared.count(&shared.connects), 2);
    assert_eq!(client.status().idle, 2);
}

#[test]
fn unreachable_backend_fails_construction() {
    let backend = MemoryBackend::default();
    backend.shared.fail_connect.store(true, Ordering::SeqCst);
    let config = PoolConfig {
        min_idle: 1,
        max_size: 1,
        max_idle: None,
    };
    let err = RelationalClient::with_backend(backend, config)
        .err()
        .expect("construction fails");
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(memory_error(&err), &MemoryError::ConnectionLost);
}

#[test]
fn close_all_rejects_later_calls() {
    let (client, _shared) = client_with(1, 1);
    client.close_all();
    let err = client.query_one(COUNT, &[]).unwrap_err();
    assert!(matches!(err, DaxError::PoolClosed));
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(client.status().closed);
}

#[cfg(feature = "postgres")]
#[test]
fn postgres_client_rejects_negative_pool_sizes() {
    use dax_relational::RelationalConfig;

    let config = RelationalConfig {
        min_pool_size: -1,
        ..RelationalConfig::default()
    };
    let err = RelationalClient::new(&config).err().expect("invalid sizing");
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
