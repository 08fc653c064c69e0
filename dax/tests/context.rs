use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dax::{
    Backend, BoxError, CacheClient, CacheConfig, Connection, DataAccess, DataAccessConfig,
    DaxError, Dispatch, ErrorKind, PoolConfig, RelationalClient, ResultSet, Value,
};

#[derive(Clone, Default)]
struct CountingBackend {
    open: Arc<AtomicUsize>,
}

struct CountingConnection {
    open: Arc<AtomicUsize>,
}

impl Backend for CountingBackend {
    type Connection = CountingConnection;

    fn connect(&self) -> Result<CountingConnection, BoxError> {
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(CountingConnection {
            open: self.open.clone(),
        })
    }
}

impl Drop for CountingConnection {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Connection for CountingConnection {
    fn execute(&mut self, _statement: &str, _params: &[Value]) -> Result<ResultSet, BoxError> {
        Ok(ResultSet {
            columns: vec!["one".to_string()],
            rows: vec![vec![Value::Int(1)]],
            rows_affected: 1,
        })
    }

    fn commit(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

fn context(backend: CountingBackend) -> DataAccess<CountingBackend> {
    let pool = PoolConfig {
        min_idle: 2,
        max_size: 4,
        max_idle: None,
    };
    let relational = RelationalClient::with_backend(backend, pool).expect("relational");
    // No server is needed while the cache pool stays empty.
    let cache = CacheClient::new(CacheConfig {
        port: 1,
        ..CacheConfig::default()
    })
    .expect("cache");
    DataAccess::from_parts(relational, cache)
}

#[test]
fn clients_are_reachable_through_the_context() {
    let backend = CountingBackend::default();
    let ctx = context(backend.clone());

    assert_eq!(backend.open.load(Ordering::SeqCst), 2);
    let value = ctx.relational().query_scalar("select 1", &[]).expect("scalar");
    assert_eq!(value, Some(Value::Int(1)));
    assert_eq!(ctx.cache().status().total, 0);
}

#[test]
fn shutdown_closes_both_pools() {
    let backend = CountingBackend::default();
    let ctx = context(backend.clone());
    let relational = ctx.relational().clone();
    let cache = ctx.cache().get_connection();

    ctx.shutdown();

    assert_eq!(backend.open.load(Ordering::SeqCst), 0);
    let err = relational.query_one("select 1", &[]).unwrap_err();
    assert!(matches!(err, DaxError::PoolClosed));
    assert_eq!(err.kind(), ErrorKind::Connection);
    let err = cache.call("PING", &[]).unwrap_err();
    assert!(matches!(err, DaxError::PoolClosed));
}

#[test]
fn config_deserializes_with_defaults() {
    let config: DataAccessConfig = serde_json::from_str(
        r#"{
            "relational": {"host": "db.internal", "min_pool_size": 1, "max_pool_size": 8},
            "cache": {"db": 2, "password": "secret", "decode_responses": false}
        }"#,
    )
    .expect("config");

    assert_eq!(config.relational.host, "db.internal");
    assert_eq!(config.relational.port, 5432);
    let pool = config.relational.validate().expect("relational pool");
    assert_eq!((pool.min_idle, pool.max_size), (1, 8));

    assert_eq!(config.cache.host, "127.0.0.1");
    assert_eq!(config.cache.port, 6379);
    assert_eq!(config.cache.db, 2);
    assert_eq!(config.cache.password.as_deref(), Some("secret"));
    assert!(!config.cache.decode_responses);
}

#[test]
fn negative_pool_size_is_rejected() {
    let config: DataAccessConfig =
        serde_json::from_str(r#"{"relational": {"min_pool_size": -1}}"#).expect("config");
    let err = config.relational.validate().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
