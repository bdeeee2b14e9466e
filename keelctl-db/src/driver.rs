//! Connection driver: one pool at a time, retry-with-rebuild, and a pinned
//! connection while a transaction is open.
//!
//! Outside a transaction every statement runs under [`RetryPolicy`]. After
//! two consecutive connectivity failures the pool is discarded and replaced
//! (never repaired in place). Concurrent callers that saw the same dead pool
//! share a single rebuild. Inside a transaction statements go straight to the
//! pinned connection and are never retried, since a retry could land on a
//! different connection than the one holding the transaction.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use keelctl_core::{
    Dialect, DialectKind, Error, Operation, ResolvedDatabase, Result, RetryPolicy, Row, Statement,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{Connector, ExecResult, PinnedConnection, PoolHandle};
use crate::mysql::MySqlConnector;
use crate::postgres::PgConnector;

#[derive(Clone)]
struct PoolState {
    pool: Arc<dyn PoolHandle>,
    generation: u64,
}

pub struct Driver {
    name: String,
    connector: Arc<dyn Connector>,
    dialect: Arc<dyn Dialect>,
    policy: RetryPolicy,
    debug_sql: bool,
    command_timeout: Option<Duration>,
    state: RwLock<Option<PoolState>>,
    /// Single-flight guard for pool creation and replacement.
    rebuild_lock: Mutex<()>,
    generation: AtomicU64,
    rebuilds: AtomicU64,
    pinned: Mutex<Option<Box<dyn PinnedConnection>>>,
}

impl Driver {
    pub fn new(name: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        let dialect = connector.kind().dialect();
        Self {
            name: name.into(),
            connector,
            dialect,
            policy: RetryPolicy::default(),
            debug_sql: false,
            command_timeout: None,
            state: RwLock::new(None),
            rebuild_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            rebuilds: AtomicU64::new(0),
            pinned: Mutex::new(None),
        }
    }

    /// Driver for a resolved database entry, backed by sqlx.
    pub fn from_config(config: ResolvedDatabase) -> Self {
        let name = config.name.clone();
        let debug_sql = config.debug_sql;
        let command_timeout = config.pool.command_timeout();
        let connector: Arc<dyn Connector> = match config.kind {
            DialectKind::Mysql => Arc::new(MySqlConnector::new(config)),
            DialectKind::Postgres => Arc::new(PgConnector::new(config)),
        };
        Self::new(name, connector)
            .with_debug_sql(debug_sql)
            .with_command_timeout(command_timeout)
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_debug_sql(mut self, enabled: bool) -> Self {
        self.debug_sql = enabled;
        self
    }

    /// Bound every round-trip. An elapsed bound is a connectivity error, so
    /// outside a transaction it is retried like a dropped connection.
    pub fn with_command_timeout(mut self, limit: Option<Duration>) -> Self {
        self.command_timeout = limit;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DialectKind {
        self.dialect.kind()
    }

    pub fn dialect(&self) -> Arc<dyn Dialect> {
        self.dialect.clone()
    }

    /// Number of times the pool has been replaced after failures.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Option<PoolState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn install_pool(&self) -> Result<PoolState> {
        let pool = self.connector.connect().await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let state = PoolState { pool, generation };
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
        debug!(database = %self.name, generation, "connection pool created");
        Ok(state)
    }

    /// Current pool, created on first use.
    async fn current(&self) -> Result<PoolState> {
        if let Some(state) = self.snapshot() {
            return Ok(state);
        }
        let _guard = self.rebuild_lock.lock().await;
        if let Some(state) = self.snapshot() {
            return Ok(state);
        }
        self.install_pool().await
    }

    /// Replace the pool that the caller saw as `seen`. A no-op when another
    /// caller already replaced it.
    async fn rebuild(&self, seen: u64) -> Result<()> {
        let _guard = self.rebuild_lock.lock().await;
        if let Some(state) = self.snapshot() {
            if state.generation != seen {
                debug!(database = %self.name, generation = state.generation, "pool already rebuilt");
                return Ok(());
            }
        }

        let dead = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        warn!(database = %self.name, generation = seen, "rebuilding connection pool");
        if let Some(dead) = dead {
            tokio::spawn(async move { dead.pool.close().await });
        }

        let state = self.install_pool().await?;
        info!(database = %self.name, generation = state.generation, "connection pool rebuilt");
        Ok(())
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match self.command_timeout {
            None => fut.await,
            Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
                Err(Error::connectivity(format!(
                    "command timed out after {}ms",
                    limit.as_millis()
                )))
            }),
        }
    }

    /// Run `f` against the pool under the retry protocol.
    async fn with_pool<T, F, Fut>(&self, op: Operation, target: &str, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn PoolHandle>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let seen = AtomicU64::new(0);
        let (seen, f) = (&seen, &f);
        self.policy
            .run(
                &self.name,
                |_attempt| async move {
                    let state = self.current().await?;
                    seen.store(state.generation, Ordering::SeqCst);
                    self.bounded(f(state.pool)).await
                },
                || async move { self.rebuild(seen.load(Ordering::SeqCst)).await },
            )
            .await
            .map_err(|e| e.at(op, target))
    }

    fn log_sql(&self, stmt: &Statement) {
        if self.debug_sql {
            debug!(
                target: "keelctl::sql",
                database = %self.name,
                "{}",
                stmt.interpolate(self.dialect.as_ref())
            );
        }
    }

    /// Run a row-returning statement.
    pub async fn query(&self, stmt: &Statement, op: Operation, target: &str) -> Result<Vec<Row>> {
        self.log_sql(stmt);
        {
            let mut pinned = self.pinned.lock().await;
            if let Some(conn) = pinned.as_mut() {
                return self
                    .bounded(conn.query(stmt))
                    .await
                    .map_err(|e| e.at(op, target));
            }
        }
        self.with_pool(op, target, |pool| async move { pool.query(stmt).await })
            .await
    }

    /// Run a statement that reports affected rows.
    pub async fn execute(&self, stmt: &Statement, op: Operation, target: &str) -> Result<ExecResult> {
        self.log_sql(stmt);
        {
            let mut pinned = self.pinned.lock().await;
            if let Some(conn) = pinned.as_mut() {
                return self
                    .bounded(conn.execute(stmt))
                    .await
                    .map_err(|e| e.at(op, target));
            }
        }
        self.with_pool(op, target, |pool| async move { pool.execute(stmt).await })
            .await
    }

    /// Run `check` then `stmt` on one connection inside one transaction.
    ///
    /// Inside an open transaction both go to the pinned connection. Otherwise
    /// a short transaction is opened for the pair and the whole unit is
    /// retried, so a lost connection never leaves half of it applied.
    pub async fn query_then_execute(
        &self,
        check: &Statement,
        stmt: &Statement,
        op: Operation,
        target: &str,
    ) -> Result<(Vec<Row>, ExecResult)> {
        self.log_sql(check);
        self.log_sql(stmt);
        {
            let mut pinned = self.pinned.lock().await;
            if let Some(conn) = pinned.as_mut() {
                let rows = self
                    .bounded(conn.query(check))
                    .await
                    .map_err(|e| e.at(op, target))?;
                let done = self
                    .bounded(conn.execute(stmt))
                    .await
                    .map_err(|e| e.at(op, target))?;
                return Ok((rows, done));
            }
        }
        self.with_pool(op, target, |pool| async move {
            let mut conn = pool.begin().await?;
            let outcome = async {
                let rows = conn.query(check).await?;
                let done = conn.execute(stmt).await?;
                Ok::<_, Error>((rows, done))
            }
            .await;
            match outcome {
                Ok(pair) => {
                    conn.commit().await?;
                    Ok(pair)
                }
                Err(e) => {
                    if let Err(rb) = conn.rollback().await {
                        debug!(database = %self.name, error = %rb, "rollback after failed pair");
                    }
                    Err(e)
                }
            }
        })
        .await
    }

    /// Pin a connection and open a transaction on it.
    pub async fn begin(&self) -> Result<()> {
        let mut pinned = self.pinned.lock().await;
        if pinned.is_some() {
            return Err(Error::TransactionAlreadyActive {
                target: self.name.clone(),
            });
        }
        let conn = self
            .with_pool(Operation::Begin, &self.name, |pool| async move {
                pool.begin().await
            })
            .await?;
        *pinned = Some(conn);
        debug!(database = %self.name, "transaction started");
        Ok(())
    }

    pub async fn commit(&self) -> Result<()> {
        let conn = self.take_pinned().await?;
        conn.commit()
            .await
            .map_err(|e| e.at(Operation::Commit, &self.name))?;
        debug!(database = %self.name, "transaction committed");
        Ok(())
    }

    pub async fn rollback(&self) -> Result<()> {
        let conn = self.take_pinned().await?;
        conn.rollback()
            .await
            .map_err(|e| e.at(Operation::Rollback, &self.name))?;
        debug!(database = %self.name, "transaction rolled back");
        Ok(())
    }

    async fn take_pinned(&self) -> Result<Box<dyn PinnedConnection>> {
        self.pinned
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::NoActiveTransaction {
                target: self.name.clone(),
            })
    }

    pub async fn in_transaction(&self) -> bool {
        self.pinned.lock().await.is_some()
    }

    /// `SELECT 1` through the normal protocol; never fails.
    pub async fn ping(&self) -> bool {
        let stmt = Statement::new("SELECT 1", vec![]);
        match self.query(&stmt, Operation::Ping, &self.name).await {
            Ok(_) => true,
            Err(e) => {
                debug!(database = %self.name, error = %e, "ping failed");
                false
            }
        }
    }

    /// Roll back any open transaction and close the pool.
    pub async fn close(&self) {
        if let Some(conn) = self.pinned.lock().await.take() {
            if let Err(e) = conn.rollback().await {
                warn!(database = %self.name, error = %e, "rollback on close failed");
            }
        }
        let state = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(state) = state {
            state.pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, Response};

    fn driver(backend: &FakeBackend) -> Driver {
        Driver::new("app", backend.connector())
    }

    fn select() -> Statement {
        Statement::new("SELECT * FROM `users`", vec![])
    }

    #[tokio::test(start_paused = true)]
    async fn two_resets_then_success_rebuilds_once() {
        let backend = FakeBackend::new(DialectKind::Mysql);
        backend.push(Response::Fail(Error::connectivity("read ECONNRESET")));
        backend.push(Response::Fail(Error::connectivity("read ECONNRESET")));
        backend.push(Response::Rows(vec![Row::new()]));
        let driver = driver(&backend);

        let started = tokio::time::Instant::now();
        let rows = driver.query(&select(), Operation::Select, "users").await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(driver.rebuild_count(), 1);
        assert_eq!(backend.connects(), 2);
        assert!(started.elapsed() >= Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn single_blip_retries_without_rebuild() {
        let backend = FakeBackend::new(DialectKind::Mysql);
        backend.push(Response::Fail(Error::connectivity("connect ETIMEDOUT")));
        backend.push(Response::Rows(vec![]));
        let driver = driver(&backend);

        driver.query(&select(), Operation::Select, "users").await.unwrap();
        assert_eq!(driver.rebuild_count(), 0);
        assert_eq!(backend.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_attempts_with_context() {
        let backend = FakeBackend::new(DialectKind::Mysql);
        for _ in 0..3 {
            backend.push(Response::Fail(Error::connectivity("connection refused")));
        }
        let driver = driver(&backend);

        let err = driver
            .query(&select(), Operation::Select, "app::users")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("select on 'app::users'"));
        assert_eq!(backend.statements().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn database_errors_are_not_retried() {
        let backend = FakeBackend::new(DialectKind::Mysql);
        backend.push(Response::Fail(Error::database("Duplicate entry 'a' for key 'PRIMARY'")));
        let driver = driver(&backend);

        let err = driver
            .execute(&select(), Operation::Insert, "users")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Database { operation: Operation::Insert, .. }));
        assert_eq!(backend.statements().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_rebuild() {
        // First pool is dead; both callers fail on it twice before either
        // finishes replacing it.
        let backend = FakeBackend::new(DialectKind::Mysql);
        backend.healthy_from(2);
        backend.set_latency(Duration::from_millis(10));
        let driver = Arc::new(driver(&backend));

        let a = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.query(&select(), Operation::Select, "t").await })
        };
        let b = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.query(&select(), Operation::Select, "t").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(driver.rebuild_count(), 1);
        assert_eq!(backend.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_statements_time_out_and_retry() {
        let backend = FakeBackend::new(DialectKind::Mysql);
        backend.set_latency(Duration::from_secs(5));
        let driver = driver(&backend).with_command_timeout(Some(Duration::from_secs(2)));

        let err = driver
            .query(&select(), Operation::Select, "users")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out after 2000ms"));
        assert_eq!(backend.statements().len(), 3);
        assert_eq!(driver.rebuild_count(), 1);

        backend.set_latency(Duration::from_millis(500));
        driver.query(&select(), Operation::Select, "users").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pinned_statements_time_out_without_retry() {
        let backend = FakeBackend::new(DialectKind::Postgres);
        let driver = driver(&backend).with_command_timeout(Some(Duration::from_secs(1)));
        driver.begin().await.unwrap();
        backend.set_latency(Duration::from_secs(3));

        let err = driver
            .execute(&select(), Operation::Update, "users")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connectivity { operation: Operation::Update, .. }));
        assert_eq!(backend.statements().len(), 1);
        driver.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn begin_pins_until_commit() {
        let backend = FakeBackend::new(DialectKind::Mysql);
        let driver = driver(&backend);

        driver.begin().await.unwrap();
        assert!(matches!(
            driver.begin().await.unwrap_err(),
            Error::TransactionAlreadyActive { .. }
        ));
        driver.query(&select(), Operation::Select, "users").await.unwrap();
        driver.commit().await.unwrap();
        driver.query(&select(), Operation::Select, "users").await.unwrap();

        assert_eq!(
            backend.log(),
            vec![
                "begin".to_string(),
                "tx: SELECT * FROM `users`".to_string(),
                "commit".to_string(),
                "pool: SELECT * FROM `users`".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn failed_pair_rolls_back_its_transaction() {
        let backend = FakeBackend::new(DialectKind::Mysql);
        backend.push(Response::Rows(vec![]));
        backend.push(Response::Fail(Error::database("Deadlock found")));
        let driver = driver(&backend);
        let check = Statement::new("SELECT 1 AS found FROM `users` FOR UPDATE", vec![]);

        let err = driver
            .query_then_execute(&check, &select(), Operation::Upsert, "users")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Database { operation: Operation::Upsert, .. }));
        assert_eq!(backend.log().first().map(String::as_str), Some("begin"));
        assert_eq!(backend.log().last().map(String::as_str), Some("rollback"));
        assert!(!driver.in_transaction().await);
    }

    #[tokio::test]
    async fn commit_without_begin_is_a_usage_error() {
        let backend = FakeBackend::new(DialectKind::Mysql);
        let driver = driver(&backend);
        let err = driver.commit().await.unwrap_err();
        assert!(matches!(err, Error::NoActiveTransaction { .. }));
        assert!(err.is_usage_error());
        assert!(matches!(
            driver.rollback().await.unwrap_err(),
            Error::NoActiveTransaction { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn pinned_failures_are_not_retried() {
        let backend = FakeBackend::new(DialectKind::Mysql);
        let driver = driver(&backend);
        driver.begin().await.unwrap();
        backend.push(Response::Fail(Error::connectivity("connection lost")));

        let err = driver
            .execute(&select(), Operation::Update, "users")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(driver.rebuild_count(), 0);
        driver.rollback().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ping_reports_instead_of_failing() {
        let backend = FakeBackend::new(DialectKind::Postgres);
        let driver = driver(&backend);
        assert!(driver.ping().await);

        backend.push(Response::Fail(Error::database("permission denied")));
        assert!(!driver.ping().await);
    }
}
