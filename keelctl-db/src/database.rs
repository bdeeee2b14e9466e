//! Database handle: raw statements, transactions and table access.

use std::future::Future;
use std::sync::Arc;

use keelctl_core::{
    Error, Operation, QueryCompiler, Registry, ResolvedDatabase, Result, Row, SqlValue, Statement,
};
use tracing::warn;

use crate::backend::{Connector, ExecResult};
use crate::driver::Driver;
use crate::table::{Table, TableState};

struct DatabaseInner {
    identity: String,
    driver: Driver,
    compiler: QueryCompiler,
    tables: Registry<Arc<TableState>>,
}

/// Shared handle to one database. Cloning is cheap.
///
/// Aliases that share a connection identity share `inner` but each keep the
/// logical name they were requested under, for table targets and errors.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    name: Arc<str>,
}

impl Database {
    /// Database backed by sqlx for a resolved config entry.
    pub fn open(config: ResolvedDatabase) -> Self {
        let identity = config.identity();
        Self::from_driver(identity, Driver::from_config(config))
    }

    /// Database over an arbitrary connector.
    pub fn with_connector(name: &str, connector: Arc<dyn Connector>) -> Self {
        Self::from_driver(name.to_string(), Driver::new(name, connector))
    }

    pub fn from_driver(identity: String, driver: Driver) -> Self {
        let compiler = QueryCompiler::new(driver.dialect());
        let name = Arc::from(driver.name());
        Self {
            name,
            inner: Arc::new(DatabaseInner {
                identity,
                driver,
                compiler,
                tables: Registry::new(),
            }),
        }
    }

    /// Logical name this handle was requested under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Same database, addressed by another logical name.
    pub(crate) fn aliased(&self, name: &str) -> Database {
        if *self.name == *name {
            return self.clone();
        }
        Database {
            inner: self.inner.clone(),
            name: Arc::from(name),
        }
    }

    /// Effective connection identity this handle is registered under.
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub fn driver(&self) -> &Driver {
        &self.inner.driver
    }

    pub fn compiler(&self) -> &QueryCompiler {
        &self.inner.compiler
    }

    /// Table handle; one per table name per database.
    pub fn table(&self, name: &str) -> Table {
        let state = self
            .inner
            .tables
            .get_or_insert_with(name, || Arc::new(TableState::new(name)));
        Table::new(self.clone(), state)
    }

    pub fn same_handle(&self, other: &Database) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn raw_statement(&self, sql: &str, params: Vec<SqlValue>) -> Result<Statement> {
        let dialect = self.inner.compiler.dialect();
        let stmt = Statement::new(
            dialect.number_placeholders(sql),
            params
                .into_iter()
                .map(|v| dialect.encode_value(v))
                .collect(),
        );
        if !stmt.is_consistent() {
            return Err(Error::invalid_descriptor(format!(
                "statement has {} placeholders but {} parameters",
                stmt.placeholder_count(),
                stmt.params.len()
            )));
        }
        Ok(stmt)
    }

    /// Run raw SQL with `?` placeholders and return its rows.
    pub async fn query(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Row>> {
        let stmt = self.raw_statement(sql, params)?;
        self.inner
            .driver
            .query(&stmt, Operation::Query, self.name())
            .await
    }

    /// Run raw SQL with `?` placeholders and report affected rows.
    pub async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<ExecResult> {
        let stmt = self.raw_statement(sql, params)?;
        self.inner
            .driver
            .execute(&stmt, Operation::Execute, self.name())
            .await
    }

    pub async fn begin(&self) -> Result<()> {
        self.inner.driver.begin().await
    }

    pub async fn commit(&self) -> Result<()> {
        self.inner.driver.commit().await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.inner.driver.rollback().await
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` succeeds. When it fails the transaction is rolled
    /// back and `f`'s error is returned; a rollback failure is only logged.
    /// Table calls made through the handle passed to `f` (or any clone of
    /// this database) use the pinned connection.
    pub async fn transaction<T, E, F, Fut>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Database) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        self.begin().await?;
        match f(self.clone()).await {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback().await {
                    warn!(database = %self.name(), error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    pub async fn ping(&self) -> bool {
        self.inner.driver.ping().await
    }

    pub async fn close(&self) {
        self.inner.driver.close().await
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name())
            .field("kind", &self.inner.driver.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, Response};
    use keelctl_core::DialectKind;

    fn db(kind: DialectKind) -> (FakeBackend, Database) {
        let backend = FakeBackend::new(kind);
        let db = Database::with_connector("app", backend.connector());
        (backend, db)
    }

    #[tokio::test]
    async fn raw_queries_are_numbered_for_postgres() {
        let (backend, db) = db(DialectKind::Postgres);
        db.query("SELECT * FROM t WHERE a = ? AND b = ?", vec![1.into(), "x".into()])
            .await
            .unwrap();
        assert_eq!(backend.last_sql(), "SELECT * FROM t WHERE a = $1 AND b = $2");
    }

    #[tokio::test]
    async fn raw_param_mismatch_fails_before_io() {
        let (backend, db) = db(DialectKind::Mysql);
        let err = db.query("SELECT ?", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor { .. }));
        assert!(backend.statements().is_empty());
    }

    #[tokio::test]
    async fn transaction_commits_on_success() {
        let (backend, db) = db(DialectKind::Mysql);
        let value: Result<u32> = db
            .transaction(|tx| async move {
                tx.execute("UPDATE t SET a = 1", vec![]).await?;
                Ok(7)
            })
            .await;
        assert_eq!(value.unwrap(), 7);
        assert_eq!(
            backend.log(),
            vec!["begin", "tx: UPDATE t SET a = 1", "commit"]
        );
    }

    #[tokio::test]
    async fn transaction_rolls_back_and_returns_the_callback_error() {
        #[derive(Debug)]
        enum AppError {
            Db(Error),
            Rejected,
        }
        impl From<Error> for AppError {
            fn from(e: Error) -> Self {
                AppError::Db(e)
            }
        }

        let (backend, db) = db(DialectKind::Mysql);
        backend.push_affected(1);
        let result: std::result::Result<(), AppError> = db
            .transaction(|tx| async move {
                tx.table("orders")
                    .add(keelctl_core::Record::from([("id".to_string(), SqlValue::Int(1))]))
                    .await
                    .map_err(AppError::Db)?;
                Err(AppError::Rejected)
            })
            .await;

        assert!(matches!(result, Err(AppError::Rejected)));
        let log = backend.log();
        assert_eq!(log.first().map(String::as_str), Some("begin"));
        assert!(log[1].starts_with("tx: INSERT INTO `orders`"));
        assert_eq!(log.last().map(String::as_str), Some("rollback"));
        assert!(!db.driver().in_transaction().await);
    }

    #[tokio::test]
    async fn nested_begin_is_rejected() {
        let (_backend, db) = db(DialectKind::Mysql);
        let result: Result<()> = db
            .transaction(|tx| async move { tx.begin().await })
            .await;
        assert!(matches!(result, Err(Error::TransactionAlreadyActive { .. })));
    }

    #[tokio::test]
    async fn tables_are_cached_per_database() {
        let (_backend, db) = db(DialectKind::Mysql);
        let a = db.table("users");
        let b = db.table("users");
        assert!(a.same_table(&b));
        assert!(!a.same_table(&db.table("orders")));
    }

    #[tokio::test]
    async fn callback_database_error_rolls_back() {
        let (backend, db) = db(DialectKind::Mysql);
        backend.push(Response::Fail(Error::database("deadlock")));
        let result: Result<()> = db
            .transaction(|tx| async move {
                tx.execute("DELETE FROM t", vec![]).await?;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::Database { .. })));
        assert_eq!(backend.log().last().map(String::as_str), Some("rollback"));
    }
}
