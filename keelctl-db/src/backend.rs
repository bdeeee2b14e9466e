//! Seams between the driver and a concrete SQL client.
//!
//! A [`Connector`] builds pools; a [`PoolHandle`] runs statements on any
//! pooled connection and can pin one for a transaction. The sqlx backends
//! implement these for MySQL and PostgreSQL.

use std::sync::Arc;

use async_trait::async_trait;
use keelctl_core::{DialectKind, Result, Row, Statement};

/// Outcome of a statement that does not return rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub affected_rows: u64,
    /// Auto-increment id of the first inserted row (MySQL only).
    pub last_insert_id: Option<u64>,
}

/// Builds pools for one database.
#[async_trait]
pub trait Connector: Send + Sync {
    fn kind(&self) -> DialectKind;

    /// Create a fresh pool. Must not reuse state from an earlier pool.
    async fn connect(&self) -> Result<Arc<dyn PoolHandle>>;
}

/// A connection pool.
#[async_trait]
pub trait PoolHandle: Send + Sync {
    async fn query(&self, stmt: &Statement) -> Result<Vec<Row>>;

    async fn execute(&self, stmt: &Statement) -> Result<ExecResult>;

    /// Start a transaction on a dedicated connection.
    async fn begin(&self) -> Result<Box<dyn PinnedConnection>>;

    /// Close all connections. Idempotent.
    async fn close(&self);
}

/// A connection held for the duration of one transaction.
#[async_trait]
pub trait PinnedConnection: Send {
    async fn query(&mut self, stmt: &Statement) -> Result<Vec<Row>>;

    async fn execute(&mut self, stmt: &Statement) -> Result<ExecResult>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
