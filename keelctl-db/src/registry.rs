//! Process-wide database handles keyed by connection identity.

use keelctl_core::{split_table_id, CoreConfig, Registry, Result};
use tracing::info;

use crate::database::Database;
use crate::table::Table;

/// Resolves logical names to shared [`Database`] handles.
///
/// Two names whose config resolves to the same identity (same URL, or same
/// host/port/user/database) share one pool. Each name still gets a handle
/// that reports itself under that name.
pub struct Databases {
    config: CoreConfig,
    handles: Registry<Database>,
}

impl Databases {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            handles: Registry::new(),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Handle for a logical database name (case-insensitive).
    ///
    /// Fails with a config error if the name is not configured.
    pub async fn database(&self, name: &str) -> Result<Database> {
        let resolved = self.config.resolve_database(name)?;
        let identity = resolved.identity();
        let name = resolved.name.clone();
        let shared = self
            .handles
            .get_or_try_init(&identity, || async move {
                info!(database = %resolved.name, kind = %resolved.kind, "opening database");
                Ok(Database::open(resolved))
            })
            .await?;
        Ok(shared.aliased(&name))
    }

    /// Table handle for `"<database>::<table>"` (or a bare table name in the
    /// `default` database).
    pub async fn table(&self, id: &str) -> Result<Table> {
        let (db, table) = split_table_id(id);
        Ok(self.database(db).await?.table(table))
    }

    /// Close every open pool.
    pub async fn close_all(&self) {
        for db in self.handles.values() {
            db.close().await;
        }
    }
}
