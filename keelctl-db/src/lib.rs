//! SQL access for keelctl: a retrying connection driver over sqlx and a
//! table repository facade on top of it.

pub mod backend;
pub mod database;
pub mod driver;
pub mod mysql;
pub mod postgres;
pub mod registry;
pub mod table;

mod pool;
mod rows;

#[cfg(test)]
mod testing;

pub use backend::{Connector, ExecResult, PinnedConnection, PoolHandle};
pub use database::Database;
pub use driver::Driver;
pub use mysql::MySqlConnector;
pub use postgres::PgConnector;
pub use registry::Databases;
pub use table::{OperationResult, Table, UpsertAction};
