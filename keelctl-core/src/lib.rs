pub mod compiler;
pub mod config;
pub mod descriptor;
pub mod dialect;
pub mod error;
pub mod pagination;
pub mod registry;
pub mod retry;
pub mod statement;
pub mod value;

pub use compiler::{check_uniform_fields, Direction, Join, OrderBy, QueryCompiler, SelectOptions};
pub use config::{
    split_table_id, CacheConfig, CacheEndpoint, CoreConfig, DatabaseConfig, Endpoint,
    LockSettings, PoolSettings, ResolvedCache, ResolvedDatabase, ResourceEntry,
};
pub use descriptor::{
    Assignment, Assignments, Condition, FieldFilter, Filters, OpKind, Operand, Operator, UpdateOp,
};
pub use dialect::{Dialect, DialectKind, MySql, Postgres, UpsertSignal};
pub use error::{is_connection_message, Error, Operation, Result};
pub use pagination::{Paginated, Pagination};
pub use registry::Registry;
pub use retry::RetryPolicy;
pub use statement::Statement;
pub use value::{record_from, Record, Row, SqlValue};
