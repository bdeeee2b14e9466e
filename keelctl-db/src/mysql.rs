//! MySQL / MariaDB backend over sqlx.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use keelctl_core::{DialectKind, Endpoint, Error, ResolvedDatabase, Result, Row, SqlValue, Statement};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySql, MySqlArguments, MySqlConnectOptions, MySqlPool, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, Row as _, Transaction, TypeInfo};

use crate::backend::{Connector, ExecResult, PinnedConnection, PoolHandle};
use crate::pool::{classify, pool_options};
use crate::rows::{bytes_to_json, column_value};

pub struct MySqlConnector {
    config: ResolvedDatabase,
}

impl MySqlConnector {
    pub fn new(config: ResolvedDatabase) -> Self {
        Self { config }
    }

    fn connect_options(&self) -> Result<MySqlConnectOptions> {
        match &self.config.endpoint {
            Endpoint::Url(url) => url.parse::<MySqlConnectOptions>().map_err(|e| {
                Error::config(format!("invalid url for database '{}': {}", self.config.name, e))
            }),
            Endpoint::Fields {
                host,
                port,
                user,
                password,
                database,
            } => {
                let mut options = MySqlConnectOptions::new().host(host);
                if let Some(port) = port {
                    options = options.port(*port);
                }
                if let Some(user) = user {
                    options = options.username(user);
                }
                if let Some(password) = password {
                    options = options.password(password);
                }
                if let Some(database) = database {
                    options = options.database(database);
                }
                Ok(options)
            }
        }
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    fn kind(&self) -> DialectKind {
        DialectKind::Mysql
    }

    async fn connect(&self) -> Result<Arc<dyn PoolHandle>> {
        let options = self.connect_options()?;
        let pool = pool_options::<MySql>(&self.config.pool).connect_lazy_with(options);
        Ok(Arc::new(MySqlPoolHandle { pool }))
    }
}

struct MySqlPoolHandle {
    pool: MySqlPool,
}

fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &'q SqlValue,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Int(n) => query.bind(*n),
        SqlValue::UInt(n) => query.bind(*n),
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::Text(s) => query.bind(s.as_str()),
        SqlValue::Timestamp(ts) => query.bind(*ts),
        SqlValue::Json(v) => query.bind(v.clone()),
        SqlValue::Bytes(b) => query.bind(b.as_slice()),
    }
}

fn prepare(stmt: &Statement) -> Query<'_, MySql, MySqlArguments> {
    stmt.params
        .iter()
        .fold(sqlx::query(&stmt.sql), bind_value)
}

fn decode_row(row: &MySqlRow) -> Result<Row> {
    let mut out = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let type_name = column.type_info().name();
        let value = decode_column(row, i, type_name)
            .map_err(|e| Error::decode(column.name(), format!("{} ({}): {}", column.name(), type_name, e)))?;
        out.insert(column.name(), value);
    }
    Ok(out)
}

fn decode_column(row: &MySqlRow, i: usize, type_name: &str) -> std::result::Result<JsonValue, sqlx::Error> {
    let unsigned = type_name.ends_with("UNSIGNED");
    let base = type_name.split(' ').next().unwrap_or(type_name);
    Ok(match base {
        "NULL" => JsonValue::Null,
        "BOOLEAN" => column_value(row.try_get::<Option<bool>, _>(i)?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" if unsigned => {
            column_value(row.try_get::<Option<u64>, _>(i)?)
        }
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            column_value(row.try_get::<Option<i64>, _>(i)?)
        }
        "YEAR" => column_value(row.try_get::<Option<u16>, _>(i)?),
        "FLOAT" | "DOUBLE" => column_value(row.try_get::<Option<f64>, _>(i)?),
        // Kept as a string so no precision is lost.
        "DECIMAL" => column_value(row.try_get::<Option<Decimal>, _>(i)?.map(|d| d.to_string())),
        "DATETIME" => column_value(
            row.try_get::<Option<NaiveDateTime>, _>(i)?
                .map(|d| d.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        ),
        "TIMESTAMP" => column_value(
            row.try_get::<Option<DateTime<Utc>>, _>(i)?
                .map(|d| d.to_rfc3339()),
        ),
        "DATE" => column_value(row.try_get::<Option<NaiveDate>, _>(i)?.map(|d| d.to_string())),
        "TIME" => column_value(row.try_get::<Option<NaiveTime>, _>(i)?.map(|d| d.to_string())),
        "JSON" => row.try_get::<Option<JsonValue>, _>(i)?.unwrap_or(JsonValue::Null),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT"
        | "GEOMETRY" => row
            .try_get_unchecked::<Option<Vec<u8>>, _>(i)?
            .map(bytes_to_json)
            .unwrap_or(JsonValue::Null),
        _ => column_value(row.try_get_unchecked::<Option<String>, _>(i)?),
    })
}

#[async_trait]
impl PoolHandle for MySqlPoolHandle {
    async fn query(&self, stmt: &Statement) -> Result<Vec<Row>> {
        let rows = prepare(stmt).fetch_all(&self.pool).await.map_err(classify)?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute(&self, stmt: &Statement) -> Result<ExecResult> {
        let done = prepare(stmt).execute(&self.pool).await.map_err(classify)?;
        Ok(ExecResult {
            affected_rows: done.rows_affected(),
            last_insert_id: Some(done.last_insert_id()).filter(|id| *id > 0),
        })
    }

    async fn begin(&self) -> Result<Box<dyn PinnedConnection>> {
        let tx = self.pool.begin().await.map_err(classify)?;
        Ok(Box::new(MySqlPinned { tx }))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

struct MySqlPinned {
    tx: Transaction<'static, MySql>,
}

#[async_trait]
impl PinnedConnection for MySqlPinned {
    async fn query(&mut self, stmt: &Statement) -> Result<Vec<Row>> {
        let rows = prepare(stmt).fetch_all(&mut *self.tx).await.map_err(classify)?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute(&mut self, stmt: &Statement) -> Result<ExecResult> {
        let done = prepare(stmt).execute(&mut *self.tx).await.map_err(classify)?;
        Ok(ExecResult {
            affected_rows: done.rows_affected(),
            last_insert_id: Some(done.last_insert_id()).filter(|id| *id > 0),
        })
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(classify)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(classify)
    }
}
