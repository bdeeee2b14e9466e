//! PostgreSQL backend over sqlx.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use keelctl_core::{DialectKind, Endpoint, Error, ResolvedDatabase, Result, Row, SqlValue, Statement};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgRow, Postgres};
use sqlx::query::Query;
use sqlx::{Column, Row as _, Transaction, TypeInfo};
use uuid::Uuid;

use crate::backend::{Connector, ExecResult, PinnedConnection, PoolHandle};
use crate::pool::{classify, pool_options};
use crate::rows::{bytes_to_json, column_value};

pub struct PgConnector {
    config: ResolvedDatabase,
}

impl PgConnector {
    pub fn new(config: ResolvedDatabase) -> Self {
        Self { config }
    }

    fn connect_options(&self) -> Result<PgConnectOptions> {
        match &self.config.endpoint {
            Endpoint::Url(url) => url.parse::<PgConnectOptions>().map_err(|e| {
                Error::config(format!("invalid url for database '{}': {}", self.config.name, e))
            }),
            Endpoint::Fields {
                host,
                port,
                user,
                password,
                database,
            } => {
                let mut options = PgConnectOptions::new().host(host);
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
impl Connector for PgConnector {
    fn kind(&self) -> DialectKind {
        DialectKind::Postgres
    }

    async fn connect(&self) -> Result<Arc<dyn PoolHandle>> {
        let options = self.connect_options()?;
        let pool = pool_options::<Postgres>(&self.config.pool).connect_lazy_with(options);
        Ok(Arc::new(PgPoolHandle { pool }))
    }
}

struct PgPoolHandle {
    pool: PgPool,
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Int(n) => query.bind(*n),
        // No unsigned 64-bit type; values past i64::MAX go over as NUMERIC.
        SqlValue::UInt(n) => match i64::try_from(*n) {
            Ok(n) => query.bind(n),
            Err(_) => query.bind(Decimal::from(*n)),
        },
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::Text(s) => query.bind(s.as_str()),
        SqlValue::Timestamp(ts) => query.bind(*ts),
        SqlValue::Json(v) => query.bind(v.clone()),
        SqlValue::Bytes(b) => query.bind(b.as_slice()),
    }
}

fn prepare(stmt: &Statement) -> Query<'_, Postgres, PgArguments> {
    stmt.params
        .iter()
        .fold(sqlx::query(&stmt.sql), bind_value)
}

fn decode_row(row: &PgRow) -> Result<Row> {
    let mut out = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let type_name = column.type_info().name();
        let value = decode_column(row, i, type_name)
            .map_err(|e| Error::decode(column.name(), format!("{} ({}): {}", column.name(), type_name, e)))?;
        out.insert(column.name(), value);
    }
    Ok(out)
}

fn decode_column(row: &PgRow, i: usize, type_name: &str) -> std::result::Result<JsonValue, sqlx::Error> {
    Ok(match type_name {
        "VOID" => JsonValue::Null,
        "BOOL" => column_value(row.try_get::<Option<bool>, _>(i)?),
        "INT2" => column_value(row.try_get::<Option<i16>, _>(i)?),
        "INT4" => column_value(row.try_get::<Option<i32>, _>(i)?),
        "INT8" => column_value(row.try_get::<Option<i64>, _>(i)?),
        "OID" => column_value(row.try_get::<Option<sqlx::postgres::types::Oid>, _>(i)?.map(|o| o.0)),
        "FLOAT4" => column_value(row.try_get::<Option<f32>, _>(i)?),
        "FLOAT8" => column_value(row.try_get::<Option<f64>, _>(i)?),
        "NUMERIC" => column_value(row.try_get::<Option<Decimal>, _>(i)?.map(|d| d.to_string())),
        "TIMESTAMPTZ" => column_value(
            row.try_get::<Option<DateTime<Utc>>, _>(i)?
                .map(|d| d.to_rfc3339()),
        ),
        "TIMESTAMP" => column_value(
            row.try_get::<Option<NaiveDateTime>, _>(i)?
                .map(|d| d.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        ),
        "DATE" => column_value(row.try_get::<Option<NaiveDate>, _>(i)?.map(|d| d.to_string())),
        "TIME" => column_value(row.try_get::<Option<NaiveTime>, _>(i)?.map(|d| d.to_string())),
        "UUID" => column_value(row.try_get::<Option<Uuid>, _>(i)?.map(|u| u.to_string())),
        "JSON" | "JSONB" => row.try_get::<Option<JsonValue>, _>(i)?.unwrap_or(JsonValue::Null),
        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(i)?
            .map(bytes_to_json)
            .unwrap_or(JsonValue::Null),
        "TEXT[]" | "VARCHAR[]" => column_value(row.try_get::<Option<Vec<String>>, _>(i)?),
        "INT4[]" => column_value(row.try_get::<Option<Vec<i32>>, _>(i)?),
        "INT8[]" => column_value(row.try_get::<Option<Vec<i64>>, _>(i)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" => {
            column_value(row.try_get::<Option<String>, _>(i)?)
        }
        // Enums and other text-encoded types.
        _ => column_value(row.try_get_unchecked::<Option<String>, _>(i)?),
    })
}

#[async_trait]
impl PoolHandle for PgPoolHandle {
    async fn query(&self, stmt: &Statement) -> Result<Vec<Row>> {
        let rows = prepare(stmt).fetch_all(&self.pool).await.map_err(classify)?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute(&self, stmt: &Statement) -> Result<ExecResult> {
        let done = prepare(stmt).execute(&self.pool).await.map_err(classify)?;
        Ok(ExecResult {
            affected_rows: done.rows_affected(),
            last_insert_id: None,
        })
    }

    async fn begin(&self) -> Result<Box<dyn PinnedConnection>> {
        let tx = self.pool.begin().await.map_err(classify)?;
        Ok(Box::new(PgPinned { tx }))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

struct PgPinned {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl PinnedConnection for PgPinned {
    async fn query(&mut self, stmt: &Statement) -> Result<Vec<Row>> {
        let rows = prepare(stmt).fetch_all(&mut *self.tx).await.map_err(classify)?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute(&mut self, stmt: &Statement) -> Result<ExecResult> {
        let done = prepare(stmt).execute(&mut *self.tx).await.map_err(classify)?;
        Ok(ExecResult {
            affected_rows: done.rows_affected(),
            last_insert_id: None,
        })
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(classify)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(classify)
    }
}
