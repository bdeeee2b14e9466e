//! SQL dialects: identifier escaping, placeholders, literal encoding and the
//! handful of clauses that differ between backends.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::statement::scan_placeholders;
use crate::value::SqlValue;

/// MySQL's documented "no limit" value for OFFSET without LIMIT.
const MYSQL_MAX_LIMIT: u64 = 18_446_744_073_709_551_615;

/// Declared database type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    #[default]
    #[serde(alias = "mariadb")]
    Mysql,
    #[serde(alias = "postgresql", alias = "pg")]
    Postgres,
}

impl DialectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialectKind::Mysql => "mysql",
            DialectKind::Postgres => "postgres",
        }
    }

    /// Infer the dialect from a connection URL scheme.
    pub fn from_url(url: &str) -> Result<Self> {
        let scheme = url
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .ok_or_else(|| Error::UnknownDialect {
                name: url.split(':').next().unwrap_or_default().to_string(),
            })?;
        scheme.parse()
    }

    /// Factory: one shared dialect object per kind.
    pub fn dialect(&self) -> Arc<dyn Dialect> {
        match self {
            DialectKind::Mysql => Arc::new(MySql),
            DialectKind::Postgres => Arc::new(Postgres),
        }
    }
}

impl FromStr for DialectKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(DialectKind::Mysql),
            "postgres" | "postgresql" | "pg" => Ok(DialectKind::Postgres),
            other => Err(Error::UnknownDialect {
                name: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for DialectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a backend tells an upsert's insert branch from its update branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertSignal {
    /// MySQL: affected rows 2 = updated; 1 is either an insert or an
    /// unchanged duplicate, told apart by a locking probe on the unique keys.
    AffectedRows,
    /// PostgreSQL: `RETURNING (xmax = 0) AS inserted`.
    ReturningInserted,
}

/// Backend-specific pieces of SQL generation.
pub trait Dialect: Send + Sync + fmt::Debug {
    fn kind(&self) -> DialectKind;

    /// Quote a single identifier segment.
    fn quote_identifier(&self, segment: &str) -> String;

    /// Placeholder token for the 1-based parameter `index`.
    fn placeholder(&self, index: usize) -> String;

    /// Convert a parameter into the representation the backend binds.
    fn encode_value(&self, value: SqlValue) -> SqlValue;

    /// Literal form of a value, for diagnostic SQL rendering.
    fn render_literal(&self, value: &SqlValue) -> String;

    /// Operator for `rlike`/`notRlike`.
    fn regex_operator(&self, negated: bool) -> &'static str;

    /// LIMIT/OFFSET tail, or `None` when neither is set.
    fn limit_clause(&self, limit: Option<u64>, offset: Option<u64>) -> Option<String>;

    /// Conflict-handling tail appended to an INSERT for upserts.
    ///
    /// `keys` are the unique-key columns present in the payload, `updates`
    /// the remaining payload columns.
    fn upsert_clause(&self, keys: &[String], updates: &[String]) -> Result<String>;

    fn upsert_signal(&self) -> UpsertSignal;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Escape a possibly qualified name (`table.column`).
    ///
    /// `*` segments and expressions (anything with parentheses or spaces)
    /// pass through untouched so aggregates work in HAVING/ORDER BY.
    fn escape_identifier(&self, name: &str) -> String {
        if name.contains('(') || name.contains(' ') {
            return name.to_string();
        }
        name.split('.')
            .map(|segment| {
                if segment == "*" {
                    segment.to_string()
                } else {
                    self.quote_identifier(segment)
                }
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Rewrite positional `?` markers into this dialect's placeholder tokens.
    fn number_placeholders(&self, sql: &str) -> String {
        if self.placeholder(1) == "?" {
            return sql.to_string();
        }
        let mut out = String::with_capacity(sql.len() + 8);
        let mut last = 0;
        let mut n = 0;
        scan_placeholders(sql, |p| {
            if p.index.is_none() {
                n += 1;
                out.push_str(&sql[last..p.start]);
                out.push_str(&self.placeholder(n));
                last = p.end;
            }
        });
        out.push_str(&sql[last..]);
        out
    }
}

fn quote_text(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// MySQL / MariaDB.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySql;

impl Dialect for MySql {
    fn kind(&self) -> DialectKind {
        DialectKind::Mysql
    }

    fn quote_identifier(&self, segment: &str) -> String {
        format!("`{}`", segment.replace('`', "``"))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn encode_value(&self, value: SqlValue) -> SqlValue {
        match value {
            SqlValue::Bool(b) => SqlValue::Int(b as i64),
            SqlValue::Timestamp(ts) => {
                SqlValue::Text(ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            }
            other => other,
        }
    }

    fn render_literal(&self, value: &SqlValue) -> String {
        match value {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(b) => (*b as i64).to_string(),
            SqlValue::Int(n) => n.to_string(),
            SqlValue::UInt(n) => n.to_string(),
            SqlValue::Float(f) => f.to_string(),
            SqlValue::Text(s) => quote_text(s),
            SqlValue::Timestamp(ts) => {
                quote_text(&ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            }
            SqlValue::Json(v) => quote_text(&v.to_string()),
            SqlValue::Bytes(b) => format!("X'{}'", hex(b)),
        }
    }

    fn regex_operator(&self, negated: bool) -> &'static str {
        if negated {
            "NOT REGEXP"
        } else {
            "REGEXP"
        }
    }

    fn limit_clause(&self, limit: Option<u64>, offset: Option<u64>) -> Option<String> {
        match (limit, offset) {
            (None, None) => None,
            (Some(l), None) => Some(format!("LIMIT {}", l)),
            (Some(l), Some(o)) => Some(format!("LIMIT {} OFFSET {}", l, o)),
            (None, Some(o)) => Some(format!("LIMIT {} OFFSET {}", MYSQL_MAX_LIMIT, o)),
        }
    }

    fn upsert_clause(&self, keys: &[String], updates: &[String]) -> Result<String> {
        let assignments: Vec<String> = if updates.is_empty() {
            // Nothing to change: a self-assignment keeps the statement valid.
            let key = keys.first().ok_or_else(|| {
                Error::invalid_descriptor("upsert requires at least one unique key")
            })?;
            let k = self.escape_identifier(key);
            vec![format!("{} = {}", k, k)]
        } else {
            updates
                .iter()
                .map(|f| {
                    let f = self.escape_identifier(f);
                    format!("{} = VALUES({})", f, f)
                })
                .collect()
        };
        Ok(format!("ON DUPLICATE KEY UPDATE {}", assignments.join(", ")))
    }

    fn upsert_signal(&self) -> UpsertSignal {
        UpsertSignal::AffectedRows
    }
}

/// PostgreSQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl Dialect for Postgres {
    fn kind(&self) -> DialectKind {
        DialectKind::Postgres
    }

    fn quote_identifier(&self, segment: &str) -> String {
        format!("\"{}\"", segment.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn encode_value(&self, value: SqlValue) -> SqlValue {
        value
    }

    fn render_literal(&self, value: &SqlValue) -> String {
        match value {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            SqlValue::Int(n) => n.to_string(),
            SqlValue::UInt(n) => n.to_string(),
            SqlValue::Float(f) => f.to_string(),
            SqlValue::Text(s) => quote_text(s),
            SqlValue::Timestamp(ts) => format!("{}::timestamptz", quote_text(&ts.to_rfc3339())),
            SqlValue::Json(v) => format!("{}::jsonb", quote_text(&v.to_string())),
            SqlValue::Bytes(b) => format!("'\\x{}'::bytea", hex(b)),
        }
    }

    fn regex_operator(&self, negated: bool) -> &'static str {
        if negated {
            "!~"
        } else {
            "~"
        }
    }

    fn limit_clause(&self, limit: Option<u64>, offset: Option<u64>) -> Option<String> {
        match (limit, offset) {
            (None, None) => None,
            (Some(l), None) => Some(format!("LIMIT {}", l)),
            (Some(l), Some(o)) => Some(format!("LIMIT {} OFFSET {}", l, o)),
            (None, Some(o)) => Some(format!("OFFSET {}", o)),
        }
    }

    fn upsert_clause(&self, keys: &[String], updates: &[String]) -> Result<String> {
        if keys.is_empty() {
            return Err(Error::invalid_descriptor(
                "upsert requires at least one unique key",
            ));
        }
        let target: Vec<String> = keys.iter().map(|k| self.escape_identifier(k)).collect();
        // DO UPDATE (not DO NOTHING) so RETURNING always yields a row.
        let set_fields = if updates.is_empty() { keys } else { updates };
        let assignments: Vec<String> = set_fields
            .iter()
            .map(|f| {
                let f = self.escape_identifier(f);
                format!("{} = EXCLUDED.{}", f, f)
            })
            .collect();
        Ok(format!(
            "ON CONFLICT ({}) DO UPDATE SET {} RETURNING (xmax = 0) AS inserted",
            target.join(", "),
            assignments.join(", ")
        ))
    }

    fn upsert_signal(&self) -> UpsertSignal {
        UpsertSignal::ReturningInserted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn kind_from_url_scheme() {
        assert_eq!(
            DialectKind::from_url("mysql://root@localhost/app").unwrap(),
            DialectKind::Mysql
        );
        assert_eq!(
            DialectKind::from_url("postgresql://localhost/app").unwrap(),
            DialectKind::Postgres
        );
        assert!(matches!(
            DialectKind::from_url("mssql://localhost").unwrap_err(),
            Error::UnknownDialect { .. }
        ));
    }

    #[test]
    fn escapes_qualified_names() {
        assert_eq!(MySql.escape_identifier("u.name"), "`u`.`name`");
        assert_eq!(MySql.escape_identifier("u.*"), "`u`.*");
        assert_eq!(MySql.escape_identifier("COUNT(*)"), "COUNT(*)");
        assert_eq!(Postgres.escape_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn numbers_postgres_placeholders() {
        assert_eq!(
            Postgres.number_placeholders("a = ? AND b = '?' AND c = ?"),
            "a = $1 AND b = '?' AND c = $2"
        );
        assert_eq!(MySql.number_placeholders("a = ?"), "a = ?");
    }

    #[test]
    fn mysql_encodes_bool_and_dates() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(MySql.encode_value(true.into()), SqlValue::Int(1));
        assert_eq!(
            MySql.encode_value(ts.into()),
            SqlValue::Text("2024-01-02 03:04:05.000".into())
        );
        assert_eq!(Postgres.encode_value(true.into()), SqlValue::Bool(true));
    }

    #[test]
    fn limit_offset_syntax() {
        assert_eq!(MySql.limit_clause(None, None), None);
        assert_eq!(MySql.limit_clause(Some(10), Some(20)).unwrap(), "LIMIT 10 OFFSET 20");
        assert!(MySql.limit_clause(None, Some(5)).unwrap().starts_with("LIMIT 1844"));
        assert_eq!(Postgres.limit_clause(None, Some(5)).unwrap(), "OFFSET 5");
    }

    #[test]
    fn upsert_clauses() {
        let keys = vec!["email".to_string()];
        let updates = vec!["name".to_string()];
        assert_eq!(
            MySql.upsert_clause(&keys, &updates).unwrap(),
            "ON DUPLICATE KEY UPDATE `name` = VALUES(`name`)"
        );
        assert_eq!(
            MySql.upsert_clause(&keys, &[]).unwrap(),
            "ON DUPLICATE KEY UPDATE `email` = `email`"
        );
        assert_eq!(
            Postgres.upsert_clause(&keys, &updates).unwrap(),
            "ON CONFLICT (\"email\") DO UPDATE SET \"name\" = EXCLUDED.\"name\" RETURNING (xmax = 0) AS inserted"
        );
    }
}
