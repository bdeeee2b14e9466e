//! `keelctl compile`: print the SQL a JSON descriptor compiles to.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use keelctl_core::{
    record_from, Assignments, Condition, DialectKind, OrderBy, QueryCompiler, SelectOptions,
    Statement,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

#[derive(Parser, Debug)]
pub struct CompileArgs {
    /// Descriptor as inline JSON (reads stdin when omitted and no --file)
    #[arg(value_name = "JSON")]
    descriptor: Option<String>,

    /// Read the descriptor from a file
    #[arg(long, short = 'f', value_name = "PATH", conflicts_with = "descriptor")]
    file: Option<PathBuf>,

    /// SQL dialect to compile for
    #[arg(long, short = 'd', value_enum, default_value = "mysql")]
    dialect: DialectArg,

    /// Print the statement with parameters substituted
    #[arg(long)]
    interpolate: bool,

    /// Print `{ "sql": ..., "params": [...] }`
    #[arg(long, conflicts_with = "interpolate")]
    json: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum DialectArg {
    Mysql,
    Postgres,
}

impl From<DialectArg> for DialectKind {
    fn from(arg: DialectArg) -> Self {
        match arg {
            DialectArg::Mysql => DialectKind::Mysql,
            DialectArg::Postgres => DialectKind::Postgres,
        }
    }
}

/// Statement descriptor, tagged by `op`.
///
/// ```json
/// {"op": "select", "table": "users", "where": {"age": {"gte": 18}}, "order_by": ["-id"], "limit": 10}
/// {"op": "update", "table": "users", "where": {"id": 1}, "set": {"visits": {"increment": 1}}}
/// ```
#[derive(Deserialize, Debug)]
#[serde(tag = "op", rename_all = "lowercase", deny_unknown_fields)]
enum Descriptor {
    Select {
        table: String,
        #[serde(default, rename = "where")]
        condition: Option<JsonValue>,
        #[serde(default)]
        columns: Vec<String>,
        #[serde(default)]
        distinct: bool,
        #[serde(default)]
        group_by: Vec<String>,
        #[serde(default)]
        order_by: Vec<String>,
        limit: Option<u64>,
        offset: Option<u64>,
    },
    Count {
        table: String,
        #[serde(default, rename = "where")]
        condition: Option<JsonValue>,
    },
    Insert {
        table: String,
        records: Vec<JsonValue>,
    },
    Update {
        table: String,
        #[serde(default, rename = "where")]
        condition: Option<JsonValue>,
        set: JsonValue,
    },
    Delete {
        table: String,
        #[serde(default, rename = "where")]
        condition: Option<JsonValue>,
    },
    Upsert {
        table: String,
        record: JsonValue,
        unique: Vec<String>,
    },
}

fn condition(value: Option<JsonValue>) -> keelctl_core::Result<Option<Condition>> {
    value.map(Condition::from_json).transpose()
}

fn compile(descriptor: Descriptor, compiler: &QueryCompiler) -> keelctl_core::Result<Statement> {
    match descriptor {
        Descriptor::Select {
            table,
            condition: where_,
            columns,
            distinct,
            group_by,
            order_by,
            limit,
            offset,
        } => {
            let mut options = SelectOptions::new().columns(columns).group_by(group_by);
            options.distinct = distinct;
            options.order_by = order_by.iter().map(|spec| OrderBy::parse(spec)).collect();
            options.limit = limit;
            options.offset = offset;
            compiler.build_select(&table, condition(where_)?.as_ref(), &options)
        }
        Descriptor::Count {
            table,
            condition: where_,
        } => compiler.build_count(&table, condition(where_)?.as_ref(), &SelectOptions::new()),
        Descriptor::Insert { table, records } => {
            let records = records
                .iter()
                .map(record_from)
                .collect::<keelctl_core::Result<Vec<_>>>()?;
            compiler.build_insert(&table, &records)
        }
        Descriptor::Update {
            table,
            condition: where_,
            set,
        } => compiler.build_update(
            &table,
            &Assignments::from_json(set)?,
            condition(where_)?.as_ref(),
        ),
        Descriptor::Delete {
            table,
            condition: where_,
        } => compiler.build_delete(&table, condition(where_)?.as_ref()),
        Descriptor::Upsert {
            table,
            record,
            unique,
        } => compiler.build_upsert(&table, &record_from(&record)?, &unique),
    }
}

fn read_descriptor(args: &CompileArgs) -> Result<String> {
    if let Some(inline) = &args.descriptor {
        return Ok(inline.clone());
    }
    if let Some(path) = &args.file {
        return std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()));
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("Failed to read descriptor from stdin")?;
    Ok(buf)
}

pub fn run_compile(args: CompileArgs) -> Result<ExitCode> {
    let raw = read_descriptor(&args)?;
    let descriptor: Descriptor =
        serde_json::from_str(&raw).context("Descriptor is not valid JSON")?;
    let compiler = QueryCompiler::for_kind(args.dialect.into());
    let stmt = compile(descriptor, &compiler)?;

    if args.interpolate {
        println!("{}", stmt.interpolate(compiler.dialect()));
    } else if args.json {
        let params: Vec<JsonValue> = stmt.params.iter().map(|p| p.to_json()).collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "sql": stmt.sql, "params": params }))?
        );
    } else {
        println!("{}", stmt.sql);
        let params: Vec<JsonValue> = stmt.params.iter().map(|p| p.to_json()).collect();
        println!("-- params: {}", JsonValue::Array(params));
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keelctl_core::Error;

    fn compile_str(raw: &str, kind: DialectKind) -> keelctl_core::Result<Statement> {
        let descriptor: Descriptor = serde_json::from_str(raw).unwrap();
        compile(descriptor, &QueryCompiler::for_kind(kind))
    }

    #[test]
    fn select_with_range_filter() {
        let stmt = compile_str(
            r#"{"op": "select", "table": "users", "where": {"age": {"gte": 18, "lt": 60}}, "limit": 5}"#,
            DialectKind::Mysql,
        )
        .unwrap();
        assert!(stmt.sql.starts_with("SELECT * FROM `users` WHERE"));
        assert!(stmt.sql.contains("`age` >= ? AND `age` < ?"));
        assert!(stmt.is_consistent());
    }

    #[test]
    fn postgres_update_is_numbered() {
        let stmt = compile_str(
            r#"{"op": "update", "table": "users", "where": {"id": 7}, "set": {"name": "ada"}}"#,
            DialectKind::Postgres,
        )
        .unwrap();
        assert_eq!(stmt.sql, r#"UPDATE "users" SET "name" = $1 WHERE "id" = $2"#);
        assert_eq!(stmt.params.len(), 2);
    }

    #[test]
    fn empty_insert_is_rejected() {
        let err = compile_str(
            r#"{"op": "insert", "table": "users", "records": []}"#,
            DialectKind::Mysql,
        )
        .unwrap_err();
        assert!(matches!(err, Error::EmptyInsert { .. }));
    }

    #[test]
    fn unknown_op_fails_to_parse() {
        let parsed: std::result::Result<Descriptor, _> =
            serde_json::from_str(r#"{"op": "merge", "table": "users"}"#);
        assert!(parsed.is_err());
    }
}
