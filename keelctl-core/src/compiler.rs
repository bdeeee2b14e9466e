//! Query compiler: descriptors → parameterized SQL.
//!
//! Fragments are assembled with positional `?` markers and numbered by the
//! dialect once the whole statement exists, so parameter order always follows
//! text order: JOIN → WHERE → GROUP BY → HAVING → ORDER BY → LIMIT/OFFSET.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::descriptor::{
    Assignment, Assignments, Condition, FieldFilter, Filters, OpKind, Operand, Operator, UpdateOp,
};
use crate::dialect::{Dialect, DialectKind};
use crate::error::{Error, Operation, Result};
use crate::statement::Statement;
use crate::value::{Record, SqlValue};

/// Sort direction for ORDER BY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }

    /// `"-created_at"` sorts descending, anything else ascending.
    pub fn parse(spec: &str) -> Self {
        match spec.strip_prefix('-') {
            Some(field) => Self::desc(field),
            None => Self::asc(spec.trim_start_matches('+')),
        }
    }
}

/// JOIN clause. `kind` stays a string so data-shaped input can carry
/// unknown types through to the compiler's validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: String,
    pub table: String,
    pub alias: Option<String>,
    pub on: Option<Condition>,
    pub using: Vec<String>,
}

impl Join {
    pub fn new(kind: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            table: table.into(),
            alias: None,
            on: None,
            using: Vec::new(),
        }
    }

    pub fn inner(table: impl Into<String>) -> Self {
        Self::new("INNER", table)
    }

    pub fn left(table: impl Into<String>) -> Self {
        Self::new("LEFT", table)
    }

    pub fn right(table: impl Into<String>) -> Self {
        Self::new("RIGHT", table)
    }

    pub fn cross(table: impl Into<String>) -> Self {
        Self::new("CROSS", table)
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Raw ON expression, e.g. `"u.id = o.user_id"`.
    pub fn on(mut self, expr: impl Into<String>) -> Self {
        self.on = Some(Condition::Raw(expr.into()));
        self
    }

    pub fn on_condition(mut self, condition: Condition) -> Self {
        self.on = Some(condition);
        self
    }

    pub fn using<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.using = columns.into_iter().map(Into::into).collect();
        self
    }
}

fn join_keyword(kind: &str) -> Option<&'static str> {
    match kind.trim().to_ascii_uppercase().as_str() {
        "" | "INNER" => Some("INNER JOIN"),
        "LEFT" | "LEFT OUTER" => Some("LEFT JOIN"),
        "RIGHT" | "RIGHT OUTER" => Some("RIGHT JOIN"),
        "FULL" | "FULL OUTER" => Some("FULL OUTER JOIN"),
        "CROSS" => Some("CROSS JOIN"),
        _ => None,
    }
}

/// Everything beyond the WHERE condition that shapes a SELECT.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectOptions {
    /// Columns to project; empty means `*`.
    pub columns: Vec<String>,
    pub distinct: bool,
    pub joins: Vec<Join>,
    pub group_by: Vec<String>,
    pub having: Option<Condition>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    pub fn group_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn having(mut self, condition: impl Into<Condition>) -> Self {
        self.having = Some(condition.into());
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Compiled piece of SQL with `?` markers, not yet numbered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Fragment {
    fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    fn parenthesized(self) -> Self {
        Self {
            sql: format!("({})", self.sql),
            params: self.params,
        }
    }
}

/// Joins fragments with a separator, keeping parameters in text order.
fn join_fragments(parts: Vec<Fragment>, separator: &str) -> Fragment {
    let mut sql = Vec::with_capacity(parts.len());
    let mut params = Vec::new();
    for part in parts {
        sql.push(part.sql);
        params.extend(part.params);
    }
    Fragment::new(sql.join(separator), params)
}

/// Escape LIKE wildcards so user text matches literally.
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Truthiness of `isNull`/`isNotNull` arguments.
fn truthy(value: &SqlValue) -> bool {
    match value {
        SqlValue::Null => false,
        SqlValue::Bool(b) => *b,
        SqlValue::Int(n) => *n != 0,
        SqlValue::UInt(n) => *n != 0,
        SqlValue::Float(f) => *f != 0.0,
        SqlValue::Text(s) => !s.is_empty() && s != "false" && s != "0",
        _ => true,
    }
}

/// Translates descriptors into statements for one dialect.
#[derive(Debug, Clone)]
pub struct QueryCompiler {
    dialect: Arc<dyn Dialect>,
}

impl QueryCompiler {
    pub fn new(dialect: Arc<dyn Dialect>) -> Self {
        Self { dialect }
    }

    pub fn for_kind(kind: DialectKind) -> Self {
        Self::new(kind.dialect())
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    fn ident(&self, name: &str) -> String {
        self.dialect.escape_identifier(name)
    }

    fn encode(&self, value: &SqlValue) -> SqlValue {
        self.dialect.encode_value(value.clone())
    }

    // ------------------------------------------------------------------
    // Field-level compilation
    // ------------------------------------------------------------------

    /// Compile one field's filter.
    ///
    /// Absent fields compile to an empty fragment. Several operators on one
    /// field are ANDed and parenthesized.
    pub fn compile_filter(&self, field: &str, filter: &FieldFilter) -> Result<Fragment> {
        let column = self.ident(field);
        match filter {
            FieldFilter::Absent => Ok(Fragment::default()),
            FieldFilter::Value(SqlValue::Null) => {
                Ok(Fragment::new(format!("{} IS NULL", column), vec![]))
            }
            FieldFilter::Value(value) => Ok(Fragment::new(
                format!("{} = ?", column),
                vec![self.encode(value)],
            )),
            FieldFilter::Ops(ops) => {
                let parts = ops
                    .iter()
                    .map(|op| self.compile_operator(field, &column, op))
                    .collect::<Result<Vec<_>>>()?;
                let many = parts.len() > 1;
                let joined = join_fragments(parts, " AND ");
                Ok(if many { joined.parenthesized() } else { joined })
            }
        }
    }

    fn compile_operator(&self, field: &str, column: &str, op: &Operator) -> Result<Fragment> {
        let name = op.kind.name();

        if op.kind.is_range() {
            let Operand::List(items) = &op.operand else {
                return Err(Error::malformed_operator(field, name, "requires an array argument"));
            };
            return match op.kind {
                OpKind::In | OpKind::NotIn => {
                    if items.is_empty() {
                        return Err(Error::malformed_operator(
                            field,
                            name,
                            "requires a non-empty array",
                        ));
                    }
                    let keyword = if op.kind == OpKind::In { "IN" } else { "NOT IN" };
                    let marks = vec!["?"; items.len()].join(", ");
                    Ok(Fragment::new(
                        format!("{} {} ({})", column, keyword, marks),
                        items.iter().map(|v| self.encode(v)).collect(),
                    ))
                }
                _ => {
                    if items.len() != 2 {
                        return Err(Error::malformed_operator(
                            field,
                            name,
                            format!("requires exactly 2 values, got {}", items.len()),
                        ));
                    }
                    let keyword = if op.kind == OpKind::Between {
                        "BETWEEN"
                    } else {
                        "NOT BETWEEN"
                    };
                    Ok(Fragment::new(
                        format!("{} {} ? AND ?", column, keyword),
                        vec![self.encode(&items[0]), self.encode(&items[1])],
                    ))
                }
            };
        }

        let Operand::Value(value) = &op.operand else {
            return Err(Error::malformed_operator(field, name, "expects a single value"));
        };

        let simple = |symbol: &str| {
            Fragment::new(
                format!("{} {} ?", column, symbol),
                vec![self.encode(value)],
            )
        };
        let pattern = |pattern: String, negated: bool| {
            let keyword = if negated { "NOT LIKE" } else { "LIKE" };
            Fragment::new(
                format!("{} {} ?", column, keyword),
                vec![SqlValue::Text(pattern)],
            )
        };

        Ok(match op.kind {
            OpKind::Eq if value.is_null() => Fragment::new(format!("{} IS NULL", column), vec![]),
            OpKind::Ne if value.is_null() => {
                Fragment::new(format!("{} IS NOT NULL", column), vec![])
            }
            OpKind::Eq => simple("="),
            OpKind::Ne => simple("<>"),
            OpKind::Gt => simple(">"),
            OpKind::Gte => simple(">="),
            OpKind::Lt => simple("<"),
            OpKind::Lte => simple("<="),
            OpKind::Like => pattern(value.as_text(), false),
            OpKind::NotLike => pattern(value.as_text(), true),
            OpKind::Rlike => simple(self.dialect.regex_operator(false)),
            OpKind::NotRlike => simple(self.dialect.regex_operator(true)),
            OpKind::StartsWith => pattern(format!("{}%", escape_like(&value.as_text())), false),
            OpKind::EndsWith => pattern(format!("%{}", escape_like(&value.as_text())), false),
            OpKind::Contains => pattern(format!("%{}%", escape_like(&value.as_text())), false),
            OpKind::IsNull | OpKind::IsNotNull => {
                let want_null = truthy(value) == (op.kind == OpKind::IsNull);
                let keyword = if want_null { "IS NULL" } else { "IS NOT NULL" };
                Fragment::new(format!("{} {}", column, keyword), vec![])
            }
            OpKind::In | OpKind::NotIn | OpKind::Between | OpKind::NotBetween => {
                return Err(Error::malformed_operator(field, name, "expects a list of values"))
            }
        })
    }

    // ------------------------------------------------------------------
    // Logical composition
    // ------------------------------------------------------------------

    /// Compile field filters and nested `AND`/`OR` groups.
    pub fn compile_filters(&self, filters: &Filters) -> Result<Fragment> {
        let mut parts = Vec::new();

        for (field, filter) in &filters.fields {
            let fragment = self.compile_filter(field, filter)?;
            if !fragment.is_empty() {
                parts.push(fragment);
            }
        }

        if let Some(members) = &filters.and {
            for member in members {
                let fragment = self.compile_filters(member)?;
                if fragment.is_empty() {
                    continue;
                }
                let has_or = member.or.as_ref().is_some_and(|m| !m.is_empty());
                parts.push(if has_or {
                    fragment.parenthesized()
                } else {
                    fragment
                });
            }
        }

        if let Some(members) = &filters.or {
            let mut alternatives = Vec::new();
            for member in members {
                let fragment = self.compile_filters(member)?;
                if fragment.is_empty() {
                    continue;
                }
                let grouped = member.present_field_count() > 1 || member.and.is_some();
                alternatives.push(if grouped {
                    fragment.parenthesized()
                } else {
                    fragment
                });
            }
            if !alternatives.is_empty() {
                let several = alternatives.len() > 1;
                let group = join_fragments(alternatives, " OR ");
                // Only bracket the OR group when it sits next to other conditions.
                parts.push(if several && !parts.is_empty() {
                    group.parenthesized()
                } else {
                    group
                });
            }
        }

        Ok(join_fragments(parts, " AND "))
    }

    /// Compile any condition form into a WHERE/HAVING body.
    pub fn compile_condition(&self, condition: &Condition) -> Result<Fragment> {
        match condition {
            Condition::Filters(filters) => self.compile_filters(filters),
            Condition::Raw(sql) => Ok(Fragment::new(sql.trim(), vec![])),
            Condition::RawParams(sql, params) => {
                let stmt = Statement::new(sql.trim(), params.clone());
                if !stmt.is_consistent() {
                    return Err(Error::invalid_descriptor(format!(
                        "raw condition has {} placeholders but {} parameters",
                        stmt.placeholder_count(),
                        params.len()
                    )));
                }
                Ok(Fragment::new(
                    stmt.sql,
                    params.iter().map(|v| self.encode(v)).collect(),
                ))
            }
        }
    }

    // ------------------------------------------------------------------
    // Assignments
    // ------------------------------------------------------------------

    /// Compile one update assignment; `None` for absent fields.
    pub fn compile_assignment(
        &self,
        field: &str,
        assignment: &Assignment,
    ) -> Result<Option<Fragment>> {
        let column = self.ident(field);
        Ok(match assignment {
            Assignment::Absent => None,
            Assignment::Value(SqlValue::Null) | Assignment::Op(UpdateOp::Set, SqlValue::Null) => {
                Some(Fragment::new(format!("{} = NULL", column), vec![]))
            }
            Assignment::Value(value) | Assignment::Op(UpdateOp::Set, value) => Some(Fragment::new(
                format!("{} = ?", column),
                vec![self.encode(value)],
            )),
            Assignment::Op(op, value) => {
                if value.is_null() {
                    return Err(Error::malformed_operator(
                        field,
                        op.name(),
                        "arithmetic operand cannot be null",
                    ));
                }
                let symbol = op.symbol().unwrap_or("+");
                Some(Fragment::new(
                    format!("{} = {} {} ?", column, column, symbol),
                    vec![self.encode(value)],
                ))
            }
        })
    }

    // ------------------------------------------------------------------
    // Statement builders
    // ------------------------------------------------------------------

    fn finish(&self, sql: String, params: Vec<SqlValue>) -> Statement {
        let stmt = Statement::new(self.dialect.number_placeholders(&sql), params);
        debug_assert!(stmt.is_consistent(), "placeholder/param mismatch: {}", stmt.sql);
        stmt
    }

    fn push_where(
        &self,
        sql: &mut String,
        params: &mut Vec<SqlValue>,
        condition: Option<&Condition>,
    ) -> Result<()> {
        if let Some(condition) = condition {
            let fragment = self.compile_condition(condition)?;
            if !fragment.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&fragment.sql);
                params.extend(fragment.params);
            }
        }
        Ok(())
    }

    fn push_joins(&self, sql: &mut String, params: &mut Vec<SqlValue>, joins: &[Join]) -> Result<()> {
        for join in joins {
            let keyword = join_keyword(&join.kind).ok_or_else(|| {
                Error::invalid_join(&join.kind, &join.table, "unknown join type")
            })?;
            sql.push(' ');
            sql.push_str(keyword);
            sql.push(' ');
            sql.push_str(&self.ident(&join.table));
            if let Some(alias) = &join.alias {
                sql.push_str(" AS ");
                sql.push_str(&self.ident(alias));
            }

            if keyword == "CROSS JOIN" {
                continue;
            }

            match (&join.on, join.using.is_empty()) {
                (Some(on), _) => {
                    let fragment = self.compile_condition(on)?;
                    if fragment.is_empty() {
                        return Err(Error::invalid_join(
                            &join.kind,
                            &join.table,
                            "ON condition is empty",
                        ));
                    }
                    sql.push_str(" ON ");
                    sql.push_str(&fragment.sql);
                    params.extend(fragment.params);
                }
                (None, false) => {
                    let columns: Vec<String> = join.using.iter().map(|c| self.ident(c)).collect();
                    sql.push_str(&format!(" USING ({})", columns.join(", ")));
                }
                (None, true) => {
                    return Err(Error::invalid_join(
                        &join.kind,
                        &join.table,
                        "requires an ON condition or USING columns",
                    ));
                }
            }
        }
        Ok(())
    }

    fn push_tail(
        &self,
        sql: &mut String,
        params: &mut Vec<SqlValue>,
        options: &SelectOptions,
    ) -> Result<()> {
        if !options.group_by.is_empty() {
            let fields: Vec<String> = options.group_by.iter().map(|f| self.ident(f)).collect();
            sql.push_str(" GROUP BY ");
            sql.push_str(&fields.join(", "));
        }

        if let Some(having) = &options.having {
            let fragment = self.compile_condition(having)?;
            if !fragment.is_empty() {
                sql.push_str(" HAVING ");
                sql.push_str(&fragment.sql);
                params.extend(fragment.params);
            }
        }

        if !options.order_by.is_empty() {
            let fields: Vec<String> = options
                .order_by
                .iter()
                .map(|o| {
                    let dir = match o.direction {
                        Direction::Asc => "ASC",
                        Direction::Desc => "DESC",
                    };
                    format!("{} {}", self.ident(&o.field), dir)
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&fields.join(", "));
        }

        if let Some(limit) = self.dialect.limit_clause(options.limit, options.offset) {
            sql.push(' ');
            sql.push_str(&limit);
        }
        Ok(())
    }

    fn projection(&self, options: &SelectOptions) -> String {
        let columns = if options.columns.is_empty() {
            "*".to_string()
        } else {
            options
                .columns
                .iter()
                .map(|c| self.ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        if options.distinct {
            format!("DISTINCT {}", columns)
        } else {
            columns
        }
    }

    fn select_sql(
        &self,
        table: &str,
        condition: Option<&Condition>,
        options: &SelectOptions,
    ) -> Result<(String, Vec<SqlValue>)> {
        let mut sql = format!("SELECT {} FROM {}", self.projection(options), self.ident(table));
        let mut params = Vec::new();
        self.push_joins(&mut sql, &mut params, &options.joins)?;
        self.push_where(&mut sql, &mut params, condition)?;
        self.push_tail(&mut sql, &mut params, options)?;
        Ok((sql, params))
    }

    pub fn build_select(
        &self,
        table: &str,
        condition: Option<&Condition>,
        options: &SelectOptions,
    ) -> Result<Statement> {
        let (sql, params) = self.select_sql(table, condition, options)?;
        Ok(self.finish(sql, params))
    }

    /// `SELECT COUNT(*) AS count`. Grouped or distinct selections are wrapped
    /// in a subquery so the count is over result rows.
    pub fn build_count(
        &self,
        table: &str,
        condition: Option<&Condition>,
        options: &SelectOptions,
    ) -> Result<Statement> {
        let mut inner = options.clone();
        inner.order_by.clear();
        inner.limit = None;
        inner.offset = None;

        if inner.group_by.is_empty() && !inner.distinct {
            let mut sql = format!("SELECT COUNT(*) AS count FROM {}", self.ident(table));
            let mut params = Vec::new();
            self.push_joins(&mut sql, &mut params, &inner.joins)?;
            self.push_where(&mut sql, &mut params, condition)?;
            return Ok(self.finish(sql, params));
        }

        let (inner_sql, params) = self.select_sql(table, condition, &inner)?;
        Ok(self.finish(
            format!("SELECT COUNT(*) AS count FROM ({}) AS counted", inner_sql),
            params,
        ))
    }

    /// Minimal existence probe: no row materialization, one row at most.
    pub fn build_exists(
        &self,
        table: &str,
        condition: Option<&Condition>,
        joins: &[Join],
    ) -> Result<Statement> {
        let mut sql = format!("SELECT 1 AS found FROM {}", self.ident(table));
        let mut params = Vec::new();
        self.push_joins(&mut sql, &mut params, joins)?;
        self.push_where(&mut sql, &mut params, condition)?;
        if let Some(limit) = self.dialect.limit_clause(Some(1), None) {
            sql.push(' ');
            sql.push_str(&limit);
        }
        Ok(self.finish(sql, params))
    }

    pub fn build_insert(&self, table: &str, records: &[Record]) -> Result<Statement> {
        let first = records.first().ok_or_else(|| Error::EmptyInsert {
            table: table.to_string(),
        })?;
        check_uniform_fields(table, records)?;
        if first.is_empty() {
            return Err(Error::invalid_descriptor(format!(
                "insert into '{}' has no fields",
                table
            )));
        }

        // NULLs are inlined so no typed null has to be bound.
        let columns: Vec<&String> = first.keys().collect();
        let mut rows = Vec::with_capacity(records.len());
        let mut params = Vec::with_capacity(columns.len() * records.len());
        for record in records {
            let mut marks = Vec::with_capacity(columns.len());
            for column in &columns {
                match record.get(*column) {
                    None | Some(SqlValue::Null) => marks.push("NULL"),
                    Some(value) => {
                        marks.push("?");
                        params.push(self.encode(value));
                    }
                }
            }
            rows.push(format!("({})", marks.join(", ")));
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.ident(table),
            columns
                .iter()
                .map(|c| self.ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            rows.join(", ")
        );
        Ok(self.finish(sql, params))
    }

    pub fn build_update(
        &self,
        table: &str,
        assignments: &Assignments,
        condition: Option<&Condition>,
    ) -> Result<Statement> {
        let mut sets = Vec::new();
        for (field, assignment) in &assignments.0 {
            if let Some(fragment) = self.compile_assignment(field, assignment)? {
                sets.push(fragment);
            }
        }
        if sets.is_empty() {
            return Err(Error::NoAssignments {
                table: table.to_string(),
            });
        }

        let set = join_fragments(sets, ", ");
        let mut sql = format!("UPDATE {} SET {}", self.ident(table), set.sql);
        let mut params = set.params;
        self.push_where(&mut sql, &mut params, condition)?;
        Ok(self.finish(sql, params))
    }

    pub fn build_delete(&self, table: &str, condition: Option<&Condition>) -> Result<Statement> {
        let mut sql = format!("DELETE FROM {}", self.ident(table));
        let mut params = Vec::new();
        self.push_where(&mut sql, &mut params, condition)?;
        Ok(self.finish(sql, params))
    }

    /// Single-statement insert-or-update keyed on `unique_keys`.
    ///
    /// At least one of the unique keys must be present in `record`.
    pub fn build_upsert(
        &self,
        table: &str,
        record: &Record,
        unique_keys: &[String],
    ) -> Result<Statement> {
        let keys: Vec<String> = unique_keys
            .iter()
            .filter(|k| record.contains_key(k.as_str()))
            .cloned()
            .collect();
        if keys.is_empty() {
            return Err(Error::integrity(
                Operation::Upsert,
                table,
                format!(
                    "payload contains none of the unique keys {:?}",
                    unique_keys
                ),
            ));
        }

        let insert = self.build_insert(table, std::slice::from_ref(record))?;
        let updates: Vec<String> = record
            .keys()
            .filter(|k| !keys.contains(k))
            .cloned()
            .collect();
        let clause = self.dialect.upsert_clause(&keys, &updates)?;
        Ok(Statement::new(
            format!("{} {}", insert.sql, clause),
            insert.params,
        ))
    }

    /// Locking lookup of the row an upsert of `record` would collide with.
    ///
    /// Run in the same transaction as the upsert, it tells the update branch
    /// from the insert branch without relying on affected-row counts. `None`
    /// when no unique key carries a non-NULL value, since NULLs never collide.
    pub fn build_upsert_probe(
        &self,
        table: &str,
        record: &Record,
        unique_keys: &[String],
    ) -> Option<Statement> {
        let mut terms = Vec::new();
        let mut params = Vec::new();
        for key in unique_keys {
            match record.get(key.as_str()) {
                None | Some(SqlValue::Null) => {}
                Some(value) => {
                    terms.push(format!("{} = ?", self.ident(key)));
                    params.push(self.encode(value));
                }
            }
        }
        if terms.is_empty() {
            return None;
        }
        let mut sql = format!(
            "SELECT 1 AS found FROM {} WHERE {}",
            self.ident(table),
            terms.join(" OR ")
        );
        if let Some(limit) = self.dialect.limit_clause(Some(1), None) {
            sql.push(' ');
            sql.push_str(&limit);
        }
        sql.push_str(" FOR UPDATE");
        Some(self.finish(sql, params))
    }
}

/// Every record must declare the same field set as the first one.
pub fn check_uniform_fields(table: &str, records: &[Record]) -> Result<()> {
    let Some(first) = records.first() else {
        return Ok(());
    };
    let expected: BTreeSet<&String> = first.keys().collect();
    for (index, record) in records.iter().enumerate().skip(1) {
        let actual: BTreeSet<&String> = record.keys().collect();
        if actual != expected {
            return Err(Error::FieldMismatch {
                table: table.to_string(),
                index,
                missing: expected.difference(&actual).map(|s| s.to_string()).collect(),
                extra: actual.difference(&expected).map(|s| s.to_string()).collect(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Operator;
    use serde_json::json;

    fn mysql() -> QueryCompiler {
        QueryCompiler::for_kind(DialectKind::Mysql)
    }

    fn pg() -> QueryCompiler {
        QueryCompiler::for_kind(DialectKind::Postgres)
    }

    fn cond(value: serde_json::Value) -> Condition {
        Condition::from_json(value).unwrap()
    }

    fn record(value: serde_json::Value) -> Record {
        crate::value::record_from(&value).unwrap()
    }

    #[test]
    fn literal_and_null_fields() {
        let c = mysql();
        let f = c
            .compile_filter("status", &FieldFilter::Value(1.into()))
            .unwrap();
        assert_eq!(f.sql, "`status` = ?");
        assert_eq!(f.params, vec![SqlValue::Int(1)]);

        let f = c
            .compile_filter("deleted_at", &FieldFilter::Value(SqlValue::Null))
            .unwrap();
        assert_eq!(f.sql, "`deleted_at` IS NULL");
        assert!(f.params.is_empty());

        assert!(c
            .compile_filter("x", &FieldFilter::Absent)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn range_operators_on_one_field_are_grouped() {
        let stmt = mysql()
            .build_select("people", Some(&cond(json!({"age": {"gte": 18, "lt": 60}}))), &SelectOptions::new())
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM `people` WHERE (`age` >= ? AND `age` < ?)"
        );
        assert_eq!(stmt.params, vec![SqlValue::Int(18), SqlValue::Int(60)]);
    }

    #[test]
    fn in_list_expands_placeholders() {
        let f = mysql()
            .compile_filter(
                "status",
                &FieldFilter::Ops(vec![Operator::in_list([1, 2, 3])]),
            )
            .unwrap();
        assert_eq!(f.sql, "`status` IN (?, ?, ?)");
        assert_eq!(f.params, vec![SqlValue::Int(1), SqlValue::Int(2), SqlValue::Int(3)]);
    }

    #[test]
    fn malformed_range_operators() {
        let c = mysql();
        for descriptor in [
            json!({"id": {"in": 5}}),
            json!({"id": {"in": []}}),
            json!({"id": {"notIn": "a"}}),
            json!({"id": {"between": [1]}}),
            json!({"id": {"notBetween": [1, 2, 3]}}),
            json!({"id": {"between": 4}}),
        ] {
            let err = c.compile_condition(&cond(descriptor.clone())).unwrap_err();
            assert!(
                matches!(err, Error::MalformedOperator { .. }),
                "{} -> {:?}",
                descriptor,
                err
            );
        }
    }

    #[test]
    fn between_and_string_operators() {
        let c = mysql();
        let f = c
            .compile_condition(&cond(json!({"price": {"between": [10, 20]}})))
            .unwrap();
        assert_eq!(f.sql, "`price` BETWEEN ? AND ?");

        let f = c
            .compile_condition(&cond(json!({"name": {"startsWith": "50%"}})))
            .unwrap();
        assert_eq!(f.sql, "`name` LIKE ?");
        assert_eq!(f.params, vec![SqlValue::Text("50\\%%".into())]);

        let f = c
            .compile_condition(&cond(json!({"name": {"contains": "ab"}})))
            .unwrap();
        assert_eq!(f.params, vec![SqlValue::Text("%ab%".into())]);

        let f = c
            .compile_condition(&cond(json!({"name": {"rlike": "^a"}})))
            .unwrap();
        assert_eq!(f.sql, "`name` REGEXP ?");

        let f = pg()
            .compile_condition(&cond(json!({"name": {"notRlike": "^a"}})))
            .unwrap();
        assert_eq!(f.sql, "\"name\" !~ ?");
    }

    #[test]
    fn null_operators() {
        let c = mysql();
        let f = c
            .compile_condition(&cond(json!({"a": {"isNull": true}, "b": {"isNotNull": true}, "c": {"ne": null}})))
            .unwrap();
        assert_eq!(f.sql, "`a` IS NULL AND `b` IS NOT NULL AND `c` IS NOT NULL");
        assert!(f.params.is_empty());
    }

    #[test]
    fn or_group_parenthesized_only_with_siblings() {
        let c = mysql();
        let alone = c
            .compile_condition(&cond(json!({"OR": [{"a": 1}, {"b": 2}]})))
            .unwrap();
        assert_eq!(alone.sql, "`a` = ? OR `b` = ?");

        let with_sibling = c
            .compile_condition(&cond(json!({"status": 1, "OR": [{"a": 1}, {"b": 2}]})))
            .unwrap();
        assert_eq!(with_sibling.sql, "`status` = ? AND (`a` = ? OR `b` = ?)");
        assert_eq!(
            with_sibling.params,
            vec![SqlValue::Int(1), SqlValue::Int(1), SqlValue::Int(2)]
        );
    }

    #[test]
    fn or_members_with_several_fields_are_grouped() {
        let f = mysql()
            .compile_condition(&cond(json!({"OR": [{"a": 1, "b": 2}, {"c": 3}]})))
            .unwrap();
        assert_eq!(f.sql, "(`a` = ? AND `b` = ?) OR `c` = ?");
    }

    #[test]
    fn and_members_containing_or_are_grouped() {
        let f = mysql()
            .compile_condition(&cond(json!({
                "AND": [
                    {"x": 1},
                    {"OR": [{"y": 2}, {"z": 3}]}
                ]
            })))
            .unwrap();
        assert_eq!(f.sql, "`x` = ? AND (`y` = ? OR `z` = ?)");
    }

    #[test]
    fn raw_conditions() {
        let c = mysql();
        let f = c.compile_condition(&Condition::raw("id > 3")).unwrap();
        assert_eq!(f.sql, "id > 3");
        let f = c
            .compile_condition(&Condition::raw_params("id > ? AND id < ?", [3, 9]))
            .unwrap();
        assert_eq!(f.params.len(), 2);
        let err = c
            .compile_condition(&Condition::raw_params("id > ?", [3, 9]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor { .. }));
    }

    #[test]
    fn assignments() {
        let c = mysql();
        let f = c
            .compile_assignment("views", &Assignment::Op(UpdateOp::Increment, 2.into()))
            .unwrap()
            .unwrap();
        assert_eq!(f.sql, "`views` = `views` + ?");

        let f = c
            .compile_assignment("deleted_at", &Assignment::Value(SqlValue::Null))
            .unwrap()
            .unwrap();
        assert_eq!(f.sql, "`deleted_at` = NULL");
        assert!(f.params.is_empty());

        assert!(c
            .compile_assignment("x", &Assignment::Absent)
            .unwrap()
            .is_none());

        let err = c
            .compile_assignment("n", &Assignment::Op(UpdateOp::Divide, SqlValue::Null))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedOperator { .. }));
    }

    #[test]
    fn update_requires_assignments() {
        let c = mysql();
        let err = c
            .build_update(
                "users",
                &Assignments::new().opt("name", None::<String>),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::NoAssignments { .. }));

        let stmt = c
            .build_update(
                "users",
                &Assignments::new().set("name", "ada").multiply("score", 2),
                Some(&cond(json!({"id": 7}))),
            )
            .unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE `users` SET `name` = ?, `score` = `score` * ? WHERE `id` = ?"
        );
        assert_eq!(
            stmt.params,
            vec![SqlValue::Text("ada".into()), SqlValue::Int(2), SqlValue::Int(7)]
        );
    }

    #[test]
    fn insert_batch() {
        let c = mysql();
        let stmt = c
            .build_insert(
                "users",
                &[
                    record(json!({"name": "a", "age": 1})),
                    record(json!({"age": 2, "name": "b"})),
                ],
            )
            .unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO `users` (`age`, `name`) VALUES (?, ?), (?, ?)"
        );
        assert_eq!(
            stmt.params,
            vec![
                SqlValue::Int(1),
                SqlValue::Text("a".into()),
                SqlValue::Int(2),
                SqlValue::Text("b".into())
            ]
        );

        assert!(matches!(
            c.build_insert("users", &[]).unwrap_err(),
            Error::EmptyInsert { .. }
        ));
    }

    #[test]
    fn insert_inlines_nulls() {
        let stmt = QueryCompiler::for_kind(DialectKind::Postgres)
            .build_insert(
                "users",
                &[
                    record(json!({"name": "a", "age": null})),
                    record(json!({"age": 2, "name": "b"})),
                ],
            )
            .unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"users\" (\"age\", \"name\") VALUES (NULL, $1), ($2, $3)"
        );
        assert_eq!(stmt.params.len(), 3);
    }

    #[test]
    fn field_mismatch_reports_first_bad_index() {
        let err = check_uniform_fields(
            "users",
            &[
                record(json!({"a": 1, "b": 2})),
                record(json!({"b": 2, "a": 1})),
                record(json!({"a": 1, "c": 3})),
                record(json!({"z": 1})),
            ],
        )
        .unwrap_err();
        match err {
            Error::FieldMismatch {
                index,
                missing,
                extra,
                ..
            } => {
                assert_eq!(index, 2);
                assert_eq!(missing, vec!["b".to_string()]);
                assert_eq!(extra, vec!["c".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn select_clause_order_and_param_order() {
        let options = SelectOptions::new()
            .columns(["u.id", "COUNT(*) AS orders"])
            .join(
                Join::left("orders")
                    .alias("o")
                    .on_condition(Condition::raw_params("o.user_id = u.id AND o.kind = ?", ["paid"])),
            )
            .group_by(["u.id"])
            .having(Condition::raw_params("COUNT(*) > ?", [2]))
            .order_by(OrderBy::parse("-u.id"))
            .limit(10)
            .offset(20);
        let stmt = mysql()
            .build_select("users", Some(&cond(json!({"u.active": true}))), &options)
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT `u`.`id`, COUNT(*) AS orders FROM `users` LEFT JOIN `orders` AS `o` ON o.user_id = u.id AND o.kind = ? WHERE `u`.`active` = ? GROUP BY `u`.`id` HAVING COUNT(*) > ? ORDER BY `u`.`id` DESC LIMIT 10 OFFSET 20"
        );
        assert_eq!(
            stmt.params,
            vec![SqlValue::Text("paid".into()), SqlValue::Int(1), SqlValue::Int(2)]
        );
    }

    #[test]
    fn join_validation() {
        let c = mysql();
        let err = c
            .build_select("a", None, &SelectOptions::new().join(Join::inner("b")))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidJoin { .. }));

        let err = c
            .build_select(
                "a",
                None,
                &SelectOptions::new().join(Join::new("SIDEWAYS", "b").on("a.id = b.id")),
            )
            .unwrap_err();
        assert!(err.to_string().contains("unknown join type"));

        let stmt = c
            .build_select("a", None, &SelectOptions::new().join(Join::cross("b")))
            .unwrap();
        assert_eq!(stmt.sql, "SELECT * FROM `a` CROSS JOIN `b`");

        let stmt = c
            .build_select("a", None, &SelectOptions::new().join(Join::inner("b").using(["id"])))
            .unwrap();
        assert_eq!(stmt.sql, "SELECT * FROM `a` INNER JOIN `b` USING (`id`)");
    }

    #[test]
    fn exists_is_a_minimal_probe() {
        let stmt = mysql()
            .build_exists("users", Some(&cond(json!({"email": "a@b.c"}))), &[])
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT 1 AS found FROM `users` WHERE `email` = ? LIMIT 1"
        );
    }

    #[test]
    fn count_statements() {
        let c = mysql();
        let stmt = c
            .build_count("users", Some(&cond(json!({"active": 1}))), &SelectOptions::new().limit(5))
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT COUNT(*) AS count FROM `users` WHERE `active` = ?"
        );

        let stmt = pg()
            .build_count(
                "orders",
                Some(&cond(json!({"state": "paid"}))),
                &SelectOptions::new().group_by(["user_id"]),
            )
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT COUNT(*) AS count FROM (SELECT * FROM \"orders\" WHERE \"state\" = $1 GROUP BY \"user_id\") AS counted"
        );
    }

    #[test]
    fn delete_statement() {
        let stmt = pg()
            .build_delete("users", Some(&cond(json!({"id": {"in": [1, 2]}}))))
            .unwrap();
        assert_eq!(stmt.sql, "DELETE FROM \"users\" WHERE \"id\" IN ($1, $2)");
    }

    #[test]
    fn upsert_statements() {
        let c = mysql();
        let stmt = c
            .build_upsert(
                "users",
                &record(json!({"email": "a@b.c", "name": "ada"})),
                &["email".to_string()],
            )
            .unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO `users` (`email`, `name`) VALUES (?, ?) ON DUPLICATE KEY UPDATE `name` = VALUES(`name`)"
        );

        let err = c
            .build_upsert("users", &record(json!({"name": "ada"})), &["email".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));

        let stmt = pg()
            .build_upsert(
                "users",
                &record(json!({"email": "a@b.c", "name": "ada"})),
                &["email".to_string()],
            )
            .unwrap();
        assert!(stmt.sql.starts_with("INSERT INTO \"users\" (\"email\", \"name\") VALUES ($1, $2) ON CONFLICT"));
        assert!(stmt.is_consistent());
    }

    #[test]
    fn upsert_probe_locks_the_colliding_keys() {
        let c = mysql();
        let keys = ["email".to_string(), "handle".to_string()];
        let stmt = c
            .build_upsert_probe(
                "users",
                &record(json!({"email": "a@b.c", "handle": null, "name": "ada"})),
                &keys,
            )
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT 1 AS found FROM `users` WHERE `email` = ? LIMIT 1 FOR UPDATE"
        );
        assert_eq!(stmt.params, vec![SqlValue::from("a@b.c")]);

        let stmt = c
            .build_upsert_probe(
                "users",
                &record(json!({"email": "a@b.c", "handle": "ada"})),
                &keys,
            )
            .unwrap();
        assert!(stmt.sql.contains("WHERE `email` = ? OR `handle` = ?"));

        assert!(c
            .build_upsert_probe("users", &record(json!({"handle": null})), &keys)
            .is_none());
    }

    #[test]
    fn postgres_numbers_across_clauses() {
        let options = SelectOptions::new().having(Condition::raw_params("COUNT(*) > ?", [1]));
        let stmt = pg()
            .build_select(
                "t",
                Some(&cond(json!({"a": 1, "b": {"in": [2, 3]}}))),
                &options,
            )
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"t\" WHERE \"a\" = $1 AND \"b\" IN ($2, $3) HAVING COUNT(*) > $4"
        );
        assert_eq!(stmt.params.len(), 4);
    }
}
