//! Data-shaped query and update descriptors.
//!
//! Descriptors can be built in code with the builder methods or parsed from
//! JSON (`{"age": {"gte": 18, "lt": 60}, "OR": [...]}`). Shape problems that
//! only show up when compiling (wrong arity, non-array range arguments) are
//! kept in the descriptor and reported by the compiler.

use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::value::{Record, SqlValue};

/// Comparison operators accepted inside a field operator-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Between,
    NotBetween,
    Like,
    NotLike,
    Rlike,
    NotRlike,
    StartsWith,
    EndsWith,
    Contains,
    IsNull,
    IsNotNull,
}

impl OpKind {
    pub const ALL: [OpKind; 19] = [
        OpKind::Eq,
        OpKind::Ne,
        OpKind::Gt,
        OpKind::Gte,
        OpKind::Lt,
        OpKind::Lte,
        OpKind::In,
        OpKind::NotIn,
        OpKind::Between,
        OpKind::NotBetween,
        OpKind::Like,
        OpKind::NotLike,
        OpKind::Rlike,
        OpKind::NotRlike,
        OpKind::StartsWith,
        OpKind::EndsWith,
        OpKind::Contains,
        OpKind::IsNull,
        OpKind::IsNotNull,
    ];

    /// Descriptor key for this operator.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Eq => "eq",
            OpKind::Ne => "ne",
            OpKind::Gt => "gt",
            OpKind::Gte => "gte",
            OpKind::Lt => "lt",
            OpKind::Lte => "lte",
            OpKind::In => "in",
            OpKind::NotIn => "notIn",
            OpKind::Between => "between",
            OpKind::NotBetween => "notBetween",
            OpKind::Like => "like",
            OpKind::NotLike => "notLike",
            OpKind::Rlike => "rlike",
            OpKind::NotRlike => "notRlike",
            OpKind::StartsWith => "startsWith",
            OpKind::EndsWith => "endsWith",
            OpKind::Contains => "contains",
            OpKind::IsNull => "isNull",
            OpKind::IsNotNull => "isNotNull",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }

    /// `in`, `notIn`, `between`, `notBetween` take an array argument.
    pub fn is_range(&self) -> bool {
        matches!(
            self,
            OpKind::In | OpKind::NotIn | OpKind::Between | OpKind::NotBetween
        )
    }
}

/// Operator argument as supplied; arity is checked at compile time.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(SqlValue),
    List(Vec<SqlValue>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operator {
    pub kind: OpKind,
    pub operand: Operand,
}

impl Operator {
    pub fn new(kind: OpKind, value: impl Into<SqlValue>) -> Self {
        Self {
            kind,
            operand: Operand::Value(value.into()),
        }
    }

    pub fn list<I, V>(kind: OpKind, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        Self {
            kind,
            operand: Operand::List(values.into_iter().map(Into::into).collect()),
        }
    }

    pub fn eq(v: impl Into<SqlValue>) -> Self {
        Self::new(OpKind::Eq, v)
    }

    pub fn ne(v: impl Into<SqlValue>) -> Self {
        Self::new(OpKind::Ne, v)
    }

    pub fn gt(v: impl Into<SqlValue>) -> Self {
        Self::new(OpKind::Gt, v)
    }

    pub fn gte(v: impl Into<SqlValue>) -> Self {
        Self::new(OpKind::Gte, v)
    }

    pub fn lt(v: impl Into<SqlValue>) -> Self {
        Self::new(OpKind::Lt, v)
    }

    pub fn lte(v: impl Into<SqlValue>) -> Self {
        Self::new(OpKind::Lte, v)
    }

    pub fn in_list<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        Self::list(OpKind::In, values)
    }

    pub fn not_in<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        Self::list(OpKind::NotIn, values)
    }

    pub fn between(low: impl Into<SqlValue>, high: impl Into<SqlValue>) -> Self {
        Self {
            kind: OpKind::Between,
            operand: Operand::List(vec![low.into(), high.into()]),
        }
    }

    pub fn not_between(low: impl Into<SqlValue>, high: impl Into<SqlValue>) -> Self {
        Self {
            kind: OpKind::NotBetween,
            operand: Operand::List(vec![low.into(), high.into()]),
        }
    }

    pub fn like(pattern: impl Into<String>) -> Self {
        Self::new(OpKind::Like, pattern.into())
    }

    pub fn starts_with(prefix: impl Into<String>) -> Self {
        Self::new(OpKind::StartsWith, prefix.into())
    }

    pub fn ends_with(suffix: impl Into<String>) -> Self {
        Self::new(OpKind::EndsWith, suffix.into())
    }

    pub fn contains(needle: impl Into<String>) -> Self {
        Self::new(OpKind::Contains, needle.into())
    }

    pub fn is_null() -> Self {
        Self::new(OpKind::IsNull, true)
    }

    pub fn is_not_null() -> Self {
        Self::new(OpKind::IsNotNull, true)
    }
}

/// What a single field contributes to a WHERE/HAVING clause.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldFilter {
    /// Field is skipped; compiles to nothing.
    Absent,
    /// `field = ?`, or `field IS NULL` for null.
    Value(SqlValue),
    /// One fragment per operator, ANDed together.
    Ops(Vec<Operator>),
}

/// Field conditions plus optional nested `AND`/`OR` groups.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filters {
    pub fields: Vec<(String, FieldFilter)>,
    pub and: Option<Vec<Filters>>,
    pub or: Option<Vec<Filters>>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, filter: FieldFilter) -> Self {
        self.fields.push((name.into(), filter));
        self
    }

    /// `name = value` (or `IS NULL` for a null value).
    pub fn eq(self, name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.field(name, FieldFilter::Value(value.into()))
    }

    /// Like [`Filters::eq`] but skips the field entirely when `value` is `None`.
    pub fn opt<V: Into<SqlValue>>(self, name: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(v) => self.eq(name, v),
            None => self.field(name, FieldFilter::Absent),
        }
    }

    pub fn op(self, name: impl Into<String>, operator: Operator) -> Self {
        self.field(name, FieldFilter::Ops(vec![operator]))
    }

    pub fn ops(self, name: impl Into<String>, operators: Vec<Operator>) -> Self {
        self.field(name, FieldFilter::Ops(operators))
    }

    pub fn and(mut self, members: Vec<Filters>) -> Self {
        self.and = Some(members);
        self
    }

    pub fn or(mut self, members: Vec<Filters>) -> Self {
        self.or = Some(members);
        self
    }

    /// Number of fields that will actually produce SQL.
    pub fn present_field_count(&self) -> usize {
        self.fields
            .iter()
            .filter(|(_, f)| !matches!(f, FieldFilter::Absent))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.present_field_count() == 0
            && self.and.as_ref().map_or(true, |m| m.iter().all(Filters::is_empty))
            && self.or.as_ref().map_or(true, |m| m.iter().all(Filters::is_empty))
    }
}

/// WHERE/HAVING descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Filters(Filters),
    /// Raw SQL fragment, inserted verbatim.
    Raw(String),
    /// Raw fragment with `?` placeholders and their values.
    RawParams(String, Vec<SqlValue>),
}

impl Condition {
    pub fn raw(sql: impl Into<String>) -> Self {
        Condition::Raw(sql.into())
    }

    pub fn raw_params<I, V>(sql: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        Condition::RawParams(sql.into(), params.into_iter().map(Into::into).collect())
    }

    /// Parse the JSON descriptor form.
    ///
    /// * object → field filters (with optional `AND`/`OR` arrays)
    /// * string → raw fragment
    /// * `[string, [params...]]` → raw fragment with parameters
    pub fn from_json(value: JsonValue) -> Result<Self> {
        match value {
            JsonValue::String(sql) => Ok(Condition::Raw(sql)),
            JsonValue::Array(mut items) if items.len() == 2 && items[0].is_string() => {
                let params = items.pop().unwrap_or(JsonValue::Null);
                let sql = items.pop().and_then(|v| v.as_str().map(str::to_string));
                match (sql, params) {
                    (Some(sql), JsonValue::Array(params)) => Ok(Condition::RawParams(
                        sql,
                        params.into_iter().map(SqlValue::from).collect(),
                    )),
                    _ => Err(Error::invalid_descriptor(
                        "raw condition must be [sql, [params...]]",
                    )),
                }
            }
            JsonValue::Object(_) => Ok(Condition::Filters(Filters::from_json(value)?)),
            other => Err(Error::invalid_descriptor(format!(
                "unsupported condition shape: {}",
                other
            ))),
        }
    }
}

impl From<Filters> for Condition {
    fn from(filters: Filters) -> Self {
        Condition::Filters(filters)
    }
}

impl Filters {
    pub fn from_json(value: JsonValue) -> Result<Self> {
        let JsonValue::Object(map) = value else {
            return Err(Error::invalid_descriptor("filters must be a JSON object"));
        };

        let mut filters = Filters::new();
        for (key, value) in map {
            match key.as_str() {
                "AND" | "and" => filters.and = Some(parse_group(&key, value)?),
                "OR" | "or" => filters.or = Some(parse_group(&key, value)?),
                _ => {
                    let filter = parse_field_filter(&key, value)?;
                    filters.fields.push((key, filter));
                }
            }
        }
        Ok(filters)
    }
}

fn parse_group(key: &str, value: JsonValue) -> Result<Vec<Filters>> {
    match value {
        JsonValue::Array(members) => members.into_iter().map(Filters::from_json).collect(),
        _ => Err(Error::invalid_descriptor(format!(
            "'{}' must be an array of conditions",
            key
        ))),
    }
}

fn parse_field_filter(field: &str, value: JsonValue) -> Result<FieldFilter> {
    let JsonValue::Object(map) = value else {
        return Ok(FieldFilter::Value(value.into()));
    };

    let mut ops = Vec::with_capacity(map.len());
    for (name, arg) in map {
        let kind = OpKind::parse(&name)
            .ok_or_else(|| Error::malformed_operator(field, &name, "unknown operator"))?;
        let operand = match arg {
            JsonValue::Array(items) => Operand::List(items.into_iter().map(Into::into).collect()),
            other => Operand::Value(other.into()),
        };
        ops.push(Operator { kind, operand });
    }
    Ok(FieldFilter::Ops(ops))
}

/// Arithmetic or direct-set update operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Set,
    Increment,
    Decrement,
    Multiply,
    Divide,
}

impl UpdateOp {
    pub fn name(&self) -> &'static str {
        match self {
            UpdateOp::Set => "set",
            UpdateOp::Increment => "increment",
            UpdateOp::Decrement => "decrement",
            UpdateOp::Multiply => "multiply",
            UpdateOp::Divide => "divide",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "set" => Some(UpdateOp::Set),
            "increment" => Some(UpdateOp::Increment),
            "decrement" => Some(UpdateOp::Decrement),
            "multiply" => Some(UpdateOp::Multiply),
            "divide" => Some(UpdateOp::Divide),
            _ => None,
        }
    }

    /// SQL arithmetic symbol, `None` for a direct set.
    pub fn symbol(&self) -> Option<&'static str> {
        match self {
            UpdateOp::Set => None,
            UpdateOp::Increment => Some("+"),
            UpdateOp::Decrement => Some("-"),
            UpdateOp::Multiply => Some("*"),
            UpdateOp::Divide => Some("/"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Absent,
    Value(SqlValue),
    Op(UpdateOp, SqlValue),
}

/// Update descriptor: field → assignment, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignments(pub Vec<(String, Assignment)>);

impl Assignments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(mut self, field: impl Into<String>, assignment: Assignment) -> Self {
        self.0.push((field.into(), assignment));
        self
    }

    pub fn set(self, field: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.assign(field, Assignment::Value(value.into()))
    }

    /// Assign only when `value` is `Some`.
    pub fn opt<V: Into<SqlValue>>(self, field: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(v) => self.set(field, v),
            None => self.assign(field, Assignment::Absent),
        }
    }

    pub fn null(self, field: impl Into<String>) -> Self {
        self.assign(field, Assignment::Value(SqlValue::Null))
    }

    pub fn increment(self, field: impl Into<String>, by: impl Into<SqlValue>) -> Self {
        self.assign(field, Assignment::Op(UpdateOp::Increment, by.into()))
    }

    pub fn decrement(self, field: impl Into<String>, by: impl Into<SqlValue>) -> Self {
        self.assign(field, Assignment::Op(UpdateOp::Decrement, by.into()))
    }

    pub fn multiply(self, field: impl Into<String>, by: impl Into<SqlValue>) -> Self {
        self.assign(field, Assignment::Op(UpdateOp::Multiply, by.into()))
    }

    pub fn divide(self, field: impl Into<String>, by: impl Into<SqlValue>) -> Self {
        self.assign(field, Assignment::Op(UpdateOp::Divide, by.into()))
    }

    pub fn resolvable_count(&self) -> usize {
        self.0
            .iter()
            .filter(|(_, a)| !matches!(a, Assignment::Absent))
            .count()
    }

    pub fn from_json(value: JsonValue) -> Result<Self> {
        let JsonValue::Object(map) = value else {
            return Err(Error::invalid_descriptor("update must be a JSON object"));
        };

        let mut out = Assignments::new();
        for (field, value) in map {
            let assignment = match value {
                JsonValue::Object(inner)
                    if inner.keys().any(|k| UpdateOp::parse(k).is_some()) =>
                {
                    if inner.len() != 1 {
                        return Err(Error::malformed_operator(
                            &field,
                            inner.keys().cloned().collect::<Vec<_>>().join(","),
                            "exactly one update operator is allowed per field",
                        ));
                    }
                    let (name, arg) = inner.into_iter().next().ok_or_else(|| {
                        Error::invalid_descriptor("update operator object is empty")
                    })?;
                    let op = UpdateOp::parse(&name).ok_or_else(|| {
                        Error::malformed_operator(&field, &name, "unknown update operator")
                    })?;
                    Assignment::Op(op, arg.into())
                }
                other => Assignment::Value(other.into()),
            };
            out.0.push((field, assignment));
        }
        Ok(out)
    }
}

impl From<Record> for Assignments {
    fn from(record: Record) -> Self {
        Assignments(
            record
                .into_iter()
                .map(|(k, v)| (k, Assignment::Value(v)))
                .collect(),
        )
    }
}
