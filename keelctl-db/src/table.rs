//! Table repository facade.
//!
//! Every method compiles a descriptor, runs it through the database's
//! driver (pinned connection inside a transaction, retry protocol outside)
//! and, for mutations, records an [`OperationResult`] readable through
//! [`Table::last_result`].

use std::sync::{Arc, Mutex, PoisonError};

use keelctl_core::{
    check_uniform_fields, Assignments, Condition, Error, Operation, Paginated, Pagination, Record,
    Result, Row, SelectOptions, UpsertSignal,
};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::database::Database;

/// Which branch of an upsert fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Insert,
    Update,
}

/// Outcome of the last mutating call on a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub operation: Operation,
    pub affected_rows: u64,
    /// First generated id (MySQL only).
    pub insert_id: Option<u64>,
    pub upsert_action: Option<UpsertAction>,
}

impl OperationResult {
    fn new(operation: Operation, affected_rows: u64) -> Self {
        Self {
            operation,
            affected_rows,
            insert_id: None,
            upsert_action: None,
        }
    }
}

/// Per-table state shared by every handle to the same table.
pub(crate) struct TableState {
    name: String,
    last: Mutex<Option<OperationResult>>,
}

impl TableState {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            last: Mutex::new(None),
        }
    }
}

#[derive(Clone)]
pub struct Table {
    db: Database,
    state: Arc<TableState>,
    target: String,
}

impl Table {
    pub(crate) fn new(db: Database, state: Arc<TableState>) -> Self {
        let target = format!("{}::{}", db.name(), state.name);
        Self { db, state, target }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// `database::table`, used in errors and logs.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn same_table(&self, other: &Table) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Result of the most recent mutating call; never reset.
    pub fn last_result(&self) -> Option<OperationResult> {
        self.state
            .last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, result: OperationResult) -> OperationResult {
        *self.state.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(result.clone());
        result
    }

    fn context(&self, op: Operation) -> impl FnOnce(Error) -> Error + '_ {
        move |e| e.at(op, &self.target)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// First row matching `condition`.
    pub async fn get(&self, condition: impl Into<Condition>) -> Result<Option<Row>> {
        self.get_with(condition, SelectOptions::new()).await
    }

    pub async fn get_with(
        &self,
        condition: impl Into<Condition>,
        options: SelectOptions,
    ) -> Result<Option<Row>> {
        let rows = self.gets(condition, options.limit(1)).await?;
        Ok(rows.into_iter().next())
    }

    /// First matching row decoded into `T`.
    pub async fn get_as<T: DeserializeOwned>(
        &self,
        condition: impl Into<Condition>,
    ) -> Result<Option<T>> {
        match self.get(condition).await? {
            Some(row) => row
                .decode()
                .map(Some)
                .map_err(|e| decode_context(e, &self.target)),
            None => Ok(None),
        }
    }

    /// All rows matching `condition`.
    pub async fn gets(
        &self,
        condition: impl Into<Condition>,
        options: SelectOptions,
    ) -> Result<Vec<Row>> {
        let condition = condition.into();
        let stmt = self
            .db
            .compiler()
            .build_select(&self.state.name, Some(&condition), &options)
            .map_err(self.context(Operation::Select))?;
        self.db
            .driver()
            .query(&stmt, Operation::Select, &self.target)
            .await
    }

    pub async fn gets_as<T: DeserializeOwned>(
        &self,
        condition: impl Into<Condition>,
        options: SelectOptions,
    ) -> Result<Vec<T>> {
        self.gets(condition, options)
            .await?
            .into_iter()
            .map(|row| row.decode().map_err(|e| decode_context(e, &self.target)))
            .collect()
    }

    pub async fn count(&self, condition: impl Into<Condition>) -> Result<u64> {
        self.count_with(condition, &SelectOptions::new()).await
    }

    /// Count rows the equivalent select would return, ignoring ORDER BY and
    /// LIMIT/OFFSET.
    pub async fn count_with(
        &self,
        condition: impl Into<Condition>,
        options: &SelectOptions,
    ) -> Result<u64> {
        let condition = condition.into();
        let stmt = self
            .db
            .compiler()
            .build_count(&self.state.name, Some(&condition), options)
            .map_err(self.context(Operation::Count))?;
        let rows = self
            .db
            .driver()
            .query(&stmt, Operation::Count, &self.target)
            .await?;
        match rows.first() {
            Some(row) => count_value(row).map_err(|e| decode_context(e, &self.target)),
            None => Ok(0),
        }
    }

    /// `SELECT 1 ... LIMIT 1`.
    pub async fn exists(&self, condition: impl Into<Condition>) -> Result<bool> {
        let condition = condition.into();
        let stmt = self
            .db
            .compiler()
            .build_exists(&self.state.name, Some(&condition), &[])
            .map_err(self.context(Operation::Exists))?;
        let rows = self
            .db
            .driver()
            .query(&stmt, Operation::Exists, &self.target)
            .await?;
        Ok(!rows.is_empty())
    }

    /// One page of rows plus the total matching count.
    pub async fn paginate(
        &self,
        condition: impl Into<Condition>,
        options: SelectOptions,
        page: Pagination,
    ) -> Result<Paginated<Row>> {
        let condition = condition.into();
        let total = self.count_with(condition.clone(), &options).await?;
        let items = self
            .gets(condition, options.limit(page.limit()).offset(page.offset()))
            .await?;
        Ok(Paginated {
            items,
            total,
            page: page.page,
            per_page: page.per_page,
        })
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Insert one record.
    pub async fn add(&self, record: Record) -> Result<OperationResult> {
        self.adds(std::slice::from_ref(&record)).await
    }

    /// Insert a batch in one statement.
    ///
    /// Every record must have the same field set. The statement must report
    /// exactly `records.len()` affected rows.
    pub async fn adds(&self, records: &[Record]) -> Result<OperationResult> {
        check_uniform_fields(&self.target, records)?;
        let stmt = self
            .db
            .compiler()
            .build_insert(&self.state.name, records)
            .map_err(self.context(Operation::Insert))?;
        let done = self
            .db
            .driver()
            .execute(&stmt, Operation::Insert, &self.target)
            .await?;

        if done.affected_rows != records.len() as u64 {
            return Err(Error::integrity(
                Operation::Insert,
                &self.target,
                format!(
                    "expected {} inserted rows, database reported {}",
                    records.len(),
                    done.affected_rows
                ),
            ));
        }

        Ok(self.record(OperationResult {
            insert_id: done.last_insert_id,
            ..OperationResult::new(Operation::Insert, done.affected_rows)
        }))
    }

    /// Update rows matching `condition`.
    ///
    /// With no resolvable assignments nothing is sent and the result reports
    /// zero affected rows.
    pub async fn update(
        &self,
        condition: impl Into<Condition>,
        assignments: impl Into<Assignments>,
    ) -> Result<OperationResult> {
        let condition = condition.into();
        let assignments = assignments.into();
        let stmt = match self
            .db
            .compiler()
            .build_update(&self.state.name, &assignments, Some(&condition))
        {
            Ok(stmt) => stmt,
            Err(Error::NoAssignments { .. }) => {
                debug!(table = %self.target, "update has no assignments, skipping");
                return Ok(self.record(OperationResult::new(Operation::Update, 0)));
            }
            Err(e) => return Err(e.at(Operation::Update, &self.target)),
        };
        let done = self
            .db
            .driver()
            .execute(&stmt, Operation::Update, &self.target)
            .await?;
        Ok(self.record(OperationResult::new(Operation::Update, done.affected_rows)))
    }

    /// Add `by` to `field` on every matching row.
    pub async fn increment(
        &self,
        condition: impl Into<Condition>,
        field: &str,
        by: i64,
    ) -> Result<OperationResult> {
        let assignments = if by < 0 {
            Assignments::new().decrement(field, by.unsigned_abs())
        } else {
            Assignments::new().increment(field, by)
        };
        self.update(condition, assignments).await
    }

    /// Delete rows matching `condition`.
    pub async fn remove(&self, condition: impl Into<Condition>) -> Result<OperationResult> {
        let condition = condition.into();
        let stmt = self
            .db
            .compiler()
            .build_delete(&self.state.name, Some(&condition))
            .map_err(self.context(Operation::Delete))?;
        let done = self
            .db
            .driver()
            .execute(&stmt, Operation::Delete, &self.target)
            .await?;
        Ok(self.record(OperationResult::new(Operation::Delete, done.affected_rows)))
    }

    /// Insert `record`, or update the row that collides on one of
    /// `unique_keys`. At least one unique key must be present in `record`.
    pub async fn upsert(&self, record: Record, unique_keys: &[&str]) -> Result<OperationResult> {
        let keys: Vec<String> = unique_keys.iter().map(|k| k.to_string()).collect();
        let stmt = self
            .db
            .compiler()
            .build_upsert(&self.state.name, &record, &keys)
            .map_err(|e| match e {
                Error::Integrity { reason, .. } => {
                    Error::integrity(Operation::Upsert, &self.target, reason)
                }
                other => other.at(Operation::Upsert, &self.target),
            })?;

        let driver = self.db.driver();
        let result = match self.db.compiler().dialect().upsert_signal() {
            UpsertSignal::AffectedRows => {
                // The client always negotiates FOUND_ROWS, so a duplicate that
                // changes nothing reports 1 just like an insert. The locking
                // probe settles which branch fired.
                let probe = self
                    .db
                    .compiler()
                    .build_upsert_probe(&self.state.name, &record, &keys);
                let (existed, done) = match probe {
                    Some(probe) => {
                        let (rows, done) = driver
                            .query_then_execute(&probe, &stmt, Operation::Upsert, &self.target)
                            .await?;
                        (!rows.is_empty(), done)
                    }
                    None => (
                        false,
                        driver
                            .execute(&stmt, Operation::Upsert, &self.target)
                            .await?,
                    ),
                };
                let action = if existed || done.affected_rows != 1 {
                    UpsertAction::Update
                } else {
                    UpsertAction::Insert
                };
                OperationResult {
                    insert_id: done.last_insert_id.filter(|_| action == UpsertAction::Insert),
                    upsert_action: Some(action),
                    ..OperationResult::new(Operation::Upsert, done.affected_rows)
                }
            }
            UpsertSignal::ReturningInserted => {
                let rows = driver.query(&stmt, Operation::Upsert, &self.target).await?;
                let inserted = rows
                    .first()
                    .and_then(|row| row.get("inserted"))
                    .and_then(JsonValue::as_bool)
                    .unwrap_or(false);
                OperationResult {
                    upsert_action: Some(if inserted {
                        UpsertAction::Insert
                    } else {
                        UpsertAction::Update
                    }),
                    ..OperationResult::new(Operation::Upsert, rows.len() as u64)
                }
            }
        };
        Ok(self.record(result))
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").field("target", &self.target).finish()
    }
}

fn count_value(row: &Row) -> Result<u64> {
    match row.get("count") {
        Some(JsonValue::Number(n)) => n
            .as_u64()
            .ok_or_else(|| Error::decode("count", format!("not a row count: {}", n))),
        // NUMERIC/DECIMAL counts arrive as strings.
        Some(JsonValue::String(s)) => s
            .parse()
            .map_err(|_| Error::decode("count", format!("not a row count: {}", s))),
        other => Err(Error::decode("count", format!("unexpected count value {:?}", other))),
    }
}

fn decode_context(err: Error, target: &str) -> Error {
    match err {
        Error::Decode { message, .. } => Error::decode(target, message),
        other => other,
    }
}
