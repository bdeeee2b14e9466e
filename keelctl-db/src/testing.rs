//! Scripted in-memory backend for driver and facade tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use keelctl_core::{DialectKind, Error, Result, Row, Statement};

use crate::backend::{Connector, ExecResult, PinnedConnection, PoolHandle};

/// Next outcome handed to a statement.
pub(crate) enum Response {
    Rows(Vec<Row>),
    Exec(ExecResult),
    Fail(Error),
}

struct Shared {
    kind: DialectKind,
    connects: AtomicU64,
    /// Pools with a generation below this fail every statement.
    healthy_from: AtomicU64,
    latency: Mutex<Duration>,
    responses: Mutex<VecDeque<Response>>,
    log: Mutex<Vec<String>>,
    statements: Mutex<Vec<Statement>>,
}

#[derive(Clone)]
pub(crate) struct FakeBackend {
    shared: Arc<Shared>,
}

impl FakeBackend {
    pub(crate) fn new(kind: DialectKind) -> Self {
        Self {
            shared: Arc::new(Shared {
                kind,
                connects: AtomicU64::new(0),
                healthy_from: AtomicU64::new(0),
                latency: Mutex::new(Duration::ZERO),
                responses: Mutex::new(VecDeque::new()),
                log: Mutex::new(Vec::new()),
                statements: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            shared: self.shared.clone(),
        })
    }

    pub(crate) fn push(&self, response: Response) {
        self.shared.responses.lock().unwrap().push_back(response);
    }

    pub(crate) fn push_rows(&self, rows: Vec<serde_json::Value>) {
        let rows = rows
            .into_iter()
            .map(|v| match v {
                serde_json::Value::Object(map) => Row::from(map),
                other => panic!("row must be an object: {}", other),
            })
            .collect();
        self.push(Response::Rows(rows));
    }

    pub(crate) fn push_affected(&self, affected_rows: u64) {
        self.push(Response::Exec(ExecResult {
            affected_rows,
            last_insert_id: None,
        }));
    }

    /// Every pool created before the `generation`-th connect is dead.
    pub(crate) fn healthy_from(&self, generation: u64) {
        self.shared.healthy_from.store(generation, Ordering::SeqCst);
    }

    pub(crate) fn set_latency(&self, latency: Duration) {
        *self.shared.latency.lock().unwrap() = latency;
    }

    pub(crate) fn connects(&self) -> u64 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.shared.log.lock().unwrap().clone()
    }

    pub(crate) fn statements(&self) -> Vec<Statement> {
        self.shared.statements.lock().unwrap().clone()
    }

    pub(crate) fn last_sql(&self) -> String {
        self.statements()
            .last()
            .map(|s| s.sql.clone())
            .unwrap_or_default()
    }
}

impl Shared {
    async fn respond(&self, route: &str, generation: Option<u64>, stmt: &Statement) -> Result<Response> {
        self.log.lock().unwrap().push(format!("{}: {}", route, stmt.sql));
        self.statements.lock().unwrap().push(stmt.clone());

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Some(generation) = generation {
            if generation < self.healthy_from.load(Ordering::SeqCst) {
                return Err(Error::connectivity("read ECONNRESET"));
            }
        }

        match self.responses.lock().unwrap().pop_front() {
            Some(Response::Fail(err)) => Err(err),
            Some(other) => Ok(other),
            None => Ok(Response::Rows(vec![])),
        }
    }

    async fn query(&self, route: &str, generation: Option<u64>, stmt: &Statement) -> Result<Vec<Row>> {
        Ok(match self.respond(route, generation, stmt).await? {
            Response::Rows(rows) => rows,
            _ => vec![],
        })
    }

    async fn execute(&self, route: &str, generation: Option<u64>, stmt: &Statement) -> Result<ExecResult> {
        Ok(match self.respond(route, generation, stmt).await? {
            Response::Exec(result) => result,
            Response::Rows(rows) => ExecResult {
                affected_rows: rows.len() as u64,
                last_insert_id: None,
            },
            Response::Fail(err) => return Err(err),
        })
    }
}

struct FakeConnector {
    shared: Arc<Shared>,
}

#[async_trait]
impl Connector for FakeConnector {
    fn kind(&self) -> DialectKind {
        self.shared.kind
    }

    async fn connect(&self) -> Result<Arc<dyn PoolHandle>> {
        let generation = self.shared.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(FakePool {
            shared: self.shared.clone(),
            generation,
        }))
    }
}

struct FakePool {
    shared: Arc<Shared>,
    generation: u64,
}

#[async_trait]
impl PoolHandle for FakePool {
    async fn query(&self, stmt: &Statement) -> Result<Vec<Row>> {
        self.shared.query("pool", Some(self.generation), stmt).await
    }

    async fn execute(&self, stmt: &Statement) -> Result<ExecResult> {
        self.shared.execute("pool", Some(self.generation), stmt).await
    }

    async fn begin(&self) -> Result<Box<dyn PinnedConnection>> {
        self.shared.log.lock().unwrap().push("begin".to_string());
        Ok(Box::new(FakePinned {
            shared: self.shared.clone(),
        }))
    }

    async fn close(&self) {}
}

struct FakePinned {
    shared: Arc<Shared>,
}

#[async_trait]
impl PinnedConnection for FakePinned {
    async fn query(&mut self, stmt: &Statement) -> Result<Vec<Row>> {
        self.shared.query("tx", None, stmt).await
    }

    async fn execute(&mut self, stmt: &Statement) -> Result<ExecResult> {
        self.shared.execute("tx", None, stmt).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.shared.log.lock().unwrap().push("commit".to_string());
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.shared.log.lock().unwrap().push("rollback".to_string());
        Ok(())
    }
}
