// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An in-memory driver for tests.
//!
//! [`MockDriver`] answers SQL text with canned [`MockResponse`]s and records
//! what it was asked to do, so tests can observe connection reuse, closing and
//! cancellation without a database.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hql_datasource::ConnectAuth;
use tokio::sync::Notify;

use crate::{
    BackendError, BackendErrorKind, Connection, Driver, ExecuteOutcome, RowCursor, Statement,
};

/// A canned answer to a statement.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
    },
    UpdateCount(i64),
    Error(String),
    /// Blocks until the statement is cancelled or [`MockDriver::open_gate`]
    /// is called, then reports an update count of zero.
    Blocking,
}

impl MockResponse {
    pub fn rows(columns: &[&str], rows: &[&[&str]]) -> Self {
        MockResponse::Rows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .iter()
                .map(|row| row.iter().map(|v| Some(v.to_string())).collect())
                .collect(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        MockResponse::Error(message.into())
    }
}

/// A statement execution observed by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockExecution {
    pub sql: String,
    /// Index of the connection, in the order connections were opened.
    pub connection: usize,
    pub max_rows: usize,
}

#[derive(Debug, Default)]
struct MockState {
    responses: Mutex<BTreeMap<String, MockResponse>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    executions: Mutex<Vec<MockExecution>>,
    connect_failure: Mutex<Option<String>>,
    statement_failure: Mutex<Option<String>>,
    born_closed: AtomicUsize,
    hide_statement_state: AtomicBool,
    open_cursors: AtomicUsize,
    gate_open: AtomicBool,
    blocked: Mutex<Vec<Arc<Notify>>>,
    blocked_count: AtomicUsize,
    blocked_changed: Notify,
}

/// A driver whose engine lives in memory.
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers `sql` with `response` from now on.
    pub fn respond(&self, sql: &str, response: MockResponse) {
        self.state
            .responses
            .lock()
            .expect("lock poisoned")
            .insert(sql.to_string(), response);
    }

    /// Makes every subsequent connection attempt fail with `message`.
    pub fn fail_connects(&self, message: &str) {
        *self.state.connect_failure.lock().expect("lock poisoned") = Some(message.to_string());
    }

    /// Makes every subsequent statement creation fail with `message`.
    pub fn fail_statement_creation(&self, message: &str) {
        *self.state.statement_failure.lock().expect("lock poisoned") = Some(message.to_string());
    }

    /// Makes the next `n` statements report themselves closed on creation.
    pub fn close_next_statements(&self, n: usize) {
        self.state.born_closed.store(n, Ordering::SeqCst);
    }

    /// Makes statements unable to report whether they are closed.
    pub fn hide_statement_state(&self) {
        self.state.hide_statement_state.store(true, Ordering::SeqCst);
    }

    /// Releases every current and future [`MockResponse::Blocking`] execution.
    pub fn open_gate(&self) {
        self.state.gate_open.store(true, Ordering::SeqCst);
        for wake in self.state.blocked.lock().expect("lock poisoned").iter() {
            wake.notify_one();
        }
    }

    /// Waits until at least `n` executions are blocked.
    pub async fn wait_until_blocked(&self, n: usize) {
        loop {
            let changed = self.state.blocked_changed.notified();
            if self.state.blocked_count.load(Ordering::SeqCst) >= n {
                return;
            }
            changed.await;
        }
    }

    pub fn connect_count(&self) -> usize {
        self.state.connections.lock().expect("lock poisoned").len()
    }

    /// The `index`th connection opened, if there were that many.
    pub fn connection(&self, index: usize) -> Option<Arc<MockConnection>> {
        self.state
            .connections
            .lock()
            .expect("lock poisoned")
            .get(index)
            .cloned()
    }

    pub fn open_connection_count(&self) -> usize {
        self.state
            .connections
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|c| !c.is_closed())
            .count()
    }

    pub fn open_cursor_count(&self) -> usize {
        self.state.open_cursors.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> Vec<MockExecution> {
        self.state.executions.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn connect(
        &self,
        _url: &str,
        auth: &ConnectAuth,
    ) -> Result<Arc<dyn Connection>, BackendError> {
        if let Some(message) = &*self.state.connect_failure.lock().expect("lock poisoned") {
            return Err(BackendError::new(
                BackendErrorKind::Authentication,
                message.clone(),
            ));
        }
        let mut connections = self.state.connections.lock().expect("lock poisoned");
        let connection = Arc::new(MockConnection {
            index: connections.len(),
            auth: auth.clone(),
            closed: AtomicBool::new(false),
            close_failure: Mutex::new(None),
            state: Arc::clone(&self.state),
        });
        connections.push(Arc::clone(&connection));
        Ok(connection)
    }
}

/// A session with the in-memory engine.
pub struct MockConnection {
    index: usize,
    auth: ConnectAuth,
    closed: AtomicBool,
    close_failure: Mutex<Option<String>>,
    state: Arc<MockState>,
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnection")
            .field("index", &self.index)
            .field("auth", &self.auth)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl MockConnection {
    pub fn index(&self) -> usize {
        self.index
    }

    /// How the connection authenticated.
    pub fn auth(&self) -> &ConnectAuth {
        &self.auth
    }

    /// Simulates the engine tearing the session down.
    pub fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Makes closing this connection fail with `message`.
    pub fn fail_close(&self, message: &str) {
        *self.close_failure.lock().expect("lock poisoned") = Some(message.to_string());
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn create_statement(&self) -> Result<Arc<dyn Statement>, BackendError> {
        if let Some(message) = &*self.state.statement_failure.lock().expect("lock poisoned") {
            return Err(BackendError::execution(message.clone()));
        }
        let born_closed = self
            .state
            .born_closed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let connection = self
            .state
            .connections
            .lock()
            .expect("lock poisoned")
            .get(self.index)
            .cloned()
            .expect("connection registered on connect");
        Ok(Arc::new(MockStatement {
            connection,
            closed: AtomicBool::new(born_closed),
            cancelled: AtomicBool::new(false),
            wake: Arc::new(Notify::new()),
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BackendError> {
        if let Some(message) = &*self.close_failure.lock().expect("lock poisoned") {
            return Err(BackendError::new(BackendErrorKind::Connect, message.clone()));
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A statement against the in-memory engine.
#[derive(Debug)]
pub struct MockStatement {
    connection: Arc<MockConnection>,
    closed: AtomicBool,
    cancelled: AtomicBool,
    wake: Arc<Notify>,
}

impl MockStatement {
    async fn block(&self) -> Result<ExecuteOutcome, BackendError> {
        let state = &self.connection.state;
        state
            .blocked
            .lock()
            .expect("lock poisoned")
            .push(Arc::clone(&self.wake));
        state.blocked_count.fetch_add(1, Ordering::SeqCst);
        state.blocked_changed.notify_waiters();

        let result = loop {
            if self.cancelled.load(Ordering::SeqCst) {
                break Err(BackendError::new(
                    BackendErrorKind::Cancelled,
                    "Query was cancelled",
                ));
            }
            if state.gate_open.load(Ordering::SeqCst) {
                break Ok(ExecuteOutcome::UpdateCount(0));
            }
            self.wake.notified().await;
        };

        state.blocked_count.fetch_sub(1, Ordering::SeqCst);
        state
            .blocked
            .lock()
            .expect("lock poisoned")
            .retain(|wake| !Arc::ptr_eq(wake, &self.wake));
        result
    }
}

#[async_trait]
impl Statement for MockStatement {
    async fn execute(&self, sql: &str, max_rows: usize) -> Result<ExecuteOutcome, BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::closed("statement is closed"));
        }
        if self.connection.is_closed() {
            return Err(BackendError::closed("connection is closed"));
        }
        let state = &self.connection.state;
        state
            .executions
            .lock()
            .expect("lock poisoned")
            .push(MockExecution {
                sql: sql.to_string(),
                connection: self.connection.index,
                max_rows,
            });
        let response = state
            .responses
            .lock()
            .expect("lock poisoned")
            .get(sql)
            .cloned();
        match response {
            Some(MockResponse::Rows { columns, rows }) => {
                let limit = if max_rows == 0 { rows.len() } else { max_rows };
                state.open_cursors.fetch_add(1, Ordering::SeqCst);
                Ok(ExecuteOutcome::Rows(Box::new(MockCursor {
                    columns,
                    rows: rows.into_iter().take(limit).collect(),
                    closed: false,
                    state: Arc::clone(state),
                })))
            }
            Some(MockResponse::UpdateCount(n)) => Ok(ExecuteOutcome::UpdateCount(n)),
            Some(MockResponse::Error(message)) => Err(BackendError::execution(message)),
            Some(MockResponse::Blocking) => self.block().await,
            None => Err(BackendError::execution(format!(
                "no response configured for '{sql}'"
            ))),
        }
    }

    async fn cancel(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::closed("statement is closed"));
        }
        self.cancelled.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        Ok(())
    }

    fn is_closed(&self) -> Result<bool, BackendError> {
        if self.connection.state.hide_statement_state.load(Ordering::SeqCst) {
            return Err(BackendError::unsupported("is_closed is not supported"));
        }
        Ok(self.closed.load(Ordering::SeqCst))
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockCursor {
    columns: Vec<String>,
    rows: VecDeque<Vec<Option<String>>>,
    closed: bool,
    state: Arc<MockState>,
}

#[async_trait]
impl RowCursor for MockCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Vec<Option<String>>>, BackendError> {
        if self.closed {
            return Err(BackendError::closed("cursor is closed"));
        }
        Ok(self.rows.pop_front())
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        if !self.closed {
            self.closed = true;
            self.state.open_cursors.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
