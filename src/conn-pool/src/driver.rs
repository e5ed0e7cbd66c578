// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The seam between the pool and the engines it talks to.
//!
//! A [`Driver`] opens [`Connection`]s, a connection hands out [`Statement`]s,
//! and a statement executes SQL text, producing either a [`RowCursor`] or an
//! update count. Every method takes `&self`: a statement is shared between the
//! task executing it and whoever wants to cancel it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use hql_datasource::ConnectAuth;

use crate::PoolError;

/// Broad classes of backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// The engine could not be reached.
    Connect,
    /// The engine refused the supplied credentials.
    Authentication,
    /// The connection or statement has already been closed.
    Closed,
    /// The engine rejected or failed the statement.
    Execution,
    /// The statement was cancelled while executing.
    Cancelled,
    /// The driver does not support the requested operation.
    Unsupported,
}

/// An error reported by a driver.
///
/// Displays as the raw backend message, which is what users get to see.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        BackendError {
            kind,
            message: message.into(),
        }
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Closed, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Execution, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Unsupported, message)
    }
}

/// Opens connections to one family of engines.
#[async_trait]
pub trait Driver: fmt::Debug + Send + Sync {
    async fn connect(
        &self,
        url: &str,
        auth: &ConnectAuth,
    ) -> Result<Arc<dyn Connection>, BackendError>;
}

/// An authenticated session with an engine.
#[async_trait]
pub trait Connection: fmt::Debug + Send + Sync {
    /// Creates a new statement on this session.
    async fn create_statement(&self) -> Result<Arc<dyn Statement>, BackendError>;

    /// Reports whether the session is known to be closed.
    ///
    /// A `false` answer is not a guarantee: many engines only notice a dead
    /// session on the next round trip.
    fn is_closed(&self) -> bool;

    /// Closes the session. Closing an already closed session succeeds.
    async fn close(&self) -> Result<(), BackendError>;
}

/// One SQL execution on a connection.
#[async_trait]
pub trait Statement: fmt::Debug + Send + Sync {
    /// Executes `sql`, asking the engine for at most `max_rows` rows.
    async fn execute(&self, sql: &str, max_rows: usize) -> Result<ExecuteOutcome, BackendError>;

    /// Asks the engine to stop the statement currently executing.
    async fn cancel(&self) -> Result<(), BackendError>;

    /// Reports whether the statement is closed, or an error when the driver
    /// cannot tell.
    fn is_closed(&self) -> Result<bool, BackendError>;

    /// Closes the statement. Closing an already closed statement succeeds.
    async fn close(&self) -> Result<(), BackendError>;
}

/// What executing a statement produced.
pub enum ExecuteOutcome {
    /// A result set to iterate.
    Rows(Box<dyn RowCursor>),
    /// No result set; the number of rows affected.
    UpdateCount(i64),
}

impl fmt::Debug for ExecuteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecuteOutcome::Rows(cursor) => f.debug_tuple("Rows").field(&cursor.columns()).finish(),
            ExecuteOutcome::UpdateCount(n) => f.debug_tuple("UpdateCount").field(n).finish(),
        }
    }
}

/// A forward-only cursor over a result set.
#[async_trait]
pub trait RowCursor: Send {
    /// The column names, in order.
    fn columns(&self) -> &[String];

    /// The next row, with `None` standing for SQL `NULL`.
    async fn next_row(&mut self) -> Result<Option<Vec<Option<String>>>, BackendError>;

    /// Releases the cursor's resources.
    async fn close(&mut self) -> Result<(), BackendError>;
}

/// The drivers available to a process, keyed by identifier.
///
/// A datasource names its driver with `<key>.driver`; identifiers are matched
/// exactly, and one driver may be registered under several aliases.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `driver` under each of `identifiers`.
    pub fn register<I, S>(&mut self, identifiers: I, driver: Arc<dyn Driver>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for identifier in identifiers {
            self.drivers.insert(identifier.into(), Arc::clone(&driver));
        }
    }

    pub fn get(&self, identifier: &str) -> Result<&Arc<dyn Driver>, PoolError> {
        self.drivers
            .get(identifier)
            .ok_or_else(|| PoolError::DriverUnavailable(identifier.to_string()))
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.drivers.keys().map(String::as_str)
    }
}
