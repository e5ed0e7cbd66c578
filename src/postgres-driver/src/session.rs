// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use hql_conn_pool::{BackendError, Connection, ExecuteOutcome, RowCursor, Statement};
use postgres_openssl::MakeTlsConnector;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, SimpleQueryMessage, SimpleQueryRow};
use tracing::debug;

use crate::backend_error;

/// A session with a PostgreSQL server.
///
/// The protocol is driven by a background task that lives as long as the
/// connection.
pub struct PgConnection {
    client: Arc<Client>,
    task: JoinHandle<()>,
    tls: MakeTlsConnector,
    closed: AtomicBool,
}

impl PgConnection {
    pub(crate) fn new(client: Client, task: JoinHandle<()>, tls: MakeTlsConnector) -> Self {
        PgConnection {
            client: Arc::new(client),
            task,
            tls,
            closed: AtomicBool::new(false),
        }
    }
}

impl fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnection")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn create_statement(&self) -> Result<Arc<dyn Statement>, BackendError> {
        if self.is_closed() {
            return Err(BackendError::closed("connection is closed"));
        }
        Ok(Arc::new(PgStatement {
            client: Arc::clone(&self.client),
            tls: self.tls.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.client.is_closed()
    }

    async fn close(&self) -> Result<(), BackendError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.task.abort();
            debug!("closed postgres connection");
        }
        Ok(())
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A statement on a [`PgConnection`].
///
/// Statements share their connection's client. Closing a statement only
/// prevents further use of it.
pub struct PgStatement {
    client: Arc<Client>,
    tls: MakeTlsConnector,
    closed: AtomicBool,
}

impl fmt::Debug for PgStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgStatement")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Statement for PgStatement {
    async fn execute(&self, sql: &str, max_rows: usize) -> Result<ExecuteOutcome, BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::closed("statement is closed"));
        }
        let messages = self.client.simple_query_raw(sql).await.map_err(backend_error)?;
        first_result(messages.boxed(), max_rows).await
    }

    /// Cancels whatever the connection is running.
    ///
    /// PostgreSQL cancels per session, not per statement: a cancel that
    /// arrives after this statement finished can stop a later query on the
    /// same connection, including one from another paragraph of the same user
    /// once the connection has been recycled.
    async fn cancel(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::closed("statement is closed"));
        }
        self.client
            .cancel_token()
            .cancel_query(self.tls.clone())
            .await
            .map_err(backend_error)
    }

    fn is_closed(&self) -> Result<bool, BackendError> {
        Ok(self.closed.load(Ordering::SeqCst) || self.client.is_closed())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

type Messages = BoxStream<'static, Result<SimpleQueryMessage, tokio_postgres::Error>>;
type Rows = BoxStream<'static, Result<Vec<Option<String>>, BackendError>>;

/// Reads the messages of a simple query up to the outcome of its first
/// statement.
///
/// A result set is returned as a cursor that pulls rows off the connection
/// as they are read, at most `max_rows` of them when `max_rows` is non-zero.
/// Messages nobody reads are dropped by the connection as they arrive.
async fn first_result(
    mut messages: Messages,
    max_rows: usize,
) -> Result<ExecuteOutcome, BackendError> {
    while let Some(message) = messages.try_next().await.map_err(backend_error)? {
        match message {
            SimpleQueryMessage::RowDescription(description) => {
                let columns = description.iter().map(|c| c.name().to_string()).collect();
                let rows = rows_until_complete(messages);
                return Ok(ExecuteOutcome::Rows(Box::new(PgCursor::new(
                    columns, rows, max_rows,
                ))));
            }
            SimpleQueryMessage::Row(row) => {
                let columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                let first = stream::once(future::ready(Ok(row_values(&row))));
                let rows = first.chain(rows_until_complete(messages)).boxed();
                return Ok(ExecuteOutcome::Rows(Box::new(PgCursor::new(
                    columns, rows, max_rows,
                ))));
            }
            SimpleQueryMessage::CommandComplete(count) => {
                return Ok(ExecuteOutcome::UpdateCount(
                    i64::try_from(count).unwrap_or(i64::MAX),
                ));
            }
            _ => {}
        }
    }
    Ok(ExecuteOutcome::UpdateCount(0))
}

/// The data rows of the current statement.
fn rows_until_complete(messages: Messages) -> Rows {
    messages
        .map_err(backend_error)
        .try_take_while(|message| {
            future::ready(Ok(!matches!(
                message,
                SimpleQueryMessage::CommandComplete(_)
            )))
        })
        .try_filter_map(|message| {
            future::ready(Ok(match message {
                SimpleQueryMessage::Row(row) => Some(row_values(&row)),
                _ => None,
            }))
        })
        .boxed()
}

fn row_values(row: &SimpleQueryRow) -> Vec<Option<String>> {
    (0..row.len()).map(|i| row.get(i).map(str::to_string)).collect()
}

/// Rows streamed from a simple query.
struct PgCursor {
    columns: Vec<String>,
    /// `None` once closed.
    rows: Option<Rows>,
}

impl PgCursor {
    fn new(columns: Vec<String>, rows: Rows, max_rows: usize) -> Self {
        let rows = if max_rows == 0 {
            rows
        } else {
            rows.take(max_rows).boxed()
        };
        PgCursor {
            columns,
            rows: Some(rows),
        }
    }
}

#[async_trait]
impl RowCursor for PgCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Vec<Option<String>>>, BackendError> {
        match &mut self.rows {
            Some(rows) => rows.try_next().await,
            None => Err(BackendError::closed("cursor is closed")),
        }
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.rows = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counted_rows(n: usize, pulled: Arc<AtomicUsize>) -> Rows {
        stream::iter((0..n).map(|i| Ok(vec![Some(i.to_string())])))
            .inspect(move |_| {
                pulled.fetch_add(1, Ordering::SeqCst);
            })
            .boxed()
    }

    #[tokio::test]
    async fn stops_pulling_rows_at_the_limit() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let mut cursor = PgCursor::new(
            vec!["n".into()],
            counted_rows(1000, Arc::clone(&pulled)),
            3,
        );

        let mut seen = Vec::new();
        while let Some(row) = cursor.next_row().await.expect("row") {
            seen.push(row);
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], vec![Some("2".to_string())]);
        assert_eq!(pulled.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_limit_reads_every_row() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let mut cursor = PgCursor::new(vec!["n".into()], counted_rows(5, Arc::clone(&pulled)), 0);

        let mut count = 0;
        while cursor.next_row().await.expect("row").is_some() {
            count += 1;
        }
        assert_eq!(count, 5);
        assert_eq!(pulled.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn closed_cursors_yield_nothing() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let mut cursor = PgCursor::new(vec!["n".into()], counted_rows(5, Arc::clone(&pulled)), 0);
        cursor.close().await.expect("closes");
        assert!(cursor.next_row().await.is_err());
        assert_eq!(pulled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn update_count_for_statements_without_rows() {
        let messages = stream::iter([Ok(SimpleQueryMessage::CommandComplete(7))]).boxed();
        match first_result(messages, 10).await.expect("outcome") {
            ExecuteOutcome::UpdateCount(n) => assert_eq!(n, 7),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let empty = stream::iter(Vec::new()).boxed();
        assert!(matches!(
            first_result(empty, 10).await.expect("outcome"),
            ExecuteOutcome::UpdateCount(0)
        ));
    }
}
