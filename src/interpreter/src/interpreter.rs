// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;

use hql_conn_pool::{
    BoundStatement, ConnectionPool, Disposition, ExecuteOutcome, ParagraphIdentity,
    StatementRegistry,
};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::health::ClosedConnectionSignatures;
use crate::output::{body_for, render_rows, render_update_count};
use crate::scheduler::ParallelScheduler;
use crate::selector::parse_selector;
use crate::{FormType, InterpreterResult, ParagraphContext};

/// Name the interpreter registers under.
pub const INTERPRETER_NAME: &str = "hql";
/// Group the interpreter registers under.
pub const INTERPRETER_GROUP: &str = "hive";

/// Executes SQL paragraphs for many users against pooled connections.
#[derive(Debug)]
pub struct SqlInterpreter {
    statements: Arc<StatementRegistry>,
    scheduler: ParallelScheduler,
    signatures: ClosedConnectionSignatures,
}

impl SqlInterpreter {
    pub fn new(pool: ConnectionPool) -> Self {
        SqlInterpreter {
            statements: Arc::new(StatementRegistry::new(Arc::new(pool))),
            scheduler: ParallelScheduler::new(
                format!("{INTERPRETER_NAME}-scheduler"),
                ParallelScheduler::DEFAULT_SLOTS,
            ),
            signatures: ClosedConnectionSignatures::default(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: ParallelScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_closed_connection_signatures(
        mut self,
        signatures: ClosedConnectionSignatures,
    ) -> Self {
        self.signatures = signatures;
        self
    }

    pub fn statements(&self) -> &StatementRegistry {
        &self.statements
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        self.statements.pool()
    }

    pub fn scheduler(&self) -> &ParallelScheduler {
        &self.scheduler
    }

    pub fn name(&self) -> &'static str {
        INTERPRETER_NAME
    }

    pub fn group(&self) -> &'static str {
        INTERPRETER_GROUP
    }

    /// Runs `interpret` for the paragraph in the interpreter's scheduler.
    pub fn submit(
        self: &Arc<Self>,
        text: impl Into<String>,
        ctx: ParagraphContext,
    ) -> JoinHandle<InterpreterResult> {
        let this = Arc::clone(self);
        let text = text.into();
        self.scheduler
            .submit(async move { this.interpret(&text, &ctx).await })
    }

    /// Runs a paragraph: an optional datasource selector followed by SQL.
    pub async fn interpret(&self, text: &str, ctx: &ParagraphContext) -> InterpreterResult {
        let (datasource, sql) = parse_selector(text);
        info!(
            user = %ctx.user,
            paragraph_id = %ctx.paragraph_id,
            datasource,
            "running paragraph"
        );
        self.execute_sql(datasource, sql, ctx).await
    }

    /// Runs `sql` on `datasource` on behalf of the paragraph.
    ///
    /// Failures never escape: they become [`InterpreterResult::error`] with
    /// the underlying message. Whatever the outcome, the cursor and statement
    /// are closed and the connection is handed back before returning. If the
    /// returned future is dropped while the statement runs, the statement is
    /// forgotten and its connection discarded in the background.
    pub async fn execute_sql(
        &self,
        datasource: &str,
        sql: &str,
        ctx: &ParagraphContext,
    ) -> InterpreterResult {
        let max_rows = match self.pool().datasources().max_rows() {
            Ok(max_rows) => max_rows,
            Err(e) => {
                error!(paragraph_id = %ctx.paragraph_id, "{e}");
                return InterpreterResult::error(e.to_string());
            }
        };

        let identity = ParagraphIdentity::new(ctx.user.as_str(), ctx.paragraph_id.as_str());
        let bound = match self
            .statements
            .get_or_create_statement(datasource, &identity)
            .await
        {
            Ok(bound) => bound,
            Err(e) => {
                error!(%identity, datasource, "cannot run paragraph: {e}");
                return InterpreterResult::error(e.to_string());
            }
        };
        let guard = UnbindOnDrop {
            statements: Arc::clone(&self.statements),
            bound,
            armed: true,
        };
        let statement = Arc::clone(guard.bound.statement());

        let mut body = body_for(sql);
        let (result, disposition) = match statement.execute(sql, max_rows).await {
            Ok(ExecuteOutcome::Rows(mut cursor)) => {
                let rendered = render_rows(&mut body, &mut *cursor, max_rows).await;
                if let Err(e) = cursor.close().await {
                    warn!(%identity, "error closing result set: {e}");
                }
                match rendered {
                    Ok(()) => (InterpreterResult::success(body), Disposition::Recycle),
                    Err(e) => {
                        warn!(%identity, "error reading result set: {e}");
                        (
                            InterpreterResult::error(e.to_string()),
                            self.signatures.disposition(&e),
                        )
                    }
                }
            }
            Ok(ExecuteOutcome::UpdateCount(count)) => {
                render_update_count(&mut body, count);
                (InterpreterResult::success(body), Disposition::Recycle)
            }
            Err(e) => {
                warn!(%identity, "statement failed: {e}");
                (
                    InterpreterResult::error(e.to_string()),
                    self.signatures.disposition(&e),
                )
            }
        };

        if let Err(e) = statement.close().await {
            warn!(%identity, "error closing statement: {e}");
        }
        let bound = guard.disarm();
        self.statements.forget_statement(&bound);
        self.statements.release(&bound, disposition).await;
        debug!(%identity, ?disposition, code = ?result.code(), "paragraph finished");
        result
    }

    /// Asks the engine to stop the paragraph's running statement.
    ///
    /// The paragraph's own result reports the outcome, so failures here are
    /// only logged.
    pub async fn cancel(&self, ctx: &ParagraphContext) {
        if let Err(e) = self.statements.cancel(&ctx.paragraph_id).await {
            error!(user = %ctx.user, "{e}");
        }
    }

    /// Progress of the paragraph in percent. Progress is not tracked.
    pub fn progress(&self, _ctx: &ParagraphContext) -> u8 {
        0
    }

    pub fn form_type(&self) -> FormType {
        FormType::Simple
    }

    /// Completion candidates for `buffer` at `cursor`. Completion is not
    /// offered.
    pub fn completion(&self, _buffer: &str, _cursor: usize) -> Vec<String> {
        Vec::new()
    }

    /// Closes every statement and connection the interpreter knows about.
    pub async fn close(&self) {
        info!("closing interpreter");
        self.statements.close_all().await;
    }
}

/// Gives back a paragraph's statement and connection when its execution is
/// dropped before finishing, e.g. because its task was aborted.
///
/// The connection is discarded: the engine may still be running the
/// statement on it.
struct UnbindOnDrop {
    statements: Arc<StatementRegistry>,
    bound: BoundStatement,
    armed: bool,
}

impl UnbindOnDrop {
    /// Hands cleanup back to the caller.
    fn disarm(mut self) -> BoundStatement {
        self.armed = false;
        self.bound.clone()
    }
}

impl Drop for UnbindOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let bound = self.bound.clone();
        let identity = bound.identity();
        warn!(%identity, "paragraph execution interrupted, discarding its connection");
        self.statements.forget_statement(&bound);

        let Ok(handle) = Handle::try_current() else {
            warn!(%identity, "no runtime to release connection on, leaving it to teardown");
            return;
        };
        let statements = Arc::clone(&self.statements);
        handle.spawn(async move {
            if let Err(e) = bound.statement().close().await {
                warn!(identity = %bound.identity(), "error closing statement: {e}");
            }
            statements.release(&bound, Disposition::Discard).await;
        });
    }
}
