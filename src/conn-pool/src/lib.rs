// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Connection and statement lifecycle management for notebook paragraphs.
//!
//! Opening a session with a remote engine is expensive, so connections are
//! pooled per (datasource, user) pair and reused across paragraph executions.
//! The [`ConnectionPool`] owns idle connections; the [`StatementRegistry`]
//! binds a checked-out connection to the paragraph executing on it and tracks
//! the paragraph's in-flight statement so that it can be cancelled from the
//! outside.
//!
//! No lock is held while talking to an engine. Connections move between the
//! idle lists and the checked-out set under short critical sections, so any
//! number of paragraphs can execute concurrently on distinct connections.

use std::fmt;

use hql_datasource::ConfigError;

mod driver;
mod metrics;
mod pool;
mod statements;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use driver::{
    BackendError, BackendErrorKind, Connection, Driver, DriverRegistry, ExecuteOutcome,
    RowCursor, Statement,
};
pub use metrics::PoolMetrics;
pub use pool::{ConnectionId, ConnectionPool, PoolStats, PooledConnection};
pub use statements::{BoundStatement, Disposition, StatementRegistry};

/// The end user executing a paragraph, and the paragraph.
///
/// At most one connection is bound to an identity at a time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParagraphIdentity {
    pub user: String,
    pub paragraph_id: String,
}

impl ParagraphIdentity {
    pub fn new(user: impl Into<String>, paragraph_id: impl Into<String>) -> Self {
        ParagraphIdentity {
            user: user.into(),
            paragraph_id: paragraph_id.into(),
        }
    }
}

impl fmt::Display for ParagraphIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.paragraph_id)
    }
}

/// Errors that prevent a connection or statement from being handed out.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// No driver is registered under the datasource's driver identifier.
    #[error("driver '{0}' is not available")]
    DriverUnavailable(String),
    /// Credentials could not be established with the engine.
    #[error("{source}")]
    Authentication {
        datasource: String,
        #[source]
        source: BackendError,
    },
    /// The engine failed an operation on an established connection.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// A cancellation request the engine did not honor.
#[derive(Debug, thiserror::Error)]
#[error("cancelling paragraph {paragraph_id}: {source}")]
pub struct CancelError {
    pub paragraph_id: String,
    #[source]
    pub source: BackendError,
}
