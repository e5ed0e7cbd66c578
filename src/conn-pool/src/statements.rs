// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Binding of connections and statements to executing paragraphs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::{
    CancelError, Connection, ConnectionId, ConnectionPool, ParagraphIdentity, PoolError,
    PooledConnection, Statement,
};

/// What to do with a connection once a paragraph is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Return it to the idle list of its (datasource, user) pair.
    Recycle,
    /// Close it; the engine is known to have torn the session down.
    Discard,
}

/// A statement handed to an executing paragraph, along with what is needed to
/// give it back.
#[derive(Debug, Clone)]
pub struct BoundStatement {
    identity: ParagraphIdentity,
    connection_id: ConnectionId,
    statement_seq: u64,
    statement: Arc<dyn Statement>,
}

impl BoundStatement {
    pub fn identity(&self) -> &ParagraphIdentity {
        &self.identity
    }

    /// The connection the statement runs on.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn statement(&self) -> &Arc<dyn Statement> {
        &self.statement
    }
}

/// A checked-out connection and the executions currently using it.
#[derive(Debug)]
struct Binding {
    identity: ParagraphIdentity,
    connection: PooledConnection,
    leases: usize,
    discard: bool,
}

#[derive(Debug, Default)]
struct Bindings {
    by_connection: BTreeMap<ConnectionId, Binding>,
    /// The connection most recently bound to each identity.
    by_identity: BTreeMap<ParagraphIdentity, ConnectionId>,
}

/// Tracks which connection each executing paragraph holds and which statement
/// each paragraph is running.
#[derive(Debug)]
pub struct StatementRegistry {
    pool: Arc<ConnectionPool>,
    bindings: Mutex<Bindings>,
    /// The latest statement submitted for each paragraph id.
    statements: Mutex<BTreeMap<String, (u64, Arc<dyn Statement>)>>,
    next_statement_seq: AtomicU64,
}

struct Lease {
    connection_id: ConnectionId,
    connection: Arc<dyn Connection>,
}

impl StatementRegistry {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        StatementRegistry {
            pool,
            bindings: Mutex::new(Bindings::default()),
            statements: Mutex::new(BTreeMap::new()),
            next_statement_seq: AtomicU64::new(1),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Creates a statement for `identity` on `datasource`.
    ///
    /// A connection already bound to the identity is used in preference to
    /// the pool. If the new statement reports itself closed straight away, the
    /// connection is discarded and statement creation is retried once on a
    /// freshly acquired connection.
    pub async fn get_or_create_statement(
        &self,
        datasource: &str,
        identity: &ParagraphIdentity,
    ) -> Result<BoundStatement, PoolError> {
        let mut lease = match self.lease_bound(identity) {
            Some(lease) => lease,
            None => self.bind(datasource, identity).await?,
        };

        let mut statement = self.create_statement(identity, &lease).await?;
        if statement_is_closed(&*statement) {
            info!(
                %identity,
                connection_id = lease.connection_id,
                "statement closed on creation, retrying on a new connection"
            );
            self.release_lease(identity, lease.connection_id, Disposition::Discard)
                .await;
            lease = self.bind(datasource, identity).await?;
            statement = self.create_statement(identity, &lease).await?;
        }

        let statement_seq = self.next_statement_seq.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .statements
            .lock()
            .expect("lock poisoned")
            .insert(
                identity.paragraph_id.clone(),
                (statement_seq, Arc::clone(&statement)),
            );
        if previous.is_some() {
            debug!(%identity, "replacing statement registered for paragraph");
        }

        Ok(BoundStatement {
            identity: identity.clone(),
            connection_id: lease.connection_id,
            statement_seq,
            statement,
        })
    }

    /// Shares the connection already bound to `identity`, if there is one.
    fn lease_bound(&self, identity: &ParagraphIdentity) -> Option<Lease> {
        let mut bindings = self.bindings.lock().expect("lock poisoned");
        let id = *bindings.by_identity.get(identity)?;
        let binding = bindings.by_connection.get_mut(&id)?;
        binding.leases += 1;
        debug!(%identity, connection_id = id, "reusing connection bound to paragraph");
        Some(Lease {
            connection_id: id,
            connection: Arc::clone(binding.connection.connection()),
        })
    }

    /// Acquires a connection from the pool and binds it to `identity`.
    async fn bind(
        &self,
        datasource: &str,
        identity: &ParagraphIdentity,
    ) -> Result<Lease, PoolError> {
        let connection = self.pool.acquire(datasource, &identity.user).await?;
        let lease = Lease {
            connection_id: connection.id(),
            connection: Arc::clone(connection.connection()),
        };
        let mut bindings = self.bindings.lock().expect("lock poisoned");
        bindings
            .by_identity
            .insert(identity.clone(), lease.connection_id);
        bindings.by_connection.insert(
            lease.connection_id,
            Binding {
                identity: identity.clone(),
                connection,
                leases: 1,
                discard: false,
            },
        );
        Ok(lease)
    }

    async fn create_statement(
        &self,
        identity: &ParagraphIdentity,
        lease: &Lease,
    ) -> Result<Arc<dyn Statement>, PoolError> {
        match lease.connection.create_statement().await {
            Ok(statement) => Ok(statement),
            Err(e) => {
                warn!(
                    %identity,
                    connection_id = lease.connection_id,
                    "failed to create statement: {e}"
                );
                self.release_lease(identity, lease.connection_id, Disposition::Discard)
                    .await;
                Err(e.into())
            }
        }
    }

    /// Asks the engine to stop the statement running for `paragraph_id`.
    ///
    /// Cancelling a paragraph with no statement is a no-op.
    pub async fn cancel(&self, paragraph_id: &str) -> Result<(), CancelError> {
        let statement = self
            .statements
            .lock()
            .expect("lock poisoned")
            .get(paragraph_id)
            .map(|(_, statement)| Arc::clone(statement));
        let Some(statement) = statement else {
            debug!(paragraph_id, "no statement to cancel");
            return Ok(());
        };
        info!(paragraph_id, "cancelling statement");
        statement.cancel().await.map_err(|source| CancelError {
            paragraph_id: paragraph_id.to_string(),
            source,
        })
    }

    /// Removes the registry entry for `bound`'s paragraph, unless a newer
    /// statement has replaced it.
    pub fn forget_statement(&self, bound: &BoundStatement) {
        let mut statements = self.statements.lock().expect("lock poisoned");
        let current = statements
            .get(&bound.identity.paragraph_id)
            .map(|(seq, _)| *seq);
        if current == Some(bound.statement_seq) {
            statements.remove(&bound.identity.paragraph_id);
        }
    }

    /// Whether a statement is registered for `paragraph_id`.
    pub fn has_statement(&self, paragraph_id: &str) -> bool {
        self.statements
            .lock()
            .expect("lock poisoned")
            .contains_key(paragraph_id)
    }

    /// Unbinds `bound`'s connection from its paragraph and recycles or
    /// discards it.
    ///
    /// A connection shared by several executions of the same identity is
    /// disposed of when the last one releases it, and discarded if any of them
    /// asked for that.
    pub async fn release(&self, bound: &BoundStatement, disposition: Disposition) {
        self.release_lease(&bound.identity, bound.connection_id, disposition)
            .await;
    }

    async fn release_lease(
        &self,
        identity: &ParagraphIdentity,
        connection_id: ConnectionId,
        disposition: Disposition,
    ) {
        let released = {
            let mut bindings = self.bindings.lock().expect("lock poisoned");
            let Some(binding) = bindings.by_connection.get_mut(&connection_id) else {
                debug!(%identity, connection_id, "connection no longer bound, nothing to release");
                return;
            };
            binding.leases -= 1;
            binding.discard |= disposition == Disposition::Discard;
            if binding.leases > 0 {
                None
            } else {
                let binding = bindings
                    .by_connection
                    .remove(&connection_id)
                    .expect("binding present");
                if bindings.by_identity.get(&binding.identity) == Some(&connection_id) {
                    bindings.by_identity.remove(&binding.identity);
                }
                Some(binding)
            }
        };

        match released {
            Some(binding) if binding.discard => {
                info!(%identity, connection_id, "not recycling connection");
                self.pool.discard(binding.connection).await;
            }
            Some(binding) => {
                debug!(%identity, connection_id, "moving connection to unused");
                self.pool.release(binding.connection).await;
            }
            None => {}
        }
    }

    /// The connection currently bound to `identity`, if any.
    pub fn bound_connection(&self, identity: &ParagraphIdentity) -> Option<ConnectionId> {
        self.bindings
            .lock()
            .expect("lock poisoned")
            .by_identity
            .get(identity)
            .copied()
    }

    /// Closes every tracked statement and bound connection, then the pool.
    ///
    /// Best effort: failures are logged and the remaining cleanup continues.
    pub async fn close_all(&self) {
        let statements: Vec<_> = std::mem::take(&mut *self.statements.lock().expect("lock poisoned"))
            .into_iter()
            .collect();
        for (paragraph_id, (_, statement)) in statements {
            if let Err(e) = statement.close().await {
                warn!(%paragraph_id, "error closing statement: {e}");
            }
        }

        let bindings = std::mem::take(&mut *self.bindings.lock().expect("lock poisoned"));
        for (_, binding) in bindings.by_connection {
            self.pool.discard(binding.connection).await;
        }

        self.pool.close_all().await;
    }
}

/// Treats drivers that cannot report statement state as "open".
fn statement_is_closed(statement: &dyn Statement) -> bool {
    match statement.is_closed() {
        Ok(closed) => closed,
        Err(e) => {
            debug!("{statement:?} doesn't support is_closed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hql_datasource::{CredentialPolicy, DatasourceRegistry, Properties};

    use crate::testing::{MockDriver, MockResponse};
    use crate::{DriverRegistry, ExecuteOutcome};

    use super::*;

    fn registry(driver: &MockDriver) -> StatementRegistry {
        let properties: Properties = [("default.driver", "mock"), ("default.url", "mock://db")]
            .into_iter()
            .collect();
        let mut drivers = DriverRegistry::new();
        drivers.register(["mock"], Arc::new(driver.clone()));
        let pool = ConnectionPool::new(
            Arc::new(DatasourceRegistry::from_properties(&properties)),
            drivers,
            CredentialPolicy::default(),
        );
        StatementRegistry::new(Arc::new(pool))
    }

    #[tokio::test]
    async fn binds_and_recycles() {
        let driver = MockDriver::new();
        let registry = registry(&driver);
        let identity = ParagraphIdentity::new("alice", "p1");

        let bound = registry
            .get_or_create_statement("default", &identity)
            .await
            .expect("statement");
        assert_eq!(registry.bound_connection(&identity), Some(bound.connection_id()));
        assert!(registry.has_statement("p1"));

        registry.forget_statement(&bound);
        registry.release(&bound, Disposition::Recycle).await;
        assert!(!registry.has_statement("p1"));
        assert_eq!(registry.bound_connection(&identity), None);
        assert_eq!(
            registry.pool().idle_connections("default", "alice"),
            vec![bound.connection_id()]
        );
    }

    #[tokio::test]
    async fn discards_on_request() {
        let driver = MockDriver::new();
        let registry = registry(&driver);
        let identity = ParagraphIdentity::new("alice", "p1");

        let bound = registry
            .get_or_create_statement("default", &identity)
            .await
            .expect("statement");
        registry.release(&bound, Disposition::Discard).await;
        assert!(registry.pool().idle_connections("default", "alice").is_empty());
        assert!(driver.connection(0).expect("opened").is_closed());
    }

    #[tokio::test]
    async fn retries_once_when_statement_is_born_closed() {
        let driver = MockDriver::new();
        let registry = registry(&driver);
        let identity = ParagraphIdentity::new("alice", "p1");

        driver.close_next_statements(1);
        let bound = registry
            .get_or_create_statement("default", &identity)
            .await
            .expect("statement");
        assert_eq!(driver.connect_count(), 2);
        assert!(driver.connection(0).expect("opened").is_closed());
        assert_eq!(bound.connection_id(), registry.bound_connection(&identity).expect("bound"));

        // The retry happens exactly once: a second closed statement is
        // handed back as is.
        registry.forget_statement(&bound);
        registry.release(&bound, Disposition::Recycle).await;
        driver.close_next_statements(2);
        let bound = registry
            .get_or_create_statement("default", &identity)
            .await
            .expect("statement");
        assert_eq!(driver.connect_count(), 3);
        assert!(bound.statement().is_closed().expect("supported"));
    }

    #[tokio::test]
    async fn statement_creation_failure_discards_connection() {
        let driver = MockDriver::new();
        let registry = registry(&driver);
        let identity = ParagraphIdentity::new("alice", "p1");

        driver.fail_statement_creation("too many statements");
        let err = registry
            .get_or_create_statement("default", &identity)
            .await
            .expect_err("creation fails");
        assert_eq!(err.to_string(), "too many statements");
        assert_eq!(registry.bound_connection(&identity), None);
        assert!(driver.connection(0).expect("opened").is_closed());
    }

    #[tokio::test]
    async fn shares_connection_already_bound_to_identity() {
        let driver = MockDriver::new();
        let registry = registry(&driver);
        let identity = ParagraphIdentity::new("alice", "p1");

        let first = registry
            .get_or_create_statement("default", &identity)
            .await
            .expect("statement");
        let second = registry
            .get_or_create_statement("default", &identity)
            .await
            .expect("statement");
        assert_eq!(first.connection_id(), second.connection_id());
        assert_eq!(driver.connect_count(), 1);

        // The newer statement replaced the older one in the registry, so
        // forgetting the older one leaves the newer registered.
        registry.forget_statement(&first);
        assert!(registry.has_statement("p1"));

        // The connection stays bound until its last user releases it.
        registry.release(&first, Disposition::Discard).await;
        assert_eq!(registry.bound_connection(&identity), Some(second.connection_id()));
        registry.release(&second, Disposition::Recycle).await;
        assert_eq!(registry.bound_connection(&identity), None);
        assert!(registry.pool().idle_connections("default", "alice").is_empty());
        assert!(driver.connection(0).expect("opened").is_closed());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let driver = MockDriver::new();
        let registry = registry(&driver);

        registry.cancel("unknown").await.expect("nothing to cancel");

        let identity = ParagraphIdentity::new("alice", "p1");
        let bound = registry
            .get_or_create_statement("default", &identity)
            .await
            .expect("statement");
        registry.cancel("p1").await.expect("cancels");
        registry.cancel("p1").await.expect("cancels again");

        bound.statement().close().await.expect("closes");
        let err = registry.cancel("p1").await.expect_err("closed statement");
        assert_eq!(err.paragraph_id, "p1");
    }

    #[tokio::test]
    async fn close_all_tears_everything_down() {
        let driver = MockDriver::new();
        driver.respond("SELECT 1", MockResponse::rows(&["a"], &[&["1"]]));
        let registry = registry(&driver);

        let busy = registry
            .get_or_create_statement("default", &ParagraphIdentity::new("alice", "p1"))
            .await
            .expect("statement");
        let done = registry
            .get_or_create_statement("default", &ParagraphIdentity::new("bob", "p2"))
            .await
            .expect("statement");
        match done.statement().execute("SELECT 1", 10).await.expect("runs") {
            ExecuteOutcome::Rows(mut cursor) => cursor.close().await.expect("closes"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        registry.forget_statement(&done);
        registry.release(&done, Disposition::Recycle).await;

        registry.close_all().await;
        assert_eq!(driver.open_connection_count(), 0);
        assert!(busy.statement().is_closed().expect("supported"));
        assert!(!registry.has_statement("p1"));

        // A straggler releasing after teardown finds nothing to recycle.
        registry.release(&busy, Disposition::Recycle).await;
        assert!(registry.pool().idle_connections("default", "alice").is_empty());
    }
}
