// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Per-(datasource, user) pooling of authenticated connections.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hql_datasource::{CredentialPolicy, DatasourceRegistry};
use tracing::{debug, error, info, warn};

use crate::{Connection, DriverRegistry, PoolError, PoolMetrics};

/// Identifies a connection for the lifetime of the process.
pub type ConnectionId = u64;

/// A connection owned either by the pool (idle) or by exactly one execution.
///
/// Not `Clone`: a connection has exactly one owner at a time.
pub struct PooledConnection {
    id: ConnectionId,
    key: PoolKey,
    inner: Arc<dyn Connection>,
}

impl PooledConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn datasource(&self) -> &str {
        &self.key.datasource
    }

    pub fn user(&self) -> &str {
        &self.key.user
    }

    /// The underlying session.
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.inner
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("datasource", &self.key.datasource)
            .field("user", &self.key.user)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PoolKey {
    datasource: String,
    user: String,
}

impl PoolKey {
    fn new(datasource: &str, user: &str) -> Self {
        PoolKey {
            datasource: datasource.to_string(),
            user: user.to_string(),
        }
    }
}

/// A snapshot of the connections the pool knows about for one
/// (datasource, user) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub checked_out: usize,
}

/// Thread-safe pool of idle connections, keyed by datasource and user.
///
/// The pool is unbounded: acquisition never waits for capacity. The number of
/// connections is bounded by how many paragraphs execute concurrently.
pub struct ConnectionPool {
    datasources: Arc<DatasourceRegistry>,
    drivers: DriverRegistry,
    credentials: CredentialPolicy,
    metrics: PoolMetrics,
    /// Oldest connections at the front.
    idle: Mutex<BTreeMap<PoolKey, VecDeque<PooledConnection>>>,
    checked_out: Mutex<BTreeMap<ConnectionId, (PoolKey, Arc<dyn Connection>)>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("drivers", &self.drivers)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    pub fn new(
        datasources: Arc<DatasourceRegistry>,
        drivers: DriverRegistry,
        credentials: CredentialPolicy,
    ) -> Self {
        ConnectionPool {
            datasources,
            drivers,
            credentials,
            metrics: PoolMetrics::unregistered(),
            idle: Mutex::new(BTreeMap::new()),
            checked_out: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_metrics(mut self, metrics: PoolMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn datasources(&self) -> &Arc<DatasourceRegistry> {
        &self.datasources
    }

    /// Hands out a connection for `user` on `datasource`.
    ///
    /// The oldest idle connection for the pair is reused if it is still open;
    /// otherwise a new connection is opened with credentials chosen by the
    /// pool's [`CredentialPolicy`].
    pub async fn acquire(&self, datasource: &str, user: &str) -> Result<PooledConnection, PoolError> {
        let key = PoolKey::new(datasource, user);

        let candidate = {
            let mut idle = self.idle.lock().expect("lock poisoned");
            debug!(pools = ?IdleSummary(&idle), "acquiring connection");
            let candidate = idle.get_mut(&key).and_then(VecDeque::pop_front);
            if candidate.is_some() {
                self.metrics
                    .idle
                    .with_label_values(&[datasource])
                    .dec();
            }
            candidate
        };

        if let Some(connection) = candidate {
            self.track_checked_out(&connection);
            if connection.inner.is_closed() {
                info!(
                    connection_id = connection.id,
                    datasource, user, "idle connection was closed, opening a new one"
                );
                self.discard(connection).await;
            } else {
                debug!(connection_id = connection.id, datasource, user, "reusing idle connection");
                self.metrics.reused.with_label_values(&[datasource]).inc();
                return Ok(connection);
            }
        }

        self.open(key).await
    }

    async fn open(&self, key: PoolKey) -> Result<PooledConnection, PoolError> {
        let profile = self.datasources.resolve(&key.datasource)?;
        let driver = self.drivers.get(profile.driver())?;
        let auth = self
            .credentials
            .resolve(profile, &key.user)
            .into_auth(profile);
        let inner = driver
            .connect(profile.url(), &auth)
            .await
            .map_err(|source| PoolError::Authentication {
                datasource: key.datasource.clone(),
                source,
            })?;

        let connection = PooledConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key,
            inner,
        };
        info!(
            connection_id = connection.id,
            datasource = connection.datasource(),
            user = connection.user(),
            "opened connection"
        );
        self.metrics
            .opened
            .with_label_values(&[connection.datasource()])
            .inc();
        self.track_checked_out(&connection);
        Ok(connection)
    }

    /// Returns a healthy connection to the back of its idle list.
    ///
    /// After [`ConnectionPool::close_all`] the connection is closed instead.
    pub async fn release(&self, connection: PooledConnection) {
        let connection = {
            // `shut_down` only changes under the idle lock, so a connection
            // pushed here is always seen by `close_all`.
            let mut idle = self.idle.lock().expect("lock poisoned");
            if self.shut_down.load(Ordering::SeqCst) {
                connection
            } else {
                self.untrack_checked_out(connection.id);
                self.metrics
                    .recycled
                    .with_label_values(&[connection.datasource()])
                    .inc();
                self.metrics
                    .idle
                    .with_label_values(&[connection.datasource()])
                    .inc();
                debug!(
                    connection_id = connection.id,
                    datasource = connection.datasource(),
                    user = connection.user(),
                    "recycling connection"
                );
                idle.entry(connection.key.clone())
                    .or_default()
                    .push_back(connection);
                debug!(pools = ?IdleSummary(&idle), "recycled connection");
                return;
            }
        };
        debug!(connection_id = connection.id, "pool is shut down, closing released connection");
        self.discard(connection).await;
    }

    /// Closes a connection that must not be reused.
    pub async fn discard(&self, connection: PooledConnection) {
        self.untrack_checked_out(connection.id);
        self.metrics
            .discarded
            .with_label_values(&[connection.datasource()])
            .inc();
        info!(
            connection_id = connection.id,
            datasource = connection.datasource(),
            user = connection.user(),
            "discarding connection"
        );
        if let Err(e) = connection.inner.close().await {
            warn!(connection_id = connection.id, "error closing discarded connection: {e}");
        }
    }

    /// Closes every idle and checked-out connection the pool knows about.
    ///
    /// Teardown is best effort: a failure to close one connection is logged
    /// and does not stop the rest from being closed. Connections released
    /// afterwards are closed rather than recycled.
    pub async fn close_all(&self) {
        let idle: Vec<_> = {
            let mut idle = self.idle.lock().expect("lock poisoned");
            self.shut_down.store(true, Ordering::SeqCst);
            std::mem::take(&mut *idle)
                .into_values()
                .flatten()
                .map(|c| (c.id, c.inner))
                .collect()
        };
        self.metrics.idle.reset();
        let checked_out: Vec<_> = {
            let mut checked_out = self.checked_out.lock().expect("lock poisoned");
            std::mem::take(&mut *checked_out)
                .into_iter()
                .map(|(id, (_, inner))| (id, inner))
                .collect()
        };

        info!(
            idle = idle.len(),
            checked_out = checked_out.len(),
            "closing all connections"
        );
        for (id, connection) in idle.into_iter().chain(checked_out) {
            if let Err(e) = connection.close().await {
                error!(connection_id = id, "error while closing connection: {e}");
            }
        }
    }

    pub fn stats(&self, datasource: &str, user: &str) -> PoolStats {
        let key = PoolKey::new(datasource, user);
        let idle = self
            .idle
            .lock()
            .expect("lock poisoned")
            .get(&key)
            .map_or(0, VecDeque::len);
        let checked_out = self
            .checked_out
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|(k, _)| *k == key)
            .count();
        PoolStats { idle, checked_out }
    }

    /// The ids of the idle connections for the pair, oldest first.
    pub fn idle_connections(&self, datasource: &str, user: &str) -> Vec<ConnectionId> {
        let key = PoolKey::new(datasource, user);
        self.idle
            .lock()
            .expect("lock poisoned")
            .get(&key)
            .map(|list| list.iter().map(|c| c.id).collect())
            .unwrap_or_default()
    }

    fn track_checked_out(&self, connection: &PooledConnection) {
        self.checked_out.lock().expect("lock poisoned").insert(
            connection.id,
            (connection.key.clone(), Arc::clone(&connection.inner)),
        );
    }

    fn untrack_checked_out(&self, id: ConnectionId) {
        self.checked_out.lock().expect("lock poisoned").remove(&id);
    }
}

/// Renders idle lists as `datasource/user: count` pairs.
struct IdleSummary<'a>(&'a BTreeMap<PoolKey, VecDeque<PooledConnection>>);

impl fmt::Debug for IdleSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.0
                    .iter()
                    .map(|(k, v)| (format!("{}/{}", k.datasource, k.user), v.len())),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hql_datasource::{CredentialPolicy, DatasourceRegistry, Properties};

    use crate::testing::MockDriver;
    use crate::{DriverRegistry, PoolError};

    use super::*;

    fn pool(driver: &MockDriver) -> ConnectionPool {
        let properties: Properties = [
            ("default.driver", "mock"),
            ("default.url", "mock://default"),
            ("default.user", "hive"),
            ("nodriver.driver", "missing"),
            ("nodriver.url", "mock://nowhere"),
        ]
        .into_iter()
        .collect();
        let mut drivers = DriverRegistry::new();
        drivers.register(["mock"], Arc::new(driver.clone()));
        ConnectionPool::new(
            Arc::new(DatasourceRegistry::from_properties(&properties)),
            drivers,
            CredentialPolicy::default(),
        )
    }

    #[tokio::test]
    async fn reuses_released_connections() {
        let driver = MockDriver::new();
        let pool = pool(&driver);

        let first = pool.acquire("default", "alice").await.expect("connects");
        let first_id = first.id();
        assert_eq!(pool.stats("default", "alice"), PoolStats { idle: 0, checked_out: 1 });
        pool.release(first).await;
        assert_eq!(pool.idle_connections("default", "alice"), vec![first_id]);

        let second = pool.acquire("default", "alice").await.expect("reuses");
        assert_eq!(second.id(), first_id);
        assert_eq!(driver.connect_count(), 1);

        // Another user never sees alice's connections.
        let other = pool.acquire("default", "bob").await.expect("connects");
        assert_ne!(other.id(), first_id);
        assert_eq!(driver.connect_count(), 2);
    }

    #[tokio::test]
    async fn hands_out_oldest_idle_connection_first() {
        let driver = MockDriver::new();
        let pool = pool(&driver);

        let a = pool.acquire("default", "alice").await.expect("connects");
        let b = pool.acquire("default", "alice").await.expect("connects");
        let (a_id, b_id) = (a.id(), b.id());
        pool.release(a).await;
        pool.release(b).await;
        assert_eq!(pool.acquire("default", "alice").await.expect("reuses").id(), a_id);
        assert_eq!(pool.acquire("default", "alice").await.expect("reuses").id(), b_id);
    }

    #[tokio::test]
    async fn replaces_closed_idle_connections() {
        let driver = MockDriver::new();
        let pool = pool(&driver);

        let conn = pool.acquire("default", "alice").await.expect("connects");
        let id = conn.id();
        pool.release(conn).await;
        driver.connection(0).expect("opened").kill();

        let fresh = pool.acquire("default", "alice").await.expect("reconnects");
        assert_ne!(fresh.id(), id);
        assert_eq!(driver.connect_count(), 2);
        assert!(pool.idle_connections("default", "alice").is_empty());
    }

    #[tokio::test]
    async fn discarded_connections_are_closed() {
        let driver = MockDriver::new();
        let pool = pool(&driver);

        let conn = pool.acquire("default", "alice").await.expect("connects");
        pool.discard(conn).await;
        assert!(driver.connection(0).expect("opened").is_closed());
        assert_eq!(pool.stats("default", "alice"), PoolStats::default());
    }

    #[tokio::test]
    async fn reports_missing_datasources_and_drivers() {
        let driver = MockDriver::new();
        let pool = pool(&driver);

        assert!(matches!(
            pool.acquire("reporting", "alice").await,
            Err(PoolError::Config(_))
        ));
        assert!(matches!(
            pool.acquire("nodriver", "alice").await,
            Err(PoolError::DriverUnavailable(d)) if d == "missing"
        ));

        driver.fail_connects("password authentication failed for user \"hive\"");
        match pool.acquire("default", "alice").await {
            Err(PoolError::Authentication { datasource, source }) => {
                assert_eq!(datasource, "default");
                assert!(source.message.contains("password authentication failed"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_all_closes_idle_and_checked_out() {
        let driver = MockDriver::new();
        let pool = pool(&driver);

        let idle = pool.acquire("default", "alice").await.expect("connects");
        let busy = pool.acquire("default", "bob").await.expect("connects");
        pool.release(idle).await;

        pool.close_all().await;
        assert_eq!(driver.open_connection_count(), 0);

        // Connections that come back after shutdown are not pooled again.
        pool.release(busy).await;
        assert!(pool.idle_connections("default", "bob").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn release_racing_close_all_never_pools_a_connection() {
        for _ in 0..200 {
            let driver = MockDriver::new();
            let pool = Arc::new(pool(&driver));
            let conn = pool.acquire("default", "alice").await.expect("connects");

            let releaser = {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.release(conn).await })
            };
            let closer = {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.close_all().await })
            };
            releaser.await.expect("release task");
            closer.await.expect("close task");

            assert_eq!(driver.open_connection_count(), 0);
            assert!(pool.idle_connections("default", "alice").is_empty());
        }
    }

    #[tokio::test]
    async fn close_all_continues_past_failures() {
        let driver = MockDriver::new();
        let pool = pool(&driver);

        let a = pool.acquire("default", "alice").await.expect("connects");
        let b = pool.acquire("default", "bob").await.expect("connects");
        pool.release(a).await;
        pool.release(b).await;
        driver.connection(0).expect("opened").fail_close("socket already gone");

        pool.close_all().await;
        assert!(driver.connection(1).expect("opened").is_closed());
    }
}
