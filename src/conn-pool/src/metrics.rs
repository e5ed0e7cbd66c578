// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prometheus monitoring metrics.

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

/// Prometheus monitoring metrics for the connection pool, labelled by
/// datasource.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub(crate) opened: IntCounterVec,
    pub(crate) reused: IntCounterVec,
    pub(crate) recycled: IntCounterVec,
    pub(crate) discarded: IntCounterVec,
    pub(crate) idle: IntGaugeVec,
}

impl PoolMetrics {
    /// Returns a new [PoolMetrics] instance connected to the given registry.
    pub fn register_into(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::unregistered();
        registry.register(Box::new(metrics.opened.clone()))?;
        registry.register(Box::new(metrics.reused.clone()))?;
        registry.register(Box::new(metrics.recycled.clone()))?;
        registry.register(Box::new(metrics.discarded.clone()))?;
        registry.register(Box::new(metrics.idle.clone()))?;
        Ok(metrics)
    }

    /// Returns metrics that are recorded but never exported.
    pub fn unregistered() -> Self {
        fn counter(name: &str, help: &str) -> IntCounterVec {
            IntCounterVec::new(Opts::new(name, help), &["datasource"])
                .expect("valid metric definition")
        }
        PoolMetrics {
            opened: counter(
                "hql_pool_connections_opened_count",
                "count of connections opened against a datasource",
            ),
            reused: counter(
                "hql_pool_connections_reused_count",
                "count of acquisitions served from an idle list",
            ),
            recycled: counter(
                "hql_pool_connections_recycled_count",
                "count of connections returned to an idle list",
            ),
            discarded: counter(
                "hql_pool_connections_discarded_count",
                "count of connections closed instead of recycled",
            ),
            idle: IntGaugeVec::new(
                Opts::new(
                    "hql_pool_connections_idle",
                    "number of idle connections across all users",
                ),
                &["datasource"],
            )
            .expect("valid metric definition"),
        }
    }
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self::unregistered()
    }
}
