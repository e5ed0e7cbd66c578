// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

/// Runs submitted work on the tokio runtime with at most a fixed number of
/// jobs in flight.
#[derive(Debug, Clone)]
pub struct ParallelScheduler {
    name: String,
    slots: usize,
    permits: Arc<Semaphore>,
}

impl ParallelScheduler {
    /// Concurrent slots per interpreter when not configured otherwise.
    pub const DEFAULT_SLOTS: usize = 50;

    pub fn new(name: impl Into<String>, slots: usize) -> Self {
        ParallelScheduler {
            name: name.into(),
            slots,
            permits: Arc::new(Semaphore::new(slots)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Slots not currently running a job.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Spawns `job`, which starts once a slot is free.
    pub fn submit<F>(&self, job: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let name = self.name.clone();
        tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .expect("acquiring permit from open semaphore");
            debug!(scheduler = %name, "running job");
            job.await
        })
    }
}
