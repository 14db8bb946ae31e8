// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shutdown coordination.
//!
//! Counts in-flight invocations through RAII guards and owns the shutdown
//! flag that background loops observe. The guards also record which
//! functions execute in this process, so watchdogs can skip local work.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::FunctionId;
use crate::error::{Error, Result};

/// Process-wide in-flight counter plus the "shutdown initiated" flag.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    token: CancellationToken,
    in_flight: watch::Sender<usize>,
    running: DashMap<FunctionId, usize>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    /// Create a coordinator with no work in flight.
    pub fn new() -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                in_flight,
                running: DashMap::new(),
            }),
        }
    }

    /// Count a unit of work for `function_id` until the guard is dropped.
    ///
    /// Fails with [`Error::ShutdownInitiated`] once shutdown has begun. The
    /// counter is incremented before the flag is checked, so a concurrent
    /// drain either waits for this guard or this call backs out.
    pub fn register_running(&self, function_id: &FunctionId) -> Result<RunningGuard> {
        self.inner.in_flight.send_modify(|count| *count += 1);
        *self.inner.running.entry(function_id.clone()).or_insert(0) += 1;

        let guard = RunningGuard {
            inner: self.inner.clone(),
            function_id: function_id.clone(),
        };

        if self.inner.token.is_cancelled() {
            return Err(Error::ShutdownInitiated);
        }
        Ok(guard)
    }

    /// True when a guard for `function_id` is alive in this process.
    pub fn is_running_locally(&self, function_id: &FunctionId) -> bool {
        self.inner.running.contains_key(function_id)
    }

    /// Number of guards currently alive.
    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight.borrow()
    }

    /// True once shutdown has been initiated.
    pub fn is_shutdown_initiated(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Set the shutdown flag without waiting for in-flight work.
    pub fn initiate(&self) {
        if !self.inner.token.is_cancelled() {
            debug!("Shutdown initiated");
        }
        self.inner.token.cancel();
    }

    /// Resolves once shutdown has been initiated.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Set the shutdown flag and wait until every guard has been dropped.
    ///
    /// With a timeout the wait fails with [`Error::ShutdownTimeout`] once it
    /// elapses; in-flight work keeps running untracked.
    pub async fn shutdown_gracefully(&self, timeout: Option<Duration>) -> Result<()> {
        self.initiate();

        let mut in_flight = self.inner.in_flight.subscribe();
        let drained = async move {
            // The sender lives in `inner`, so this only ends when the count hits zero.
            let _ = in_flight.wait_for(|count| *count == 0).await;
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, drained)
                .await
                .map_err(|_| Error::ShutdownTimeout { timeout })?,
            None => drained.await,
        }

        info!("Graceful shutdown completed");
        Ok(())
    }
}

/// Keeps one unit of work counted. Dropping it releases the count.
pub struct RunningGuard {
    inner: Arc<Inner>,
    function_id: FunctionId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.inner
            .running
            .remove_if_mut(&self.function_id, |_, count| {
                *count -= 1;
                *count == 0
            });
        self.inner.in_flight.send_modify(|count| *count -= 1);
    }
}
