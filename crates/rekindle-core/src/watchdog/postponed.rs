// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Postponed watchdog: resumes postponed functions once they are due.
//!
//! Each pass looks one interval ahead, so a function due before the next pass
//! gets its own timer and resumes on time instead of at the next poll. Timers
//! fire independently, which keeps resumption in due-time order. Work for one
//! instance goes through a keyed queue, so overlapping passes never resume the
//! same instance concurrently in this process.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashSet;
use futures::FutureExt;
use tracing::{debug, info};

use super::work_queue::WorkQueue;
use super::{ReInvoker, report_outcome, resume};
use crate::clock;
use crate::domain::{Epoch, FunctionId, FunctionInstanceId, Status, StoredFunctionStatus};
use crate::error::Result;
use crate::runtime::Context;
use crate::unhandled::UnhandledError;

/// Postponed-function scanner for one function type.
pub(crate) struct PostponedWatchdog {
    context: Arc<Context>,
    re_invoker: Arc<dyn ReInvoker>,
    /// `(instance, epoch)` pairs whose timer or resumption is outstanding.
    pending: Arc<DashSet<(FunctionInstanceId, Epoch)>>,
    queue: WorkQueue,
}

impl PostponedWatchdog {
    pub(crate) fn new(context: Arc<Context>, re_invoker: Arc<dyn ReInvoker>) -> Self {
        Self {
            context,
            re_invoker,
            pending: Arc::new(DashSet::new()),
            queue: WorkQueue::new(),
        }
    }

    /// Scan until shutdown is initiated.
    pub(crate) async fn run(&self) {
        let frequency = self.context.settings.postponed_check_frequency;
        let delay_startup = self.context.settings.delay_startup;
        let function_type_id = self.re_invoker.function_type_id();
        info!(
            function_type_id = %function_type_id,
            check_frequency_ms = frequency.as_millis() as u64,
            delay_startup_ms = delay_startup.as_millis() as u64,
            "Postponed watchdog started"
        );

        if !delay_startup.is_zero() {
            tokio::select! {
                biased;

                _ = self.context.shutdown.cancelled() => {
                    info!(function_type_id = %function_type_id, "Postponed watchdog stopped");
                    return;
                }

                _ = tokio::time::sleep(delay_startup) => {}
            }
        }

        // Scan first, then sleep: rows that came due while no process was
        // running are picked up at startup, `delay_startup` being the only wait.
        loop {
            match self.due_functions().await {
                Ok(due) => {
                    if !due.is_empty() {
                        debug!(
                            function_type_id = %function_type_id,
                            count = due.len(),
                            "Found postponed functions due within the next interval"
                        );
                    }
                    for function in due {
                        self.schedule(function);
                    }
                }
                Err(e) => self.context.unhandled.report(UnhandledError {
                    function_type_id: function_type_id.clone(),
                    instance_id: None,
                    message: "Postponed watchdog failed to read postponed functions".to_string(),
                    error: e,
                }),
            }

            tokio::select! {
                biased;

                _ = self.context.shutdown.cancelled() => break,

                _ = tokio::time::sleep(frequency) => {}
            }
        }

        info!(function_type_id = %function_type_id, "Postponed watchdog stopped");
    }

    async fn due_functions(&self) -> Result<Vec<StoredFunctionStatus>> {
        let look_ahead = clock::after(self.context.settings.postponed_check_frequency);
        self.context
            .store
            .get_functions_with_status(
                self.re_invoker.function_type_id(),
                Status::Postponed,
                Some(look_ahead),
            )
            .await
    }

    /// Start a timer for one candidate unless it is already pending or running here.
    fn schedule(&self, function: StoredFunctionStatus) {
        let function_id = FunctionId {
            type_id: self.re_invoker.function_type_id().clone(),
            instance_id: function.instance_id,
        };
        if self.context.shutdown.is_running_locally(&function_id) {
            debug!(function_id = %function_id, "Still running in this process, not resuming");
            return;
        }

        let key = (function_id.instance_id.clone(), function.epoch);
        if !self.pending.insert(key.clone()) {
            return;
        }

        let epoch = function.epoch;
        let due = function.postponed_until.unwrap_or_else(Utc::now);
        let context = self.context.clone();
        let re_invoker = self.re_invoker.clone();
        let pending = self.pending.clone();
        let queue = self.queue.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = context.shutdown.cancelled() => {
                    pending.remove(&key);
                    return;
                }

                _ = tokio::time::sleep(clock::remaining(due)) => {}
            }

            let queue_key = function_id.instance_id.as_str().to_string();
            let work = async move {
                clock::sleep_until(due).await;

                let result = match context.shutdown.register_running(&function_id) {
                    Ok(_guard) => {
                        debug!(function_id = %function_id, epoch, "Resuming postponed function");
                        resume(
                            &context,
                            re_invoker.as_ref(),
                            function_id.instance_id.clone(),
                            epoch,
                        )
                        .await
                    }
                    Err(e) => Err(e),
                };
                report_outcome(
                    &context,
                    &function_id.type_id,
                    &function_id.instance_id,
                    "Postponed watchdog failed to resume function",
                    result,
                );
                pending.remove(&key);
            };
            queue.enqueue(queue_key, work.boxed()).await;
        });
    }
}
