// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Detects executions whose sign of life stopped moving and resumes them.
//!
//! Each pass reads every `Executing` row of the function type. A row whose
//! `(epoch, sign_of_life)` pair is identical in two consecutive passes made
//! no progress for a whole interval: its owner is considered crashed.
//! Rows seen in only one of the passes are never flagged.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::{ReInvoker, report_outcome, resume};
use crate::domain::{Epoch, FunctionId, FunctionInstanceId, SignOfLife, Status};
use crate::error::Result;
use crate::runtime::Context;
use crate::unhandled::UnhandledError;

type Snapshot = HashMap<FunctionInstanceId, (Epoch, SignOfLife)>;

/// Crashed-execution scanner for one function type.
pub(crate) struct CrashedWatchdog {
    context: Arc<Context>,
    re_invoker: Arc<dyn ReInvoker>,
}

impl CrashedWatchdog {
    pub(crate) fn new(context: Arc<Context>, re_invoker: Arc<dyn ReInvoker>) -> Self {
        Self {
            context,
            re_invoker,
        }
    }

    /// Scan until shutdown is initiated.
    pub(crate) async fn run(&self) {
        let frequency = self.context.settings.crashed_check_frequency;
        let function_type_id = self.re_invoker.function_type_id();
        info!(
            function_type_id = %function_type_id,
            check_frequency_ms = frequency.as_millis() as u64,
            "Crashed watchdog started"
        );

        let mut previous = Snapshot::new();
        loop {
            tokio::select! {
                biased;

                _ = self.context.shutdown.cancelled() => break,

                _ = tokio::time::sleep(frequency) => {}
            }

            match self.snapshot().await {
                Ok(current) => {
                    let hung = hung_functions(&previous, &current);
                    if !hung.is_empty() {
                        info!(
                            function_type_id = %function_type_id,
                            count = hung.len(),
                            "Found crashed functions"
                        );
                    }
                    for (instance_id, epoch) in hung {
                        self.recover(instance_id, epoch);
                    }
                    previous = current;
                }
                Err(e) => self.context.unhandled.report(UnhandledError {
                    function_type_id: function_type_id.clone(),
                    instance_id: None,
                    message: "Crashed watchdog failed to read executing functions".to_string(),
                    error: e,
                }),
            }
        }

        info!(function_type_id = %function_type_id, "Crashed watchdog stopped");
    }

    async fn snapshot(&self) -> Result<Snapshot> {
        let executing = self
            .context
            .store
            .get_functions_with_status(self.re_invoker.function_type_id(), Status::Executing, None)
            .await?;

        Ok(executing
            .into_iter()
            .map(|f| (f.instance_id, (f.epoch, f.sign_of_life)))
            .collect())
    }

    /// Resume one hung instance on a background task.
    fn recover(&self, instance_id: FunctionInstanceId, epoch: Epoch) {
        let function_id = FunctionId {
            type_id: self.re_invoker.function_type_id().clone(),
            instance_id,
        };
        if self.context.shutdown.is_running_locally(&function_id) {
            debug!(function_id = %function_id, "Still running in this process, not recovering");
            return;
        }
        let Ok(guard) = self.context.shutdown.register_running(&function_id) else {
            return;
        };

        debug!(function_id = %function_id, epoch, "Recovering crashed function");
        let context = self.context.clone();
        let re_invoker = self.re_invoker.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let result = resume(
                &context,
                re_invoker.as_ref(),
                function_id.instance_id.clone(),
                epoch,
            )
            .await;
            report_outcome(
                &context,
                &function_id.type_id,
                &function_id.instance_id,
                "Crashed watchdog failed to resume function",
                result,
            );
        });
    }
}

/// Instances present in both snapshots with an unchanged epoch and sign of life.
fn hung_functions(previous: &Snapshot, current: &Snapshot) -> Vec<(FunctionInstanceId, Epoch)> {
    let mut hung: Vec<_> = current
        .iter()
        .filter(|(instance_id, state)| previous.get(*instance_id) == Some(*state))
        .map(|(instance_id, (epoch, _))| (instance_id.clone(), *epoch))
        .collect();
    hung.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
    hung
}
