// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background scanners that resume abandoned or due invocations.
//!
//! Every registered function type gets one crashed and one postponed
//! watchdog. Both re-enter the runner through [`ReInvoker`], so recovery
//! runs exactly the same loop as a caller-driven re-invocation. Races with
//! other processes are settled by the store's epoch-fenced writes; the
//! local checks here only avoid redundant work.

mod crashed;
mod postponed;
mod work_queue;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::domain::{Epoch, FunctionId, FunctionInstanceId, FunctionTypeId, Status};
use crate::error::Result;
use crate::runtime::Context;
use crate::unhandled::UnhandledError;

use crashed::CrashedWatchdog;
use postponed::PostponedWatchdog;

/// Type-erased entry into a runner, used by the watchdogs.
#[async_trait]
pub(crate) trait ReInvoker: Send + Sync {
    /// Function type served by this runner.
    fn function_type_id(&self) -> &FunctionTypeId;

    /// Re-invoke from stored state, discarding the result value.
    async fn re_invoke(
        &self,
        instance_id: FunctionInstanceId,
        expected_statuses: &[Status],
        expected_epoch: Option<Epoch>,
    ) -> Result<()>;
}

/// Spawn the watchdogs of one function type. Disabled watchdogs spawn nothing.
pub(crate) fn start(context: Arc<Context>, re_invoker: Arc<dyn ReInvoker>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(2);

    if !context.settings.crashed_check_frequency.is_zero() {
        let watchdog = CrashedWatchdog::new(context.clone(), re_invoker.clone());
        handles.push(tokio::spawn(async move { watchdog.run().await }));
    }

    if !context.settings.postponed_check_frequency.is_zero() {
        let watchdog = PostponedWatchdog::new(context, re_invoker);
        handles.push(tokio::spawn(async move { watchdog.run().await }));
    }

    handles
}

/// Take leadership of `epoch + 1` and run the function through the re-invocation path.
///
/// The runner takes leadership once more while preparing, so a recovered
/// function resumes at `epoch + 2`.
pub(crate) async fn resume(
    context: &Context,
    re_invoker: &dyn ReInvoker,
    instance_id: FunctionInstanceId,
    epoch: Epoch,
) -> Result<()> {
    let function_id = FunctionId {
        type_id: re_invoker.function_type_id().clone(),
        instance_id,
    };

    let became_leader = context
        .store
        .try_to_become_leader(&function_id, Status::Executing, epoch, epoch + 1)
        .await?;
    if !became_leader {
        debug!(function_id = %function_id, epoch, "Another process took over, skipping");
        return Ok(());
    }

    re_invoker
        .re_invoke(function_id.instance_id, &[Status::Executing], Some(epoch + 1))
        .await
}

/// Swallow the expected races and report everything else.
pub(crate) fn report_outcome(
    context: &Context,
    function_type_id: &FunctionTypeId,
    instance_id: &FunctionInstanceId,
    message: &str,
    result: Result<()>,
) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_unexpected_function_state() || e.is_postponed() || e.is_shutdown() => {
            debug!(
                function_type_id = %function_type_id,
                instance_id = %instance_id,
                reason = %e,
                "Resumption ended without completing"
            );
        }
        Err(e) => context.unhandled.report(UnhandledError {
            function_type_id: function_type_id.clone(),
            instance_id: Some(instance_id.clone()),
            message: message.to_string(),
            error: e,
        }),
    }
}
