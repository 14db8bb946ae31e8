// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The execution loop shared by every invocation path.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use tracing::{debug, info, instrument, warn};

use super::{Body, FunctionKind, Persistable, PostInvoke, PreInvoke};
use crate::clock;
use crate::domain::{
    Epoch, FunctionId, FunctionInstanceId, FunctionTypeId, Metadata, Outcome, Status,
    StoredFailure, StoredParameter, StoredResult,
};
use crate::error::{Error, Result};
use crate::runtime::Context;
use crate::scrapbook::Scrapbook;
use crate::shutdown::RunningGuard;
use crate::sign_of_life::SignOfLifeUpdater;
use crate::unhandled::UnhandledError;
use crate::watchdog::ReInvoker;

/// Runner bound to one registered function type.
pub(crate) struct Invoker<P, S, R> {
    pub(crate) function_type_id: FunctionTypeId,
    pub(crate) body: Body<P, S, R>,
    pub(crate) pre_invoke: Option<PreInvoke<P, S>>,
    pub(crate) post_invoke: Option<PostInvoke<P, S, R>>,
    pub(crate) kind: FunctionKind,
    pub(crate) context: Arc<Context>,
}

/// State recovered from the store before a re-invocation.
struct Prepared<P, S> {
    param: P,
    scrapbook: Scrapbook<S>,
    epoch: Epoch,
}

impl<P, S, R> Invoker<P, S, R>
where
    P: Persistable + Clone,
    S: Persistable + Default,
    R: Persistable,
{
    fn function_id(&self, instance_id: FunctionInstanceId) -> FunctionId {
        FunctionId {
            type_id: self.function_type_id.clone(),
            instance_id,
        }
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    #[instrument(skip_all, fields(function_type_id = %self.function_type_id, instance_id = %instance_id))]
    pub(crate) async fn invoke(&self, instance_id: FunctionInstanceId, param: P) -> Result<R> {
        let function_id = self.function_id(instance_id);
        let guard = self.context.shutdown.register_running(&function_id)?;

        if !self.persist_new(&function_id, &param).await? {
            drop(guard);
            debug!("Function already exists, awaiting its completion");
            return self.wait_for_completion(&function_id).await;
        }

        let scrapbook = self.new_scrapbook(&function_id, 0);
        self.execute(function_id, param, scrapbook, 0, guard).await
    }

    #[instrument(skip_all, fields(function_type_id = %self.function_type_id, instance_id = %instance_id))]
    pub(crate) async fn schedule(
        self: &Arc<Self>,
        instance_id: FunctionInstanceId,
        param: P,
    ) -> Result<()> {
        let function_id = self.function_id(instance_id);
        let guard = self.context.shutdown.register_running(&function_id)?;

        if !self.persist_new(&function_id, &param).await? {
            debug!("Function already exists, nothing to schedule");
            return Ok(());
        }

        let scrapbook = self.new_scrapbook(&function_id, 0);
        self.spawn_execution(function_id, param, scrapbook, 0, guard);
        Ok(())
    }

    #[instrument(skip_all, fields(function_type_id = %self.function_type_id, instance_id = %instance_id))]
    pub(crate) async fn re_invoke(
        &self,
        instance_id: FunctionInstanceId,
        expected_statuses: &[Status],
        expected_epoch: Option<Epoch>,
    ) -> Result<R> {
        let function_id = self.function_id(instance_id);
        let guard = self.context.shutdown.register_running(&function_id)?;

        let prepared = self
            .prepare_for_re_invocation(&function_id, expected_statuses, expected_epoch)
            .await?;
        self.execute(
            function_id,
            prepared.param,
            prepared.scrapbook,
            prepared.epoch,
            guard,
        )
        .await
    }

    #[instrument(skip_all, fields(function_type_id = %self.function_type_id, instance_id = %instance_id))]
    pub(crate) async fn schedule_re_invoke(
        self: &Arc<Self>,
        instance_id: FunctionInstanceId,
        expected_statuses: &[Status],
        expected_epoch: Option<Epoch>,
    ) -> Result<()> {
        let function_id = self.function_id(instance_id);
        // Counted before the task exists, so a concurrent drain cannot miss it.
        let guard = self.context.shutdown.register_running(&function_id)?;

        let prepared = self
            .prepare_for_re_invocation(&function_id, expected_statuses, expected_epoch)
            .await?;
        self.spawn_execution(
            function_id,
            prepared.param,
            prepared.scrapbook,
            prepared.epoch,
            guard,
        );
        Ok(())
    }

    fn spawn_execution(
        self: &Arc<Self>,
        function_id: FunctionId,
        param: P,
        scrapbook: Scrapbook<S>,
        epoch: Epoch,
        guard: RunningGuard,
    ) {
        let invoker = self.clone();
        tokio::spawn(async move {
            let result = invoker
                .execute(function_id.clone(), param, scrapbook, epoch, guard)
                .await;
            match result {
                Ok(_) => {}
                Err(e) if e.is_postponed() || e.is_unexpected_function_state() || e.is_shutdown() => {
                    debug!(function_id = %function_id, reason = %e, "Background invocation ended");
                }
                Err(e) => invoker.context.unhandled.report(UnhandledError {
                    function_type_id: function_id.type_id.clone(),
                    instance_id: Some(function_id.instance_id.clone()),
                    message: "Background invocation failed".to_string(),
                    error: e,
                }),
            }
        });
    }

    // ========================================================================
    // Persistence helpers
    // ========================================================================

    async fn persist_new(&self, function_id: &FunctionId, param: &P) -> Result<bool> {
        let stored_param = StoredParameter::encode(param)?;
        let scrapbook_type = self
            .kind
            .uses_scrapbook
            .then(std::any::type_name::<S>);

        self.context
            .store
            .create_function(
                function_id,
                &stored_param,
                scrapbook_type,
                Status::Executing,
                0,
                0,
            )
            .await
    }

    fn new_scrapbook(&self, function_id: &FunctionId, epoch: Epoch) -> Scrapbook<S> {
        let scrapbook = Scrapbook::default();
        self.bind_scrapbook(&scrapbook, function_id, epoch);
        scrapbook
    }

    fn bind_scrapbook(&self, scrapbook: &Scrapbook<S>, function_id: &FunctionId, epoch: Epoch) {
        if self.kind.uses_scrapbook {
            scrapbook.bind(self.context.store.clone(), function_id.clone(), epoch);
        }
    }

    /// Validate preconditions, then take leadership with the next epoch.
    async fn prepare_for_re_invocation(
        &self,
        function_id: &FunctionId,
        expected_statuses: &[Status],
        expected_epoch: Option<Epoch>,
    ) -> Result<Prepared<P, S>> {
        let stored = self
            .context
            .store
            .get_function(function_id)
            .await?
            .ok_or_else(|| {
                Error::framework(
                    &self.function_type_id,
                    format!("function '{function_id}' vanished before it could be re-invoked"),
                )
            })?;

        if !expected_statuses.contains(&stored.status) {
            return Err(Error::unexpected_state(
                function_id,
                format!(
                    "status is '{}' but one of {:?} was expected",
                    stored.status, expected_statuses
                ),
            ));
        }
        if let Some(expected) = expected_epoch
            && expected != stored.epoch
        {
            return Err(Error::unexpected_state(
                function_id,
                format!("epoch is {} but {} was expected", stored.epoch, expected),
            ));
        }

        let param: P = stored.parameter.decode()?;
        let scrapbook = if self.kind.uses_scrapbook {
            Scrapbook::from_json(stored.scrapbook.as_ref().and_then(|s| s.json.as_deref()))?
        } else {
            Scrapbook::default()
        };

        let epoch = stored.epoch + 1;
        let became_leader = self
            .context
            .store
            .try_to_become_leader(function_id, Status::Executing, stored.epoch, epoch)
            .await?;
        if !became_leader {
            return Err(Error::unexpected_state(
                function_id,
                format!("another invocation became leader for epoch {epoch}"),
            ));
        }

        self.bind_scrapbook(&scrapbook, function_id, epoch);
        Ok(Prepared {
            param,
            scrapbook,
            epoch,
        })
    }

    /// Persist an outcome under `epoch`.
    ///
    /// A value or scrapbook that cannot be serialized turns into a failure, so
    /// the row never stays `Executing` because of it.
    async fn persist_outcome(
        &self,
        function_id: &FunctionId,
        outcome: Outcome<R>,
        scrapbook: &Scrapbook<S>,
        epoch: Epoch,
    ) -> Result<Outcome<R>> {
        let (outcome, scrapbook_json) = if self.kind.uses_scrapbook {
            match scrapbook.to_json() {
                Ok(json) => (outcome, Some(json)),
                Err(e) => (Outcome::Fail(StoredFailure::from_error(&e)), None),
            }
        } else {
            (outcome, None)
        };

        let (outcome, result) = match outcome {
            Outcome::Succeed(value) if self.kind.persists_result => {
                match StoredResult::encode(&value) {
                    Ok(stored) => (Outcome::Succeed(value), Some(stored)),
                    Err(e) => (Outcome::Fail(StoredFailure::from_error(&e)), None),
                }
            }
            other => (other, None),
        };

        let (status, failure, postponed_until) = match &outcome {
            Outcome::Succeed(_) => (Status::Succeeded, None, None),
            Outcome::Fail(failure) => (Status::Failed, Some(failure), None),
            Outcome::Postpone { until, .. } => (Status::Postponed, None, Some(*until)),
        };

        let persisted = self
            .context
            .store
            .set_function_state(
                function_id,
                status,
                scrapbook_json.as_deref(),
                result.as_ref(),
                failure,
                postponed_until,
                epoch,
            )
            .await?;
        if !persisted {
            return Err(Error::unexpected_state(
                function_id,
                format!("epoch {epoch} is no longer current, outcome was not persisted"),
            ));
        }
        Ok(outcome)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run the body until it succeeds, fails, or is postponed beyond an in-process wait.
    async fn execute(
        &self,
        function_id: FunctionId,
        param: P,
        scrapbook: Scrapbook<S>,
        mut epoch: Epoch,
        _guard: RunningGuard,
    ) -> Result<R> {
        let metadata = Metadata {
            function_id: function_id.clone(),
            param: param.clone(),
        };

        loop {
            let outcome = {
                let _sign_of_life = SignOfLifeUpdater::start(
                    self.context.store.clone(),
                    self.context.unhandled.clone(),
                    function_id.clone(),
                    epoch,
                    self.context.settings.effective_sign_of_life_frequency(),
                );
                self.run_body(param.clone(), &scrapbook, &metadata).await
            };

            match self
                .persist_outcome(&function_id, outcome, &scrapbook, epoch)
                .await?
            {
                Outcome::Succeed(value) => {
                    info!(function_id = %function_id, epoch, "Function succeeded");
                    return Ok(value);
                }
                Outcome::Fail(failure) => {
                    warn!(function_id = %function_id, epoch, failure = %failure, "Function failed");
                    return Err(Error::FunctionFailed {
                        function_id,
                        failure,
                    });
                }
                Outcome::Postpone {
                    until,
                    in_process_wait,
                } => {
                    let threshold = self.context.settings.in_process_wait_threshold;
                    if !in_process_wait || clock::remaining(until) > threshold {
                        info!(function_id = %function_id, epoch, until = %until, "Function postponed");
                        return Err(Error::Postponed {
                            function_id,
                            until,
                        });
                    }

                    debug!(function_id = %function_id, until = %until, "Waiting in process for postponement");
                    tokio::select! {
                        biased;

                        _ = self.context.shutdown.cancelled() => {
                            return Err(Error::Postponed { function_id, until });
                        }

                        _ = clock::sleep_until(until) => {}
                    }

                    let next_epoch = epoch + 1;
                    let became_leader = self
                        .context
                        .store
                        .try_to_become_leader(&function_id, Status::Executing, epoch, next_epoch)
                        .await?;
                    if !became_leader {
                        return Err(Error::unexpected_state(
                            &function_id,
                            format!("another invocation resumed the function after epoch {epoch}"),
                        ));
                    }
                    epoch = next_epoch;
                    self.bind_scrapbook(&scrapbook, &function_id, epoch);
                }
            }
        }
    }

    /// Pre-invoke hook, body and post-invoke hook. Errors and panics become failures.
    async fn run_body(
        &self,
        param: P,
        scrapbook: &Scrapbook<S>,
        metadata: &Metadata<P>,
    ) -> Outcome<R> {
        let pre_invoked = match &self.pre_invoke {
            Some(pre_invoke) => {
                let hook = pre_invoke.clone();
                let (scrapbook, metadata) = (scrapbook.clone(), metadata.clone());
                match AssertUnwindSafe(async move { hook(scrapbook, metadata).await })
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(StoredFailure::from_error(&e)),
                    Err(panic) => Err(StoredFailure::from_panic(panic.as_ref())),
                }
            }
            None => Ok(()),
        };

        let outcome = match pre_invoked {
            Ok(()) => {
                let body = self.body.clone();
                let scrapbook = scrapbook.clone();
                AssertUnwindSafe(async move { body(param, scrapbook).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        let failure = StoredFailure::from_panic(panic.as_ref());
                        warn!(function_id = %metadata.function_id, panic = %failure.message, "Function body panicked");
                        Outcome::Fail(failure)
                    })
            }
            Err(failure) => Outcome::Fail(failure),
        };

        match &self.post_invoke {
            Some(post_invoke) => {
                let hook = post_invoke.clone();
                let (scrapbook, metadata) = (scrapbook.clone(), metadata.clone());
                let function_id = metadata.function_id.clone();
                AssertUnwindSafe(async move { hook(outcome, scrapbook, metadata).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        let failure = StoredFailure::from_panic(panic.as_ref());
                        warn!(function_id = %function_id, panic = %failure.message, "Post-invoke hook panicked");
                        Outcome::Fail(failure)
                    })
            }
            None => outcome,
        }
    }

    /// True while a postponed row is expected to be resumed by a waiting
    /// invocation rather than by the postponed watchdog.
    ///
    /// Either this process still runs the function, or the due time is within
    /// the in-process wait threshold and has not been overdue for more than
    /// two poll intervals.
    fn resumes_in_process(&self, function_id: &FunctionId, until: DateTime<Utc>) -> bool {
        if self.context.shutdown.is_running_locally(function_id) {
            return true;
        }
        let settings = &self.context.settings;
        let grace = TimeDelta::from_std(settings.completion_poll_interval * 2)
            .unwrap_or_else(|_| TimeDelta::zero());
        clock::remaining(until) <= settings.in_process_wait_threshold
            && until
                .checked_add_signed(grace)
                .is_none_or(|deadline| Utc::now() < deadline)
    }

    /// Poll until another execution of `function_id` reaches a terminal status,
    /// or a postponement that is left to the postponed watchdog.
    async fn wait_for_completion(&self, function_id: &FunctionId) -> Result<R> {
        let poll_interval = self.context.settings.completion_poll_interval;
        loop {
            let stored = self
                .context
                .store
                .get_function(function_id)
                .await?
                .ok_or_else(|| {
                    Error::framework(
                        &self.function_type_id,
                        format!("function '{function_id}' vanished while awaiting its completion"),
                    )
                })?;

            match stored.status {
                Status::Executing => {
                    tokio::select! {
                        biased;

                        _ = self.context.shutdown.cancelled() => return Err(Error::ShutdownInitiated),

                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
                Status::Succeeded => {
                    return match stored.result {
                        Some(result) => result.decode(),
                        None => Ok(serde_json::from_str("null")?),
                    };
                }
                Status::Failed => {
                    return Err(Error::PreviousInvocationFailed {
                        function_id: function_id.clone(),
                        failure: stored.failure.unwrap_or_else(|| {
                            StoredFailure::new("unknown", "failure was not recorded")
                        }),
                    });
                }
                Status::Postponed => {
                    let until = stored.postponed_until.unwrap_or_else(Utc::now);
                    if !self.resumes_in_process(function_id, until) {
                        return Err(Error::Postponed {
                            function_id: function_id.clone(),
                            until,
                        });
                    }
                    tokio::select! {
                        biased;

                        _ = self.context.shutdown.cancelled() => return Err(Error::ShutdownInitiated),

                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<P, S, R> ReInvoker for Invoker<P, S, R>
where
    P: Persistable + Clone,
    S: Persistable + Default,
    R: Persistable,
{
    fn function_type_id(&self) -> &FunctionTypeId {
        &self.function_type_id
    }

    async fn re_invoke(
        &self,
        instance_id: FunctionInstanceId,
        expected_statuses: &[Status],
        expected_epoch: Option<Epoch>,
    ) -> Result<()> {
        Invoker::re_invoke(self, instance_id, expected_statuses, expected_epoch)
            .await
            .map(|_| ())
    }
}
