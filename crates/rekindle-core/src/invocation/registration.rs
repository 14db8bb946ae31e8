// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Public handle to a registered function type.

use std::fmt;
use std::sync::Arc;

use super::{Invoker, Persistable};
use crate::domain::{Epoch, FunctionInstanceId, FunctionTypeId, Status};
use crate::error::Result;

/// Handle returned when a function type is registered.
///
/// Cheap to clone. Registering the same type again returns a handle to the
/// same runner.
pub struct Registration<P, S, R> {
    pub(crate) invoker: Arc<Invoker<P, S, R>>,
}

impl<P, S, R> Clone for Registration<P, S, R> {
    fn clone(&self) -> Self {
        Self {
            invoker: self.invoker.clone(),
        }
    }
}

impl<P, S, R> fmt::Debug for Registration<P, S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("function_type_id", &self.invoker.function_type_id)
            .finish()
    }
}

impl<P, S, R> Registration<P, S, R>
where
    P: Persistable + Clone,
    S: Persistable + Default,
    R: Persistable,
{
    /// The registered function type.
    pub fn function_type_id(&self) -> &FunctionTypeId {
        &self.invoker.function_type_id
    }

    /// Create the instance and run it to completion in the calling task.
    ///
    /// When the instance already exists the call waits for the existing
    /// execution instead of running the body again.
    pub async fn invoke(
        &self,
        instance_id: impl Into<FunctionInstanceId>,
        param: P,
    ) -> Result<R> {
        self.invoker.invoke(instance_id.into(), param).await
    }

    /// Create the instance and run it on a background task.
    ///
    /// Returns once the instance is persisted. Errors from the background
    /// execution go to the unhandled error handler.
    pub async fn schedule(&self, instance_id: impl Into<FunctionInstanceId>, param: P) -> Result<()> {
        self.invoker.schedule(instance_id.into(), param).await
    }

    /// Resume an existing instance from its stored parameter and scrapbook.
    ///
    /// The stored status must be one of `expected_statuses`, and the stored
    /// epoch must equal `expected_epoch` when one is given.
    pub async fn re_invoke(
        &self,
        instance_id: impl Into<FunctionInstanceId>,
        expected_statuses: &[Status],
        expected_epoch: Option<Epoch>,
    ) -> Result<R> {
        self.invoker
            .re_invoke(instance_id.into(), expected_statuses, expected_epoch)
            .await
    }

    /// Like [`re_invoke`](Self::re_invoke), but the body runs on a background
    /// task. Precondition failures are still returned to the caller.
    pub async fn schedule_re_invoke(
        &self,
        instance_id: impl Into<FunctionInstanceId>,
        expected_statuses: &[Status],
        expected_epoch: Option<Epoch>,
    ) -> Result<()> {
        self.invoker
            .schedule_re_invoke(instance_id.into(), expected_statuses, expected_epoch)
            .await
    }
}
