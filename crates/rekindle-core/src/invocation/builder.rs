// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registration builder with invoke hooks.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;

use super::{Body, FunctionKind, Invoker, Persistable, PostInvoke, PreInvoke, Registration};
use crate::domain::{FunctionTypeId, Metadata, Outcome};
use crate::error::Result;
use crate::runtime::FunctionRuntime;
use crate::scrapbook::Scrapbook;

/// Builder returned by [`FunctionRuntime::function`] and its siblings.
///
/// ```rust,ignore
/// let registration = runtime
///     .function("charge", |order: Order| async move { charge(order).await })
///     .pre_invoke(|_scrapbook, metadata| async move {
///         tracing::info!(function_id = %metadata.function_id, "charging");
///         Ok(())
///     })
///     .post_invoke(|outcome, _scrapbook, _metadata| async move {
///         match outcome {
///             Outcome::Fail(_) => Outcome::postpone_for(Duration::from_secs(30)),
///             other => other,
///         }
///     })
///     .register()?;
/// ```
pub struct FunctionBuilder<P, S, R> {
    runtime: FunctionRuntime,
    function_type_id: FunctionTypeId,
    body: Body<P, S, R>,
    pre_invoke: Option<PreInvoke<P, S>>,
    post_invoke: Option<PostInvoke<P, S, R>>,
    pub(crate) kind: FunctionKind,
}

impl<P, S, R> fmt::Debug for FunctionBuilder<P, S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionBuilder")
            .field("function_type_id", &self.function_type_id)
            .field("pre_invoke", &self.pre_invoke.as_ref().map(|_| "..."))
            .field("post_invoke", &self.post_invoke.as_ref().map(|_| "..."))
            .field("kind", &self.kind)
            .finish()
    }
}

impl<P, S, R> FunctionBuilder<P, S, R>
where
    P: Persistable + Clone,
    S: Persistable + Default,
    R: Persistable,
{
    pub(crate) fn new(
        runtime: FunctionRuntime,
        function_type_id: FunctionTypeId,
        body: Body<P, S, R>,
        kind: FunctionKind,
    ) -> Self {
        Self {
            runtime,
            function_type_id,
            body,
            pre_invoke: None,
            post_invoke: None,
            kind,
        }
    }

    /// Run `hook` before every execution of the body. An error fails the invocation.
    pub fn pre_invoke<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Scrapbook<S>, Metadata<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.pre_invoke = Some(Arc::new(move |scrapbook, metadata| {
            hook(scrapbook, metadata).boxed()
        }));
        self
    }

    /// Map the outcome of every execution before it is persisted.
    pub fn post_invoke<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Outcome<R>, Scrapbook<S>, Metadata<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<R>> + Send + 'static,
    {
        self.post_invoke = Some(Arc::new(move |outcome, scrapbook, metadata| {
            hook(outcome, scrapbook, metadata).boxed()
        }));
        self
    }

    /// Register the function type and start its watchdogs.
    pub fn register(self) -> Result<Registration<P, S, R>> {
        let Self {
            runtime,
            function_type_id,
            body,
            pre_invoke,
            post_invoke,
            kind,
        } = self;

        let type_id = function_type_id.clone();
        runtime.register_invoker(
            move |context| Invoker {
                function_type_id,
                body,
                pre_invoke,
                post_invoke,
                kind,
                context,
            },
            type_id,
        )
    }
}
