// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable function runtime.
//!
//! [`FunctionRuntime`] owns the registry of function types, the shutdown
//! coordinator and the settings shared by every registration. Registering a
//! function type starts its crashed and postponed watchdogs.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rekindle_core::{FunctionRuntime, Settings, SqliteFunctionStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteFunctionStore::from_path(".data/functions.db").await?);
//!
//!     let runtime = FunctionRuntime::builder()
//!         .store(store)
//!         .settings(Settings::from_env()?)
//!         .on_unhandled_error(|e| eprintln!("{e}"))
//!         .build()?;
//!
//!     let greet = runtime.register_func("greet", |name: String| async move {
//!         Ok::<_, anyhow::Error>(format!("hello {name}"))
//!     })?;
//!     let greeting = greet.invoke("greeting-1", "world".to_string()).await?;
//!
//!     runtime.shutdown_gracefully(None).await?;
//!     Ok(())
//! }
//! ```

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Settings;
use crate::domain::{FunctionTypeId, IntoOutcome};
use crate::error::{Error, Result};
use crate::invocation::{FunctionBuilder, FunctionKind, Invoker, Persistable, Registration};
use crate::persistence::FunctionStore;
use crate::scrapbook::Scrapbook;
use crate::shutdown::ShutdownCoordinator;
use crate::unhandled::{UnhandledError, UnhandledErrorHandler};
use crate::watchdog;

/// Collaborators shared by every runner and watchdog of one runtime.
pub(crate) struct Context {
    pub(crate) store: Arc<dyn FunctionStore>,
    pub(crate) settings: Settings,
    pub(crate) shutdown: ShutdownCoordinator,
    pub(crate) unhandled: UnhandledErrorHandler,
}

/// Builder for creating a [`FunctionRuntime`].
#[derive(Default)]
pub struct FunctionRuntimeBuilder {
    store: Option<Arc<dyn FunctionStore>>,
    settings: Settings,
    unhandled: UnhandledErrorHandler,
}

impl std::fmt::Debug for FunctionRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("settings", &self.settings)
            .field("unhandled", &self.unhandled)
            .finish()
    }
}

impl FunctionRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the function store (required).
    pub fn store(mut self, store: Arc<dyn FunctionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set watchdog and invocation settings.
    ///
    /// Default: [`Settings::default`]
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Receive errors raised by background work.
    pub fn on_unhandled_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&UnhandledError) + Send + Sync + 'static,
    {
        self.unhandled = UnhandledErrorHandler::new(callback);
        self
    }

    /// Build the runtime.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> anyhow::Result<FunctionRuntime> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;

        Ok(FunctionRuntime::from_context(Context {
            store,
            settings: self.settings,
            shutdown: ShutdownCoordinator::new(),
            unhandled: self.unhandled,
        }))
    }
}

struct RegisteredFunction {
    registration: Arc<dyn Any + Send + Sync>,
    watchdogs: Vec<JoinHandle<()>>,
}

struct RuntimeInner {
    context: Arc<Context>,
    registry: DashMap<FunctionTypeId, RegisteredFunction>,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.context.shutdown.initiate();
        for registered in self.registry.iter() {
            for handle in &registered.watchdogs {
                handle.abort();
            }
        }
    }
}

/// Durable function runtime.
///
/// Cheap to clone; all clones share one registry. Dropping the last clone
/// initiates shutdown and stops the watchdogs. Call
/// [`shutdown_gracefully`](Self::shutdown_gracefully) to wait for in-flight
/// invocations first.
#[derive(Clone)]
pub struct FunctionRuntime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for FunctionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRuntime")
            .field("settings", &self.inner.context.settings)
            .field("registered", &self.inner.registry.len())
            .field("in_flight", &self.inner.context.shutdown.in_flight())
            .finish()
    }
}

impl FunctionRuntime {
    /// Runtime over `store` with default settings.
    pub fn new(store: Arc<dyn FunctionStore>) -> Self {
        Self::from_context(Context {
            store,
            settings: Settings::default(),
            shutdown: ShutdownCoordinator::new(),
            unhandled: UnhandledErrorHandler::default(),
        })
    }

    /// Create a new builder for configuring the runtime.
    pub fn builder() -> FunctionRuntimeBuilder {
        FunctionRuntimeBuilder::new()
    }

    fn from_context(context: Context) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                context: Arc::new(context),
                registry: DashMap::new(),
            }),
        }
    }

    /// The shared function store.
    pub fn store(&self) -> &Arc<dyn FunctionStore> {
        &self.inner.context.store
    }

    /// Active settings.
    pub fn settings(&self) -> &Settings {
        &self.inner.context.settings
    }

    /// True once shutdown has been initiated.
    pub fn is_shutdown_initiated(&self) -> bool {
        self.inner.context.shutdown.is_shutdown_initiated()
    }

    /// Refuse new work and wait for in-flight invocations to finish.
    ///
    /// Watchdogs stop scanning and in-process postponement waits end early.
    /// Fails with [`Error::ShutdownTimeout`] when `timeout` elapses first.
    pub async fn shutdown_gracefully(&self, timeout: Option<Duration>) -> Result<()> {
        info!(
            in_flight = self.inner.context.shutdown.in_flight(),
            "FunctionRuntime shutting down..."
        );
        self.inner.context.shutdown.shutdown_gracefully(timeout).await
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Start registering a function whose successful value is persisted.
    pub fn function<P, R, F, Fut, O>(
        &self,
        function_type_id: impl Into<FunctionTypeId>,
        body: F,
    ) -> FunctionBuilder<P, (), R>
    where
        P: Persistable + Clone,
        R: Persistable,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        O: IntoOutcome<Output = R> + 'static,
    {
        FunctionBuilder::new(
            self.clone(),
            function_type_id.into(),
            Arc::new(move |param: P, _scrapbook: Scrapbook<()>| {
                let fut = body(param);
                async move { fut.await.into_outcome() }.boxed()
            }),
            FunctionKind::FUNC,
        )
    }

    /// Start registering a function with a durable scrapbook.
    pub fn function_with_scrapbook<P, S, R, F, Fut, O>(
        &self,
        function_type_id: impl Into<FunctionTypeId>,
        body: F,
    ) -> FunctionBuilder<P, S, R>
    where
        P: Persistable + Clone,
        S: Persistable + Default,
        R: Persistable,
        F: Fn(P, Scrapbook<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        O: IntoOutcome<Output = R> + 'static,
    {
        FunctionBuilder::new(
            self.clone(),
            function_type_id.into(),
            Arc::new(move |param: P, scrapbook: Scrapbook<S>| {
                let fut = body(param, scrapbook);
                async move { fut.await.into_outcome() }.boxed()
            }),
            FunctionKind::FUNC_WITH_SCRAPBOOK,
        )
    }

    /// Start registering an action. Actions persist no result.
    pub fn action<P, F, Fut, O>(
        &self,
        function_type_id: impl Into<FunctionTypeId>,
        body: F,
    ) -> FunctionBuilder<P, (), ()>
    where
        P: Persistable + Clone,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        O: IntoOutcome<Output = ()> + 'static,
    {
        let mut builder = self.function(function_type_id, body);
        builder.kind = FunctionKind::ACTION;
        builder
    }

    /// Start registering an action with a durable scrapbook.
    pub fn action_with_scrapbook<P, S, F, Fut, O>(
        &self,
        function_type_id: impl Into<FunctionTypeId>,
        body: F,
    ) -> FunctionBuilder<P, S, ()>
    where
        P: Persistable + Clone,
        S: Persistable + Default,
        F: Fn(P, Scrapbook<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        O: IntoOutcome<Output = ()> + 'static,
    {
        let mut builder = self.function_with_scrapbook(function_type_id, body);
        builder.kind = FunctionKind::ACTION_WITH_SCRAPBOOK;
        builder
    }

    /// Register a function without hooks.
    pub fn register_func<P, R, F, Fut, O>(
        &self,
        function_type_id: impl Into<FunctionTypeId>,
        body: F,
    ) -> Result<Registration<P, (), R>>
    where
        P: Persistable + Clone,
        R: Persistable,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        O: IntoOutcome<Output = R> + 'static,
    {
        self.function(function_type_id, body).register()
    }

    /// Register a function with a scrapbook, without hooks.
    pub fn register_func_with_scrapbook<P, S, R, F, Fut, O>(
        &self,
        function_type_id: impl Into<FunctionTypeId>,
        body: F,
    ) -> Result<Registration<P, S, R>>
    where
        P: Persistable + Clone,
        S: Persistable + Default,
        R: Persistable,
        F: Fn(P, Scrapbook<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        O: IntoOutcome<Output = R> + 'static,
    {
        self.function_with_scrapbook(function_type_id, body)
            .register()
    }

    /// Register an action without hooks.
    pub fn register_action<P, F, Fut, O>(
        &self,
        function_type_id: impl Into<FunctionTypeId>,
        body: F,
    ) -> Result<Registration<P, (), ()>>
    where
        P: Persistable + Clone,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        O: IntoOutcome<Output = ()> + 'static,
    {
        self.action(function_type_id, body).register()
    }

    /// Register an action with a scrapbook, without hooks.
    pub fn register_action_with_scrapbook<P, S, F, Fut, O>(
        &self,
        function_type_id: impl Into<FunctionTypeId>,
        body: F,
    ) -> Result<Registration<P, S, ()>>
    where
        P: Persistable + Clone,
        S: Persistable + Default,
        F: Fn(P, Scrapbook<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        O: IntoOutcome<Output = ()> + 'static,
    {
        self.action_with_scrapbook(function_type_id, body)
            .register()
    }

    /// Install a runner and start its watchdogs, or return the existing one.
    pub(crate) fn register_invoker<P, S, R>(
        &self,
        build: impl FnOnce(Arc<Context>) -> Invoker<P, S, R>,
        function_type_id: FunctionTypeId,
    ) -> Result<Registration<P, S, R>>
    where
        P: Persistable + Clone,
        S: Persistable + Default,
        R: Persistable,
    {
        if self.is_shutdown_initiated() {
            return Err(Error::ShutdownInitiated);
        }

        match self.inner.registry.entry(function_type_id.clone()) {
            Entry::Occupied(existing) => existing
                .get()
                .registration
                .clone()
                .downcast::<Invoker<P, S, R>>()
                .map(|invoker| Registration { invoker })
                .map_err(|_| {
                    Error::framework(
                        &function_type_id,
                        "already registered with a different parameter, scrapbook or result type",
                    )
                }),
            Entry::Vacant(slot) => {
                let invoker = Arc::new(build(self.inner.context.clone()));
                let watchdogs = watchdog::start(self.inner.context.clone(), invoker.clone());
                slot.insert(RegisteredFunction {
                    registration: invoker.clone(),
                    watchdogs,
                });
                info!(function_type_id = %function_type_id, "Function registered");
                Ok(Registration { invoker })
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &Arc<Context> {
        &self.inner.context
    }
}
