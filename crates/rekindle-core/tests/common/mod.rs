// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for rekindle-core integration tests.
//!
//! Provides tracing setup, polling helpers, an unhandled error catcher, a
//! store wrapper that simulates a crashed process, and a gate for holding
//! function bodies mid-execution.

#![allow(dead_code)]

use std::future::Future;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use rekindle_core::{
    Epoch, Error, FunctionId, FunctionStore, FunctionTypeId, InMemoryFunctionStore, Result,
    Settings, SignOfLife, Status, StoredFailure, StoredFunction, StoredFunctionStatus,
    StoredParameter, StoredResult, UnhandledError,
};

/// Install a test subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rekindle_core=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Unique instance id for one test run.
pub fn unique_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// Settings with both watchdogs disabled.
pub fn quiet_settings() -> Settings {
    Settings::default()
        .with_crashed_check_frequency(Duration::ZERO)
        .with_postponed_check_frequency(Duration::ZERO)
        .with_completion_poll_interval(Duration::from_millis(10))
}

/// Settings with fast watchdogs for recovery tests.
pub fn fast_settings() -> Settings {
    Settings::default()
        .with_crashed_check_frequency(Duration::from_millis(20))
        .with_postponed_check_frequency(Duration::from_millis(10))
        .with_sign_of_life_frequency(Duration::from_millis(5))
        .with_completion_poll_interval(Duration::from_millis(10))
}

pub fn memory_store() -> Arc<dyn FunctionStore> {
    Arc::new(InMemoryFunctionStore::new())
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition().await
}

/// Poll the store until the function reaches `status`.
pub async fn wait_for_status(
    store: &Arc<dyn FunctionStore>,
    function_id: &FunctionId,
    status: Status,
    timeout: Duration,
) -> bool {
    wait_until(timeout, || {
        let store = store.clone();
        let function_id = function_id.clone();
        async move {
            matches!(
                store.get_function(&function_id).await,
                Ok(Some(stored)) if stored.status == status
            )
        }
    })
    .await
}

/// Persist a function row the way a crashed process would have left it.
pub async fn persist_executing<P: serde::Serialize>(
    store: &Arc<dyn FunctionStore>,
    function_id: &FunctionId,
    param: &P,
) {
    let param = StoredParameter::encode(param).unwrap();
    assert!(
        store
            .create_function(function_id, &param, None, Status::Executing, 0, 0)
            .await
            .unwrap()
    );
}

/// Persist a function row postponed until `until`.
pub async fn persist_postponed<P: serde::Serialize>(
    store: &Arc<dyn FunctionStore>,
    function_id: &FunctionId,
    param: &P,
    until: DateTime<Utc>,
) {
    persist_executing(store, function_id, param).await;
    assert!(
        store
            .set_function_state(function_id, Status::Postponed, None, None, None, Some(until), 0)
            .await
            .unwrap()
    );
}

/// Collects errors delivered to the unhandled error handler.
#[derive(Clone, Default)]
pub struct UnhandledErrorCatcher {
    errors: Arc<Mutex<Vec<UnhandledError>>>,
}

impl UnhandledErrorCatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback to pass to `FunctionRuntimeBuilder::on_unhandled_error`.
    pub fn callback(&self) -> impl Fn(&UnhandledError) + Send + Sync + 'static {
        let errors = self.errors.clone();
        move |e: &UnhandledError| errors.lock().unwrap().push(e.clone())
    }

    pub fn errors(&self) -> Vec<UnhandledError> {
        self.errors.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().unwrap().is_empty()
    }
}

/// Opens once and stays open.
#[derive(Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Store wrapper whose every call fails once [`crash`](Self::crash) is called.
///
/// A runtime built on it behaves like a process that lost its database
/// connection for good: nothing it does afterwards reaches the store.
pub struct CrashableStore {
    inner: Arc<dyn FunctionStore>,
    crashed: AtomicBool,
}

impl CrashableStore {
    pub fn new(inner: Arc<dyn FunctionStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            crashed: AtomicBool::new(false),
        })
    }

    pub fn crash(&self) {
        self.crashed.store(true, Ordering::SeqCst);
    }

    fn check(&self, operation: &str) -> Result<()> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(Error::Storage {
                operation: operation.to_string(),
                details: "simulated crash".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl FunctionStore for CrashableStore {
    async fn create_function(
        &self,
        function_id: &FunctionId,
        param: &StoredParameter,
        scrapbook_type: Option<&str>,
        initial_status: Status,
        initial_epoch: Epoch,
        initial_sign_of_life: SignOfLife,
    ) -> Result<bool> {
        self.check("create_function")?;
        self.inner
            .create_function(
                function_id,
                param,
                scrapbook_type,
                initial_status,
                initial_epoch,
                initial_sign_of_life,
            )
            .await
    }

    async fn try_to_become_leader(
        &self,
        function_id: &FunctionId,
        new_status: Status,
        expected_epoch: Epoch,
        new_epoch: Epoch,
    ) -> Result<bool> {
        self.check("try_to_become_leader")?;
        self.inner
            .try_to_become_leader(function_id, new_status, expected_epoch, new_epoch)
            .await
    }

    async fn update_sign_of_life(
        &self,
        function_id: &FunctionId,
        expected_epoch: Epoch,
        new_sign_of_life: SignOfLife,
    ) -> Result<bool> {
        self.check("update_sign_of_life")?;
        self.inner
            .update_sign_of_life(function_id, expected_epoch, new_sign_of_life)
            .await
    }

    async fn set_function_state(
        &self,
        function_id: &FunctionId,
        status: Status,
        scrapbook_json: Option<&str>,
        result: Option<&StoredResult>,
        failure: Option<&StoredFailure>,
        postponed_until: Option<DateTime<Utc>>,
        expected_epoch: Epoch,
    ) -> Result<bool> {
        self.check("set_function_state")?;
        self.inner
            .set_function_state(
                function_id,
                status,
                scrapbook_json,
                result,
                failure,
                postponed_until,
                expected_epoch,
            )
            .await
    }

    async fn set_scrapbook(
        &self,
        function_id: &FunctionId,
        scrapbook_json: &str,
        expected_epoch: Epoch,
    ) -> Result<bool> {
        self.check("set_scrapbook")?;
        self.inner
            .set_scrapbook(function_id, scrapbook_json, expected_epoch)
            .await
    }

    async fn get_function(&self, function_id: &FunctionId) -> Result<Option<StoredFunction>> {
        self.check("get_function")?;
        self.inner.get_function(function_id).await
    }

    async fn get_functions_with_status(
        &self,
        function_type_id: &FunctionTypeId,
        status: Status,
        expires_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredFunctionStatus>> {
        self.check("get_functions_with_status")?;
        self.inner
            .get_functions_with_status(function_type_id, status, expires_before)
            .await
    }
}

/// Store wrapper that loses a row right after someone becomes its leader.
///
/// Simulates a store that breaks its contract: the leader CAS succeeds, then
/// `get_function` no longer finds the row.
pub struct VanishingStore {
    inner: Arc<dyn FunctionStore>,
    vanished: Mutex<HashSet<FunctionId>>,
}

impl VanishingStore {
    pub fn new(inner: Arc<dyn FunctionStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            vanished: Mutex::new(HashSet::new()),
        })
    }
}

#[async_trait]
impl FunctionStore for VanishingStore {
    async fn create_function(
        &self,
        function_id: &FunctionId,
        param: &StoredParameter,
        scrapbook_type: Option<&str>,
        initial_status: Status,
        initial_epoch: Epoch,
        initial_sign_of_life: SignOfLife,
    ) -> Result<bool> {
        self.inner
            .create_function(
                function_id,
                param,
                scrapbook_type,
                initial_status,
                initial_epoch,
                initial_sign_of_life,
            )
            .await
    }

    async fn try_to_become_leader(
        &self,
        function_id: &FunctionId,
        new_status: Status,
        expected_epoch: Epoch,
        new_epoch: Epoch,
    ) -> Result<bool> {
        let became_leader = self
            .inner
            .try_to_become_leader(function_id, new_status, expected_epoch, new_epoch)
            .await?;
        if became_leader {
            self.vanished.lock().unwrap().insert(function_id.clone());
        }
        Ok(became_leader)
    }

    async fn update_sign_of_life(
        &self,
        function_id: &FunctionId,
        expected_epoch: Epoch,
        new_sign_of_life: SignOfLife,
    ) -> Result<bool> {
        self.inner
            .update_sign_of_life(function_id, expected_epoch, new_sign_of_life)
            .await
    }

    async fn set_function_state(
        &self,
        function_id: &FunctionId,
        status: Status,
        scrapbook_json: Option<&str>,
        result: Option<&StoredResult>,
        failure: Option<&StoredFailure>,
        postponed_until: Option<DateTime<Utc>>,
        expected_epoch: Epoch,
    ) -> Result<bool> {
        self.inner
            .set_function_state(
                function_id,
                status,
                scrapbook_json,
                result,
                failure,
                postponed_until,
                expected_epoch,
            )
            .await
    }

    async fn set_scrapbook(
        &self,
        function_id: &FunctionId,
        scrapbook_json: &str,
        expected_epoch: Epoch,
    ) -> Result<bool> {
        self.inner
            .set_scrapbook(function_id, scrapbook_json, expected_epoch)
            .await
    }

    async fn get_function(&self, function_id: &FunctionId) -> Result<Option<StoredFunction>> {
        if self.vanished.lock().unwrap().contains(function_id) {
            return Ok(None);
        }
        self.inner.get_function(function_id).await
    }

    async fn get_functions_with_status(
        &self,
        function_type_id: &FunctionTypeId,
        status: Status,
        expires_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredFunctionStatus>> {
        let vanished = self.vanished.lock().unwrap().clone();
        let rows = self
            .inner
            .get_functions_with_status(function_type_id, status, expires_before)
            .await?;
        Ok(rows
            .into_iter()
            .filter(|row| {
                !vanished.contains(&FunctionId::new(function_type_id.clone(), row.instance_id.clone()))
            })
            .collect())
    }
}
