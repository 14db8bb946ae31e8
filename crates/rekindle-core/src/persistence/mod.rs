// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage contract for stored functions.
//!
//! The store is the only synchronization point between processes. Every
//! state-changing operation except creation is fenced by an expected epoch
//! and must be atomic: implementations return `Ok(false)` instead of writing
//! when the stored epoch differs.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    Epoch, FunctionId, FunctionTypeId, SignOfLife, Status, StoredFailure, StoredFunction,
    StoredFunctionStatus, StoredParameter, StoredResult,
};
use crate::error::Result;

pub use memory::InMemoryFunctionStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteFunctionStore;

/// Persistence backend for stored functions.
#[async_trait]
pub trait FunctionStore: Send + Sync {
    /// Insert a new function row. Returns `false` if the id already exists.
    async fn create_function(
        &self,
        function_id: &FunctionId,
        param: &StoredParameter,
        scrapbook_type: Option<&str>,
        initial_status: Status,
        initial_epoch: Epoch,
        initial_sign_of_life: SignOfLife,
    ) -> Result<bool>;

    /// Set `new_status` and `new_epoch` if the stored epoch equals `expected_epoch`.
    async fn try_to_become_leader(
        &self,
        function_id: &FunctionId,
        new_status: Status,
        expected_epoch: Epoch,
        new_epoch: Epoch,
    ) -> Result<bool>;

    /// Store a new heartbeat value if the stored epoch equals `expected_epoch`.
    async fn update_sign_of_life(
        &self,
        function_id: &FunctionId,
        expected_epoch: Epoch,
        new_sign_of_life: SignOfLife,
    ) -> Result<bool>;

    /// Persist the outcome of an execution if the stored epoch equals `expected_epoch`.
    ///
    /// `result`, `failure` and `postponed_until` overwrite the stored values
    /// (clearing them when `None`). A `None` scrapbook leaves the stored one untouched.
    #[allow(clippy::too_many_arguments)]
    async fn set_function_state(
        &self,
        function_id: &FunctionId,
        status: Status,
        scrapbook_json: Option<&str>,
        result: Option<&StoredResult>,
        failure: Option<&StoredFailure>,
        postponed_until: Option<DateTime<Utc>>,
        expected_epoch: Epoch,
    ) -> Result<bool>;

    /// Persist scrapbook state if the stored epoch equals `expected_epoch`.
    async fn set_scrapbook(
        &self,
        function_id: &FunctionId,
        scrapbook_json: &str,
        expected_epoch: Epoch,
    ) -> Result<bool>;

    /// Fetch a function row.
    async fn get_function(&self, function_id: &FunctionId) -> Result<Option<StoredFunction>>;

    /// List functions of one type in `status`.
    ///
    /// When `expires_before` is given only rows with a due time strictly
    /// before it are returned.
    async fn get_functions_with_status(
        &self,
        function_type_id: &FunctionTypeId,
        status: Status,
        expires_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredFunctionStatus>>;
}
