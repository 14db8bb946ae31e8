// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory function store.
//!
//! Each compare-and-swap runs under the shard lock of its key, which gives
//! the same atomicity a database adapter gets from a single fenced UPDATE.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::FunctionStore;
use crate::domain::{
    Epoch, FunctionId, FunctionTypeId, SignOfLife, Status, StoredFailure, StoredFunction,
    StoredFunctionStatus, StoredParameter, StoredResult, StoredScrapbook,
};
use crate::error::Result;

/// Function store backed by a concurrent hash map. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct InMemoryFunctionStore {
    functions: DashMap<FunctionId, StoredFunction>,
}

impl InMemoryFunctionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `update` to the row if its epoch matches.
    fn fenced<F>(&self, function_id: &FunctionId, expected_epoch: Epoch, update: F) -> bool
    where
        F: FnOnce(&mut StoredFunction),
    {
        match self.functions.get_mut(function_id) {
            Some(mut stored) if stored.epoch == expected_epoch => {
                update(&mut *stored);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl FunctionStore for InMemoryFunctionStore {
    async fn create_function(
        &self,
        function_id: &FunctionId,
        param: &StoredParameter,
        scrapbook_type: Option<&str>,
        initial_status: Status,
        initial_epoch: Epoch,
        initial_sign_of_life: SignOfLife,
    ) -> Result<bool> {
        match self.functions.entry(function_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(StoredFunction {
                    function_id: function_id.clone(),
                    parameter: param.clone(),
                    scrapbook: scrapbook_type.map(|type_name| StoredScrapbook {
                        json: None,
                        type_name: type_name.to_string(),
                    }),
                    status: initial_status,
                    result: None,
                    failure: None,
                    postponed_until: None,
                    epoch: initial_epoch,
                    sign_of_life: initial_sign_of_life,
                });
                Ok(true)
            }
        }
    }

    async fn try_to_become_leader(
        &self,
        function_id: &FunctionId,
        new_status: Status,
        expected_epoch: Epoch,
        new_epoch: Epoch,
    ) -> Result<bool> {
        Ok(self.fenced(function_id, expected_epoch, |stored| {
            stored.status = new_status;
            stored.epoch = new_epoch;
        }))
    }

    async fn update_sign_of_life(
        &self,
        function_id: &FunctionId,
        expected_epoch: Epoch,
        new_sign_of_life: SignOfLife,
    ) -> Result<bool> {
        Ok(self.fenced(function_id, expected_epoch, |stored| {
            stored.sign_of_life = new_sign_of_life;
        }))
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
        Ok(self.fenced(function_id, expected_epoch, |stored| {
            stored.status = status;
            if let (Some(json), Some(scrapbook)) = (scrapbook_json, stored.scrapbook.as_mut()) {
                scrapbook.json = Some(json.to_string());
            }
            stored.result = result.cloned();
            stored.failure = failure.cloned();
            stored.postponed_until = postponed_until;
        }))
    }

    async fn set_scrapbook(
        &self,
        function_id: &FunctionId,
        scrapbook_json: &str,
        expected_epoch: Epoch,
    ) -> Result<bool> {
        Ok(self.fenced(function_id, expected_epoch, |stored| {
            if let Some(scrapbook) = stored.scrapbook.as_mut() {
                scrapbook.json = Some(scrapbook_json.to_string());
            }
        }))
    }

    async fn get_function(&self, function_id: &FunctionId) -> Result<Option<StoredFunction>> {
        Ok(self.functions.get(function_id).map(|stored| stored.value().clone()))
    }

    async fn get_functions_with_status(
        &self,
        function_type_id: &FunctionTypeId,
        status: Status,
        expires_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredFunctionStatus>> {
        let mut matching: Vec<StoredFunctionStatus> = self
            .functions
            .iter()
            .filter(|stored| {
                stored.function_id.type_id == *function_type_id && stored.status == status
            })
            .filter(|stored| match expires_before {
                Some(limit) => stored.postponed_until.is_some_and(|due| due < limit),
                None => true,
            })
            .map(|stored| StoredFunctionStatus {
                instance_id: stored.function_id.instance_id.clone(),
                epoch: stored.epoch,
                sign_of_life: stored.sign_of_life,
                status: stored.status,
                postponed_until: stored.postponed_until,
            })
            .collect();

        matching.sort_by(|a, b| {
            a.postponed_until
                .cmp(&b.postponed_until)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        Ok(matching)
    }
}
