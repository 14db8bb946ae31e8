// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed function store.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::FunctionStore;
use crate::domain::{
    Epoch, FunctionId, FunctionInstanceId, FunctionTypeId, SignOfLife, Status, StoredFailure,
    StoredFunction, StoredFunctionStatus, StoredParameter, StoredResult, StoredScrapbook,
};
use crate::error::{Error, Result};
use crate::migrations::SQLITE as MIGRATOR;

/// SQLite-backed function store.
///
/// Every fenced operation is a single `UPDATE ... WHERE epoch = ?`, so the
/// compare-and-swap is atomic at the database level and safe to share
/// between processes pointing at the same file.
#[derive(Clone)]
pub struct SqliteFunctionStore {
    pool: SqlitePool,
}

impl SqliteFunctionStore {
    /// Create a store from an existing pool. The schema must already be migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Runs all migrations
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = SqliteFunctionStore::from_path(".data/functions.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::storage(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| {
                Error::storage(
                    "connect",
                    format!("Failed to connect to SQLite at {:?}: {}", path, e),
                )
            })?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct FunctionRow {
    function_type_id: String,
    function_instance_id: String,
    param_json: String,
    param_type: String,
    scrapbook_json: Option<String>,
    scrapbook_type: Option<String>,
    status: String,
    result_json: Option<String>,
    result_type: Option<String>,
    failure_json: Option<String>,
    postponed_until: Option<i64>,
    epoch: i64,
    sign_of_life: i64,
}

#[derive(sqlx::FromRow)]
struct StatusRow {
    function_instance_id: String,
    epoch: i64,
    sign_of_life: i64,
    status: String,
    postponed_until: Option<i64>,
}

fn from_millis(millis: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    millis
        .map(|ms| {
            DateTime::<Utc>::from_timestamp_millis(ms)
                .ok_or_else(|| Error::storage("decode_timestamp", format!("out of range: {ms}")))
        })
        .transpose()
}

impl TryFrom<FunctionRow> for StoredFunction {
    type Error = Error;

    fn try_from(row: FunctionRow) -> Result<Self> {
        let result = match (row.result_json, row.result_type) {
            (Some(json), Some(type_name)) => Some(StoredResult { json, type_name }),
            _ => None,
        };
        let failure = row
            .failure_json
            .map(|json| serde_json::from_str::<StoredFailure>(&json))
            .transpose()?;

        Ok(StoredFunction {
            function_id: FunctionId::new(row.function_type_id, row.function_instance_id),
            parameter: StoredParameter {
                json: row.param_json,
                type_name: row.param_type,
            },
            scrapbook: row.scrapbook_type.map(|type_name| StoredScrapbook {
                json: row.scrapbook_json,
                type_name,
            }),
            status: row.status.parse()?,
            result,
            failure,
            postponed_until: from_millis(row.postponed_until)?,
            epoch: row.epoch,
            sign_of_life: row.sign_of_life,
        })
    }
}

#[async_trait]
impl FunctionStore for SqliteFunctionStore {
    async fn create_function(
        &self,
        function_id: &FunctionId,
        param: &StoredParameter,
        scrapbook_type: Option<&str>,
        initial_status: Status,
        initial_epoch: Epoch,
        initial_sign_of_life: SignOfLife,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO functions (
                function_type_id, function_instance_id, param_json, param_type,
                scrapbook_type, status, epoch, sign_of_life
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (function_type_id, function_instance_id) DO NOTHING
            "#,
        )
        .bind(function_id.type_id.as_str())
        .bind(function_id.instance_id.as_str())
        .bind(&param.json)
        .bind(&param.type_name)
        .bind(scrapbook_type)
        .bind(initial_status.as_str())
        .bind(initial_epoch)
        .bind(initial_sign_of_life)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn try_to_become_leader(
        &self,
        function_id: &FunctionId,
        new_status: Status,
        expected_epoch: Epoch,
        new_epoch: Epoch,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE functions
            SET status = ?, epoch = ?
            WHERE function_type_id = ? AND function_instance_id = ? AND epoch = ?
            "#,
        )
        .bind(new_status.as_str())
        .bind(new_epoch)
        .bind(function_id.type_id.as_str())
        .bind(function_id.instance_id.as_str())
        .bind(expected_epoch)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_sign_of_life(
        &self,
        function_id: &FunctionId,
        expected_epoch: Epoch,
        new_sign_of_life: SignOfLife,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE functions
            SET sign_of_life = ?
            WHERE function_type_id = ? AND function_instance_id = ? AND epoch = ?
            "#,
        )
        .bind(new_sign_of_life)
        .bind(function_id.type_id.as_str())
        .bind(function_id.instance_id.as_str())
        .bind(expected_epoch)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
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
        let failure_json = failure.map(serde_json::to_string).transpose()?;

        let outcome = sqlx::query(
            r#"
            UPDATE functions
            SET status = ?,
                scrapbook_json = COALESCE(?, scrapbook_json),
                result_json = ?,
                result_type = ?,
                failure_json = ?,
                postponed_until = ?
            WHERE function_type_id = ? AND function_instance_id = ? AND epoch = ?
            "#,
        )
        .bind(status.as_str())
        .bind(scrapbook_json)
        .bind(result.map(|r| r.json.as_str()))
        .bind(result.map(|r| r.type_name.as_str()))
        .bind(failure_json)
        .bind(postponed_until.map(|t| t.timestamp_millis()))
        .bind(function_id.type_id.as_str())
        .bind(function_id.instance_id.as_str())
        .bind(expected_epoch)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() == 1)
    }

    async fn set_scrapbook(
        &self,
        function_id: &FunctionId,
        scrapbook_json: &str,
        expected_epoch: Epoch,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE functions
            SET scrapbook_json = ?
            WHERE function_type_id = ? AND function_instance_id = ? AND epoch = ?
            "#,
        )
        .bind(scrapbook_json)
        .bind(function_id.type_id.as_str())
        .bind(function_id.instance_id.as_str())
        .bind(expected_epoch)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_function(&self, function_id: &FunctionId) -> Result<Option<StoredFunction>> {
        let row = sqlx::query_as::<_, FunctionRow>(
            r#"
            SELECT function_type_id, function_instance_id, param_json, param_type,
                   scrapbook_json, scrapbook_type, status, result_json, result_type,
                   failure_json, postponed_until, epoch, sign_of_life
            FROM functions
            WHERE function_type_id = ? AND function_instance_id = ?
            "#,
        )
        .bind(function_id.type_id.as_str())
        .bind(function_id.instance_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredFunction::try_from).transpose()
    }

    async fn get_functions_with_status(
        &self,
        function_type_id: &FunctionTypeId,
        status: Status,
        expires_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredFunctionStatus>> {
        let expires_before = expires_before.map(|t| t.timestamp_millis());

        let rows = sqlx::query_as::<_, StatusRow>(
            r#"
            SELECT function_instance_id, epoch, sign_of_life, status, postponed_until
            FROM functions
            WHERE function_type_id = ?
              AND status = ?
              AND (? IS NULL OR postponed_until < ?)
            ORDER BY postponed_until, function_instance_id
            "#,
        )
        .bind(function_type_id.as_str())
        .bind(status.as_str())
        .bind(expires_before)
        .bind(expires_before)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(StoredFunctionStatus {
                    instance_id: FunctionInstanceId::new(row.function_instance_id),
                    epoch: row.epoch,
                    sign_of_life: row.sign_of_life,
                    status: row.status.parse()?,
                    postponed_until: from_millis(row.postponed_until)?,
                })
            })
            .collect()
    }
}
