// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for rekindle-core.
//!
//! Products that manage their own pool can apply the schema before handing
//! the pool to [`SqliteFunctionStore::new`](crate::persistence::SqliteFunctionStore::new).
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use rekindle_core::migrations;
//!
//! let pool = SqlitePool::connect("sqlite:functions.db?mode=rwc").await?;
//! migrations::run_sqlite(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with the function store schema embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
