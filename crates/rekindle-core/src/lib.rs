// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rekindle Core - Durable Function Execution Engine
//!
//! This crate runs idempotent units of work ("functions") keyed by a type and
//! an instance id with at-least-once semantics. Invocation state lives in a
//! pluggable [`FunctionStore`]; crashes, restarts and postponements never lose
//! or duplicate the logical invocation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Application                                  │
//! │        Registration::{invoke, schedule, re_invoke, schedule_re_invoke}  │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          FunctionRuntime                                │
//! │     registry ─ one runner + crashed watchdog + postponed watchdog       │
//! │     per function type, shutdown coordinator, unhandled error sink       │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                         │                          │
//!           │ execution loop          │ sign of life             │ scans
//!           ▼                         ▼                          ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 FunctionStore (epoch-fenced writes)                     │
//! │               InMemoryFunctionStore │ SqliteFunctionStore               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The store is the only synchronization point between processes. Every
//! attempt to run a function owns an epoch; writes carry the epoch they
//! expect and are rejected once another process became leader with a newer
//! one.
//!
//! # Function Status State Machine
//!
//! ```text
//!                    create (epoch 0)
//!                          │
//!                          ▼
//!                    ┌───────────┐  crashed watchdog: epoch + 1
//!          ┌────────►│ EXECUTING │◄─────────────────┐
//!          │         └─────┬─────┘                  │
//!          │   succeed     │ fail       postpone    │
//!          │     ┌─────────┼──────────┐             │
//!          │     ▼         ▼          ▼             │
//!          │ ┌─────────┐ ┌────────┐ ┌───────────┐   │
//!          │ │SUCCEEDED│ │ FAILED │ │ POSTPONED │───┘ due: postponed watchdog
//!          │ └─────────┘ └───┬────┘ └───────────┘
//!          │                 │
//!          └─────────────────┘ re_invoke: epoch + 1
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rekindle_core::{FunctionRuntime, InMemoryFunctionStore, Outcome};
//!
//! let runtime = FunctionRuntime::new(Arc::new(InMemoryFunctionStore::new()));
//! let ship = runtime.register_func("ship-order", |order_id: u64| async move {
//!     if !warehouse_open().await {
//!         return Outcome::postpone_for(Duration::from_secs(3600));
//!     }
//!     Outcome::succeed(format!("order {order_id} shipped"))
//! })?;
//!
//! let receipt = ship.invoke("order-17", 17).await?;
//! ```
//!
//! # Configuration
//!
//! [`Settings::from_env`] reads the following variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `REKINDLE_CRASHED_CHECK_FREQUENCY_MS` | `10000` | Crashed watchdog interval, `0` disables |
//! | `REKINDLE_POSTPONED_CHECK_FREQUENCY_MS` | `10000` | Postponed watchdog interval, `0` disables |
//! | `REKINDLE_SIGN_OF_LIFE_FREQUENCY_MS` | half the crashed interval | Heartbeat interval, `0` disables |
//! | `REKINDLE_DELAY_STARTUP_MS` | `0` | Delay before the first postponed scan |
//! | `REKINDLE_IN_PROCESS_WAIT_THRESHOLD_MS` | `10000` | Longest postponement waited for in process |
//! | `REKINDLE_COMPLETION_POLL_INTERVAL_MS` | `100` | Poll interval of duplicate invocations |
//!
//! # Modules
//!
//! - [`config`]: Settings with environment loading
//! - [`domain`]: Identifiers, statuses, stored records and outcomes
//! - [`error`]: Error types with error code mapping
//! - [`invocation`]: Registrations and the execution loop
//! - [`persistence`]: Storage contract and bundled stores
//! - [`runtime`]: The embeddable runtime
//! - [`scrapbook`]: Durable scratch state
//! - [`shutdown`]: In-flight tracking and graceful drain
//! - [`unhandled`]: Sink for errors raised by background work

#![deny(missing_docs)]

mod clock;

/// Runtime settings loaded from code or environment variables.
pub mod config;

/// Function identifiers, statuses, stored records and outcomes.
pub mod domain;

/// Error types with error code mapping.
pub mod error;

/// Registrations, hooks and the shared execution loop.
pub mod invocation;

/// Embedded database migrations.
#[cfg(feature = "sqlite")]
pub mod migrations;

/// Storage contract and the bundled in-memory and SQLite stores.
pub mod persistence;

/// Embeddable function runtime.
pub mod runtime;

/// Durable scratch state of one invocation.
pub mod scrapbook;

/// Shutdown coordination and in-flight tracking.
pub mod shutdown;

mod sign_of_life;

/// Reporting of errors raised by background work.
pub mod unhandled;

mod watchdog;

pub use config::{ConfigError, Settings};
pub use domain::{
    Epoch, FunctionId, FunctionInstanceId, FunctionTypeId, IntoOutcome, Metadata, Outcome,
    SignOfLife, Status, StoredFailure, StoredFunction, StoredFunctionStatus, StoredParameter,
    StoredResult, StoredScrapbook,
};
pub use error::{Error, Result};
pub use invocation::{FunctionBuilder, Persistable, Registration};
pub use persistence::{FunctionStore, InMemoryFunctionStore};
#[cfg(feature = "sqlite")]
pub use persistence::SqliteFunctionStore;
pub use runtime::{FunctionRuntime, FunctionRuntimeBuilder};
pub use scrapbook::Scrapbook;
pub use shutdown::{RunningGuard, ShutdownCoordinator};
pub use unhandled::{UnhandledError, UnhandledErrorHandler};
