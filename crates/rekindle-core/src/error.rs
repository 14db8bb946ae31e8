// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for rekindle-core.
//!
//! A single error enum covers framework failures, lost epoch races and the
//! expected control signals (postponed, previous invocation failed) that a
//! synchronous caller observes.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::{FunctionId, FunctionTypeId, StoredFailure};

/// Result type using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the function runtime and its stores.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The stored function was not in the state the operation required, or an
    /// epoch-fenced write lost the race against another leader.
    #[error("function '{function_id}' is in an unexpected state: {reason}")]
    UnexpectedFunctionState {
        /// The function whose state did not match.
        function_id: FunctionId,
        /// Human readable explanation.
        reason: String,
    },

    /// The store contract was violated or the runtime was misused.
    #[error("framework error for function type '{function_type_id}': {reason}")]
    Framework {
        /// The function type involved.
        function_type_id: FunctionTypeId,
        /// Human readable explanation.
        reason: String,
    },

    /// The function body failed during this invocation.
    #[error("function '{function_id}' failed: {failure}")]
    FunctionFailed {
        /// The failed function.
        function_id: FunctionId,
        /// The recorded failure.
        failure: StoredFailure,
    },

    /// The function had already failed before this call observed it.
    #[error("previous invocation of function '{function_id}' failed: {failure}")]
    PreviousInvocationFailed {
        /// The failed function.
        function_id: FunctionId,
        /// The recorded failure.
        failure: StoredFailure,
    },

    /// The function was postponed and will be resumed later.
    #[error("function '{function_id}' has been postponed until {until}")]
    Postponed {
        /// The postponed function.
        function_id: FunctionId,
        /// When the function becomes due again.
        until: DateTime<Utc>,
    },

    /// The runtime is shutting down and refuses new work.
    #[error("function runtime is shutting down")]
    ShutdownInitiated,

    /// Graceful shutdown did not drain in time.
    #[error("graceful shutdown did not complete within {timeout:?}")]
    ShutdownTimeout {
        /// The deadline supplied by the caller.
        timeout: Duration,
    },

    /// A scrapbook was saved before being bound to a running invocation.
    #[error("'{type_name}' scrapbook was uninitialized on save")]
    ScrapbookUninitialized {
        /// Type name of the scrapbook.
        type_name: String,
    },

    /// Encoding or decoding a parameter, scrapbook or result failed.
    #[error("serialization failed: {details}")]
    Serialization {
        /// Error details.
        details: String,
    },

    /// A store operation failed.
    #[error("storage operation '{operation}' failed: {details}")]
    Storage {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl Error {
    /// Get the error code string for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::UnexpectedFunctionState { .. } => "UNEXPECTED_FUNCTION_STATE",
            Error::Framework { .. } => "FRAMEWORK_ERROR",
            Error::FunctionFailed { .. } => "FUNCTION_FAILED",
            Error::PreviousInvocationFailed { .. } => "PREVIOUS_INVOCATION_FAILED",
            Error::Postponed { .. } => "FUNCTION_POSTPONED",
            Error::ShutdownInitiated => "SHUTDOWN_INITIATED",
            Error::ShutdownTimeout { .. } => "SHUTDOWN_TIMEOUT",
            Error::ScrapbookUninitialized { .. } => "SCRAPBOOK_UNINITIALIZED",
            Error::Serialization { .. } => "SERIALIZATION_ERROR",
            Error::Storage { .. } => "STORAGE_ERROR",
        }
    }

    /// True when another leader won the epoch race or a status precondition failed.
    pub fn is_unexpected_function_state(&self) -> bool {
        matches!(self, Error::UnexpectedFunctionState { .. })
    }

    /// True for the postponed signal.
    pub fn is_postponed(&self) -> bool {
        matches!(self, Error::Postponed { .. })
    }

    /// True when the runtime refused or abandoned work because of shutdown.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::ShutdownInitiated)
    }

    pub(crate) fn unexpected_state(function_id: &FunctionId, reason: impl Into<String>) -> Self {
        Error::UnexpectedFunctionState {
            function_id: function_id.clone(),
            reason: reason.into(),
        }
    }

    pub(crate) fn framework(function_type_id: &FunctionTypeId, reason: impl Into<String>) -> Self {
        Error::Framework {
            function_type_id: function_type_id.clone(),
            reason: reason.into(),
        }
    }

    pub(crate) fn storage(operation: &str, details: impl std::fmt::Display) -> Self {
        Error::Storage {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization {
            details: err.to_string(),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::storage("query", err)
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::storage("migrate", err)
    }
}
