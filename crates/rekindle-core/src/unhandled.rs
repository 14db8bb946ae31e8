// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sink for errors no caller can observe.
//!
//! Background work (scheduled invocations, watchdog recoveries, heartbeat
//! writers) has nobody to return an error to. Such errors are logged and
//! forwarded to an optional user callback, tagged with the function involved.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::error;

use crate::domain::{FunctionInstanceId, FunctionTypeId};
use crate::error::Error;

/// An error raised by background work.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}: {error}")]
pub struct UnhandledError {
    /// Function type the failing work belonged to.
    pub function_type_id: FunctionTypeId,
    /// Instance involved, when known.
    pub instance_id: Option<FunctionInstanceId>,
    /// What the runtime was doing.
    pub message: String,
    /// The underlying error.
    pub error: Error,
}

type Callback = Arc<dyn Fn(&UnhandledError) + Send + Sync>;

/// Dispatches [`UnhandledError`]s to tracing and the user callback.
#[derive(Clone, Default)]
pub struct UnhandledErrorHandler {
    callback: Option<Callback>,
}

impl fmt::Debug for UnhandledErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnhandledErrorHandler")
            .field("callback", &self.callback.as_ref().map(|_| "..."))
            .finish()
    }
}

impl UnhandledErrorHandler {
    /// Handler forwarding to `callback`.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&UnhandledError) + Send + Sync + 'static,
    {
        Self {
            callback: Some(Arc::new(callback)),
        }
    }

    /// Report an error. A panicking callback is contained.
    pub fn report(&self, unhandled: UnhandledError) {
        error!(
            function_type_id = %unhandled.function_type_id,
            instance_id = unhandled.instance_id.as_ref().map(|id| id.as_str()),
            error_code = unhandled.error.error_code(),
            error = %unhandled.error,
            "{}",
            unhandled.message
        );

        if let Some(callback) = &self.callback
            && catch_unwind(AssertUnwindSafe(|| callback(&unhandled))).is_err()
        {
            error!(
                function_type_id = %unhandled.function_type_id,
                "Unhandled error callback panicked"
            );
        }
    }
}
