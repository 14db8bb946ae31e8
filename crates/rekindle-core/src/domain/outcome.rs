// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outcome of one body execution.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{FunctionId, StoredFailure};
use crate::clock;

/// What a function body asks the runtime to persist.
///
/// `Postpone` with `in_process_wait` lets the invoking task sleep and retry in
/// place when the delay is below the configured threshold; otherwise the
/// postponed watchdog resumes the function once it is due.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<R> {
    /// The body completed with a value.
    Succeed(R),
    /// The body failed.
    Fail(StoredFailure),
    /// The body should be resumed at `until`.
    Postpone {
        /// Due time.
        until: DateTime<Utc>,
        /// Whether the invoking task may wait for the due time itself.
        in_process_wait: bool,
    },
}

impl<R> Outcome<R> {
    /// Successful outcome.
    pub fn succeed(value: R) -> Self {
        Outcome::Succeed(value)
    }

    /// Failed outcome recording `error`.
    pub fn fail<E: fmt::Display>(error: E) -> Self {
        Outcome::Fail(StoredFailure::from_error(&error))
    }

    /// Postpone until an absolute due time.
    pub fn postpone_until(until: DateTime<Utc>) -> Self {
        Outcome::Postpone {
            until,
            in_process_wait: true,
        }
    }

    /// Postpone for a delay measured from now.
    pub fn postpone_for(delay: Duration) -> Self {
        Self::postpone_until(clock::after(delay))
    }

    /// Leave resumption of a postponement to the postponed watchdog.
    pub fn without_in_process_wait(self) -> Self {
        match self {
            Outcome::Postpone { until, .. } => Outcome::Postpone {
                until,
                in_process_wait: false,
            },
            other => other,
        }
    }

    /// True for `Postpone`.
    pub fn is_postponed(&self) -> bool {
        matches!(self, Outcome::Postpone { .. })
    }
}

impl<R, E: fmt::Display> From<Result<R, E>> for Outcome<R> {
    fn from(result: Result<R, E>) -> Self {
        match result {
            Ok(value) => Outcome::Succeed(value),
            Err(error) => Outcome::fail(error),
        }
    }
}

/// Values a function body may return.
///
/// Implemented for [`Outcome`] itself and for any `Result` whose error is
/// displayable, so bodies can use `?` and still postpone explicitly.
pub trait IntoOutcome {
    /// Success value type.
    type Output;

    /// Convert into an outcome.
    fn into_outcome(self) -> Outcome<Self::Output>;
}

impl<R> IntoOutcome for Outcome<R> {
    type Output = R;

    fn into_outcome(self) -> Outcome<R> {
        self
    }
}

impl<R, E: fmt::Display> IntoOutcome for Result<R, E> {
    type Output = R;

    fn into_outcome(self) -> Outcome<R> {
        self.into()
    }
}

/// Invocation metadata handed to pre and post invoke hooks.
#[derive(Debug, Clone)]
pub struct Metadata<P> {
    /// The function being executed.
    pub function_id: FunctionId,
    /// The invocation parameter.
    pub param: P,
}
