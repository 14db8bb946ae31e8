// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Invocation runner: registrations and the shared execution loop.
//!
//! All four entry points ([`Registration::invoke`], [`Registration::schedule`],
//! [`Registration::re_invoke`], [`Registration::schedule_re_invoke`]) and
//! watchdog-driven recoveries run the body through the same loop:
//!
//! ```text
//!   ┌──────────────┐   ┌──────┐   ┌───────────────┐   ┌────────────────────────┐
//!   │  pre-invoke  │──►│ body │──►│  post-invoke  │──►│ set_function_state     │
//!   └──────────────┘   └──────┘   └───────────────┘   │ (fenced by epoch)      │
//!          ▲        sign of life updater running        └───────────┬────────────┘
//!          │                                                        │
//!          │   postponed, in-process wait, below threshold:        │
//!          └───────── sleep, become leader with epoch + 1 ◄────────┘
//! ```

mod builder;
mod invoker;
mod registration;

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{Metadata, Outcome};
use crate::scrapbook::Scrapbook;

pub use builder::FunctionBuilder;
pub(crate) use invoker::Invoker;
pub use registration::Registration;

/// Bound shared by parameters, scrapbooks and results.
pub trait Persistable: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Persistable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

pub(crate) type Body<P, S, R> =
    Arc<dyn Fn(P, Scrapbook<S>) -> BoxFuture<'static, Outcome<R>> + Send + Sync>;

pub(crate) type PreInvoke<P, S> =
    Arc<dyn Fn(Scrapbook<S>, Metadata<P>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub(crate) type PostInvoke<P, S, R> = Arc<
    dyn Fn(Outcome<R>, Scrapbook<S>, Metadata<P>) -> BoxFuture<'static, Outcome<R>> + Send + Sync,
>;

/// What a registration persists besides status.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FunctionKind {
    /// Scrapbook state is created, bound and persisted.
    pub(crate) uses_scrapbook: bool,
    /// Successful values are stored. Actions keep `result` empty.
    pub(crate) persists_result: bool,
}

impl FunctionKind {
    pub(crate) const FUNC: Self = Self {
        uses_scrapbook: false,
        persists_result: true,
    };
    pub(crate) const FUNC_WITH_SCRAPBOOK: Self = Self {
        uses_scrapbook: true,
        persists_result: true,
    };
    pub(crate) const ACTION: Self = Self {
        uses_scrapbook: false,
        persists_result: false,
    };
    pub(crate) const ACTION_WITH_SCRAPBOOK: Self = Self {
        uses_scrapbook: true,
        persists_result: false,
    };
}
