// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable scratch state of one invocation.
//!
//! A body records partial progress in its scrapbook and calls
//! [`Scrapbook::save`] to persist it under the current epoch. After a crash
//! the resumed invocation receives the last saved state and can skip the
//! steps it already completed.
//!
//! # Example
//!
//! ```ignore
//! let registration = runtime.register_func_with_scrapbook(
//!     "send-emails",
//!     |recipients: Vec<String>, scrapbook: Scrapbook<Progress>| async move {
//!         for (i, recipient) in recipients.iter().enumerate() {
//!             if scrapbook.with(|p| p.sent > i) {
//!                 continue;
//!             }
//!             send(recipient).await;
//!             scrapbook.update(|p| p.sent = i + 1);
//!             scrapbook.save().await?;
//!         }
//!         Ok::<_, anyhow::Error>(recipients.len())
//!     },
//! )?;
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{Epoch, FunctionId};
use crate::error::{Error, Result};
use crate::persistence::FunctionStore;

/// Shared handle to the scratch state of one invocation attempt.
pub struct Scrapbook<S> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    state: Mutex<S>,
    binding: Mutex<Option<Binding>>,
}

#[derive(Clone)]
struct Binding {
    store: Arc<dyn FunctionStore>,
    function_id: FunctionId,
    epoch: Epoch,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S> Clone for Scrapbook<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Default> Default for Scrapbook<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S: fmt::Debug> fmt::Debug for Scrapbook<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let binding = lock(&self.inner.binding);
        f.debug_struct("Scrapbook")
            .field("state", &*lock(&self.inner.state))
            .field("function_id", &binding.as_ref().map(|b| &b.function_id))
            .field("epoch", &binding.as_ref().map(|b| b.epoch))
            .finish()
    }
}

impl<S> Scrapbook<S> {
    /// Create an unbound scrapbook. Saving it fails until the runtime binds it to an invocation.
    pub fn new(state: S) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                binding: Mutex::new(None),
            }),
        }
    }

    /// Clone of the current state.
    pub fn get(&self) -> S
    where
        S: Clone,
    {
        lock(&self.inner.state).clone()
    }

    /// Read the state.
    pub fn with<T>(&self, f: impl FnOnce(&S) -> T) -> T {
        f(&lock(&self.inner.state))
    }

    /// Mutate the state in memory. Call [`save`](Self::save) to persist it.
    pub fn update<T>(&self, f: impl FnOnce(&mut S) -> T) -> T {
        f(&mut lock(&self.inner.state))
    }

    /// True once bound to a running invocation.
    pub fn is_initialized(&self) -> bool {
        lock(&self.inner.binding).is_some()
    }

    /// Bind to an invocation attempt. Later saves are fenced by `epoch`.
    pub(crate) fn bind(&self, store: Arc<dyn FunctionStore>, function_id: FunctionId, epoch: Epoch) {
        *lock(&self.inner.binding) = Some(Binding {
            store,
            function_id,
            epoch,
        });
    }

    fn type_name() -> String {
        std::any::type_name::<S>().to_string()
    }
}

impl<S: Serialize> Scrapbook<S> {
    /// Persist the current state under the bound epoch.
    ///
    /// Fails with [`Error::ScrapbookUninitialized`] when not bound and with
    /// [`Error::UnexpectedFunctionState`] when another leader took over.
    pub async fn save(&self) -> Result<()> {
        let binding = lock(&self.inner.binding)
            .clone()
            .ok_or_else(|| Error::ScrapbookUninitialized {
                type_name: Self::type_name(),
            })?;
        let json = self.to_json()?;

        let saved = binding
            .store
            .set_scrapbook(&binding.function_id, &json, binding.epoch)
            .await?;
        if !saved {
            return Err(Error::unexpected_state(
                &binding.function_id,
                format!("scrapbook save rejected, epoch {} is no longer current", binding.epoch),
            ));
        }
        Ok(())
    }

    pub(crate) fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&*lock(&self.inner.state))?)
    }
}

impl<S: DeserializeOwned + Default> Scrapbook<S> {
    /// Rebuild from persisted JSON, falling back to the default state.
    pub(crate) fn from_json(json: Option<&str>) -> Result<Self> {
        let state = match json {
            Some(json) => serde_json::from_str(json)?,
            None => S::default(),
        };
        Ok(Self::new(state))
    }
}
