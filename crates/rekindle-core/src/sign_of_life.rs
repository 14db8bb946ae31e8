// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Heartbeat writer for a running body.
//!
//! The crashed watchdog treats a row whose `(epoch, sign_of_life)` pair did
//! not move during a whole scan interval as abandoned, so the updater bumps
//! the counter at a shorter interval for as long as the body runs.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{Epoch, FunctionId, SignOfLife};
use crate::persistence::FunctionStore;
use crate::unhandled::{UnhandledError, UnhandledErrorHandler};

/// Scoped heartbeat task. Stops when dropped.
pub(crate) struct SignOfLifeUpdater {
    cancel: CancellationToken,
}

impl SignOfLifeUpdater {
    /// Start bumping the heartbeat of `function_id` at `epoch`.
    ///
    /// A zero frequency starts nothing. The task ends silently when the
    /// fenced write is rejected, because another leader owns the row now.
    pub(crate) fn start(
        store: Arc<dyn FunctionStore>,
        unhandled: UnhandledErrorHandler,
        function_id: FunctionId,
        epoch: Epoch,
        frequency: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        if frequency.is_zero() {
            return Self { cancel };
        }

        let token = cancel.clone();
        tokio::spawn(async move {
            let mut sign_of_life: SignOfLife = 0;
            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => break,

                    _ = tokio::time::sleep(frequency) => {
                        sign_of_life += 1;
                        match store.update_sign_of_life(&function_id, epoch, sign_of_life).await {
                            Ok(true) => {}
                            Ok(false) => {
                                debug!(
                                    function_id = %function_id,
                                    epoch,
                                    "Sign of life rejected, another leader took over"
                                );
                                break;
                            }
                            Err(e) => {
                                if !token.is_cancelled() {
                                    unhandled.report(UnhandledError {
                                        function_type_id: function_id.type_id.clone(),
                                        instance_id: Some(function_id.instance_id.clone()),
                                        message: "Sign of life update failed".to_string(),
                                        error: e,
                                    });
                                }
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self { cancel }
    }
}

impl Drop for SignOfLifeUpdater {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
