// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wall-clock helpers shared by in-process waits and the postponed watchdog.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Due time `delay` from now, saturating at the maximum representable instant.
pub(crate) fn after(delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time left until `until`, zero when already due.
pub(crate) fn remaining(until: DateTime<Utc>) -> Duration {
    (until - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Sleep until `until`, then yield until the wall clock has actually reached it.
///
/// Timers may fire slightly early relative to `Utc::now()`, so the residual
/// is absorbed cooperatively instead of sleeping again.
pub(crate) async fn sleep_until(until: DateTime<Utc>) {
    tokio::time::sleep(remaining(until)).await;
    while Utc::now() < until {
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_is_zero_for_past_due_times() {
        let past = Utc::now() - TimeDelta::seconds(5);
        assert_eq!(remaining(past), Duration::ZERO);
    }

    #[test]
    fn test_after_saturates() {
        assert_eq!(after(Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn test_sleep_until_reaches_wall_clock() {
        let due = after(Duration::from_millis(20));
        sleep_until(due).await;
        assert!(Utc::now() >= due);
    }
}
