// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime settings, with defaults, builder methods and environment loading.

use std::time::Duration;

/// Timing settings shared by all functions registered on one runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Interval between crashed watchdog scans. Zero disables the watchdog.
    pub crashed_check_frequency: Duration,
    /// Interval between postponed watchdog scans, also its look-ahead window.
    /// Zero disables the watchdog.
    pub postponed_check_frequency: Duration,
    /// Heartbeat interval of running bodies. Defaults to half the crashed
    /// check frequency so at least one bump lands in every scan interval.
    pub sign_of_life_frequency: Option<Duration>,
    /// Delay before the postponed watchdog performs its first scan.
    pub delay_startup: Duration,
    /// Postponements at most this far in the future are awaited by the
    /// invoking task when the body requested an in-process wait.
    pub in_process_wait_threshold: Duration,
    /// Poll interval of a duplicate invoke waiting for another execution.
    pub completion_poll_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            crashed_check_frequency: Duration::from_secs(10),
            postponed_check_frequency: Duration::from_secs(10),
            sign_of_life_frequency: None,
            delay_startup: Duration::ZERO,
            in_process_wait_threshold: Duration::from_secs(10),
            completion_poll_interval: Duration::from_millis(100),
        }
    }
}

impl Settings {
    /// Set the crashed watchdog scan interval (zero disables).
    pub fn with_crashed_check_frequency(mut self, frequency: Duration) -> Self {
        self.crashed_check_frequency = frequency;
        self
    }

    /// Set the postponed watchdog scan interval (zero disables).
    pub fn with_postponed_check_frequency(mut self, frequency: Duration) -> Self {
        self.postponed_check_frequency = frequency;
        self
    }

    /// Set an explicit heartbeat interval (zero disables heartbeats).
    pub fn with_sign_of_life_frequency(mut self, frequency: Duration) -> Self {
        self.sign_of_life_frequency = Some(frequency);
        self
    }

    /// Delay the first postponed watchdog scan.
    pub fn with_delay_startup(mut self, delay: Duration) -> Self {
        self.delay_startup = delay;
        self
    }

    /// Set the in-process wait threshold.
    pub fn with_in_process_wait_threshold(mut self, threshold: Duration) -> Self {
        self.in_process_wait_threshold = threshold;
        self
    }

    /// Set the duplicate invoke poll interval.
    pub fn with_completion_poll_interval(mut self, interval: Duration) -> Self {
        self.completion_poll_interval = interval;
        self
    }

    /// Effective heartbeat interval.
    pub fn effective_sign_of_life_frequency(&self) -> Duration {
        self.sign_of_life_frequency
            .unwrap_or(self.crashed_check_frequency / 2)
    }

    /// Load settings from environment variables, keeping defaults for unset ones.
    ///
    /// All values are milliseconds:
    /// - `REKINDLE_CRASHED_CHECK_FREQUENCY_MS` (default: 10000)
    /// - `REKINDLE_POSTPONED_CHECK_FREQUENCY_MS` (default: 10000)
    /// - `REKINDLE_SIGN_OF_LIFE_FREQUENCY_MS` (default: half the crashed check frequency)
    /// - `REKINDLE_DELAY_STARTUP_MS` (default: 0)
    /// - `REKINDLE_IN_PROCESS_WAIT_THRESHOLD_MS` (default: 10000)
    /// - `REKINDLE_COMPLETION_POLL_INTERVAL_MS` (default: 100)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            crashed_check_frequency: millis_var("REKINDLE_CRASHED_CHECK_FREQUENCY_MS")?
                .unwrap_or(defaults.crashed_check_frequency),
            postponed_check_frequency: millis_var("REKINDLE_POSTPONED_CHECK_FREQUENCY_MS")?
                .unwrap_or(defaults.postponed_check_frequency),
            sign_of_life_frequency: millis_var("REKINDLE_SIGN_OF_LIFE_FREQUENCY_MS")?,
            delay_startup: millis_var("REKINDLE_DELAY_STARTUP_MS")?
                .unwrap_or(defaults.delay_startup),
            in_process_wait_threshold: millis_var("REKINDLE_IN_PROCESS_WAIT_THRESHOLD_MS")?
                .unwrap_or(defaults.in_process_wait_threshold),
            completion_poll_interval: millis_var("REKINDLE_COMPLETION_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.completion_poll_interval),
        })
    }
}

fn millis_var(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ConfigError::Invalid(name, "must be a non-negative integer (ms)")),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => {
            Err(ConfigError::Invalid(name, "must be valid unicode"))
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
