// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// What the runtime does when a fault escapes the root activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnhandledExceptionAction {
    /// Abort the tree and finish in `Faulted`, keeping the fault as completion cause.
    #[default]
    Terminate,
    /// Request cancellation of the root activity.
    Cancel,
    /// Abort the instance without completing it.
    Abort,
}

impl UnhandledExceptionAction {
    /// Returns the string representation of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terminate => "terminate",
            Self::Cancel => "cancel",
            Self::Abort => "abort",
        }
    }

    /// Parse an action from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "terminate" => Some(Self::Terminate),
            "cancel" => Some(Self::Cancel),
            "abort" => Some(Self::Abort),
            _ => None,
        }
    }
}

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Work items drained per cycle before yielding back to the dispatch context
    pub max_work_items_per_cycle: usize,
    /// How long a transaction completion waits for the commit outcome
    pub transaction_timeout: Duration,
    /// Whether fault state may be persisted while a fault propagates
    pub persist_exceptions: bool,
    /// Host policy for faults that reach the root
    pub unhandled_exception_action: UnhandledExceptionAction,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_work_items_per_cycle: 256,
            transaction_timeout: Duration::from_secs(30),
            persist_exceptions: false,
            unhandled_exception_action: UnhandledExceptionAction::Terminate,
        }
    }
}

impl ExecutorConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `RUNTARA_EXECUTOR_MAX_BATCH`: work items per drain cycle (default: 256)
    /// - `RUNTARA_EXECUTOR_TRANSACTION_TIMEOUT_MS`: transaction outcome timeout (default: 30000)
    /// - `RUNTARA_EXECUTOR_PERSIST_EXCEPTIONS`: persist fault state (default: false)
    /// - `RUNTARA_EXECUTOR_UNHANDLED_ACTION`: terminate | cancel | abort (default: terminate)
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_work_items_per_cycle: usize = std::env::var("RUNTARA_EXECUTOR_MAX_BATCH")
            .unwrap_or_else(|_| "256".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "RUNTARA_EXECUTOR_MAX_BATCH",
                "must be a positive integer",
            ))?;

        let timeout_ms: u64 = std::env::var("RUNTARA_EXECUTOR_TRANSACTION_TIMEOUT_MS")
            .unwrap_or_else(|_| "30000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "RUNTARA_EXECUTOR_TRANSACTION_TIMEOUT_MS",
                    "must be a number of milliseconds",
                )
            })?;

        let persist_exceptions = match std::env::var("RUNTARA_EXECUTOR_PERSIST_EXCEPTIONS") {
            Ok(value) => parse_bool(&value).ok_or(ConfigError::Invalid(
                "RUNTARA_EXECUTOR_PERSIST_EXCEPTIONS",
                "must be true or false",
            ))?,
            Err(_) => false,
        };

        let unhandled_exception_action = match std::env::var("RUNTARA_EXECUTOR_UNHANDLED_ACTION")
        {
            Ok(value) => UnhandledExceptionAction::parse(&value).ok_or(ConfigError::Invalid(
                "RUNTARA_EXECUTOR_UNHANDLED_ACTION",
                "must be one of terminate, cancel, abort",
            ))?,
            Err(_) => UnhandledExceptionAction::Terminate,
        };

        Ok(Self {
            max_work_items_per_cycle,
            transaction_timeout: Duration::from_millis(timeout_ms),
            persist_exceptions,
            unhandled_exception_action,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 4] = [
        "RUNTARA_EXECUTOR_MAX_BATCH",
        "RUNTARA_EXECUTOR_TRANSACTION_TIMEOUT_MS",
        "RUNTARA_EXECUTOR_PERSIST_EXCEPTIONS",
        "RUNTARA_EXECUTOR_UNHANDLED_ACTION",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }

        fn clear_all(&mut self) {
            for var in VARS {
                self.remove(var);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_all();

        let config = ExecutorConfig::from_env().unwrap();

        assert_eq!(config.max_work_items_per_cycle, 256);
        assert_eq!(config.transaction_timeout, Duration::from_secs(30));
        assert!(!config.persist_exceptions);
        assert_eq!(
            config.unhandled_exception_action,
            UnhandledExceptionAction::Terminate
        );
    }

    #[test]
    fn test_config_from_env_with_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_all();

        guard.set("RUNTARA_EXECUTOR_MAX_BATCH", "16");
        guard.set("RUNTARA_EXECUTOR_TRANSACTION_TIMEOUT_MS", "250");
        guard.set("RUNTARA_EXECUTOR_PERSIST_EXCEPTIONS", "true");
        guard.set("RUNTARA_EXECUTOR_UNHANDLED_ACTION", "Cancel");

        let config = ExecutorConfig::from_env().unwrap();

        assert_eq!(config.max_work_items_per_cycle, 16);
        assert_eq!(config.transaction_timeout, Duration::from_millis(250));
        assert!(config.persist_exceptions);
        assert_eq!(
            config.unhandled_exception_action,
            UnhandledExceptionAction::Cancel
        );
    }

    #[test]
    fn test_config_rejects_zero_batch() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_all();

        guard.set("RUNTARA_EXECUTOR_MAX_BATCH", "0");

        let result = ExecutorConfig::from_env();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("RUNTARA_EXECUTOR_MAX_BATCH")
        );
    }

    #[test]
    fn test_config_rejects_unknown_action() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_all();

        guard.set("RUNTARA_EXECUTOR_UNHANDLED_ACTION", "ignore");

        let result = ExecutorConfig::from_env();
        assert!(result.is_err());
    }

    #[test]
    fn test_unhandled_action_round_trips_through_str() {
        for action in [
            UnhandledExceptionAction::Terminate,
            UnhandledExceptionAction::Cancel,
            UnhandledExceptionAction::Abort,
        ] {
            assert_eq!(UnhandledExceptionAction::parse(action.as_str()), Some(action));
        }
    }
}
