// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Runtime configuration read from the environment.
//!
//! | Variable                     | Meaning                                       |
//! |------------------------------|-----------------------------------------------|
//! | `SCAL_TIMEOUT_VALUE`         | engine timeout in microseconds                |
//! | `SCAL_TIMEOUT_VALUE_SECONDS` | engine timeout in seconds (added to the above)|
//! | `SCAL_TIMEOUT_NO_PROGRESS`   | no-progress timeout in microseconds           |
//! | `SCAL_DISABLE_TIMEOUT`       | `1` disables timeouts globally                |
//! | `ENABLE_SCAL_STUB`           | `1` or `true` creates every waiter as a stub  |
//! | `SCAL_PROGRESS_SCOPE`        | `all` or `scheduler`                          |
//! | `SCAL_INTERCEPT_DISABLE`     | `1` never installs an interception table      |

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub const ENV_TIMEOUT_US: &str = "SCAL_TIMEOUT_VALUE";
pub const ENV_TIMEOUT_SECONDS: &str = "SCAL_TIMEOUT_VALUE_SECONDS";
pub const ENV_TIMEOUT_NO_PROGRESS: &str = "SCAL_TIMEOUT_NO_PROGRESS";
pub const ENV_DISABLE_TIMEOUT: &str = "SCAL_DISABLE_TIMEOUT";
pub const ENV_STUB: &str = "ENABLE_SCAL_STUB";
pub const ENV_PROGRESS_SCOPE: &str = "SCAL_PROGRESS_SCOPE";
pub const ENV_INTERCEPT_DISABLE: &str = "SCAL_INTERCEPT_DISABLE";

/// Default engine timeout (10 minutes).
pub const DEFAULT_TIMEOUT_US: u64 = 10 * 60 * 1_000_000;

/// Extra time the no-progress watchdog allows past the engine timeout.
pub const NO_PROGRESS_ADDITION_US: u64 = 60 * 1_000_000;

/// Value reported by the driver when its locked timeout is disabled.
pub const DRIVER_TIMEOUT_DISABLED_S: u64 = (u32::MAX / 1000) as u64;

/// Sentinel for "wait forever" in every `timeout_us` argument.
pub const WAIT_FOREVER: u64 = u64::MAX;

/// Which completion groups the no-progress watchdog inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressScope {
    /// Any completion group advancing counts as progress.
    #[default]
    All,
    /// Only groups owned by the waiter's scheduler count.
    SameScheduler,
}

/// Timeout settings shared by all waits of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub timeout_us: u64,
    pub no_progress_timeout_us: u64,
    pub disabled: bool,
}

impl Timeouts {
    /// Timeouts derived from an engine timeout.
    pub fn from_engine_timeout(timeout_us: u64) -> Self {
        Self {
            timeout_us,
            no_progress_timeout_us: DEFAULT_TIMEOUT_US
                .max(timeout_us.saturating_add(NO_PROGRESS_ADDITION_US)),
            disabled: false,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from_engine_timeout(DEFAULT_TIMEOUT_US)
    }
}

/// Lock-free holder of the live [`Timeouts`].
#[derive(Debug)]
pub(crate) struct SharedTimeouts {
    timeout_us: AtomicU64,
    no_progress_timeout_us: AtomicU64,
    disabled: AtomicBool,
}

impl SharedTimeouts {
    pub(crate) fn new(t: Timeouts) -> Self {
        Self {
            timeout_us: AtomicU64::new(t.timeout_us),
            no_progress_timeout_us: AtomicU64::new(t.no_progress_timeout_us),
            disabled: AtomicBool::new(t.disabled),
        }
    }

    pub(crate) fn get(&self) -> Timeouts {
        Timeouts {
            timeout_us: self.timeout_us.load(Ordering::Relaxed),
            no_progress_timeout_us: self.no_progress_timeout_us.load(Ordering::Relaxed),
            disabled: self.disabled.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set(&self, t: Timeouts) {
        self.timeout_us.store(t.timeout_us, Ordering::Relaxed);
        self.no_progress_timeout_us
            .store(t.no_progress_timeout_us, Ordering::Relaxed);
        self.disabled.store(t.disabled, Ordering::Relaxed);
    }

    pub(crate) fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }
}

/// Configuration applied to an instance at creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub timeouts: Timeouts,
    /// Create every completion group, fence and stream as a stub.
    pub stub: bool,
    pub progress_scope: ProgressScope,
    /// Allow an installed interceptor to replace the operation table.
    pub intercept: bool,
}

impl RuntimeConfig {
    /// Read the configuration from the process environment.
    ///
    /// `driver_timeout_s` is the driver's locked timeout, used when no
    /// timeout variable is set.
    pub fn from_env(driver_timeout_s: Option<u64>) -> Self {
        Self::from_lookup(|key| std::env::var(key).ok(), driver_timeout_s)
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F, driver_timeout_s: Option<u64>) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_us = parse_u64(&lookup, ENV_TIMEOUT_US);
        let env_s = parse_u64(&lookup, ENV_TIMEOUT_SECONDS);

        let timeout_us = match (env_us, env_s) {
            (None, None) => match driver_timeout_s {
                Some(DRIVER_TIMEOUT_DISABLED_S) => u64::MAX,
                Some(s) => s.saturating_mul(1_000_000),
                None => DEFAULT_TIMEOUT_US,
            },
            (us, s) => us
                .unwrap_or(0)
                .saturating_add(s.unwrap_or(0).saturating_mul(1_000_000)),
        };

        let mut timeouts = Timeouts::from_engine_timeout(timeout_us);
        if let Some(np) = parse_u64(&lookup, ENV_TIMEOUT_NO_PROGRESS) {
            timeouts.no_progress_timeout_us = np;
        }
        timeouts.disabled = lookup(ENV_DISABLE_TIMEOUT).as_deref() == Some("1");

        let stub = matches!(lookup(ENV_STUB).as_deref(), Some("1") | Some("true"));

        let progress_scope = match lookup(ENV_PROGRESS_SCOPE).as_deref() {
            None | Some("all") => ProgressScope::All,
            Some("scheduler") => ProgressScope::SameScheduler,
            Some(other) => {
                log::error!("{ENV_PROGRESS_SCOPE}: unknown scope '{other}', using 'all'");
                ProgressScope::All
            }
        };

        let intercept = lookup(ENV_INTERCEPT_DISABLE).as_deref() != Some("1");

        Self {
            timeouts,
            stub,
            progress_scope,
            intercept,
        }
    }
}

fn parse_u64<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            log::error!("{key}: ignoring unparsable value '{raw}'");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[]), None);
        assert_eq!(cfg.timeouts.timeout_us, DEFAULT_TIMEOUT_US);
        assert_eq!(
            cfg.timeouts.no_progress_timeout_us,
            DEFAULT_TIMEOUT_US + NO_PROGRESS_ADDITION_US
        );
        assert!(!cfg.timeouts.disabled);
        assert!(!cfg.stub);
        assert!(cfg.intercept);
        assert_eq!(cfg.progress_scope, ProgressScope::All);
    }

    #[test]
    fn test_env_timeouts_are_summed() {
        let cfg = RuntimeConfig::from_lookup(
            lookup(&[(ENV_TIMEOUT_US, "500"), (ENV_TIMEOUT_SECONDS, "2")]),
            Some(30),
        );
        assert_eq!(cfg.timeouts.timeout_us, 2_000_500);
        // floor of ten minutes
        assert_eq!(cfg.timeouts.no_progress_timeout_us, DEFAULT_TIMEOUT_US);
    }

    #[test]
    fn test_driver_timeout() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[]), Some(1200));
        assert_eq!(cfg.timeouts.timeout_us, 1_200_000_000);
        assert_eq!(
            cfg.timeouts.no_progress_timeout_us,
            1_200_000_000 + NO_PROGRESS_ADDITION_US
        );

        let cfg = RuntimeConfig::from_lookup(lookup(&[]), Some(DRIVER_TIMEOUT_DISABLED_S));
        assert_eq!(cfg.timeouts.timeout_us, u64::MAX);
        assert_eq!(cfg.timeouts.no_progress_timeout_us, u64::MAX);
    }

    #[test]
    fn test_toggles() {
        let cfg = RuntimeConfig::from_lookup(
            lookup(&[
                (ENV_DISABLE_TIMEOUT, "1"),
                (ENV_STUB, "true"),
                (ENV_PROGRESS_SCOPE, "scheduler"),
                (ENV_INTERCEPT_DISABLE, "1"),
                (ENV_TIMEOUT_NO_PROGRESS, "42"),
            ]),
            None,
        );
        assert!(cfg.timeouts.disabled);
        assert!(cfg.stub);
        assert!(!cfg.intercept);
        assert_eq!(cfg.progress_scope, ProgressScope::SameScheduler);
        assert_eq!(cfg.timeouts.no_progress_timeout_us, 42);
    }

    #[test]
    fn test_garbage_is_ignored() {
        let cfg = RuntimeConfig::from_lookup(
            lookup(&[(ENV_TIMEOUT_US, "soon"), (ENV_PROGRESS_SCOPE, "nearby")]),
            None,
        );
        assert_eq!(cfg.timeouts.timeout_us, DEFAULT_TIMEOUT_US);
        assert_eq!(cfg.progress_scope, ProgressScope::All);
    }

    #[test]
    fn test_shared_timeouts() {
        let shared = SharedTimeouts::new(Timeouts::default());
        shared.set_disabled(true);
        assert!(shared.get().disabled);
        shared.set(Timeouts::from_engine_timeout(5));
        assert_eq!(shared.get().timeout_us, 5);
        assert!(!shared.get().disabled);
    }
}
