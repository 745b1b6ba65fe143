// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Background health check.
//!
//! Each pass samples every completion counter and core heartbeat. When none
//! of them changed for the no-progress timeout while a watched completion
//! group is still short of its expected counter, the device is reported
//! stuck.

use crate::completion_group::CompletionGroup;
use crate::config::Timeouts;
use crate::cores::Core;
use crate::driver::DeviceDriver;
use crate::error::{ScalError, ScalResult};
use crate::platform::PlatformInfo;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Sample {
    counters: Vec<u64>,
    heartbeats: Vec<u32>,
    last_progress: Instant,
}

/// Stuck-device detector state, advanced by [`BgWork::run`].
pub struct BgWork {
    sample: Mutex<Sample>,
}

impl Default for BgWork {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BgWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BgWork").finish_non_exhaustive()
    }
}

impl BgWork {
    pub fn new() -> Self {
        Self {
            sample: Mutex::new(Sample {
                counters: Vec::new(),
                heartbeats: Vec::new(),
                last_progress: Instant::now(),
            }),
        }
    }

    /// Run one pass.
    pub fn run(
        &self,
        groups: &[Arc<CompletionGroup>],
        cores: &[Arc<Core>],
        driver: &dyn DeviceDriver,
        platform: &PlatformInfo,
        timeouts: Timeouts,
    ) -> ScalResult<()> {
        let counters: Vec<u64> = groups.iter().map(|g| g.counter().load()).collect();
        let heartbeats: Vec<u32> = cores.iter().map(|c| c.heartbeat(driver, platform)).collect();
        let now = Instant::now();

        let mut sample = self.sample.lock();
        if sample.counters != counters || sample.heartbeats != heartbeats {
            sample.counters = counters;
            sample.heartbeats = heartbeats;
            sample.last_progress = now;
            return Ok(());
        }

        let stuck: Vec<&str> = groups
            .iter()
            .filter(|g| !g.is_stub() && g.tdr().is_some() && g.counter().load() < g.expected_counter())
            .map(|g| g.name())
            .collect();
        if stuck.is_empty() {
            sample.last_progress = now;
            return Ok(());
        }

        let idle = now.duration_since(sample.last_progress);
        if timeouts.disabled || idle < Duration::from_micros(timeouts.no_progress_timeout_us) {
            return Ok(());
        }

        let stuck = stuck.join(", ");
        log::error!("device made no progress for {idle:?}; pending completion groups: {stuck}");
        for g in groups.iter().filter(|g| g.tdr().is_some()) {
            log::error!(
                "  '{}': counter {} expected {}",
                g.name(),
                g.counter().load(),
                g.expected_counter()
            );
        }
        Err(ScalError::TimedOut(format!("no progress for {idle:?} on {stuck}")))
    }
}
