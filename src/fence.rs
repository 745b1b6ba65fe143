// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Host fence counters.
//!
//! A host fence counter is a credit counter on top of a completion group:
//! every wait asks for `n` more credits than all previous waits combined.

use crate::completion_group::CompletionGroup;
use crate::driver::DeviceDriver;
use crate::error::ScalResult;
use crate::sync_manager::SyncManager;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Snapshot of a host fence counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFenceCounterInfo {
    pub name: String,
    pub completion_group: String,
    pub sm_index: u32,
    pub so_index: u32,
    pub monitor_base: u32,
    pub interrupt: u32,
    pub isr_enabled: bool,
    pub request_counter: u64,
}

pub(crate) struct HostFenceCounterParts {
    pub name: String,
    pub completion_group: Arc<CompletionGroup>,
    pub sync_manager: Arc<SyncManager>,
    pub driver: Arc<dyn DeviceDriver>,
    pub so_index: u32,
    pub monitor_base: u32,
    pub interrupt: u32,
    pub isr_enabled: bool,
    pub doorbell: u64,
}

/// Credit counter layered on a completion group.
pub struct HostFenceCounter {
    name: String,
    completion_group: Arc<CompletionGroup>,
    sync_manager: Arc<SyncManager>,
    driver: Arc<dyn DeviceDriver>,
    so_index: u32,
    monitor_base: u32,
    interrupt: u32,
    doorbell: u64,
    request_counter: AtomicU64,
    isr_enabled: Mutex<bool>,
}

impl std::fmt::Debug for HostFenceCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFenceCounter")
            .field("name", &self.name)
            .field("completion_group", &self.completion_group.name())
            .field("request_counter", &self.request_counter.load(Ordering::Relaxed))
            .finish()
    }
}

impl HostFenceCounter {
    /// Create the fence and program its monitor for the initial interrupt state.
    pub(crate) fn new(parts: HostFenceCounterParts) -> Self {
        let fence = Self {
            name: parts.name,
            completion_group: parts.completion_group,
            sync_manager: parts.sync_manager,
            driver: parts.driver,
            so_index: parts.so_index,
            monitor_base: parts.monitor_base,
            interrupt: parts.interrupt,
            doorbell: parts.doorbell,
            request_counter: AtomicU64::new(0),
            isr_enabled: Mutex::new(parts.isr_enabled),
        };
        if !fence.is_stub() {
            fence.apply_isr(parts.isr_enabled);
        }
        fence
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn completion_group(&self) -> &Arc<CompletionGroup> {
        &self.completion_group
    }

    pub fn is_stub(&self) -> bool {
        self.completion_group.is_stub()
    }

    /// Ask for `credits` more completions and wait for them.
    ///
    /// Credits stay requested even if the wait fails.
    pub fn wait(&self, credits: u64, timeout_us: u64) -> ScalResult<()> {
        if self.is_stub() {
            return Ok(());
        }
        let target = self
            .request_counter
            .fetch_add(credits, Ordering::AcqRel)
            .wrapping_add(credits);
        log::trace!("fence '{}': waiting for {target}", self.name);
        self.completion_group.wait(target, timeout_us)
    }

    /// Switch the completion group between its dedicated interrupt and polling.
    pub fn enable_isr(&self, enable: bool) -> ScalResult<()> {
        if self.is_stub() {
            return Ok(());
        }
        let mut enabled = self.isr_enabled.lock();
        if *enabled == enable {
            return Ok(());
        }
        self.apply_isr(enable);
        *enabled = enable;
        log::debug!(
            "fence '{}': interrupt {} {}",
            self.name,
            self.interrupt,
            if enable { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    fn apply_isr(&self, enable: bool) {
        self.completion_group
            .set_interrupt(enable.then_some(self.interrupt));
        let interrupt = enable.then_some((self.doorbell, self.interrupt));
        self.sync_manager
            .program_monitor(self.driver.as_ref(), self.monitor_base, self.so_index, interrupt);
    }

    pub fn info(&self) -> HostFenceCounterInfo {
        HostFenceCounterInfo {
            name: self.name.clone(),
            completion_group: self.completion_group.name().to_string(),
            sm_index: self.sync_manager.index(),
            so_index: self.so_index,
            monitor_base: self.monitor_base,
            interrupt: self.interrupt,
            isr_enabled: *self.isr_enabled.lock(),
            request_counter: self.request_counter.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion_group::tests::Fixture;
    use crate::completion_group::GroupKind;
    use crate::config::Timeouts;
    use crate::sync_manager::{MonitorConfig, SmCapacity};
    use std::thread;
    use std::time::Duration;

    fn fence(fx: &Fixture, kind: GroupKind, isr_enabled: bool) -> (Arc<SyncManager>, HostFenceCounter) {
        let sm = Arc::new(SyncManager::new(
            0,
            0,
            0x4000_0000,
            SmCapacity {
                sync_objects: 64,
                monitors: 64,
                completion_queues: 4,
            },
        ));
        let cg = fx.group("fence_cg", 0, None, kind);
        let driver: Arc<dyn DeviceDriver> = fx.dev.clone();
        let f = HostFenceCounter::new(HostFenceCounterParts {
            name: "fence0".into(),
            completion_group: cg,
            sync_manager: Arc::clone(&sm),
            driver,
            so_index: 5,
            monitor_base: 9,
            interrupt: 12,
            isr_enabled,
            doorbell: 0xfee0_0000,
        });
        (sm, f)
    }

    #[test]
    fn test_credits_accumulate() {
        let fx = Fixture::new(Timeouts::default());
        let (_sm, f) = fence(&fx, GroupKind::Hardware, false);
        fx.dev.signal(0, 3);
        f.wait(3, 1_000_000).unwrap();
        assert_eq!(f.info().request_counter, 3);

        let dev = Arc::clone(&fx.dev);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            dev.signal(0, 8);
        });
        f.wait(5, 1_000_000).unwrap();
        t.join().unwrap();
        assert_eq!(f.info().request_counter, 8);
    }

    #[test]
    fn test_failed_wait_keeps_credits() {
        let fx = Fixture::new(Timeouts::default());
        let (_sm, f) = fence(&fx, GroupKind::Hardware, false);
        assert!(f.wait(2, 0).is_err());
        fx.dev.signal(0, 2);
        // the first two credits are still outstanding
        assert!(f.wait(1, 0).is_err());
        fx.dev.signal(0, 3);
        f.wait(0, 0).unwrap();
    }

    #[test]
    fn test_enable_isr_toggles_group_and_monitor() {
        let fx = Fixture::new(Timeouts::default());
        let (sm, f) = fence(&fx, GroupKind::Hardware, false);
        let cfg_reg = sm.monitor_config_address(9);
        assert_eq!(f.completion_group().interrupt(), None);
        assert_eq!(fx.dev.writes_to(cfg_reg).len(), 1);

        f.enable_isr(true).unwrap();
        assert_eq!(f.completion_group().interrupt(), Some(12));
        let cfg = MonitorConfig::from_bits_truncate(fx.dev.read_register(cfg_reg));
        assert!(cfg.contains(MonitorConfig::LBW_ENABLE));

        // already enabled: no reprogramming
        f.enable_isr(true).unwrap();
        assert_eq!(fx.dev.writes_to(cfg_reg).len(), 2);

        f.enable_isr(false).unwrap();
        assert_eq!(f.completion_group().interrupt(), None);
        assert!(!f.info().isr_enabled);
        assert_eq!(fx.dev.writes_to(cfg_reg).len(), 3);
    }

    #[test]
    fn test_stub_fence() {
        let fx = Fixture::new(Timeouts::default());
        let (sm, f) = fence(&fx, GroupKind::Stub, false);
        f.wait(100, 0).unwrap();
        f.enable_isr(true).unwrap();
        assert_eq!(f.info().request_counter, 0);
        assert!(fx.dev.writes_to(sm.monitor_config_address(9)).is_empty());
    }
}
