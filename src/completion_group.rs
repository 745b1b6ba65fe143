// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Completion groups and the wait protocol.
//!
//! A completion group owns one hardware completion counter that the device
//! increments as work retires. Waiting is a three step ladder:
//!
//! 1. read the counter, return if the target is already reached
//! 2. groups without an interrupt busy-poll the counter until the deadline
//! 3. groups with an interrupt block in the driver
//!
//! Waits with [`WAIT_FOREVER`](crate::config::WAIT_FOREVER) are bounded by a
//! watchdog instead: after each driver timeout every known counter is
//! compared against the previous snapshot, and the wait only fails once
//! nothing in the system has advanced.

use crate::config::{ProgressScope, SharedTimeouts, Timeouts, WAIT_FOREVER};
use crate::driver::{CounterBlock, CounterWait, DeviceDriver, DriverError, TimestampRequest, NO_INTERRUPT};
use crate::error::{ScalError, ScalResult};
use bitflags::bitflags;
use parking_lot::RwLock;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Counter reads between deadline checks while busy-polling.
const POLL_BATCH: u32 = 256;

bitflags! {
    /// Failure classes already reported for a group.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LoggedFailures: u8 {
        const TIMED_OUT = 1 << 0;
        const NO_PROGRESS = 1 << 1;
        const DRIVER_ERROR = 1 << 2;
    }
}

/// Monotonic view of a hardware completion counter.
#[derive(Debug)]
pub struct CompletionCounter {
    block: Arc<CounterBlock>,
    index: u32,
    observed: AtomicU64,
}

impl CompletionCounter {
    pub fn new(block: Arc<CounterBlock>, index: u32) -> Self {
        Self {
            block,
            index,
            observed: AtomicU64::new(0),
        }
    }

    /// Latest value, never smaller than any value returned before.
    #[inline]
    pub fn load(&self) -> u64 {
        let raw = self.block.load(self.index);
        let prev = self.observed.fetch_max(raw, Ordering::AcqRel);
        prev.max(raw)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn block(&self) -> &Arc<CounterBlock> {
        &self.block
    }
}

struct Watched {
    name: String,
    scheduler: Option<String>,
    counter: Arc<CompletionCounter>,
}

/// State shared by every wait of an instance.
pub(crate) struct WaitContext {
    driver: Arc<dyn DeviceDriver>,
    timeouts: SharedTimeouts,
    scope: ProgressScope,
    watched: RwLock<Vec<Watched>>,
}

impl WaitContext {
    pub(crate) fn new(driver: Arc<dyn DeviceDriver>, timeouts: Timeouts, scope: ProgressScope) -> Self {
        Self {
            driver,
            timeouts: SharedTimeouts::new(timeouts),
            scope,
            watched: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    pub(crate) fn timeouts(&self) -> &SharedTimeouts {
        &self.timeouts
    }

    /// Include `group` in progress scans.
    pub(crate) fn watch(&self, group: &CompletionGroup) {
        self.watched.write().push(Watched {
            name: group.name.clone(),
            scheduler: group.scheduler().map(str::to_string),
            counter: Arc::clone(&group.counter),
        });
    }

    fn in_scope(&self, w: &Watched, scheduler: Option<&str>) -> bool {
        match self.scope {
            ProgressScope::All => true,
            ProgressScope::SameScheduler => w.scheduler.as_deref() == scheduler,
        }
    }

    fn snapshot(&self, scheduler: Option<&str>) -> Vec<u64> {
        self.watched
            .read()
            .iter()
            .filter(|w| self.in_scope(w, scheduler))
            .map(|w| w.counter.load())
            .collect()
    }

    fn log_counters(&self, scheduler: Option<&str>) {
        for w in self.watched.read().iter().filter(|w| self.in_scope(w, scheduler)) {
            log::error!("  completion group '{}': counter {}", w.name, w.counter.load());
        }
    }
}

/// Whether a group talks to hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// Every wait succeeds immediately.
    Stub,
    Hardware,
}

/// What feeds a completion group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionGroupLinkage {
    Scheduler { scheduler: String, index: u32 },
    Direct { channel_id: u32 },
}

/// Stuck-engine detector resources attached to a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TdrState {
    pub sm_index: u32,
    pub so_index: u32,
    pub monitor_base: u32,
    pub cq_index: u32,
}

/// Snapshot of a completion group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionGroupInfo {
    pub name: String,
    pub scheduler: Option<String>,
    pub index_in_scheduler: Option<u32>,
    pub is_direct_mode: bool,
    pub sm_index: u32,
    pub sos_base: u32,
    pub sos_num: u32,
    pub monitor_base: u32,
    pub monitor_num: u32,
    pub cq_index: u32,
    pub global_cq_index: u32,
    pub counters_handle: u64,
    pub counter_device_address: u64,
    pub interrupt: Option<u32>,
    pub force_order: bool,
    pub current_value: u64,
}

/// Extended snapshot including watchdog state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionGroupInfoV2 {
    pub info: CompletionGroupInfo,
    pub tdr: Option<TdrState>,
    pub expected_counter: u64,
    pub fence_counter: Option<String>,
    pub is_stub: bool,
}

/// Resources assigned to a group at configuration time.
pub(crate) struct CompletionGroupParts {
    pub name: String,
    pub kind: GroupKind,
    pub linkage: CompletionGroupLinkage,
    pub sm_index: u32,
    pub sos: Range<u32>,
    pub monitors: Range<u32>,
    pub cq_index: u32,
    pub counter: Arc<CompletionCounter>,
    pub interrupt: Option<u32>,
    pub force_order: bool,
    pub tdr: Option<TdrState>,
}

/// Named completion counter with its wait protocol.
pub struct CompletionGroup {
    name: String,
    kind: GroupKind,
    linkage: CompletionGroupLinkage,
    sm_index: u32,
    sos: Range<u32>,
    monitors: Range<u32>,
    cq_index: u32,
    counter: Arc<CompletionCounter>,
    interrupt: AtomicU32,
    force_order: bool,
    tdr: Option<TdrState>,
    expected: AtomicU64,
    fence_counter: OnceLock<String>,
    logged: AtomicU8,
    ctx: Arc<WaitContext>,
}

impl std::fmt::Debug for CompletionGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionGroup")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("cq_index", &self.cq_index)
            .field("counter", &self.counter.load())
            .finish()
    }
}

enum Outcome {
    Reached,
    TimedOut,
}

impl CompletionGroup {
    pub(crate) fn new(parts: CompletionGroupParts, ctx: Arc<WaitContext>) -> Self {
        Self {
            name: parts.name,
            kind: parts.kind,
            linkage: parts.linkage,
            sm_index: parts.sm_index,
            sos: parts.sos,
            monitors: parts.monitors,
            cq_index: parts.cq_index,
            counter: parts.counter,
            interrupt: AtomicU32::new(parts.interrupt.unwrap_or(NO_INTERRUPT)),
            force_order: parts.force_order,
            tdr: parts.tdr,
            expected: AtomicU64::new(0),
            fence_counter: OnceLock::new(),
            logged: AtomicU8::new(0),
            ctx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    pub fn is_stub(&self) -> bool {
        self.kind == GroupKind::Stub
    }

    pub fn linkage(&self) -> &CompletionGroupLinkage {
        &self.linkage
    }

    pub fn scheduler(&self) -> Option<&str> {
        match &self.linkage {
            CompletionGroupLinkage::Scheduler { scheduler, .. } => Some(scheduler),
            CompletionGroupLinkage::Direct { .. } => None,
        }
    }

    pub fn sm_index(&self) -> u32 {
        self.sm_index
    }

    pub fn counter(&self) -> &Arc<CompletionCounter> {
        &self.counter
    }

    pub fn tdr(&self) -> Option<&TdrState> {
        self.tdr.as_ref()
    }

    /// Interrupt line the waits block on, `None` when busy-polling.
    pub fn interrupt(&self) -> Option<u32> {
        match self.interrupt.load(Ordering::Acquire) {
            NO_INTERRUPT => None,
            line => Some(line),
        }
    }

    pub(crate) fn set_interrupt(&self, line: Option<u32>) {
        self.interrupt
            .store(line.unwrap_or(NO_INTERRUPT), Ordering::Release);
    }

    pub(crate) fn attach_fence_counter(&self, name: &str) -> bool {
        self.fence_counter.set(name.to_string()).is_ok()
    }

    /// Number of completions the submitter expects, read by the background check.
    pub fn set_expected_counter(&self, value: u64) {
        self.expected.store(value, Ordering::Release);
    }

    pub fn expected_counter(&self) -> u64 {
        self.expected.load(Ordering::Acquire)
    }

    /// Wait until the counter reaches `target`.
    ///
    /// `timeout_us == 0` probes without blocking; `WAIT_FOREVER` waits
    /// until no completion group in scope makes progress.
    pub fn wait(&self, target: u64, timeout_us: u64) -> ScalResult<()> {
        self.wait_inner(target, timeout_us, false)
    }

    /// Like [`wait`](Self::wait), but always blocks on the driver so the
    /// interrupt is consumed even if the counter is already satisfied.
    pub fn wait_always_interrupt(&self, target: u64, timeout_us: u64) -> ScalResult<()> {
        self.wait_inner(target, timeout_us, true)
    }

    fn wait_inner(&self, target: u64, timeout_us: u64, always_interrupt: bool) -> ScalResult<()> {
        if self.is_stub() {
            return Ok(());
        }

        let interrupt = self.interrupt.load(Ordering::Acquire);
        let blocking = always_interrupt && interrupt != NO_INTERRUPT;
        if !blocking {
            if self.counter.load() >= target {
                log::trace!("'{}': fast path, target {target} reached", self.name);
                return Ok(());
            }
            if timeout_us == 0 {
                return Err(ScalError::TimedOut(format!(
                    "completion group '{}' below target {target}",
                    self.name
                )));
            }
        }

        let forever = timeout_us == WAIT_FOREVER;
        let mut snapshot: Option<Vec<u64>> = None;
        loop {
            let timeouts = self.ctx.timeouts.get();
            let budget_us = if forever {
                timeouts.no_progress_timeout_us.saturating_mul(2)
            } else {
                timeout_us
            };

            match self.wait_once(target, budget_us, interrupt)? {
                Outcome::Reached => return Ok(()),
                Outcome::TimedOut if self.counter.load() >= target && !blocking => return Ok(()),
                Outcome::TimedOut => {}
            }

            if !forever {
                self.report(
                    LoggedFailures::TIMED_OUT,
                    format_args!(
                        "'{}': timed out after {timeout_us} us waiting for {target}, counter {}",
                        self.name,
                        self.counter.load()
                    ),
                );
                return Err(ScalError::TimedOut(format!(
                    "completion group '{}' target {target} after {timeout_us} us",
                    self.name
                )));
            }

            let current = self.ctx.snapshot(self.scheduler());
            let progressed = match &snapshot {
                None => true,
                Some(prev) => prev.len() != current.len() || prev.iter().zip(&current).any(|(a, b)| b > a),
            };
            snapshot = Some(current);
            if progressed {
                log::debug!("'{}': still waiting for {target}, device is progressing", self.name);
                continue;
            }

            if self.report(
                LoggedFailures::NO_PROGRESS,
                format_args!(
                    "'{}': no progress while waiting for {target}, counter {}",
                    self.name,
                    self.counter.load()
                ),
            ) {
                self.ctx.log_counters(self.scheduler());
            }
            if timeouts.disabled {
                continue;
            }
            return Err(ScalError::TimedOut(format!(
                "completion group '{}' target {target}: no progress",
                self.name
            )));
        }
    }

    fn wait_once(&self, target: u64, budget_us: u64, interrupt: u32) -> ScalResult<Outcome> {
        if interrupt == NO_INTERRUPT {
            return Ok(self.busy_poll(target, budget_us));
        }

        let request = CounterWait {
            counters_handle: self.counter.block().handle(),
            counter_index: self.counter.index(),
            target,
            interrupt,
            timeout: Duration::from_micros(budget_us),
        };
        match self.ctx.driver.wait_for_counter(&request) {
            Ok(()) => Ok(Outcome::Reached),
            Err(DriverError::TimedOut) => Ok(Outcome::TimedOut),
            Err(e) => {
                self.report(
                    LoggedFailures::DRIVER_ERROR,
                    format_args!("'{}': driver wait on interrupt {interrupt} failed: {e}", self.name),
                );
                Err(ScalError::Failure(format!(
                    "completion group '{}' wait: {e}",
                    self.name
                )))
            }
        }
    }

    fn busy_poll(&self, target: u64, budget_us: u64) -> Outcome {
        let start = Instant::now();
        let budget = Duration::from_micros(budget_us);
        loop {
            for _ in 0..POLL_BATCH {
                if self.counter.load() >= target {
                    return Outcome::Reached;
                }
                std::hint::spin_loop();
            }
            if start.elapsed() >= budget {
                return Outcome::TimedOut;
            }
            std::thread::yield_now();
        }
    }

    /// Log at error level the first time `class` happens, debug afterwards.
    /// Returns true on the first occurrence.
    fn report(&self, class: LoggedFailures, msg: std::fmt::Arguments<'_>) -> bool {
        let prev = LoggedFailures::from_bits_truncate(self.logged.fetch_or(class.bits(), Ordering::AcqRel));
        if prev.contains(class) {
            log::debug!("{msg}");
            false
        } else {
            log::error!("{msg}");
            true
        }
    }

    /// Ask the driver to timestamp the moment the counter reaches `target`.
    pub fn register_timestamp(&self, target: u64, timestamps_handle: u64, timestamps_offset: u32) -> ScalResult<()> {
        if self.is_stub() {
            return Ok(());
        }
        let request = TimestampRequest {
            counters_handle: self.counter.block().handle(),
            counter_index: self.counter.index(),
            target,
            interrupt: self.interrupt.load(Ordering::Acquire),
            timestamps_handle,
            timestamps_offset,
        };
        self.ctx.driver.register_timestamp(&request).map_err(|e| match e {
            DriverError::Unsupported => ScalError::NotImplemented("timestamp registration"),
            e => ScalError::Failure(format!("completion group '{}' timestamp: {e}", self.name)),
        })
    }

    pub fn info(&self) -> CompletionGroupInfo {
        let (scheduler, index_in_scheduler) = match &self.linkage {
            CompletionGroupLinkage::Scheduler { scheduler, index } => (Some(scheduler.clone()), Some(*index)),
            CompletionGroupLinkage::Direct { .. } => (None, None),
        };
        CompletionGroupInfo {
            name: self.name.clone(),
            scheduler,
            index_in_scheduler,
            is_direct_mode: matches!(self.linkage, CompletionGroupLinkage::Direct { .. }),
            sm_index: self.sm_index,
            sos_base: self.sos.start,
            sos_num: self.sos.len() as u32,
            monitor_base: self.monitors.start,
            monitor_num: self.monitors.len() as u32,
            cq_index: self.cq_index,
            global_cq_index: self.counter.index(),
            counters_handle: self.counter.block().handle(),
            counter_device_address: self.counter.block().slot_device_address(self.counter.index()),
            interrupt: self.interrupt(),
            force_order: self.force_order,
            current_value: self.counter.load(),
        }
    }

    pub fn info_v2(&self) -> CompletionGroupInfoV2 {
        CompletionGroupInfoV2 {
            info: self.info(),
            tdr: self.tdr,
            expected_counter: self.expected_counter(),
            fence_counter: self.fence_counter.get().cloned(),
            is_stub: self.is_stub(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sim::SimDevice;
    use std::thread;

    pub(crate) struct Fixture {
        pub dev: Arc<SimDevice>,
        pub block: Arc<CounterBlock>,
        pub ctx: Arc<WaitContext>,
    }

    impl Fixture {
        pub(crate) fn new(timeouts: Timeouts) -> Self {
            let dev = Arc::new(SimDevice::new());
            let block = dev.allocate_counters(8).unwrap();
            let driver: Arc<dyn DeviceDriver> = dev.clone();
            let ctx = Arc::new(WaitContext::new(driver, timeouts, ProgressScope::All));
            Self { dev, block, ctx }
        }

        pub(crate) fn group(&self, name: &str, slot: u32, interrupt: Option<u32>, kind: GroupKind) -> Arc<CompletionGroup> {
            let parts = CompletionGroupParts {
                name: name.to_string(),
                kind,
                linkage: CompletionGroupLinkage::Scheduler {
                    scheduler: "sched0".into(),
                    index: slot,
                },
                sm_index: 0,
                sos: 0..4,
                monitors: 0..2,
                cq_index: slot,
                counter: Arc::new(CompletionCounter::new(Arc::clone(&self.block), slot)),
                interrupt,
                force_order: false,
                tdr: None,
            };
            let cg = Arc::new(CompletionGroup::new(parts, Arc::clone(&self.ctx)));
            self.ctx.watch(&cg);
            cg
        }
    }

    fn short_watchdog() -> Timeouts {
        Timeouts {
            timeout_us: 10_000,
            no_progress_timeout_us: 10_000,
            disabled: false,
        }
    }

    #[test]
    fn test_fast_path_skips_driver() {
        let fx = Fixture::new(Timeouts::default());
        let cg = fx.group("cg0", 0, Some(3), GroupKind::Hardware);
        fx.dev.signal(0, 5);
        cg.wait(3, 1_000_000).unwrap();
        cg.wait(5, 0).unwrap();
        assert_eq!(fx.dev.wait_calls(), 0);
    }

    #[test]
    fn test_zero_timeout_probe() {
        let fx = Fixture::new(Timeouts::default());
        let cg = fx.group("cg0", 0, Some(3), GroupKind::Hardware);
        let err = cg.wait(1, 0).unwrap_err();
        assert!(matches!(err, ScalError::TimedOut(_)));
        assert_eq!(fx.dev.wait_calls(), 0);
    }

    #[test]
    fn test_counter_is_monotonic() {
        let fx = Fixture::new(Timeouts::default());
        let cg = fx.group("cg0", 0, None, GroupKind::Hardware);
        fx.block.store(0, 10);
        assert_eq!(cg.counter().load(), 10);
        fx.block.store(0, 4);
        assert_eq!(cg.counter().load(), 10);
        assert!(cg.wait(9, 0).is_ok());
    }

    #[test]
    fn test_interrupt_wait_wakes_after_signal() {
        let fx = Fixture::new(Timeouts::default());
        let cg = fx.group("cg0", 0, Some(1), GroupKind::Hardware);
        let dev = Arc::clone(&fx.dev);
        let start = Instant::now();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            dev.signal(0, 5);
        });
        cg.wait(5, 1_000_000).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(fx.dev.wait_calls(), 1);
        t.join().unwrap();
    }

    #[test]
    fn test_polling_wait_never_calls_driver() {
        let fx = Fixture::new(Timeouts::default());
        let cg = fx.group("cg0", 0, None, GroupKind::Hardware);
        let dev = Arc::clone(&fx.dev);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            dev.signal(0, 2);
        });
        cg.wait(2, 2_000_000).unwrap();
        t.join().unwrap();
        assert_eq!(fx.dev.wait_calls(), 0);
        assert!(cg.wait(3, 1_000).is_err());
    }

    #[test]
    fn test_bounded_wait_times_out() {
        let fx = Fixture::new(Timeouts::default());
        let cg = fx.group("cg0", 0, Some(1), GroupKind::Hardware);
        let err = cg.wait(1, 2_000).unwrap_err();
        assert_eq!(err.status(), crate::error::ScalStatus::TimedOut);
    }

    #[test]
    fn test_driver_error_is_failure() {
        let fx = Fixture::new(Timeouts::default());
        let cg = fx.group("cg0", 0, Some(1), GroupKind::Hardware);
        fx.dev.fail_next_wait(DriverError::Os(5));
        let err = cg.wait(1, 1_000_000).unwrap_err();
        assert_eq!(err.status(), crate::error::ScalStatus::Failure);
    }

    #[test]
    fn test_stub_always_succeeds() {
        let fx = Fixture::new(Timeouts::default());
        let cg = fx.group("stub", 0, Some(1), GroupKind::Stub);
        cg.wait(100, 0).unwrap();
        cg.wait(100, WAIT_FOREVER).unwrap();
        cg.register_timestamp(1, 2, 3).unwrap();
        assert_eq!(fx.dev.wait_calls(), 0);
        assert!(fx.dev.timestamps().is_empty());
    }

    #[test]
    fn test_always_interrupt_calls_driver() {
        let fx = Fixture::new(Timeouts::default());
        let cg = fx.group("cg0", 0, Some(1), GroupKind::Hardware);
        fx.dev.signal(0, 4);
        cg.wait_always_interrupt(4, 1_000_000).unwrap();
        assert_eq!(fx.dev.wait_calls(), 1);
    }

    #[test]
    fn test_forever_fails_without_progress() {
        let fx = Fixture::new(short_watchdog());
        let cg = fx.group("cg0", 0, Some(1), GroupKind::Hardware);
        let _other = fx.group("cg1", 1, Some(2), GroupKind::Hardware);
        let start = Instant::now();
        let err = cg.wait(1, WAIT_FOREVER).unwrap_err();
        assert!(matches!(err, ScalError::TimedOut(_)));
        // one timeout to take the snapshot, one to compare it
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(fx.dev.wait_calls(), 2);
    }

    #[test]
    fn test_forever_keeps_waiting_while_others_progress() {
        let fx = Fixture::new(Timeouts {
            timeout_us: 25_000,
            no_progress_timeout_us: 25_000,
            disabled: false,
        });
        let cg = fx.group("cg0", 0, Some(1), GroupKind::Hardware);
        let _other = fx.group("cg1", 1, Some(2), GroupKind::Hardware);
        let dev = Arc::clone(&fx.dev);
        let t = thread::spawn(move || {
            for i in 1..=30 {
                thread::sleep(Duration::from_millis(5));
                dev.signal(1, i);
            }
            dev.signal(0, 1);
        });
        cg.wait(1, WAIT_FOREVER).unwrap();
        t.join().unwrap();
        assert!(fx.dev.wait_calls() >= 2);
    }

    #[test]
    fn test_forever_with_timeouts_disabled() {
        let mut timeouts = short_watchdog();
        timeouts.disabled = true;
        let fx = Fixture::new(timeouts);
        let cg = fx.group("cg0", 0, Some(1), GroupKind::Hardware);
        let dev = Arc::clone(&fx.dev);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(90));
            dev.signal(0, 1);
        });
        cg.wait(1, WAIT_FOREVER).unwrap();
        t.join().unwrap();
    }

    #[test]
    fn test_same_scheduler_scope_ignores_other_schedulers() {
        let dev = Arc::new(SimDevice::new());
        let block = dev.allocate_counters(4).unwrap();
        let driver: Arc<dyn DeviceDriver> = dev.clone();
        let ctx = Arc::new(WaitContext::new(driver, short_watchdog(), ProgressScope::SameScheduler));
        let make = |name: &str, sched: &str, slot: u32| {
            let cg = Arc::new(CompletionGroup::new(
                CompletionGroupParts {
                    name: name.into(),
                    kind: GroupKind::Hardware,
                    linkage: CompletionGroupLinkage::Scheduler {
                        scheduler: sched.into(),
                        index: 0,
                    },
                    sm_index: 0,
                    sos: 0..1,
                    monitors: 0..1,
                    cq_index: slot,
                    counter: Arc::new(CompletionCounter::new(Arc::clone(&block), slot)),
                    interrupt: Some(slot),
                    force_order: false,
                    tdr: None,
                },
                Arc::clone(&ctx),
            ));
            ctx.watch(&cg);
            cg
        };
        let cg = make("a", "sched0", 0);
        let _b = make("b", "sched1", 1);
        let d = Arc::clone(&dev);
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let s = Arc::clone(&stop);
        let t = thread::spawn(move || {
            let mut i = 0;
            while !s.load(Ordering::Acquire) {
                i += 1;
                d.signal(1, i);
                thread::sleep(Duration::from_millis(5));
            }
        });
        assert!(cg.wait(1, WAIT_FOREVER).is_err());
        stop.store(true, Ordering::Release);
        t.join().unwrap();
    }

    #[test]
    fn test_info_and_expected_counter() {
        let fx = Fixture::new(Timeouts::default());
        let cg = fx.group("cg3", 3, None, GroupKind::Hardware);
        fx.dev.signal(3, 7);
        cg.set_expected_counter(9);
        assert!(cg.attach_fence_counter("fence0"));
        assert!(!cg.attach_fence_counter("fence1"));
        let v2 = cg.info_v2();
        assert_eq!(v2.info.name, "cg3");
        assert_eq!(v2.info.current_value, 7);
        assert_eq!(v2.info.interrupt, None);
        assert_eq!(v2.info.sos_num, 4);
        assert_eq!(v2.info.scheduler.as_deref(), Some("sched0"));
        assert_eq!(v2.expected_counter, 9);
        assert_eq!(v2.fence_counter.as_deref(), Some("fence0"));
        assert!(!v2.is_stub);
    }

    #[test]
    fn test_register_timestamp_forwards_to_driver() {
        let fx = Fixture::new(Timeouts::default());
        let cg = fx.group("cg0", 2, Some(4), GroupKind::Hardware);
        cg.register_timestamp(10, 0xabc, 16).unwrap();
        let ts = fx.dev.timestamps();
        assert_eq!(ts.len(), 1);
        assert_eq!(ts[0].counter_index, 2);
        assert_eq!(ts[0].target, 10);
        assert_eq!(ts[0].interrupt, 4);
    }
}
