// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Submission streams.
//!
//! A stream is a ring buffer the host fills and a core drains. The host only
//! publishes a producer index (PI); the device reports its consumer index
//! (CI) in a register.
//!
//! # PI wraparound
//!
//! Callers submit a monotonic *logical* PI. The hardware PI register has a
//! limited range, so the runtime keeps `hw_pi = logical_pi - hw_pi_offset`.
//! When the next hardware PI would leave the register range the ring is
//! rebased: CI is reset to the in-buffer position of the last committed PI,
//! and PI is recommitted relative to it. `hw_pi_offset` only ever grows by a
//! multiple of the buffer size, so every logical PI keeps its physical slot.
//!
//! The rebase must wait until the consumer has drained the old PI. If it
//! has not after a short spin, a background task finishes the rebase; until
//! then submissions only record their PI.

use crate::driver::DeviceDriver;
use crate::error::{ScalError, ScalResult};
use crate::pool::{Buffer, BufferInfo};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Smallest ring buffer.
pub const MIN_BUFFER_SIZE: u64 = 1 << 16;
/// Largest ring buffer of a scheduler stream.
pub const MAX_SCHEDULER_BUFFER_SIZE: u64 = 1 << 24;
/// Largest ring buffer of a direct-mode stream.
pub const MAX_DIRECT_BUFFER_SIZE: u64 = 1 << 30;
/// Range of a 32-bit PI register.
pub const DEFAULT_HW_PI_RANGE: u64 = 1 << 32;

/// CI reads before the rebase is handed to the background task.
const CATCH_UP_SPIN_RETRIES: u32 = 1024;

const REBASE_POLL_INTERVAL: Duration = Duration::from_micros(50);

const REBASE_WARN_AFTER: Duration = Duration::from_secs(1);

/// Stream priority as understood by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamPriority(pub u32);

impl StreamPriority {
    pub const HIGH: StreamPriority = StreamPriority(1);
    pub const LOW: StreamPriority = StreamPriority(2);
}

impl Default for StreamPriority {
    fn default() -> Self {
        StreamPriority::LOW
    }
}

/// Register addresses of one ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingRegisters {
    pub pi: u64,
    pub ci: u64,
    pub base_lo: u64,
    pub base_hi: u64,
    pub size: u64,
    pub priority: Option<u64>,
}

/// Who drains a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOwner {
    Scheduler { core: String, index: u32 },
    Direct { channel_id: u32 },
}

/// Snapshot of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    pub scheduler: Option<String>,
    pub index: Option<u32>,
    pub is_direct_mode: bool,
    pub current_pi: u64,
    pub hw_pi: u64,
    pub buffer: BufferInfo,
    /// Buffer size in 64 KiB units.
    pub submission_alignment: u64,
    pub priority: StreamPriority,
    pub rebases: u64,
}

struct Ring {
    name: String,
    regs: RingRegisters,
    driver: Arc<dyn DeviceDriver>,
    hw_pi_range: u64,
    buffer_size: AtomicU64,
    local_pi: AtomicU64,
    hw_pi: AtomicU64,
    hw_pi_offset: AtomicU64,
    rebase_pending: AtomicBool,
    /// Latest PI submitted while a rebase is pending.
    pending_pi: Mutex<Option<u64>>,
    shutdown: AtomicBool,
    rebases: AtomicU64,
}

impl Ring {
    #[inline]
    fn commit_pi(&self, hw_pi: u64) {
        self.driver.write_register(self.regs.pi, hw_pi as u32);
    }

    #[inline]
    fn consumer_caught_up(&self, hw_pi: u64) -> bool {
        u64::from(self.driver.read_register(self.regs.ci)) == hw_pi
    }

    /// Logical PI of the last value written to the PI register.
    #[inline]
    fn committed_pi(&self) -> u64 {
        self.hw_pi.load(Ordering::Acquire) + self.hw_pi_offset.load(Ordering::Acquire)
    }

    /// The consumer can be at most one buffer behind `base`.
    fn check_advance(&self, pi: u64, base: u64, size: u64) -> ScalResult<()> {
        if pi - base > size {
            return Err(ScalError::InvalidParam(format!(
                "stream '{}': PI {pi:#x} is more than one {size:#x} byte buffer past {base:#x}",
                self.name
            )));
        }
        Ok(())
    }

    /// Rebase once the consumer has drained `stale_hw`.
    fn rebase(&self, target: u64, stale_hw: u64) {
        let size = self.buffer_size.load(Ordering::Acquire);
        let remainder = stale_hw & (size - 1);
        let committed = stale_hw + self.hw_pi_offset.load(Ordering::Acquire);
        let new_hw = remainder + (target - committed);
        debug_assert!(new_hw < self.hw_pi_range);

        // stale_hw and remainder address the same slot
        self.driver.write_register(self.regs.ci, remainder as u32);
        self.hw_pi_offset.store(target - new_hw, Ordering::Release);
        self.hw_pi.store(new_hw, Ordering::Release);
        self.commit_pi(new_hw);
        let n = self.rebases.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!(
            "stream '{}': rebase #{n}, hw PI {stale_hw:#x} -> {new_hw:#x} for logical PI {target:#x}",
            self.name
        );
    }

    fn finish_rebase(&self, stale_hw: u64) {
        let start = Instant::now();
        let mut warned = false;
        while !self.consumer_caught_up(stale_hw) {
            if self.shutdown.load(Ordering::Acquire) {
                let mut pending = self.pending_pi.lock();
                pending.take();
                self.rebase_pending.store(false, Ordering::Release);
                log::debug!("stream '{}': rebase abandoned on shutdown", self.name);
                return;
            }
            if !warned && start.elapsed() >= REBASE_WARN_AFTER {
                log::warn!(
                    "stream '{}': consumer still behind hw PI {stale_hw:#x} after {:?}",
                    self.name,
                    start.elapsed()
                );
                warned = true;
            }
            thread::sleep(REBASE_POLL_INTERVAL);
        }

        let mut pending = self.pending_pi.lock();
        if let Some(target) = pending.take() {
            self.rebase(target, stale_hw);
        }
        self.rebase_pending.store(false, Ordering::Release);
    }
}

#[cfg(test)]
thread_local! {
    static REFUSE_NEXT_SPAWN: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

fn spawn_worker<F>(name: String, f: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    #[cfg(test)]
    {
        if REFUSE_NEXT_SPAWN.with(|refuse| refuse.replace(false)) {
            return Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "thread limit reached"));
        }
    }
    thread::Builder::new().name(name).spawn(f)
}

/// Ring-buffer submission queue.
pub struct Stream {
    ring: Arc<Ring>,
    owner: StreamOwner,
    stub: bool,
    binding: Mutex<Option<Arc<Buffer>>>,
    priority: AtomicU32,
    rebase_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.ring.name)
            .field("owner", &self.owner)
            .field("local_pi", &self.ring.local_pi.load(Ordering::Relaxed))
            .field("hw_pi", &self.ring.hw_pi.load(Ordering::Relaxed))
            .finish()
    }
}

impl Stream {
    pub(crate) fn new(
        name: String,
        owner: StreamOwner,
        regs: RingRegisters,
        priority: StreamPriority,
        hw_pi_range: Option<u64>,
        stub: bool,
        driver: Arc<dyn DeviceDriver>,
    ) -> ScalResult<Self> {
        let hw_pi_range = hw_pi_range.unwrap_or(DEFAULT_HW_PI_RANGE);
        if !hw_pi_range.is_power_of_two()
            || hw_pi_range > DEFAULT_HW_PI_RANGE
            || hw_pi_range < 2 * MIN_BUFFER_SIZE
        {
            return Err(ScalError::InvalidConfig(format!(
                "stream '{name}': hw PI range {hw_pi_range:#x} is not a power of two in [{:#x}, {DEFAULT_HW_PI_RANGE:#x}]",
                2 * MIN_BUFFER_SIZE
            )));
        }
        Ok(Self {
            ring: Arc::new(Ring {
                name,
                regs,
                driver,
                hw_pi_range,
                buffer_size: AtomicU64::new(0),
                local_pi: AtomicU64::new(0),
                hw_pi: AtomicU64::new(0),
                hw_pi_offset: AtomicU64::new(0),
                rebase_pending: AtomicBool::new(false),
                pending_pi: Mutex::new(None),
                shutdown: AtomicBool::new(false),
                rebases: AtomicU64::new(0),
            }),
            owner,
            stub,
            binding: Mutex::new(None),
            priority: AtomicU32::new(priority.0),
            rebase_task: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.ring.name
    }

    pub fn owner(&self) -> &StreamOwner {
        &self.owner
    }

    pub fn is_direct_mode(&self) -> bool {
        matches!(self.owner, StreamOwner::Direct { .. })
    }

    pub fn registers(&self) -> &RingRegisters {
        &self.ring.regs
    }

    /// Last logical PI accepted.
    pub fn current_pi(&self) -> u64 {
        self.ring.local_pi.load(Ordering::Acquire)
    }

    /// Last PI written to the hardware register.
    pub fn hw_pi(&self) -> u64 {
        self.ring.hw_pi.load(Ordering::Acquire)
    }

    pub fn rebase_pending(&self) -> bool {
        self.ring.rebase_pending.load(Ordering::Acquire)
    }

    /// Completed PI rebases.
    pub fn rebases(&self) -> u64 {
        self.ring.rebases.load(Ordering::Acquire)
    }

    pub fn buffer(&self) -> Option<Arc<Buffer>> {
        self.binding.lock().clone()
    }

    pub fn priority(&self) -> StreamPriority {
        StreamPriority(self.priority.load(Ordering::Acquire))
    }

    /// Bind the ring buffer.
    ///
    /// The size must be a power of two within the owner's limits. Rebinding
    /// is refused while the consumer has not drained the current buffer.
    pub fn set_buffer(&self, buffer: Arc<Buffer>) -> ScalResult<()> {
        let size = buffer.size();
        let max = if self.is_direct_mode() {
            MAX_DIRECT_BUFFER_SIZE
        } else {
            MAX_SCHEDULER_BUFFER_SIZE
        };
        if !size.is_power_of_two() || !(MIN_BUFFER_SIZE..=max).contains(&size) {
            return Err(ScalError::InvalidParam(format!(
                "stream '{}': buffer size {size:#x} must be a power of two in [{MIN_BUFFER_SIZE:#x}, {max:#x}]",
                self.name()
            )));
        }
        if self.ring.hw_pi_range < 2 * size {
            return Err(ScalError::InvalidParam(format!(
                "stream '{}': buffer size {size:#x} too large for hw PI range {:#x}",
                self.name(),
                self.ring.hw_pi_range
            )));
        }
        let address = if self.is_direct_mode() {
            buffer.device_address()
        } else {
            buffer.core_address().map(u64::from).ok_or_else(|| {
                ScalError::InvalidParam(format!(
                    "stream '{}': pool '{}' is not mapped to the cores",
                    self.name(),
                    buffer.pool().name()
                ))
            })?
        };

        let mut binding = self.binding.lock();
        let ring = &self.ring;
        if self.stub {
            ring.buffer_size.store(size, Ordering::Release);
            *binding = Some(buffer);
            return Ok(());
        }
        if binding.is_some()
            && (ring.rebase_pending.load(Ordering::Acquire)
                || !ring.consumer_caught_up(ring.hw_pi.load(Ordering::Acquire)))
        {
            return Err(ScalError::InvalidParam(format!(
                "stream '{}': cannot rebind a buffer with work in flight",
                self.name()
            )));
        }

        let driver = &ring.driver;
        driver.write_register(ring.regs.base_lo, address as u32);
        driver.write_register(ring.regs.base_hi, (address >> 32) as u32);
        driver.write_register(ring.regs.size, size as u32);
        driver.write_register(ring.regs.ci, 0);
        ring.commit_pi(0);
        // the new ring starts at slot 0
        ring.hw_pi_offset
            .store(ring.local_pi.load(Ordering::Acquire), Ordering::Release);
        ring.hw_pi.store(0, Ordering::Release);
        ring.buffer_size.store(size, Ordering::Release);
        log::debug!(
            "stream '{}': bound {size:#x} byte buffer at {address:#x}",
            self.name()
        );
        *binding = Some(buffer);
        Ok(())
    }

    /// Set the scheduling priority. Scheduler streams accept only
    /// [`StreamPriority::HIGH`] and [`StreamPriority::LOW`].
    pub fn set_priority(&self, priority: StreamPriority) -> ScalResult<()> {
        if !self.is_direct_mode() {
            if priority != StreamPriority::HIGH && priority != StreamPriority::LOW {
                return Err(ScalError::InvalidParam(format!(
                    "stream '{}': invalid priority {}",
                    self.name(),
                    priority.0
                )));
            }
            if let (Some(reg), false) = (self.ring.regs.priority, self.stub) {
                self.ring.driver.write_register(reg, priority.0);
            }
        }
        self.priority.store(priority.0, Ordering::Release);
        Ok(())
    }

    /// Publish logical PI `pi`.
    ///
    /// A stream has a single producer. `alignment` is the submission unit of
    /// scheduler streams; direct-mode streams ignore it.
    pub fn submit(&self, pi: u64, alignment: u64) -> ScalResult<()> {
        let ring = &self.ring;
        if !self.is_direct_mode() && (!alignment.is_power_of_two() || pi & (alignment - 1) != 0) {
            return Err(ScalError::InvalidParam(format!(
                "stream '{}': PI {pi:#x} not aligned to {alignment}",
                ring.name
            )));
        }
        let size = ring.buffer_size.load(Ordering::Acquire);
        if size == 0 {
            return Err(ScalError::InvalidParam(format!(
                "stream '{}': no buffer bound",
                ring.name
            )));
        }
        if pi < ring.local_pi.load(Ordering::Acquire) {
            return Err(ScalError::InvalidParam(format!(
                "stream '{}': PI {pi:#x} moved backwards",
                ring.name
            )));
        }
        if self.stub {
            ring.check_advance(pi, ring.local_pi.load(Ordering::Acquire), size)?;
            ring.local_pi.store(pi, Ordering::Release);
            return Ok(());
        }

        if ring.rebase_pending.load(Ordering::Acquire) {
            let mut pending = ring.pending_pi.lock();
            if ring.rebase_pending.load(Ordering::Acquire) {
                ring.check_advance(pi, ring.committed_pi(), size)?;
                *pending = Some(pi);
                ring.local_pi.store(pi, Ordering::Release);
                return Ok(());
            }
        }
        ring.check_advance(pi, ring.committed_pi(), size)?;

        let candidate = pi - ring.hw_pi_offset.load(Ordering::Acquire);
        if candidate < ring.hw_pi_range {
            ring.commit_pi(candidate);
            ring.hw_pi.store(candidate, Ordering::Release);
            ring.local_pi.store(pi, Ordering::Release);
            log::trace!("stream '{}': PI {pi:#x} (hw {candidate:#x})", ring.name);
            return Ok(());
        }

        // the register would read back smaller than the previous PI
        self.wraparound(pi)
    }

    fn wraparound(&self, pi: u64) -> ScalResult<()> {
        let ring = &self.ring;
        let stale_hw = ring.hw_pi.load(Ordering::Acquire);

        for _ in 0..=CATCH_UP_SPIN_RETRIES {
            if ring.consumer_caught_up(stale_hw) {
                ring.rebase(pi, stale_hw);
                ring.local_pi.store(pi, Ordering::Release);
                return Ok(());
            }
            std::hint::spin_loop();
        }

        log::debug!(
            "stream '{}': consumer behind hw PI {stale_hw:#x}, deferring rebase",
            ring.name
        );
        self.spawn_rebase(pi, stale_hw)
    }

    fn spawn_rebase(&self, pi: u64, stale_hw: u64) -> ScalResult<()> {
        let mut task = self.rebase_task.lock();
        if let Some(previous) = task.take() {
            if previous.join().is_err() {
                log::error!("stream '{}': previous rebase task panicked", self.name());
            }
        }

        *self.ring.pending_pi.lock() = Some(pi);
        self.ring.rebase_pending.store(true, Ordering::Release);
        let rollback = scopeguard::guard(Arc::clone(&self.ring), |ring| {
            ring.pending_pi.lock().take();
            ring.rebase_pending.store(false, Ordering::Release);
        });

        let worker = Arc::clone(&self.ring);
        let handle = spawn_worker(format!("scal-rebase-{}", self.name()), move || {
            worker.finish_rebase(stale_hw)
        })?;
        scopeguard::ScopeGuard::into_inner(rollback);
        self.ring.local_pi.store(pi, Ordering::Release);
        *task = Some(handle);
        Ok(())
    }

    pub fn info(&self) -> ScalResult<StreamInfo> {
        let buffer = self.buffer().ok_or_else(|| {
            ScalError::Failure(format!("stream '{}': no buffer bound", self.name()))
        })?;
        let (scheduler, index) = match &self.owner {
            StreamOwner::Scheduler { core, index } => (Some(core.clone()), Some(*index)),
            StreamOwner::Direct { .. } => (None, None),
        };
        Ok(StreamInfo {
            name: self.name().to_string(),
            scheduler,
            index,
            is_direct_mode: self.is_direct_mode(),
            current_pi: self.current_pi(),
            hw_pi: self.hw_pi(),
            submission_alignment: buffer.size() >> 16,
            buffer: buffer.info(),
            priority: self.priority(),
            rebases: self.rebases(),
        })
    }

    /// Stop a pending background rebase.
    pub(crate) fn shutdown(&self) {
        self.ring.shutdown.store(true, Ordering::Release);
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(task) = self.rebase_task.get_mut().take() {
            if task.join().is_err() {
                log::error!("stream '{}': rebase task panicked", self.ring.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Pool, PoolKind};
    use crate::sim::SimDevice;
    use crate::topology::PoolDesc;

    const S: u64 = MIN_BUFFER_SIZE;

    const REGS: RingRegisters = RingRegisters {
        pi: 0x100,
        ci: 0x104,
        base_lo: 0x108,
        base_hi: 0x10c,
        size: 0x110,
        priority: Some(0x114),
    };

    fn pool() -> Arc<Pool> {
        let desc = PoolDesc {
            name: "hbm".into(),
            kind: PoolKind::Hbm,
            size: 16 * S,
            device_base: 0x1_0000_0000,
            core_base: 0x1000_0000,
        };
        Arc::new(Pool::new(0, &desc).unwrap())
    }

    fn stream(dev: &Arc<SimDevice>, owner: StreamOwner, range: u64) -> Stream {
        let driver: Arc<dyn DeviceDriver> = dev.clone();
        Stream::new(
            "s0".into(),
            owner,
            REGS,
            StreamPriority::LOW,
            Some(range),
            false,
            driver,
        )
        .unwrap()
    }

    fn direct() -> StreamOwner {
        StreamOwner::Direct { channel_id: 0 }
    }

    fn sched() -> StreamOwner {
        StreamOwner::Scheduler {
            core: "sched0".into(),
            index: 0,
        }
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < Duration::from_secs(5), "condition never met");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_buffer_validation() {
        let dev = Arc::new(SimDevice::new());
        let s = stream(&dev, sched(), DEFAULT_HW_PI_RANGE);
        let p = pool();
        assert!(s.set_buffer(p.allocate(S / 2).unwrap()).is_err());
        assert!(s.set_buffer(p.allocate(S + 4096).unwrap()).is_err());
        assert!(s.submit(0, 1).is_err());
        assert!(s.info().is_err());

        let hbm_only = Arc::new(
            Pool::new(
                1,
                &PoolDesc {
                    name: "hbm_ext".into(),
                    kind: PoolKind::HbmExternal,
                    size: 2 * S,
                    device_base: 0x2_0000_0000,
                    core_base: 0,
                },
            )
            .unwrap(),
        );
        assert!(s.set_buffer(hbm_only.allocate(S).unwrap()).is_err());

        s.set_buffer(p.allocate(S).unwrap()).unwrap();
        assert_eq!(dev.read_register(REGS.size), S as u32);
        assert_eq!(dev.read_register(REGS.base_lo), 0x1000_0000);
        assert_eq!(s.info().unwrap().submission_alignment, 1);
    }

    #[test]
    fn test_submit_commits_pi() {
        let dev = Arc::new(SimDevice::new());
        let s = stream(&dev, direct(), DEFAULT_HW_PI_RANGE);
        s.set_buffer(pool().allocate_aligned(S, S).unwrap()).unwrap();
        s.submit(100, 0).unwrap();
        s.submit(100, 0).unwrap();
        assert_eq!(dev.read_register(REGS.pi), 100);
        assert!(matches!(s.submit(99, 0), Err(ScalError::InvalidParam(_))));
        let info = s.info().unwrap();
        assert_eq!(info.current_pi, 100);
        assert!(info.is_direct_mode);
        assert_eq!(info.buffer.device_address, 0x1_0000_0000);
    }

    #[test]
    fn test_scheduler_alignment() {
        let dev = Arc::new(SimDevice::new());
        let s = stream(&dev, sched(), DEFAULT_HW_PI_RANGE);
        s.set_buffer(pool().allocate(S).unwrap()).unwrap();
        assert!(s.submit(100, 64).is_err());
        assert!(s.submit(128, 0).is_err());
        s.submit(128, 64).unwrap();
        assert_eq!(dev.read_register(REGS.pi), 128);
    }

    #[test]
    fn test_wraparound_preserves_physical_position() {
        let dev = Arc::new(SimDevice::new());
        dev.link_drain(REGS.pi, REGS.ci);
        dev.set_auto_drain(true);
        let range = 4 * S;
        let s = stream(&dev, direct(), range);
        s.set_buffer(pool().allocate_aligned(S, S).unwrap()).unwrap();
        dev.clear_writes();

        let mut pi = 0;
        while pi < 5 * range {
            pi += 3000;
            s.submit(pi, 0).unwrap();
            let hw = u64::from(dev.read_register(REGS.pi));
            assert!(hw < range);
            assert_eq!(hw % S, pi % S);
        }

        let pis = dev.writes_to(REGS.pi);
        let drops = pis.windows(2).filter(|w| w[1] < w[0]).count() as u64;
        assert!(s.rebases() >= 4);
        assert_eq!(drops, s.rebases());
        assert_eq!(dev.writes_to(REGS.ci).len() as u64, s.rebases());
        assert!(!s.rebase_pending());
    }

    #[test]
    fn test_stalled_consumer_defers_rebase() {
        let dev = Arc::new(SimDevice::new());
        let s = stream(&dev, direct(), 2 * S);
        s.set_buffer(pool().allocate_aligned(S, S).unwrap()).unwrap();

        s.submit(S, 0).unwrap();
        dev.write_register(REGS.ci, S as u32);
        // consumer drained: immediate rebase
        s.submit(2 * S, 0).unwrap();
        assert_eq!(s.rebases(), 1);
        assert_eq!(dev.read_register(REGS.pi), S as u32);

        s.submit(3 * S - 4096, 0).unwrap();
        let stale = 2 * S - 4096;
        assert_eq!(dev.read_register(REGS.pi), stale as u32);

        s.submit(3 * S, 0).unwrap();
        assert!(s.rebase_pending());
        s.submit(3 * S + 100, 0).unwrap();
        assert_eq!(s.current_pi(), 3 * S + 100);
        assert_eq!(dev.read_register(REGS.pi), stale as u32);

        dev.write_register(REGS.ci, stale as u32);
        wait_for(|| !s.rebase_pending());
        assert_eq!(s.rebases(), 2);
        assert_eq!(dev.read_register(REGS.ci), (S - 4096) as u32);
        assert_eq!(dev.read_register(REGS.pi), (S + 100) as u32);

        s.submit(3 * S + 200, 0).unwrap();
        assert_eq!(dev.read_register(REGS.pi), (S + 200) as u32);
    }

    #[test]
    fn test_drop_abandons_pending_rebase() {
        let dev = Arc::new(SimDevice::new());
        let s = stream(&dev, direct(), 2 * S);
        s.set_buffer(pool().allocate_aligned(S, S).unwrap()).unwrap();
        s.submit(10, 0).unwrap();
        s.submit(S + 10, 0).unwrap();
        s.submit(2 * S + 10, 0).unwrap();
        assert!(s.rebase_pending());
        drop(s);
    }

    #[test]
    fn test_submit_rejects_advance_past_ring() {
        let dev = Arc::new(SimDevice::new());
        let s = stream(&dev, direct(), DEFAULT_HW_PI_RANGE);
        s.set_buffer(pool().allocate_aligned(S, S).unwrap()).unwrap();
        dev.clear_writes();

        assert!(matches!(s.submit(3 * S, 0), Err(ScalError::InvalidParam(_))));
        assert!(dev.writes_to(REGS.pi).is_empty());
        assert_eq!(s.current_pi(), 0);

        s.submit(S, 0).unwrap();
        assert_eq!(dev.read_register(REGS.pi), S as u32);
        assert!(s.submit(2 * S + 1, 0).is_err());
        s.submit(2 * S, 0).unwrap();
    }

    #[test]
    fn test_rebase_rejects_oversized_jump() {
        let dev = Arc::new(SimDevice::new());
        let s = stream(&dev, direct(), 2 * S);
        s.set_buffer(pool().allocate_aligned(S, S).unwrap()).unwrap();
        s.submit(S, 0).unwrap();
        dev.write_register(REGS.ci, S as u32);

        assert!(matches!(s.submit(3 * S, 0), Err(ScalError::InvalidParam(_))));
        assert_eq!(s.rebases(), 0);
        assert_eq!(s.current_pi(), S);

        s.submit(2 * S, 0).unwrap();
        assert_eq!(s.rebases(), 1);
        assert_eq!(dev.read_register(REGS.pi), S as u32);
    }

    #[test]
    fn test_pending_submit_bounded_by_committed_pi() {
        let dev = Arc::new(SimDevice::new());
        let s = stream(&dev, direct(), 2 * S);
        s.set_buffer(pool().allocate_aligned(S, S).unwrap()).unwrap();
        s.submit(S, 0).unwrap();
        s.submit(2 * S, 0).unwrap();
        assert!(s.rebase_pending());

        // the device still holds hw PI S
        assert!(s.submit(2 * S + 4096, 0).is_err());
        assert_eq!(s.current_pi(), 2 * S);

        dev.write_register(REGS.ci, S as u32);
        wait_for(|| !s.rebase_pending());
        assert_eq!(dev.read_register(REGS.pi), S as u32);
        s.submit(2 * S + 4096, 0).unwrap();
        assert_eq!(dev.read_register(REGS.pi), (S + 4096) as u32);
    }

    #[test]
    fn test_spawn_failure_keeps_stream_state() {
        let dev = Arc::new(SimDevice::new());
        let s = stream(&dev, direct(), 2 * S);
        s.set_buffer(pool().allocate_aligned(S, S).unwrap()).unwrap();
        s.submit(S, 0).unwrap();

        REFUSE_NEXT_SPAWN.with(|refuse| refuse.set(true));
        assert!(matches!(s.submit(2 * S, 0), Err(ScalError::Io(_))));
        assert_eq!(s.current_pi(), S);
        assert_eq!(s.hw_pi(), S);
        assert!(!s.rebase_pending());
        assert_eq!(s.rebases(), 0);

        // the same PI is accepted once the consumer drains
        dev.write_register(REGS.ci, S as u32);
        s.submit(2 * S, 0).unwrap();
        assert_eq!(s.current_pi(), 2 * S);
        assert_eq!(s.rebases(), 1);
    }

    #[test]
    fn test_stub_stream_bounds_advance() {
        let dev = Arc::new(SimDevice::new());
        let driver: Arc<dyn DeviceDriver> = dev.clone();
        let s = Stream::new("stub".into(), direct(), REGS, StreamPriority::LOW, None, true, driver).unwrap();
        s.set_buffer(pool().allocate(S).unwrap()).unwrap();
        assert!(s.submit(S + 1, 0).is_err());
        s.submit(S, 0).unwrap();
        assert_eq!(s.current_pi(), S);
    }

    #[test]
    fn test_rebind_requires_idle_consumer() {
        let dev = Arc::new(SimDevice::new());
        let s = stream(&dev, direct(), DEFAULT_HW_PI_RANGE);
        let p = pool();
        s.set_buffer(p.allocate_aligned(S, S).unwrap()).unwrap();
        s.submit(100, 0).unwrap();
        assert!(s.set_buffer(p.allocate_aligned(S, S).unwrap()).is_err());

        dev.write_register(REGS.ci, 100);
        s.set_buffer(p.allocate_aligned(2 * S, S).unwrap()).unwrap();
        assert_eq!(dev.read_register(REGS.pi), 0);
        s.submit(150, 0).unwrap();
        assert_eq!(dev.read_register(REGS.pi), 50);
    }

    #[test]
    fn test_priority() {
        let dev = Arc::new(SimDevice::new());
        let s = stream(&dev, sched(), DEFAULT_HW_PI_RANGE);
        assert!(s.set_priority(StreamPriority(7)).is_err());
        s.set_priority(StreamPriority::HIGH).unwrap();
        assert_eq!(dev.read_register(0x114), StreamPriority::HIGH.0);
        assert_eq!(s.priority(), StreamPriority::HIGH);

        let d = stream(&dev, direct(), DEFAULT_HW_PI_RANGE);
        d.set_priority(StreamPriority(7)).unwrap();
        assert_eq!(d.priority(), StreamPriority(7));
    }

    #[test]
    fn test_stub_stream_touches_no_registers() {
        let dev = Arc::new(SimDevice::new());
        let driver: Arc<dyn DeviceDriver> = dev.clone();
        let s = Stream::new("stub".into(), direct(), REGS, StreamPriority::LOW, None, true, driver).unwrap();
        s.set_buffer(pool().allocate(S).unwrap()).unwrap();
        s.submit(4096, 0).unwrap();
        assert_eq!(s.current_pi(), 4096);
        assert!(dev.writes_to(REGS.pi).is_empty());
    }

    #[test]
    fn test_invalid_pi_range() {
        let dev = Arc::new(SimDevice::new());
        let driver: Arc<dyn DeviceDriver> = dev.clone();
        assert!(Stream::new("s".into(), direct(), REGS, StreamPriority::LOW, Some(3 * S), false, driver).is_err());
    }
}
