// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Software device.
//!
//! `SimDevice` implements [`DeviceDriver`] on top of a register map and a
//! host counter block. Completions are produced by calling
//! [`signal`](SimDevice::signal); consumer indices move only when the caller
//! writes them, or on every producer write when auto-drain is enabled for
//! that ring.

use crate::driver::{CounterBlock, CounterWait, DeviceDriver, DriverError, TimestampRequest};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// `ENODEV`, reported when waiting before any counters were mapped.
const ERRNO_NO_DEVICE: i32 = 19;

/// Register writes kept for inspection; older ones are dropped.
pub const MAX_RECORDED_WRITES: usize = 4096;

/// Software implementation of a device and its driver.
#[derive(Debug, Default)]
pub struct SimDevice {
    registers: Mutex<HashMap<u64, u32>>,
    writes: Mutex<VecDeque<(u64, u32)>>,
    /// PI register -> CI register
    drains: Mutex<HashMap<u64, u64>>,
    auto_drain: AtomicBool,
    counters: Mutex<Option<Arc<CounterBlock>>>,
    signal_lock: Mutex<()>,
    signalled: Condvar,
    wait_calls: AtomicUsize,
    fail_next_wait: Mutex<Option<DriverError>>,
    timestamps: Mutex<Vec<TimestampRequest>>,
    timeout_locked_s: Option<u64>,
}

impl SimDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device whose driver reports a locked-wait timeout.
    pub fn with_timeout_locked(seconds: u64) -> Self {
        Self {
            timeout_locked_s: Some(seconds),
            ..Self::default()
        }
    }

    /// Complete work: set counter `index` to `value` and wake waiters.
    pub fn signal(&self, index: u32, value: u64) {
        if let Some(block) = self.counters.lock().as_ref() {
            block.store(index, value);
        }
        let _guard = self.signal_lock.lock();
        self.signalled.notify_all();
    }

    /// Current raw value of counter `index`.
    pub fn counter(&self, index: u32) -> u64 {
        self.counters.lock().as_ref().map_or(0, |b| b.load(index))
    }

    /// Make the consumer of the ring at `pi_register` follow every write.
    pub fn link_drain(&self, pi_register: u64, ci_register: u64) {
        self.drains.lock().insert(pi_register, ci_register);
    }

    pub fn set_auto_drain(&self, enabled: bool) {
        self.auto_drain.store(enabled, Ordering::Release);
    }

    /// Fail the next driver wait with `error`.
    pub fn fail_next_wait(&self, error: DriverError) {
        *self.fail_next_wait.lock() = Some(error);
    }

    /// Number of `wait_for_counter` calls so far.
    pub fn wait_calls(&self) -> usize {
        self.wait_calls.load(Ordering::Acquire)
    }

    /// Recent register writes to `address`, oldest first. At most
    /// [`MAX_RECORDED_WRITES`] writes across all registers are retained.
    pub fn writes_to(&self, address: u64) -> Vec<u32> {
        self.writes
            .lock()
            .iter()
            .filter(|(a, _)| *a == address)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    pub fn timestamps(&self) -> Vec<TimestampRequest> {
        self.timestamps.lock().clone()
    }
}

impl DeviceDriver for SimDevice {
    fn wait_for_counter(&self, wait: &CounterWait) -> Result<(), DriverError> {
        self.wait_calls.fetch_add(1, Ordering::AcqRel);
        if let Some(err) = self.fail_next_wait.lock().take() {
            return Err(err);
        }
        let block = self
            .counters
            .lock()
            .clone()
            .ok_or(DriverError::Os(ERRNO_NO_DEVICE))?;

        // None when the timeout is too large to represent: wait forever
        let deadline = Instant::now().checked_add(wait.timeout);
        let mut guard = self.signal_lock.lock();
        loop {
            if block.load(wait.counter_index) >= wait.target {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DriverError::TimedOut);
                    }
                    self.signalled.wait_for(&mut guard, deadline - now);
                }
                None => self.signalled.wait(&mut guard),
            }
        }
    }

    fn read_register(&self, address: u64) -> u32 {
        self.registers.lock().get(&address).copied().unwrap_or(0)
    }

    fn write_register(&self, address: u64, value: u32) {
        let drain_to = if self.auto_drain.load(Ordering::Acquire) {
            self.drains.lock().get(&address).copied()
        } else {
            None
        };
        let mut regs = self.registers.lock();
        regs.insert(address, value);
        if let Some(ci) = drain_to {
            regs.insert(ci, value);
        }
        drop(regs);
        let mut writes = self.writes.lock();
        if writes.len() == MAX_RECORDED_WRITES {
            writes.pop_front();
        }
        writes.push_back((address, value));
    }

    fn allocate_counters(&self, len: usize) -> Result<Arc<CounterBlock>, DriverError> {
        let block = Arc::new(CounterBlock::new(1, 0x7f00_0000_0000, len));
        *self.counters.lock() = Some(Arc::clone(&block));
        Ok(block)
    }

    fn register_timestamp(&self, request: &TimestampRequest) -> Result<(), DriverError> {
        self.timestamps.lock().push(*request);
        Ok(())
    }

    fn timeout_locked_seconds(&self) -> Option<u64> {
        self.timeout_locked_s
    }
}
