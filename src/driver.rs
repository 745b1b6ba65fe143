// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Kernel driver boundary.
//!
//! The runtime needs only a blocking wait on a memory counter and register
//! commit. Everything else (device discovery, memory mapping of the counter
//! block) belongs to the driver side.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Interrupt index meaning "no interrupt line".
pub const NO_INTERRUPT: u32 = u32::MAX;

/// Errors reported by a [`DeviceDriver`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// The wait deadline expired before the counter reached its target.
    #[error("driver wait timed out")]
    TimedOut,

    /// The driver call failed with an OS error number.
    #[error("driver call failed: errno {0}")]
    Os(i32),

    /// The driver does not implement the request.
    #[error("operation not supported by driver")]
    Unsupported,
}

/// Arguments of a blocking counter wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterWait {
    pub counters_handle: u64,
    pub counter_index: u32,
    pub target: u64,
    pub interrupt: u32,
    pub timeout: Duration,
}

/// Request to timestamp the moment a counter reaches `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampRequest {
    pub counters_handle: u64,
    pub counter_index: u32,
    pub target: u64,
    pub interrupt: u32,
    pub timestamps_handle: u64,
    pub timestamps_offset: u32,
}

/// Host-visible completion counters written by the device.
///
/// Every completion queue of an instance owns one slot.
#[derive(Debug)]
pub struct CounterBlock {
    handle: u64,
    device_address: u64,
    slots: Box<[AtomicU64]>,
}

impl CounterBlock {
    pub fn new(handle: u64, device_address: u64, len: usize) -> Self {
        Self {
            handle,
            device_address,
            slots: (0..len).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Device address of slot `index`.
    pub fn slot_device_address(&self, index: u32) -> u64 {
        self.device_address + 8 * index as u64
    }

    /// Current raw value of slot `index`, 0 if out of range.
    #[inline]
    pub fn load(&self, index: u32) -> u64 {
        self.slots
            .get(index as usize)
            .map_or(0, |slot| slot.load(Ordering::Acquire))
    }

    /// Device-side write of slot `index`.
    pub fn store(&self, index: u32, value: u64) {
        if let Some(slot) = self.slots.get(index as usize) {
            slot.store(value, Ordering::Release);
        }
    }
}

/// Operations the runtime requests from the kernel driver.
pub trait DeviceDriver: Send + Sync {
    /// Block until counter `counter_index` reaches `target`, the interrupt
    /// fires with the counter satisfied, or the timeout expires.
    fn wait_for_counter(&self, wait: &CounterWait) -> Result<(), DriverError>;

    fn read_register(&self, address: u64) -> u32;

    fn write_register(&self, address: u64, value: u32);

    /// Map a counter block with `len` slots.
    fn allocate_counters(&self, len: usize) -> Result<Arc<CounterBlock>, DriverError> {
        Ok(Arc::new(CounterBlock::new(0, 0, len)))
    }

    fn register_timestamp(&self, _request: &TimestampRequest) -> Result<(), DriverError> {
        Err(DriverError::Unsupported)
    }

    /// Driver's locked-wait timeout in seconds, if it reports one.
    fn timeout_locked_seconds(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_block() {
        let block = CounterBlock::new(7, 0x1000, 4);
        assert_eq!(block.len(), 4);
        assert_eq!(block.handle(), 7);
        block.store(2, 99);
        assert_eq!(block.load(2), 99);
        assert_eq!(block.load(10), 0);
        block.store(10, 5);
        assert_eq!(block.slot_device_address(3), 0x1018);
    }
}
