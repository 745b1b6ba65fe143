// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Sync managers and the sync object / monitor pools they host.
//!
//! Pool ranges are fixed at configuration time and never overlap inside one
//! sync manager. Entries are handed out by a bump cursor and never returned.

use crate::driver::DeviceDriver;
use crate::error::{ScalError, ScalResult};
use bitflags::bitflags;
use std::marker::PhantomData;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Offset of the sync object array inside a sync manager block.
pub const SM_SOB_OFFSET: u64 = 0x000;
/// Offset of the monitor configuration array.
pub const SM_MON_CONFIG_OFFSET: u64 = 0x4000;
/// Offset of the monitor payload address / data triplets.
pub const SM_MON_PAYLOAD_OFFSET: u64 = 0x6000;
const SM_MON_PAYLOAD_STRIDE: u64 = 12;

bitflags! {
    /// Monitor configuration register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MonitorConfig: u32 {
        /// Sync object is a 60-bit long SO.
        const LONG_SOB = 1 << 0;
        /// Write the completion queue when armed monitor fires.
        const CQ_ENABLE = 1 << 1;
        /// Raise the MSI-X line of the payload when fired.
        const LBW_ENABLE = 1 << 2;
        /// Monitor fires when the SO is greater or equal.
        const MODE_GE = 1 << 3;
    }
}

/// Hardware limits of one sync manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmCapacity {
    pub sync_objects: u32,
    pub monitors: u32,
    pub completion_queues: u32,
}

/// Kind marker for a [`SyncResourcePool`].
pub trait SyncResource: Sized + Send + Sync + 'static {
    const KIND: &'static str;

    fn capacity(capacity: &SmCapacity) -> u32;

    fn pools(sm: &SyncManager) -> &[Arc<SyncResourcePool<Self>>];

    fn pools_mut(sm: &mut SyncManager) -> &mut Vec<Arc<SyncResourcePool<Self>>>;
}

/// Marker for sync object pools.
#[derive(Debug)]
pub enum SyncObjects {}

/// Marker for monitor pools.
#[derive(Debug)]
pub enum Monitors {}

impl SyncResource for SyncObjects {
    const KIND: &'static str = "sync object";

    fn capacity(capacity: &SmCapacity) -> u32 {
        capacity.sync_objects
    }

    fn pools(sm: &SyncManager) -> &[Arc<SyncResourcePool<Self>>] {
        &sm.so_pools
    }

    fn pools_mut(sm: &mut SyncManager) -> &mut Vec<Arc<SyncResourcePool<Self>>> {
        &mut sm.so_pools
    }
}

impl SyncResource for Monitors {
    const KIND: &'static str = "monitor";

    fn capacity(capacity: &SmCapacity) -> u32 {
        capacity.monitors
    }

    fn pools(sm: &SyncManager) -> &[Arc<SyncResourcePool<Self>>] {
        &sm.monitor_pools
    }

    fn pools_mut(sm: &mut SyncManager) -> &mut Vec<Arc<SyncResourcePool<Self>>> {
        &mut sm.monitor_pools
    }
}

/// Snapshot of a sync resource pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPoolInfo {
    pub name: String,
    pub sm_index: u32,
    pub dcore_index: u32,
    pub sm_base_address: u64,
    pub base_index: u32,
    pub size: u32,
    pub next_available: u32,
}

/// Contiguous range of sync objects or monitors within one sync manager.
#[derive(Debug)]
pub struct SyncResourcePool<K> {
    name: String,
    sm_index: u32,
    dcore_index: u32,
    sm_base_address: u64,
    base_index: u32,
    size: u32,
    next: AtomicU32,
    _kind: PhantomData<fn() -> K>,
}

pub type SyncObjectPool = SyncResourcePool<SyncObjects>;
pub type MonitorPool = SyncResourcePool<Monitors>;

impl<K: SyncResource> SyncResourcePool<K> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sm_index(&self) -> u32 {
        self.sm_index
    }

    pub fn range(&self) -> Range<u32> {
        self.base_index..self.base_index + self.size
    }

    /// Entries not yet reserved.
    pub fn available(&self) -> u32 {
        self.range().end - self.next.load(Ordering::Acquire)
    }

    /// Reserve `count` consecutive entries, returning the first index.
    pub fn reserve(&self, count: u32) -> ScalResult<u32> {
        let end = self.range().end;
        let mut current = self.next.load(Ordering::Acquire);
        loop {
            let next = current
                .checked_add(count)
                .filter(|n| *n <= end)
                .ok_or_else(|| ScalError::PoolExhausted {
                    kind: K::KIND,
                    pool: self.name.clone(),
                    requested: count,
                    available: end - current,
                })?;
            match self
                .next
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(current),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn info(&self) -> SyncPoolInfo {
        SyncPoolInfo {
            name: self.name.clone(),
            sm_index: self.sm_index,
            dcore_index: self.dcore_index,
            sm_base_address: self.sm_base_address,
            base_index: self.base_index,
            size: self.size,
            next_available: self.next.load(Ordering::Acquire),
        }
    }
}

/// Snapshot of a sync manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmInfo {
    pub index: u32,
    pub dcore_index: u32,
    pub base_address: u64,
    pub capacity: SmCapacity,
    pub active_completion_queues: u32,
    pub so_pools: Vec<String>,
    pub monitor_pools: Vec<String>,
}

/// One hardware sync manager.
#[derive(Debug)]
pub struct SyncManager {
    index: u32,
    dcore_index: u32,
    base_address: u64,
    capacity: SmCapacity,
    active_cqs: u32,
    so_pools: Vec<Arc<SyncObjectPool>>,
    monitor_pools: Vec<Arc<MonitorPool>>,
}

impl SyncManager {
    pub fn new(index: u32, dcore_index: u32, base_address: u64, capacity: SmCapacity) -> Self {
        Self {
            index,
            dcore_index,
            base_address,
            capacity,
            active_cqs: 0,
            so_pools: Vec::new(),
            monitor_pools: Vec::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    /// Register a pool over `[base, base + size)`.
    ///
    /// Fails if the range leaves the sync manager or overlaps a sibling
    /// pool of the same kind.
    pub fn add_pool<K: SyncResource>(
        &mut self,
        name: &str,
        base: u32,
        size: u32,
    ) -> ScalResult<Arc<SyncResourcePool<K>>> {
        if name.is_empty() {
            return Err(ScalError::InvalidConfig(format!(
                "unnamed {} pool on sync manager {}",
                K::KIND,
                self.index
            )));
        }
        let capacity = K::capacity(&self.capacity);
        let end = base
            .checked_add(size)
            .filter(|end| *end <= capacity)
            .ok_or(ScalError::CapacityExceeded {
                sm: self.index,
                resource: K::KIND,
                capacity,
            })?;

        let others: Vec<&str> = K::pools(self)
            .iter()
            .filter(|p| {
                let r = p.range();
                r.start < end && base < r.end
            })
            .map(|p| p.name())
            .collect();
        if !others.is_empty() {
            let others = others.join(", ");
            log::error!(
                "sync manager {}: {} pool '{name}' [{base}, {end}) overlaps {others}",
                self.index,
                K::KIND
            );
            return Err(ScalError::PoolOverlap {
                kind: K::KIND,
                pool: name.to_string(),
                base,
                end,
                others,
            });
        }

        let pool = Arc::new(SyncResourcePool {
            name: name.to_string(),
            sm_index: self.index,
            dcore_index: self.dcore_index,
            sm_base_address: self.base_address,
            base_index: base,
            size,
            next: AtomicU32::new(base),
            _kind: PhantomData,
        });
        K::pools_mut(self).push(Arc::clone(&pool));
        Ok(pool)
    }

    /// Claim the next completion queue index of this sync manager.
    pub fn allocate_cq_index(&mut self) -> ScalResult<u32> {
        if self.active_cqs >= self.capacity.completion_queues {
            return Err(ScalError::CapacityExceeded {
                sm: self.index,
                resource: "completion queue",
                capacity: self.capacity.completion_queues,
            });
        }
        let idx = self.active_cqs;
        self.active_cqs += 1;
        Ok(idx)
    }

    pub fn sync_object_address(&self, so: u32) -> u64 {
        self.base_address + SM_SOB_OFFSET + 4 * so as u64
    }

    pub fn monitor_config_address(&self, monitor: u32) -> u64 {
        self.base_address + SM_MON_CONFIG_OFFSET + 4 * monitor as u64
    }

    /// Program `monitor` to watch `so` and, when `interrupt` is given, to
    /// write `data` to the MSI-X doorbell `doorbell` when it fires.
    pub fn program_monitor(
        &self,
        driver: &dyn DeviceDriver,
        monitor: u32,
        so: u32,
        interrupt: Option<(u64, u32)>,
    ) {
        let mut config = MonitorConfig::CQ_ENABLE | MonitorConfig::MODE_GE;
        let payload = self.base_address + SM_MON_PAYLOAD_OFFSET + SM_MON_PAYLOAD_STRIDE * monitor as u64;
        if let Some((doorbell, data)) = interrupt {
            config |= MonitorConfig::LBW_ENABLE;
            driver.write_register(payload, doorbell as u32);
            driver.write_register(payload + 4, (doorbell >> 32) as u32);
            driver.write_register(payload + 8, data);
        }
        // the SO index sits above the flag bits
        driver.write_register(self.monitor_config_address(monitor), config.bits() | (so << 8));
        log::debug!(
            "sync manager {}: monitor {monitor} watches SO {so}, config {config:?}",
            self.index
        );
    }

    pub fn info(&self) -> SmInfo {
        SmInfo {
            index: self.index,
            dcore_index: self.dcore_index,
            base_address: self.base_address,
            capacity: self.capacity,
            active_completion_queues: self.active_cqs,
            so_pools: self.so_pools.iter().map(|p| p.name.clone()).collect(),
            monitor_pools: self.monitor_pools.iter().map(|p| p.name.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;

    fn sm() -> SyncManager {
        SyncManager::new(
            0,
            0,
            0x4000_0000,
            SmCapacity {
                sync_objects: 1024,
                monitors: 512,
                completion_queues: 2,
            },
        )
    }

    #[test]
    fn test_overlap_rejected() {
        let mut sm = sm();
        sm.add_pool::<SyncObjects>("a", 0, 100).unwrap();
        sm.add_pool::<SyncObjects>("b", 100, 50).unwrap();
        let err = sm.add_pool::<SyncObjects>("c", 140, 20).unwrap_err();
        match err {
            ScalError::PoolOverlap { pool, others, .. } => {
                assert_eq!(pool, "c");
                assert_eq!(others, "b");
            }
            other => panic!("unexpected error {other:?}"),
        }
        // monitors live in their own index space
        sm.add_pool::<Monitors>("c_mon", 140, 20).unwrap();
    }

    #[test]
    fn test_overlap_reports_every_sibling() {
        let mut sm = sm();
        sm.add_pool::<SyncObjects>("a", 0, 10).unwrap();
        sm.add_pool::<SyncObjects>("b", 10, 10).unwrap();
        match sm.add_pool::<SyncObjects>("c", 5, 10) {
            Err(ScalError::PoolOverlap { pool, base, end, others, .. }) => {
                assert_eq!(pool, "c");
                assert_eq!((base, end), (5, 15));
                assert_eq!(others, "a, b");
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(sm.info().so_pools, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_capacity_enforced() {
        let mut sm = sm();
        assert!(matches!(
            sm.add_pool::<Monitors>("m", 500, 20),
            Err(ScalError::CapacityExceeded { .. })
        ));
        assert_eq!(sm.allocate_cq_index().unwrap(), 0);
        assert_eq!(sm.allocate_cq_index().unwrap(), 1);
        assert!(sm.allocate_cq_index().is_err());
    }

    #[test]
    fn test_reserve_bumps_and_exhausts() {
        let mut sm = sm();
        let pool = sm.add_pool::<SyncObjects>("so", 10, 8).unwrap();
        assert_eq!(pool.reserve(3).unwrap(), 10);
        assert_eq!(pool.reserve(4).unwrap(), 13);
        assert_eq!(pool.available(), 1);
        let err = pool.reserve(2).unwrap_err();
        assert_eq!(err.status(), crate::error::ScalStatus::OutOfRange);
        assert_eq!(pool.reserve(1).unwrap(), 17);
        assert_eq!(pool.info().next_available, 18);
    }

    #[test]
    fn test_concurrent_reserve_is_disjoint() {
        let mut sm = sm();
        let pool = sm.add_pool::<SyncObjects>("so", 0, 1000).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || (0..50).map(|_| pool.reserve(5).unwrap()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 200);
        assert!(pool.reserve(1).is_err());
    }

    #[test]
    fn test_program_monitor_with_interrupt() {
        let sm = sm();
        let dev = SimDevice::new();
        sm.program_monitor(&dev, 3, 7, Some((0xdead_0000_1000, 5)));
        let cfg = dev.read_register(sm.monitor_config_address(3));
        let flags = MonitorConfig::from_bits_truncate(cfg & 0xff);
        assert!(flags.contains(MonitorConfig::LBW_ENABLE | MonitorConfig::CQ_ENABLE));
        assert_eq!(cfg >> 8, 7);

        sm.program_monitor(&dev, 3, 7, None);
        let cfg = dev.read_register(sm.monitor_config_address(3));
        assert!(!MonitorConfig::from_bits_truncate(cfg).contains(MonitorConfig::LBW_ENABLE));
    }
}
