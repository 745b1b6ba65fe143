// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Memory pools and the buffers carved out of them.
//!
//! A pool is a contiguous device address range. Host pools additionally own a
//! host mapping of the same size, so every buffer has a host address too.

use crate::allocator::{Allocator, HeapAllocator};
use crate::error::{ScalError, ScalResult};
use crate::topology::PoolDesc;
use parking_lot::Mutex;
use std::sync::Arc;

/// Alignment used by `allocate_buffer`.
pub const DEFAULT_BUFFER_ALIGNMENT: u64 = 128;

/// Where a pool's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Host memory mapped into the device address space.
    Host,
    /// On-device HBM.
    Hbm,
    /// HBM reserved for use outside the runtime.
    HbmExternal,
}

/// Snapshot of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolInfo {
    pub name: String,
    pub index: u32,
    pub kind: PoolKind,
    pub device_base_address: u64,
    pub host_base_address: Option<usize>,
    pub core_base_address: u32,
    pub total_size: u64,
    pub free_size: u64,
}

/// Named memory pool.
pub struct Pool {
    name: String,
    index: u32,
    kind: PoolKind,
    device_base: u64,
    core_base: u32,
    size: u64,
    host: Option<HostMapping>,
    allocator: Mutex<Box<dyn Allocator>>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("device_base", &format_args!("{:#x}", self.device_base))
            .field("size", &self.size)
            .finish()
    }
}

impl Pool {
    /// Create a pool from its description, mapping host memory if needed.
    pub fn new(index: u32, desc: &PoolDesc) -> ScalResult<Self> {
        if desc.name.is_empty() {
            return Err(ScalError::InvalidConfig(format!("pool {index} has no name")));
        }
        if desc.size == 0 {
            return Err(ScalError::InvalidConfig(format!(
                "pool '{}' has zero size",
                desc.name
            )));
        }
        if desc.device_base.checked_add(desc.size).is_none() {
            return Err(ScalError::InvalidConfig(format!(
                "pool '{}' wraps the device address space",
                desc.name
            )));
        }
        let host = match desc.kind {
            PoolKind::Host => Some(HostMapping::new(desc.size)?),
            PoolKind::Hbm | PoolKind::HbmExternal => None,
        };
        Ok(Self {
            name: desc.name.clone(),
            index,
            kind: desc.kind,
            device_base: desc.device_base,
            core_base: desc.core_base,
            size: desc.size,
            host,
            allocator: Mutex::new(Box::new(HeapAllocator::new(desc.size))),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn device_base(&self) -> u64 {
        self.device_base
    }

    /// Base of the pool as seen by the cores, 0 if the pool is not mapped to them.
    pub fn core_base(&self) -> u32 {
        self.core_base
    }

    pub fn host_base(&self) -> Option<usize> {
        self.host.as_ref().map(HostMapping::address)
    }

    pub fn info(&self) -> PoolInfo {
        let occupancy = self.allocator.lock().info();
        PoolInfo {
            name: self.name.clone(),
            index: self.index,
            kind: self.kind,
            device_base_address: self.device_base,
            host_base_address: self.host_base(),
            core_base_address: self.core_base,
            total_size: occupancy.total_size,
            free_size: occupancy.free_size,
        }
    }

    /// Allocate a buffer with the default alignment.
    pub fn allocate(self: &Arc<Self>, size: u64) -> ScalResult<Arc<Buffer>> {
        self.allocate_aligned(size, DEFAULT_BUFFER_ALIGNMENT)
    }

    /// Allocate a buffer whose offset is a multiple of `alignment`.
    pub fn allocate_aligned(self: &Arc<Self>, size: u64, alignment: u64) -> ScalResult<Arc<Buffer>> {
        if size == 0 {
            return Err(ScalError::InvalidParam(format!(
                "zero-size allocation from pool '{}'",
                self.name
            )));
        }
        if !alignment.is_power_of_two() {
            return Err(ScalError::InvalidParam(format!(
                "alignment {alignment} is not a power of two"
            )));
        }

        let mut allocator = self.allocator.lock();
        let Some(offset) = allocator.alloc(size, alignment) else {
            let occupancy = allocator.info();
            log::error!(
                "pool '{}': failed to allocate {size} bytes aligned to {alignment} (total {}, free {})",
                self.name,
                occupancy.total_size,
                occupancy.free_size
            );
            return Err(ScalError::OutOfMemory {
                pool: self.name.clone(),
                size,
                alignment,
                total: occupancy.total_size,
                free: occupancy.free_size,
            });
        };
        drop(allocator);
        debug_assert!(offset + size <= self.size);

        log::trace!("pool '{}': allocated [{offset:#x}, +{size:#x})", self.name);
        Ok(Arc::new(Buffer {
            pool: Arc::clone(self),
            offset,
            size,
        }))
    }

    fn release(&self, offset: u64) {
        if !self.allocator.lock().free(offset) {
            log::error!("pool '{}': free of unknown offset {offset:#x}", self.name);
        }
    }
}

/// Block of a [`Pool`]. The block returns to the pool when the last handle drops.
pub struct Buffer {
    pool: Arc<Pool>,
    offset: u64,
    size: u64,
}

/// Addresses of a buffer in every address space it is visible in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub pool: String,
    pub pool_index: u32,
    pub offset: u64,
    pub size: u64,
    pub device_address: u64,
    pub core_address: Option<u32>,
    pub host_address: Option<usize>,
}

impl Buffer {
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn device_address(&self) -> u64 {
        self.pool.device_base + self.offset
    }

    /// Address as seen by the cores, if the pool is mapped to them.
    pub fn core_address(&self) -> Option<u32> {
        if self.pool.core_base == 0 {
            return None;
        }
        u32::try_from(self.offset)
            .ok()
            .and_then(|off| self.pool.core_base.checked_add(off))
    }

    pub fn host_address(&self) -> Option<usize> {
        self.pool.host_base().map(|base| base + self.offset as usize)
    }

    pub fn info(&self) -> BufferInfo {
        BufferInfo {
            pool: self.pool.name.clone(),
            pool_index: self.pool.index,
            offset: self.offset,
            size: self.size,
            device_address: self.device_address(),
            core_address: self.core_address(),
            host_address: self.host_address(),
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("pool", &self.pool.name)
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.pool.release(self.offset);
    }
}

// ============================================================================
// Linux Implementation
// ============================================================================

#[cfg(target_os = "linux")]
mod host_impl {
    use crate::error::{ScalError, ScalResult};

    /// Anonymous host mapping backing a host pool.
    pub struct HostMapping {
        ptr: *mut u8,
        len: usize,
    }

    // SAFETY: the mapping is owned exclusively by its pool and only its
    // address is handed out; reads and writes go through device semantics.
    unsafe impl Send for HostMapping {}
    // SAFETY: see above, nothing is dereferenced through `&HostMapping`.
    unsafe impl Sync for HostMapping {}

    impl HostMapping {
        pub fn new(size: u64) -> ScalResult<Self> {
            let len = usize::try_from(size)
                .map_err(|_| ScalError::InvalidConfig(format!("host pool size {size} too large")))?;
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(ScalError::Io(std::io::Error::last_os_error()));
            }
            Ok(Self {
                ptr: ptr as *mut u8,
                len,
            })
        }

        pub fn address(&self) -> usize {
            self.ptr as usize
        }
    }

    impl Drop for HostMapping {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.len);
            }
        }
    }

    pub fn page_size() -> u64 {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        u64::try_from(size).ok().filter(|s| *s > 0).unwrap_or(4096)
    }
}

// ============================================================================
// Non-Linux Implementation
// ============================================================================

#[cfg(not(target_os = "linux"))]
mod host_impl {
    use crate::error::{ScalError, ScalResult};

    /// Heap allocation standing in for a host mapping.
    pub struct HostMapping {
        mem: Box<[u8]>,
    }

    impl HostMapping {
        pub fn new(size: u64) -> ScalResult<Self> {
            let len = usize::try_from(size)
                .map_err(|_| ScalError::InvalidConfig(format!("host pool size {size} too large")))?;
            Ok(Self {
                mem: vec![0u8; len].into_boxed_slice(),
            })
        }

        pub fn address(&self) -> usize {
            self.mem.as_ptr() as usize
        }
    }

    pub fn page_size() -> u64 {
        4096
    }
}

use host_impl::HostMapping;
pub(crate) use host_impl::page_size;

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(kind: PoolKind, size: u64) -> Arc<Pool> {
        let desc = PoolDesc {
            name: "test_pool".into(),
            kind,
            size,
            device_base: 0x1000_0000,
            core_base: 0x2000_0000,
        };
        Arc::new(Pool::new(0, &desc).unwrap())
    }

    #[test]
    fn test_two_large_allocations_exhaust_pool() {
        let p = pool(PoolKind::Hbm, 1 << 20);
        let first = p.allocate(600 * 1024).unwrap();
        let err = p.allocate(600 * 1024).unwrap_err();
        assert!(matches!(err, ScalError::OutOfMemory { .. }));
        assert_eq!(err.status(), crate::error::ScalStatus::OutOfMemory);
        drop(first);
        assert_eq!(p.info().free_size, 1 << 20);
    }

    #[test]
    fn test_buffer_addresses() {
        let p = pool(PoolKind::Host, 64 * 1024);
        let _pad = p.allocate(100).unwrap();
        let b = p.allocate_aligned(256, 4096).unwrap();
        assert_eq!(b.offset(), 4096);
        assert_eq!(b.device_address(), 0x1000_0000 + 4096);
        assert_eq!(b.core_address(), Some(0x2000_0000 + 4096));
        let host = p.host_base().unwrap();
        assert_eq!(b.host_address(), Some(host + 4096));
        let info = b.info();
        assert_eq!(info.pool, "test_pool");
        assert_eq!(info.size, 256);
    }

    #[test]
    fn test_hbm_has_no_host_address() {
        let p = pool(PoolKind::Hbm, 4096);
        let b = p.allocate(64).unwrap();
        assert!(b.host_address().is_none());
        assert!(p.info().host_base_address.is_none());
    }

    #[test]
    fn test_invalid_requests() {
        let p = pool(PoolKind::Hbm, 4096);
        assert!(matches!(p.allocate(0), Err(ScalError::InvalidParam(_))));
        assert!(matches!(
            p.allocate_aligned(16, 0),
            Err(ScalError::InvalidParam(_))
        ));
        let desc = PoolDesc {
            name: String::new(),
            kind: PoolKind::Hbm,
            size: 16,
            device_base: 0,
            core_base: 0,
        };
        assert!(Pool::new(1, &desc).is_err());
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
    }
}
