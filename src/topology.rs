// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device topology records.
//!
//! These plain records are what a configuration loader produces. The
//! runtime validates them and turns them into live objects in
//! [`ScalInstance::create`](crate::instance::ScalInstance::create).

use crate::cores::{CoreRole, CoreType};
use crate::pdma::CqRegisters;
use crate::platform::Platform;
use crate::pool::PoolKind;
use crate::stream::{RingRegisters, StreamPriority};
use crate::sync_manager::SmCapacity;

/// Complete device description.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub platform: Platform,
    pub pools: Vec<PoolDesc>,
    pub sync_managers: Vec<SyncManagerDesc>,
    pub so_pools: Vec<SyncPoolDesc>,
    pub monitor_pools: Vec<SyncPoolDesc>,
    pub cores: Vec<CoreDesc>,
    pub clusters: Vec<ClusterDesc>,
    pub completion_groups: Vec<CompletionGroupDesc>,
    pub streams: Vec<StreamDesc>,
    pub host_fence_counters: Vec<HostFenceCounterDesc>,
    pub pdma_channels: Vec<PdmaChannelDesc>,
}

#[derive(Debug, Clone)]
pub struct PoolDesc {
    pub name: String,
    pub kind: PoolKind,
    pub size: u64,
    pub device_base: u64,
    /// 0 when the pool is not visible to the cores.
    pub core_base: u32,
}

#[derive(Debug, Clone)]
pub struct SyncManagerDesc {
    pub index: u32,
    pub dcore_index: u32,
    pub base_address: u64,
    pub capacity: SmCapacity,
}

/// Sync object or monitor pool range.
#[derive(Debug, Clone)]
pub struct SyncPoolDesc {
    pub name: String,
    pub sm_index: u32,
    pub base_index: u32,
    pub size: u32,
}

#[derive(Debug, Clone)]
pub struct CoreDesc {
    pub id: u32,
    pub name: String,
    pub qman: String,
    pub qman_id: u32,
    pub dccm_device_address: u64,
    pub dccm_message_queue_address: u64,
    /// Base of the core's register block.
    pub register_base: u64,
    pub hd_core: u32,
    pub role: CoreRole,
}

#[derive(Debug, Clone)]
pub struct ClusterDesc {
    pub name: String,
    pub core_type: Option<CoreType>,
    /// Engine core names.
    pub engines: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CompletionGroupDesc {
    pub name: String,
    /// Owning scheduler core name.
    pub scheduler: String,
    pub index_in_scheduler: u32,
    pub sm_index: u32,
    pub so_pool: String,
    pub num_sos: u32,
    pub monitor_pool: String,
    pub num_monitors: u32,
    /// Interrupt line; `None` makes waits busy-poll.
    pub interrupt: Option<u32>,
    pub force_order: bool,
    pub tdr: Option<TdrDesc>,
}

/// Resources of the stuck-engine detector attached to a completion group.
#[derive(Debug, Clone)]
pub struct TdrDesc {
    pub sm_index: u32,
    pub so_pool: String,
    pub monitor_pool: String,
}

#[derive(Debug, Clone)]
pub struct StreamDesc {
    pub name: String,
    pub scheduler: String,
    pub index: u32,
    pub registers: RingRegisters,
    pub priority: StreamPriority,
    /// Range of the hardware PI register, a power of two. Defaults to 2^32.
    pub hw_pi_range: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct HostFenceCounterDesc {
    pub name: String,
    pub completion_group: String,
    /// Its sync manager hosts the fence's monitor.
    pub so_pool: String,
    pub monitor_pool: String,
    /// Dedicated interrupt line used while interrupts are enabled.
    pub interrupt: u32,
    /// MSI-X doorbell the monitor writes when it fires.
    pub doorbell: u64,
    pub isr_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct PdmaChannelDesc {
    /// Stream-set name; the stream is `<set><index>` and its completion
    /// group `<set>_completion_queue<index>`.
    pub stream_set: String,
    pub index: u32,
    pub channel_id: u32,
    pub engine_name: String,
    pub qman_id: u32,
    pub interrupt: Option<u32>,
    pub priority: StreamPriority,
    pub fence_counter_address: u64,
    /// MSI-X doorbell written on completion when interrupts are used.
    pub isr_register: u64,
    pub ring: RingRegisters,
    pub cq: CqRegisters,
    pub hw_pi_range: Option<u64>,
    pub tdr: Option<TdrDesc>,
}
