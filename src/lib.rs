// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # SCAL: host-side runtime for an AI accelerator
//!
//! This crate owns the host view of one accelerator device: memory pools,
//! sync managers with their sync object and monitor pools, completion
//! groups, command streams and direct-mode DMA channels.
//!
//! ## Pieces
//!
//! | Module               | Provides                                                   |
//! |----------------------|------------------------------------------------------------|
//! | [`pool`]             | memory pools and RAII buffers over a first-fit allocator   |
//! | [`sync_manager`]     | sync object / monitor pools reserved out of a sync manager |
//! | [`completion_group`] | hardware-written counters and the wait protocol            |
//! | [`fence`]            | credit-based host fences on top of a completion group      |
//! | [`stream`]           | command ring buffers with producer-index wraparound        |
//! | [`pdma`]             | DMA channels driven by the host in direct mode             |
//! | [`api`]              | the swappable operation table and the [`Scal`] entry point |
//!
//! The device itself is reached through the [`DeviceDriver`] trait. The
//! crate ships [`SimDevice`], a software device used for simulation runs
//! and tests.
//!
//! ## Example
//!
//! ```rust,no_run
//! use scal::{Scal, ScalResult, SimDevice, Topology};
//! use std::sync::Arc;
//!
//! fn run(topology: &Topology) -> ScalResult<()> {
//!     let scal = Scal::new();
//!     let instance = scal.init(3, topology, Arc::new(SimDevice::new()))?;
//!     let ops = scal.ops();
//!
//!     let pool = ops.get_pool_handle_by_name(&instance, "host_shared")?;
//!     let stream = ops.get_stream_handle_by_name(&instance, "compute0")?;
//!     ops.stream_set_buffer(&stream, ops.allocate_buffer(&pool, 1 << 16)?)?;
//!     ops.stream_submit(&stream, 4096, 128)?;
//!
//!     let cg = ops.get_completion_group_handle_by_name(&instance, "compute_completion_queue0")?;
//!     ops.completion_group_wait(&cg, 1, 1_000_000)?;
//!     scal.destroy(instance)
//! }
//! ```
//!
//! ## Configuration
//!
//! Timeouts, stub mode and interception are read from the environment when
//! an instance is opened; see [`config`].
//!
//! ## Features
//!
//! - `async`: `wait_async` on completion groups and host fences, running
//!   the blocking wait on the tokio blocking pool.

// Module declarations
pub mod allocator;
pub mod api;
#[cfg(feature = "async")]
mod async_wait;
pub mod completion_group;
pub mod config;
pub mod cores;
pub mod driver;
pub mod error;
pub mod fence;
pub mod instance;
pub mod pdma;
pub mod platform;
pub mod pool;
pub mod registry;
pub mod sim;
pub mod stream;
pub mod sync_manager;
pub mod tdr;
pub mod topology;

// Re-exports for convenient access
pub use allocator::{Allocator, AllocatorInfo, HeapAllocator};
pub use api::{BuiltinOps, Interceptor, Scal, ScalOps};
pub use completion_group::{
    CompletionCounter, CompletionGroup, CompletionGroupInfo, CompletionGroupInfoV2, CompletionGroupLinkage,
    GroupKind, TdrState,
};
pub use config::{ProgressScope, RuntimeConfig, Timeouts, WAIT_FOREVER};
pub use cores::{Cluster, ClusterInfo, Core, CoreInfo, CoreKind, CoreRole, CoreType, SchedulerCore};
pub use driver::{CounterBlock, CounterWait, DeviceDriver, DriverError, TimestampRequest, NO_INTERRUPT};
pub use error::{ScalError, ScalResult, ScalStatus};
pub use fence::{HostFenceCounter, HostFenceCounterInfo};
pub use instance::ScalInstance;
pub use pdma::{CqMode, CqRegisters, DirectModePdmaChannel, PdmaChannelInfo};
pub use platform::{Platform, PlatformInfo};
pub use pool::{Buffer, BufferInfo, Pool, PoolInfo, PoolKind};
pub use registry::InstanceRegistry;
pub use sim::SimDevice;
pub use stream::{RingRegisters, Stream, StreamInfo, StreamOwner, StreamPriority};
pub use sync_manager::{MonitorConfig, MonitorPool, SmCapacity, SmInfo, SyncManager, SyncObjectPool, SyncPoolInfo};
pub use tdr::BgWork;
pub use topology::Topology;
