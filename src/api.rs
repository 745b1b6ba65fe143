// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Handle-based operation surface.
//!
//! [`ScalOps`] is the operation table. Every method has a built-in default,
//! so [`BuiltinOps`] is just the empty implementation and an
//! [`Interceptor`] overrides only what it needs. [`Scal`] is the entry
//! point: it opens and closes instances through an [`InstanceRegistry`]
//! and hands out whichever table is active.

use crate::completion_group::{CompletionGroup, CompletionGroupInfo, CompletionGroupInfoV2};
use crate::config::{RuntimeConfig, Timeouts};
use crate::cores::{Cluster, ClusterInfo, Core, CoreInfo};
use crate::driver::DeviceDriver;
use crate::error::{ScalError, ScalResult};
use crate::fence::{HostFenceCounter, HostFenceCounterInfo};
use crate::instance::ScalInstance;
use crate::pool::{Buffer, BufferInfo, Pool, PoolInfo};
use crate::registry::InstanceRegistry;
use crate::stream::{Stream, StreamInfo, StreamPriority};
use crate::sync_manager::{MonitorPool, SmInfo, SyncObjectPool};
use crate::topology::Topology;
use std::sync::Arc;

fn named(kind: &str, name: &str) -> ScalResult<()> {
    if name.is_empty() {
        Err(ScalError::InvalidParam(format!("empty {kind} name")))
    } else {
        Ok(())
    }
}

/// The runtime's operation table.
#[allow(unused_variables)]
pub trait ScalOps: Send + Sync {
    fn get_fd(&self, scal: &ScalInstance) -> i32 {
        scal.fd()
    }

    fn get_pool_handle_by_name(&self, scal: &ScalInstance, name: &str) -> ScalResult<Arc<Pool>> {
        named("pool", name)?;
        scal.pool_by_name(name)
    }

    fn get_pool_handle_by_id(&self, scal: &ScalInstance, id: u32) -> ScalResult<Arc<Pool>> {
        scal.pool_by_id(id)
    }

    fn pool_get_info(&self, pool: &Pool) -> PoolInfo {
        pool.info()
    }

    fn get_core_handle_by_name(&self, scal: &ScalInstance, name: &str) -> ScalResult<Arc<Core>> {
        named("core", name)?;
        scal.core_by_name(name)
    }

    fn get_core_handle_by_id(&self, scal: &ScalInstance, id: u32) -> ScalResult<Arc<Core>> {
        scal.core_by_id(id)
    }

    fn core_get_info(&self, core: &Core) -> CoreInfo {
        core.info()
    }

    fn core_heartbeat(&self, scal: &ScalInstance, core: &Core) -> u32 {
        core.heartbeat(scal.driver().as_ref(), scal.platform().info())
    }

    fn get_cluster_handle_by_name(&self, scal: &ScalInstance, name: &str) -> ScalResult<Arc<Cluster>> {
        named("cluster", name)?;
        scal.cluster_by_name(name)
    }

    fn cluster_get_info(&self, scal: &ScalInstance, cluster: &Cluster) -> ClusterInfo {
        cluster.info(scal.platform().info())
    }

    fn get_so_pool_handle_by_name(&self, scal: &ScalInstance, name: &str) -> ScalResult<Arc<SyncObjectPool>> {
        named("sync object pool", name)?;
        scal.so_pool_by_name(name)
    }

    fn get_monitor_pool_handle_by_name(&self, scal: &ScalInstance, name: &str) -> ScalResult<Arc<MonitorPool>> {
        named("monitor pool", name)?;
        scal.monitor_pool_by_name(name)
    }

    fn get_sm_info(&self, scal: &ScalInstance, index: u32) -> ScalResult<SmInfo> {
        scal.sm_info(index)
    }

    fn allocate_buffer(&self, pool: &Arc<Pool>, size: u64) -> ScalResult<Arc<Buffer>> {
        pool.allocate(size)
    }

    fn allocate_aligned_buffer(&self, pool: &Arc<Pool>, size: u64, alignment: u64) -> ScalResult<Arc<Buffer>> {
        pool.allocate_aligned(size, alignment)
    }

    /// Release the caller's handle. The block returns to its pool once no
    /// stream holds the buffer either.
    fn free_buffer(&self, buffer: Arc<Buffer>) -> ScalResult<()> {
        drop(buffer);
        Ok(())
    }

    fn buffer_get_info(&self, buffer: &Buffer) -> BufferInfo {
        buffer.info()
    }

    fn get_stream_handle_by_name(&self, scal: &ScalInstance, name: &str) -> ScalResult<Arc<Stream>> {
        named("stream", name)?;
        scal.stream_by_name(name)
    }

    fn get_stream_by_index(&self, scal: &ScalInstance, scheduler: &Core, index: u32) -> ScalResult<Arc<Stream>> {
        scal.stream_by_index(scheduler, index)
    }

    fn stream_set_buffer(&self, stream: &Stream, buffer: Arc<Buffer>) -> ScalResult<()> {
        stream.set_buffer(buffer)
    }

    fn stream_set_priority(&self, stream: &Stream, priority: StreamPriority) -> ScalResult<()> {
        stream.set_priority(priority)
    }

    fn stream_submit(&self, stream: &Stream, pi: u64, alignment: u64) -> ScalResult<()> {
        stream.submit(pi, alignment)
    }

    fn stream_get_info(&self, stream: &Stream) -> ScalResult<StreamInfo> {
        stream.info()
    }

    fn get_completion_group_handle_by_name(
        &self,
        scal: &ScalInstance,
        name: &str,
    ) -> ScalResult<Arc<CompletionGroup>> {
        named("completion group", name)?;
        scal.completion_group_by_name(name)
    }

    fn get_completion_group_by_index(
        &self,
        scal: &ScalInstance,
        scheduler: &Core,
        index: u32,
    ) -> ScalResult<Arc<CompletionGroup>> {
        scal.completion_group_by_index(scheduler, index)
    }

    fn completion_group_wait(&self, cg: &CompletionGroup, target: u64, timeout_us: u64) -> ScalResult<()> {
        cg.wait(target, timeout_us)
    }

    fn completion_group_wait_always_interrupt(
        &self,
        cg: &CompletionGroup,
        target: u64,
        timeout_us: u64,
    ) -> ScalResult<()> {
        cg.wait_always_interrupt(target, timeout_us)
    }

    fn completion_group_register_timestamp(
        &self,
        cg: &CompletionGroup,
        target: u64,
        timestamps_handle: u64,
        timestamps_offset: u32,
    ) -> ScalResult<()> {
        cg.register_timestamp(target, timestamps_handle, timestamps_offset)
    }

    fn completion_group_set_expected_counter(&self, cg: &CompletionGroup, value: u64) -> ScalResult<()> {
        cg.set_expected_counter(value);
        Ok(())
    }

    fn completion_group_get_info(&self, cg: &CompletionGroup) -> CompletionGroupInfo {
        cg.info()
    }

    fn completion_group_get_info_v2(&self, cg: &CompletionGroup) -> CompletionGroupInfoV2 {
        cg.info_v2()
    }

    fn get_host_fence_counter_handle_by_name(
        &self,
        scal: &ScalInstance,
        name: &str,
    ) -> ScalResult<Arc<HostFenceCounter>> {
        named("host fence counter", name)?;
        scal.host_fence_counter_by_name(name)
    }

    fn host_fence_counter_wait(&self, fence: &HostFenceCounter, credits: u64, timeout_us: u64) -> ScalResult<()> {
        fence.wait(credits, timeout_us)
    }

    fn host_fence_counter_enable_isr(&self, fence: &HostFenceCounter, enable: bool) -> ScalResult<()> {
        fence.enable_isr(enable)
    }

    fn host_fence_counter_get_info(&self, fence: &HostFenceCounter) -> HostFenceCounterInfo {
        fence.info()
    }

    fn set_timeouts(&self, scal: &ScalInstance, timeouts: Timeouts) -> ScalResult<()> {
        scal.set_timeouts(timeouts);
        Ok(())
    }

    fn get_timeouts(&self, scal: &ScalInstance) -> Timeouts {
        scal.timeouts()
    }

    fn disable_timeouts(&self, scal: &ScalInstance, disabled: bool) -> ScalResult<()> {
        scal.disable_timeouts(disabled);
        Ok(())
    }

    fn bg_work(&self, scal: &ScalInstance) -> ScalResult<()> {
        scal.bg_work()
    }

    fn debug_read_reg(&self, scal: &ScalInstance, address: u64) -> ScalResult<u32> {
        Err(ScalError::NotImplemented("debug_read_reg"))
    }

    fn debug_write_reg(&self, scal: &ScalInstance, address: u64, value: u32) -> ScalResult<()> {
        Err(ScalError::NotImplemented("debug_write_reg"))
    }

    fn debug_memcpy(&self, scal: &ScalInstance, src: u64, dst: u64, size: u64) -> ScalResult<()> {
        Err(ScalError::NotImplemented("debug_memcpy"))
    }
}

/// The built-in operation table.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinOps;

impl ScalOps for BuiltinOps {}

/// Source of a replacement operation table.
pub trait Interceptor: Send + Sync {
    /// Build the replacement, given the built-in table to delegate to.
    /// `None` keeps the built-in table.
    fn ops(&self, builtin: Arc<dyn ScalOps>) -> Option<Arc<dyn ScalOps>>;

    /// Called once the last instance using the replacement has closed.
    fn finish(&self) {}
}

/// Entry point of the runtime.
///
/// # Example
///
/// ```rust,no_run
/// use scal::{Scal, ScalResult, SimDevice, Topology};
/// use std::sync::Arc;
///
/// fn main() -> ScalResult<()> {
///     let scal = Scal::new();
///     let instance = scal.init(3, &Topology::default(), Arc::new(SimDevice::new()))?;
///     let ops = scal.ops();
///     println!("opened fd {}", ops.get_fd(&instance));
///     scal.destroy(instance)
/// }
/// ```
pub struct Scal {
    registry: Arc<InstanceRegistry>,
    builtin: Arc<dyn ScalOps>,
    interceptor: Option<Arc<dyn Interceptor>>,
}

impl Default for Scal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scal")
            .field("registry", &self.registry)
            .field("interceptor", &self.interceptor.is_some())
            .finish()
    }
}

impl Scal {
    /// Facade over a fresh, private registry.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(InstanceRegistry::new()))
    }

    /// Facade over a registry shared with other facades.
    pub fn with_registry(registry: Arc<InstanceRegistry>) -> Self {
        Self {
            registry,
            builtin: Arc::new(BuiltinOps),
            interceptor: None,
        }
    }

    /// Offer `interceptor` the operation table when the first instance opens.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// The active operation table.
    pub fn ops(&self) -> Arc<dyn ScalOps> {
        self.registry.ops().unwrap_or_else(|| Arc::clone(&self.builtin))
    }

    /// Open `fd` with the configuration read from the environment.
    pub fn init(
        &self,
        fd: i32,
        topology: &Topology,
        driver: Arc<dyn DeviceDriver>,
    ) -> ScalResult<Arc<ScalInstance>> {
        let config = RuntimeConfig::from_env(driver.timeout_locked_seconds());
        self.init_with_config(fd, topology, driver, config)
    }

    /// Open `fd`, or return the instance already open for it.
    pub fn init_with_config(
        &self,
        fd: i32,
        topology: &Topology,
        driver: Arc<dyn DeviceDriver>,
        config: RuntimeConfig,
    ) -> ScalResult<Arc<ScalInstance>> {
        self.registry.open(fd, self.interceptor.as_ref(), &self.builtin, || {
            ScalInstance::create(fd, topology, driver, config)
        })
    }

    /// Close `scal`. Its objects are released once no other handle holds them.
    pub fn destroy(&self, scal: Arc<ScalInstance>) -> ScalResult<()> {
        self.registry.close(&scal)
    }

    pub fn get_handle_from_fd(&self, fd: i32) -> ScalResult<Arc<ScalInstance>> {
        self.registry
            .get(fd)
            .ok_or_else(|| ScalError::not_found("instance", fd.to_string()))
    }
}
