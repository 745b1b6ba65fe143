// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Runtime instance: every object built for one open device.

use crate::completion_group::{
    CompletionCounter, CompletionGroup, CompletionGroupLinkage, CompletionGroupParts, GroupKind, TdrState,
    WaitContext,
};
use crate::config::{RuntimeConfig, Timeouts};
use crate::cores::{Cluster, Core, CoreKind, CoreRole, SchedulerCore};
use crate::driver::{CounterBlock, DeviceDriver};
use crate::error::{ScalError, ScalResult};
use crate::fence::{HostFenceCounter, HostFenceCounterParts};
use crate::pdma::{DirectModePdmaChannel, PdmaChannelParts};
use crate::platform::Platform;
use crate::pool::{page_size, Pool};
use crate::stream::{Stream, StreamOwner};
use crate::sync_manager::{MonitorPool, Monitors, SmInfo, SyncManager, SyncObjectPool, SyncObjects};
use crate::tdr::BgWork;
use crate::topology::{CompletionGroupDesc, TdrDesc, Topology};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Monitors reserved for one stuck-engine detector.
const TDR_MONITORS: u32 = 3;

/// Every object of one open device, addressable by name or index.
pub struct ScalInstance {
    fd: i32,
    platform: Platform,
    config: RuntimeConfig,
    driver: Arc<dyn DeviceDriver>,
    ctx: Arc<WaitContext>,
    counters: Arc<CounterBlock>,
    pools: Vec<Arc<Pool>>,
    sync_managers: BTreeMap<u32, Arc<SyncManager>>,
    so_pools: HashMap<String, Arc<SyncObjectPool>>,
    monitor_pools: HashMap<String, Arc<MonitorPool>>,
    cores: Vec<Arc<Core>>,
    clusters: HashMap<String, Arc<Cluster>>,
    completion_groups: Vec<Arc<CompletionGroup>>,
    streams: Vec<Arc<Stream>>,
    host_fence_counters: HashMap<String, Arc<HostFenceCounter>>,
    pdma_channels: BTreeMap<u32, Arc<DirectModePdmaChannel>>,
    bg_work: BgWork,
}

impl std::fmt::Debug for ScalInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalInstance")
            .field("fd", &self.fd)
            .field("platform", &self.platform)
            .field("pools", &self.pools.len())
            .field("cores", &self.cores.len())
            .field("completion_groups", &self.completion_groups.len())
            .field("streams", &self.streams.len())
            .finish()
    }
}

fn unique<'a>(kind: &'static str, names: impl Iterator<Item = &'a str>) -> ScalResult<()> {
    let mut seen = std::collections::HashSet::new();
    for name in names {
        if name.is_empty() {
            return Err(ScalError::InvalidConfig(format!("unnamed {kind}")));
        }
        if !seen.insert(name) {
            return Err(ScalError::InvalidConfig(format!("duplicate {kind} '{name}'")));
        }
    }
    Ok(())
}

/// Mutable state while the topology is turned into objects.
struct Builder {
    stub: bool,
    ctx: Arc<WaitContext>,
    counters: Arc<CounterBlock>,
    next_counter: u32,
    sync_managers: BTreeMap<u32, SyncManager>,
    so_pools: HashMap<String, Arc<SyncObjectPool>>,
    monitor_pools: HashMap<String, Arc<MonitorPool>>,
}

impl Builder {
    fn kind(&self) -> GroupKind {
        if self.stub {
            GroupKind::Stub
        } else {
            GroupKind::Hardware
        }
    }

    fn so_pool(&self, name: &str) -> ScalResult<&Arc<SyncObjectPool>> {
        self.so_pools
            .get(name)
            .ok_or_else(|| ScalError::not_found("sync object pool", name))
    }

    fn monitor_pool(&self, name: &str) -> ScalResult<&Arc<MonitorPool>> {
        self.monitor_pools
            .get(name)
            .ok_or_else(|| ScalError::not_found("monitor pool", name))
    }

    fn sync_manager(&mut self, index: u32) -> ScalResult<&mut SyncManager> {
        self.sync_managers
            .get_mut(&index)
            .ok_or_else(|| ScalError::not_found("sync manager", index.to_string()))
    }

    fn next_counter(&mut self) -> ScalResult<Arc<CompletionCounter>> {
        let index = self.next_counter;
        if index as usize >= self.counters.len() {
            return Err(ScalError::InvalidConfig("completion counter block too small".into()));
        }
        self.next_counter += 1;
        Ok(Arc::new(CompletionCounter::new(Arc::clone(&self.counters), index)))
    }

    fn tdr(&mut self, desc: &TdrDesc) -> ScalResult<TdrState> {
        let so_index = self.so_pool(&desc.so_pool)?.reserve(1)?;
        let monitor_base = self.monitor_pool(&desc.monitor_pool)?.reserve(TDR_MONITORS)?;
        let cq_index = self.sync_manager(desc.sm_index)?.allocate_cq_index()?;
        Ok(TdrState {
            sm_index: desc.sm_index,
            so_index,
            monitor_base,
            cq_index,
        })
    }

    fn completion_group(&mut self, desc: &CompletionGroupDesc) -> ScalResult<Arc<CompletionGroup>> {
        let so_base = self.so_pool(&desc.so_pool)?.reserve(desc.num_sos)?;
        let mon_base = self.monitor_pool(&desc.monitor_pool)?.reserve(desc.num_monitors)?;
        let cq_index = self.sync_manager(desc.sm_index)?.allocate_cq_index()?;
        let tdr = desc.tdr.as_ref().map(|t| self.tdr(t)).transpose()?;
        let counter = self.next_counter()?;
        let cg = CompletionGroup::new(
            CompletionGroupParts {
                name: desc.name.clone(),
                kind: self.kind(),
                linkage: CompletionGroupLinkage::Scheduler {
                    scheduler: desc.scheduler.clone(),
                    index: desc.index_in_scheduler,
                },
                sm_index: desc.sm_index,
                sos: so_base..so_base + desc.num_sos,
                monitors: mon_base..mon_base + desc.num_monitors,
                cq_index,
                counter,
                interrupt: desc.interrupt,
                force_order: desc.force_order,
                tdr,
            },
            Arc::clone(&self.ctx),
        );
        Ok(Arc::new(cg))
    }
}

impl ScalInstance {
    /// Validate `topology` and build every object it describes.
    pub fn create(
        fd: i32,
        topology: &Topology,
        driver: Arc<dyn DeviceDriver>,
        config: RuntimeConfig,
    ) -> ScalResult<Self> {
        if fd < 0 {
            return Err(ScalError::InvalidParam(format!("bad device fd {fd}")));
        }
        let t = topology;
        unique("pool", t.pools.iter().map(|p| p.name.as_str()))?;
        unique("sync object pool", t.so_pools.iter().map(|p| p.name.as_str()))?;
        unique("monitor pool", t.monitor_pools.iter().map(|p| p.name.as_str()))?;
        unique("core", t.cores.iter().map(|c| c.name.as_str()))?;
        unique("cluster", t.clusters.iter().map(|c| c.name.as_str()))?;
        unique("completion group", t.completion_groups.iter().map(|c| c.name.as_str()))?;
        unique("stream", t.streams.iter().map(|s| s.name.as_str()))?;
        unique("host fence counter", t.host_fence_counters.iter().map(|h| h.name.as_str()))?;

        let pools = t
            .pools
            .iter()
            .enumerate()
            .map(|(i, desc)| Pool::new(i as u32, desc).map(Arc::new))
            .collect::<ScalResult<Vec<_>>>()?;

        let mut sync_managers = BTreeMap::new();
        for desc in &t.sync_managers {
            let sm = SyncManager::new(desc.index, desc.dcore_index, desc.base_address, desc.capacity);
            if sync_managers.insert(desc.index, sm).is_some() {
                return Err(ScalError::InvalidConfig(format!("duplicate sync manager {}", desc.index)));
            }
        }

        // one counter per completion queue, rounded up to whole pages
        let slots = t.completion_groups.len() + t.pdma_channels.len();
        let per_page = (page_size() / 8) as usize;
        let slots = slots.max(1).div_ceil(per_page) * per_page;
        let counters = driver
            .allocate_counters(slots)
            .map_err(|e| ScalError::Failure(format!("mapping completion counters: {e}")))?;

        let ctx = Arc::new(WaitContext::new(
            Arc::clone(&driver),
            config.timeouts,
            config.progress_scope,
        ));

        let mut b = Builder {
            stub: config.stub,
            ctx: Arc::clone(&ctx),
            counters: Arc::clone(&counters),
            next_counter: 0,
            sync_managers,
            so_pools: HashMap::new(),
            monitor_pools: HashMap::new(),
        };

        for desc in &t.so_pools {
            let pool = b
                .sync_manager(desc.sm_index)?
                .add_pool::<SyncObjects>(&desc.name, desc.base_index, desc.size)?;
            b.so_pools.insert(desc.name.clone(), pool);
        }
        for desc in &t.monitor_pools {
            let pool = b
                .sync_manager(desc.sm_index)?
                .add_pool::<Monitors>(&desc.name, desc.base_index, desc.size)?;
            b.monitor_pools.insert(desc.name.clone(), pool);
        }

        let scheduler_names: Vec<&str> = t
            .cores
            .iter()
            .filter(|c| c.role == CoreRole::Scheduler)
            .map(|c| c.name.as_str())
            .collect();
        let check_scheduler = |owner: &str, name: &str| {
            if scheduler_names.iter().any(|s| *s == name) {
                Ok(())
            } else {
                Err(ScalError::InvalidConfig(format!(
                    "{owner} references unknown scheduler '{name}'"
                )))
            }
        };

        let mut completion_groups = Vec::with_capacity(slots);
        for desc in &t.completion_groups {
            check_scheduler(&desc.name, &desc.scheduler)?;
            completion_groups.push(b.completion_group(desc)?);
        }

        let mut streams = Vec::with_capacity(t.streams.len());
        for desc in &t.streams {
            check_scheduler(&desc.name, &desc.scheduler)?;
            let stream = Stream::new(
                desc.name.clone(),
                StreamOwner::Scheduler {
                    core: desc.scheduler.clone(),
                    index: desc.index,
                },
                desc.registers,
                desc.priority,
                desc.hw_pi_range,
                config.stub,
                Arc::clone(&driver),
            )?;
            streams.push(Arc::new(stream));
        }

        let mut pdma_channels = BTreeMap::new();
        for desc in &t.pdma_channels {
            if pdma_channels.contains_key(&desc.channel_id) {
                return Err(ScalError::InvalidConfig(format!(
                    "duplicate direct-mode channel {}",
                    desc.channel_id
                )));
            }
            let stream_name = format!("{}{}", desc.stream_set, desc.index);
            let cg_name = format!("{}_completion_queue{}", desc.stream_set, desc.index);
            if streams.iter().any(|s| s.name() == stream_name)
                || completion_groups.iter().any(|c| c.name() == cg_name)
            {
                return Err(ScalError::InvalidConfig(format!(
                    "direct-mode channel {} reuses name '{stream_name}'",
                    desc.channel_id
                )));
            }

            let stream = Arc::new(Stream::new(
                stream_name,
                StreamOwner::Direct {
                    channel_id: desc.channel_id,
                },
                desc.ring,
                desc.priority,
                desc.hw_pi_range,
                config.stub,
                Arc::clone(&driver),
            )?);
            let tdr = desc.tdr.as_ref().map(|d| b.tdr(d)).transpose()?;
            let counter = b.next_counter()?;
            let cg = Arc::new(CompletionGroup::new(
                CompletionGroupParts {
                    name: cg_name,
                    kind: b.kind(),
                    linkage: CompletionGroupLinkage::Direct {
                        channel_id: desc.channel_id,
                    },
                    sm_index: tdr.map_or(0, |t| t.sm_index),
                    sos: 0..0,
                    monitors: 0..0,
                    cq_index: counter.index(),
                    counter,
                    interrupt: desc.interrupt,
                    force_order: true,
                    tdr,
                },
                Arc::clone(&ctx),
            ));
            let channel = DirectModePdmaChannel::new(PdmaChannelParts {
                channel_id: desc.channel_id,
                engine_name: desc.engine_name.clone(),
                qman_id: desc.qman_id,
                stream: Arc::clone(&stream),
                completion_group: Arc::clone(&cg),
                fence_counter_address: desc.fence_counter_address,
                isr_register: desc.isr_register,
                cq: desc.cq,
                driver: Arc::clone(&driver),
            });
            channel.init_channel_cq()?;
            streams.push(stream);
            completion_groups.push(cg);
            pdma_channels.insert(desc.channel_id, Arc::new(channel));
        }

        for cg in &completion_groups {
            ctx.watch(cg);
        }

        let Builder {
            sync_managers,
            so_pools,
            monitor_pools,
            ..
        } = b;
        let sync_managers: BTreeMap<u32, Arc<SyncManager>> =
            sync_managers.into_iter().map(|(i, sm)| (i, Arc::new(sm))).collect();

        let mut host_fence_counters = HashMap::new();
        for desc in &t.host_fence_counters {
            let cg = completion_groups
                .iter()
                .find(|c| c.name() == desc.completion_group)
                .ok_or_else(|| ScalError::not_found("completion group", desc.completion_group.as_str()))?;
            let so_pool = so_pools
                .get(&desc.so_pool)
                .ok_or_else(|| ScalError::not_found("sync object pool", desc.so_pool.as_str()))?;
            let mon_pool = monitor_pools
                .get(&desc.monitor_pool)
                .ok_or_else(|| ScalError::not_found("monitor pool", desc.monitor_pool.as_str()))?;
            if so_pool.sm_index() != mon_pool.sm_index() {
                return Err(ScalError::InvalidConfig(format!(
                    "host fence counter '{}': SO and monitor pools are on different sync managers",
                    desc.name
                )));
            }
            let sm = sync_managers
                .get(&mon_pool.sm_index())
                .ok_or_else(|| ScalError::not_found("sync manager", mon_pool.sm_index().to_string()))?;
            if !cg.attach_fence_counter(&desc.name) {
                return Err(ScalError::InvalidConfig(format!(
                    "completion group '{}' already backs a host fence counter",
                    cg.name()
                )));
            }
            let fence = HostFenceCounter::new(HostFenceCounterParts {
                name: desc.name.clone(),
                completion_group: Arc::clone(cg),
                sync_manager: Arc::clone(sm),
                driver: Arc::clone(&driver),
                so_index: so_pool.reserve(1)?,
                monitor_base: mon_pool.reserve(1)?,
                interrupt: desc.interrupt,
                isr_enabled: desc.isr_enabled,
                doorbell: desc.doorbell,
            });
            host_fence_counters.insert(desc.name.clone(), Arc::new(fence));
        }

        let mut cores = Vec::with_capacity(t.cores.len());
        for desc in &t.cores {
            let kind = match &desc.role {
                CoreRole::Scheduler => CoreKind::Scheduler(SchedulerCore {
                    streams: streams
                        .iter()
                        .filter(|s| matches!(s.owner(), StreamOwner::Scheduler { core, .. } if *core == desc.name))
                        .cloned()
                        .collect(),
                    completion_groups: completion_groups
                        .iter()
                        .filter(|c| c.scheduler() == Some(desc.name.as_str()))
                        .cloned()
                        .collect(),
                }),
                CoreRole::Engine { core_type } => CoreKind::Engine { core_type: *core_type },
                CoreRole::Nic { ports } => CoreKind::Nic { ports: ports.clone() },
                CoreRole::Cme => CoreKind::Cme,
            };
            cores.push(Arc::new(Core {
                id: desc.id,
                name: desc.name.clone(),
                qman: desc.qman.clone(),
                qman_id: desc.qman_id,
                dccm_device_address: desc.dccm_device_address,
                dccm_message_queue_address: desc.dccm_message_queue_address,
                register_base: desc.register_base,
                hd_core: desc.hd_core,
                kind,
            }));
        }

        let mut clusters = HashMap::new();
        for desc in &t.clusters {
            let engines = desc
                .engines
                .iter()
                .map(|name| {
                    cores
                        .iter()
                        .find(|c| c.name() == name.as_str())
                        .cloned()
                        .ok_or_else(|| ScalError::not_found("core", name.as_str()))
                })
                .collect::<ScalResult<Vec<_>>>()?;
            clusters.insert(
                desc.name.clone(),
                Arc::new(Cluster {
                    name: desc.name.clone(),
                    core_type: desc.core_type,
                    engines,
                }),
            );
        }

        log::info!(
            "scal fd {fd}: {:?}, {} pools, {} cores, {} completion groups, {} streams, {} direct channels{}",
            t.platform,
            pools.len(),
            cores.len(),
            completion_groups.len(),
            streams.len(),
            pdma_channels.len(),
            if config.stub { " (stub)" } else { "" }
        );

        Ok(Self {
            fd,
            platform: t.platform,
            config,
            driver,
            ctx,
            counters,
            pools,
            sync_managers,
            so_pools,
            monitor_pools,
            cores,
            clusters,
            completion_groups,
            streams,
            host_fence_counters,
            pdma_channels,
            bg_work: BgWork::new(),
        })
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    /// Counter block shared by every completion queue.
    pub fn counters(&self) -> &Arc<CounterBlock> {
        &self.counters
    }

    pub fn pool_by_name(&self, name: &str) -> ScalResult<Arc<Pool>> {
        self.pools
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| ScalError::not_found("pool", name))
    }

    pub fn pool_by_id(&self, id: u32) -> ScalResult<Arc<Pool>> {
        self.pools
            .get(id as usize)
            .cloned()
            .ok_or_else(|| ScalError::not_found("pool", id.to_string()))
    }

    pub fn core_by_name(&self, name: &str) -> ScalResult<Arc<Core>> {
        self.cores
            .iter()
            .find(|c| c.name() == name)
            .cloned()
            .ok_or_else(|| ScalError::not_found("core", name))
    }

    pub fn core_by_id(&self, id: u32) -> ScalResult<Arc<Core>> {
        self.cores
            .iter()
            .find(|c| c.id() == id)
            .cloned()
            .ok_or_else(|| ScalError::not_found("core", id.to_string()))
    }

    pub fn cores(&self) -> &[Arc<Core>] {
        &self.cores
    }

    pub fn stream_by_name(&self, name: &str) -> ScalResult<Arc<Stream>> {
        self.streams
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .ok_or_else(|| ScalError::not_found("stream", name))
    }

    pub fn stream_by_index(&self, scheduler: &Core, index: u32) -> ScalResult<Arc<Stream>> {
        let sched = scheduler.as_scheduler().ok_or_else(|| {
            ScalError::InvalidParam(format!("core '{}' is not a scheduler", scheduler.name()))
        })?;
        sched
            .stream(index)
            .cloned()
            .ok_or_else(|| ScalError::not_found("stream", format!("{}[{index}]", scheduler.name())))
    }

    pub fn completion_group_by_name(&self, name: &str) -> ScalResult<Arc<CompletionGroup>> {
        self.completion_groups
            .iter()
            .find(|c| c.name() == name)
            .cloned()
            .ok_or_else(|| ScalError::not_found("completion group", name))
    }

    pub fn completion_group_by_index(&self, scheduler: &Core, index: u32) -> ScalResult<Arc<CompletionGroup>> {
        let sched = scheduler.as_scheduler().ok_or_else(|| {
            ScalError::InvalidParam(format!("core '{}' is not a scheduler", scheduler.name()))
        })?;
        sched
            .completion_group(index)
            .cloned()
            .ok_or_else(|| ScalError::not_found("completion group", format!("{}[{index}]", scheduler.name())))
    }

    pub fn completion_groups(&self) -> &[Arc<CompletionGroup>] {
        &self.completion_groups
    }

    pub fn so_pool_by_name(&self, name: &str) -> ScalResult<Arc<SyncObjectPool>> {
        self.so_pools
            .get(name)
            .cloned()
            .ok_or_else(|| ScalError::not_found("sync object pool", name))
    }

    pub fn monitor_pool_by_name(&self, name: &str) -> ScalResult<Arc<MonitorPool>> {
        self.monitor_pools
            .get(name)
            .cloned()
            .ok_or_else(|| ScalError::not_found("monitor pool", name))
    }

    pub fn host_fence_counter_by_name(&self, name: &str) -> ScalResult<Arc<HostFenceCounter>> {
        self.host_fence_counters
            .get(name)
            .cloned()
            .ok_or_else(|| ScalError::not_found("host fence counter", name))
    }

    pub fn cluster_by_name(&self, name: &str) -> ScalResult<Arc<Cluster>> {
        self.clusters
            .get(name)
            .cloned()
            .ok_or_else(|| ScalError::not_found("cluster", name))
    }

    pub fn pdma_channel(&self, channel_id: u32) -> ScalResult<Arc<DirectModePdmaChannel>> {
        self.pdma_channels
            .get(&channel_id)
            .cloned()
            .ok_or_else(|| ScalError::not_found("direct-mode channel", channel_id.to_string()))
    }

    pub fn sm_info(&self, index: u32) -> ScalResult<SmInfo> {
        self.sync_managers
            .get(&index)
            .map(|sm| sm.info())
            .ok_or_else(|| ScalError::not_found("sync manager", index.to_string()))
    }

    pub fn timeouts(&self) -> Timeouts {
        self.ctx.timeouts().get()
    }

    pub fn set_timeouts(&self, timeouts: Timeouts) {
        log::info!(
            "scal fd {}: timeout {} us, no-progress timeout {} us",
            self.fd,
            timeouts.timeout_us,
            timeouts.no_progress_timeout_us
        );
        self.ctx.timeouts().set(timeouts);
    }

    pub fn disable_timeouts(&self, disabled: bool) {
        self.ctx.timeouts().set_disabled(disabled);
    }

    /// One pass of the background health check.
    pub fn bg_work(&self) -> ScalResult<()> {
        self.bg_work.run(
            &self.completion_groups,
            &self.cores,
            self.ctx.driver().as_ref(),
            self.platform.info(),
            self.timeouts(),
        )
    }
}

impl Drop for ScalInstance {
    fn drop(&mut self) {
        for stream in &self.streams {
            stream.shutdown();
        }
        log::debug!("scal fd {}: closed", self.fd);
    }
}
