// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Processor cores and engine clusters.

use crate::completion_group::CompletionGroup;
use crate::driver::DeviceDriver;
use crate::platform::PlatformInfo;
use crate::stream::Stream;
use std::sync::Arc;

/// Engine family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreType {
    Tpc,
    Mme,
    Edma,
    Pdma,
    Rotator,
    Nic,
}

/// Scheduler payload: the streams it drains and the groups it completes.
#[derive(Debug, Default)]
pub struct SchedulerCore {
    pub(crate) streams: Vec<Arc<Stream>>,
    pub(crate) completion_groups: Vec<Arc<CompletionGroup>>,
}

impl SchedulerCore {
    pub fn stream(&self, index: u32) -> Option<&Arc<Stream>> {
        self.streams.iter().find(|s| {
            matches!(s.owner(), crate::stream::StreamOwner::Scheduler { index: i, .. } if *i == index)
        })
    }

    pub fn completion_group(&self, index: u32) -> Option<&Arc<CompletionGroup>> {
        self.completion_groups.iter().find(|cg| {
            matches!(
                cg.linkage(),
                crate::completion_group::CompletionGroupLinkage::Scheduler { index: i, .. } if *i == index
            )
        })
    }
}

/// Role of a core as configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreRole {
    Scheduler,
    Engine { core_type: CoreType },
    Nic { ports: Vec<u32> },
    Cme,
}

/// Runtime kind of a core. Only schedulers own streams and completion groups.
#[derive(Debug)]
pub enum CoreKind {
    Scheduler(SchedulerCore),
    Engine { core_type: CoreType },
    Nic { ports: Vec<u32> },
    Cme,
}

impl CoreKind {
    pub fn role(&self) -> CoreRole {
        match self {
            CoreKind::Scheduler(_) => CoreRole::Scheduler,
            CoreKind::Engine { core_type } => CoreRole::Engine { core_type: *core_type },
            CoreKind::Nic { ports } => CoreRole::Nic { ports: ports.clone() },
            CoreKind::Cme => CoreRole::Cme,
        }
    }
}

/// Snapshot of a core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreInfo {
    pub name: String,
    pub index: u32,
    pub qman: String,
    pub qman_id: u32,
    pub dccm_device_address: u64,
    pub dccm_message_queue_address: u64,
    pub hd_core: u32,
    pub is_scheduler: bool,
}

/// One processor core.
#[derive(Debug)]
pub struct Core {
    pub(crate) id: u32,
    pub(crate) name: String,
    pub(crate) qman: String,
    pub(crate) qman_id: u32,
    pub(crate) dccm_device_address: u64,
    pub(crate) dccm_message_queue_address: u64,
    pub(crate) register_base: u64,
    pub(crate) hd_core: u32,
    pub(crate) kind: CoreKind,
}

impl Core {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &CoreKind {
        &self.kind
    }

    pub fn is_scheduler(&self) -> bool {
        matches!(self.kind, CoreKind::Scheduler(_))
    }

    pub fn as_scheduler(&self) -> Option<&SchedulerCore> {
        match &self.kind {
            CoreKind::Scheduler(sched) => Some(sched),
            _ => None,
        }
    }

    /// Address of the heartbeat register firmware bumps while alive.
    pub fn heartbeat_address(&self, platform: &PlatformInfo) -> u64 {
        let offset = match self.kind {
            CoreKind::Scheduler(_) => platform.heartbeat_offset_sched,
            CoreKind::Cme => platform.heartbeat_offset_cme,
            CoreKind::Engine { .. } | CoreKind::Nic { .. } => platform.heartbeat_offset_eng,
        };
        self.register_base + offset
    }

    pub fn heartbeat(&self, driver: &dyn DeviceDriver, platform: &PlatformInfo) -> u32 {
        driver.read_register(self.heartbeat_address(platform))
    }

    pub fn info(&self) -> CoreInfo {
        CoreInfo {
            name: self.name.clone(),
            index: self.id,
            qman: self.qman.clone(),
            qman_id: self.qman_id,
            dccm_device_address: self.dccm_device_address,
            dccm_message_queue_address: self.dccm_message_queue_address,
            hd_core: self.hd_core,
            is_scheduler: self.is_scheduler(),
        }
    }
}

/// Snapshot of a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub name: String,
    pub core_type: Option<CoreType>,
    pub num_engines: u32,
    pub num_completions: u32,
    pub engines: Vec<String>,
}

/// Named group of engines working as one unit.
#[derive(Debug)]
pub struct Cluster {
    pub(crate) name: String,
    pub(crate) core_type: Option<CoreType>,
    pub(crate) engines: Vec<Arc<Core>>,
}

impl Cluster {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engines(&self) -> &[Arc<Core>] {
        &self.engines
    }

    /// Completion signals one job on this cluster produces.
    pub fn num_completions(&self, platform: &PlatformInfo) -> u32 {
        let engines = self.engines.len() as u32;
        match self.core_type {
            _ if engines == 0 => 1,
            Some(CoreType::Mme) => engines * platform.signals_per_mme,
            _ => engines,
        }
    }

    pub fn info(&self, platform: &PlatformInfo) -> ClusterInfo {
        ClusterInfo {
            name: self.name.clone(),
            core_type: self.core_type,
            num_engines: self.engines.len() as u32,
            num_completions: self.num_completions(platform),
            engines: self.engines.iter().map(|e| e.name.clone()).collect(),
        }
    }
}
