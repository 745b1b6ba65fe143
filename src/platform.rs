// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Per-platform constants.

/// Accelerator generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Platform {
    Gaudi2,
    #[default]
    Gaudi3,
}

/// Register layout facts that differ between platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformInfo {
    /// Heartbeat register offset inside a scheduler's register block.
    pub heartbeat_offset_sched: u64,
    pub sizeof_sched_regs: u64,
    /// Heartbeat register offset inside an engine's register block.
    pub heartbeat_offset_eng: u64,
    pub sizeof_eng_regs: u64,
    /// Heartbeat register offset for the CME core.
    pub heartbeat_offset_cme: u64,
    /// Completion signals emitted by one MME engine.
    pub signals_per_mme: u32,
}

const GAUDI2_INFO: PlatformInfo = PlatformInfo {
    heartbeat_offset_sched: 0x10,
    sizeof_sched_regs: 0x80,
    heartbeat_offset_eng: 0x08,
    sizeof_eng_regs: 0x40,
    heartbeat_offset_cme: 0,
    signals_per_mme: 2,
};

const GAUDI3_INFO: PlatformInfo = PlatformInfo {
    heartbeat_offset_sched: 0x18,
    sizeof_sched_regs: 0x100,
    heartbeat_offset_eng: 0x0c,
    sizeof_eng_regs: 0x80,
    heartbeat_offset_cme: 0x20,
    signals_per_mme: 4,
};

const _: () = assert!(GAUDI2_INFO.heartbeat_offset_sched < GAUDI2_INFO.sizeof_sched_regs);
const _: () = assert!(GAUDI2_INFO.heartbeat_offset_eng < GAUDI2_INFO.sizeof_eng_regs);
const _: () = assert!(GAUDI3_INFO.heartbeat_offset_sched < GAUDI3_INFO.sizeof_sched_regs);
const _: () = assert!(GAUDI3_INFO.heartbeat_offset_eng < GAUDI3_INFO.sizeof_eng_regs);

impl Platform {
    pub const fn info(self) -> &'static PlatformInfo {
        match self {
            Platform::Gaudi2 => &GAUDI2_INFO,
            Platform::Gaudi3 => &GAUDI3_INFO,
        }
    }

    /// Whether the platform has a CME core.
    pub const fn has_cme(self) -> bool {
        matches!(self, Platform::Gaudi3)
    }
}
