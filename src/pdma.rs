// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Direct-mode PDMA channels.
//!
//! In direct mode the host feeds a DMA engine's ring itself instead of going
//! through a scheduler. Each channel bundles its stream, its completion
//! group and the completion-queue registers that make the engine write the
//! group's counter.

use crate::completion_group::CompletionGroup;
use crate::driver::DeviceDriver;
use crate::error::ScalResult;
use crate::stream::Stream;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::Arc;

bitflags! {
    /// Completion-queue mode register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CqMode: u32 {
        const ENABLE = 1 << 0;
        /// Raise the MSI-X doorbell after each completion.
        const INTERRUPT = 1 << 1;
        /// Counter is incremented instead of overwritten.
        const INCREMENT = 1 << 2;
        /// Counter writes are 64 bits wide.
        const WIDE_COUNTER = 1 << 3;
    }
}

/// Register addresses of a channel's completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqRegisters {
    pub counter_address_lo: u64,
    pub counter_address_hi: u64,
    pub msix_address_lo: u64,
    pub msix_address_hi: u64,
    pub msix_data: u64,
    pub mode: u64,
}

/// Snapshot of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdmaChannelInfo {
    pub channel_id: u32,
    pub engine_name: String,
    pub qman_id: u32,
    pub stream: String,
    pub completion_group: String,
    pub fence_counter_address: u64,
    pub cq_initialized: bool,
}

pub(crate) struct PdmaChannelParts {
    pub channel_id: u32,
    pub engine_name: String,
    pub qman_id: u32,
    pub stream: Arc<Stream>,
    pub completion_group: Arc<CompletionGroup>,
    pub fence_counter_address: u64,
    pub isr_register: u64,
    pub cq: CqRegisters,
    pub driver: Arc<dyn DeviceDriver>,
}

/// Host-driven DMA channel.
pub struct DirectModePdmaChannel {
    channel_id: u32,
    engine_name: String,
    qman_id: u32,
    stream: Arc<Stream>,
    completion_group: Arc<CompletionGroup>,
    fence_counter_address: u64,
    isr_register: u64,
    cq: CqRegisters,
    driver: Arc<dyn DeviceDriver>,
    cq_initialized: Mutex<bool>,
}

impl std::fmt::Debug for DirectModePdmaChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectModePdmaChannel")
            .field("channel_id", &self.channel_id)
            .field("engine_name", &self.engine_name)
            .field("stream", &self.stream.name())
            .finish()
    }
}

impl DirectModePdmaChannel {
    pub(crate) fn new(parts: PdmaChannelParts) -> Self {
        Self {
            channel_id: parts.channel_id,
            engine_name: parts.engine_name,
            qman_id: parts.qman_id,
            stream: parts.stream,
            completion_group: parts.completion_group,
            fence_counter_address: parts.fence_counter_address,
            isr_register: parts.isr_register,
            cq: parts.cq,
            driver: parts.driver,
            cq_initialized: Mutex::new(false),
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    pub fn completion_group(&self) -> &Arc<CompletionGroup> {
        &self.completion_group
    }

    /// Address the fence-increment packet of this channel targets.
    pub fn fence_counter_address(&self) -> u64 {
        self.fence_counter_address
    }

    /// Point the engine's completion queue at the group's counter.
    ///
    /// Only the first call programs the hardware.
    pub fn init_channel_cq(&self) -> ScalResult<()> {
        let mut initialized = self.cq_initialized.lock();
        if *initialized {
            return Ok(());
        }
        if self.completion_group.is_stub() {
            *initialized = true;
            return Ok(());
        }

        let counter = self.completion_group.counter();
        let counter_address = counter.block().slot_device_address(counter.index());
        let driver = &self.driver;
        driver.write_register(self.cq.counter_address_lo, counter_address as u32);
        driver.write_register(self.cq.counter_address_hi, (counter_address >> 32) as u32);

        let mut mode = CqMode::ENABLE | CqMode::INCREMENT | CqMode::WIDE_COUNTER;
        if let Some(line) = self.completion_group.interrupt() {
            driver.write_register(self.cq.msix_address_lo, self.isr_register as u32);
            driver.write_register(self.cq.msix_address_hi, (self.isr_register >> 32) as u32);
            driver.write_register(self.cq.msix_data, line);
            mode |= CqMode::INTERRUPT;
        }
        driver.write_register(self.cq.mode, mode.bits());

        log::debug!(
            "pdma channel {} ({}): completion queue -> {counter_address:#x}, mode {mode:?}",
            self.channel_id,
            self.engine_name
        );
        *initialized = true;
        Ok(())
    }

    /// Submit to the channel's stream. `alignment` is ignored in direct mode.
    pub fn submit(&self, pi: u64, alignment: u64) -> ScalResult<()> {
        self.stream.submit(pi, alignment)
    }

    pub fn info(&self) -> PdmaChannelInfo {
        PdmaChannelInfo {
            channel_id: self.channel_id,
            engine_name: self.engine_name.clone(),
            qman_id: self.qman_id,
            stream: self.stream.name().to_string(),
            completion_group: self.completion_group.name().to_string(),
            fence_counter_address: self.fence_counter_address,
            cq_initialized: *self.cq_initialized.lock(),
        }
    }
}
