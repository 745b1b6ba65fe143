// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Basic example driving the runtime against the software device.
//!
//! Run with: `cargo run --example basic`

use scal::topology::{
    CompletionGroupDesc, CoreDesc, HostFenceCounterDesc, PoolDesc, StreamDesc, SyncManagerDesc, SyncPoolDesc,
};
use scal::{
    CoreRole, Platform, PoolKind, RingRegisters, Scal, ScalResult, SimDevice, SmCapacity, StreamPriority, Topology,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const RING: RingRegisters = RingRegisters {
    pi: 0x5000_0000,
    ci: 0x5000_0004,
    base_lo: 0x5000_0008,
    base_hi: 0x5000_000c,
    size: 0x5000_0010,
    priority: Some(0x5000_0014),
};

fn topology() -> Topology {
    let sync_pool = |name: &str, base_index, size| SyncPoolDesc {
        name: name.into(),
        sm_index: 0,
        base_index,
        size,
    };
    let group = |index: u32| CompletionGroupDesc {
        name: format!("compute_completion_queue{index}"),
        scheduler: "sched_compute".into(),
        index_in_scheduler: index,
        sm_index: 0,
        so_pool: "compute_so".into(),
        num_sos: 16,
        monitor_pool: "compute_mon".into(),
        num_monitors: 4,
        interrupt: Some(index + 1),
        force_order: true,
        tdr: None,
    };

    Topology {
        platform: Platform::Gaudi3,
        pools: vec![
            PoolDesc {
                name: "host_shared".into(),
                kind: PoolKind::Host,
                size: 1 << 20,
                device_base: 0x10_0000_0000,
                core_base: 0x4000_0000,
            },
            PoolDesc {
                name: "hbm_shared".into(),
                kind: PoolKind::Hbm,
                size: 16 << 20,
                device_base: 0x20_0000_0000,
                core_base: 0x8000_0000,
            },
        ],
        sync_managers: vec![SyncManagerDesc {
            index: 0,
            dcore_index: 0,
            base_address: 0x3000_0000,
            capacity: SmCapacity {
                sync_objects: 8192,
                monitors: 2048,
                completion_queues: 64,
            },
        }],
        so_pools: vec![sync_pool("compute_so", 0, 128)],
        monitor_pools: vec![sync_pool("compute_mon", 0, 32)],
        cores: vec![CoreDesc {
            id: 0,
            name: "sched_compute".into(),
            qman: "sched_compute_qman".into(),
            qman_id: 0,
            dccm_device_address: 0x100_0000,
            dccm_message_queue_address: 0x100_0800,
            register_base: 0x200_0000,
            hd_core: 0,
            role: CoreRole::Scheduler,
        }],
        completion_groups: vec![group(0), group(1)],
        streams: vec![StreamDesc {
            name: "compute0".into(),
            scheduler: "sched_compute".into(),
            index: 0,
            registers: RING,
            priority: StreamPriority::HIGH,
            hw_pi_range: None,
        }],
        host_fence_counters: vec![HostFenceCounterDesc {
            name: "host_fence0".into(),
            completion_group: "compute_completion_queue1".into(),
            so_pool: "compute_so".into(),
            monitor_pool: "compute_mon".into(),
            interrupt: 9,
            doorbell: 0xfee0_0000,
            isr_enabled: true,
        }],
        ..Topology::default()
    }
}

fn main() -> ScalResult<()> {
    println!("SCAL Basic Example");
    println!("==================\n");

    let dev = Arc::new(SimDevice::new());
    dev.link_drain(RING.pi, RING.ci);
    dev.set_auto_drain(true);

    let scal = Scal::new();
    let instance = scal.init(3, &topology(), dev.clone())?;
    let ops = scal.ops();
    println!("Opened device fd {}", ops.get_fd(&instance));

    // Pools
    let pool = ops.get_pool_handle_by_name(&instance, "hbm_shared")?;
    let info = ops.pool_get_info(&pool);
    println!(
        "  Pool '{}': {} bytes at {:#x}, {} free",
        info.name, info.total_size, info.device_base_address, info.free_size
    );

    // Stream
    let stream = ops.get_stream_handle_by_name(&instance, "compute0")?;
    let buffer = ops.allocate_aligned_buffer(&pool, 1 << 16, 1 << 12)?;
    println!("  Ring buffer at device address {:#x}", buffer.device_address());
    ops.stream_set_buffer(&stream, buffer)?;
    for pi in (1..=4u64).map(|n| n * 4096) {
        ops.stream_submit(&stream, pi, 128)?;
    }
    let info = ops.stream_get_info(&stream)?;
    println!("  Stream '{}': PI {:#x}, hw PI {:#x}", info.name, info.current_pi, info.hw_pi);

    // Completion group: the device signals from another thread
    let cg = ops.get_completion_group_handle_by_name(&instance, "compute_completion_queue0")?;
    let slot = cg.counter().index();
    let signaller = Arc::clone(&dev);
    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        signaller.signal(slot, 4);
    });
    let start = Instant::now();
    ops.completion_group_wait(&cg, 4, 1_000_000)?;
    println!("  Completion group '{}' reached 4 after {:?}", cg.name(), start.elapsed());
    if worker.join().is_err() {
        println!("  Signalling thread panicked");
    }

    // Non-blocking probe
    match ops.completion_group_wait(&cg, 5, 0) {
        Ok(()) => println!("  Target 5 already reached"),
        Err(e) => println!("  Probe for 5: {} ({e})", e.status()),
    }

    // Host fence: credits accumulate
    let fence = ops.get_host_fence_counter_handle_by_name(&instance, "host_fence0")?;
    let fence_slot = fence.completion_group().counter().index();
    dev.signal(fence_slot, 5);
    ops.host_fence_counter_wait(&fence, 3, 1_000_000)?;
    ops.host_fence_counter_wait(&fence, 2, 1_000_000)?;
    println!("  Host fence '{}': {:?}", fence.name(), ops.host_fence_counter_get_info(&fence));

    drop(stream);
    scal.destroy(instance)?;
    println!("\nDone.");
    Ok(())
}
