mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::*;
use gpusub_core::{
    CommandListDesc, CopyRegion, EngineGroup, HostFunction, Image, MemoryRegion, QueueMode, SubmitConfig,
    SubmitError,
};
use gpusub_hw::{HwCaps, HwCmd};
use pretty_assertions::assert_eq;

fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

#[test]
fn unaligned_compute_copy_is_split_and_lands_byte_exact() {
    let h = harness(HwCaps::vfe_single_tile());
    let queue = queue(&h.device, EngineGroup::Compute, QueueMode::Synchronous);
    let src = buffer(&h.device, 256);
    let dst = buffer(&h.device, 256);
    let data = pattern_bytes(100);
    src.write(0, &data).unwrap();

    let mut list = list(&h.device, EngineGroup::Compute);
    list.append_memory_copy(dst.gpu_address() + 4, src.gpu_address(), 100, None, &[])
        .unwrap();
    let flags = list.last_launch_flags();
    assert!(flags.is_builtin_kernel);
    assert!(flags.is_kernel_split_operation);
    assert!(!flags.is_destination_allocation_in_system_memory);
    list.close().unwrap();
    queue.execute_command_lists(&[&list], None, None, &[]).unwrap();

    assert_eq!(dst.bytes(4, 100).unwrap(), data);
    assert_eq!(dst.bytes(0, 4).unwrap(), vec![0; 4]);
    assert_eq!(dst.bytes(104, 8).unwrap(), vec![0; 8]);
    assert_eq!(h.compute.stats().walkers, 3);
}

#[test]
fn aligned_compute_copy_uses_a_single_launch() {
    let h = harness(HwCaps::vfe_single_tile());
    let src = buffer(&h.device, 256);
    let dst = buffer(&h.device, 256);
    let mut list = list(&h.device, EngineGroup::Compute);
    list.append_memory_copy(dst.gpu_address(), src.gpu_address(), 128, None, &[])
        .unwrap();
    assert!(!list.last_launch_flags().is_kernel_split_operation);
}

#[test]
fn copy_engine_blits_copies_and_fills() {
    let h = harness(HwCaps::vfe_single_tile());
    let queue = queue(&h.device, EngineGroup::Copy, QueueMode::Asynchronous);
    let src = buffer(&h.device, 4096);
    let dst = buffer(&h.device, 4096);
    let filled = buffer(&h.device, 4096);
    let data = pattern_bytes(3000);
    src.write(0, &data).unwrap();

    let mut list = list(&h.device, EngineGroup::Copy);
    list.append_memory_copy(dst.gpu_address(), src.gpu_address(), 3000, None, &[])
        .unwrap();
    assert!(!list.last_launch_flags().is_builtin_kernel);
    list.append_memory_fill(filled.gpu_address(), &[0xab, 0xcd, 0xef], 64, None, &[])
        .unwrap();
    list.close().unwrap();
    queue.execute_command_lists(&[&list], None, None, &[]).unwrap();
    queue.synchronize(u64::MAX).unwrap();

    assert_eq!(dst.bytes(0, 3000).unwrap(), data);
    let expected: Vec<u8> = [0xab, 0xcd, 0xef].iter().copied().cycle().take(64).collect();
    assert_eq!(filled.bytes(0, 64).unwrap(), expected);
    assert_eq!(h.copy.stats().walkers, 0);
    assert!(h.copy.stats().blits >= 2);
}

#[test]
fn compute_fill_repeats_the_pattern_across_split_launches() {
    let h = harness(HwCaps::vfe_single_tile());
    let queue = queue(&h.device, EngineGroup::Compute, QueueMode::Synchronous);
    let dst = buffer(&h.device, 256);
    let pattern = [1u8, 2, 3, 4, 5];

    let mut list = list(&h.device, EngineGroup::Compute);
    list.append_memory_fill(dst.gpu_address(), &pattern, 70, None, &[]).unwrap();
    assert!(list.last_launch_flags().is_kernel_split_operation);
    list.close().unwrap();
    queue.execute_command_lists(&[&list], None, None, &[]).unwrap();

    let expected: Vec<u8> = pattern.iter().copied().cycle().take(70).collect();
    assert_eq!(dst.bytes(0, 70).unwrap(), expected);
    assert_eq!(dst.bytes(70, 8).unwrap(), vec![0; 8]);
}

#[test]
fn fill_rejects_oversized_patterns() {
    let h = harness(HwCaps::vfe_single_tile());
    let dst = buffer(&h.device, 256);
    let mut list = list(&h.device, EngineGroup::Compute);
    assert!(matches!(
        list.append_memory_fill(dst.gpu_address(), &[0; 17], 64, None, &[]),
        Err(SubmitError::InvalidArgument(_))
    ));
    assert!(matches!(
        list.append_memory_fill(dst.gpu_address(), &[], 64, None, &[]),
        Err(SubmitError::InvalidArgument(_))
    ));
}

#[test]
fn region_copy_moves_a_pitched_box_on_both_engines() {
    for engine in [EngineGroup::Compute, EngineGroup::Copy] {
        let h = harness(HwCaps::vfe_single_tile());
        let queue = queue(&h.device, engine, QueueMode::Synchronous);
        let src = buffer(&h.device, 16 * 8);
        let dst = buffer(&h.device, 8 * 4);
        let data = pattern_bytes(16 * 8);
        src.write(0, &data).unwrap();

        let mut list = list(&h.device, engine);
        list.append_memory_copy_region(
            &MemoryRegion {
                address: dst.gpu_address(),
                region: CopyRegion::new_2d(0, 0, 4, 4),
                row_pitch: 8,
                slice_pitch: 32,
            },
            &MemoryRegion {
                address: src.gpu_address(),
                region: CopyRegion::new_2d(2, 3, 4, 4),
                row_pitch: 16,
                slice_pitch: 128,
            },
            None,
            &[],
        )
        .unwrap();
        list.close().unwrap();
        queue.execute_command_lists(&[&list], None, None, &[]).unwrap();

        for row in 0..4u64 {
            let start = ((3 + row) * 16 + 2) as usize;
            assert_eq!(dst.bytes(row * 8, 4).unwrap(), data[start..start + 4].to_vec(), "{engine:?} row {row}");
        }
    }
}

#[test]
fn region_copy_rejects_mismatched_extents() {
    let h = harness(HwCaps::vfe_single_tile());
    let src = buffer(&h.device, 256);
    let dst = buffer(&h.device, 256);
    let mut list = list(&h.device, EngineGroup::Compute);
    let res = list.append_memory_copy_region(
        &MemoryRegion {
            address: dst.gpu_address(),
            region: CopyRegion::new_2d(0, 0, 4, 4),
            row_pitch: 16,
            slice_pitch: 256,
        },
        &MemoryRegion {
            address: src.gpu_address(),
            region: CopyRegion::new_2d(0, 0, 4, 2),
            row_pitch: 16,
            slice_pitch: 256,
        },
        None,
        &[],
    );
    assert!(matches!(res, Err(SubmitError::InvalidArgument(_))));
}

#[test]
fn image_copy_copies_every_pixel() {
    let h = harness(HwCaps::vfe_single_tile());
    let queue = queue(&h.device, EngineGroup::Compute, QueueMode::Synchronous);
    let src = Image::new(buffer(&h.device, 8 * 8 * 4), 8, 8, 1, 4);
    let dst = Image::new(buffer(&h.device, 8 * 8 * 4), 8, 8, 1, 4);
    let data = pattern_bytes(8 * 8 * 4);
    src.alloc.write(0, &data).unwrap();

    let mut list = list(&h.device, EngineGroup::Compute);
    list.append_image_copy(&dst, &src, None, &[]).unwrap();
    list.close().unwrap();
    queue.execute_command_lists(&[&list], None, None, &[]).unwrap();

    assert_eq!(dst.alloc.bytes(0, data.len()).unwrap(), data);
}

#[test]
fn copy_only_lists_do_not_count_wait_barriers() {
    let h = harness(HwCaps::vfe_single_tile());
    let event = h.device.create_event().unwrap();
    let src = buffer(&h.device, 256);
    let dst = buffer(&h.device, 256);
    let region = MemoryRegion {
        address: dst.gpu_address(),
        region: CopyRegion::new_2d(0, 0, 4, 4),
        row_pitch: 16,
        slice_pitch: 256,
    };

    let mut copy = list(&h.device, EngineGroup::Copy);
    copy.append_memory_copy(dst.gpu_address(), src.gpu_address(), 64, None, &[&event])
        .unwrap();
    copy.append_memory_copy_region(&region, &region, None, &[&event]).unwrap();
    copy.append_memory_fill(dst.gpu_address(), &[1], 64, None, &[&event]).unwrap();
    assert_eq!(copy.barrier_count(), 0);
    let semaphores = count(&copy.recorded_commands().unwrap(), |c| matches!(c, HwCmd::MiSemaphoreWait(_)));
    assert_eq!(semaphores, 3);

    let mut compute = list(&h.device, EngineGroup::Compute);
    compute
        .append_memory_copy(dst.gpu_address(), src.gpu_address(), 64, None, &[&event])
        .unwrap();
    compute.append_memory_fill(dst.gpu_address(), &[1], 64, None, &[&event]).unwrap();
    compute.append_launch_kernel(&kernel("k"), [1, 1, 1], None, &[&event]).unwrap();
    assert_eq!(compute.barrier_count(), 3);

    copy.append_barrier(None, &[]).unwrap();
    assert_eq!(copy.barrier_count(), 1);
}

#[test]
fn reset_restores_a_fresh_list() {
    let h = harness(HwCaps::cfe_multi_tile());
    let event = h.device.create_event().unwrap();
    let record = |list: &mut gpusub_core::CommandList| {
        list.append_launch_kernel(&kernel("a").with_scratch(1024, 0), [2, 1, 1], None, &[&event])
            .unwrap();
        list.append_launch_kernel(&kernel("b").with_large_grf(), [2, 1, 1], None, &[])
            .unwrap();
        list.close().unwrap();
    };

    let mut list = list(&h.device, EngineGroup::Compute);
    record(&mut list);
    let first = state_programming(&list.recorded_commands().unwrap());
    let first_required = *list.required_state();
    assert_eq!(list.barrier_count(), 1);

    list.reset().unwrap();
    assert!(!list.is_closed());
    assert_eq!(list.barrier_count(), 0);
    assert!(list.commands_to_patch().is_empty());
    assert_eq!(list.per_thread_scratch(), [0, 0]);
    assert!(list.recorded_commands().unwrap().is_empty());

    record(&mut list);
    assert_eq!(state_programming(&list.recorded_commands().unwrap()), first);
    assert_eq!(*list.required_state(), first_required);
}

#[test]
fn multi_partition_events_are_signaled_and_awaited_per_partition() {
    let h = harness(HwCaps::cfe_multi_tile());
    let queue = queue(&h.device, EngineGroup::Compute, QueueMode::Asynchronous);
    let event = h.device.create_event().unwrap();

    let mut producer = list(&h.device, EngineGroup::Compute);
    assert_eq!(producer.partition_count(), 2);
    producer
        .append_launch_kernel(&kernel("produce"), [8, 1, 1], Some(&event), &[])
        .unwrap();
    producer.close().unwrap();
    assert_eq!(event.used_partitions(), 2);

    let mut consumer = list(&h.device, EngineGroup::Compute);
    consumer
        .append_launch_kernel(&kernel("consume"), [8, 1, 1], None, &[&event])
        .unwrap();
    consumer.close().unwrap();
    let waits: Vec<u64> = consumer
        .recorded_commands()
        .unwrap()
        .iter()
        .filter_map(|c| match c {
            HwCmd::MiSemaphoreWait(w) => Some(w.address),
            _ => None,
        })
        .collect();
    assert_eq!(waits, vec![event.partition_address(0), event.partition_address(1)]);

    queue
        .execute_command_lists(&[&producer, &consumer], None, None, &[])
        .unwrap();
    queue.synchronize(u64::MAX).unwrap();
    assert!(event.is_signaled());
    event.host_synchronize(0).unwrap();

    event.reset().unwrap();
    assert_eq!(event.used_partitions(), 1);
    assert_eq!(event.query_status(), Err(SubmitError::NotReady));
}

#[test]
fn internal_lists_run_on_a_single_partition() {
    let h = harness(HwCaps::cfe_multi_tile());
    let internal = gpusub_core::CommandList::create(
        &h.device,
        &CommandListDesc {
            engine: EngineGroup::Compute,
            internal: true,
        },
    )
    .unwrap();
    assert_eq!(internal.partition_count(), 1);
    assert_eq!(list(&h.device, EngineGroup::Copy).partition_count(), 1);
}

#[test]
fn host_function_runs_each_time_the_list_executes() {
    let h = harness(HwCaps::vfe_single_tile());
    let queue = queue(&h.device, EngineGroup::Compute, QueueMode::Asynchronous);
    let calls = Arc::new(AtomicU64::new(0));
    let seen = calls.clone();
    let function = HostFunction {
        callback: Arc::new(move |user_data| {
            seen.fetch_add(user_data, Ordering::SeqCst);
        }),
        user_data: 5,
    };

    let mut list = list(&h.device, EngineGroup::Compute);
    list.append_launch_kernel(&kernel("before"), [1, 1, 1], None, &[]).unwrap();
    list.append_host_function(function, None, &[]).unwrap();
    list.append_launch_kernel(&kernel("after"), [1, 1, 1], None, &[]).unwrap();
    list.close().unwrap();
    assert_eq!(list.commands_to_patch().len(), 4);

    queue.execute_command_lists(&[&list], None, None, &[]).unwrap();
    queue.synchronize(u64::MAX).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(h.compute.stats().walkers, 2);

    queue.execute_command_lists(&[&list], None, None, &[]).unwrap();
    queue.synchronize(u64::MAX).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 10);
}

#[test]
fn prefetch_is_nooped_when_configured() {
    let config = SubmitConfig {
        noop_memory_prefetch: true,
        ..SubmitConfig::default()
    };
    let h = harness_with_config(HwCaps::vfe_single_tile(), config);
    let queue = queue(&h.device, EngineGroup::Compute, QueueMode::Synchronous);
    let target = buffer(&h.device, 4096);

    let mut list = list(&h.device, EngineGroup::Compute);
    list.append_memory_prefetch(target.gpu_address(), 4096).unwrap();
    list.append_launch_kernel(&kernel("k"), [1, 1, 1], None, &[]).unwrap();
    list.close().unwrap();
    let prefetches = |list: &gpusub_core::CommandList| {
        count(&list.recorded_commands().unwrap(), |c| matches!(c, HwCmd::StatePrefetch(_)))
    };
    assert_eq!(prefetches(&list), 1);

    queue.execute_command_lists(&[&list], None, None, &[]).unwrap();
    assert_eq!(prefetches(&list), 0);
    assert_eq!(count(&list.recorded_commands().unwrap(), |c| matches!(c, HwCmd::ComputeWalker(_))), 1);
}

#[test]
fn prefetch_stays_when_not_configured() {
    let h = harness(HwCaps::vfe_single_tile());
    let queue = queue(&h.device, EngineGroup::Compute, QueueMode::Synchronous);
    let target = buffer(&h.device, 4096);
    let mut list = list(&h.device, EngineGroup::Compute);
    list.append_memory_prefetch(target.gpu_address(), 4096).unwrap();
    list.close().unwrap();
    queue.execute_command_lists(&[&list], None, None, &[]).unwrap();
    assert_eq!(
        count(&list.recorded_commands().unwrap(), |c| matches!(c, HwCmd::StatePrefetch(_))),
        1
    );
}

#[test]
fn launch_arguments_are_validated() {
    let h = harness(HwCaps::vfe_single_tile());
    let mut copy = list(&h.device, EngineGroup::Copy);
    assert_eq!(
        copy.append_launch_kernel(&kernel("k"), [1, 1, 1], None, &[]),
        Err(SubmitError::InvalidArgument("kernel launch on a copy-only list"))
    );

    let mut compute = list(&h.device, EngineGroup::Compute);
    assert_eq!(
        compute.append_launch_kernel(&kernel("k"), [4, 0, 1], None, &[]),
        Err(SubmitError::InvalidArgument("group count must be non-zero"))
    );

    let unbacked = compute.append_memory_copy(0xdead_0000_0000, 0xdead_0000_1000, 16, None, &[]);
    assert!(matches!(unbacked, Err(SubmitError::InvalidArgument(_))));
}

#[test]
fn region_barrier_kernels_get_a_zeroed_sync_buffer() {
    let h = harness(HwCaps::vfe_single_tile());
    let mut list = list(&h.device, EngineGroup::Compute);
    list.append_launch_kernel(&kernel("k").with_region_barrier(4), [10, 1, 1], None, &[])
        .unwrap();
    assert_eq!(list.sync_buffers().len(), 1);
    let sync = &list.sync_buffers()[0];
    assert_eq!(sync.bytes(0, 128).unwrap(), vec![0; 128]);
    assert!(list.container().residency().contains(sync.id()));

    let walker = list
        .recorded_commands()
        .unwrap()
        .into_iter()
        .find_map(|c| match c {
            HwCmd::ComputeWalker(w) => Some(w),
            _ => None,
        })
        .unwrap();
    let pointer = u64::from_le_bytes(walker.inline_data[16..24].try_into().unwrap());
    assert_eq!(pointer, sync.gpu_address());
}
