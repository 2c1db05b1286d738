mod rig;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use gpusub_core::{
    CompletionMode, EngineGroup, HostFunction, Kernel, QueueMode, SubmitConfig, SubmitError,
};
use gpusub_hw::{HwCaps, HwCmd};
use rig::Rig;

#[test]
fn copy_engine_waits_for_compute_across_engines() -> Result<()> {
    let rig = Rig::new(
        HwCaps::vfe_single_tile(),
        SubmitConfig::default(),
        CompletionMode::Deferred,
        CompletionMode::Immediate,
    )?;
    let compute_queue = rig.queue(EngineGroup::Compute, QueueMode::Asynchronous)?;
    let copy_queue = rig.queue(EngineGroup::Copy, QueueMode::Asynchronous)?;
    let staging = rig.buffer(256)?;
    let output = rig.buffer(256)?;
    let produced = rig.device.create_event()?;

    let mut producer = rig.list(EngineGroup::Compute)?;
    producer.append_memory_fill(staging.gpu_address(), &[0x5a], 256, Some(&produced), &[])?;
    producer.close()?;

    let mut consumer = rig.list(EngineGroup::Copy)?;
    consumer.append_memory_copy(output.gpu_address(), staging.gpu_address(), 256, None, &[&produced])?;
    consumer.close()?;

    let copy_fence = copy_queue.create_fence();
    copy_queue.execute_command_lists(&[&consumer], Some(&copy_fence), None, &[])?;
    assert_eq!(rig.copy.pending_batches(), 1, "copy batch should stall on the event");
    assert_eq!(copy_fence.query_status(), Err(SubmitError::NotReady));

    compute_queue.execute_command_lists(&[&producer], None, None, &[])?;
    assert_eq!(compute_queue.synchronize(1_000), Err(SubmitError::NotReady));
    assert!(!produced.is_signaled());

    assert_eq!(rig.compute.complete_pending(rig.device.memory_manager()), 1);
    assert!(produced.is_signaled());

    copy_queue.synchronize(u64::MAX)?;
    copy_fence.host_synchronize(u64::MAX)?;
    assert_eq!(output.bytes(0, 256)?, vec![0x5a; 256]);
    assert_eq!(rig.copy.pending_batches(), 0);
    Ok(())
}

#[test]
fn direct_submission_chains_batches_through_the_ring() -> Result<()> {
    let config = SubmitConfig {
        direct_submission: true,
        ..SubmitConfig::default()
    };
    let rig = Rig::new(
        HwCaps::cfe_multi_tile(),
        config,
        CompletionMode::Immediate,
        CompletionMode::Immediate,
    )?;
    let queue = rig.queue(EngineGroup::Compute, QueueMode::Asynchronous)?;
    let mut list = rig.list(EngineGroup::Compute)?;
    list.append_launch_kernel(&Kernel::new("k", 0x0010_0000), [4, 1, 1], None, &[])?;
    list.close()?;

    let fence = queue.create_fence();
    for expected in 1..=3u64 {
        fence.reset();
        queue.execute_command_lists(&[&list], Some(&fence), None, &[])?;
        let batch = queue.last_batch_commands()?;
        match batch.last() {
            Some(HwCmd::MiBatchBufferStart(bb)) => assert!(!bb.second_level),
            other => panic!("batch should jump back into the ring, ended with {other:?}"),
        }
        fence.host_synchronize(u64::MAX)?;
        assert_eq!(fence.task_count(), expected);
    }
    assert_eq!(rig.compute.stats().batches_completed, 3);
    Ok(())
}

#[test]
fn mixed_workload_runs_end_to_end_twice() -> Result<()> {
    let rig = Rig::immediate(HwCaps::cfe_multi_tile())?;
    let queue = rig.queue(EngineGroup::Compute, QueueMode::Asynchronous)?;
    let target = rig.buffer(1024)?;
    let done = rig.device.create_event()?;
    let callbacks = Arc::new(AtomicU64::new(0));

    let mut list = rig.list(EngineGroup::Compute)?;
    list.append_launch_kernel(
        &Kernel::new("solver", 0x0010_0000)
            .with_scratch(2048, 1024)
            .with_binding_table_entries(4)
            .with_large_grf(),
        [16, 4, 1],
        None,
        &[],
    )?;
    list.append_memory_fill(target.gpu_address(), &[0xde, 0xad, 0xbe, 0xef], 1024, None, &[])?;
    let seen = callbacks.clone();
    list.append_host_function(
        HostFunction {
            callback: Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
            user_data: 0,
        },
        None,
        &[],
    )?;
    list.append_barrier(Some(&done), &[])?;
    list.close()?;
    assert_eq!(done.used_partitions(), 2);

    for round in 1..=2u64 {
        queue.execute_command_lists(&[&list], None, None, &[])?;
        queue.synchronize(u64::MAX)?;
        assert!(done.is_signaled());
        assert_eq!(callbacks.load(Ordering::SeqCst), round);
    }

    let expected: Vec<u8> = [0xde, 0xad, 0xbe, 0xef].iter().copied().cycle().take(1024).collect();
    assert_eq!(target.bytes(0, 1024)?, expected);

    let csr = queue.csr();
    assert_eq!(csr.task_count(), 2);
    let state = csr.lock_state();
    assert_eq!(state.scratch.per_thread_scratch_size(), 2048);
    assert_eq!(state.scratch.per_thread_private_scratch_size(), 1024);
    Ok(())
}
