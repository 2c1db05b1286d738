use gpusub_mem::{AllocationProperties, AllocationType, MemoryManager, MemoryPool, ResidencyContainer};
use pretty_assertions::assert_eq;

#[test]
fn residency_pass_stamps_and_collects_every_tracked_allocation() {
    let mm = MemoryManager::new();
    let svm = |size| {
        mm.allocate_graphics_memory_with_properties(&AllocationProperties::new(
            size,
            AllocationType::SvmGpu,
            MemoryPool::Local,
        ))
        .unwrap()
    };
    let a = svm(0x1000);
    let b = svm(0x2000);
    mm.indirect_allocations().register(a.clone());
    mm.indirect_allocations().register(b.clone());

    let mut residency = ResidencyContainer::new();
    residency.push(a.clone());

    b.update_task_count(1, 0);
    b.set_resident(0, true);
    let previous = mm
        .indirect_allocations()
        .make_indirect_allocations_resident(0, 4, &mut residency);
    assert_eq!(previous.len(), 2);
    assert!(previous
        .iter()
        .any(|(alloc, usage)| alloc.id() == b.id() && usage.task_count == Some(1) && usage.resident));
    assert!(previous
        .iter()
        .any(|(alloc, usage)| alloc.id() == a.id() && usage.task_count.is_none() && !usage.resident));
    assert_eq!(residency.len(), 2);
    assert_eq!(a.task_count(0), Some(4));
    assert_eq!(b.task_count(0), Some(4));
    assert!(a.is_resident(0));
    assert!(b.is_resident(0));
    assert_eq!(mm.indirect_allocations().residency_passes(), 1);

    for (alloc, usage) in previous.into_iter().rev() {
        alloc.restore_usage(usage, 0);
    }
    assert!(!a.is_resident(0));
    assert_eq!(b.task_count(0), Some(1));
    assert!(b.is_resident(0));
}

#[test]
fn freeing_an_allocation_drops_it_from_the_indirect_registry() {
    let mm = MemoryManager::new();
    let a = mm
        .allocate_graphics_memory_with_properties(&AllocationProperties::new(
            64,
            AllocationType::SvmCpu,
            MemoryPool::System,
        ))
        .unwrap();
    mm.indirect_allocations().register(a.clone());
    mm.free(&a);
    assert!(mm.indirect_allocations().is_empty());
    assert_eq!(mm.allocation_count(), 0);
}
