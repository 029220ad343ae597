//! Startup Rollback Tests.
//!
//! System construction is all-or-nothing. These tests fail allocations at
//! each stage and check that every block already handed out goes back, CPU
//! records and arrays first and the system record last.

use std::sync::Arc;

use mockall::Sequence;
use mockall::predicate::eq;
use pretty_assertions::assert_eq;
use rstest::rstest;

use smpsim_core::cbox::CoherenceController;
use smpsim_core::cbox::bcache::BcacheSize;
use smpsim_core::common::{CoherenceError, CpuId, Result};
use smpsim_core::soc::alloc::{Block, BlockAllocator, BlockClass, HeapAllocator};
use smpsim_core::soc::interface::{CpuInterface, HubSignal};
use smpsim_core::{Cpu, System};

use crate::common::harness::{init_tracing, small_config, system};
use crate::common::mocks::MockAllocator;

fn grant(mock: &mut MockAllocator, class: BlockClass, id: u64) {
    let _ = mock
        .expect_allocate_block()
        .with(eq(class))
        .times(1)
        .returning(move |c| Some(Block::zeroed(id, c)));
}

fn refuse(mock: &mut MockAllocator, class: BlockClass) {
    let _ = mock
        .expect_allocate_block()
        .with(eq(class))
        .times(1)
        .returning(|_| None);
}

fn expect_release(mock: &mut MockAllocator, seq: &mut Sequence, class: BlockClass) {
    let _ = mock
        .expect_release_block()
        .withf(move |block| block.class() == class)
        .times(1)
        .in_sequence(seq)
        .return_const(());
}

fn is_init_failure(err: &CoherenceError) -> bool {
    matches!(err, CoherenceError::InitializationFailure(_))
}

// ══════════════════════════════════════════════════════════
// 1. Rollback order
// ══════════════════════════════════════════════════════════

#[test]
fn failed_cpu_record_releases_earlier_records() {
    init_tracing();
    let mut mock = MockAllocator::new();
    let mut seq = Sequence::new();
    grant(&mut mock, BlockClass::System, 0);
    grant(&mut mock, BlockClass::Cpu(CpuId(0)), 1);
    grant(&mut mock, BlockClass::Cpu(CpuId(1)), 2);
    refuse(&mut mock, BlockClass::Cpu(CpuId(2)));
    expect_release(&mut mock, &mut seq, BlockClass::Cpu(CpuId(0)));
    expect_release(&mut mock, &mut seq, BlockClass::Cpu(CpuId(1)));
    expect_release(&mut mock, &mut seq, BlockClass::System);

    let err = System::allocate(&small_config(3), Arc::new(mock)).unwrap_err();
    assert!(is_init_failure(&err), "{err}");
}

#[test]
fn failed_array_releases_cpus_arrays_then_record() {
    init_tracing();
    let mut config = small_config(1);
    config.system.array_count = 2;
    let bytes = config.system.array_size_bytes;

    let mut mock = MockAllocator::new();
    let mut seq = Sequence::new();
    grant(&mut mock, BlockClass::System, 0);
    grant(&mut mock, BlockClass::Cpu(CpuId(0)), 1);
    grant(&mut mock, BlockClass::MemoryArray { index: 0, bytes }, 2);
    refuse(&mut mock, BlockClass::MemoryArray { index: 1, bytes });
    expect_release(&mut mock, &mut seq, BlockClass::Cpu(CpuId(0)));
    expect_release(&mut mock, &mut seq, BlockClass::MemoryArray { index: 0, bytes });
    expect_release(&mut mock, &mut seq, BlockClass::System);

    let err = System::allocate(&config, Arc::new(mock)).unwrap_err();
    assert!(is_init_failure(&err), "{err}");
}

#[test]
fn failed_system_record_releases_nothing() {
    init_tracing();
    let mut mock = MockAllocator::new();
    refuse(&mut mock, BlockClass::System);
    let _ = mock.expect_release_block().never();

    let err = System::allocate(&small_config(2), Arc::new(mock)).unwrap_err();
    assert!(is_init_failure(&err), "{err}");
}

#[test]
fn invalid_config_allocates_nothing() {
    init_tracing();
    // Any allocator call would panic on a mock with no expectations.
    let mock = MockAllocator::new();
    let err = System::allocate(&small_config(0), Arc::new(mock)).unwrap_err();
    assert!(is_init_failure(&err), "{err}");
}

// ══════════════════════════════════════════════════════════
// 2. Registration failures
// ══════════════════════════════════════════════════════════

fn plain_cpu(id: CpuId) -> Cpu {
    Cpu::new(CoherenceController::new(id, BcacheSize::Mb1).unwrap(), 8)
}

/// A CPU already bound to some other hub.
fn bound_elsewhere(id: CpuId) -> Cpu {
    let mut cpu = plain_cpu(id);
    let interface = CpuInterface {
        cpu: id,
        port: cpu.port(),
        hub: Arc::new(HubSignal::new()),
    };
    cpu.bind_system_interface(&interface).unwrap();
    cpu
}

/// A CPU whose id does not match the slot it is registered in.
fn wrong_slot(id: CpuId) -> Cpu {
    plain_cpu(CpuId(id.0 + 1))
}

#[rstest]
#[case::already_bound(bound_elsewhere)]
#[case::out_of_order(wrong_slot)]
fn third_registration_failure_releases_everything(#[case] third: fn(CpuId) -> Cpu) {
    init_tracing();
    let heap = Arc::new(HeapAllocator::new());
    let shared: Arc<dyn BlockAllocator> = heap.clone();
    let mut made = Vec::new();
    let err = System::allocate_with(&small_config(3), shared, |id| -> Result<Cpu> {
        let cpu = if id == CpuId(2) { third(id) } else { plain_cpu(id) };
        made.push(cpu.clone());
        Ok(cpu)
    })
    .unwrap_err();

    assert!(is_init_failure(&err), "{err}");
    assert!(err.to_string().contains("cpu2"), "{err}");
    assert_eq!(heap.live_blocks(), 0);
    assert_eq!(made.len(), 3);
    // Only our own handle (plus the one `port` returns) still refers to
    // CPUs 0 and 1; the hub dropped its interface records.
    for cpu in &made[..2] {
        assert_eq!(Arc::strong_count(&cpu.port()), 2);
    }
}

#[test]
fn registration_failure_releases_in_order() {
    init_tracing();
    let bytes = small_config(1).system.array_size_bytes;
    let mut mock = MockAllocator::new();
    let mut seq = Sequence::new();
    grant(&mut mock, BlockClass::System, 0);
    for i in 0..3 {
        grant(&mut mock, BlockClass::Cpu(CpuId(i)), 1 + i as u64);
    }
    grant(&mut mock, BlockClass::MemoryArray { index: 0, bytes }, 4);
    for i in 0..3 {
        expect_release(&mut mock, &mut seq, BlockClass::Cpu(CpuId(i)));
    }
    expect_release(&mut mock, &mut seq, BlockClass::MemoryArray { index: 0, bytes });
    expect_release(&mut mock, &mut seq, BlockClass::System);

    let err = System::allocate_with(&small_config(3), Arc::new(mock), |id| {
        Ok(if id == CpuId(2) { bound_elsewhere(id) } else { plain_cpu(id) })
    })
    .unwrap_err();
    assert!(is_init_failure(&err), "{err}");
}

#[test]
fn factory_error_rolls_back() {
    init_tracing();
    let heap = Arc::new(HeapAllocator::new());
    let shared: Arc<dyn BlockAllocator> = heap.clone();
    let err = System::allocate_with(&small_config(2), shared, |id| {
        if id == CpuId(1) {
            Err(CoherenceError::InitializationFailure("no controller".to_string()))
        } else {
            Ok(plain_cpu(id))
        }
    })
    .unwrap_err();
    assert!(is_init_failure(&err), "{err}");
    assert_eq!(heap.live_blocks(), 0);
}

// ══════════════════════════════════════════════════════════
// 3. Leak checks
// ══════════════════════════════════════════════════════════

#[test]
fn every_stage_of_a_limited_heap_rolls_back() {
    init_tracing();
    // Two CPUs and one array need four blocks; fail at each earlier count.
    for limit in 0..4 {
        let allocator = Arc::new(HeapAllocator::with_limit(limit));
        let shared: Arc<dyn BlockAllocator> = allocator.clone();
        let err = System::allocate(&small_config(2), shared).unwrap_err();
        assert!(is_init_failure(&err), "limit {limit}: {err}");
        assert_eq!(allocator.live_blocks(), 0, "limit {limit}");
    }
}

#[test]
fn exact_budget_succeeds() {
    init_tracing();
    let allocator = Arc::new(HeapAllocator::with_limit(4));
    let shared: Arc<dyn BlockAllocator> = allocator.clone();
    let system = System::allocate(&small_config(2), shared).unwrap();
    assert_eq!(allocator.live_blocks(), 4);
    assert_eq!(system.cpus().len(), 2);
    drop(system);
    assert_eq!(allocator.live_blocks(), 0);
}

#[test]
fn dropping_a_built_system_releases_everything() {
    let (s, allocator) = system(4);
    assert_eq!(allocator.live_blocks(), 6);
    assert!(s.cpus().iter().all(smpsim_core::Cpu::is_bound));
    drop(s);
    assert_eq!(allocator.live_blocks(), 0);
}

#[test]
fn heap_blocks_are_zeroed_and_sized() {
    let heap = HeapAllocator::new();
    let block = heap
        .allocate_block(BlockClass::MemoryArray { index: 0, bytes: 128 })
        .unwrap();
    assert_eq!(block.storage().len(), 128);
    assert!(block.storage().iter().all(|&b| b == 0));
    assert_eq!(heap.live_blocks(), 1);
    heap.release_block(block);
    assert_eq!(heap.live_blocks(), 0);
}
