//! Coherence Hub Tests.
//!
//! The first sections drive the hub by hand through `System::step`/`settle`,
//! so every transaction runs on the test thread in a fixed order. The last
//! section starts the real hub and CPU threads.

use std::thread;

use pretty_assertions::assert_eq;

use smpsim_core::System;
use smpsim_core::cbox::maf::{AccessWidth, MafCompletion, MafType};
use smpsim_core::cbox::probe::NextState;
use smpsim_core::cbox::state::LineState;
use smpsim_core::common::constants::IO_SPACE_BIT;
use smpsim_core::common::{CoherenceError, Result};
use smpsim_core::cpu::Cpu;

use crate::common::harness::{pa, small_config, system, system_with};

const LOAD_Q: MafType = MafType::Load(AccessWidth::Quad);
const STORE_Q: MafType = MafType::Store(AccessWidth::Quad);

/// Issues `kind` at `addr` on `cpu`, lets the system settle, and returns the fill.
fn settle_access(
    system: &mut System,
    cpu: usize,
    kind: MafType,
    addr: u64,
) -> Result<MafCompletion> {
    let cpu = system.cpu(cpu).unwrap().clone();
    let handle = cpu.issue_memory_reference(kind, pa(addr), 0xff, &[])?;
    let _ = system.settle();
    assert!(cpu.is_complete(handle), "reference at {addr:#x} still pending");
    cpu.wait_for_completion(handle)
}

// ══════════════════════════════════════════════════════════
// 1. Ownership transfer
// ══════════════════════════════════════════════════════════

#[test]
fn store_miss_takes_block_from_memory() {
    let (mut s, _alloc) = system(2);
    let done = settle_access(&mut s, 1, STORE_Q, 0x1000).unwrap();
    assert!(!done.shared);
    assert_eq!(s.cpu(1).unwrap().lookup(pa(0x1000)), LineState::DIRTY);
    assert_eq!(s.cpu(0).unwrap().lookup(pa(0x1000)), LineState::INVALID);

    let hub = s.hub().unwrap();
    assert_eq!(hub.stats().transactions, 1);
    assert_eq!(hub.stats().probes_sent, 1);
    assert_eq!(hub.stats().memory_reads, 1);
    assert_eq!(hub.open_transactions(), 0);
}

#[test]
fn dirty_data_moves_to_reader_and_memory() {
    let (mut s, _alloc) = system(2);
    let _ = settle_access(&mut s, 1, STORE_Q, 0x1000).unwrap();
    s.cpu(1).unwrap().store_data(pa(0x1000), &[0xab; 8]).unwrap();

    let done = settle_access(&mut s, 0, LOAD_Q, 0x1000).unwrap();
    assert_eq!(done.data.unwrap()[0], 0xab);
    assert!(!done.shared);

    // Reads invalidate other copies unless configured otherwise.
    assert_eq!(s.cpu(1).unwrap().lookup(pa(0x1000)), LineState::INVALID);
    assert_eq!(s.cpu(0).unwrap().lookup(pa(0x1000)), LineState::CLEAN);

    let hub = s.hub().unwrap();
    assert_eq!(hub.memory().read_block(pa(0x1000)).unwrap()[0], 0xab);
    assert_eq!(hub.stats().dirty_responses, 1);
    assert_eq!(s.cpu(1).unwrap().stats().victims_probe, 1);
}

#[test]
fn clean_shared_reads_leave_both_copies() {
    let mut config = small_config(2);
    config.hub.read_probe_next_state = NextState::CleanShared;
    let (mut s, _alloc) = system_with(&config);
    let _ = settle_access(&mut s, 1, STORE_Q, 0x2000).unwrap();
    s.cpu(1).unwrap().store_data(pa(0x2000), &[7; 8]).unwrap();

    let done = settle_access(&mut s, 0, LOAD_Q, 0x2000).unwrap();
    assert!(done.shared);
    assert_eq!(s.cpu(0).unwrap().lookup(pa(0x2000)), LineState::CLEAN_SHARED);
    assert_eq!(s.cpu(1).unwrap().lookup(pa(0x2000)), LineState::CLEAN_SHARED);
    assert_eq!(s.hub().unwrap().memory().read_block(pa(0x2000)).unwrap()[0], 7);
}

#[test]
fn upgrade_invalidates_other_sharers() {
    let mut config = small_config(3);
    config.hub.read_probe_next_state = NextState::CleanShared;
    let (mut s, _alloc) = system_with(&config);
    let _ = settle_access(&mut s, 0, LOAD_Q, 0x3000).unwrap();
    let _ = settle_access(&mut s, 1, LOAD_Q, 0x3000).unwrap();
    assert!(s.cpu(0).unwrap().lookup(pa(0x3000)).shared);

    let done = settle_access(&mut s, 0, STORE_Q, 0x3000).unwrap();
    assert_eq!(done.kind, MafType::StoreChangeToDirty(AccessWidth::Quad));
    assert_eq!(s.cpu(0).unwrap().lookup(pa(0x3000)), LineState::DIRTY);
    assert_eq!(s.cpu(1).unwrap().lookup(pa(0x3000)), LineState::INVALID);
}

// ══════════════════════════════════════════════════════════
// 2. Routing
// ══════════════════════════════════════════════════════════

#[test]
fn read_beyond_memory_is_nonexistent() {
    let (mut s, _alloc) = system(1);
    let err = settle_access(&mut s, 0, LOAD_Q, 0x10_0000).unwrap_err();
    assert_eq!(err, CoherenceError::NonExistentMemory(0x10_0000));
    assert_eq!(s.hub().unwrap().stats().nonexistent, 1);
}

#[test]
fn io_writes_land_in_io_space() {
    let (mut s, _alloc) = system(1);
    let cpu = s.cpu(0).unwrap().clone();
    let addr = pa(IO_SPACE_BIT | 0x40);
    let _ = cpu.io_write(addr, &[1, 2, 3, 4], &[]).unwrap();
    assert_eq!(cpu.flush_io_writes(), 1);
    let _ = s.settle();

    let hub = s.hub().unwrap();
    assert_eq!(hub.io_block(addr).unwrap()[..4], [1, 2, 3, 4]);
    assert_eq!(hub.stats().io_writes, 1);
    assert_eq!(cpu.with_controller(|c| c.iowb().pending()), 0);
    // I/O space is never part of memory.
    assert!(!hub.memory().contains(addr));
}

#[test]
fn merged_io_writes_leave_gap_bytes_alone() {
    let (mut s, _alloc) = system(1);
    let cpu = s.cpu(0).unwrap().clone();
    let _ = cpu.io_write(pa(IO_SPACE_BIT | 0x88), &[9; 8], &[]).unwrap();
    assert_eq!(cpu.flush_io_writes(), 1);
    let _ = s.settle();

    let (first, merged_first) = cpu.io_write(pa(IO_SPACE_BIT | 0x80), &[1; 8], &[]).unwrap();
    let (second, merged_second) = cpu.io_write(pa(IO_SPACE_BIT | 0xb8), &[7; 8], &[]).unwrap();
    assert!(!merged_first);
    assert!(merged_second);
    assert_eq!(first, second);
    assert_eq!(cpu.flush_io_writes(), 1);
    let _ = s.settle();

    let block = s.hub().unwrap().io_block(pa(IO_SPACE_BIT | 0x80)).unwrap();
    assert_eq!(block[..8], [1; 8]);
    assert_eq!(block[8..16], [9; 8]);
    assert!(block[16..56].iter().all(|&b| b == 0));
    assert_eq!(block[56..], [7; 8]);
}

#[test]
fn retired_victim_is_written_back() {
    let (mut s, _alloc) = system(1);
    let cpu = s.cpu(0).unwrap().clone();
    let _ = cpu.retire_victim(pa(0x3000), &[0x5a; 64]).unwrap();
    let _ = s.settle();

    assert_eq!(s.hub().unwrap().memory().read_block(pa(0x3000)).unwrap(), [0x5a; 64]);
    assert_eq!(s.hub().unwrap().stats().memory_writes, 1);
    assert_eq!(cpu.with_controller(|c| c.victims().draining()), 0);
}

#[test]
fn single_cpu_reads_need_no_probes() {
    let (mut s, _alloc) = system(1);
    let _ = settle_access(&mut s, 0, LOAD_Q, 0x1000).unwrap();
    assert_eq!(s.hub().unwrap().stats().probes_sent, 0);
    assert_eq!(s.hub().unwrap().stats().transactions, 1);
}

// ══════════════════════════════════════════════════════════
// 3. Skid buffer
// ══════════════════════════════════════════════════════════

#[test]
fn full_rings_park_probes_until_drained() {
    let mut config = small_config(3);
    config.cbox.probe_queue_depth = 1;
    let (mut s, _alloc) = system_with(&config);
    let cpu = s.cpu(0).unwrap().clone();
    let a = cpu.issue_memory_reference(LOAD_Q, pa(0x1000), 0xff, &[]).unwrap();
    let b = cpu.issue_memory_reference(LOAD_Q, pa(0x2000), 0xff, &[]).unwrap();
    let _ = s.settle();

    assert!(cpu.is_complete(a));
    assert!(cpu.is_complete(b));
    let hub = s.hub().unwrap();
    assert_eq!(hub.stats().probes_sent, 4);
    assert_eq!(hub.stats().skid_parks, 2);
    assert_eq!(hub.signal().parked(), 0);
    for other in &s.cpus()[1..] {
        assert_eq!(other.stats().probe_misses, 2);
        assert!(!other.interrupt_pending());
    }
}

#[test]
fn reads_to_busy_block_wait_their_turn() {
    let (mut s, _alloc) = system(2);
    let c0 = s.cpu(0).unwrap().clone();
    let c1 = s.cpu(1).unwrap().clone();
    let a = c0.issue_memory_reference(STORE_Q, pa(0x4000), 0xff, &[]).unwrap();
    let b = c1.issue_memory_reference(STORE_Q, pa(0x4000), 0xff, &[]).unwrap();
    let _ = s.settle();

    let _ = c0.wait_for_completion(a).unwrap();
    let _ = c1.wait_for_completion(b).unwrap();
    // The second writer ends up owning the block.
    assert_eq!(c1.lookup(pa(0x4000)), LineState::DIRTY);
    assert_eq!(c0.lookup(pa(0x4000)), LineState::INVALID);
    assert_eq!(s.hub().unwrap().stats().transactions, 2);
}

// ══════════════════════════════════════════════════════════
// 4. Threads
// ══════════════════════════════════════════════════════════

fn retry<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    loop {
        match f() {
            Err(e) if e.is_backpressure() => thread::yield_now(),
            other => return other,
        }
    }
}

fn workload(cpu: &Cpu, me: u64) -> Result<()> {
    for i in 0..64u64 {
        let addr = pa(0x1000 + (i % 4) * 64);
        let _ = retry(|| cpu.access(STORE_Q, addr, &[]))?;
        match cpu.store_data(addr, &((me << 8) | i).to_le_bytes()) {
            Ok(()) | Err(CoherenceError::InvalidRequest(_)) => {}
            Err(e) => return Err(e),
        }
        let _ = retry(|| cpu.access(LOAD_Q, pa(0x8000 + me * 64), &[]))?;
    }
    cpu.memory_barrier()
}

#[test]
fn threaded_run_shuts_down_cleanly() {
    let (s, alloc) = system(2);
    let running = s.start().unwrap();
    let cpus = running.cpus().to_vec();
    let workers: Vec<_> = cpus
        .into_iter()
        .enumerate()
        .map(|(me, cpu)| thread::spawn(move || workload(&cpu, me as u64)))
        .collect();
    for worker in workers {
        worker.join().unwrap().unwrap();
    }

    let (s, stats) = running.shutdown();
    assert_eq!(stats.cpus.len(), 2);
    assert!(stats.hub.transactions > 0);
    assert!(stats.total().completions > 0);
    assert_eq!(s.hub().unwrap().open_transactions(), 0);
    drop(s);
    assert_eq!(alloc.live_blocks(), 0);
}

#[test]
fn dropping_running_system_releases_blocks() {
    let (s, alloc) = system(1);
    let running = s.start().unwrap();
    drop(running);
    assert_eq!(alloc.live_blocks(), 0);
}

#[test]
fn shutdown_hands_back_the_stopped_system() {
    let (s, alloc) = system(1);
    let (s, stats) = s.start().unwrap().shutdown();
    assert_eq!(stats.cpus.len(), 1);
    assert!(s.hub().is_some());
    assert_eq!(alloc.live_blocks(), 3);
    drop(s);
    assert_eq!(alloc.live_blocks(), 0);
}
