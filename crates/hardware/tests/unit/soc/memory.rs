//! Memory Map Tests.

use pretty_assertions::assert_eq;
use rstest::rstest;

use smpsim_core::common::constants::IO_SPACE_BIT;
use smpsim_core::soc::alloc::{Block, BlockClass};
use smpsim_core::soc::memory::MemoryMap;

use crate::common::harness::pa;

const ARRAY: usize = 4096;

fn two_arrays() -> MemoryMap {
    MemoryMap::contiguous(
        (0..2)
            .map(|index| Block::zeroed(index as u64, BlockClass::MemoryArray { index, bytes: ARRAY }))
            .collect(),
    )
}

#[test]
fn arrays_are_laid_out_back_to_back() {
    let map = two_arrays();
    let bases: Vec<u64> = map.arrays().iter().map(|a| a.base().val()).collect();
    assert_eq!(bases, vec![0, ARRAY as u64]);
    assert!(map.arrays().iter().all(|a| a.size() == ARRAY));
}

#[rstest]
#[case(0x0, Some(0))]
#[case(0xfc0, Some(0))]
#[case(0x1000, Some(1))]
#[case(0x1fff, Some(1))]
#[case(0x2000, None)]
#[case(IO_SPACE_BIT, None)]
fn route_finds_array(#[case] addr: u64, #[case] array: Option<usize>) {
    assert_eq!(two_arrays().route(pa(addr)), array);
}

#[test]
fn block_write_then_read() {
    let mut map = two_arrays();
    assert!(map.write_block(pa(0x1048), &[0x3c; 64]));
    assert_eq!(map.read_block(pa(0x1040)).unwrap(), [0x3c; 64]);
    assert_eq!(map.read_block(pa(0x1080)).unwrap(), [0; 64]);
    assert_eq!(map.arrays()[0].size(), ARRAY);
}

#[test]
fn unbacked_access_is_refused() {
    let mut map = two_arrays();
    assert!(!map.write_block(pa(0x2000), &[1; 64]));
    assert!(map.read_block(pa(0x2000)).is_none());
    assert!(map.read_block(pa(IO_SPACE_BIT)).is_none());
}

#[test]
fn take_blocks_empties_the_map() {
    let mut map = two_arrays();
    let blocks = map.take_blocks();
    assert_eq!(blocks.iter().map(Block::id).collect::<Vec<_>>(), vec![0, 1]);
    assert!(map.arrays().is_empty());
    assert!(!map.contains(pa(0)));
}
