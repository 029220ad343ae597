use mockall::mock;
use smpsim_core::soc::alloc::{Block, BlockAllocator, BlockClass};

mock! {
    pub Allocator {}
    impl BlockAllocator for Allocator {
        fn allocate_block(&self, class: BlockClass) -> Option<Block>;
        fn release_block(&self, block: Block);
    }
}
