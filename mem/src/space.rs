//! Block-granular management of the heap's contiguous memory region.
//!
//! The space owns the mapped region and a state entry per block. All
//! state transitions happen with the space lock held, either from a
//! mutator acquiring a block or from the collector sweeping.

use crate::memory::{Address, MemoryRegion};

/// Allocation state of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockState {
    /// Available for handout.
    Free,
    /// Lent to exactly one mutator as its current block.
    InUse,
    /// Retired by a mutator; reclaimed by the next sweep if unmarked.
    Full,
    /// First block of a large-object run of `blocks` blocks.
    LargeHead { blocks: usize },
    /// Non-head block of a large-object run.
    LargeCont,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SweepStats {
    pub freed_blocks: usize,
    pub retained_blocks: usize,
}

pub(crate) struct Space {
    region: MemoryRegion,
    block_size: u64,
    blocks: Vec<BlockState>,
    /// Set during the mark phase for blocks holding a marked object.
    marked: Vec<bool>,
}

impl Space {
    pub fn new(region: MemoryRegion, block_size: usize) -> Self {
        debug_assert_eq!(region.size() % block_size, 0);
        let count = region.size() / block_size;
        Self {
            region,
            block_size: block_size as u64,
            blocks: vec![BlockState::Free; count],
            marked: vec![false; count],
        }
    }

    #[inline]
    pub fn begin(&self) -> Address {
        self.region.begin()
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn block_index(&self, addr: Address) -> usize {
        debug_assert!(addr >= self.begin());
        ((addr - self.begin()) / self.block_size) as usize
    }

    #[inline]
    fn block_addr(&self, idx: usize) -> Address {
        self.begin() + idx as u64 * self.block_size
    }

    /// Hands out the lowest-addressed free block, retiring `previous`
    /// first if the caller was holding one. Returns `None` when no free
    /// block exists; the heap then attempts a GC cycle and retries.
    pub fn get_block(&mut self, previous: Option<Address>) -> Option<Address> {
        if let Some(prev) = previous {
            self.retire(prev);
        }
        let idx = self.blocks.iter().position(|s| *s == BlockState::Free)?;
        self.blocks[idx] = BlockState::InUse;
        Some(self.block_addr(idx))
    }

    /// Retires an in-use block to Full. Called when a mutator exhausts
    /// or releases its current block.
    pub fn retire(&mut self, block: Address) {
        let idx = self.block_index(block);
        debug_assert_eq!(self.blocks[idx], BlockState::InUse);
        self.blocks[idx] = BlockState::Full;
    }

    /// Reserves the lowest-addressed run of contiguous free blocks
    /// covering `total_bytes`. Returns the run's start address.
    pub fn alloc_large(&mut self, total_bytes: u64) -> Option<Address> {
        let need = total_bytes.div_ceil(self.block_size) as usize;
        let mut run_start = 0;
        let mut run_len = 0;
        for idx in 0..self.blocks.len() {
            if self.blocks[idx] == BlockState::Free {
                if run_len == 0 {
                    run_start = idx;
                }
                run_len += 1;
                if run_len == need {
                    self.blocks[run_start] = BlockState::LargeHead { blocks: need };
                    for cont in &mut self.blocks[run_start + 1..run_start + need] {
                        *cont = BlockState::LargeCont;
                    }
                    return Some(self.block_addr(run_start));
                }
            } else {
                run_len = 0;
            }
        }
        None
    }

    /// Marks a Full block free again. Collector-only, during sweep.
    pub fn recycle(&mut self, idx: usize) {
        debug_assert_eq!(self.blocks[idx], BlockState::Full);
        self.blocks[idx] = BlockState::Free;
        self.marked[idx] = false;
    }

    /// Flags the block containing `addr` as holding a marked object.
    pub fn set_marked(&mut self, addr: Address) {
        let idx = self.block_index(addr);
        self.marked[idx] = true;
    }

    /// Block-granularity reclamation, ascending block order:
    /// an unmarked Full block becomes free, an unmarked large run is
    /// freed whole, in-use blocks are never touched. Resets all mark
    /// flags.
    pub fn sweep(&mut self) -> SweepStats {
        let mut stats = SweepStats::default();
        for idx in 0..self.blocks.len() {
            match self.blocks[idx] {
                BlockState::Full => {
                    if self.marked[idx] {
                        stats.retained_blocks += 1;
                    } else {
                        self.recycle(idx);
                        stats.freed_blocks += 1;
                    }
                }
                BlockState::LargeHead { blocks } => {
                    if self.marked[idx] {
                        stats.retained_blocks += blocks;
                    } else {
                        for run_idx in idx..idx + blocks {
                            self.blocks[run_idx] = BlockState::Free;
                        }
                        stats.freed_blocks += blocks;
                    }
                }
                BlockState::Free | BlockState::InUse | BlockState::LargeCont => {}
            }
        }
        self.marked.fill(false);
        stats
    }

    pub fn used_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|s| **s != BlockState::Free)
            .count()
    }

    pub fn free_blocks(&self) -> usize {
        self.block_count() - self.used_blocks()
    }

    #[cfg(test)]
    pub fn state(&self, idx: usize) -> BlockState {
        self.blocks[idx]
    }
}
