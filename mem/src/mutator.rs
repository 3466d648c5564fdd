//! Per-thread bump-pointer allocation over one block at a time.

use std::sync::Arc;

use tracing::trace;

use object::{
    align_of_ty, align_up, hybrid_size, size_of_ty, Header, TypeId, GC_HEADER_BYTES,
    HYBRID_HEADER_BYTES, WORD_BYTES,
};

use crate::heap::HeapInner;
use crate::memory::{store_u64, Address};
use crate::HeapError;

/// A per-thread allocator. Created through `Heap::make_mutator`, used
/// by exactly one thread, released by [`Mutator::close`] (or drop).
///
/// Invariant while seated on a block:
/// `cur_block <= cursor <= limit == cur_block + block_size`.
pub struct Mutator {
    heap: Arc<HeapInner>,
    /// Start address of the current block; 0 before the first block is
    /// acquired.
    pub cur_block: Address,
    pub cursor: Address,
    pub limit: Address,
    closed: bool,
}

impl Mutator {
    pub(crate) fn new(heap: Arc<HeapInner>) -> Self {
        Self {
            heap,
            cur_block: 0,
            cursor: 0,
            limit: 0,
            closed: false,
        }
    }

    /// Allocates `size` bytes preceded by a GC prefix of `header_size`
    /// bytes, returning the payload address. `align` is rounded up to
    /// the machine word. This is the small-object path: a request that
    /// cannot fit in one block fails with [`HeapError::ObjectTooBig`].
    pub fn alloc(&mut self, size: u64, align: u64, header_size: u64) -> Result<Address, HeapError> {
        debug_assert!(!self.closed, "allocation on a closed mutator");
        self.heap.poll_safepoint();

        let align = align.max(WORD_BYTES);
        let block_size = self.heap.settings().block_size as u64;

        loop {
            let gc_start = align_up(self.cursor, align);
            let user_start = align_up(gc_start + header_size, align);
            let user_end = user_start + size;

            if self.cur_block != 0 && user_end <= self.limit {
                self.cursor = user_end;
                return Ok(user_start);
            }
            if user_end - gc_start > block_size {
                return Err(HeapError::ObjectTooBig {
                    size: user_end - gc_start,
                });
            }
            self.get_new_block()?;
        }
    }

    /// Allocates an object of fixed-size type `ty` and writes its
    /// header. Oversized types are routed to the large-object path.
    pub fn new_fixed(&mut self, ty: TypeId) -> Result<Address, HeapError> {
        let size = size_of_ty(self.heap.types(), ty);
        let align = align_of_ty(self.heap.types(), ty).max(WORD_BYTES);
        let addr = self.alloc_with_routing(size, align, GC_HEADER_BYTES)?;

        // SAFETY: addr - 8 is the object's reserved header slot.
        unsafe {
            std::ptr::write((addr - GC_HEADER_BYTES) as *mut Header, Header::new(ty));
        }
        Ok(addr)
    }

    /// Allocates a hybrid of type `ty` with `var_len` var-part
    /// elements, writing the length word and the header. Oversized
    /// hybrids are routed to the large-object path.
    pub fn new_hybrid(&mut self, ty: TypeId, var_len: u64) -> Result<Address, HeapError> {
        let size = hybrid_size(self.heap.types(), ty, var_len);
        let align = align_of_ty(self.heap.types(), ty).max(WORD_BYTES);
        let addr = self.alloc_with_routing(size, align, HYBRID_HEADER_BYTES)?;

        // SAFETY: the 16 bytes below addr are the hybrid's reserved
        // length word and header slot.
        unsafe {
            store_u64(addr - HYBRID_HEADER_BYTES, var_len);
            std::ptr::write((addr - GC_HEADER_BYTES) as *mut Header, Header::new(ty));
        }
        Ok(addr)
    }

    /// Trips a collection cycle and waits for it to complete.
    pub fn trigger_and_wait_for_gc(&mut self) {
        debug_assert!(!self.closed);
        self.heap.trigger_and_wait_for_gc();
    }

    /// Releases the mutator: retires its current block and deregisters
    /// it from the heap. No further allocations are possible.
    pub fn close(mut self) {
        self.release();
    }

    /// Typed allocations know their full size up front, so they can be
    /// forwarded to the heap's large-object path instead of failing the
    /// bump-pointer fit check.
    fn alloc_with_routing(
        &mut self,
        size: u64,
        align: u64,
        header_size: u64,
    ) -> Result<Address, HeapError> {
        let block_size = self.heap.settings().block_size as u64;
        if align_up(header_size, align) + size > block_size {
            self.heap.poll_safepoint();
            return self.heap.alloc_large(header_size, size, align);
        }
        self.alloc(size, align, header_size)
    }

    fn get_new_block(&mut self) -> Result<(), HeapError> {
        let previous = (self.cur_block != 0).then_some(self.cur_block);
        trace!(?previous, "mutator requesting block");
        match self.heap.acquire_block(previous) {
            Ok(block) => {
                self.cur_block = block;
                self.cursor = block;
                self.limit = block + self.heap.settings().block_size as u64;
                Ok(())
            }
            Err(err) => {
                // The space retired `previous` before running out, so
                // the mutator no longer owns a block.
                self.cur_block = 0;
                self.cursor = 0;
                self.limit = 0;
                Err(err)
            }
        }
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.cur_block != 0 {
            self.heap.retire_block(self.cur_block);
            self.cur_block = 0;
        }
        self.heap.deregister_mutator();
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.release();
    }
}
