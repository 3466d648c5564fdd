//! The garbage-collected heap: a Space, a monitor coordinating mutators
//! with the collector thread, and the mark-sweep cycle itself.
//!
//! The collector is stop-the-world. A mutator that exhausts the space
//! raises the global pause flag; every live mutator parks at its next
//! safepoint poll; once all have stopped the collector marks from the
//! client's external roots and sweeps the space at block granularity.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use object::{Header, TypeDef, TypeTable, GC_HEADER_BYTES, HYBRID_HEADER_BYTES};

use crate::memory::{load_u64, Address, MemoryRegion, OS_PAGE_SIZE};
use crate::mutator::Mutator;
use crate::space::Space;
use crate::HeapError;

/// Geometry and policy knobs for a [`Heap`].
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Total size of the heap in bytes. Must be a multiple of `block_size`.
    pub heap_size: usize,
    /// Size of a block. A power of two, multiple of the OS page size.
    pub block_size: usize,
    /// Occupancy fraction (0.0 - 1.0) above which a large-object
    /// reservation triggers a collection before being satisfied.
    pub large_gc_fraction: f64,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            heap_size: 268_435_456, // 256 MB
            block_size: 32_768,     // 32 KB = 2^15
            large_gc_fraction: 0.75,
        }
    }
}

impl HeapSettings {
    fn validate(&self) -> Result<(), &'static str> {
        if self.heap_size == 0 || self.block_size == 0 {
            return Err("sizes must be > 0");
        }
        if !self.block_size.is_power_of_two() {
            return Err("block_size must be a power of two");
        }
        if self.block_size % OS_PAGE_SIZE != 0 {
            return Err("block_size must match OS page alignment");
        }
        if self.heap_size % self.block_size != 0 {
            return Err("heap_size must be a multiple of block_size");
        }
        if !(0.0..=1.0).contains(&self.large_gc_fraction) {
            return Err("large_gc_fraction must be between 0.0 and 1.0");
        }
        Ok(())
    }
}

/// Caller-supplied capability that enumerates the external GC roots.
///
/// Invoked exactly once per collection cycle, with no heap lock held.
/// The marker is only valid for the duration of the call. Addresses
/// passed to the marker must be payload addresses of objects allocated
/// through [`Mutator::new_fixed`] or [`Mutator::new_hybrid`] (or 0,
/// which is ignored).
pub trait Client: Send {
    fn mark_external_roots(&mut self, marker: &mut ObjectMarker<'_>);
}

/// Monitor state guarded by the heap's one lock.
#[derive(Debug, Default)]
struct GcSync {
    live_mutators: usize,
    mutators_stopped: usize,
    global_pause_flag: bool,
    shutdown: bool,
}

/// Shared heap state; [`Heap`] is the owning handle.
pub struct HeapInner {
    settings: HeapSettings,
    types: Arc<TypeTable>,
    /// Geometry copies so bounds checks need no lock.
    begin: Address,
    size: u64,
    space: Mutex<Space>,
    sync: Mutex<GcSync>,
    gc_can_start: Condvar,
    gc_finished: Condvar,
    client: Mutex<Option<Box<dyn Client>>>,
    gc_cycles: AtomicU64,
}

/// Owning handle: constructing it spawns the collector thread, dropping
/// it shuts the collector down and joins it.
pub struct Heap {
    inner: Arc<HeapInner>,
    collector: Option<JoinHandle<()>>,
}

impl Deref for Heap {
    type Target = HeapInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Heap {
    /// # Panics
    ///
    /// Panics if the settings are inconsistent or the region cannot be
    /// mapped.
    pub fn new(settings: HeapSettings, types: Arc<TypeTable>) -> Self {
        settings.validate().expect("invalid heap settings");
        let region = MemoryRegion::map(settings.heap_size).expect("map heap region");
        let begin = region.begin();
        let size = region.size() as u64;

        let inner = Arc::new(HeapInner {
            space: Mutex::new(Space::new(region, settings.block_size)),
            settings,
            types,
            begin,
            size,
            sync: Mutex::new(GcSync::default()),
            gc_can_start: Condvar::new(),
            gc_finished: Condvar::new(),
            client: Mutex::new(None),
            gc_cycles: AtomicU64::new(0),
        });

        let collector = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("gc-collector".into())
                .spawn(move || collector_loop(&inner))
                .expect("spawn collector thread")
        };

        Heap {
            inner,
            collector: Some(collector),
        }
    }

    /// Registers a new mutator. Registration waits out any collection
    /// that is already pausing the world.
    pub fn make_mutator(&self) -> Mutator {
        self.inner.register_mutator();
        Mutator::new(Arc::clone(&self.inner))
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        {
            let mut sync = self.inner.sync.lock();
            sync.shutdown = true;
            sync.global_pause_flag = false;
            self.inner.gc_can_start.notify_all();
            self.inner.gc_finished.notify_all();
        }
        if let Some(handle) = self.collector.take() {
            let _ = handle.join();
        }
    }
}

impl HeapInner {
    /// Installs (or clears) the client supplying external roots. Blocks
    /// while a collection is marking, so the swap never races a cycle.
    pub fn set_client(&self, client: Option<Box<dyn Client>>) {
        *self.client.lock() = client;
    }

    /// Completed collection cycles.
    pub fn gc_cycles(&self) -> u64 {
        self.gc_cycles.load(Ordering::Acquire)
    }

    /// Non-free blocks in the space.
    pub fn used_blocks(&self) -> usize {
        self.space.lock().used_blocks()
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    /// Trips a collection and waits for it to finish, on behalf of a
    /// thread that is not a registered mutator (e.g. test teardown).
    /// The caller joins the safepoint as a temporary mutator so the
    /// rendezvous count is satisfiable even with zero live mutators.
    pub fn mutator_trigger_and_wait_for_gc_end(&self) {
        let mut sync = self.sync.lock();
        sync.live_mutators += 1;
        sync.global_pause_flag = true;
        self.stop_and_wait(&mut sync);
        sync.live_mutators -= 1;
    }

    // ── mutator-side protocol ─────────────────────────────────────────

    pub(crate) fn register_mutator(&self) {
        let mut sync = self.sync.lock();
        while sync.global_pause_flag {
            self.gc_finished.wait(&mut sync);
        }
        sync.live_mutators += 1;
    }

    pub(crate) fn deregister_mutator(&self) {
        let mut sync = self.sync.lock();
        sync.live_mutators -= 1;
        if sync.global_pause_flag && sync.mutators_stopped == sync.live_mutators {
            self.gc_can_start.notify_one();
        }
    }

    /// Called by every mutator before each allocation: if a pause has
    /// been requested, park at the safepoint until the cycle completes.
    pub(crate) fn poll_safepoint(&self) {
        let mut sync = self.sync.lock();
        if sync.global_pause_flag {
            self.stop_and_wait(&mut sync);
        }
    }

    /// Raises the global pause flag and parks the calling (registered)
    /// mutator until the collector finishes the cycle.
    pub(crate) fn trigger_and_wait_for_gc(&self) {
        let mut sync = self.sync.lock();
        sync.global_pause_flag = true;
        self.stop_and_wait(&mut sync);
    }

    /// Steps 3-7 of the pause protocol: register as stopped, hand the
    /// collector its quorum, wait out the cycle. The loop also absorbs
    /// spurious wakeups.
    fn stop_and_wait(&self, sync: &mut parking_lot::MutexGuard<'_, GcSync>) {
        sync.mutators_stopped += 1;
        if sync.mutators_stopped == sync.live_mutators {
            self.gc_can_start.notify_one();
        }
        while sync.global_pause_flag {
            self.gc_finished.wait(sync);
        }
        sync.mutators_stopped -= 1;
    }

    // ── allocation paths ──────────────────────────────────────────────

    /// Hands the mutator a fresh block, retiring `previous`. Attempts
    /// one collection cycle before reporting exhaustion.
    pub(crate) fn acquire_block(&self, previous: Option<Address>) -> Result<Address, HeapError> {
        if let Some(addr) = self.space.lock().get_block(previous) {
            return Ok(addr);
        }

        trace!("no free block, triggering gc");
        self.trigger_and_wait_for_gc();

        self.space
            .lock()
            .get_block(None)
            .ok_or(HeapError::OutOfMemory {
                requested: self.settings.block_size as u64,
            })
    }

    /// Retires the mutator's current block without replacement (mutator
    /// shutdown).
    pub(crate) fn retire_block(&self, block: Address) {
        self.space.lock().retire(block);
    }

    /// Reserves a contiguous run of blocks for an object too big for
    /// the bump-pointer path and returns its payload address. A cycle
    /// is triggered when no run fits or when the reservation would push
    /// occupancy past `large_gc_fraction`; one retry, then out of
    /// memory. Callers must be registered mutators.
    pub(crate) fn alloc_large(
        &self,
        header_size: u64,
        size: u64,
        align: u64,
    ) -> Result<Address, HeapError> {
        let prefix = object::align_up(header_size, align);
        let total = prefix + size;
        let need = total.div_ceil(self.settings.block_size as u64) as usize;

        let mut gc_done = false;
        loop {
            {
                let mut space = self.space.lock();
                let occupancy = space.used_blocks() + need;
                let limit = self.settings.large_gc_fraction * space.block_count() as f64;
                if gc_done || occupancy as f64 <= limit {
                    if let Some(run) = space.alloc_large(total) {
                        return Ok(run + prefix);
                    }
                }
            }
            if gc_done {
                return Err(HeapError::OutOfMemory { requested: total });
            }
            debug!(total, "large allocation triggering gc");
            self.trigger_and_wait_for_gc();
            gc_done = true;
        }
    }

    // ── marking ───────────────────────────────────────────────────────

    fn contains(&self, addr: Address) -> bool {
        addr >= self.begin && addr < self.begin + self.size
    }

    /// Marks one object reference: ignores null and out-of-space
    /// addresses, sets the header mark bit and the containing block's
    /// mark flag, and queues the object for field tracing.
    fn mark_ref(&self, addr: Address, state: &mut MarkState) {
        if addr == 0 || !self.contains(addr) {
            return;
        }
        // SAFETY: addr is the payload address of a live object, so the
        // 8 bytes below it hold its header.
        let header = unsafe { &*((addr - GC_HEADER_BYTES) as *const Header) };
        if header.is_marked() {
            return;
        }
        header.set_mark();
        self.space.lock().set_marked(addr);
        state.marked.push(addr);
        state.queue.push(addr);
    }

    /// Traces the reference fields of one object according to its type
    /// layout. Hybrid var parts use the length word stored below the
    /// header.
    fn trace_object(&self, addr: Address, state: &mut MarkState) {
        // SAFETY: addr was queued by mark_ref, so its header is valid.
        let header = unsafe { &*((addr - GC_HEADER_BYTES) as *const Header) };
        let ty = header.type_id();

        let mut offsets = Vec::new();
        object::ref_offsets(&self.types, ty, 0, &mut offsets);
        for offset in offsets {
            // SAFETY: offset lies inside the object's payload.
            let field = unsafe { load_u64(addr + offset) };
            self.mark_ref(field, state);
        }

        if matches!(self.types.get(ty), TypeDef::Hybrid { .. }) {
            let (var_offset, stride, elem) = object::hybrid_var_part(&self.types, ty);
            let mut elem_offsets = Vec::new();
            object::ref_offsets(&self.types, elem, 0, &mut elem_offsets);
            if elem_offsets.is_empty() {
                return;
            }
            // SAFETY: hybrids store their var length below the header.
            let len = unsafe { load_u64(addr - HYBRID_HEADER_BYTES) };
            for i in 0..len {
                for &rel in &elem_offsets {
                    // SAFETY: within the var part's i-th element.
                    let field = unsafe { load_u64(addr + var_offset + i * stride + rel) };
                    self.mark_ref(field, state);
                }
            }
        }
    }

    /// The mark phase: external roots from the client, then transitive
    /// closure over an explicit work list. Returns every marked payload
    /// address so the cycle end can reset the bits.
    fn mark(&self) -> Vec<Address> {
        let mut state = MarkState::default();
        {
            let mut slot = self.client.lock();
            if let Some(client) = slot.as_mut() {
                let mut marker = ObjectMarker {
                    heap: self,
                    state: &mut state,
                };
                client.mark_external_roots(&mut marker);
            }
        }
        while let Some(addr) = state.queue.pop() {
            self.trace_object(addr, &mut state);
        }
        state.marked
    }
}

#[derive(Default)]
struct MarkState {
    queue: Vec<Address>,
    marked: Vec<Address>,
}

/// Handed to [`Client::mark_external_roots`]; accepts object references
/// and queues them for tracing.
pub struct ObjectMarker<'a> {
    heap: &'a HeapInner,
    state: &'a mut MarkState,
}

impl ObjectMarker<'_> {
    pub fn mark_obj_ref(&mut self, addr: Address) {
        self.heap.mark_ref(addr, self.state);
    }
}

/// The collector thread: wait for the rendezvous, mark and sweep with
/// the monitor released, then clear the mark bits and resume the world.
fn collector_loop(heap: &HeapInner) {
    loop {
        {
            let mut sync = heap.sync.lock();
            loop {
                if sync.shutdown {
                    return;
                }
                if sync.global_pause_flag && sync.mutators_stopped == sync.live_mutators {
                    break;
                }
                heap.gc_can_start.wait(&mut sync);
            }
        }

        debug!("gc: all mutators stopped, marking");
        let marked = heap.mark();
        let stats = heap.space.lock().sweep();
        debug!(
            marked_objects = marked.len(),
            freed_blocks = stats.freed_blocks,
            retained_blocks = stats.retained_blocks,
            "gc: sweep complete"
        );

        let mut sync = heap.sync.lock();
        for &addr in &marked {
            // SAFETY: addr was marked this cycle; its header is live.
            let header = unsafe { &*((addr - GC_HEADER_BYTES) as *const Header) };
            header.clear_mark();
        }
        sync.global_pause_flag = false;
        heap.gc_cycles.fetch_add(1, Ordering::Release);
        heap.gc_finished.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use object::{TypeDef, TypeId, TypeTable};

    use crate::memory::store_u64;
    use crate::HeapError;

    const BLOCK: u64 = 65_536;

    fn large_settings() -> HeapSettings {
        HeapSettings {
            heap_size: 4 * 1024 * 1024, // 64 blocks
            block_size: BLOCK as usize,
            large_gc_fraction: 0.75,
        }
    }

    fn small_settings(blocks: usize) -> HeapSettings {
        HeapSettings {
            heap_size: blocks * 4096,
            block_size: 4096,
            large_gc_fraction: 0.75,
        }
    }

    /// Byte-array hybrid plus its table, as the allocation tests use it.
    fn char_array_types() -> (Arc<TypeTable>, TypeId) {
        let mut table = TypeTable::new();
        let byte = table.intern(TypeDef::Int { bits: 8 });
        let chars = table.intern(TypeDef::Hybrid {
            fixed: vec![],
            var: byte,
        });
        (Arc::new(table), chars)
    }

    /// Client that marks a sub-range of a shared root list.
    struct SliceClient {
        roots: Arc<StdMutex<Vec<Address>>>,
        range: std::ops::Range<usize>,
    }

    impl Client for SliceClient {
        fn mark_external_roots(&mut self, marker: &mut ObjectMarker<'_>) {
            let roots = self.roots.lock().expect("lock roots");
            for i in self.range.clone() {
                marker.mark_obj_ref(roots[i]);
            }
        }
    }

    #[test]
    fn large_object_pressure_frees_unreachable_hybrids() {
        let (types, chars) = char_array_types();
        let heap = Heap::new(large_settings(), types);
        let mut mutator = heap.make_mutator();

        const UNIT: u64 = 128 * 1024; // three blocks per unit
        let roots = Arc::new(StdMutex::new(vec![0; 15]));
        heap.set_client(Some(Box::new(SliceClient {
            roots: Arc::clone(&roots),
            range: 0..15,
        })));

        for i in 0..15usize {
            let addr = mutator.new_hybrid(chars, UNIT).expect("unit allocation");
            // Each unit takes the lowest free 3-block run.
            assert_eq!(addr, heap.begin + i as u64 * 3 * BLOCK + HYBRID_HEADER_BYTES);
            roots.lock().expect("lock roots")[i] = addr;
        }
        assert_eq!(heap.gc_cycles(), 0, "units alone must not trigger gc");

        // Stamp object 8 so survival is observable.
        let obj8 = roots.lock().expect("lock roots")[8];
        unsafe {
            store_u64(obj8, 0xFEED_FACE_CAFE_BEEF);
            store_u64(obj8 + UNIT - 8, 0x0123_4567_89AB_CDEF);
        }

        // From here on only object 8 is externally reachable.
        heap.set_client(Some(Box::new(SliceClient {
            roots: Arc::clone(&roots),
            range: 8..9,
        })));

        let lo = mutator.new_hybrid(chars, 1024 * 1024).expect("large allocation");
        assert_eq!(heap.gc_cycles(), 1, "the 1 MiB hybrid must trigger exactly one gc");

        // The freed runs below object 8 are reused lowest-address-first.
        assert_eq!(lo, heap.begin + HYBRID_HEADER_BYTES);

        // Object 8 survived with its bytes intact and its mark bit reset.
        unsafe {
            assert_eq!(load_u64(obj8), 0xFEED_FACE_CAFE_BEEF);
            assert_eq!(load_u64(obj8 + UNIT - 8), 0x0123_4567_89AB_CDEF);
            assert_eq!(load_u64(obj8 - HYBRID_HEADER_BYTES), UNIT);
            let header = &*((obj8 - GC_HEADER_BYTES) as *const Header);
            assert!(!header.is_marked(), "mark bits are reset at cycle end");
        }

        // Survivor run (3 blocks) plus the new large run (17 blocks).
        assert_eq!(heap.used_blocks(), 20);

        // Teardown mirrors a client shutdown: no roots, one last cycle.
        mutator.close();
        heap.set_client(None);
        heap.mutator_trigger_and_wait_for_gc_end();
        assert_eq!(heap.used_blocks(), 0);
    }

    #[test]
    fn exhaustion_triggers_gc_and_recycles_blocks() {
        let (types, _) = char_array_types();
        let heap = Heap::new(small_settings(16), types);
        let mut mutator = heap.make_mutator();

        // No client: everything allocated is garbage to the collector.
        for _ in 0..100 {
            let addr = mutator.alloc(1000, 8, 8).expect("small allocation");
            assert_eq!(addr % 8, 0);
            let block_of = |a: Address| (a - heap.begin) / 4096;
            assert_eq!(
                block_of(addr),
                block_of(addr + 1000 - 1),
                "allocation must lie within one block"
            );
            assert!(mutator.cur_block <= mutator.cursor);
            assert!(mutator.cursor <= mutator.limit);
            assert_eq!(mutator.limit - mutator.cur_block, 4096);
        }
        assert!(
            heap.gc_cycles() >= 1,
            "100 KB of garbage cannot fit a 64 KB heap without a gc"
        );
    }

    #[test]
    fn out_of_memory_when_every_block_is_reachable() {
        let mut table = TypeTable::new();
        let byte = table.intern(TypeDef::Int { bits: 8 });
        let filler = table.intern(TypeDef::Array {
            elem: byte,
            len: 4000,
        });
        let heap = Heap::new(small_settings(16), Arc::new(table));
        let mut mutator = heap.make_mutator();

        let roots = Arc::new(StdMutex::new(Vec::new()));
        heap.set_client(Some(Box::new(SliceClient {
            roots: Arc::clone(&roots),
            range: 0..16,
        })));

        // One filler per block; all sixteen stay reachable.
        for _ in 0..16 {
            let addr = mutator.new_fixed(filler).expect("filler allocation");
            roots.lock().expect("lock roots").push(addr);
        }

        let err = mutator.new_fixed(filler).expect_err("heap is pinned full");
        assert!(matches!(err, HeapError::OutOfMemory { .. }));
        assert!(heap.gc_cycles() >= 1, "out of memory is reported only after a gc");

        // Dropping the roots makes the next allocation succeed again.
        heap.set_client(None);
        mutator.new_fixed(filler).expect("allocation after roots dropped");
    }

    #[test]
    fn reference_fields_keep_objects_alive_transitively() {
        let mut table = TypeTable::new();
        let i64_t = table.intern(TypeDef::Int { bits: 64 });
        let node = {
            // node = struct { payload: i64, next: ref<node-ish> }; the
            // referent type is only used for layout, so i64 suffices.
            let next = table.intern(TypeDef::Ref { to: i64_t });
            table.intern(TypeDef::Struct {
                fields: vec![i64_t, next],
            })
        };
        let heap = Heap::new(small_settings(16), Arc::new(table));
        let mut mutator = heap.make_mutator();

        // head -> mid -> tail chain; only head is an external root.
        let tail = mutator.new_fixed(node).expect("tail");
        let mid = mutator.new_fixed(node).expect("mid");
        let head = mutator.new_fixed(node).expect("head");
        unsafe {
            store_u64(tail, 3);
            store_u64(tail + 8, 0);
            store_u64(mid, 2);
            store_u64(mid + 8, tail);
            store_u64(head, 1);
            store_u64(head + 8, mid);
        }

        let roots = Arc::new(StdMutex::new(vec![head]));
        heap.set_client(Some(Box::new(SliceClient {
            roots: Arc::clone(&roots),
            range: 0..1,
        })));
        mutator.trigger_and_wait_for_gc();

        unsafe {
            assert_eq!(load_u64(head + 8), mid);
            assert_eq!(load_u64(mid + 8), tail);
            assert_eq!(load_u64(tail), 3, "tail reached transitively, bytes intact");
            for addr in [head, mid, tail] {
                let header = &*((addr - GC_HEADER_BYTES) as *const Header);
                assert!(!header.is_marked(), "mark bits are reset at cycle end");
            }
        }
    }

    #[test]
    fn concurrent_mutators_rendezvous_at_the_safepoint() {
        let (types, _) = char_array_types();
        let heap = Heap::new(small_settings(64), types);

        let mut trigger = heap.make_mutator();
        let mut worker = heap.make_mutator();
        let inner: &HeapInner = &heap;

        std::thread::scope(|scope| {
            scope.spawn(|| {
                // Allocate until the collector has run; every iteration
                // polls the safepoint, so the worker joins the pause.
                while inner.gc_cycles() == 0 {
                    worker.alloc(56, 8, 8).expect("worker allocation");
                }
                // Fresh state after resume: allocation still works.
                worker.alloc(56, 8, 8).expect("post-gc allocation");
                worker.close();
            });

            trigger.trigger_and_wait_for_gc();
            assert!(inner.gc_cycles() >= 1);
            trigger.alloc(56, 8, 8).expect("post-gc allocation");
            trigger.close();
        });
    }

    #[test]
    fn trigger_without_live_mutators_completes() {
        let (types, _) = char_array_types();
        let heap = Heap::new(small_settings(16), types);
        heap.mutator_trigger_and_wait_for_gc_end();
        heap.mutator_trigger_and_wait_for_gc_end();
        assert_eq!(heap.gc_cycles(), 2);
    }

    #[test]
    fn oversized_large_request_is_out_of_memory() {
        let (types, chars) = char_array_types();
        let heap = Heap::new(small_settings(16), types);
        let mut mutator = heap.make_mutator();

        let err = mutator
            .new_hybrid(chars, 20 * 4096)
            .expect_err("larger than the whole space");
        assert!(matches!(err, HeapError::OutOfMemory { .. }));
        mutator.close();
    }

    #[test]
    #[should_panic(expected = "invalid heap settings")]
    fn misaligned_settings_are_rejected() {
        let (types, _) = char_array_types();
        let _ = Heap::new(
            HeapSettings {
                heap_size: 10_000,
                block_size: 1000,
                large_gc_fraction: 0.75,
            },
            types,
        );
    }
}
