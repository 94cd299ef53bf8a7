#![doc = include_str!("../README.md")]

// Table of contents of this file:
//
// * Constants and grid arithmetic
// * The block representation and the free-list stacks
// * The chunk allocator (carving the reserve, growing it, recycling)
// * Refill
// * Smpool: the public alloc/free facade and the GlobalAlloc impl
// * Test support (`help_` methods)
// * Transparent-box tests

pub mod platformalloc;

pub use platformalloc::AllocFailed;

use core::alloc::{GlobalAlloc, Layout};
use std::process;
use std::ptr::{copy_nonoverlapping, null_mut};

use spin::Mutex;

// --- Constants and grid arithmetic ---

/// The grid quantum. Every pooled block size is a multiple of this, so a
/// free block is always wide enough to hold its own free-list link.
pub const ALIGN: usize = 8;

/// Requests above this many bytes skip the pool and go straight to the
/// system allocator.
pub const MAX_BYTES: usize = 128;

/// One free list per size class: 8, 16, 24, ... 128 bytes.
pub const NUM_FREELISTS: usize = MAX_BYTES / ALIGN;

/// How many blocks we ask the chunk allocator for when a free list runs
/// dry. The chunk allocator may hand back fewer (but at least one).
pub const DEFAULT_REFILL_BLOCKS: usize = 20;

/// Process exit status used when allocation fails irrecoverably.
pub const OOM_EXIT_CODE: i32 = -1;

/// The smallest multiple of [`ALIGN`] that is >= `nbytes`.
pub const fn round_up(nbytes: usize) -> usize {
    (nbytes + ALIGN - 1) & !(ALIGN - 1)
}

/// Which free list holds blocks big enough for `nbytes`.
///
/// Class `i` holds blocks of exactly `(i + 1) * ALIGN` bytes, so this is
/// the inverse of that mapping after rounding up onto the grid. Callers
/// must keep `nbytes` in `1..=MAX_BYTES`.
pub const fn freelist_index(nbytes: usize) -> usize {
    debug_assert!(nbytes >= 1 && nbytes <= MAX_BYTES);
    (nbytes + ALIGN - 1) / ALIGN - 1
}

// --- The block representation and the free-list stacks ---

// A block is just bytes. While a block is on a free list, its first word
// holds the pointer to the next free block of the same class; while it is
// out with a caller, every byte of it is caller data and the pool keeps
// nothing. Reinterpreting the head word is the entire unsafe core of the
// pool, and it is sound because ALIGN >= size_of::<*mut _>() on every
// supported target and every pooled block lies on the grid.
#[repr(transparent)]
struct FreeBlock {
    next: *mut FreeBlock,
}

struct PoolState {
    /// Cumulative bytes ever obtained from the system for this pool's
    /// reserve. Feeds the growth slack, so it only ever goes up.
    total_used: usize,
    /// The reserve `[pool_start, pool_end)`: contiguous bytes that have
    /// been obtained from the system but not yet carved into blocks.
    pool_start: *mut u8,
    pool_end: *mut u8,
    /// Heads of the 16 LIFO free lists.
    free_lists: [*mut FreeBlock; NUM_FREELISTS],
}

// The raw pointers in PoolState are only ever touched under the pool's
// mutex, and the memory they point at belongs to the pool alone.
unsafe impl Send for PoolState {}

impl PoolState {
    const fn new() -> Self {
        Self {
            total_used: 0,
            pool_start: null_mut(),
            pool_end: null_mut(),
            free_lists: [null_mut(); NUM_FREELISTS],
        }
    }

    /// Push the block at `p` onto free list `index`. The block's first
    /// word becomes the link; whatever the caller left in it is gone.
    fn push_block(&mut self, index: usize, p: *mut u8) {
        debug_assert!(index < NUM_FREELISTS);
        debug_assert!(!p.is_null());
        debug_assert!(p.addr() % ALIGN == 0, "block off the grid: {:?}", p);

        let block = p.cast::<FreeBlock>();
        unsafe { (*block).next = self.free_lists[index] };
        self.free_lists[index] = block;
    }

    /// Pop the head of free list `index`, or None if that list is empty.
    fn pop_block(&mut self, index: usize) -> Option<*mut u8> {
        debug_assert!(index < NUM_FREELISTS);

        let block = self.free_lists[index];
        if block.is_null() {
            return None;
        }
        self.free_lists[index] = unsafe { (*block).next };
        Some(block.cast::<u8>())
    }

    // --- The chunk allocator ---

    /// Hand back a contiguous run of `*nblocks` back-to-back blocks of
    /// `size` bytes each, lowering `*nblocks` if the reserve can't cover
    /// the full batch (but never below 1).
    ///
    /// Three cases, in order:
    ///
    /// 1. The reserve covers the whole batch: carve it off the front.
    /// 2. The reserve covers at least one block: carve what fits and
    ///    lower `*nblocks`. We deliberately don't go to the system here;
    ///    the caller may never need the rest of the batch, and the free
    ///    list is about to be restocked either way.
    /// 3. The reserve can't cover even one block. Escalate: salvage the
    ///    sub-block leftover onto the free list whose class matches its
    ///    size (the reserve length is always a multiple of ALIGN, so the
    ///    leftover is a whole block of some smaller class), then make
    ///    exactly one system request for twice the batch plus a slack
    ///    that grows with everything this pool has ever obtained. If the
    ///    system refuses, scan the free lists of this class and larger;
    ///    the first block found becomes the new reserve. Whichever arm
    ///    wins, recurse -- the recursion lands in case 1 or 2 and so is
    ///    bounded at depth 2. If nothing wins, the pool is exhausted.
    fn chunk_alloc<S: SysAlloc>(
        &mut self,
        src: &S,
        size: usize,
        nblocks: &mut usize,
    ) -> Result<*mut u8, AllocFailed> {
        debug_assert!(size % ALIGN == 0);
        debug_assert!(size >= ALIGN && size <= MAX_BYTES);
        debug_assert!(*nblocks >= 1);

        let want = size * *nblocks;
        let avail = self.pool_end.addr() - self.pool_start.addr();

        if avail >= want {
            let result = self.pool_start;
            self.pool_start = unsafe { self.pool_start.add(want) };
            Ok(result)
        } else if avail >= size {
            *nblocks = avail / size;
            let took = size * *nblocks;
            let result = self.pool_start;
            self.pool_start = unsafe { self.pool_start.add(took) };
            Ok(result)
        } else {
            if avail > 0 {
                // The leftover is a whole block of a smaller class.
                let p = self.pool_start;
                self.push_block(freelist_index(avail), p);
            }

            let bytes_to_alloc = 2 * want + round_up(self.total_used >> 4);
            match src.sys_alloc(bytes_to_alloc) {
                Ok(p) => {
                    self.pool_start = p;
                    self.pool_end = unsafe { p.add(bytes_to_alloc) };
                    self.total_used += bytes_to_alloc;
                    self.chunk_alloc(src, size, nblocks)
                }
                Err(AllocFailed) => {
                    // The system refused. Try to repurpose a free block of
                    // this class or larger as the new reserve. One block is
                    // enough: the recursion re-runs the carve against it.
                    self.pool_start = null_mut();
                    let mut blocksize = size;
                    while blocksize <= MAX_BYTES {
                        if let Some(p) = self.pop_block(freelist_index(blocksize)) {
                            self.pool_start = p;
                            self.pool_end = unsafe { p.add(blocksize) };
                            return self.chunk_alloc(src, size, nblocks);
                        }
                        blocksize += ALIGN;
                    }

                    // Nothing anywhere. Null the reserve so the pool state
                    // stays consistent for whoever looks next.
                    self.pool_end = null_mut();
                    Err(AllocFailed)
                }
            }
        }
    }

    // --- Refill ---

    /// Restock the free list for (aligned) `size` and return one block.
    ///
    /// Asks the chunk allocator for a batch of DEFAULT_REFILL_BLOCKS.
    /// Block 0 goes to the caller; blocks 1.. are threaded onto the free
    /// list front-to-back, each one's head word linking to the next, the
    /// last to null. Only reached when the list is empty, so there is
    /// nothing to splice onto.
    fn refill<S: SysAlloc>(&mut self, src: &S, size: usize) -> Result<*mut u8, AllocFailed> {
        debug_assert!(size % ALIGN == 0);
        debug_assert!(size >= ALIGN && size <= MAX_BYTES);

        let mut nblocks = DEFAULT_REFILL_BLOCKS;
        let chunk = self.chunk_alloc(src, size, &mut nblocks)?;

        if nblocks == 1 {
            return Ok(chunk);
        }

        let index = freelist_index(size);
        debug_assert!(self.free_lists[index].is_null());

        let mut prev = unsafe { chunk.add(size) }.cast::<FreeBlock>();
        self.free_lists[index] = prev;
        for k in 2..nblocks {
            let next = unsafe { chunk.add(k * size) }.cast::<FreeBlock>();
            unsafe { (*prev).next = next };
            prev = next;
        }
        unsafe { (*prev).next = null_mut() };

        Ok(chunk)
    }
}

// --- Smpool: the public facade ---

/// Where a pool gets its memory. The default source is the operating
/// system ([`PlatformAlloc`]); tests inject counting and failing sources
/// through this seam.
pub trait SysAlloc {
    fn sys_alloc(&self, nbytes: usize) -> Result<*mut u8, AllocFailed>;
    fn sys_dealloc(&self, p: *mut u8, nbytes: usize);
}

/// The operating system's virtual-memory facilities, via
/// [`platformalloc`]'s per-platform vendor module.
pub struct PlatformAlloc;

impl SysAlloc for PlatformAlloc {
    fn sys_alloc(&self, nbytes: usize) -> Result<*mut u8, AllocFailed> {
        platformalloc::sys_alloc(nbytes)
    }

    fn sys_dealloc(&self, p: *mut u8, nbytes: usize) {
        platformalloc::sys_dealloc(p, nbytes)
    }
}

/// A small-object pool allocator.
///
/// Requests of up to [`MAX_BYTES`] bytes are served from per-size free
/// lists restocked in batches carved from a contiguous reserve; bigger
/// requests pass through to the memory source untouched. All pool state
/// sits behind one mutex, and a freshly constructed (all-zero) pool is
/// valid and empty -- the first small allocation populates it.
///
/// Pools are independent of each other. One process-wide pool is
/// provided as [`DEFAULT_POOL`], and any pool can serve as the global
/// allocator:
///
/// ```rust,no_run
/// #[global_allocator]
/// static POOL: smpool::Smpool = smpool::Smpool::new();
/// ```
pub struct Smpool<S: SysAlloc = PlatformAlloc> {
    src: S,
    state: Mutex<PoolState>,
}

/// The process-wide default pool.
pub static DEFAULT_POOL: Smpool = Smpool::new();

impl Smpool<PlatformAlloc> {
    pub const fn new() -> Self {
        Self::with_source(PlatformAlloc)
    }
}

impl Default for Smpool<PlatformAlloc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SysAlloc> Smpool<S> {
    /// A pool drawing memory from `src` instead of the platform.
    pub const fn with_source(src: S) -> Self {
        Self {
            src,
            state: Mutex::new(PoolState::new()),
        }
    }

    /// Allocate `nbytes` bytes, aligned to the 8-byte grid.
    ///
    /// Never returns null: on irrecoverable exhaustion the process exits
    /// with [`OOM_EXIT_CODE`]. A zero-byte request is served as one byte.
    /// Release the result with [`free`](Self::free) and the same size.
    pub fn alloc(&self, nbytes: usize) -> *mut u8 {
        match self.try_alloc(nbytes) {
            Ok(p) => p,
            Err(AllocFailed) => process::exit(OOM_EXIT_CODE),
        }
    }

    /// [`alloc`](Self::alloc), except exhaustion comes back as an error
    /// instead of ending the process.
    pub fn try_alloc(&self, nbytes: usize) -> Result<*mut u8, AllocFailed> {
        // Zero-byte requests are served as one byte so the non-null
        // contract holds for them too.
        let nbytes = if nbytes == 0 { 1 } else { nbytes };

        if nbytes > MAX_BYTES {
            return self.src.sys_alloc(nbytes);
        }

        let mut state = self.state.lock();
        let index = freelist_index(nbytes);
        if let Some(p) = state.pop_block(index) {
            return Ok(p);
        }
        state.refill(&self.src, round_up(nbytes))
    }

    /// Release a block obtained from [`alloc`](Self::alloc) on this pool
    /// with the same `nbytes`.
    ///
    /// Small blocks go back onto their class's free list; they are never
    /// returned to the system. Large blocks go straight back to the
    /// source, bypassing the pool just like they did on the way out. A
    /// size of zero is taken as one byte, mirroring `alloc`.
    pub fn free(&self, p: *mut u8, nbytes: usize) {
        debug_assert!(!p.is_null());

        let nbytes = if nbytes == 0 { 1 } else { nbytes };

        if nbytes > MAX_BYTES {
            self.src.sys_dealloc(p, nbytes);
            return;
        }

        let mut state = self.state.lock();
        state.push_block(freelist_index(nbytes), p);
    }

    /// A snapshot of the pool's bookkeeping.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let mut free_blocks = [0usize; NUM_FREELISTS];
        for (index, count) in free_blocks.iter_mut().enumerate() {
            let mut block = state.free_lists[index];
            while !block.is_null() {
                *count += 1;
                block = unsafe { (*block).next };
            }
        }
        PoolStats {
            total_used: state.total_used,
            reserve_bytes: state.pool_end.addr() - state.pool_start.addr(),
            free_blocks,
        }
    }
}

/// What [`Smpool::stats`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Cumulative bytes obtained from the memory source for the reserve.
    pub total_used: usize,
    /// Bytes currently sitting uncarved in the reserve.
    pub reserve_bytes: usize,
    /// Number of blocks on each free list.
    pub free_blocks: [usize; NUM_FREELISTS],
}

unsafe impl<S: SysAlloc> GlobalAlloc for Smpool<S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        debug_assert!(layout.size() > 0);

        // The pool only guarantees grid alignment. Stronger layouts take
        // the passthrough, which is page-aligned on every platform.
        if layout.align() > ALIGN {
            return match self.src.sys_alloc(layout.size()) {
                Ok(p) => p,
                Err(AllocFailed) => process::exit(OOM_EXIT_CODE),
            };
        }

        Smpool::alloc(self, layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }

        // Mirror the routing in `alloc`: the layout is the caller's
        // remembered size, and it picks the same path both ways.
        if layout.align() > ALIGN {
            self.src.sys_dealloc(ptr, layout.size());
            return;
        }

        self.free(ptr, layout.size())
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // Nothing in the pool resizes in place: get a new block, copy,
        // release the old one.
        let new_layout = match Layout::from_size_align(new_size, layout.align()) {
            Ok(l) => l,
            Err(_) => return null_mut(),
        };

        let new_ptr = unsafe { <Self as GlobalAlloc>::alloc(self, new_layout) };
        unsafe {
            copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
            self.dealloc(ptr, layout);
        }

        new_ptr
    }
}

// --- Test support ---

impl<S: SysAlloc> Smpool<S> {
    /// Test support: the reserve bounds as raw addresses (start, end).
    pub fn help_reserve_bounds(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.pool_start.addr(), state.pool_end.addr())
    }

    /// Test support: make `[p, p + nbytes)` the pool's reserve.
    ///
    /// # Safety
    ///
    /// `p` must point to at least `nbytes` of writable memory that
    /// nothing else will touch for the pool's lifetime, and `nbytes`
    /// must be a multiple of [`ALIGN`].
    pub unsafe fn help_install_reserve(&self, p: *mut u8, nbytes: usize) {
        debug_assert!(nbytes % ALIGN == 0);

        let mut state = self.state.lock();
        state.pool_start = p;
        state.pool_end = unsafe { p.add(nbytes) };
    }

    /// Test support: push one block onto free list `index`.
    ///
    /// # Safety
    ///
    /// `p` must point to at least `(index + 1) * ALIGN` bytes of writable
    /// memory that nothing else will touch for the pool's lifetime.
    pub unsafe fn help_seed_freelist(&self, index: usize, p: *mut u8) {
        let mut state = self.state.lock();
        state.push_block(index, p);
    }
}

// --- Transparent-box tests ---

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

    /// A memory source that hands out real system memory but counts
    /// requests, remembers the most recent request size, and can be told
    /// to start refusing after a given number of successes.
    struct CountingSource {
        allowed: usize,
        calls: AtomicUsize,
        last_reqsize: AtomicUsize,
    }

    impl CountingSource {
        fn new() -> Self {
            Self::failing_after(usize::MAX)
        }

        fn failing_after(allowed: usize) -> Self {
            Self {
                allowed,
                calls: AtomicUsize::new(0),
                last_reqsize: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Relaxed)
        }

        fn last_reqsize(&self) -> usize {
            self.last_reqsize.load(Relaxed)
        }
    }

    impl SysAlloc for CountingSource {
        fn sys_alloc(&self, nbytes: usize) -> Result<*mut u8, AllocFailed> {
            let n = self.calls.fetch_add(1, Relaxed);
            self.last_reqsize.store(nbytes, Relaxed);
            if n >= self.allowed {
                return Err(AllocFailed);
            }
            platformalloc::sys_alloc(nbytes)
        }

        fn sys_dealloc(&self, p: *mut u8, nbytes: usize) {
            platformalloc::sys_dealloc(p, nbytes)
        }
    }

    fn help_testpool() -> Smpool<CountingSource> {
        Smpool::with_source(CountingSource::new())
    }

    #[test]
    fn grid_closure() {
        for b in 1..=MAX_BYTES {
            let r = round_up(b);
            assert_eq!(r % ALIGN, 0, "b: {}", b);
            assert!(r >= b, "b: {}", b);
            assert!(r < b + ALIGN, "b: {}", b);
        }
    }

    #[test]
    fn index_round_trip() {
        for b in 1..=MAX_BYTES {
            assert_eq!((freelist_index(b) + 1) * ALIGN, round_up(b), "b: {}", b);
        }
    }

    #[test]
    fn index_boundaries() {
        assert_eq!(freelist_index(1), 0);
        assert_eq!(freelist_index(8), 0);
        assert_eq!(freelist_index(9), 1);
        assert_eq!(freelist_index(16), 1);
        assert_eq!(freelist_index(127), 15);
        assert_eq!(freelist_index(128), 15);
    }

    #[test]
    fn cold_alloc_then_reuse() {
        let pool = help_testpool();

        // Step 1: the first small allocation restocks from a cold pool.
        // One system request: 2 * (8 * 20) for the batch plus zero slack.
        let p = pool.alloc(7);
        assert!(!p.is_null());
        assert_eq!(pool.src.calls(), 1);
        assert_eq!(pool.src.last_reqsize(), 320);

        // The batch carved 20 blocks of 8; one came back to us, 19 went
        // onto free list 0, and half the system bytes are still reserve.
        let (start, end) = pool.help_reserve_bounds();
        assert_eq!(end - start, 160);
        assert_eq!(p.addr(), start - 160);
        let stats = pool.stats();
        assert_eq!(stats.total_used, 320);
        assert_eq!(stats.free_blocks[0], 19);

        // Step 2: a same-class allocation pops the head of the restocked
        // list -- the surplus block right after ours -- with no system
        // traffic.
        let p2 = pool.alloc(1);
        assert_eq!(p2.addr(), p.addr() + 8);
        assert_eq!(pool.src.calls(), 1);
        assert_eq!(pool.stats().free_blocks[0], 18);
    }

    #[test]
    fn surplus_blocks_are_contiguous_and_in_order() {
        let pool = help_testpool();

        let p0 = pool.alloc(8);
        // The 19 surplus blocks thread front-to-back, so popping them
        // walks the batch in address order.
        for k in 1..DEFAULT_REFILL_BLOCKS {
            let pk = pool.alloc(8);
            assert_eq!(pk.addr(), p0.addr() + k * 8, "k: {}", k);
        }
        assert_eq!(pool.stats().free_blocks[0], 0);
        assert_eq!(pool.src.calls(), 1);
    }

    #[test]
    fn lifo_reuse() {
        let pool = help_testpool();

        let p = pool.alloc(24);
        pool.free(p, 24);

        // Any request in the same class gets the just-released block.
        let q = pool.alloc(17);
        assert_eq!(q.addr(), p.addr());
    }

    #[test]
    fn zero_byte_requests_take_class_zero() {
        let pool = help_testpool();

        let p = pool.alloc(0);
        assert!(!p.is_null());
        pool.free(p, 0);

        // The release of size 0 mirrors the allocation of size 0: both
        // land in class 0, so the block comes right back.
        let q = pool.alloc(1);
        assert_eq!(q.addr(), p.addr());
    }

    #[test]
    fn large_requests_bypass_the_pool() {
        let pool = help_testpool();

        let p = pool.alloc(200);
        assert!(!p.is_null());
        assert_eq!(pool.src.calls(), 1);
        assert_eq!(pool.src.last_reqsize(), 200);

        // Pool state is untouched either way.
        let stats = pool.stats();
        assert_eq!(stats.total_used, 0);
        assert_eq!(stats.reserve_bytes, 0);
        assert_eq!(stats.free_blocks, [0; NUM_FREELISTS]);

        pool.free(p, 200);
        assert_eq!(pool.stats().free_blocks, [0; NUM_FREELISTS]);
    }

    #[test]
    fn leftover_is_salvaged_before_growing() {
        let pool = help_testpool();

        // Step 0: hand the pool a reserve of 16 bytes -- too small for
        // even one 24-byte block.
        let backing = platformalloc::sys_alloc(4096).unwrap();
        unsafe { pool.help_install_reserve(backing, 16) };

        // Step 1: a 24-byte request can't be carved, so the 16-byte
        // leftover becomes a class-1 free block and the reserve grows by
        // 2 * (24 * 20) + 0 slack bytes.
        let p = pool.alloc(24);
        assert!(!p.is_null());
        assert_eq!(pool.src.calls(), 1);
        assert_eq!(pool.src.last_reqsize(), 960);

        let stats = pool.stats();
        assert_eq!(stats.free_blocks[1], 1);
        assert_eq!(stats.free_blocks[2], 19);
        assert_eq!(stats.reserve_bytes, 480);

        // Step 2: the salvaged block is the old reserve start, and a
        // class-1 request gets exactly it.
        let q = pool.alloc(16);
        assert_eq!(q.addr(), backing.addr());
    }

    #[test]
    fn partial_carve_lowers_the_batch() {
        let pool = help_testpool();

        // A 40-byte reserve covers five 8-byte blocks but not twenty.
        let backing = platformalloc::sys_alloc(4096).unwrap();
        unsafe { pool.help_install_reserve(backing, 40) };

        let p = pool.alloc(8);
        assert_eq!(p.addr(), backing.addr());
        // No system traffic: partial service beats growing the reserve.
        assert_eq!(pool.src.calls(), 0);
        assert_eq!(pool.stats().free_blocks[0], 4);
        assert_eq!(pool.stats().reserve_bytes, 0);
    }

    #[test]
    fn single_block_batch_skips_threading() {
        let pool = help_testpool();

        let backing = platformalloc::sys_alloc(4096).unwrap();
        unsafe { pool.help_install_reserve(backing, 8) };

        let p = pool.alloc(8);
        assert_eq!(p.addr(), backing.addr());
        assert_eq!(pool.src.calls(), 0);
        assert_eq!(pool.stats().free_blocks[0], 0);
    }

    #[test]
    fn recycle_from_larger_class_when_system_refuses() {
        // A source that never succeeds, and one 128-byte block sitting on
        // the largest class's free list.
        let pool = Smpool::with_source(CountingSource::failing_after(0));
        let block = platformalloc::sys_alloc(128).unwrap();
        unsafe { pool.help_seed_freelist(NUM_FREELISTS - 1, block) };

        // Step 1: an 8-byte request finds the reserve empty and the
        // system unwilling, walks the classes upward, and repurposes the
        // 128-byte block as the reserve.
        let p = pool.alloc(8);
        assert_eq!(p.addr(), block.addr());
        assert_eq!(pool.src.calls(), 1);

        // Step 2: the 128-byte reserve yielded a 16-block batch: one for
        // us, 15 threaded onto class 0, nothing left over.
        let stats = pool.stats();
        assert_eq!(stats.free_blocks[0], 15);
        assert_eq!(stats.free_blocks[NUM_FREELISTS - 1], 0);
        assert_eq!(stats.reserve_bytes, 0);
    }

    #[test]
    fn exhaustion_surfaces_as_err() {
        let pool = Smpool::with_source(CountingSource::failing_after(0));

        assert!(pool.try_alloc(8).is_err());

        // The reserve is nulled out on the way down, so the pool state
        // stays consistent (and a later retry just fails again).
        assert_eq!(pool.help_reserve_bounds(), (0, 0));
        assert!(pool.try_alloc(8).is_err());
    }

    #[test]
    fn growth_request_carries_slack() {
        let pool = help_testpool();

        // Drain the first batch and the reserve behind it: 20 blocks from
        // the batch (1 returned + 19 listed), then 20 more carved from
        // the 160-byte reserve.
        for _ in 0..40 {
            pool.alloc(8);
        }
        assert_eq!(pool.src.calls(), 1);
        assert_eq!(pool.stats().reserve_bytes, 0);
        assert_eq!(pool.stats().free_blocks[0], 0);

        // The next exhaustion asks for 2 * 160 plus the slack term
        // round_up(320 >> 4) = 24.
        pool.alloc(8);
        assert_eq!(pool.src.calls(), 2);
        assert_eq!(pool.src.last_reqsize(), 344);
        assert_eq!(pool.stats().total_used, 664);
    }

    #[test]
    fn layouts_above_grid_alignment_bypass_the_pool() {
        let pool = help_testpool();

        let layout = Layout::from_size_align(64, 16).unwrap();
        let p = unsafe { GlobalAlloc::alloc(&pool, layout) };
        assert!(!p.is_null());
        assert_eq!(pool.src.calls(), 1);
        assert_eq!(pool.src.last_reqsize(), 64);
        assert_eq!(pool.stats().free_blocks, [0; NUM_FREELISTS]);

        unsafe { GlobalAlloc::dealloc(&pool, p, layout) };
        assert_eq!(pool.stats().free_blocks, [0; NUM_FREELISTS]);
    }

    #[test]
    fn global_alloc_round_trip() {
        let pool = help_testpool();

        let layout = Layout::from_size_align(48, 8).unwrap();
        let p = unsafe { GlobalAlloc::alloc(&pool, layout) };
        assert!(!p.is_null());
        // Served from the pool: the layout size is in class 5.
        assert_eq!(pool.stats().free_blocks[5], DEFAULT_REFILL_BLOCKS - 1);

        unsafe { GlobalAlloc::dealloc(&pool, p, layout) };
        assert_eq!(pool.stats().free_blocks[5], DEFAULT_REFILL_BLOCKS);
    }

    #[test]
    fn realloc_copies_and_releases() {
        let pool = help_testpool();

        let layout = Layout::from_size_align(16, 8).unwrap();
        let p = unsafe { GlobalAlloc::alloc(&pool, layout) };
        unsafe { core::ptr::write_bytes(p, 0xab, 16) };

        let q = unsafe { GlobalAlloc::realloc(&pool, p, layout, 100) };
        assert!(!q.is_null());
        let copied = unsafe { std::slice::from_raw_parts(q, 16) };
        assert!(copied.iter().all(|&b| b == 0xab));

        // The old block went back onto its list.
        assert_eq!(pool.stats().free_blocks[1], DEFAULT_REFILL_BLOCKS);
    }

    #[test]
    fn default_pool_smoke() {
        let p = DEFAULT_POOL.alloc(40);
        assert!(!p.is_null());
        unsafe { core::ptr::write_bytes(p, 0x5a, 40) };
        DEFAULT_POOL.free(p, 40);
    }
}
