//! Contiguous physical frame allocator (C1).
//!
//! A pool manages a half-open frame range with two parallel bitmaps: the
//! allocation bitmap (1 = free) and the head bitmap (0 = head-of-run). The
//! two together give three per-frame states without packing them into a
//! single two-bit field, which is what makes release able to discover a
//! run's end by scanning forward rather than needing to know its length.
//!
//! Grounded on the bit-scanning idiom of `hadron-mm`'s `BitmapAllocator`
//! (`examples/asterism-labs-hadron/kernel/mm/src/pmm.rs`), generalized here
//! to a *pair* of bitmaps and to contiguous-run search/release rather than
//! single-frame alloc/free.

use crate::types::{FrameNo, PAGE_SIZE};

#[cfg(not(test))]
use core::slice;

/// Owned byte storage for a pool's bitmaps.
///
/// On real hardware the bitmaps live inside frames of the pool (or of
/// another pool, for a process pool whose info frames are borrowed from the
/// kernel pool) and are reached through their identity-mapped physical
/// address. Under test there is no physical memory to borrow, so the
/// storage is a plain boxed byte array — this is the seam
/// `SPEC_FULL.md` calls for so the allocator logic runs under `cargo test`
/// on the host.
pub enum Bitmap {
    #[cfg(not(test))]
    Raw { ptr: *mut u8, len: usize },
    #[cfg(test)]
    Owned(Box<[u8]>),
}

impl Bitmap {
    /// Wrap a byte range starting at a physical address (identity-mapped,
    /// so physical == virtual for the frame-pool bookkeeping area).
    #[cfg(not(test))]
    pub unsafe fn from_raw(addr: u32, len: usize) -> Self {
        Bitmap::Raw {
            ptr: addr as *mut u8,
            len,
        }
    }

    #[cfg(test)]
    pub fn new_owned(len: usize) -> Self {
        Bitmap::Owned(vec![0u8; len].into_boxed_slice())
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            #[cfg(not(test))]
            Bitmap::Raw { ptr, len } => unsafe { slice::from_raw_parts(*ptr, *len) },
            #[cfg(test)]
            Bitmap::Owned(b) => b,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            #[cfg(not(test))]
            Bitmap::Raw { ptr, len } => unsafe { slice::from_raw_parts_mut(*ptr, *len) },
            #[cfg(test)]
            Bitmap::Owned(b) => b,
        }
    }

    fn fill(&mut self, byte: u8) {
        for b in self.as_mut_slice() {
            *b = byte;
        }
    }

    fn get(&self, bit: u32) -> bool {
        let byte = self.as_slice()[(bit / 8) as usize];
        (byte >> (bit % 8)) & 1 != 0
    }

    fn set(&mut self, bit: u32, val: bool) {
        let slot = &mut self.as_mut_slice()[(bit / 8) as usize];
        if val {
            *slot |= 1 << (bit % 8);
        } else {
            *slot &= !(1 << (bit % 8));
        }
    }
}

/// The number of bytes needed to hold `n` one-bit-per-frame flags.
pub fn bitmap_bytes(n: u32) -> usize {
    (n as usize + 7) / 8
}

/// Number of frames needed to hold both bitmaps for a pool of `n` frames.
///
/// Two bits per frame (one per bitmap), `frame_size * 8` bits per frame.
pub fn needed_info_frames(n: u32) -> u32 {
    let bits = 2 * n as u64;
    let bits_per_frame = (PAGE_SIZE as u64) * 8;
    ((bits + bits_per_frame - 1) / bits_per_frame) as u32
}

/// A contiguous physical frame pool: `[base, base+n)`.
pub struct FramePool {
    base: FrameNo,
    n: u32,
    n_free: u32,
    alloc_bitmap: Bitmap,
    head_bitmap: Bitmap,
}

impl FramePool {
    /// Construct a pool whose bitmaps are supplied by the caller (already
    /// sized to `bitmap_bytes(n)` each) and whose frames, if `mark_info_run`
    /// is true, include a pre-marked allocated run for the bitmaps
    /// themselves (the "info frames live inside the pool" case).
    ///
    /// `n` must be a multiple of 8.
    pub fn new(
        base: FrameNo,
        n: u32,
        mut alloc_bitmap: Bitmap,
        mut head_bitmap: Bitmap,
        info_frames_in_pool: u32,
    ) -> Self {
        assert_eq!(n % 8, 0, "frame pool size must be a multiple of 8");

        alloc_bitmap.fill(0xFF); // all FREE
        head_bitmap.fill(0xFF); // all "not a head"

        let mut pool = FramePool {
            base,
            n,
            n_free: n,
            alloc_bitmap,
            head_bitmap,
        };

        if info_frames_in_pool > 0 {
            pool.mark_inaccessible(base, info_frames_in_pool);
        }

        pool
    }

    pub fn base(&self) -> FrameNo {
        self.base
    }

    pub fn len(&self) -> u32 {
        self.n
    }

    pub fn n_free(&self) -> u32 {
        self.n_free
    }

    pub fn contains(&self, frame_no: FrameNo) -> bool {
        frame_no.0 >= self.base.0 && frame_no.0 < self.base.0 + self.n
    }

    fn local_index(&self, frame_no: FrameNo) -> u32 {
        frame_no.0 - self.base.0
    }

    /// State of a single frame, for tests and invariant checks.
    #[cfg(test)]
    pub fn state(&self, local_idx: u32) -> FrameState {
        let alloc = self.alloc_bitmap.get(local_idx);
        let head = self.head_bitmap.get(local_idx);
        match (alloc, head) {
            (true, true) => FrameState::Free,
            (false, false) => FrameState::Head,
            (false, true) => FrameState::Body,
            (true, false) => unreachable!("alloc=1 ^ head=0 violates the alloc=>head invariant"),
        }
    }

    /// First-fit search for a run of exactly `k` free frames.
    ///
    /// Implemented as an explicit linear scan over bit positions rather
    /// than the byte/bit nested-cursor scheme of the original allocator —
    /// scanning one bit at a time and resetting the run on the first
    /// blocked bit can never skip the bit immediately after a blocker,
    /// which is the bug the nested-cursor version was prone to.
    pub fn get_frames(&mut self, k: u32) -> Option<FrameNo> {
        assert!(self.n_free >= k, "get_frames: insufficient free frames");
        if k == 0 {
            return None;
        }

        let mut run_start: Option<u32> = None;
        let mut run_len: u32 = 0;

        for i in 0..self.n {
            if self.alloc_bitmap.get(i) {
                if run_start.is_none() {
                    run_start = Some(i);
                }
                run_len += 1;
                if run_len == k {
                    let start = run_start.unwrap();
                    self.claim_run(start, k);
                    return Some(FrameNo(self.base.0 + start));
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }

        None
    }

    fn claim_run(&mut self, start: u32, k: u32) {
        for i in start..start + k {
            self.alloc_bitmap.set(i, false);
        }
        self.head_bitmap.set(start, false);
        self.n_free -= k;
    }

    /// Force `[base, base+k)` into the allocated-run state. Precondition:
    /// the whole range is currently FREE.
    pub fn mark_inaccessible(&mut self, base: FrameNo, k: u32) {
        assert!(self.contains(base), "mark_inaccessible: base outside pool");
        let start = self.local_index(base);
        for i in start..start + k {
            assert!(
                self.alloc_bitmap.get(i) && self.head_bitmap.get(i),
                "mark_inaccessible: range is not entirely FREE"
            );
        }
        self.claim_run(start, k);
    }

    /// Release the run whose head is `frame_no`. Aborts if `frame_no` is
    /// not this pool's frame or is not a HEAD frame.
    pub fn release(&mut self, frame_no: FrameNo) {
        assert!(self.contains(frame_no), "release: frame not in this pool");
        let start = self.local_index(frame_no);
        assert!(
            !self.alloc_bitmap.get(start) && !self.head_bitmap.get(start),
            "release: frame is not a HEAD"
        );

        self.head_bitmap.set(start, true);
        self.alloc_bitmap.set(start, true);
        self.n_free += 1;

        let mut i = start + 1;
        while i < self.n {
            let alloc = self.alloc_bitmap.get(i);
            let head = self.head_bitmap.get(i);
            if alloc || !head {
                // FREE (alloc=1,head=1) or another HEAD (alloc=0,head=0): stop.
                break;
            }
            // BODY (alloc=0, head=1): free it and continue.
            self.alloc_bitmap.set(i, true);
            self.n_free += 1;
            i += 1;
        }
    }
}

#[cfg(test)]
#[derive(Debug, PartialEq, Eq)]
pub enum FrameState {
    Free,
    Head,
    Body,
}

/// Locates the pool owning a frame number and releases it there.
///
/// A fixed-capacity registry rather than an intrusive static list (per the
/// "re-architect as an explicit registry" design note): this kernel only
/// ever has a handful of pools (kernel pool, process pool(s)), so a small
/// array avoids pulling in `alloc` for something this bounded.
pub struct FramePoolRegistry<const N: usize> {
    pools: [Option<FramePool>; N],
    len: usize,
}

impl<const N: usize> FramePoolRegistry<N> {
    pub fn new() -> Self {
        FramePoolRegistry {
            pools: core::array::from_fn(|_| None),
            len: 0,
        }
    }

    /// Register a pool, keeping the registry sorted by base frame number.
    pub fn register(&mut self, pool: FramePool) {
        assert!(self.len < N, "frame pool registry is full");
        let mut idx = self.len;
        while idx > 0 && self.pools[idx - 1].as_ref().unwrap().base().0 > pool.base().0 {
            self.pools.swap(idx - 1, idx);
            idx -= 1;
        }
        self.pools[idx] = Some(pool);
        self.len += 1;
    }

    pub fn pool_mut(&mut self, frame_no: FrameNo) -> Option<&mut FramePool> {
        self.pools[..self.len]
            .iter_mut()
            .flatten()
            .find(|p| p.contains(frame_no))
    }

    /// Static-style release: find the owning pool, then release there.
    pub fn release_frames(&mut self, frame_no: FrameNo) {
        let pool = self
            .pool_mut(frame_no)
            .expect("release_frames: no pool owns this frame");
        pool.release(frame_no);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(base: u32, n: u32) -> FramePool {
        let alloc_bm = Bitmap::new_owned(bitmap_bytes(n));
        let head_bm = Bitmap::new_owned(bitmap_bytes(n));
        FramePool::new(FrameNo(base), n, alloc_bm, head_bm, 0)
    }

    #[test]
    fn needed_info_frames_matches_spec_example() {
        // ceil(2*7168 / (4096*8)) = 1
        assert_eq!(needed_info_frames(7168), 1);
    }

    #[test]
    fn fresh_pool_is_all_free() {
        let pool = test_pool(512, 512);
        assert_eq!(pool.n_free(), 512);
        for i in 0..512 {
            assert_eq!(pool.state(i), FrameState::Free);
        }
    }

    #[test]
    fn scenario_1_from_spec() {
        // Kernel pool [512, 1024); sequence of gets and releases drawn
        // straight from the property-based end-to-end scenario.
        let mut pool = test_pool(512, 512);

        assert_eq!(pool.get_frames(2), Some(FrameNo(513)));
        assert_eq!(pool.get_frames(3), Some(FrameNo(515)));
        assert_eq!(pool.get_frames(7), Some(FrameNo(518)));
        assert_eq!(pool.get_frames(9), Some(FrameNo(525)));

        let before = pool.n_free();
        pool.release(FrameNo(518));
        assert_eq!(pool.n_free(), before + 7);

        assert_eq!(pool.get_frames(15), Some(FrameNo(534)));

        let before = pool.n_free();
        pool.release(FrameNo(525));
        assert_eq!(pool.n_free(), before + 9);

        assert_eq!(pool.get_frames(15), Some(FrameNo(518)));
    }

    #[test]
    fn scenario_2_from_spec() {
        // Process pool [1024, 8192), 7168 frames, info frame borrowed
        // from elsewhere (info_frames_in_pool = 0 here since the bitmap
        // itself lives outside this pool in the real system).
        let mut pool = test_pool(1024, 7168);

        pool.mark_inaccessible(FrameNo(3840), 256);
        assert_eq!(pool.n_free(), 7168 - 256);

        let before = pool.n_free();
        pool.release(FrameNo(3840));
        assert_eq!(pool.n_free(), before + 256);
    }

    #[test]
    fn get_frames_returns_none_when_fragmented_but_enough_free() {
        let mut pool = test_pool(0, 16);
        let a = pool.get_frames(4).unwrap(); // 0..4
        let _b = pool.get_frames(4).unwrap(); // 4..8
        let c = pool.get_frames(4).unwrap(); // 8..12
        let _d = pool.get_frames(4).unwrap(); // 12..16
        pool.release(a);
        pool.release(c);
        // 8 frames free (0..4 and 8..12) but no contiguous run of 8.
        assert_eq!(pool.n_free(), 8);
        assert_eq!(pool.get_frames(8), None);
        assert_eq!(pool.get_frames(4), Some(FrameNo(0)));
    }

    #[test]
    #[should_panic(expected = "insufficient free frames")]
    fn get_frames_with_too_few_free_frames_aborts() {
        let mut pool = test_pool(0, 8);
        pool.get_frames(8).unwrap();
        pool.get_frames(1);
    }

    #[test]
    fn run_integrity_head_then_body_then_boundary() {
        let mut pool = test_pool(0, 32);
        let start = pool.get_frames(5).unwrap();
        assert_eq!(pool.state(start.0), FrameState::Head);
        for i in 1..5 {
            assert_eq!(pool.state(start.0 + i), FrameState::Body);
        }
        assert_eq!(pool.state(start.0 + 5), FrameState::Free);
    }

    #[test]
    #[should_panic(expected = "not a HEAD")]
    fn release_of_body_frame_aborts() {
        let mut pool = test_pool(0, 16);
        let start = pool.get_frames(4).unwrap();
        pool.release(FrameNo(start.0 + 1));
    }

    #[test]
    #[should_panic(expected = "is not entirely FREE")]
    fn mark_inaccessible_over_allocated_range_aborts() {
        let mut pool = test_pool(0, 16);
        pool.get_frames(4);
        pool.mark_inaccessible(FrameNo(0), 4);
    }

    #[test]
    fn recursive_depth_32_no_overlap() {
        // Scenario 3: allocate k = depth%4+1 frames at each of 32 nested
        // levels, stamp the run with the depth, recurse, verify on unwind.
        fn recurse(pool: &mut FramePool, depth: u32) {
            if depth == 32 {
                return;
            }
            let k = depth % 4 + 1;
            let run = pool.get_frames(k).expect("pool exhausted");
            recurse(pool, depth + 1);
            // after returning from all deeper levels, this run must be
            // untouched by any allocation made at a deeper level.
            assert_eq!(pool.state(run.0), FrameState::Head);
            pool.release(run);
        }
        let mut pool = test_pool(0, 4096);
        recurse(&mut pool, 0);
        assert_eq!(pool.n_free(), 4096);
    }

    #[test]
    fn conservation_after_matched_get_release_sequences() {
        let mut pool = test_pool(0, 64);
        let initial_free = pool.n_free();
        let a = pool.get_frames(3).unwrap();
        let b = pool.get_frames(5).unwrap();
        let c = pool.get_frames(2).unwrap();
        pool.release(b);
        pool.release(a);
        pool.release(c);
        assert_eq!(pool.n_free(), initial_free);
        for i in 0..64 {
            assert_eq!(pool.state(i), FrameState::Free);
        }
    }

    #[test]
    fn random_get_release_sequences_conserve_free_frames() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0xF00D_F00D);
        let mut pool = test_pool(0, 256);
        let initial_free = pool.n_free();
        let mut live: Vec<(FrameNo, u32)> = Vec::new();

        for _ in 0..500 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let k = rng.gen_range(1..=8);
                if let Some(f) = pool.get_frames(k) {
                    live.push((f, k));
                }
            } else {
                let idx = rng.gen_range(0..live.len());
                let (f, _) = live.swap_remove(idx);
                pool.release(f);
            }
        }
        for (f, _) in live {
            pool.release(f);
        }
        assert_eq!(pool.n_free(), initial_free);
        for i in 0..256 {
            assert_eq!(pool.state(i), FrameState::Free);
        }
    }

    #[test]
    fn registry_locates_owning_pool_and_releases_through_it() {
        let mut registry: FramePoolRegistry<2> = FramePoolRegistry::new();
        registry.register(test_pool(0, 64));
        registry.register(test_pool(64, 64));

        let f = registry.pool_mut(FrameNo(70)).unwrap().get_frames(2).unwrap();
        assert_eq!(f, FrameNo(70));
        registry.release_frames(f);
        assert_eq!(registry.pool_mut(FrameNo(70)).unwrap().n_free(), 64);
    }
}
