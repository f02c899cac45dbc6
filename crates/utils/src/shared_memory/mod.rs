//! Snapshot region shared between the IPC accounting engine (single writer
//! per slot) and snapshot readers such as the placement scheduler.
//!
//! The region is a fixed-layout `#[repr(C)]` block: a live-slot counter, a
//! 4096-bit active mask, and 4096 snapshot slots. Each slot is published
//! under a seqlock: the `seq` field is odd exactly while a write is in
//! progress, and readers retry until they observe the same even value on
//! both sides of the field reads.

use std::sync::atomic::fence;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

pub mod handle;

/// Capacity of the slot table.
pub const MAX_SLOTS: usize = 4096;
/// Number of 64-bit words backing the active mask.
pub const ACTIVE_MASK_WORDS: usize = MAX_SLOTS / u64::BITS as usize;

/// A consistent copy of one slot's published fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotView {
    pub pgid: i32,
    pub jobid: i32,
    pub worker_num: i32,
    pub cycles: u64,
    pub instructions: u64,
}

/// One published slot.
///
/// Writers must be externally serialized per slot (the engine holds the
/// internal slot lock across [`SnapshotSlot::publish`]). Readers are
/// wait-free against the writer and never observe a torn tuple.
#[repr(C, align(16))]
pub struct SnapshotSlot {
    seq: AtomicU32,
    pgid: AtomicI32,
    jobid: AtomicI32,
    worker_num: AtomicI32,
    cycles: AtomicU64,
    instructions: AtomicU64,
}

impl SnapshotSlot {
    /// Publishes `view`, flipping `seq` odd for the duration of the field
    /// stores. Caller must hold the slot's write lock.
    pub fn publish(&self, view: &SlotView) {
        let seq = self.seq.load(Ordering::Relaxed);

        // odd: writer in progress
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        self.cycles.store(view.cycles, Ordering::Relaxed);
        self.instructions.store(view.instructions, Ordering::Relaxed);
        self.pgid.store(view.pgid, Ordering::Relaxed);
        self.jobid.store(view.jobid, Ordering::Relaxed);
        self.worker_num.store(view.worker_num, Ordering::Relaxed);

        fence(Ordering::Release);
        // even: publish complete
        self.seq.store(seq.wrapping_add(2), Ordering::Relaxed);
    }

    /// Reads a consistent view, retrying while a publish is in progress or
    /// the sequence changed across the field reads.
    pub fn read(&self) -> SlotView {
        loop {
            let s1 = self.seq.load(Ordering::Acquire);
            if s1 & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }

            let view = SlotView {
                pgid: self.pgid.load(Ordering::Relaxed),
                jobid: self.jobid.load(Ordering::Relaxed),
                worker_num: self.worker_num.load(Ordering::Relaxed),
                cycles: self.cycles.load(Ordering::Relaxed),
                instructions: self.instructions.load(Ordering::Relaxed),
            };

            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == s1 {
                return view;
            }
            std::hint::spin_loop();
        }
    }

    /// Current sequence value. Even means no publish in progress.
    pub fn seq(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }
}

/// The full shared region: header plus slot array.
#[repr(C)]
pub struct SnapshotRegion {
    count: AtomicI32,
    active_mask: [AtomicU64; ACTIVE_MASK_WORDS],
    slots: [SnapshotSlot; MAX_SLOTS],
}

impl SnapshotRegion {
    /// Allocates a zeroed region on the heap and stamps empty identities.
    ///
    /// Useful for tests and single-process deployments; production regions
    /// live in an OS segment created through [`handle::SharedMemoryHandle`].
    pub fn boxed() -> Box<Self> {
        let layout = std::alloc::Layout::new::<Self>();
        // SAFETY: every field is an integer atomic, for which the all-zero
        // bit pattern is a valid initialized value.
        let region = unsafe {
            let ptr = std::alloc::alloc_zeroed(layout) as *mut Self;
            if ptr.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            Box::from_raw(ptr)
        };
        region.reset_identities();
        region
    }

    /// Initializes the region behind `ptr` in place (zero + empty
    /// identities).
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least [`SnapshotRegion::size_bytes`] bytes of
    /// writable memory with suitable alignment, and no other thread may
    /// access the region during initialization.
    pub unsafe fn init_at(ptr: *mut Self) {
        std::ptr::write_bytes(ptr as *mut u8, 0, Self::size_bytes());
        (*ptr).reset_identities();
    }

    /// Region size in bytes.
    pub const fn size_bytes() -> usize {
        std::mem::size_of::<Self>()
    }

    fn reset_identities(&self) {
        for slot in &self.slots {
            slot.pgid.store(-1, Ordering::Relaxed);
        }
    }

    pub fn slot(&self, idx: usize) -> &SnapshotSlot {
        &self.slots[idx]
    }

    /// Sets the active bit for `idx`.
    pub fn set_active(&self, idx: usize) {
        let bit = 1u64 << (idx % u64::BITS as usize);
        self.active_mask[idx / u64::BITS as usize].fetch_or(bit, Ordering::Release);
    }

    /// Clears the active bit for `idx`.
    pub fn clear_active(&self, idx: usize) {
        let bit = 1u64 << (idx % u64::BITS as usize);
        self.active_mask[idx / u64::BITS as usize].fetch_and(!bit, Ordering::Release);
    }

    pub fn is_active(&self, idx: usize) -> bool {
        let bit = 1u64 << (idx % u64::BITS as usize);
        self.active_mask[idx / u64::BITS as usize].load(Ordering::Acquire) & bit != 0
    }

    /// Visits every active slot index, scanning word by word over set bits.
    pub fn for_each_active(&self, mut f: impl FnMut(usize)) {
        for (word_idx, word) in self.active_mask.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                f(word_idx * u64::BITS as usize + bit);
            }
        }
    }

    pub fn inc_count(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_count(&self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of currently enrolled slots.
    pub fn live_count(&self) -> i32 {
        self.count.load(Ordering::Acquire)
    }
}

/// Backing storage for a [`SnapshotRegion`].
///
/// The engine does not care whether the region lives in an OS shared-memory
/// segment or on the heap; tests use [`RegionBacking::Private`].
pub enum RegionBacking {
    Shared(handle::SharedMemoryHandle),
    Private(Box<SnapshotRegion>),
}

impl RegionBacking {
    pub fn region(&self) -> &SnapshotRegion {
        match self {
            RegionBacking::Shared(handle) => handle.get_state(),
            RegionBacking::Private(region) => region,
        }
    }
}
