use utils::shared_memory::SlotView;

use crate::{JobId, Pgid};

/// Engine-internal slot contents, guarded by the per-slot spin lock in
/// [`SlotCell`]. The generation survives [`SlotState::clear`] so stale
/// per-CPU state can be rejected after reuse.
#[derive(Debug, Default)]
pub(crate) struct SlotState {
    pub pgid: Pgid,
    pub jobid: JobId,
    pub worker_num: i32,
    pub generation: u32,
    pub reset_flag: bool,
    pub cycles: u64,
    pub instructions: u64,
}

impl SlotState {
    /// Clears identity, counters, and the reset flag. The generation is
    /// left as-is; invalidation bumps it separately.
    pub fn clear(&mut self) {
        self.pgid = 0;
        self.jobid = 0;
        self.worker_num = 0;
        self.reset_flag = false;
        self.cycles = 0;
        self.instructions = 0;
    }

    pub fn view(&self) -> SlotView {
        SlotView {
            pgid: self.pgid,
            jobid: self.jobid,
            worker_num: self.worker_num,
            cycles: self.cycles,
            instructions: self.instructions,
        }
    }
}

/// One slot of the internal table. The spin lock serializes slot writes and
/// the snapshot publish; it is only ever held for O(1) work, so it is safe
/// to take from the non-blocking switch handler.
#[derive(Default)]
pub(crate) struct SlotCell {
    pub state: spin::Mutex<SlotState>,
}

/// Index allocator: a free list of returned indices, else a monotonically
/// advancing tail.
pub(crate) struct SlotAllocator {
    free: Vec<usize>,
    tail: usize,
    capacity: usize,
}

impl SlotAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Vec::with_capacity(capacity),
            tail: 0,
            capacity,
        }
    }

    pub fn alloc(&mut self) -> Option<usize> {
        if let Some(idx) = self.free.pop() {
            return Some(idx);
        }
        if self.tail < self.capacity {
            let idx = self.tail;
            self.tail += 1;
            return Some(idx);
        }
        None
    }

    pub fn release(&mut self, idx: usize) {
        debug_assert!(idx < self.capacity);
        self.free.push(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_advances_tail_then_reuses_freed() {
        let mut alloc = SlotAllocator::new(3);
        assert_eq!(alloc.alloc(), Some(0));
        assert_eq!(alloc.alloc(), Some(1));

        alloc.release(0);
        assert_eq!(alloc.alloc(), Some(0));

        assert_eq!(alloc.alloc(), Some(2));
        assert_eq!(alloc.alloc(), None);

        alloc.release(1);
        assert_eq!(alloc.alloc(), Some(1));
        assert_eq!(alloc.alloc(), None);
    }

    #[test]
    fn clear_keeps_generation() {
        let mut state = SlotState {
            pgid: 100,
            jobid: 7,
            worker_num: 2,
            generation: 5,
            reset_flag: true,
            cycles: 10,
            instructions: 20,
        };
        state.clear();
        assert_eq!(state.generation, 5);
        assert_eq!(state.pgid, 0);
        assert_eq!(state.cycles, 0);
        assert!(!state.reset_flag);
    }
}
