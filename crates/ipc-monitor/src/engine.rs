//! The accounting engine: slot table, enrollment, and the context-switch
//! handler.

use std::sync::Mutex;

use tracing::info;
use utils::shared_memory::RegionBacking;
use utils::shared_memory::SnapshotRegion;
use utils::shared_memory::MAX_SLOTS;

use crate::percpu::ArmedSlot;
use crate::percpu::PerCpu;
use crate::pgid_map::MapEntry;
use crate::pgid_map::PgidMap;
use crate::pmu::CounterSource;
use crate::slot::SlotAllocator;
use crate::slot::SlotCell;
use crate::EngineError;
use crate::JobId;
use crate::Pgid;

/// Why the host scheduler switched tasks. Carried through for tracing;
/// accounting does not depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    Preemption,
    Voluntary,
}

/// Wraparound-safe delta for a monotonic unsigned counter.
fn wrapping_delta(cur: u64, prev: u64) -> u64 {
    cur.wrapping_sub(prev)
}

pub struct IpcMonitor {
    backing: RegionBacking,
    slots: Box<[SlotCell]>,
    allocator: Mutex<SlotAllocator>,
    map: PgidMap,
    cpus: PerCpu,
    counters: Box<[Box<dyn CounterSource>]>,
}

impl IpcMonitor {
    /// Builds an engine over `backing` with one counter source per logical
    /// CPU. The counter vector length defines the CPU count the handler
    /// accepts.
    pub fn new(backing: RegionBacking, counters: Vec<Box<dyn CounterSource>>) -> Self {
        let cpu_count = counters.len();
        Self {
            backing,
            slots: (0..MAX_SLOTS).map(|_| SlotCell::default()).collect(),
            allocator: Mutex::new(SlotAllocator::new(MAX_SLOTS)),
            map: PgidMap::new(),
            cpus: PerCpu::new(cpu_count),
            counters: counters.into_boxed_slice(),
        }
    }

    /// The snapshot region this engine publishes into.
    pub fn region(&self) -> &SnapshotRegion {
        self.backing.region()
    }

    /// Enrolls a process group and returns its slot index.
    ///
    /// The slot is initialized and its first (empty) snapshot published
    /// before the map entry becomes visible; a duplicate discovered during
    /// map publication rolls the slot back with a second generation bump so
    /// no per-CPU state captured in between can ever be applied.
    pub fn add(&self, pgid: Pgid, jobid: JobId, worker_num: i32) -> Result<usize, EngineError> {
        let slot_idx = self
            .allocator
            .lock()
            .expect("poisoned")
            .alloc()
            .ok_or(EngineError::NoCapacity)?;

        let region = self.backing.region();
        let generation;
        {
            let mut slot = self.slots[slot_idx].state.lock();
            slot.generation = slot.generation.wrapping_add(1);
            generation = slot.generation;

            slot.pgid = pgid;
            slot.jobid = jobid;
            slot.worker_num = worker_num;
            slot.reset_flag = false;
            slot.cycles = 0;
            slot.instructions = 0;

            region.slot(slot_idx).publish(&slot.view());
        }

        let inserted = self.map.mutate(|map| {
            if map.contains_key(&pgid) {
                false
            } else {
                map.insert(
                    pgid,
                    MapEntry {
                        slot_idx,
                        generation,
                    },
                );
                true
            }
        });

        if !inserted {
            // Roll back: invalidate the generation and hand the index back.
            {
                let mut slot = self.slots[slot_idx].state.lock();
                slot.generation = slot.generation.wrapping_add(1);
                slot.clear();
                region.slot(slot_idx).publish(&slot.view());
            }
            self.allocator.lock().expect("poisoned").release(slot_idx);
            return Err(EngineError::Duplicate(pgid));
        }

        region.set_active(slot_idx);
        region.inc_count();

        info!(pgid, jobid, worker_num, slot = slot_idx, generation, "enrolled process group");
        Ok(slot_idx)
    }

    /// Removes a process group.
    ///
    /// The active-mask bit is cleared before the map entry disappears so
    /// scanners never observe a post-remove slot as still active; the slot
    /// itself is invalidated and cleared under its lock afterwards.
    pub fn remove(&self, pgid: Pgid) -> Result<(), EngineError> {
        let region = self.backing.region();

        let entry = self
            .map
            .mutate(|map| match map.get(&pgid).copied() {
                Some(entry) => {
                    region.clear_active(entry.slot_idx);
                    map.remove(&pgid);
                    Some(entry)
                }
                None => None,
            })
            .ok_or(EngineError::NotFound(pgid))?;

        {
            let mut slot = self.slots[entry.slot_idx].state.lock();
            slot.generation = slot.generation.wrapping_add(1);
            slot.clear();
            region.slot(entry.slot_idx).publish(&slot.view());
        }

        self.allocator
            .lock()
            .expect("poisoned")
            .release(entry.slot_idx);
        region.dec_count();

        info!(pgid, slot = entry.slot_idx, "removed process group");
        Ok(())
    }

    /// Marks every active slot for a one-shot reset. The flag is consumed
    /// at the next switch-out update, which then replaces the totals with
    /// the fresh delta instead of accumulating.
    pub fn reset_all(&self) {
        let region = self.backing.region();
        region.for_each_active(|idx| {
            let mut slot = self.slots[idx].state.lock();
            if slot.pgid != 0 {
                slot.reset_flag = true;
            }
        });
    }

    /// Context-switch hook.
    ///
    /// `next_pgid` is the incoming task's process group, `None` when the
    /// caller already knows the task is of no interest. Must not block:
    /// every lock taken here is a spin lock held for O(1) work.
    pub fn on_context_switch(&self, cpu: usize, next_pgid: Option<Pgid>, _reason: SwitchReason) {
        if cpu >= self.cpus.len() {
            return;
        }

        let mut armed = self.cpus.lock(cpu);
        let next = next_pgid.and_then(|pgid| self.map.lookup(pgid));

        // Neither the outgoing nor the incoming side is monitored: skip the
        // PMU read entirely.
        if armed.is_none() && next.is_none() {
            return;
        }

        let sample = match self.counters[cpu].read() {
            Ok(sample) => sample,
            Err(_) => {
                // Read failed: be conservative and disarm unless the
                // incoming task is monitored (its switch-out will
                // revalidate via the generation anyway).
                if next.is_none() {
                    *armed = None;
                }
                return;
            }
        };

        if let Some(prev) = armed.take() {
            let delta_cycles = wrapping_delta(sample.cycles, prev.start_cycles);
            let delta_instructions = wrapping_delta(sample.instructions, prev.start_instructions);

            let mut slot = self.slots[prev.slot_idx].state.lock();
            if slot.generation == prev.generation {
                if slot.reset_flag {
                    slot.cycles = delta_cycles;
                    slot.instructions = delta_instructions;
                    slot.reset_flag = false;
                } else {
                    slot.cycles = slot.cycles.wrapping_add(delta_cycles);
                    slot.instructions = slot.instructions.wrapping_add(delta_instructions);
                }
                self.backing.region().slot(prev.slot_idx).publish(&slot.view());
            }
            // Generation mismatch: the slot was reused, drop the update.
        }

        *armed = next.map(|entry| ArmedSlot {
            slot_idx: entry.slot_idx,
            generation: entry.generation,
            start_cycles: sample.cycles,
            start_instructions: sample.instructions,
        });
    }
}
