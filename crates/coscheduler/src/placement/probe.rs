//! Live STP probing over the snapshot region.

use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use ipc_monitor::IpcMonitor;
use tracing::debug;
use utils::shared_memory::SnapshotRegion;

use crate::score::ScoreBook;

/// Measures the system throughput of whatever configuration is currently
/// applied. Injectable so placement tests can script probe outcomes.
pub trait StpSampler: Send + Sync {
    fn sample(&self) -> f64;
}

/// Production sampler: reset the counters, wait out the probe window, then
/// fold the fresh snapshots into an STP figure.
pub struct RegionSampler {
    engine: Arc<IpcMonitor>,
    book: Arc<RwLock<ScoreBook>>,
    probe_interval: Duration,
}

impl RegionSampler {
    pub fn new(
        engine: Arc<IpcMonitor>,
        book: Arc<RwLock<ScoreBook>>,
        probe_interval: Duration,
    ) -> Self {
        Self {
            engine,
            book,
            probe_interval,
        }
    }
}

impl StpSampler for RegionSampler {
    fn sample(&self) -> f64 {
        self.engine.reset_all();
        std::thread::sleep(self.probe_interval);

        let book = self.book.read().expect("poisoned");
        stp_over_region(self.engine.region(), &book)
    }
}

/// Sum of `live_ipc / baseline_ipc` over active slots. Slots with no
/// cycles yet, cleared identities, or an unknown/zero baseline contribute
/// nothing — a PGID dying mid-probe just drops out of the total.
pub(crate) fn stp_over_region(region: &SnapshotRegion, book: &ScoreBook) -> f64 {
    let mut stp = 0.0;
    region.for_each_active(|idx| {
        let view = region.slot(idx).read();
        if view.jobid < 0 || view.pgid <= 0 {
            return;
        }
        if view.cycles == 0 {
            debug!(
                pgid = view.pgid,
                jobid = view.jobid,
                slot = idx,
                "skipping slot with zero cycles"
            );
            return;
        }
        let Some(baseline) = book.baseline_ipc(view.jobid) else {
            return;
        };
        if baseline == 0.0 {
            return;
        }

        let ipc = view.instructions as f64 / view.cycles as f64;
        stp += ipc / baseline;
    });
    stp
}

#[cfg(test)]
mod tests {
    use utils::shared_memory::SlotView;
    use utils::shared_memory::SnapshotRegion;

    use super::*;

    fn publish(region: &SnapshotRegion, idx: usize, view: SlotView) {
        region.slot(idx).publish(&view);
        region.set_active(idx);
    }

    #[test]
    fn stp_normalizes_by_baseline() {
        let region = SnapshotRegion::boxed();
        let mut book = ScoreBook::new();
        book.update_baseline(7, 0.5);
        book.update_baseline(8, 1.0);

        publish(
            &region,
            0,
            SlotView {
                pgid: 100,
                jobid: 7,
                worker_num: 2,
                cycles: 1_000,
                instructions: 500, // ipc 0.5 → contribution 1.0
            },
        );
        publish(
            &region,
            1,
            SlotView {
                pgid: 101,
                jobid: 8,
                worker_num: 1,
                cycles: 1_000,
                instructions: 500, // ipc 0.5 → contribution 0.5
            },
        );

        let stp = stp_over_region(&region, &book);
        assert!((stp - 1.5).abs() < 1e-9);
    }

    #[test]
    fn zero_cycles_unknown_baseline_and_cleared_slots_are_skipped() {
        let region = SnapshotRegion::boxed();
        let mut book = ScoreBook::new();
        book.update_baseline(7, 0.5);
        book.update_baseline(9, 0.0);

        // zero cycles
        publish(
            &region,
            0,
            SlotView {
                pgid: 100,
                jobid: 7,
                worker_num: 1,
                cycles: 0,
                instructions: 0,
            },
        );
        // no baseline for job 8
        publish(
            &region,
            1,
            SlotView {
                pgid: 101,
                jobid: 8,
                worker_num: 1,
                cycles: 100,
                instructions: 100,
            },
        );
        // zero baseline
        publish(
            &region,
            2,
            SlotView {
                pgid: 102,
                jobid: 9,
                worker_num: 1,
                cycles: 100,
                instructions: 100,
            },
        );
        // cleared identity racing a remove
        publish(
            &region,
            3,
            SlotView {
                pgid: 0,
                jobid: 0,
                worker_num: 0,
                cycles: 100,
                instructions: 100,
            },
        );

        assert_eq!(stp_over_region(&region, &book), 0.0);
    }
}
