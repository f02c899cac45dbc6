//! SMT-aware co-scheduling controller.
//!
//! Three components form a feedback loop around the accounting engine from
//! the `ipc-monitor` crate:
//!
//! - the [`lifecycle`] controller tracks process groups from birth, detects
//!   the long-running threshold, and enrolls them into the engine only
//!   after an external profiling acknowledgement;
//! - the engine attributes cycle/instruction deltas per process group on
//!   every context switch and publishes them into the shared snapshot
//!   region;
//! - the [`placement`] scheduler reads the snapshots, pairs jobs by
//!   compatibility score, probes candidate CPU assignments by measuring
//!   live system throughput, and commits the best one.

pub mod agent;
pub mod api;
pub mod config;
pub mod lifecycle;
pub mod placement;
pub mod procs;
pub mod score;
pub mod switch_feed;
pub mod topology;

pub use ipc_monitor::JobId;
pub use ipc_monitor::Pgid;
