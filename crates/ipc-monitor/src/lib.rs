//! Per-process-group IPC accounting engine.
//!
//! The engine attributes cycle and instruction deltas to the outgoing
//! process group on every context switch and publishes running totals into
//! a shared snapshot region (see `utils::shared_memory`) that consumers
//! read wait-free through a seqlock.
//!
//! The context-switch handler is the hot path: it never blocks, never
//! allocates, and drops updates whose captured slot generation no longer
//! matches the slot's current incarnation.

pub mod engine;
pub mod pgid_map;
pub mod pmu;

mod percpu;
mod slot;

pub use engine::IpcMonitor;
pub use engine::SwitchReason;

/// Process group id, as assigned by the kernel.
pub type Pgid = i32;
/// Global job id, as assigned by the offline pipeline.
pub type JobId = i32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("slot table is full")]
    NoCapacity,
    #[error("auxiliary allocation failed")]
    AllocFailure,
    #[error("process group {0} is already enrolled")]
    Duplicate(Pgid),
    #[error("process group {0} is not enrolled")]
    NotFound(Pgid),
}
