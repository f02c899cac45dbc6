//! PMU counter access.
//!
//! The engine consumes cycle/instruction counters through the
//! [`CounterSource`] trait, one source per logical CPU, created at engine
//! init and enabled for the engine's lifetime. Counter configuration
//! beyond the per-CPU hardware pair lives with external collaborators.

use std::io;

use thiserror::Error;

/// One reading of a CPU's cycle and instruction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSample {
    pub cycles: u64,
    pub instructions: u64,
}

#[derive(Debug, Error)]
pub enum PmuError {
    #[error("perf_event_open failed on cpu {cpu}: {source}")]
    Open { cpu: usize, source: io::Error },
    #[error("counter read failed: {0}")]
    Read(#[from] io::Error),
}

/// A per-CPU counter pair. Reads must be cheap and non-blocking; the
/// switch handler calls them with a spin lock held.
pub trait CounterSource: Send + Sync {
    fn read(&self) -> Result<CounterSample, PmuError>;
}

#[cfg(target_os = "linux")]
pub use perf::PerfCounters;

#[cfg(target_os = "linux")]
mod perf {
    use super::*;

    const PERF_TYPE_HARDWARE: u32 = 0;
    const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
    const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;

    /// Minimal `perf_event_attr` (see `linux/perf_event.h`). The kernel
    /// accepts a struct shorter than its own definition as long as `size`
    /// matches what's actually passed; unset trailing fields are treated
    /// as zero. Only the fields this module uses are declared here.
    #[repr(C)]
    #[derive(Default)]
    struct perf_event_attr {
        type_: u32,
        size: u32,
        config: u64,
    }

    /// Hardware cycle/instruction counters pinned to one logical CPU,
    /// counting every task that runs there.
    pub struct PerfCounters {
        cycles_fd: libc::c_int,
        instructions_fd: libc::c_int,
    }

    impl PerfCounters {
        pub fn open(cpu: usize) -> Result<Self, PmuError> {
            let cycles_fd = open_counter(cpu, PERF_COUNT_HW_CPU_CYCLES)?;
            let instructions_fd = match open_counter(cpu, PERF_COUNT_HW_INSTRUCTIONS) {
                Ok(fd) => fd,
                Err(e) => {
                    unsafe { libc::close(cycles_fd) };
                    return Err(e);
                }
            };
            Ok(Self {
                cycles_fd,
                instructions_fd,
            })
        }
    }

    fn open_counter(cpu: usize, config: u64) -> Result<libc::c_int, PmuError> {
        let mut attr = perf_event_attr::default();
        attr.type_ = PERF_TYPE_HARDWARE;
        attr.size = std::mem::size_of::<perf_event_attr>() as u32;
        attr.config = config;

        // pid = -1, cpu = target: count all tasks on that CPU. The counter
        // starts enabled (attr.disabled is zero).
        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &attr as *const perf_event_attr,
                -1 as libc::pid_t,
                cpu as libc::c_int,
                -1 as libc::c_int,
                0 as libc::c_ulong,
            )
        };
        if fd < 0 {
            return Err(PmuError::Open {
                cpu,
                source: io::Error::last_os_error(),
            });
        }
        Ok(fd as libc::c_int)
    }

    fn read_counter(fd: libc::c_int) -> Result<u64, PmuError> {
        let mut value: u64 = 0;
        let n = unsafe {
            libc::read(
                fd,
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            return Err(PmuError::Read(io::Error::last_os_error()));
        }
        Ok(value)
    }

    impl CounterSource for PerfCounters {
        fn read(&self) -> Result<CounterSample, PmuError> {
            Ok(CounterSample {
                cycles: read_counter(self.cycles_fd)?,
                instructions: read_counter(self.instructions_fd)?,
            })
        }
    }

    impl Drop for PerfCounters {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.cycles_fd);
                libc::close(self.instructions_fd);
            }
        }
    }
}
