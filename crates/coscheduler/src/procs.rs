//! Process-tree inspection and affinity application.

use std::fs;
use std::path::PathBuf;

use nix::sched::sched_setaffinity;
use nix::sched::CpuSet;
use nix::unistd::Pid;
use tracing::debug;

use crate::placement::CpuMask;
use crate::Pgid;

/// Platform seam for walking a process group's threads and children.
/// Non-Linux targets (and tests) supply their own implementation.
pub trait ProcessTopology: Send + Sync {
    fn threads_of(&self, pid: i32) -> Vec<i32>;
    fn children_of(&self, pid: i32) -> Vec<i32>;
}

/// `/proc`-backed implementation.
pub struct ProcFs;

impl ProcessTopology for ProcFs {
    fn threads_of(&self, pid: i32) -> Vec<i32> {
        let task_dir = PathBuf::from(format!("/proc/{pid}/task"));
        let Ok(entries) = fs::read_dir(&task_dir) else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().to_str().and_then(|s| s.parse().ok()))
            .collect()
    }

    fn children_of(&self, pid: i32) -> Vec<i32> {
        let path = format!("/proc/{pid}/task/{pid}/children");
        let Ok(content) = fs::read_to_string(&path) else {
            return Vec::new();
        };
        content
            .split_whitespace()
            .filter_map(|s| s.parse().ok())
            .collect()
    }
}

/// Applies an affinity mask to every thread of a process group and,
/// recursively, of all its descendants.
pub trait AffinityControl: Send + Sync {
    fn apply(&self, pgid: Pgid, mask: &CpuMask);
}

pub struct ThreadAffinity<T> {
    topology: T,
}

impl<T: ProcessTopology> ThreadAffinity<T> {
    pub fn new(topology: T) -> Self {
        Self { topology }
    }
}

impl<T: ProcessTopology> AffinityControl for ThreadAffinity<T> {
    fn apply(&self, pgid: Pgid, mask: &CpuMask) {
        let cpu_set = to_cpu_set(mask);
        for_each_thread(&self.topology, pgid, &mut |tid| {
            // Threads race exits; a failed call just means the thread is
            // gone.
            if let Err(err) = sched_setaffinity(Pid::from_raw(tid), &cpu_set) {
                debug!(tid, %err, "sched_setaffinity failed, skipping thread");
            }
        });
    }
}

/// Depth-first walk over the threads of `pid` and of every descendant.
fn for_each_thread<T: ProcessTopology>(topology: &T, pid: i32, f: &mut impl FnMut(i32)) {
    for tid in topology.threads_of(pid) {
        f(tid);
    }
    for child in topology.children_of(pid) {
        for_each_thread(topology, child, f);
    }
}

fn to_cpu_set(mask: &CpuMask) -> CpuSet {
    let mut cpu_set = CpuSet::new();
    for cpu in mask.iter() {
        if let Err(err) = cpu_set.set(cpu as usize) {
            debug!(cpu, %err, "cpu id exceeds CpuSet capacity, skipping");
        }
    }
    cpu_set
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct FakeTree {
        threads: HashMap<i32, Vec<i32>>,
        children: HashMap<i32, Vec<i32>>,
    }

    impl ProcessTopology for FakeTree {
        fn threads_of(&self, pid: i32) -> Vec<i32> {
            self.threads.get(&pid).cloned().unwrap_or_default()
        }
        fn children_of(&self, pid: i32) -> Vec<i32> {
            self.children.get(&pid).cloned().unwrap_or_default()
        }
    }

    #[test]
    fn walk_covers_descendants_recursively() {
        let tree = FakeTree {
            threads: HashMap::from([
                (100, vec![100, 101]),
                (200, vec![200]),
                (300, vec![300, 301]),
            ]),
            children: HashMap::from([(100, vec![200]), (200, vec![300])]),
        };

        let mut seen = Vec::new();
        for_each_thread(&tree, 100, &mut |tid| seen.push(tid));
        assert_eq!(seen, vec![100, 101, 200, 300, 301]);
    }

    #[test]
    fn walk_of_unknown_pid_is_empty() {
        let tree = FakeTree {
            threads: HashMap::new(),
            children: HashMap::new(),
        };
        let mut seen = Vec::new();
        for_each_thread(&tree, 42, &mut |tid| seen.push(tid));
        assert!(seen.is_empty());
    }

    #[test]
    fn procfs_sees_own_process() {
        let pid = std::process::id() as i32;
        let threads = ProcFs.threads_of(pid);
        assert!(threads.contains(&pid));
    }

    #[test]
    fn cpu_set_conversion_sets_requested_cpus() {
        let mut mask = CpuMask::default();
        mask.set(0);
        mask.set(2);
        let cpu_set = to_cpu_set(&mask);
        assert!(cpu_set.is_set(0).unwrap());
        assert!(!cpu_set.is_set(1).unwrap());
        assert!(cpu_set.is_set(2).unwrap());
    }
}
