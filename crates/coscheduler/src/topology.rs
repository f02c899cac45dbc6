//! CPU topology: which two logical CPUs share each physical core.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

const SYSFS_CPU_DIR: &str = "/sys/devices/system/cpu";

/// Sibling map for an SMT-2 machine: physical core index to its pair of
/// logical CPUs.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    siblings: Vec<(u32, u32)>,
}

impl CpuTopology {
    /// Builds a topology from explicit sibling pairs. Logical ids must be
    /// unique and contiguous from zero (the engine indexes per-CPU state
    /// by logical id).
    pub fn from_pairs(mut pairs: Vec<(u32, u32)>) -> Result<Self> {
        if pairs.is_empty() {
            bail!("sibling map is empty");
        }
        for pair in &mut pairs {
            if pair.0 > pair.1 {
                *pair = (pair.1, pair.0);
            }
        }
        pairs.sort_unstable();

        let mut seen = BTreeSet::new();
        for &(a, b) in &pairs {
            if a == b || !seen.insert(a) || !seen.insert(b) {
                bail!("logical cpu listed twice in sibling map");
            }
        }
        let max = *seen.iter().next_back().expect("non-empty");
        if max as usize + 1 != seen.len() {
            bail!("logical cpu ids must be contiguous from 0, got max {max} over {} cpus", seen.len());
        }

        Ok(Self { siblings: pairs })
    }

    /// Parses a sibling spec string like `"0-8,1-9,2-10"`.
    pub fn parse_spec(spec: &str) -> Result<Self> {
        let mut pairs = Vec::new();
        for part in spec.split(',') {
            let part = part.trim();
            let (a, b) = part
                .split_once('-')
                .with_context(|| format!("malformed sibling pair `{part}`"))?;
            pairs.push((
                a.trim().parse().with_context(|| format!("bad cpu id `{a}`"))?,
                b.trim().parse().with_context(|| format!("bad cpu id `{b}`"))?,
            ));
        }
        Self::from_pairs(pairs)
    }

    /// Reads the sibling map from sysfs.
    pub fn detect() -> Result<Self> {
        Self::detect_from(Path::new(SYSFS_CPU_DIR))
    }

    fn detect_from(cpu_dir: &Path) -> Result<Self> {
        let mut pairs = BTreeSet::new();
        for entry in fs::read_dir(cpu_dir).context("read sysfs cpu directory")? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(id) = name.strip_prefix("cpu") else {
                continue;
            };
            if id.parse::<u32>().is_err() {
                continue;
            }

            let list_path = entry.path().join("topology/thread_siblings_list");
            let Ok(list) = fs::read_to_string(&list_path) else {
                continue; // offline cpu or no topology entry
            };
            let cpus = parse_cpu_list(list.trim())
                .with_context(|| format!("parse {}", list_path.display()))?;
            match cpus.as_slice() {
                [a, b] => {
                    pairs.insert((*a.min(b), *a.max(b)));
                }
                [_] => bail!("cpu {name} has no SMT sibling; SMT-2 topology required"),
                _ => bail!("cpu {name} has more than one SMT sibling; SMT-2 topology required"),
            }
        }
        Self::from_pairs(pairs.into_iter().collect())
    }

    pub fn physical_cores(&self) -> usize {
        self.siblings.len()
    }

    pub fn logical_cpus(&self) -> usize {
        self.siblings.len() * 2
    }

    pub fn sibling_pair(&self, core: usize) -> (u32, u32) {
        self.siblings[core]
    }
}

/// Parses a sysfs cpu list such as `"0,8"`, `"0-1"`, or `"2,4-5"`.
fn parse_cpu_list(list: &str) -> Result<Vec<u32>> {
    let mut cpus = Vec::new();
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u32 = start.trim().parse().context("bad range start")?;
                let end: u32 = end.trim().parse().context("bad range end")?;
                if end < start {
                    bail!("inverted cpu range `{part}`");
                }
                cpus.extend(start..=end);
            }
            None => cpus.push(part.parse().context("bad cpu id")?),
        }
    }
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_spec_builds_sorted_pairs() {
        let topo = CpuTopology::parse_spec("1-9, 0-8, 2-10,3-11").unwrap();
        assert_eq!(topo.physical_cores(), 4);
        assert_eq!(topo.logical_cpus(), 8);
        assert_eq!(topo.sibling_pair(0), (0, 8));
        assert_eq!(topo.sibling_pair(3), (3, 11));
    }

    #[test]
    fn duplicate_or_gapped_ids_are_rejected() {
        assert!(CpuTopology::parse_spec("0-1,1-2").is_err());
        assert!(CpuTopology::parse_spec("0-0").is_err());
        assert!(CpuTopology::parse_spec("").is_err());
        // ids 0..3 plus 8 leaves a gap
        assert!(CpuTopology::parse_spec("0-1,2-8").is_err());
    }

    #[test]
    fn cpu_list_formats() {
        assert_eq!(parse_cpu_list("0,8").unwrap(), vec![0, 8]);
        assert_eq!(parse_cpu_list("0-1").unwrap(), vec![0, 1]);
        assert_eq!(parse_cpu_list("2,4-6").unwrap(), vec![2, 4, 5, 6]);
        assert!(parse_cpu_list("5-2").is_err());
        assert!(parse_cpu_list("x").is_err());
    }

    #[test]
    fn detect_parses_sysfs_layout() {
        let dir = tempfile::tempdir().unwrap();
        for (cpu, list) in [(0, "0,2"), (1, "1,3"), (2, "0,2"), (3, "1,3")] {
            let topo_dir = dir.path().join(format!("cpu{cpu}/topology"));
            std::fs::create_dir_all(&topo_dir).unwrap();
            std::fs::write(topo_dir.join("thread_siblings_list"), list).unwrap();
        }
        // non-cpu entries are skipped
        std::fs::create_dir_all(dir.path().join("cpufreq")).unwrap();

        let topo = CpuTopology::detect_from(dir.path()).unwrap();
        assert_eq!(topo.physical_cores(), 2);
        assert_eq!(topo.sibling_pair(0), (0, 2));
        assert_eq!(topo.sibling_pair(1), (1, 3));
    }
}
