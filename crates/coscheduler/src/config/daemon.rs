use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "COSCHED_LISTEN_ADDR",
        default_value = "127.0.0.1:9090",
        help = "HTTP control API listen address"
    )]
    pub listen_addr: String,

    #[arg(
        long,
        env = "COSCHED_SHM_IDENTIFIER",
        default_value = "coscheduler_snapshots",
        help = "OS identifier of the shared snapshot region"
    )]
    pub shm_identifier: String,

    #[arg(
        long,
        env = "COSCHED_SOCKET_DIR",
        default_value = "/run/coscheduler",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding the agent, ACK, and switch-feed sockets"
    )]
    pub socket_dir: PathBuf,

    #[arg(
        long,
        default_value = "3600",
        help = "Seconds a process group must run before it counts as long-running"
    )]
    pub long_running_threshold_secs: u64,

    #[arg(long, default_value = "1", help = "Lifecycle scan interval in seconds")]
    pub scan_interval_secs: u64,

    #[arg(
        long,
        default_value = "20",
        help = "Probe window per candidate configuration in seconds"
    )]
    pub probe_interval_secs: u64,

    #[arg(
        long,
        default_value = "10",
        help = "Idle time between placement passes in seconds"
    )]
    pub pass_interval_secs: u64,

    #[arg(
        long,
        default_value = "3",
        help = "Maximum greedy candidate configurations per pass"
    )]
    pub max_candidates: usize,

    #[arg(
        long,
        env = "COSCHED_SIBLING_PAIRS",
        help = "Sibling map override, e.g. \"0-8,1-9\"; autodetected from sysfs when omitted"
    )]
    pub sibling_pairs: Option<String>,
}
