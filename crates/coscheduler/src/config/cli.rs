use clap::Parser;
use clap::Subcommand;

use crate::config::daemon::DaemonArgs;
use crate::config::shm::ShowShmArgs;

#[derive(Parser)]
#[command(about = "SMT-aware co-scheduling controller", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the co-scheduling daemon
    Daemon(Box<DaemonArgs>),
    /// Show the snapshot region of a running daemon
    #[command(name = "show-shm")]
    ShowShm(ShowShmArgs),
}
