mod cli;
mod daemon;
mod shm;

pub use cli::Cli;
pub use cli::Commands;
pub use daemon::DaemonArgs;
pub use shm::ShowShmArgs;
