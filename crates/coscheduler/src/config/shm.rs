use clap::Parser;

#[derive(Parser, Clone)]
pub struct ShowShmArgs {
    #[arg(
        long,
        env = "COSCHED_SHM_IDENTIFIER",
        default_value = "coscheduler_snapshots",
        help = "OS identifier of the shared snapshot region"
    )]
    pub shm_identifier: String,
}
