use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use ipc_monitor::pmu::CounterSource;
use ipc_monitor::pmu::PerfCounters;
use ipc_monitor::IpcMonitor;
use tokio_util::sync::CancellationToken;
use utils::shared_memory::handle::SharedMemoryHandle;
use utils::shared_memory::RegionBacking;

use coscheduler::agent::run_ack_listener;
use coscheduler::agent::AgentChannel;
use coscheduler::api::ControlServer;
use coscheduler::config::Cli;
use coscheduler::config::Commands;
use coscheduler::config::DaemonArgs;
use coscheduler::config::ShowShmArgs;
use coscheduler::lifecycle::LifecycleController;
use coscheduler::lifecycle::ProcLiveness;
use coscheduler::placement::PlacementScheduler;
use coscheduler::placement::RegionSampler;
use coscheduler::procs::ProcFs;
use coscheduler::procs::ThreadAffinity;
use coscheduler::score::ScoreBook;
use coscheduler::switch_feed::run_switch_feed;
use coscheduler::topology::CpuTopology;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::ShowShm(show_shm_args) => run_show_shm(show_shm_args).await,
    }
}

async fn run_daemon(args: DaemonArgs) -> Result<()> {
    utils::logging::init();
    tracing::info!("Starting coscheduler daemon");

    let topology = match &args.sibling_pairs {
        Some(spec) => CpuTopology::parse_spec(spec).context("parse sibling map override")?,
        None => CpuTopology::detect().context("detect SMT topology from sysfs")?,
    };
    tracing::info!(
        physical_cores = topology.physical_cores(),
        logical_cpus = topology.logical_cpus(),
        "CPU topology"
    );

    let handle = SharedMemoryHandle::create(&args.shm_identifier)
        .context("create snapshot region")?;

    let mut counters: Vec<Box<dyn CounterSource>> = Vec::new();
    for cpu in 0..topology.logical_cpus() {
        let pair = PerfCounters::open(cpu)
            .with_context(|| format!("open PMU counters for cpu {cpu}"))?;
        counters.push(Box::new(pair));
    }

    let engine = Arc::new(IpcMonitor::new(RegionBacking::Shared(handle), counters));
    let agent = Arc::new(AgentChannel::new(&args.socket_dir)?);
    let lifecycle = Arc::new(LifecycleController::new(
        engine.clone(),
        Arc::new(ProcLiveness),
        agent.clone(),
        Duration::from_secs(args.long_running_threshold_secs),
        Duration::from_secs(args.scan_interval_secs),
    ));
    let book = Arc::new(RwLock::new(ScoreBook::new()));

    let shutdown = Arc::new(AtomicBool::new(false));
    let sampler = Arc::new(RegionSampler::new(
        engine.clone(),
        book.clone(),
        Duration::from_secs(args.probe_interval_secs),
    ));
    let placement = PlacementScheduler::new(
        engine.clone(),
        book.clone(),
        topology,
        Arc::new(ThreadAffinity::new(ProcFs)),
        sampler,
        Duration::from_secs(args.pass_interval_secs),
        args.max_candidates,
        shutdown.clone(),
    );
    let placement_thread = std::thread::Builder::new()
        .name("placement".into())
        .spawn(move || placement.run())
        .context("spawn placement thread")?;

    let token = CancellationToken::new();
    let lifecycle_task = tokio::spawn(lifecycle.clone().run(token.clone()));
    let ack_task = tokio::spawn(run_ack_listener(
        args.socket_dir.clone(),
        lifecycle.clone(),
        token.clone(),
    ));
    let feed_task = tokio::spawn(run_switch_feed(
        args.socket_dir.clone(),
        engine.clone(),
        token.clone(),
    ));
    let server = ControlServer::new(
        args.listen_addr.clone(),
        engine.clone(),
        lifecycle.clone(),
        agent.clone(),
        book.clone(),
    );
    let server_task = tokio::spawn(server.run(token.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    token.cancel();
    shutdown.store(true, Ordering::Relaxed);

    let _ = lifecycle_task.await;
    let _ = ack_task.await;
    let _ = feed_task.await;
    let _ = server_task.await;
    tokio::task::spawn_blocking(move || {
        let _ = placement_thread.join();
    })
    .await
    .context("join placement thread")?;

    tracing::info!("coscheduler daemon stopped");
    Ok(())
}

async fn run_show_shm(args: ShowShmArgs) -> Result<()> {
    utils::logging::init();

    let handle = SharedMemoryHandle::open(&args.shm_identifier)
        .context("Failed to open shared memory")?;
    let region = handle.get_state();

    tracing::info!(
        identifier = %args.shm_identifier,
        live_count = region.live_count(),
        "snapshot region header"
    );

    region.for_each_active(|idx| {
        let view = region.slot(idx).read();
        let ipc = if view.cycles > 0 {
            view.instructions as f64 / view.cycles as f64
        } else {
            0.0
        };
        tracing::info!(
            slot = idx,
            pgid = view.pgid,
            jobid = view.jobid,
            worker_num = view.worker_num,
            cycles = view.cycles,
            instructions = view.instructions,
            ipc,
            "active slot"
        );
    });

    Ok(())
}
