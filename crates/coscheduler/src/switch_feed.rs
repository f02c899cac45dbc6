//! Intake for host-scheduler context-switch events.
//!
//! The switch hook itself lives with an external collaborator (an eBPF or
//! perf shim on the host scheduler). It reports each switch as a text
//! datagram `"<cpu>,<next_pgid>,<p|v>"`; a `next_pgid` of zero or below
//! means the incoming task is not monitored.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use ipc_monitor::IpcMonitor;
use ipc_monitor::SwitchReason;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::Pgid;

/// Name of the switch-feed socket inside the socket directory.
pub const SWITCH_SOCKET_NAME: &str = "switch.sock";

pub(crate) fn parse_switch_event(text: &str) -> Option<(usize, Option<Pgid>, SwitchReason)> {
    let mut parts = text.trim().split(',');
    let cpu = parts.next()?.parse().ok()?;
    let pgid: Pgid = parts.next()?.parse().ok()?;
    let reason = match parts.next()? {
        "p" => SwitchReason::Preemption,
        "v" => SwitchReason::Voluntary,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((cpu, (pgid > 0).then_some(pgid), reason))
}

/// Drains switch events from the feed socket into the engine handler.
pub async fn run_switch_feed(
    socket_dir: PathBuf,
    engine: Arc<IpcMonitor>,
    token: CancellationToken,
) -> Result<()> {
    let path = socket_dir.join(SWITCH_SOCKET_NAME);
    let _ = std::fs::remove_file(&path);
    let socket = tokio::net::UnixDatagram::bind(&path)
        .with_context(|| format!("bind switch-feed socket {}", path.display()))?;
    info!(path = %path.display(), "listening for context-switch events");

    let mut buf = [0u8; 64];
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = socket.recv(&mut buf) => match received {
                Ok(len) => {
                    let text = String::from_utf8_lossy(&buf[..len]);
                    match parse_switch_event(&text) {
                        Some((cpu, next_pgid, reason)) => {
                            engine.on_context_switch(cpu, next_pgid, reason);
                        }
                        None => debug!(%text, "malformed switch event, ignoring"),
                    }
                }
                Err(err) => warn!(%err, "switch-feed receive failed"),
            },
        }
    }
    Ok(())
}
