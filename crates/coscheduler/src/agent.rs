//! Datagram channel to the external profiling agent.
//!
//! Requests go out as text datagrams `"<pgid>,<elapsed_seconds>,<jobid>"`
//! to `<socket_dir>/agent-<id>.sock`; the agent answers on
//! `<socket_dir>/ack.sock` with a single little-endian `i32` PGID.

use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;

use anyhow::Context;
use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::lifecycle::LifecycleController;
use crate::lifecycle::ProfileSink;
use crate::lifecycle::TransportError;
use crate::JobId;
use crate::Pgid;

/// Name of the ACK socket inside the socket directory.
pub const ACK_SOCKET_NAME: &str = "ack.sock";

pub struct AgentChannel {
    socket_dir: PathBuf,
    socket: UnixDatagram,
    endpoint: RwLock<Option<i32>>,
}

impl AgentChannel {
    pub fn new(socket_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(socket_dir)
            .with_context(|| format!("create socket directory {}", socket_dir.display()))?;

        let socket = UnixDatagram::unbound().context("create agent datagram socket")?;
        socket
            .set_nonblocking(true)
            .context("set agent socket non-blocking")?;

        Ok(Self {
            socket_dir: socket_dir.to_path_buf(),
            socket,
            endpoint: RwLock::new(None),
        })
    }

    /// Selects the destination agent endpoint.
    pub fn set_endpoint(&self, id: i32) {
        *self.endpoint.write().expect("poisoned") = Some(id);
        info!(id, "agent endpoint set");
    }

    pub fn endpoint(&self) -> Option<i32> {
        *self.endpoint.read().expect("poisoned")
    }

    fn agent_path(&self, id: i32) -> PathBuf {
        self.socket_dir.join(format!("agent-{id}.sock"))
    }
}

impl ProfileSink for AgentChannel {
    fn send_request(
        &self,
        pgid: Pgid,
        elapsed_secs: u64,
        jobid: JobId,
    ) -> Result<(), TransportError> {
        let id = self.endpoint().ok_or(TransportError::Unconfigured)?;
        let payload = format!("{pgid},{elapsed_secs},{jobid}");

        match self.socket.send_to(payload.as_bytes(), self.agent_path(id)) {
            Ok(_) => {
                debug!(pgid, elapsed_secs, jobid, "profile request sent");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Err(TransportError::Congested),
            Err(err) if err.raw_os_error() == Some(libc::ENOBUFS) => {
                Err(TransportError::Congested)
            }
            Err(err) => Err(TransportError::Io(err)),
        }
    }
}

/// Parses an ACK payload: a single little-endian positive `i32` PGID.
pub(crate) fn parse_ack(buf: &[u8]) -> Option<Pgid> {
    let bytes = buf.get(..4)?.try_into().ok()?;
    let pgid = i32::from_le_bytes(bytes);
    (pgid > 0).then_some(pgid)
}

/// Receives profiling ACKs and forwards them to the lifecycle controller.
pub async fn run_ack_listener(
    socket_dir: PathBuf,
    lifecycle: Arc<LifecycleController>,
    token: CancellationToken,
) -> Result<()> {
    let path = socket_dir.join(ACK_SOCKET_NAME);
    let _ = std::fs::remove_file(&path);
    let socket = tokio::net::UnixDatagram::bind(&path)
        .with_context(|| format!("bind ACK socket {}", path.display()))?;
    info!(path = %path.display(), "listening for profiling ACKs");

    let mut buf = [0u8; 16];
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = socket.recv(&mut buf) => match received {
                Ok(len) => match parse_ack(&buf[..len]) {
                    Some(pgid) => lifecycle.handle_ack(pgid),
                    None => debug!(len, "malformed ACK datagram, ignoring"),
                },
                Err(err) => warn!(%err, "ACK socket receive failed"),
            },
        }
    }
    Ok(())
}
