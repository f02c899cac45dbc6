//! Lifecycle controller: track process groups from birth, detect the
//! long-running threshold, and enroll into the IPC engine only after the
//! external profiler has acknowledged.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use ipc_monitor::EngineError;
use ipc_monitor::IpcMonitor;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::JobId;
use crate::Pgid;

/// Engine seam: enrollment into and withdrawal from IPC accounting.
pub trait Enrollment: Send + Sync {
    fn enroll(&self, pgid: Pgid, jobid: JobId, worker_num: i32) -> Result<(), EngineError>;
    fn withdraw(&self, pgid: Pgid) -> Result<(), EngineError>;
}

impl Enrollment for IpcMonitor {
    fn enroll(&self, pgid: Pgid, jobid: JobId, worker_num: i32) -> Result<(), EngineError> {
        self.add(pgid, jobid, worker_num).map(|_| ())
    }

    fn withdraw(&self, pgid: Pgid) -> Result<(), EngineError> {
        self.remove(pgid)
    }
}

/// Liveness seam: does the process group still have members?
pub trait PgidLiveness: Send + Sync {
    fn has_members(&self, pgid: Pgid) -> bool;
}

/// Production liveness check: signal 0 to the process group.
pub struct ProcLiveness;

impl PgidLiveness for ProcLiveness {
    fn has_members(&self, pgid: Pgid) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(-pgid), None).is_ok()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("agent endpoint not configured")]
    Unconfigured,
    #[error("transient send failure")]
    Congested,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Transport seam for profile requests.
pub trait ProfileSink: Send + Sync {
    fn send_request(&self, pgid: Pgid, elapsed_secs: u64, jobid: JobId)
        -> Result<(), TransportError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("process group {0} is already tracked")]
    Duplicate(Pgid),
    #[error("process group {0} is not tracked")]
    NotFound(Pgid),
    #[error("process group {0} has no live members")]
    NoSuchProcess(Pgid),
}

#[derive(Debug)]
struct TrackedPgid {
    jobid: JobId,
    worker_num: i32,
    birth: Instant,
    need_send_request: bool,
    is_long_running: bool,
    /// Profiling-completion ACK received from the external agent.
    profile_done: bool,
    /// Enrolled in the IPC engine. Set optimistically during the scan and
    /// rolled back if the enroll fails.
    ipcmon_registered: bool,
}

enum IpcAction {
    Enroll {
        pgid: Pgid,
        jobid: JobId,
        worker_num: i32,
    },
    Withdraw {
        pgid: Pgid,
    },
}

pub struct LifecycleController {
    entries: Mutex<HashMap<Pgid, TrackedPgid>>,
    threshold_secs: AtomicU64,
    scan_interval: Duration,
    enrollment: Arc<dyn Enrollment>,
    liveness: Arc<dyn PgidLiveness>,
    sink: Arc<dyn ProfileSink>,
}

impl LifecycleController {
    pub fn new(
        enrollment: Arc<dyn Enrollment>,
        liveness: Arc<dyn PgidLiveness>,
        sink: Arc<dyn ProfileSink>,
        threshold: Duration,
        scan_interval: Duration,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            threshold_secs: AtomicU64::new(threshold.as_secs()),
            scan_interval,
            enrollment,
            liveness,
            sink,
        }
    }

    /// Starts tracking a process group.
    pub fn add_tracked(
        &self,
        pgid: Pgid,
        jobid: JobId,
        worker_num: i32,
    ) -> Result<(), LifecycleError> {
        if !self.liveness.has_members(pgid) {
            return Err(LifecycleError::NoSuchProcess(pgid));
        }

        let mut entries = self.entries.lock().expect("poisoned");
        if entries.contains_key(&pgid) {
            return Err(LifecycleError::Duplicate(pgid));
        }
        entries.insert(
            pgid,
            TrackedPgid {
                jobid,
                worker_num,
                birth: Instant::now(),
                need_send_request: false,
                is_long_running: false,
                profile_done: false,
                ipcmon_registered: false,
            },
        );
        drop(entries);

        info!(pgid, jobid, worker_num, "tracking process group");
        Ok(())
    }

    /// Stops tracking a process group, withdrawing it from the engine if
    /// it was enrolled. The withdrawal happens outside the table lock.
    pub fn remove_tracked(&self, pgid: Pgid) -> Result<(), LifecycleError> {
        let registered = {
            let mut entries = self.entries.lock().expect("poisoned");
            let entry = entries.remove(&pgid).ok_or(LifecycleError::NotFound(pgid))?;
            entry.ipcmon_registered
        };

        if registered {
            if let Err(err) = self.enrollment.withdraw(pgid) {
                warn!(pgid, %err, "failed to withdraw removed process group");
            }
        }

        info!(pgid, "stopped tracking process group");
        Ok(())
    }

    pub fn set_threshold(&self, threshold: Duration) {
        let old = self.threshold_secs.swap(threshold.as_secs(), Ordering::Relaxed);
        info!(
            old_secs = old,
            new_secs = threshold.as_secs(),
            "long-running threshold updated"
        );
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold_secs.load(Ordering::Relaxed))
    }

    /// Forces a profile request for a tracked process group on the next
    /// scan tick.
    pub fn request_profile_for(&self, pgid: Pgid) -> Result<(), LifecycleError> {
        let mut entries = self.entries.lock().expect("poisoned");
        let entry = entries.get_mut(&pgid).ok_or(LifecycleError::NotFound(pgid))?;
        entry.need_send_request = true;
        Ok(())
    }

    /// Profiling-completion ACK. Enrollment itself is deferred to the next
    /// scan tick; this path stays lock-short and failure-free.
    pub fn handle_ack(&self, pgid: Pgid) {
        let mut entries = self.entries.lock().expect("poisoned");
        if let Some(entry) = entries.get_mut(&pgid) {
            entry.profile_done = true;
            entry.is_long_running = true;
            info!(pgid, "profiling ACK received");
        } else {
            debug!(pgid, "ACK for untracked process group, ignoring");
        }
    }

    /// One scan tick. Phase 1 walks the table under the lock and builds
    /// action lists; phase 2 performs engine calls and datagram sends
    /// outside it.
    pub fn scan_once(&self) {
        let threshold = self.threshold();
        let mut ipc_actions: Vec<IpcAction> = Vec::new();
        let mut notifications: Vec<(Pgid, u64, JobId)> = Vec::new();

        {
            let mut entries = self.entries.lock().expect("poisoned");
            entries.retain(|&pgid, entry| {
                if !self.liveness.has_members(pgid) {
                    info!(pgid, "auto-removing dead process group");
                    if entry.ipcmon_registered {
                        ipc_actions.push(IpcAction::Withdraw { pgid });
                    }
                    return false;
                }

                let elapsed = entry.birth.elapsed();
                if !entry.is_long_running && elapsed >= threshold {
                    entry.is_long_running = true;
                    entry.need_send_request = true;
                    info!(pgid, elapsed_secs = elapsed.as_secs(), "crossed long-running threshold");
                }

                // ACK-gated: enroll only once profiling completed.
                if entry.is_long_running && entry.profile_done && !entry.ipcmon_registered {
                    ipc_actions.push(IpcAction::Enroll {
                        pgid,
                        jobid: entry.jobid,
                        worker_num: entry.worker_num,
                    });
                    // optimistic; rolled back in phase 2 on failure
                    entry.ipcmon_registered = true;
                }

                if entry.need_send_request {
                    notifications.push((pgid, elapsed.as_secs(), entry.jobid));
                    entry.need_send_request = false;
                }

                true
            });
        }

        for action in ipc_actions {
            match action {
                IpcAction::Enroll {
                    pgid,
                    jobid,
                    worker_num,
                } => match self.enrollment.enroll(pgid, jobid, worker_num) {
                    Ok(()) => {}
                    // Already enrolled: keep the registered mark.
                    Err(EngineError::Duplicate(_)) => {}
                    Err(err) => {
                        warn!(pgid, %err, "enroll failed, rolling back");
                        let mut entries = self.entries.lock().expect("poisoned");
                        if let Some(entry) = entries.get_mut(&pgid) {
                            entry.ipcmon_registered = false;
                        }
                    }
                },
                IpcAction::Withdraw { pgid } => {
                    if let Err(err) = self.enrollment.withdraw(pgid) {
                        warn!(pgid, %err, "withdraw of dead process group failed");
                    }
                }
            }
        }

        for (pgid, elapsed_secs, jobid) in notifications {
            match self.sink.send_request(pgid, elapsed_secs, jobid) {
                Ok(()) => debug!(pgid, elapsed_secs, jobid, "profile request sent"),
                Err(TransportError::Congested) => {
                    // Transient: retry on the next tick.
                    let mut entries = self.entries.lock().expect("poisoned");
                    if let Some(entry) = entries.get_mut(&pgid) {
                        entry.need_send_request = true;
                    }
                }
                Err(err) => debug!(pgid, %err, "profile request dropped"),
            }
        }
    }

    /// Periodic tick loop; tears the table down when cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.scan_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.scan_once(),
            }
        }
        self.teardown();
    }

    /// Withdraws every enrolled process group and clears the table.
    pub fn teardown(&self) {
        let registered: Vec<Pgid> = {
            let mut entries = self.entries.lock().expect("poisoned");
            let pgids = entries
                .iter()
                .filter(|(_, entry)| entry.ipcmon_registered)
                .map(|(&pgid, _)| pgid)
                .collect();
            entries.clear();
            pgids
        };

        for pgid in registered {
            if let Err(err) = self.enrollment.withdraw(pgid) {
                warn!(pgid, %err, "withdraw during teardown failed");
            }
        }
        info!("lifecycle controller torn down");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[derive(Default)]
    struct MockEnrollment {
        enrolled: Mutex<HashSet<Pgid>>,
        fail_next_enroll: AtomicBool,
    }

    impl Enrollment for MockEnrollment {
        fn enroll(&self, pgid: Pgid, _jobid: JobId, _worker_num: i32) -> Result<(), EngineError> {
            if self.fail_next_enroll.swap(false, Ordering::SeqCst) {
                return Err(EngineError::NoCapacity);
            }
            if !self.enrolled.lock().unwrap().insert(pgid) {
                return Err(EngineError::Duplicate(pgid));
            }
            Ok(())
        }

        fn withdraw(&self, pgid: Pgid) -> Result<(), EngineError> {
            if self.enrolled.lock().unwrap().remove(&pgid) {
                Ok(())
            } else {
                Err(EngineError::NotFound(pgid))
            }
        }
    }

    #[derive(Default)]
    struct MockLiveness {
        alive: Mutex<HashSet<Pgid>>,
    }

    impl MockLiveness {
        fn spawn(&self, pgid: Pgid) {
            self.alive.lock().unwrap().insert(pgid);
        }
        fn kill(&self, pgid: Pgid) {
            self.alive.lock().unwrap().remove(&pgid);
        }
    }

    impl PgidLiveness for MockLiveness {
        fn has_members(&self, pgid: Pgid) -> bool {
            self.alive.lock().unwrap().contains(&pgid)
        }
    }

    #[derive(Default)]
    struct MockSink {
        sent: Mutex<Vec<(Pgid, u64, JobId)>>,
        congested: AtomicBool,
    }

    impl ProfileSink for MockSink {
        fn send_request(
            &self,
            pgid: Pgid,
            elapsed_secs: u64,
            jobid: JobId,
        ) -> Result<(), TransportError> {
            if self.congested.load(Ordering::SeqCst) {
                return Err(TransportError::Congested);
            }
            self.sent.lock().unwrap().push((pgid, elapsed_secs, jobid));
            Ok(())
        }
    }

    struct Harness {
        controller: LifecycleController,
        enrollment: Arc<MockEnrollment>,
        liveness: Arc<MockLiveness>,
        sink: Arc<MockSink>,
    }

    fn harness(threshold: Duration) -> Harness {
        let enrollment = Arc::new(MockEnrollment::default());
        let liveness = Arc::new(MockLiveness::default());
        let sink = Arc::new(MockSink::default());
        let controller = LifecycleController::new(
            Arc::clone(&enrollment) as Arc<dyn Enrollment>,
            Arc::clone(&liveness) as Arc<dyn PgidLiveness>,
            Arc::clone(&sink) as Arc<dyn ProfileSink>,
            threshold,
            Duration::from_secs(1),
        );
        Harness {
            controller,
            enrollment,
            liveness,
            sink,
        }
    }

    fn enrolled(h: &Harness) -> HashSet<Pgid> {
        h.enrollment.enrolled.lock().unwrap().clone()
    }

    #[test]
    fn add_remove_and_errors() {
        let h = harness(Duration::from_secs(3600));
        h.liveness.spawn(300);

        assert_eq!(h.controller.add_tracked(999, 1, 1), Err(LifecycleError::NoSuchProcess(999)));
        assert_eq!(h.controller.add_tracked(300, 1, 2), Ok(()));
        assert_eq!(h.controller.add_tracked(300, 1, 2), Err(LifecycleError::Duplicate(300)));

        assert_eq!(h.controller.remove_tracked(300), Ok(()));
        assert_eq!(h.controller.remove_tracked(300), Err(LifecycleError::NotFound(300)));
    }

    // ACK-gated enrollment: threshold crossing emits a profile request;
    // enrollment happens only on the tick after the ACK arrives.
    #[test]
    fn ack_gates_enrollment() {
        let h = harness(Duration::ZERO);
        h.liveness.spawn(300);
        h.controller.add_tracked(300, 9, 2).unwrap();

        // First tick: crosses threshold, requests profiling — but does not
        // enroll yet.
        h.controller.scan_once();
        assert_eq!(h.sink.sent.lock().unwrap().as_slice(), &[(300, 0, 9)]);
        assert!(enrolled(&h).is_empty());

        // More ticks without ACK: still no enrollment, no repeat request.
        h.controller.scan_once();
        h.controller.scan_once();
        assert!(enrolled(&h).is_empty());
        assert_eq!(h.sink.sent.lock().unwrap().len(), 1);

        // ACK, then the next tick enrolls.
        h.controller.handle_ack(300);
        h.controller.scan_once();
        assert_eq!(enrolled(&h), HashSet::from([300]));
    }

    #[test]
    fn no_request_before_threshold() {
        let h = harness(Duration::from_secs(3600));
        h.liveness.spawn(300);
        h.controller.add_tracked(300, 9, 2).unwrap();

        h.controller.scan_once();
        assert!(h.sink.sent.lock().unwrap().is_empty());
        assert!(enrolled(&h).is_empty());
    }

    #[test]
    fn dead_pgid_is_garbage_collected_and_withdrawn() {
        let h = harness(Duration::ZERO);
        h.liveness.spawn(300);
        h.controller.add_tracked(300, 9, 2).unwrap();
        h.controller.handle_ack(300);
        h.controller.scan_once();
        assert_eq!(enrolled(&h), HashSet::from([300]));

        h.liveness.kill(300);
        h.controller.scan_once();
        assert!(enrolled(&h).is_empty());

        // Entry is gone: a new add works again.
        h.liveness.spawn(300);
        assert_eq!(h.controller.add_tracked(300, 9, 2), Ok(()));
    }

    #[test]
    fn enroll_failure_rolls_back_and_retries() {
        let h = harness(Duration::ZERO);
        h.liveness.spawn(300);
        h.controller.add_tracked(300, 9, 2).unwrap();
        h.controller.handle_ack(300);

        h.enrollment.fail_next_enroll.store(true, Ordering::SeqCst);
        h.controller.scan_once();
        assert!(enrolled(&h).is_empty());

        // The optimistic mark was rolled back, so the next tick retries
        // and succeeds.
        h.controller.scan_once();
        assert_eq!(enrolled(&h), HashSet::from([300]));
    }

    #[test]
    fn congested_transport_requeues_request() {
        let h = harness(Duration::ZERO);
        h.liveness.spawn(300);
        h.controller.add_tracked(300, 9, 2).unwrap();

        h.sink.congested.store(true, Ordering::SeqCst);
        h.controller.scan_once();
        assert!(h.sink.sent.lock().unwrap().is_empty());

        h.sink.congested.store(false, Ordering::SeqCst);
        h.controller.scan_once();
        assert_eq!(h.sink.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn forced_profile_request_is_sent_next_tick() {
        let h = harness(Duration::from_secs(3600));
        h.liveness.spawn(300);
        h.controller.add_tracked(300, 9, 2).unwrap();

        assert_eq!(
            h.controller.request_profile_for(999),
            Err(LifecycleError::NotFound(999))
        );
        h.controller.request_profile_for(300).unwrap();
        h.controller.scan_once();
        assert_eq!(h.sink.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn teardown_withdraws_enrolled_groups() {
        let h = harness(Duration::ZERO);
        for pgid in [300, 301] {
            h.liveness.spawn(pgid);
            h.controller.add_tracked(pgid, 9, 1).unwrap();
            h.controller.handle_ack(pgid);
        }
        h.controller.scan_once();
        assert_eq!(enrolled(&h).len(), 2);

        h.controller.teardown();
        assert!(enrolled(&h).is_empty());

        // Table is empty afterwards.
        h.liveness.spawn(300);
        assert_eq!(h.controller.add_tracked(300, 9, 1), Ok(()));
    }

    #[test]
    fn threshold_can_be_updated() {
        let h = harness(Duration::from_secs(3600));
        assert_eq!(h.controller.threshold(), Duration::from_secs(3600));
        h.controller.set_threshold(Duration::from_secs(5));
        assert_eq!(h.controller.threshold(), Duration::from_secs(5));
    }
}
