//! Supervises the managed tor process: spawn, crash restart with a fixed
//! delay, SIGHUP-based config reload, and stop on desired-state deletion.
//!
//! The supervisor is the only component allowed to signal or wait on the
//! process. Each spawn records a fresh [`ProcessHandle`]; handles are
//! replaced across restarts, never reused.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Binary to run, normally `tor`.
    pub program: PathBuf,
    /// Config file the daemon is pointed at.
    pub config_path: PathBuf,
    /// Fixed delay between an exit and the restart. The daemon carries
    /// its own internal backoff, so no exponential backoff here.
    pub restart_delay: Duration,
}

impl DaemonConfig {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-f")
            .arg(&self.config_path)
            .arg("--allow-missing-torrc")
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            // Ties the process lifetime to the supervision task, so
            // process-wide cancellation terminates the daemon.
            .kill_on_drop(true);
        cmd
    }
}

/// Ownership record for one spawn of the daemon.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: u32,
    pub started_at: Instant,
    pub generation: u64,
}

#[derive(Default)]
struct State {
    handle: Option<ProcessHandle>,
    exited: bool,
    /// Cancelling this token kills the current process and stops the
    /// restart loop. Present only while a supervision task runs.
    run: Option<(u64, CancellationToken)>,
    run_seq: u64,
    generation: u64,
}

pub struct Supervisor {
    cfg: DaemonConfig,
    cancel: CancellationToken,
    state: Mutex<State>,
}

impl Supervisor {
    pub fn new(cfg: DaemonConfig, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self { cfg, cancel, state: Mutex::new(State::default()) })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm the supervision loop. Idempotent: a second call while a loop
    /// is running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let (seq, run) = {
            let mut st = self.lock();
            if st.run.is_some() {
                debug!("supervisor already armed");
                return;
            }
            let run = self.cancel.child_token();
            st.run_seq += 1;
            st.run = Some((st.run_seq, run.clone()));
            (st.run_seq, run)
        };
        let this = Arc::clone(self);
        tokio::spawn(async move { this.supervise(seq, run).await });
    }

    async fn supervise(self: Arc<Self>, seq: u64, run: CancellationToken) {
        loop {
            info!(program = %self.cfg.program.display(), "starting daemon");
            let mut child = match self.cfg.command().spawn() {
                Ok(child) => child,
                Err(e) => {
                    // No restart loop on spawn failure; the next reload
                    // or start call re-arms the supervisor.
                    error!(error = %e, "failed to spawn daemon");
                    break;
                }
            };
            let pid = child.id().unwrap_or(0);
            {
                let mut st = self.lock();
                st.generation += 1;
                st.handle = Some(ProcessHandle {
                    pid,
                    started_at: Instant::now(),
                    generation: st.generation,
                });
                st.exited = false;
            }
            info!(pid, "daemon running");

            let exit = tokio::select! {
                _ = run.cancelled() => None,
                status = child.wait() => Some(status),
            };
            match exit {
                None => {
                    debug!(pid, "terminating daemon");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    self.lock().exited = true;
                    break;
                }
                Some(Ok(status)) => {
                    warn!(pid, %status, "daemon exited");
                    self.lock().exited = true;
                }
                Some(Err(e)) => {
                    warn!(pid, error = %e, "daemon wait failed");
                    self.lock().exited = true;
                }
            }

            // Unconditional fixed-delay restart while still desired.
            tokio::select! {
                _ = run.cancelled() => break,
                _ = sleep(self.cfg.restart_delay) => {}
            }
        }
        let mut st = self.lock();
        if st.run.as_ref().map(|(s, _)| *s) == Some(seq) {
            st.run = None;
        }
    }

    /// Hot config reload: SIGHUP the live process so in-flight daemon
    /// state (established circuits) survives. Falls back to `start` when
    /// there is no live process.
    pub fn reload(self: &Arc<Self>) -> Result<()> {
        let live_pid = {
            let st = self.lock();
            match (&st.handle, st.exited) {
                (Some(h), false) => Some(h.pid),
                _ => None,
            }
        };
        match live_pid {
            Some(pid) => {
                info!(pid, "reloading daemon config");
                match kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                    Ok(()) => Ok(()),
                    Err(Errno::ESRCH) => {
                        // Exited between the liveness check and the
                        // signal; treat it like the not-running case.
                        warn!(pid, "daemon gone before signal; starting instead");
                        self.start();
                        Ok(())
                    }
                    Err(e) => Err(e).with_context(|| format!("sending SIGHUP to pid {pid}")),
                }
            }
            None => {
                info!("daemon not running; starting instead of reloading");
                self.start();
                Ok(())
            }
        }
    }

    /// Stop the daemon and disarm the restart loop. Used when the watched
    /// resource is deleted upstream.
    pub fn stop(&self) {
        let run = self.lock().run.take();
        if let Some((_, token)) = run {
            info!("stopping daemon");
            token.cancel();
        }
    }

    /// Pid of the currently running process, if any.
    pub fn live_pid(&self) -> Option<u32> {
        let st = self.lock();
        match (&st.handle, st.exited) {
            (Some(h), false) => Some(h.pid),
            _ => None,
        }
    }

    pub fn is_supervising(&self) -> bool {
        self.lock().run.is_some()
    }

    /// Handle of the most recent spawn, live or not.
    pub fn last_handle(&self) -> Option<ProcessHandle> {
        self.lock().handle.clone()
    }
}

#[cfg(test)]
impl Supervisor {
    /// Plant a handle as if a spawn had been recorded, without running
    /// the supervision loop.
    fn inject_handle(&self, pid: u32) {
        let mut st = self.lock();
        st.generation += 1;
        st.handle = Some(ProcessHandle {
            pid,
            started_at: Instant::now(),
            generation: st.generation,
        });
        st.exited = false;
    }
}
