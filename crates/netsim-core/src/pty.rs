//! PTY Session Manager: spawns a shell inside a device's namespace attached
//! to a pseudo-terminal, pumps bytes between the master and a subscriber.
//!
//! No direct teacher analogue exists (the source tree has no terminal
//! feature); grounded on `network-sim/src/nsapi.rs`'s `setns`/`CloneFlags`
//! namespace-entry primitive, reused here inside a forked child rather than
//! on the calling thread, and on the "one driver activity per long-lived
//! subcomponent" shape used by the source tree's qdisc `Scheduler`
//! (`netns-testbench/src/runtime.rs`) for the master-reader task.

use std::os::fd::{AsRawFd, OwnedFd};

use nix::pty::{openpty, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execv, fork, setsid, ForkResult, Pid};
use netsim_proto::ErrorKind;
use std::ffi::CString;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::namespace::open_netns_file;

nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);
nix::ioctl_none_bad!(tiocsctty, libc::TIOCSCTTY);

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("no such device: {0}")]
    NoSuchDevice(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("session not found: {0:?}")]
    SessionNotFound(SessionId),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PtyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PtyError::NoSuchDevice(_) => ErrorKind::NotFound,
            PtyError::SessionNotFound(_) => ErrorKind::NotFound,
            PtyError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            PtyError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            PtyError::Nix(_) | PtyError::Io(_) => ErrorKind::KernelError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub device: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Spawning,
    Running,
    Closing,
    Closed,
}

/// Owns the master fd and child pid for one session. Held in its own lock,
/// independent of the output-reader lock, so a websocket handler blocked
/// inside `recv_output` never starves a concurrent `write`/`resize`.
struct Control {
    master: OwnedFd,
    child: Pid,
    state: SessionState,
}

struct Session {
    control: Mutex<Control>,
    output_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

pub struct Manager {
    sessions: std::collections::HashMap<SessionId, Session>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self {
            sessions: std::collections::HashMap::new(),
        }
    }

    /// Opens a pty, forks a child that enters `device`'s namespace and execs
    /// a login shell attached to the slave, and starts the reader task that
    /// pumps master output onto a bounded channel (SPEC_FULL §5 backpressure:
    /// 64 KiB worth of typical terminal output, sized in messages here since
    /// each read is already chunked at up to 4 KiB).
    pub async fn open(
        &mut self,
        device: &str,
        channel_id: &str,
        rows: u16,
        cols: u16,
    ) -> Result<SessionId, PtyError> {
        if rows == 0 || cols == 0 {
            return Err(PtyError::InvalidArgument(
                "rows and cols must be non-zero".to_string(),
            ));
        }
        let id = SessionId {
            device: device.to_string(),
            channel_id: channel_id.to_string(),
        };
        if self.sessions.contains_key(&id) {
            return Err(PtyError::InvalidArgument(format!(
                "session already open: {id:?}"
            )));
        }

        let netns_file = open_netns_file(device)
            .map_err(|_| PtyError::NoSuchDevice(device.to_string()))?;

        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(Some(&winsize), None).map_err(PtyError::Nix)?;
        let master = pty.master;
        let slave = pty.slave;

        // SAFETY: fork() is unsafe because the child may only call
        // async-signal-safe functions until exec; the child path below
        // sticks to setns/dup2/execv/_exit, all of which are safe here.
        match unsafe { fork() }.map_err(PtyError::Nix)? {
            ForkResult::Parent { child } => {
                drop(slave);
                let (tx, rx) = mpsc::channel(256);
                let reader_fd = master.try_clone().map_err(PtyError::Io)?;
                tokio::task::spawn_blocking(move || pump_master_output(reader_fd, tx));
                self.sessions.insert(
                    id.clone(),
                    Session {
                        control: Mutex::new(Control {
                            master,
                            child,
                            state: SessionState::Running,
                        }),
                        output_rx: Mutex::new(rx),
                    },
                );
                info!(device, channel_id, pid = child.as_raw(), "pty session opened");
                Ok(id)
            }
            ForkResult::Child => {
                // Child: enter the device's namespace, become a session
                // leader of the new controlling terminal, bind std fds to
                // the slave, then exec a login shell. Any failure here
                // exits immediately rather than unwinding back into the
                // parent's Rust state.
                let _ = nix::sched::setns(&netns_file, nix::sched::CloneFlags::CLONE_NEWNET);
                let _ = setsid();
                unsafe {
                    let _ = tiocsctty(slave.as_raw_fd(), 0);
                }
                let _ = nix::unistd::dup2(slave.as_raw_fd(), 0);
                let _ = nix::unistd::dup2(slave.as_raw_fd(), 1);
                let _ = nix::unistd::dup2(slave.as_raw_fd(), 2);
                drop(master);
                drop(slave);
                let shell = CString::new("/bin/bash").unwrap();
                let arg0 = CString::new("-bash").unwrap();
                let _ = execv(&shell, &[arg0]);
                std::process::exit(127);
            }
        }
    }

    /// Enqueues bytes to the master; the Session Manager never silently
    /// drops input. The OS pipe itself provides backpressure.
    pub async fn write(&self, id: &SessionId, bytes: &[u8]) -> Result<(), PtyError> {
        let session = self
            .sessions
            .get(id)
            .ok_or_else(|| PtyError::SessionNotFound(id.clone()))?;
        let control = session.control.lock().await;
        let fd = control.master.try_clone().map_err(PtyError::Io)?;
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || write_all_blocking(fd, &bytes))
            .await
            .map_err(|e| PtyError::Io(std::io::Error::other(e.to_string())))??;
        Ok(())
    }

    /// Updates the kernel TTY size via `TIOCSWINSZ`, which delivers a
    /// SIGWINCH to the foreground process group.
    pub async fn resize(&self, id: &SessionId, rows: u16, cols: u16) -> Result<(), PtyError> {
        if rows == 0 || cols == 0 {
            return Err(PtyError::InvalidArgument(
                "rows and cols must be non-zero".to_string(),
            ));
        }
        let session = self
            .sessions
            .get(id)
            .ok_or_else(|| PtyError::SessionNotFound(id.clone()))?;
        let control = session.control.lock().await;
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        unsafe {
            tiocswinsz(control.master.as_raw_fd(), &winsize).map_err(PtyError::Nix)?;
        }
        Ok(())
    }

    /// Waits for the next output chunk from the child. Returns `None` once
    /// the master has closed (the reader task exited). Independent of the
    /// `control` lock, so a long-idle `recv_output` call never blocks a
    /// concurrent `write`/`resize`.
    pub async fn recv_output(&self, id: &SessionId) -> Result<Option<Vec<u8>>, PtyError> {
        let session = self
            .sessions
            .get(id)
            .ok_or_else(|| PtyError::SessionNotFound(id.clone()))?;
        let mut rx = session.output_rx.lock().await;
        Ok(rx.recv().await)
    }

    /// SIGHUP, wait briefly, SIGKILL if still alive, reap, close master,
    /// remove the entry. Releasing OS resources happens before this
    /// returns, regardless of which transition triggered it.
    pub async fn close(&mut self, id: &SessionId) -> Result<(), PtyError> {
        let Some(session) = self.sessions.remove(id) else {
            return Ok(());
        };
        let mut control = session.control.into_inner();
        control.state = SessionState::Closing;

        let _ = signal::kill(control.child, Signal::SIGHUP);
        let mut waited = false;
        for _ in 0..4 {
            sleep(Duration::from_millis(50)).await;
            match waitpid(control.child, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => continue,
                Ok(_) => {
                    waited = true;
                    break;
                }
                Err(_) => {
                    waited = true;
                    break;
                }
            }
        }
        if !waited {
            let _ = signal::kill(control.child, Signal::SIGKILL);
            let _ = waitpid(control.child, None);
        }
        control.state = SessionState::Closed;
        debug!(?id, "pty session closed");
        Ok(())
    }

    pub fn exists(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Closes every tracked session; used for device removal and process
    /// shutdown, guaranteeing the teardown order in SPEC_FULL §4.3.
    pub async fn close_all_for_device(&mut self, device: &str) {
        let ids: Vec<SessionId> = self
            .sessions
            .keys()
            .filter(|id| id.device == device)
            .cloned()
            .collect();
        for id in ids {
            if let Err(e) = self.close(&id).await {
                warn!(?id, %e, "error closing pty session");
            }
        }
    }
}

fn write_all_blocking(fd: OwnedFd, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::File::from(fd);
    file.write_all(bytes)
}

/// Runs on a blocking thread for the session's lifetime, reading up to 4 KiB
/// at a time and forwarding each chunk in order; exits when the master is
/// closed or the channel's receiver is dropped.
fn pump_master_output(fd: OwnedFd, tx: mpsc::Sender<Vec<u8>>) {
    use std::io::Read;
    let mut file = std::fs::File::from(fd);
    let mut buf = [0u8; 4096];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_rejects_zero_size() {
        let mut mgr = Manager::new();
        let err = mgr.open("h1", "c1", 0, 80).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn close_unknown_session_is_noop() {
        let mut mgr = Manager::new();
        let id = SessionId {
            device: "h1".into(),
            channel_id: "c1".into(),
        };
        mgr.close(&id).await.unwrap();
    }
}
