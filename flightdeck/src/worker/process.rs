//! One forked worker process and how it ended.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};

/// Exit code of a worker whose entry point returned `Ok`.
pub const EXIT_OK: i32 = 0;
/// Exit code of a worker whose entry point returned `Err`.
pub const EXIT_FAILED: i32 = 1;
/// Exit code of a worker whose entry point panicked.
pub const EXIT_PANICKED: i32 = 101;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Process could not be reaped or ended in an unexpected way.
    Unknown,
}

impl TerminationReason {
    /// Whether the entry point returned `Ok`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(EXIT_OK))
    }

    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::Exited(EXIT_OK) => "exited cleanly".to_string(),
            Self::Exited(EXIT_FAILED) => "entry point returned an error".to_string(),
            Self::Exited(EXIT_PANICKED) => "entry point panicked".to_string(),
            Self::Exited(code) => format!("exited with code {code}"),
            Self::Signaled(sig) => format!("killed by signal {sig:?}"),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// Maps a `WaitStatus` of a terminated child to a [`TerminationReason`].
#[must_use]
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        _ => TerminationReason::Unknown,
    }
}

/// Handle to one forked worker process.
#[derive(Debug)]
pub struct WorkerProcess {
    pid: Pid,
    index: usize,
    reaped: bool,
}

impl WorkerProcess {
    /// Forks a child that runs `body` and exits with its return value.
    ///
    /// The child never returns into the caller's stack: it leaves through
    /// `_exit`, so no destructor of state inherited from the parent runs in
    /// the child. A panic in `body` exits with [`EXIT_PANICKED`].
    ///
    /// # Errors
    ///
    /// Returns the errno if `fork` fails.
    pub(crate) fn spawn(index: usize, body: impl FnOnce() -> i32) -> Result<Self, Errno> {
        // SAFETY: the child only runs `body` and then calls `_exit`. Worker
        // bodies are expected to stick to the channel and exit-signal APIs,
        // which rely on atomics in shared memory rather than on locks another
        // parent thread might have held at fork time.
        match unsafe { fork() }? {
            ForkResult::Child => {
                let code = catch_unwind(AssertUnwindSafe(body)).unwrap_or(EXIT_PANICKED);
                // SAFETY: `_exit` ends the child immediately without running
                // atexit handlers or flushing stdio buffers copied from the
                // parent.
                unsafe { nix::libc::_exit(code) }
            }
            ForkResult::Parent { child } => Ok(Self {
                pid: child,
                index,
                reaped: false,
            }),
        }
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Position of this process within its pool.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Blocks until the process terminates.
    ///
    /// # Errors
    ///
    /// Returns the errno if `waitpid` fails, or `ECHILD` if already reaped.
    pub fn wait(&mut self) -> Result<TerminationReason, Errno> {
        if self.reaped {
            return Err(Errno::ECHILD);
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    self.reaped = true;
                    return Ok(analyze_wait_status(status));
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => {
                    self.reaped = true;
                    return Err(e);
                }
            }
        }
    }

    /// Reaps the process if it already terminated.
    ///
    /// # Errors
    ///
    /// Returns the errno if `waitpid` fails.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>, Errno> {
        if self.reaped {
            return Err(Errno::ECHILD);
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG))? {
            WaitStatus::StillAlive => Ok(None),
            status => {
                self.reaped = true;
                Ok(Some(analyze_wait_status(status)))
            }
        }
    }

    /// Whether the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        !self.reaped && matches!(self.try_wait(), Ok(None))
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        let _ = signal::kill(self.pid, Signal::SIGTERM);
        std::thread::sleep(Duration::from_millis(10));
        if let Ok(Some(_)) = self.try_wait() {
            return;
        }
        let _ = signal::kill(self.pid, Signal::SIGKILL);
        let _ = waitpid(self.pid, None);
        self.reaped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial(fork)]
    fn test_exit_code_reported() {
        let mut proc = WorkerProcess::spawn(3, || 7).unwrap();
        assert_eq!(proc.index(), 3);
        assert_eq!(proc.wait().unwrap(), TerminationReason::Exited(7));
        assert_eq!(proc.wait(), Err(Errno::ECHILD));
    }

    #[test]
    #[serial(fork)]
    fn test_panic_maps_to_panicked_code() {
        let mut proc = WorkerProcess::spawn(0, || panic!("boom")).unwrap();
        let reason = proc.wait().unwrap();
        assert_eq!(reason, TerminationReason::Exited(EXIT_PANICKED));
        assert!(!reason.is_success());
        assert_eq!(reason.description(), "entry point panicked");
    }

    #[test]
    #[serial(fork)]
    fn test_drop_reaps_running_process() {
        let proc = WorkerProcess::spawn(0, || loop {
            std::thread::sleep(Duration::from_millis(5));
        })
        .unwrap();
        let pid = proc.pid();
        drop(proc);
        assert_eq!(waitpid(pid, Some(WaitPidFlag::WNOHANG)), Err(Errno::ECHILD));
    }

    #[test]
    fn test_analyze_wait_status() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            analyze_wait_status(WaitStatus::Exited(pid, 0)),
            TerminationReason::Exited(0)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            TerminationReason::Signaled(Signal::SIGTERM)
        );
        assert_eq!(analyze_wait_status(WaitStatus::StillAlive), TerminationReason::Unknown);
        assert!(TerminationReason::Exited(0).is_success());
    }
}
