//! Process pools: the OS processes executing one [`WorkerSpec`].

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use nix::errno::Errno;

use crate::channel::PortRef;
use crate::trace::{debug, error, info, warn};

use super::process::{EXIT_FAILED, EXIT_OK, EXIT_PANICKED, TerminationReason, WorkerProcess};
use super::spec::{SpecError, WorkerSpec};

/// Lifecycle of a pool. Transitions only forward; a stopped pool is never
/// restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Running,
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
        })
    }
}

/// Errors from pool lifecycle calls.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool `{pool}` cannot {op} while {state}")]
    InvalidState {
        pool: String,
        op: &'static str,
        state: PoolState,
    },
    #[error("pool `{pool}` failed to fork worker {index}: {source}")]
    Spawn {
        pool: String,
        index: usize,
        #[source]
        source: Errno,
    },
}

/// How one worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub index: usize,
    pub pid: i32,
    pub reason: TerminationReason,
}

/// Outcome of [`WorkerPool::join_workers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReport {
    pub pool: String,
    pub exits: Vec<WorkerExit>,
}

impl PoolReport {
    /// Whether every worker's entry point returned `Ok`.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.exits.iter().all(|e| e.reason.is_success())
    }
}

/// Owns the processes running one worker group.
pub struct WorkerPool<A> {
    spec: WorkerSpec<A>,
    state: PoolState,
    processes: Vec<WorkerProcess>,
}

impl<A> WorkerPool<A> {
    /// Wraps a spec after checking it once more. Spawns nothing.
    ///
    /// # Errors
    ///
    /// The [`SpecError`] the spec fails with.
    pub fn create(spec: WorkerSpec<A>) -> Result<Self, SpecError> {
        spec.revalidate()?;
        debug!(pool = spec.name(), workers = spec.count(), "pool created");
        Ok(Self {
            spec,
            state: PoolState::Created,
            processes: Vec::new(),
        })
    }

    /// Forks `count` worker processes.
    ///
    /// Returns once every fork has been issued; workers may still be
    /// starting. If a fork fails the pool is still `Running` with the
    /// workers spawned so far, so the caller can shut it down normally.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidState`] unless the pool is `Created`,
    /// [`PoolError::Spawn`] if `fork` fails.
    pub fn start_workers(&mut self) -> Result<(), PoolError> {
        if self.state != PoolState::Created {
            return Err(self.invalid("start", self.state));
        }
        self.state = PoolState::Running;

        let spec = &self.spec;
        for index in 0..spec.count() {
            let process = WorkerProcess::spawn(index, || run_worker(spec, index)).map_err(|source| {
                error!(pool = spec.name(), index, error = %source, "fork failed");
                PoolError::Spawn {
                    pool: spec.name().to_string(),
                    index,
                    source,
                }
            })?;
            debug!(pool = spec.name(), index, pid = process.pid().as_raw(), "worker spawned");
            self.processes.push(process);
        }

        info!(pool = spec.name(), workers = spec.count(), "pool started");
        Ok(())
    }

    /// Blocks until every worker process has terminated. No timeout.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidState`] unless the pool is `Running`.
    pub fn join_workers(&mut self) -> Result<PoolReport, PoolError> {
        if self.state != PoolState::Running {
            return Err(self.invalid("join", self.state));
        }

        let mut exits = Vec::with_capacity(self.processes.len());
        for process in &mut self.processes {
            let pid = process.pid().as_raw();
            let reason = process.wait().unwrap_or_else(|err| {
                warn!(pool = self.spec.name(), pid, error = %err, "failed to reap worker");
                TerminationReason::Unknown
            });
            if reason.is_success() {
                debug!(pool = self.spec.name(), pid, "worker joined");
            } else {
                warn!(pool = self.spec.name(), pid, reason = %reason, "worker ended abnormally");
            }
            exits.push(WorkerExit {
                index: process.index(),
                pid,
                reason,
            });
        }
        self.processes.clear();
        self.state = PoolState::Stopped;

        info!(pool = self.spec.name(), workers = exits.len(), "pool joined");
        Ok(PoolReport {
            pool: self.spec.name().to_string(),
            exits,
        })
    }

    #[must_use]
    pub fn state(&self) -> PoolState {
        self.state
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.spec.name()
    }

    #[must_use]
    pub fn spec(&self) -> &WorkerSpec<A> {
        &self.spec
    }

    /// Pids of the running workers, in spawn order.
    #[must_use]
    pub fn pids(&self) -> Vec<i32> {
        self.processes.iter().map(|p| p.pid().as_raw()).collect()
    }

    fn invalid(&self, op: &'static str, state: PoolState) -> PoolError {
        PoolError::InvalidState {
            pool: self.name().to_string(),
            op,
            state,
        }
    }
}

impl<A> fmt::Debug for WorkerPool<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name())
            .field("state", &self.state)
            .field("pids", &self.pids())
            .finish()
    }
}

impl<A> Drop for WorkerPool<A> {
    fn drop(&mut self) {
        if self.state == PoolState::Running && !self.processes.is_empty() {
            warn!(
                pool = self.spec.name(),
                workers = self.processes.len(),
                "dropping running pool; terminating workers"
            );
        }
    }
}

/// Body of a forked worker: runs the entry point and turns its outcome into
/// an exit code, raising the exit signal on failure.
fn run_worker<A>(spec: &WorkerSpec<A>, index: usize) -> i32 {
    #[cfg(feature = "tracing")]
    let _span = tracing::info_span!("worker", pool = spec.name(), index, pid = std::process::id())
        .entered();

    debug!("worker running");
    match catch_unwind(AssertUnwindSafe(|| spec.run())) {
        Ok(Ok(())) => {
            debug!("worker finished");
            EXIT_OK
        }
        Ok(Err(err)) => {
            error!(error = %err, "worker failed; raising exit signal");
            spec.exit().raise();
            EXIT_FAILED
        }
        Err(_) => {
            error!("worker panicked; raising exit signal");
            spec.exit().raise();
            EXIT_PANICKED
        }
    }
}

/// Type-erased pool interface the orchestrator drives.
pub trait ManagedPool {
    fn name(&self) -> &str;
    fn state(&self) -> PoolState;
    fn inputs(&self) -> &[PortRef];
    fn outputs(&self) -> &[PortRef];
    fn start_workers(&mut self) -> Result<(), PoolError>;
    fn join_workers(&mut self) -> Result<PoolReport, PoolError>;
}

impl<A> ManagedPool for WorkerPool<A> {
    fn name(&self) -> &str {
        WorkerPool::name(self)
    }

    fn state(&self) -> PoolState {
        self.state
    }

    fn inputs(&self) -> &[PortRef] {
        self.spec.inputs()
    }

    fn outputs(&self) -> &[PortRef] {
        self.spec.outputs()
    }

    fn start_workers(&mut self) -> Result<(), PoolError> {
        WorkerPool::start_workers(self)
    }

    fn join_workers(&mut self) -> Result<PoolReport, PoolError> {
        WorkerPool::join_workers(self)
    }
}
