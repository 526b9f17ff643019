//! Worker groups: entry points, validated specs and the process pools that
//! run them.
//!
//! ```text
//! EntryPoint ──┐
//! fixed args ──┼── WorkerSpec::create ──> WorkerPool::create
//! ports/exit ──┘      (validates)           start_workers: fork × count
//!                                           join_workers:  waitpid × count
//! ```

mod pool;
mod ports;
mod process;
mod spec;

pub use pool::{ManagedPool, PoolError, PoolReport, PoolState, WorkerExit, WorkerPool};
pub use ports::{PortError, PortSide, Ports};
pub use process::{
    EXIT_FAILED, EXIT_OK, EXIT_PANICKED, TerminationReason, WorkerProcess, analyze_wait_status,
};
pub use spec::{EntryPoint, SpecError, WorkerError, WorkerResult, WorkerSpec};
