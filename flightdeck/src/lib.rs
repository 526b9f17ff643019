//! Multi-process worker orchestration over shared-memory channels.
//!
//! Workers are forked OS processes. They talk only through typed, bounded
//! [`BoundedChannel`]s living in POSIX shared memory, and all of them watch
//! one cross-process [`ExitSignal`]. The [`Orchestrator`] wires channels and
//! worker pools into an acyclic pipeline, supervises it, and shuts it down
//! without deadlock: raise the exit signal, drain every channel downstream
//! first, then join every pool.
//!
//! ```no_run
//! use std::time::Duration;
//! use flightdeck::{EntryPoint, Flow, Orchestrator, OrchestratorConfig, Watch};
//!
//! let mut orch = Orchestrator::new(OrchestratorConfig::default())?;
//! let numbers = orch.channel::<u64>("numbers", 8)?;
//!
//! let counter = EntryPoint::new("counter", |limit: &u64, ports, exit| {
//!     let out = ports.output::<u64>(0)?;
//!     let mut n = 0;
//!     while !exit.is_raised() && n < *limit {
//!         if out.put(&n, Duration::from_millis(100)).is_ok() {
//!             n += 1;
//!         }
//!     }
//!     Ok(())
//! })
//! .output::<u64>();
//! orch.worker(1, counter, 10, &[], &[numbers.port()])?;
//!
//! let mut watches = [Watch::new(&numbers, |n: u64| {
//!     if n == 9 { Flow::Stop } else { Flow::Continue }
//! })];
//! let report = orch.run(&mut watches)?;
//! assert!(report.shutdown.all_succeeded());
//! # Ok::<(), flightdeck::PipelineError>(())
//! ```

pub mod channel;
pub mod exit;
pub mod ipc;
pub mod pipeline;
pub mod station;
pub mod wire;
pub mod worker;

mod trace;

pub use channel::{BoundedChannel, ChannelError, ChannelHandle, ChannelOptions, PortRef};
pub use exit::{ExitHandle, ExitSignal};
pub use ipc::Timeout;
pub use pipeline::{
    Flow, Orchestrator, OrchestratorConfig, PipelineError, ShutdownReport, SuperviseOutcome, Watch,
};
pub use trace::init_tracing;
pub use wire::{Message, MessageType};
pub use worker::{EntryPoint, Ports, WorkerError, WorkerPool, WorkerResult, WorkerSpec};

// Re-export serde and type_hash for message definitions
pub use serde::{Deserialize, Serialize};
pub use type_hash::TypeHash;
