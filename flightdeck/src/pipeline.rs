//! Pipeline composition, supervision and shutdown.
//!
//! ```text
//!   channel()  ──> worker() / add_pool() ──> start() ──> supervise() ──> shutdown()
//!                                                                            │
//!        raise exit ──> drain channels downstream first ──> join pools  <────┘
//! ```

mod config;
mod graph;
mod orchestrator;

pub use config::OrchestratorConfig;
pub use graph::{ChannelGraph, GraphError};
pub use orchestrator::{
    DrainRecord, Flow, Orchestrator, Phase, PipelineError, RunReport, ShutdownReport,
    SuperviseOutcome, Watch,
};
