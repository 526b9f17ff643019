use std::time::Duration;

use crate::channel::{ChannelOptions, DEFAULT_DRAIN_GRACE, DEFAULT_UNBOUNDED_CAPACITY};
use crate::wire::DEFAULT_FRAME_CAPACITY;

/// Configuration for an [`Orchestrator`](super::Orchestrator).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Timeout of each `get` the supervisory loop issues on a watched channel.
    pub poll_timeout: Duration,
    /// Wall-clock budget of [`supervise`](super::Orchestrator::supervise).
    pub run_duration: Duration,
    /// Slots backing a channel created with capacity `<= 0`.
    pub unbounded_capacity: usize,
    /// Payload bytes per message frame.
    pub frame_capacity: usize,
    /// How long a drain waits for producers caught mid-push.
    pub drain_grace: Duration,
    /// Prefix of every shared memory object the pipeline creates.
    pub shm_prefix: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            run_duration: Duration::from_secs(100),
            unbounded_capacity: DEFAULT_UNBOUNDED_CAPACITY,
            frame_capacity: DEFAULT_FRAME_CAPACITY,
            drain_grace: DEFAULT_DRAIN_GRACE,
            shm_prefix: "flightdeck".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Channel settings derived from this configuration.
    #[must_use]
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            frame_capacity: self.frame_capacity,
            unbounded_capacity: self.unbounded_capacity,
            drain_grace: self.drain_grace,
            shm_prefix: self.shm_prefix.clone(),
        }
    }
}
