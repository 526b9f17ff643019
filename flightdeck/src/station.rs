//! Ground station: the workers of a small vehicle-monitoring pipeline.
//!
//! ```text
//! heartbeat_sender
//! heartbeat_receiver ──(String)────────> heartbeat_to_main ──> orchestrator
//! telemetry ──(TelemetryData)──> telemetry_to_command ──> command
//! command ──(String)───────────> command_to_main ──────────> orchestrator
//! ```
//!
//! The status channel carries [`CONNECTED`] or [`DISCONNECTED`]; the latter
//! ends supervision.

pub mod command;
pub mod heartbeat;
pub mod link;
pub mod telemetry;

use std::time::Duration;

use minstant::Instant;

use crate::exit::ExitHandle;
use crate::worker::WorkerError;

pub use command::{Command, Decision, Position};
pub use heartbeat::LinkMonitor;
pub use link::{LinkError, SimulatedLink, SimulationConfig, VehicleLink};
pub use telemetry::TelemetryData;

pub const CONNECTED: &str = "Connected";
pub const DISCONNECTED: &str = "Disconnected";

/// Whether a status message reports a lost vehicle.
#[must_use]
pub fn is_disconnect(status: &str) -> bool {
    status == DISCONNECTED
}

impl From<LinkError> for WorkerError {
    fn from(err: LinkError) -> Self {
        WorkerError::other(err)
    }
}

/// Sleeps for `period`, waking early once the exit signal is raised.
pub(crate) fn pace(exit: &ExitHandle, period: Duration) {
    const SLICE: Duration = Duration::from_millis(10);
    let start = Instant::now();
    while !exit.is_raised() {
        let left = period.saturating_sub(start.elapsed());
        if left.is_zero() {
            break;
        }
        std::thread::sleep(left.min(SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::ExitSignal;

    #[test]
    fn test_is_disconnect() {
        assert!(is_disconnect("Disconnected"));
        assert!(!is_disconnect("Connected"));
        assert!(!is_disconnect("disconnected"));
    }

    #[test]
    fn test_pace_returns_early_on_exit() {
        let signal = ExitSignal::create("flightdeck-test").unwrap();
        let exit = signal.handle().unwrap();
        signal.raise();
        let start = Instant::now();
        pace(&exit, Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
