//! Heartbeat sender and receiver workers.

use std::time::Duration;

use crate::channel::ChannelError;
use crate::trace::{debug, info, warn};
use crate::worker::EntryPoint;

use super::link::{Heartbeat, VehicleLink};
use super::{CONNECTED, DISCONNECTED, pace};

/// Consecutive misses after which the vehicle counts as disconnected.
pub const DEFAULT_MISS_THRESHOLD: u32 = 5;

/// Tracks consecutive missed heartbeats.
#[derive(Debug, Clone)]
pub struct LinkMonitor {
    threshold: u32,
    missed: u32,
}

impl LinkMonitor {
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            missed: 0,
        }
    }

    /// Records one receive attempt and returns the resulting status.
    pub fn observe(&mut self, heartbeat: Option<Heartbeat>) -> &'static str {
        match heartbeat {
            Some(hb) => {
                if self.missed > 0 {
                    info!(missed = self.missed, time_boot_ms = hb.time_boot_ms, "heartbeat back");
                }
                self.missed = 0;
            }
            None => {
                self.missed = self.missed.saturating_add(1);
                warn!(missed = self.missed, "heartbeat missed");
            }
        }
        self.status()
    }

    #[must_use]
    pub fn status(&self) -> &'static str {
        if self.missed >= self.threshold {
            DISCONNECTED
        } else {
            CONNECTED
        }
    }

    #[must_use]
    pub fn missed(&self) -> u32 {
        self.missed
    }
}

/// Arguments of the heartbeat sender.
#[derive(Debug, Clone)]
pub struct SenderArgs<L> {
    pub link: L,
    pub period: Duration,
}

/// Worker that sends a heartbeat every period. No ports.
pub fn heartbeat_sender<L: VehicleLink + 'static>() -> EntryPoint<SenderArgs<L>> {
    EntryPoint::new("heartbeat_sender", |args: &SenderArgs<L>, _, exit| {
        info!(period_ms = args.period.as_millis() as u64, "heartbeat sender running");
        while !exit.is_raised() {
            args.link.send_heartbeat()?;
            pace(exit, args.period);
        }
        Ok(())
    })
}

/// Arguments of the heartbeat receiver.
#[derive(Debug, Clone)]
pub struct ReceiverArgs<L> {
    pub link: L,
    /// Receive timeout and reporting period.
    pub period: Duration,
    pub miss_threshold: u32,
    /// Timeout of each status `put`.
    pub put_timeout: Duration,
}

/// Worker that reports `"Connected"` or `"Disconnected"` on output 0 once
/// per period.
pub fn heartbeat_receiver<L: VehicleLink + 'static>() -> EntryPoint<ReceiverArgs<L>> {
    EntryPoint::new("heartbeat_receiver", |args: &ReceiverArgs<L>, ports, exit| {
        let status = ports.output::<String>(0)?;
        let mut monitor = LinkMonitor::new(args.miss_threshold);
        while !exit.is_raised() {
            let heartbeat = args.link.recv_heartbeat(args.period)?;
            let current = monitor.observe(heartbeat);
            match status.put(&current.to_string(), args.put_timeout) {
                Ok(()) => {
                    debug!(status = current, "status reported");
                }
                Err(ChannelError::Full) => {
                    debug!(status = current, "status queue full; report dropped");
                }
                Err(err) => return Err(err.into()),
            }
            pace(exit, args.period);
        }
        Ok(())
    })
    .output::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_after_threshold_misses() {
        let mut monitor = LinkMonitor::new(DEFAULT_MISS_THRESHOLD);
        for _ in 0..4 {
            assert_eq!(monitor.observe(None), CONNECTED);
        }
        assert_eq!(monitor.observe(None), DISCONNECTED);
        assert_eq!(monitor.observe(None), DISCONNECTED);
        assert_eq!(monitor.missed(), 6);
    }

    #[test]
    fn test_heartbeat_resets_misses() {
        let mut monitor = LinkMonitor::new(2);
        monitor.observe(None);
        assert_eq!(monitor.observe(None), DISCONNECTED);
        assert_eq!(monitor.observe(Some(Heartbeat { time_boot_ms: 9 })), CONNECTED);
        assert_eq!(monitor.missed(), 0);
    }
}
