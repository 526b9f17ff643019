//! Vehicle link abstraction and a simulated vehicle.

use std::f64::consts::TAU;
use std::time::Duration;

use minstant::Instant;
use serde::{Deserialize, Serialize};
use type_hash::TypeHash;

use crate::trace::debug;

/// `MAV_CMD_CONDITION_CHANGE_ALT`.
pub const CMD_CONDITION_CHANGE_ALT: u16 = 113;
/// `MAV_CMD_CONDITION_YAW`.
pub const CMD_CONDITION_YAW: u16 = 115;

/// Errors from a vehicle link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link closed")]
    Closed,
    #[error("link i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Liveness beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TypeHash)]
pub struct Heartbeat {
    pub time_boot_ms: u32,
}

/// Orientation sample. Angles in radians, rates in radians per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TypeHash)]
pub struct Attitude {
    pub time_boot_ms: u32,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub roll_speed: f64,
    pub pitch_speed: f64,
    pub yaw_speed: f64,
}

/// Local NED position sample. Metres and metres per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TypeHash)]
pub struct LocalPosition {
    pub time_boot_ms: u32,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
}

/// A `COMMAND_LONG` request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandLong {
    pub target_system: u8,
    pub target_component: u8,
    pub command: u16,
    pub confirmation: u8,
    pub params: [f32; 7],
}

impl CommandLong {
    /// A command addressed to system 1, component 0.
    #[must_use]
    pub fn new(command: u16, params: [f32; 7]) -> Self {
        Self {
            target_system: 1,
            target_component: 0,
            command,
            confirmation: 0,
            params,
        }
    }
}

/// Connection to a vehicle.
///
/// Every worker process gets its own copy through fork, so methods take
/// `&self`. Receive calls return `Ok(None)` when nothing arrived in time.
pub trait VehicleLink {
    fn send_heartbeat(&self) -> Result<(), LinkError>;
    fn recv_heartbeat(&self, timeout: Duration) -> Result<Option<Heartbeat>, LinkError>;
    fn recv_attitude(&self, timeout: Duration) -> Result<Option<Attitude>, LinkError>;
    fn recv_position(&self, timeout: Duration) -> Result<Option<LocalPosition>, LinkError>;
    fn send_command(&self, command: CommandLong) -> Result<(), LinkError>;
}

/// Settings of a [`SimulatedLink`].
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Interval between samples of each kind.
    pub sample_interval: Duration,
    /// The vehicle goes silent after this long; `None` keeps it alive.
    pub disconnect_after: Option<Duration>,
    /// Radius of the circle flown in the horizontal plane.
    pub radius: f64,
    /// Time for one lap.
    pub lap: Duration,
    /// Altitude swing around the mean, in metres (NED, so negative is up).
    pub altitude_swing: f64,
    pub mean_altitude: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(100),
            disconnect_after: None,
            radius: 20.0,
            lap: Duration::from_secs(60),
            altitude_swing: 2.0,
            mean_altitude: -10.0,
        }
    }
}

/// A vehicle flying a circle with a slowly oscillating altitude.
///
/// Samples are a pure function of the time since the link was created, so
/// copies inherited by different processes agree with each other.
#[derive(Debug, Clone)]
pub struct SimulatedLink {
    config: SimulationConfig,
    epoch: Instant,
}

impl SimulatedLink {
    #[must_use]
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
        }
    }

    /// Time since boot.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Whether the vehicle is still talking.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.config
            .disconnect_after
            .is_none_or(|after| self.uptime() < after)
    }

    /// Position of the vehicle `t` after boot.
    #[must_use]
    pub fn position_at(&self, t: Duration) -> LocalPosition {
        let SimulationConfig {
            radius,
            altitude_swing,
            mean_altitude,
            ..
        } = self.config;
        let w = TAU / self.config.lap.as_secs_f64();
        let phase = w * t.as_secs_f64();
        LocalPosition {
            time_boot_ms: millis(t),
            x: radius * phase.cos(),
            y: radius * phase.sin(),
            z: mean_altitude + altitude_swing * (phase * 3.0).sin(),
            vx: -radius * w * phase.sin(),
            vy: radius * w * phase.cos(),
            vz: altitude_swing * 3.0 * w * (phase * 3.0).cos(),
        }
    }

    /// Attitude of the vehicle `t` after boot: level, nose along the track.
    #[must_use]
    pub fn attitude_at(&self, t: Duration) -> Attitude {
        let w = TAU / self.config.lap.as_secs_f64();
        let heading = w * t.as_secs_f64() + TAU / 4.0;
        Attitude {
            time_boot_ms: millis(t),
            roll: 0.0,
            pitch: 0.0,
            yaw: (heading + TAU / 2.0).rem_euclid(TAU) - TAU / 2.0,
            roll_speed: 0.0,
            pitch_speed: 0.0,
            yaw_speed: w,
        }
    }

    /// Waits for the next sample, or the whole timeout if disconnected.
    fn wait_sample(&self, timeout: Duration) -> Option<Duration> {
        if !self.is_connected() {
            std::thread::sleep(timeout);
            return None;
        }
        let wait = self.config.sample_interval.min(timeout);
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        Some(self.uptime())
    }
}

impl VehicleLink for SimulatedLink {
    fn send_heartbeat(&self) -> Result<(), LinkError> {
        debug!(uptime_ms = millis(self.uptime()), "heartbeat sent");
        Ok(())
    }

    fn recv_heartbeat(&self, timeout: Duration) -> Result<Option<Heartbeat>, LinkError> {
        if self.is_connected() {
            return Ok(Some(Heartbeat {
                time_boot_ms: millis(self.uptime()),
            }));
        }
        std::thread::sleep(timeout);
        Ok(None)
    }

    fn recv_attitude(&self, timeout: Duration) -> Result<Option<Attitude>, LinkError> {
        Ok(self.wait_sample(timeout).map(|t| self.attitude_at(t)))
    }

    fn recv_position(&self, timeout: Duration) -> Result<Option<LocalPosition>, LinkError> {
        Ok(self.wait_sample(timeout).map(|t| self.position_at(t)))
    }

    fn send_command(&self, command: CommandLong) -> Result<(), LinkError> {
        debug!(
            command = command.command,
            params = ?command.params,
            "command sent"
        );
        Ok(())
    }
}

fn millis(t: Duration) -> u32 {
    u32::try_from(t.as_millis()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> SimulationConfig {
        SimulationConfig {
            sample_interval: Duration::from_millis(1),
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn test_trajectory_is_deterministic() {
        let a = SimulatedLink::new(fast());
        let b = a.clone();
        let t = Duration::from_secs(7);
        assert_eq!(a.position_at(t), b.position_at(t));
        assert_eq!(a.attitude_at(t), b.attitude_at(t));
    }

    #[test]
    fn test_trajectory_stays_on_circle() {
        let link = SimulatedLink::new(fast());
        for secs in [0, 5, 17, 42] {
            let p = link.position_at(Duration::from_secs(secs));
            let r = p.x.hypot(p.y);
            assert!((r - 20.0).abs() < 1e-9, "radius {r} at {secs}s");
            assert!((-12.0..=-8.0).contains(&p.z));
        }
        let yaw = link.attitude_at(Duration::from_secs(30)).yaw;
        assert!((-std::f64::consts::PI..=std::f64::consts::PI).contains(&yaw));
    }

    #[test]
    fn test_connected_link_delivers_samples() {
        let link = SimulatedLink::new(fast());
        assert!(link.is_connected());
        assert!(link.recv_heartbeat(Duration::from_millis(10)).unwrap().is_some());
        assert!(link.recv_attitude(Duration::from_millis(10)).unwrap().is_some());
        assert!(link.recv_position(Duration::from_millis(10)).unwrap().is_some());
    }

    #[test]
    fn test_disconnected_link_goes_silent() {
        let link = SimulatedLink::new(SimulationConfig {
            disconnect_after: Some(Duration::ZERO),
            ..fast()
        });
        assert!(!link.is_connected());
        assert!(link.recv_heartbeat(Duration::from_millis(1)).unwrap().is_none());
        assert!(link.recv_position(Duration::from_millis(1)).unwrap().is_none());
    }
}
