//! Decides on altitude and heading corrections from telemetry.

use std::time::Duration;

use crate::channel::ChannelError;
use crate::trace::{debug, info};
use crate::worker::EntryPoint;

use super::link::{CMD_CONDITION_CHANGE_ALT, CMD_CONDITION_YAW, CommandLong, LinkError, VehicleLink};
use super::telemetry::TelemetryData;

/// Altitude error, in metres, that triggers a climb or descent.
pub const ALTITUDE_TOLERANCE: f64 = 0.5;
/// Heading error, in degrees, that triggers a turn.
pub const YAW_TOLERANCE_DEG: f64 = 5.0;
/// Turn rate requested with a yaw command, degrees per second.
const YAW_RATE_DEG: f32 = 5.0;

/// A point in the local NED frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// A correction picked by [`Command::decide`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Metres to climb (positive) or descend.
    ChangeAltitude { delta: f64, command: CommandLong },
    /// Degrees to turn, counter-clockwise positive, in `[-180, 180)`.
    ChangeYaw { delta: f64, command: CommandLong },
}

impl Decision {
    /// The status line reported to the orchestrator.
    #[must_use]
    pub fn report(&self) -> String {
        match self {
            Self::ChangeAltitude { delta, .. } => format!("CHANGE ALTITUDE: {delta}"),
            Self::ChangeYaw { delta, .. } => format!("CHANGE YAW: {delta}"),
        }
    }

    #[must_use]
    pub fn command(&self) -> CommandLong {
        match self {
            Self::ChangeAltitude { command, .. } | Self::ChangeYaw { command, .. } => *command,
        }
    }
}

/// Steers the vehicle towards a fixed target.
///
/// Altitude is corrected first; the heading only once the altitude is
/// within tolerance.
#[derive(Debug, Clone)]
pub struct Command {
    target: Position,
    samples: u32,
    velocity_sum: Position,
}

impl Command {
    #[must_use]
    pub fn new(target: Position) -> Self {
        Self {
            target,
            samples: 0,
            velocity_sum: Position::default(),
        }
    }

    /// Mean velocity over every sample seen so far.
    #[must_use]
    pub fn average_velocity(&self) -> Option<Position> {
        (self.samples > 0).then(|| {
            let n = f64::from(self.samples);
            Position::new(
                self.velocity_sum.x / n,
                self.velocity_sum.y / n,
                self.velocity_sum.z / n,
            )
        })
    }

    /// Picks a correction for one telemetry snapshot, if any is needed.
    ///
    /// Snapshots missing position or yaw produce no decision.
    pub fn decide(&mut self, data: &TelemetryData) -> Option<Decision> {
        if let (Some(vx), Some(vy), Some(vz)) = (data.x_velocity, data.y_velocity, data.z_velocity) {
            self.samples += 1;
            self.velocity_sum.x += vx;
            self.velocity_sum.y += vy;
            self.velocity_sum.z += vz;
            if let Some(avg) = self.average_velocity() {
                info!(x = avg.x, y = avg.y, z = avg.z, "average velocity");
            }
        }

        let (x, y, z, yaw) = (data.x?, data.y?, data.z?, data.yaw?);

        let delta_z = self.target.z - z;
        if delta_z.abs() >= ALTITUDE_TOLERANCE {
            debug!(delta_z, "altitude off target");
            let command = CommandLong::new(
                CMD_CONDITION_CHANGE_ALT,
                [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, self.target.z as f32],
            );
            return Some(Decision::ChangeAltitude {
                delta: delta_z,
                command,
            });
        }

        let bearing = (self.target.y - y).atan2(self.target.x - x).to_degrees();
        let delta_yaw = normalize_degrees(bearing - yaw.to_degrees());
        if delta_yaw.abs() > YAW_TOLERANCE_DEG {
            debug!(delta_yaw, "target off heading");
            let direction = if delta_yaw >= 0.0 { 1.0 } else { -1.0 };
            let command = CommandLong::new(
                CMD_CONDITION_YAW,
                [delta_yaw.abs() as f32, YAW_RATE_DEG, direction, 1.0, 0.0, 0.0, 0.0],
            );
            return Some(Decision::ChangeYaw {
                delta: delta_yaw,
                command,
            });
        }
        None
    }
}

/// Wraps an angle in degrees into `[-180, 180)`.
#[must_use]
pub fn normalize_degrees(deg: f64) -> f64 {
    (deg + 180.0).rem_euclid(360.0) - 180.0
}

/// Arguments of the command worker.
#[derive(Debug, Clone)]
pub struct CommandArgs<L> {
    pub link: L,
    pub target: Position,
    /// Timeout of each input `get` and output `put`.
    pub poll_timeout: Duration,
}

/// Worker reading [`TelemetryData`] on input 0, sending corrections over the
/// link and reporting each one as a string on output 0.
pub fn command_worker<L: VehicleLink + 'static>() -> EntryPoint<CommandArgs<L>> {
    EntryPoint::new("command", |args: &CommandArgs<L>, ports, exit| {
        let input = ports.input::<TelemetryData>(0)?;
        let output = ports.output::<String>(0)?;
        let mut command = Command::new(args.target);

        while !exit.is_raised() {
            let data = match input.get(args.poll_timeout) {
                Ok(data) => data,
                Err(ChannelError::Empty) => continue,
                Err(err) => return Err(err.into()),
            };
            let Some(decision) = command.decide(&data) else {
                continue;
            };
            send(&args.link, &decision)?;
            match output.put(&decision.report(), args.poll_timeout) {
                Ok(()) | Err(ChannelError::Full) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    })
    .input::<TelemetryData>()
    .output::<String>()
}

fn send<L: VehicleLink>(link: &L, decision: &Decision) -> Result<(), LinkError> {
    debug!(report = %decision.report(), "sending correction");
    link.send_command(decision.command())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(x: f64, y: f64, z: f64, yaw_deg: f64) -> TelemetryData {
        TelemetryData {
            x: Some(x),
            y: Some(y),
            z: Some(z),
            yaw: Some(yaw_deg.to_radians()),
            x_velocity: Some(1.0),
            y_velocity: Some(0.0),
            z_velocity: Some(0.0),
            ..TelemetryData::default()
        }
    }

    #[test]
    fn test_altitude_corrected_first() {
        let mut cmd = Command::new(Position::new(10.0, 0.0, 0.0));
        let decision = cmd.decide(&at(0.0, 0.0, -2.0, 90.0)).unwrap();
        assert_eq!(decision.report(), "CHANGE ALTITUDE: 2");
        assert_eq!(decision.command().command, CMD_CONDITION_CHANGE_ALT);
        assert_eq!(decision.command().target_system, 1);
    }

    #[test]
    fn test_small_altitude_error_ignored() {
        let mut cmd = Command::new(Position::new(10.0, 0.0, 0.0));
        assert_eq!(cmd.decide(&at(0.0, 0.0, 0.4, 0.0)), None);
    }

    #[test]
    fn test_yaw_towards_target() {
        let mut cmd = Command::new(Position::new(0.0, 10.0, 0.0));
        let decision = cmd.decide(&at(0.0, 0.0, 0.0, 0.0)).unwrap();
        match decision {
            Decision::ChangeYaw { delta, command } => {
                assert!((delta - 90.0).abs() < 1e-9);
                assert_eq!(command.command, CMD_CONDITION_YAW);
                assert_eq!(command.params[2], 1.0);
                assert_eq!(command.params[3], 1.0);
            }
            other => panic!("expected yaw change, got {other:?}"),
        }
    }

    #[test]
    fn test_yaw_within_tolerance_ignored() {
        let mut cmd = Command::new(Position::new(10.0, 0.0, 0.0));
        assert_eq!(cmd.decide(&at(0.0, 0.0, 0.0, 4.0)), None);
    }

    #[test]
    fn test_turns_the_short_way() {
        let mut cmd = Command::new(Position::new(-10.0, -1.0, 0.0));
        let decision = cmd.decide(&at(0.0, 0.0, 0.0, 170.0)).unwrap();
        let Decision::ChangeYaw { delta, command } = decision else {
            panic!("expected yaw change");
        };
        assert!(delta > 0.0 && delta < 30.0, "delta {delta}");
        assert_eq!(command.params[2], 1.0);
    }

    #[test]
    fn test_incomplete_snapshot_yields_nothing() {
        let mut cmd = Command::new(Position::default());
        assert_eq!(cmd.decide(&TelemetryData::default()), None);
        assert_eq!(cmd.average_velocity(), None);
    }

    #[test]
    fn test_average_velocity() {
        let mut cmd = Command::new(Position::default());
        let mut data = at(0.0, 0.0, 0.0, 0.0);
        cmd.decide(&data);
        data.x_velocity = Some(3.0);
        data.z_velocity = Some(-2.0);
        cmd.decide(&data);
        assert_eq!(cmd.average_velocity(), Some(Position::new(2.0, 0.0, -1.0)));
    }

    #[test]
    fn test_normalize_degrees() {
        assert_eq!(normalize_degrees(190.0), -170.0);
        assert_eq!(normalize_degrees(-190.0), 170.0);
        assert_eq!(normalize_degrees(180.0), -180.0);
        assert_eq!(normalize_degrees(45.0), 45.0);
    }
}
