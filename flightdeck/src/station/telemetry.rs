//! Telemetry: pairs attitude and position samples into one snapshot.

use std::fmt;
use std::time::Duration;

use minstant::Instant;
use serde::{Deserialize, Serialize};
use type_hash::TypeHash;

use crate::channel::ChannelError;
use crate::trace::{debug, warn};
use crate::worker::EntryPoint;

use super::link::{Attitude, LinkError, LocalPosition, VehicleLink};

/// Latest attitude and position of the vehicle. A field is `None` until a
/// sample carrying it has been received.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TypeHash)]
pub struct TelemetryData {
    /// Milliseconds since vehicle boot.
    pub time_since_boot: Option<u32>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub x_velocity: Option<f64>,
    pub y_velocity: Option<f64>,
    pub z_velocity: Option<f64>,
    pub roll: Option<f64>,
    pub pitch: Option<f64>,
    pub yaw: Option<f64>,
    pub roll_speed: Option<f64>,
    pub pitch_speed: Option<f64>,
    pub yaw_speed: Option<f64>,
}

impl TelemetryData {
    pub fn apply_attitude(&mut self, a: &Attitude) {
        self.time_since_boot = Some(a.time_boot_ms);
        self.roll = Some(a.roll);
        self.pitch = Some(a.pitch);
        self.yaw = Some(a.yaw);
        self.roll_speed = Some(a.roll_speed);
        self.pitch_speed = Some(a.pitch_speed);
        self.yaw_speed = Some(a.yaw_speed);
    }

    pub fn apply_position(&mut self, p: &LocalPosition) {
        self.time_since_boot = Some(p.time_boot_ms);
        self.x = Some(p.x);
        self.y = Some(p.y);
        self.z = Some(p.z);
        self.x_velocity = Some(p.vx);
        self.y_velocity = Some(p.vy);
        self.z_velocity = Some(p.vz);
    }
}

impl fmt::Display for TelemetryData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt<T: fmt::Display>(v: Option<T>) -> String {
            v.map_or_else(|| "-".to_string(), |v| v.to_string())
        }
        write!(
            f,
            "t={}ms pos=({}, {}, {}) vel=({}, {}, {}) att=({}, {}, {})",
            opt(self.time_since_boot),
            opt(self.x),
            opt(self.y),
            opt(self.z),
            opt(self.x_velocity),
            opt(self.y_velocity),
            opt(self.z_velocity),
            opt(self.roll),
            opt(self.pitch),
            opt(self.yaw),
        )
    }
}

/// Waits up to `window` for both an attitude and a position sample.
///
/// Returns `None` if either kind is missing when the window closes.
///
/// # Errors
///
/// Propagates link failures.
pub fn collect<L: VehicleLink>(
    link: &L,
    window: Duration,
) -> Result<Option<TelemetryData>, LinkError> {
    let start = Instant::now();
    let mut data = TelemetryData::default();
    let (mut have_attitude, mut have_position) = (false, false);

    loop {
        let left = window.saturating_sub(start.elapsed());
        if left.is_zero() {
            debug!(have_attitude, have_position, "telemetry window closed");
            return Ok(None);
        }
        if !have_attitude && let Some(a) = link.recv_attitude(left)? {
            data.apply_attitude(&a);
            have_attitude = true;
        }
        let left = window.saturating_sub(start.elapsed());
        if !have_position && let Some(p) = link.recv_position(left)? {
            data.apply_position(&p);
            have_position = true;
        }
        if have_attitude && have_position {
            return Ok(Some(data));
        }
    }
}

/// Arguments of the telemetry worker.
#[derive(Debug, Clone)]
pub struct TelemetryArgs<L> {
    pub link: L,
    /// How long to wait for a full attitude and position pair.
    pub window: Duration,
    /// Timeout of each output `put`.
    pub put_timeout: Duration,
}

/// Worker that publishes a [`TelemetryData`] snapshot on output 0 whenever
/// both samples arrive within the window.
pub fn telemetry_worker<L: VehicleLink + 'static>() -> EntryPoint<TelemetryArgs<L>> {
    EntryPoint::new("telemetry", |args: &TelemetryArgs<L>, ports, exit| {
        let output = ports.output::<TelemetryData>(0)?;
        while !exit.is_raised() {
            let Some(data) = collect(&args.link, args.window)? else {
                warn!("no complete telemetry within window");
                continue;
            };
            match output.put(&data, args.put_timeout) {
                Ok(()) => {
                    debug!(%data, "telemetry published");
                }
                Err(ChannelError::Full) => {
                    debug!("telemetry queue full; sample dropped");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    })
    .output::<TelemetryData>()
}
