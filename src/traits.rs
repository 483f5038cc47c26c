//! Common traits every session implements, whatever protocol it speaks.

use std::{fmt::Debug, future::Future, path::Path};

use serde::{Deserialize, Serialize};

use crate::{SessionState, TelemetrySnapshot};

/// A heater on the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Heater {
    /// Nozzle `n` of the print head.
    Nozzle(u8),
    /// Heated bed zone `n`.
    Bed(u8),
}

/// Control is the set of direct operations every live session supports,
/// independent of the wire protocol underneath it.
pub trait Control {
    /// Error type returned by this trait.
    type Error: Debug;

    /// Current lifecycle state.
    fn state(&self) -> SessionState;

    /// Latest telemetry. Never blocks on the machine.
    fn snapshot(&self) -> TelemetrySnapshot;

    /// Close the session: stop background work, say goodbye to the
    /// machine if it is still listening, and release the transport.
    fn close(&self) -> impl Future<Output = Result<(), Self::Error>>;

    /// Home all axes.
    fn home(&self) -> impl Future<Output = Result<(), Self::Error>>;

    /// Move relative to the current position, in millimetres.
    fn jog(&self, x: f64, y: f64, z: f64, feed_rate: u16) -> impl Future<Output = Result<(), Self::Error>>;

    /// Set a heater's target temperature in degrees Celsius. `0` turns it off.
    fn set_temperature(&self, heater: Heater, celsius: u16) -> impl Future<Output = Result<(), Self::Error>>;

    /// Set laser power or spindle power, in percent, for whatever tool head
    /// is mounted.
    fn set_tool_power(&self, percent: u8) -> impl Future<Output = Result<(), Self::Error>>;

    /// Run one raw G-code line and return what the machine said.
    fn execute_gcode(&self, line: &str) -> impl Future<Output = Result<String, Self::Error>>;
}

/// ControlJob is implemented by sessions that can run whole jobs.
pub trait ControlJob {
    /// Error type returned by this trait.
    type Error: Debug;

    /// Transfer the file at `path` to the machine and start it.
    fn start_job(&self, path: &Path) -> impl Future<Output = Result<(), Self::Error>>;

    /// Pause the running job.
    fn pause(&self) -> impl Future<Output = Result<(), Self::Error>>;

    /// Resume a paused job.
    fn resume(&self) -> impl Future<Output = Result<(), Self::Error>>;

    /// Stop the current job.
    fn stop(&self) -> impl Future<Output = Result<(), Self::Error>>;

    /// Store the file at `path` on the machine without starting it.
    fn upload_file(&self, path: &Path) -> impl Future<Output = Result<(), Self::Error>>;
}
