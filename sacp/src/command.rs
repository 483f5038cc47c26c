//! Command pairs and peer identifiers.
//!
//! Every SACP operation is addressed by a `(command set, command id)` pair.
//! The constants below are the pairs this crate speaks; anything else can
//! still be sent through [crate::Dispatcher::send] with a hand-built pair.

use parse_display::Display;
use serde::{Deserialize, Serialize};

/// The `(main, sub)` tuple identifying an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("0x{main:02x}/0x{sub:02x}")]
pub struct CommandPair {
    /// Command set.
    pub main: u8,
    /// Command id within the set.
    pub sub: u8,
}

impl CommandPair {
    /// Build a pair from its two bytes.
    pub const fn new(main: u8, sub: u8) -> Self {
        Self { main, sub }
    }

    /// Start a periodic push of another command pair.
    pub const SUBSCRIBE: Self = Self::new(0x01, 0x00);
    /// Stop a periodic push.
    pub const UNSUBSCRIBE: Self = Self::new(0x01, 0x01);
    /// Run a raw line of G-code on the controller.
    pub const EXECUTE_GCODE: Self = Self::new(0x01, 0x02);
    /// Open a session (client name, keep-alive, token).
    pub const CONNECT: Self = Self::new(0x01, 0x05);
    /// Close a session.
    pub const DISCONNECT: Self = Self::new(0x01, 0x06);
    /// List installed modules.
    pub const MODULE_INFO: Self = Self::new(0x01, 0x20);
    /// Machine model, serial, and firmware.
    pub const MACHINE_INFO: Self = Self::new(0x01, 0x21);
    /// Current coordinates, origin offset, and homing state.
    pub const COORDINATE_INFO: Self = Self::new(0x01, 0x30);
    /// Select machine or workspace coordinate frame.
    pub const SET_COORDINATE_SYSTEM: Self = Self::new(0x01, 0x31);
    /// Set the workspace origin.
    pub const SET_WORK_ORIGIN: Self = Self::new(0x01, 0x32);
    /// Absolute or relative linear move.
    pub const MOVE: Self = Self::new(0x01, 0x34);
    /// Home axes.
    pub const HOME: Self = Self::new(0x01, 0x35);
    /// Periodic machine status push.
    pub const HEARTBEAT: Self = Self::new(0x01, 0xa0);

    /// Set nozzle target temperature.
    pub const SET_NOZZLE_TEMPERATURE: Self = Self::new(0x10, 0x02);
    /// Extruder telemetry push.
    pub const EXTRUDER_INFO: Self = Self::new(0x10, 0xa0);

    /// Set spindle speed in RPM.
    pub const SET_SPINDLE_SPEED: Self = Self::new(0x11, 0x01);
    /// Set spindle power in percent.
    pub const SET_SPINDLE_POWER: Self = Self::new(0x11, 0x02);
    /// Switch spindle on or off.
    pub const SWITCH_SPINDLE: Self = Self::new(0x11, 0x03);
    /// CNC head telemetry push.
    pub const CNC_INFO: Self = Self::new(0x11, 0xa0);

    /// Set laser power in percent.
    pub const SET_LASER_POWER: Self = Self::new(0x12, 0x02);
    /// Take a calibration photo.
    pub const TAKE_PHOTO: Self = Self::new(0x12, 0x0a);
    /// Fetch a previously taken photo.
    pub const FETCH_PHOTO: Self = Self::new(0x12, 0x0b);
    /// Read the camera calibration matrix.
    pub const GET_CAMERA_CALIBRATION: Self = Self::new(0x12, 0x0c);
    /// Write the camera calibration matrix.
    pub const SET_CAMERA_CALIBRATION: Self = Self::new(0x12, 0x0d);
    /// Laser head telemetry push.
    pub const LASER_INFO: Self = Self::new(0x12, 0xa0);

    /// Set heated bed target temperature.
    pub const SET_BED_TEMPERATURE: Self = Self::new(0x14, 0x02);
    /// Heated bed telemetry push.
    pub const BED_INFO: Self = Self::new(0x14, 0xa0);

    /// Start printing an uploaded file.
    pub const START_PRINT: Self = Self::new(0xac, 0x03);
    /// Pause the running job.
    pub const PAUSE_PRINT: Self = Self::new(0xac, 0x04);
    /// Resume a paused job.
    pub const RESUME_PRINT: Self = Self::new(0xac, 0x05);
    /// Stop the running job.
    pub const STOP_PRINT: Self = Self::new(0xac, 0x06);
    /// Override work speed in percent.
    pub const SET_WORK_SPEED: Self = Self::new(0xac, 0x0c);
    /// Job progress push.
    pub const PRINT_PROGRESS: Self = Self::new(0xac, 0xa0);

    /// Host announces an upload.
    pub const UPLOAD_START: Self = Self::new(0xb0, 0x00);
    /// Device pulls one chunk of an upload.
    pub const UPLOAD_CHUNK: Self = Self::new(0xb0, 0x01);
    /// Device reports the upload outcome.
    pub const UPLOAD_RESULT: Self = Self::new(0xb0, 0x02);
}

/// Well-known peer ids carried in the sender/receiver header bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerId;

impl PeerId {
    /// The host application (us).
    pub const HOST: u8 = 0;
    /// The touch screen.
    pub const SCREEN: u8 = 1;
    /// The motion controller.
    pub const CONTROLLER: u8 = 2;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(CommandPair::HEARTBEAT.to_string(), "0x01/0xa0");
        assert_eq!(CommandPair::new(0xb0, 0x02).to_string(), "0xb0/0x02");
    }
}
