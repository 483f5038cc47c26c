//! Decoded shapes of responses and subscription pushes.

use parse_display::Display;
use serde::{Deserialize, Serialize};

use crate::{payload::PayloadReader, DecodeError, Packet};

/// Linear and rotary axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[display(style = "UPPERCASE")]
pub enum Axis {
    /// X.
    X,
    /// Y.
    Y,
    /// Z.
    Z,
    /// Rotary B.
    B,
}

impl Axis {
    /// Wire id of the axis.
    pub fn id(self) -> u8 {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
            Axis::B => 3,
        }
    }

    fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Axis::X),
            1 => Some(Axis::Y),
            2 => Some(Axis::Z),
            3 => Some(Axis::B),
            _ => None,
        }
    }
}

/// Position in millimetres (degrees for B).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// X position.
    pub x: f64,
    /// Y position.
    pub y: f64,
    /// Z position.
    pub z: f64,
    /// B rotation.
    pub b: f64,
}

impl Coordinates {
    fn set(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
            Axis::B => self.b = value,
        }
    }

    /// Read `count` followed by `(axis u8, micrometres i32)` pairs. Unknown
    /// axis ids are skipped.
    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, DecodeError> {
        let mut coordinates = Self::default();
        let count = reader.u8()?;
        for _ in 0..count {
            let axis = reader.u8()?;
            let value = reader.micros()?;
            if let Some(axis) = Axis::from_id(axis) {
                coordinates.set(axis, value);
            }
        }
        Ok(coordinates)
    }
}

/// Which frame coordinates are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[display(style = "snake_case")]
pub enum CoordinateSystem {
    /// Machine coordinates.
    Machine,
    /// Workspace coordinates relative to the work origin.
    Workspace,
}

impl CoordinateSystem {
    pub(crate) fn id(self) -> u8 {
        match self {
            CoordinateSystem::Machine => 0,
            CoordinateSystem::Workspace => 1,
        }
    }

    fn from_id(id: u8) -> Self {
        if id == 0 {
            CoordinateSystem::Machine
        } else {
            CoordinateSystem::Workspace
        }
    }
}

/// Response to `COORDINATE_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinateInfo {
    /// All axes homed.
    pub is_homed: bool,
    /// Active coordinate frame.
    pub coordinate_system: CoordinateSystem,
    /// Whether a work origin offset is set.
    pub is_origin_offset: bool,
    /// Current position.
    pub current: Coordinates,
    /// Work origin offset.
    pub origin_offset: Coordinates,
}

impl CoordinateInfo {
    /// Decode from a payload whose result byte was already consumed.
    pub fn read(reader: &mut PayloadReader<'_>) -> Result<Self, DecodeError> {
        // The device reports 0 when homed.
        let is_homed = reader.u8()? == 0;
        let coordinate_system = CoordinateSystem::from_id(reader.u8()?);
        let is_origin_offset = reader.bool()?;
        let current = Coordinates::read(reader)?;
        let origin_offset = Coordinates::read(reader)?;
        Ok(Self {
            is_homed,
            coordinate_system,
            is_origin_offset,
            current,
            origin_offset,
        })
    }
}

/// Machine series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum SeriesModel {
    /// 160 mm class.
    #[display("A150")]
    A150,
    /// 230 mm class.
    #[display("A250")]
    A250,
    /// 320 mm class.
    #[display("A350")]
    A350,
    /// 400 mm class.
    #[display("A400")]
    A400,
    /// Dual-extruder IDEX printer.
    #[display("J1")]
    J1,
    /// Laser-only machine.
    #[display("Ray")]
    Ray,
    /// Not in our table.
    #[display("unknown({0})")]
    Unknown(u8),
}

impl SeriesModel {
    fn from_id(id: u8) -> Self {
        match id {
            0 => Self::A150,
            1 => Self::A250,
            2 => Self::A350,
            3 => Self::A400,
            4 => Self::J1,
            5 => Self::Ray,
            other => Self::Unknown(other),
        }
    }
}

/// Response to `MACHINE_INFO`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    /// Machine series.
    pub series: SeriesModel,
    /// Hardware revision.
    pub hardware_version: u8,
    /// Serial number.
    pub serial_number: String,
    /// Controller firmware version.
    pub firmware_version: String,
}

impl MachineInfo {
    /// Decode from a payload whose result byte was already consumed.
    pub fn read(reader: &mut PayloadReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            series: SeriesModel::from_id(reader.u8()?),
            hardware_version: reader.u8()?,
            serial_number: reader.string()?,
            firmware_version: reader.string()?,
        })
    }
}

/// Machine status carried by the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[display(style = "snake_case")]
pub enum MachineStatus {
    /// Nothing running.
    Idle,
    /// Job starting.
    Starting,
    /// Job running.
    Running,
    /// Pause requested.
    Pausing,
    /// Job paused.
    Paused,
    /// Stop requested.
    Stopping,
    /// Job stopped.
    Stopped,
    /// Job finishing.
    Finishing,
    /// Job finished.
    Completed,
    /// Recovering after power loss.
    Recovering,
    /// Resuming.
    Resuming,
    /// Not in our table.
    #[display("unknown")]
    Unknown,
}

impl MachineStatus {
    fn from_id(id: u8) -> Self {
        match id {
            0 => Self::Idle,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Pausing,
            4 => Self::Paused,
            5 => Self::Stopping,
            6 => Self::Stopped,
            7 => Self::Finishing,
            8 => Self::Completed,
            9 => Self::Recovering,
            10 => Self::Resuming,
            _ => Self::Unknown,
        }
    }
}

/// Heartbeat push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Current machine status.
    pub status: MachineStatus,
}

impl Heartbeat {
    /// Decode a heartbeat push.
    pub fn decode(packet: &Packet) -> Result<Self, DecodeError> {
        let mut reader = PayloadReader::new(&packet.data);
        let _result = reader.u8()?;
        Ok(Self {
            status: MachineStatus::from_id(reader.u8()?),
        })
    }
}

/// Current and target temperature of one heater.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeaterReading {
    /// Index of the nozzle or bed zone.
    pub index: u8,
    /// Measured temperature in Celsius.
    pub current: f64,
    /// Target temperature in Celsius.
    pub target: f64,
}

/// Extruder push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtruderInfo {
    /// Module key of the print head.
    pub key: u8,
    /// One reading per nozzle.
    pub nozzles: Vec<HeaterReading>,
    /// Filament presence per nozzle, same order as `nozzles`.
    pub filament_present: Vec<bool>,
}

impl ExtruderInfo {
    /// Decode an extruder push.
    pub fn decode(packet: &Packet) -> Result<Self, DecodeError> {
        let mut reader = PayloadReader::new(&packet.data);
        let _result = reader.u8()?;
        let key = reader.u8()?;
        let count = reader.u8()?;
        let mut nozzles = Vec::with_capacity(count as usize);
        let mut filament_present = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let index = reader.u8()?;
            filament_present.push(reader.bool()?);
            let current = f64::from(reader.i32()?) / 1000.0;
            let target = f64::from(reader.i32()?) / 1000.0;
            nozzles.push(HeaterReading { index, current, target });
        }
        Ok(Self {
            key,
            nozzles,
            filament_present,
        })
    }
}

/// Heated bed push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BedInfo {
    /// Module key of the bed.
    pub key: u8,
    /// One reading per zone.
    pub zones: Vec<HeaterReading>,
}

impl BedInfo {
    /// Decode a bed push.
    pub fn decode(packet: &Packet) -> Result<Self, DecodeError> {
        let mut reader = PayloadReader::new(&packet.data);
        let _result = reader.u8()?;
        let key = reader.u8()?;
        let count = reader.u8()?;
        let zones = (0..count)
            .map(|_| {
                Ok(HeaterReading {
                    index: reader.u8()?,
                    current: f64::from(reader.i32()?) / 1000.0,
                    target: f64::from(reader.i32()?) / 1000.0,
                })
            })
            .collect::<Result<_, DecodeError>>()?;
        Ok(Self { key, zones })
    }
}

/// Laser head push.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LaserInfo {
    /// Module key of the laser.
    pub key: u8,
    /// Power in percent.
    pub power: u8,
    /// Whether the beam is on.
    pub enabled: bool,
}

impl LaserInfo {
    /// Decode a laser push.
    pub fn decode(packet: &Packet) -> Result<Self, DecodeError> {
        let mut reader = PayloadReader::new(&packet.data);
        let _result = reader.u8()?;
        Ok(Self {
            key: reader.u8()?,
            power: reader.u8()?,
            enabled: reader.bool()?,
        })
    }
}

/// CNC head push.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CncInfo {
    /// Module key of the spindle.
    pub key: u8,
    /// Spindle speed in RPM.
    pub rpm: u32,
    /// Spindle power in percent.
    pub power: u8,
}

impl CncInfo {
    /// Decode a CNC push.
    pub fn decode(packet: &Packet) -> Result<Self, DecodeError> {
        let mut reader = PayloadReader::new(&packet.data);
        let _result = reader.u8()?;
        Ok(Self {
            key: reader.u8()?,
            rpm: reader.u32()?,
            power: reader.u8()?,
        })
    }
}

/// Job progress push.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrintProgress {
    /// Fraction complete, `0.0..=1.0`.
    pub progress: f64,
    /// Seconds since the job started.
    pub elapsed_secs: u32,
    /// Estimated seconds remaining.
    pub remaining_secs: u32,
}

impl PrintProgress {
    /// Decode a progress push. Progress is sent in hundredths of a percent.
    pub fn decode(packet: &Packet) -> Result<Self, DecodeError> {
        let mut reader = PayloadReader::new(&packet.data);
        let _result = reader.u8()?;
        Ok(Self {
            progress: f64::from(reader.u16()?.min(10_000)) / 10_000.0,
            elapsed_secs: reader.u32()?,
            remaining_secs: reader.u32()?,
        })
    }
}
