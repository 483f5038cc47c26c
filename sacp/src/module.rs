//! Pluggable hardware modules as reported by `MODULE_INFO`.

use parse_display::Display;
use serde::{Deserialize, Serialize};

use crate::{payload::PayloadReader, DecodeError};

/// Broad class of the mounted tool head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[display(style = "snake_case")]
pub enum HeadType {
    /// Fused-deposition print head.
    Printing,
    /// Laser engraving/cutting head.
    Laser,
    /// CNC spindle.
    Cnc,
}

/// Known module ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// Single-nozzle print head.
    SingleExtruder,
    /// Dual-nozzle print head.
    DualExtruder,
    /// 1.6 W laser.
    Laser1600mW,
    /// 10 W laser.
    Laser10W,
    /// 20 W laser.
    Laser20W,
    /// 40 W laser.
    Laser40W,
    /// 50 W CNC spindle.
    Cnc50W,
    /// 200 W CNC spindle.
    Cnc200W,
    /// Enclosure.
    Enclosure,
    /// Rotary module.
    Rotary,
    /// Air purifier.
    AirPurifier,
    /// Emergency stop button.
    EmergencyStop,
    /// Anything we don't recognise yet.
    Unknown(u16),
}

impl ModuleKind {
    /// Map a wire module id to a kind.
    pub fn from_id(id: u16) -> Self {
        match id {
            0 => Self::SingleExtruder,
            1 => Self::Cnc50W,
            2 => Self::Laser1600mW,
            5 | 16 => Self::Enclosure,
            6 => Self::Rotary,
            7 => Self::AirPurifier,
            8 => Self::EmergencyStop,
            13 => Self::DualExtruder,
            14 => Self::Laser10W,
            15 => Self::Cnc200W,
            19 => Self::Laser20W,
            20 => Self::Laser40W,
            other => Self::Unknown(other),
        }
    }

    /// The head type, if this module is a tool head.
    pub fn head_type(&self) -> Option<HeadType> {
        match self {
            Self::SingleExtruder | Self::DualExtruder => Some(HeadType::Printing),
            Self::Laser1600mW | Self::Laser10W | Self::Laser20W | Self::Laser40W => Some(HeadType::Laser),
            Self::Cnc50W | Self::Cnc200W => Some(HeadType::Cnc),
            _ => None,
        }
    }
}

/// One installed module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Routing key used to address this module in later commands.
    pub key: u8,
    /// Raw module id.
    pub module_id: u16,
    /// Index among modules of the same id.
    pub module_index: u8,
    /// Module state byte.
    pub state: u8,
    /// Serial number.
    pub serial_number: u32,
    /// Hardware revision.
    pub hardware_version: u8,
    /// Firmware version string.
    pub firmware_version: String,
}

impl ModuleInfo {
    /// What kind of module this is.
    pub fn kind(&self) -> ModuleKind {
        ModuleKind::from_id(self.module_id)
    }

    pub(crate) fn read(reader: &mut PayloadReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            key: reader.u8()?,
            module_id: reader.u16()?,
            module_index: reader.u8()?,
            state: reader.u8()?,
            serial_number: reader.u32()?,
            hardware_version: reader.u8()?,
            firmware_version: reader.string()?,
        })
    }

    /// Decode a module list: a count byte followed by that many entries.
    pub fn read_list(reader: &mut PayloadReader<'_>) -> Result<Vec<Self>, DecodeError> {
        let count = reader.u8()?;
        (0..count).map(|_| Self::read(reader)).collect()
    }
}

/// The first tool head in a module list.
pub fn tool_head(modules: &[ModuleInfo]) -> Option<&ModuleInfo> {
    modules.iter().find(|m| m.kind().head_type().is_some())
}
