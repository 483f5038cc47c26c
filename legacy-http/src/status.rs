use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::Client;

/// Machine state as reported by the status endpoint. Fields the firmware
/// doesn't report for the mounted tool head are absent.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// `IDLE`, `RUNNING`, `PAUSED`, or `STOPPED`.
    pub status: Option<String>,
    /// Tool head identifier, e.g. `TOOLHEAD_3DPRINTING_1`.
    pub tool_head: Option<String>,
    /// Whether all axes are homed.
    pub homed: Option<bool>,
    /// X position in mm.
    pub x: Option<f64>,
    /// Y position in mm.
    pub y: Option<f64>,
    /// Z position in mm.
    pub z: Option<f64>,
    /// B rotation in degrees.
    pub b: Option<f64>,
    /// Work origin X offset.
    pub offset_x: Option<f64>,
    /// Work origin Y offset.
    pub offset_y: Option<f64>,
    /// Work origin Z offset.
    pub offset_z: Option<f64>,
    /// Nozzle temperature in Celsius.
    pub nozzle_temperature: Option<f64>,
    /// Nozzle target temperature in Celsius.
    pub nozzle_target_temperature: Option<f64>,
    /// Bed temperature in Celsius.
    pub heated_bed_temperature: Option<f64>,
    /// Bed target temperature in Celsius.
    pub heated_bed_target_temperature: Option<f64>,
    /// Filament runout sensor.
    pub is_filament_out: Option<bool>,
    /// Enclosure door sensor.
    pub is_enclosure_door_open: Option<bool>,
    /// Work speed override in percent.
    pub work_speed: Option<u32>,
    /// Laser power in percent.
    pub laser_power: Option<f64>,
    /// Spindle speed in RPM.
    pub spindle_speed: Option<f64>,
    /// Job progress, `0.0..=1.0`.
    pub progress: Option<f64>,
    /// Seconds since the job started.
    pub elapsed_time: Option<u64>,
    /// Estimated seconds remaining.
    pub remaining_time: Option<u64>,
    /// Machine series, e.g. `A350`.
    pub series: Option<String>,
}

impl Client {
    /// Poll the machine state.
    ///
    /// The machine answers `204 No Content` until the user has approved the
    /// connection on the touch screen; that is returned as an empty status.
    pub async fn status(&self) -> Result<Status> {
        tracing::trace!(base = self.url_base, "requesting status");
        let resp = self
            .http
            .get(format!("{}/status", self.url_base))
            .query(&[("token", self.token.as_str())])
            .send()
            .await?
            .error_for_status()?;

        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(Status::default());
        }
        Ok(resp.json().await?)
    }
}
