//! Typed operations over a [Dispatcher].
//!
//! Every method encodes one command pair and its payload, waits for the
//! response, and fails with [crate::Error::Command] unless the leading result byte
//! is `0`. Module keys addressing a particular tool head are the caller's to
//! track; see [crate::module::tool_head].

use std::{path::Path, sync::Arc, time::Duration};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    check_result,
    file_transfer::{self, UploadReport},
    module::ModuleInfo,
    payload::{PayloadReader, PayloadWriter},
    telemetry::{Axis, CoordinateInfo, CoordinateSystem, MachineInfo},
    CommandPair, Dispatcher, Packet, Result,
};

/// How the targets of a move are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveMode {
    /// Targets are positions in the active coordinate frame.
    Absolute,
    /// Targets are offsets from the current position.
    Relative,
}

/// Row-major 3x3 camera calibration matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraCalibration(pub [f32; 9]);

/// The SACP business client.
#[derive(Debug, Clone)]
pub struct Client {
    dispatcher: Arc<Dispatcher>,
}

impl Client {
    /// Wrap a running dispatcher.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// The underlying dispatcher, for subscriptions and raw requests.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    async fn call(&self, command: CommandPair, payload: Bytes) -> Result<Packet> {
        let response = self.dispatcher.send(command, payload).await?;
        check_result(&response)?;
        Ok(response)
    }

    /// Payload after the result byte.
    fn body(response: &Packet) -> PayloadReader<'_> {
        PayloadReader::new(&response.data[1..])
    }

    /// Open a session. The device closes it after `keep_alive` without traffic.
    pub async fn connect(&self, name: &str, keep_alive: Duration, token: &str) -> Result<()> {
        let keep_alive = u16::try_from(keep_alive.as_secs()).unwrap_or(u16::MAX);
        let payload = PayloadWriter::new().string(name).u16(keep_alive).string(token).finish()?;
        self.call(CommandPair::CONNECT, payload).await?;
        Ok(())
    }

    /// Close the session.
    pub async fn disconnect(&self) -> Result<()> {
        self.call(CommandPair::DISCONNECT, Bytes::new()).await?;
        Ok(())
    }

    /// List installed modules.
    pub async fn get_module_info(&self) -> Result<Vec<ModuleInfo>> {
        let response = self.call(CommandPair::MODULE_INFO, Bytes::new()).await?;
        Ok(ModuleInfo::read_list(&mut Self::body(&response))?)
    }

    /// Machine model, serial number, and firmware version.
    pub async fn get_machine_info(&self) -> Result<MachineInfo> {
        let response = self.call(CommandPair::MACHINE_INFO, Bytes::new()).await?;
        Ok(MachineInfo::read(&mut Self::body(&response))?)
    }

    /// Current position, work origin, and homing state.
    pub async fn get_coordinate_info(&self) -> Result<CoordinateInfo> {
        let response = self.call(CommandPair::COORDINATE_INFO, Bytes::new()).await?;
        Ok(CoordinateInfo::read(&mut Self::body(&response))?)
    }

    /// Switch between machine and workspace coordinates.
    pub async fn set_coordinate_system(&self, system: CoordinateSystem) -> Result<()> {
        let payload = PayloadWriter::new().u8(system.id()).finish()?;
        self.call(CommandPair::SET_COORDINATE_SYSTEM, payload).await?;
        Ok(())
    }

    /// Set the work origin for the given axes, in millimetres.
    pub async fn set_work_origin(&self, origin: &[(Axis, f64)]) -> Result<()> {
        let mut payload = PayloadWriter::new();
        write_axes(&mut payload, origin);
        self.call(CommandPair::SET_WORK_ORIGIN, payload.finish()?).await?;
        Ok(())
    }

    /// Move the given axes at `feed_rate` mm/min.
    pub async fn move_axes(&self, mode: MoveMode, feed_rate: u16, targets: &[(Axis, f64)]) -> Result<()> {
        let mut payload = PayloadWriter::new();
        payload
            .u8(match mode {
                MoveMode::Absolute => 0,
                MoveMode::Relative => 1,
            })
            .u16(feed_rate);
        write_axes(&mut payload, targets);
        self.call(CommandPair::MOVE, payload.finish()?).await?;
        Ok(())
    }

    /// Home all axes.
    pub async fn home(&self) -> Result<()> {
        self.call(CommandPair::HOME, Bytes::from_static(&[0])).await?;
        Ok(())
    }

    /// Run one line of G-code and return the controller's reply text.
    pub async fn execute_gcode(&self, line: &str) -> Result<String> {
        let payload = PayloadWriter::new().string(line).finish()?;
        let response = self.call(CommandPair::EXECUTE_GCODE, payload).await?;
        let mut body = Self::body(&response);
        if body.remaining() == 0 {
            return Ok(String::new());
        }
        Ok(body.string()?)
    }

    /// Start printing a file already on the device.
    pub async fn start_print(&self, filename: &str, digest: &str) -> Result<()> {
        let payload = PayloadWriter::new().string(filename).string(digest).finish()?;
        self.call(CommandPair::START_PRINT, payload).await?;
        Ok(())
    }

    /// Pause the running job.
    pub async fn pause(&self) -> Result<()> {
        self.call(CommandPair::PAUSE_PRINT, Bytes::new()).await?;
        Ok(())
    }

    /// Resume a paused job.
    pub async fn resume(&self) -> Result<()> {
        self.call(CommandPair::RESUME_PRINT, Bytes::new()).await?;
        Ok(())
    }

    /// Stop the running job.
    pub async fn stop(&self) -> Result<()> {
        self.call(CommandPair::STOP_PRINT, Bytes::new()).await?;
        Ok(())
    }

    /// Override the work speed, in percent of the sliced speed.
    pub async fn set_work_speed(&self, percent: u16) -> Result<()> {
        let payload = PayloadWriter::new().u16(percent).finish()?;
        self.call(CommandPair::SET_WORK_SPEED, payload).await?;
        Ok(())
    }

    /// Set the target temperature of one nozzle.
    pub async fn set_nozzle_temperature(&self, key: u8, nozzle: u8, celsius: u16) -> Result<()> {
        let payload = PayloadWriter::new().u8(key).u8(nozzle).u16(celsius).finish()?;
        self.call(CommandPair::SET_NOZZLE_TEMPERATURE, payload).await?;
        Ok(())
    }

    /// Set the target temperature of one bed zone.
    pub async fn set_bed_temperature(&self, key: u8, zone: u8, celsius: u16) -> Result<()> {
        let payload = PayloadWriter::new().u8(key).u8(zone).u16(celsius).finish()?;
        self.call(CommandPair::SET_BED_TEMPERATURE, payload).await?;
        Ok(())
    }

    /// Set laser power in percent.
    pub async fn set_laser_power(&self, key: u8, percent: u8) -> Result<()> {
        let payload = PayloadWriter::new().u8(key).u8(percent.min(100)).finish()?;
        self.call(CommandPair::SET_LASER_POWER, payload).await?;
        Ok(())
    }

    /// Set spindle speed in RPM.
    pub async fn set_spindle_speed(&self, key: u8, rpm: u32) -> Result<()> {
        let payload = PayloadWriter::new().u8(key).u32(rpm).finish()?;
        self.call(CommandPair::SET_SPINDLE_SPEED, payload).await?;
        Ok(())
    }

    /// Set spindle power in percent.
    pub async fn set_spindle_power(&self, key: u8, percent: u8) -> Result<()> {
        let payload = PayloadWriter::new().u8(key).u8(percent.min(100)).finish()?;
        self.call(CommandPair::SET_SPINDLE_POWER, payload).await?;
        Ok(())
    }

    /// Turn the spindle on or off.
    pub async fn switch_spindle(&self, key: u8, on: bool) -> Result<()> {
        let payload = PayloadWriter::new().u8(key).bool(on).finish()?;
        self.call(CommandPair::SWITCH_SPINDLE, payload).await?;
        Ok(())
    }

    /// Take a calibration photo at position `index`.
    pub async fn take_photo(&self, index: u8) -> Result<()> {
        let payload = PayloadWriter::new().u8(index).finish()?;
        self.call(CommandPair::TAKE_PHOTO, payload).await?;
        Ok(())
    }

    /// Fetch the JPEG bytes of a photo taken earlier.
    pub async fn fetch_photo(&self, index: u8) -> Result<Bytes> {
        let payload = PayloadWriter::new().u8(index).finish()?;
        let response = self.call(CommandPair::FETCH_PHOTO, payload).await?;
        let photo = Self::body(&response).long_bytes()?;
        Ok(Bytes::copy_from_slice(photo))
    }

    /// Read the camera calibration matrix.
    pub async fn get_camera_calibration(&self) -> Result<CameraCalibration> {
        let response = self.call(CommandPair::GET_CAMERA_CALIBRATION, Bytes::new()).await?;
        let mut body = Self::body(&response);
        let mut matrix = [0f32; 9];
        for value in &mut matrix {
            *value = body.f32()?;
        }
        Ok(CameraCalibration(matrix))
    }

    /// Write the camera calibration matrix.
    pub async fn set_camera_calibration(&self, calibration: &CameraCalibration) -> Result<()> {
        let mut payload = PayloadWriter::new();
        for value in calibration.0 {
            payload.f32(value);
        }
        self.call(CommandPair::SET_CAMERA_CALIBRATION, payload.finish()?).await?;
        Ok(())
    }

    /// Upload a local file under `remote_name`; the device pulls the chunks.
    pub async fn upload_file(&self, path: &Path, remote_name: &str) -> Result<UploadReport> {
        file_transfer::upload(&self.dispatcher, path, remote_name, file_transfer::IDLE_TIMEOUT).await
    }
}

fn write_axes(payload: &mut PayloadWriter, axes: &[(Axis, f64)]) {
    let count = axes.len().min(u8::MAX as usize);
    payload.u8(count as u8);
    for (axis, millimetres) in &axes[..count] {
        payload.u8(axis.id()).micros(*millimetres);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use testresult::TestResult;

    use super::*;
    use crate::{module::ModuleKind, telemetry::SeriesModel, test_device::TestDevice, DispatcherConfig, Error};

    fn connect() -> (Client, TestDevice) {
        let (transport, device) = TestDevice::pair();
        (
            Client::new(Dispatcher::new(transport, DispatcherConfig::default())),
            device,
        )
    }

    #[tokio::test]
    async fn test_home() -> TestResult {
        let (client, mut device) = connect();

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.home().await }
        });
        let request = device.recv().await;
        assert_eq!(request.command, CommandPair::HOME);
        assert_eq!(&request.data[..], &[0]);
        device.reply(&request, vec![0]).await;

        call.await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_gcode_too_long_for_a_frame() -> TestResult {
        let (client, mut device) = connect();

        // Fits the string prefix but not the frame.
        let line = "G".repeat(65_530);
        let result = client.execute_gcode(&line).await;
        assert!(matches!(result, Err(Error::PayloadTooLarge { len: 65_532, .. })));

        let line = "G".repeat(70_000);
        let result = client.execute_gcode(&line).await;
        assert!(matches!(result, Err(Error::PayloadTooLarge { len: 70_000, .. })));

        // Nothing reached the device; the next request is the first it sees.
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.home().await }
        });
        let request = device.recv().await;
        assert_eq!(request.command, CommandPair::HOME);
        device.reply(&request, vec![0]).await;
        call.await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_command_error_leaves_connection_usable() -> TestResult {
        let (client, mut device) = connect();

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.pause().await }
        });
        let request = device.recv().await;
        device.reply(&request, vec![4]).await;
        assert!(matches!(
            call.await?,
            Err(Error::Command {
                command: CommandPair::PAUSE_PRINT,
                result: 4
            })
        ));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.resume().await }
        });
        let request = device.recv().await;
        device.reply(&request, vec![0]).await;
        call.await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_move_payload() -> TestResult {
        let (client, mut device) = connect();

        let call = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .move_axes(MoveMode::Relative, 3000, &[(Axis::X, 10.0), (Axis::Z, -0.5)])
                    .await
            }
        });
        let request = device.recv().await;
        let mut reader = PayloadReader::new(&request.data);
        assert_eq!(reader.u8()?, 1);
        assert_eq!(reader.u16()?, 3000);
        assert_eq!(reader.u8()?, 2);
        assert_eq!((reader.u8()?, reader.i32()?), (0, 10_000));
        assert_eq!((reader.u8()?, reader.i32()?), (2, -500));
        assert_eq!(reader.remaining(), 0);
        device.reply(&request, vec![0]).await;

        call.await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_module_and_machine_info() -> TestResult {
        let (client, mut device) = connect();

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.get_module_info().await }
        });
        let request = device.recv().await;
        let payload = PayloadWriter::new()
            .u8(0)
            .u8(1)
            .u8(0x13)
            .u16(0)
            .u8(0)
            .u8(0)
            .u32(42)
            .u8(2)
            .string("2.1.4")
            .finish()?;
        device.reply(&request, payload).await;
        let modules = call.await??;
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].kind(), ModuleKind::SingleExtruder);

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.get_machine_info().await }
        });
        let request = device.recv().await;
        let payload = PayloadWriter::new()
            .u8(0)
            .u8(2)
            .u8(1)
            .string("SN0001")
            .string("1.14.1")
            .finish()?;
        device.reply(&request, payload).await;
        let info = call.await??;
        assert_eq!(info.series, SeriesModel::A350);
        assert_eq!(info.serial_number, "SN0001");
        Ok(())
    }

    #[tokio::test]
    async fn test_execute_gcode_and_fetch_photo() -> TestResult {
        let (client, mut device) = connect();

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.execute_gcode("M114").await }
        });
        let request = device.recv().await;
        assert_eq!(PayloadReader::new(&request.data).string()?, "M114");
        device
            .reply(&request, PayloadWriter::new().u8(0).string("X:0 Y:0 Z:0").finish()?)
            .await;
        assert_eq!(call.await??, "X:0 Y:0 Z:0");

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.fetch_photo(3).await }
        });
        let request = device.recv().await;
        assert_eq!(&request.data[..], &[3]);
        let mut payload = PayloadWriter::new();
        payload.u8(0).u32(4);
        let mut payload = payload.finish()?.to_vec();
        payload.extend_from_slice(&[0xff, 0xd8, 0xff, 0xd9]);
        device.reply(&request, payload).await;
        assert_eq!(&call.await??[..], &[0xff, 0xd8, 0xff, 0xd9]);
        Ok(())
    }

    #[tokio::test]
    async fn test_camera_calibration_roundtrip() -> TestResult {
        let (client, mut device) = connect();
        let matrix = CameraCalibration([1.0, 0.0, 12.5, 0.0, 1.0, -3.0, 0.0, 0.0, 1.0]);

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.set_camera_calibration(&matrix).await }
        });
        let request = device.recv().await;
        assert_eq!(request.data.len(), 36);
        let stored = request.data.clone();
        device.reply(&request, vec![0]).await;
        call.await??;

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.get_camera_calibration().await }
        });
        let request = device.recv().await;
        let mut payload = vec![0];
        payload.extend_from_slice(&stored);
        device.reply(&request, payload).await;
        assert_eq!(call.await??, matrix);
        Ok(())
    }
}
