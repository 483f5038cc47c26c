//! Legacy HTTP session: telemetry by polling the status endpoint.

use std::{path::Path, sync::Arc, time::Duration};

use ::sacp::{
    module::HeadType,
    telemetry::{Coordinates, HeaterReading, SeriesModel},
};
use anyhow::{bail, Context, Result};
use legacy_http::Status;
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use super::SessionCore;
use crate::{
    config::Config, Control, ControlJob, Heater, JobProgress, JobState, MachineEvent, SessionState, TelemetrySnapshot,
};

/// A live legacy HTTP session.
pub struct HttpSession {
    core: Arc<SessionCore>,
    client: legacy_http::Client,
    poller: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("state", &self.core.state())
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl Drop for HttpSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl HttpSession {
    /// Connect to the legacy api at `host:port` and start polling.
    pub async fn establish(core: Arc<SessionCore>, host: &str, port: u16, config: &Config) -> Result<Self> {
        core.transition(SessionState::Handshaking);

        let mut client = legacy_http::Client::new(host, port, &config.client.token);
        let first = async {
            client.connect().await?;
            client.status().await
        }
        .await;

        let status = match first {
            Ok(status) => status,
            Err(err) => {
                core.fail(format!("handshake failed: {:#}", err));
                return Err(err);
            }
        };
        apply_status(&core, &status);

        let shutdown = CancellationToken::new();
        let poller = tokio::spawn(poll(
            core.clone(),
            client.clone(),
            config.session.heartbeat_interval(),
            config.session.http_liveness_timeout(),
            shutdown.clone(),
        ));

        core.connected(None);
        Ok(Self {
            core,
            client,
            poller: Mutex::new(Some(poller)),
            shutdown,
        })
    }

    async fn gcode(&self, lines: &[String]) -> Result<()> {
        for line in lines {
            self.client.execute_code(line).await?;
        }
        Ok(())
    }

    async fn upload(&self, path: &Path) -> Result<()> {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bytes = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?
            .len();

        let result = self.client.upload_file(path).await;
        self.core.events().emit(MachineEvent::FileTransferComplete {
            name,
            success: result.is_ok(),
            bytes,
        });
        result
    }
}

/// Poll status every `interval`. The session is lost once no poll has
/// succeeded for `liveness`.
async fn poll(
    core: Arc<SessionCore>,
    client: legacy_http::Client,
    interval: Duration,
    liveness: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_ok = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let status = tokio::select! {
            _ = shutdown.cancelled() => return,
            status = tokio::time::timeout(liveness, client.status()) => status,
        };

        match status {
            Ok(Ok(status)) => {
                last_ok = Instant::now();
                apply_status(&core, &status);
                core.publish_snapshot();
            }
            Ok(Err(err)) => tracing::debug!(error = format!("{:?}", err), "status poll failed"),
            Err(_) => tracing::debug!("status poll timed out"),
        }

        if last_ok.elapsed() >= liveness {
            core.fail(format!("no status for {:?}", liveness));
            return;
        }
    }
}

fn job_state(status: &str) -> JobState {
    match status.to_ascii_uppercase().as_str() {
        "RUNNING" => JobState::Running,
        "PAUSED" => JobState::Paused,
        "STOPPED" => JobState::Stopped,
        "COMPLETED" => JobState::Completed,
        _ => JobState::Idle,
    }
}

fn head_type(tool_head: &str) -> Option<HeadType> {
    let tool_head = tool_head.to_ascii_uppercase();
    if tool_head.contains("3DPRINTING") {
        Some(HeadType::Printing)
    } else if tool_head.contains("LASER") {
        Some(HeadType::Laser)
    } else if tool_head.contains("CNC") {
        Some(HeadType::Cnc)
    } else {
        None
    }
}

fn series_model(series: &str) -> Option<SeriesModel> {
    let series = series.to_ascii_uppercase();
    [
        ("A150", SeriesModel::A150),
        ("A250", SeriesModel::A250),
        ("A350", SeriesModel::A350),
        ("A400", SeriesModel::A400),
        ("J1", SeriesModel::J1),
        ("RAY", SeriesModel::Ray),
    ]
    .into_iter()
    .find_map(|(name, model)| series.contains(name).then_some(model))
}

fn heater(current: Option<f64>, target: Option<f64>) -> Vec<HeaterReading> {
    match current {
        Some(current) => vec![HeaterReading {
            index: 0,
            current,
            target: target.unwrap_or(0.0),
        }],
        None => vec![],
    }
}

/// Rebuild the snapshot from one status reply, and report progress while
/// a job runs.
fn apply_status(core: &SessionCore, status: &Status) {
    let snapshot = core.update_snapshot(|s| {
        s.job_state = status.status.as_deref().map(job_state).unwrap_or_default();
        s.head_type = status.tool_head.as_deref().and_then(head_type);
        s.series_model = status.series.as_deref().and_then(series_model);
        s.is_homed = status.homed.unwrap_or(false);
        s.coordinates = Coordinates {
            x: status.x.unwrap_or_default(),
            y: status.y.unwrap_or_default(),
            z: status.z.unwrap_or_default(),
            b: status.b.unwrap_or_default(),
        };
        s.nozzles = heater(status.nozzle_temperature, status.nozzle_target_temperature);
        s.bed = heater(status.heated_bed_temperature, status.heated_bed_target_temperature);
    });

    if let (JobState::Running | JobState::Paused, Some(progress)) = (snapshot.job_state, status.progress) {
        core.events().emit(MachineEvent::JobProgress {
            progress: JobProgress {
                progress: progress.clamp(0.0, 1.0),
                elapsed_secs: status.elapsed_time.unwrap_or(0),
                remaining_secs: status.remaining_time,
            },
        });
    }
}

impl Control for HttpSession {
    type Error = anyhow::Error;

    fn state(&self) -> SessionState {
        self.core.state()
    }

    fn snapshot(&self) -> TelemetrySnapshot {
        self.core.snapshot()
    }

    async fn close(&self) -> Result<()> {
        let orderly = self.core.transition(SessionState::Closing);

        self.shutdown.cancel();
        let poller = self.poller.lock().take();
        if let Some(poller) = poller {
            if let Err(err) = poller.await {
                tracing::warn!(error = format!("{:?}", err), "status poller panicked");
            }
        }

        if orderly {
            if let Err(err) = self.client.disconnect().await {
                tracing::debug!(error = format!("{:?}", err), "disconnect failed");
            }
            self.core.transition(SessionState::Closed);
        }
        Ok(())
    }

    async fn home(&self) -> Result<()> {
        self.client.execute_code("G28").await
    }

    async fn jog(&self, x: f64, y: f64, z: f64, feed_rate: u16) -> Result<()> {
        self.gcode(&[
            "G91".to_owned(),
            format!("G0 X{} Y{} Z{} F{}", x, y, z, feed_rate),
            "G90".to_owned(),
        ])
        .await
    }

    async fn set_temperature(&self, heater: Heater, celsius: u16) -> Result<()> {
        let line = match heater {
            Heater::Nozzle(0) => format!("M104 S{}", celsius),
            Heater::Nozzle(nozzle) => format!("M104 T{} S{}", nozzle, celsius),
            Heater::Bed(_) => format!("M140 S{}", celsius),
        };
        self.client.execute_code(&line).await
    }

    async fn set_tool_power(&self, percent: u8) -> Result<()> {
        let percent = percent.min(100);
        match self.core.snapshot().head_type {
            Some(HeadType::Laser) => self.client.override_laser_power(f64::from(percent)).await,
            Some(HeadType::Cnc) => self.client.execute_code(&format!("M3 P{}", percent)).await,
            other => bail!("tool power is not supported for head type {:?}", other),
        }
    }

    async fn execute_gcode(&self, line: &str) -> Result<String> {
        self.client.execute_code(line).await?;
        Ok("ok".to_owned())
    }
}

impl ControlJob for HttpSession {
    type Error = anyhow::Error;

    async fn start_job(&self, path: &Path) -> Result<()> {
        self.upload(path).await?;
        self.client.start_print().await
    }

    async fn pause(&self) -> Result<()> {
        self.client.pause_print().await
    }

    async fn resume(&self) -> Result<()> {
        self.client.resume_print().await
    }

    async fn stop(&self) -> Result<()> {
        self.client.stop_print().await
    }

    async fn upload_file(&self, path: &Path) -> Result<()> {
        self.upload(path).await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use testresult::TestResult;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::EventBus;

    const STATUS: &str = r#"{
        "status": "RUNNING",
        "toolHead": "TOOLHEAD_3DPRINTING_1",
        "homed": true,
        "x": 1.5, "y": 2.0, "z": 0.2,
        "nozzleTemperature": 205.0,
        "nozzleTargetTemperature": 210.0,
        "progress": 0.25,
        "elapsedTime": 60,
        "series": "Snapmaker A350"
    }"#;

    /// Serve connect, status, and disconnect forever, one request per
    /// connection.
    async fn fake_machine() -> std::io::Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let Ok(request) = read_request(&mut stream).await else { continue };
                respond(&mut stream, &request).await;
            }
        });

        Ok(port)
    }

    /// Answer the connect and the first status, then take requests without
    /// ever replying to them.
    async fn machine_that_goes_quiet() -> std::io::Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        tokio::spawn(async move {
            let mut answered = 0;
            let mut held = vec![];
            while let Ok((mut stream, _)) = listener.accept().await {
                let Ok(request) = read_request(&mut stream).await else { continue };
                if answered < 2 {
                    answered += 1;
                    respond(&mut stream, &request).await;
                } else {
                    held.push(stream);
                }
            }
        });

        Ok(port)
    }

    async fn respond(stream: &mut tokio::net::TcpStream, request: &str) {
        let body = if request.starts_with("GET /api/v1/status") {
            STATUS
        } else if request.starts_with("POST /api/v1/connect") {
            r#"{"token":"t1"}"#
        } else {
            "{}"
        };
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let _ = stream.write_all(response.as_bytes()).await;
    }

    /// Read one request: headers, then as much body as they announce.
    async fn read_request(stream: &mut tokio::net::TcpStream) -> std::io::Result<String> {
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await?;
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request).into_owned();
            let Some(split) = text.find("\r\n\r\n") else {
                if n == 0 {
                    return Ok(text);
                }
                continue;
            };
            let length = text[..split]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if n == 0 || request.len() >= split + 4 + length {
                return Ok(text);
            }
        }
    }

    #[test]
    fn test_apply_status() -> TestResult {
        let core = SessionCore::new(crate::Protocol::LegacyHttp, EventBus::new());
        let mut events = core.events().subscribe();
        let status: Status = serde_json::from_str(STATUS)?;

        apply_status(&core, &status);

        let snapshot = core.snapshot();
        assert_eq!(snapshot.job_state, JobState::Running);
        assert_eq!(snapshot.head_type, Some(HeadType::Printing));
        assert_eq!(snapshot.series_model, Some(SeriesModel::A350));
        assert!(snapshot.is_homed);
        assert_eq!(snapshot.coordinates.y, 2.0);
        assert_eq!(
            snapshot.nozzles,
            vec![HeaterReading {
                index: 0,
                current: 205.0,
                target: 210.0
            }]
        );
        assert!(snapshot.bed.is_empty());

        assert_eq!(
            events.try_recv()?,
            MachineEvent::JobProgress {
                progress: JobProgress {
                    progress: 0.25,
                    elapsed_secs: 60,
                    remaining_secs: None,
                }
            }
        );
        Ok(())
    }

    #[test]
    fn test_idle_status_reports_no_progress() {
        let core = SessionCore::new(crate::Protocol::LegacyHttp, EventBus::new());
        let mut events = core.events().subscribe();

        apply_status(
            &core,
            &Status {
                status: Some("IDLE".to_owned()),
                progress: Some(1.0),
                ..Default::default()
            },
        );

        assert_eq!(core.snapshot().job_state, JobState::Idle);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_establish_and_close() -> TestResult {
        let port = fake_machine().await?;
        let core = Arc::new(SessionCore::new(crate::Protocol::LegacyHttp, EventBus::new()));
        core.transition(SessionState::Connecting);

        let session = HttpSession::establish(core.clone(), "127.0.0.1", port, &Config::default()).await?;
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.snapshot().coordinates.x, 1.5);

        session.close().await?;
        assert_eq!(session.state(), SessionState::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn test_establish_unreachable() -> TestResult {
        let port = portpicker::pick_unused_port().ok_or("no free port")?;
        let core = Arc::new(SessionCore::new(crate::Protocol::LegacyHttp, EventBus::new()));
        core.transition(SessionState::Connecting);

        assert!(HttpSession::establish(core.clone(), "127.0.0.1", port, &Config::default())
            .await
            .is_err());
        assert_eq!(core.state(), SessionState::Errored);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_machine_is_lost_once() -> TestResult {
        let port = machine_that_goes_quiet().await?;
        let core = Arc::new(SessionCore::new(crate::Protocol::LegacyHttp, EventBus::new()));
        let mut events = core.events().subscribe();
        core.transition(SessionState::Connecting);

        let session = HttpSession::establish(core.clone(), "127.0.0.1", port, &Config::default()).await?;
        let connected_at = Instant::now();

        let mut seen = vec![];
        loop {
            let event = events.recv().await?;
            let errored = event
                == MachineEvent::StateChanged {
                    state: SessionState::Errored,
                };
            seen.push(event);
            if errored {
                break;
            }
        }
        assert!(connected_at.elapsed() >= Duration::from_secs(3));

        tokio::time::sleep(Duration::from_secs(30)).await;
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }

        let states: Vec<SessionState> = seen
            .iter()
            .filter_map(|event| match event {
                MachineEvent::StateChanged { state } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                SessionState::Connecting,
                SessionState::Handshaking,
                SessionState::Connected,
                SessionState::Errored
            ]
        );
        assert_eq!(
            seen.iter()
                .filter(|event| matches!(event, MachineEvent::ConnectionLost { .. }))
                .count(),
            1
        );
        assert_eq!(session.state(), SessionState::Errored);

        session.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_of_missing_file_fails() -> TestResult {
        let port = fake_machine().await?;
        let core = Arc::new(SessionCore::new(crate::Protocol::LegacyHttp, EventBus::new()));
        core.transition(SessionState::Connecting);
        let session = HttpSession::establish(core.clone(), "127.0.0.1", port, &Config::default()).await?;

        let mut events = core.events().subscribe();
        let dir = tempfile::tempdir()?;
        let err = session
            .upload_file(&dir.path().join("missing.gcode"))
            .await
            .expect_err("upload of a missing file");
        assert!(format!("{:#}", err).contains("missing.gcode"));
        assert!(!std::iter::from_fn(|| events.try_recv().ok())
            .any(|event| matches!(event, MachineEvent::FileTransferComplete { .. })));

        session.close().await?;
        Ok(())
    }
}
