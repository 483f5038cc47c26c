//! SACP session: push-driven telemetry over the binary protocol.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use ::sacp::{
    client::MoveMode,
    file_transfer::UploadReport,
    module::{self, HeadType, ModuleInfo},
    payload::PayloadReader,
    telemetry::{
        Axis, BedInfo, CncInfo, CoordinateInfo, ExtruderInfo, Heartbeat, LaserInfo, MachineInfo, PrintProgress,
    },
    Client, CommandPair, DecodeError, Dispatcher, DispatcherConfig, Packet,
};
use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use super::SessionCore;
use crate::{
    config::Config, transport::BoxTransport, Control, ControlJob, Heater, JobProgress, JobState,
    MachineEvent, Protocol, SessionState, TelemetrySnapshot,
};

/// Decoded pushes and refresh results, funnelled to the monitor task.
#[derive(Debug)]
enum Update {
    Heartbeat(Heartbeat),
    Coordinates(CoordinateInfo),
    Extruder(ExtruderInfo),
    Bed(BedInfo),
    Laser(LaserInfo),
    Cnc(CncInfo),
    Progress(PrintProgress),
    Modules(Vec<ModuleInfo>),
}

/// Routing keys learned from pushes, used to address later commands.
#[derive(Debug, Default, Clone, Copy)]
struct ModuleKeys {
    extruder: Option<u8>,
    bed: Option<u8>,
    laser: Option<u8>,
    cnc: Option<u8>,
}

/// A live SACP session.
pub struct SacpSession {
    core: Arc<SessionCore>,
    client: Client,
    keys: Arc<RwLock<ModuleKeys>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SacpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SacpSession")
            .field("state", &self.core.state())
            .field("dispatcher", self.client.dispatcher())
            .finish_non_exhaustive()
    }
}

impl Drop for SacpSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn coordinates_push(packet: &Packet) -> Result<CoordinateInfo, DecodeError> {
    let mut reader = PayloadReader::new(&packet.data);
    let _result = reader.u8()?;
    CoordinateInfo::read(&mut reader)
}

impl SacpSession {
    /// Run the SACP handshake over `transport` and start telemetry.
    ///
    /// On failure the session is marked [SessionState::Errored] and the
    /// transport is closed before the error is returned.
    pub async fn establish(core: Arc<SessionCore>, transport: BoxTransport, config: &Config) -> Result<Self> {
        core.transition(SessionState::Handshaking);

        let dispatcher = Dispatcher::new(
            transport,
            DispatcherConfig {
                request_timeout: config.session.request_timeout(),
                ..Default::default()
            },
        );

        let session = Self {
            core: core.clone(),
            client: Client::new(dispatcher.clone()),
            keys: Arc::new(RwLock::new(ModuleKeys::default())),
            monitor: Mutex::new(None),
            shutdown: CancellationToken::new(),
        };

        match session.handshake(config).await {
            Ok(machine) => {
                core.connected(machine);
                Ok(session)
            }
            Err(err) => {
                core.fail(format!("handshake failed: {:#}", err));
                session.shutdown.cancel();
                dispatcher.close().await;
                Err(err)
            }
        }
    }

    async fn handshake(&self, config: &Config) -> Result<Option<MachineInfo>> {
        self.client
            .connect(&config.client.name, config.session.liveness_timeout(), &config.client.token)
            .await
            .context("machine refused the session")?;

        let machine = match self.client.get_machine_info().await {
            Ok(machine) => Some(machine),
            Err(err) => {
                tracing::warn!(error = format!("{:?}", err), "machine info unavailable");
                None
            }
        };

        let modules = self.client.get_module_info().await.context("module info")?;
        let coordinates = match self.client.get_coordinate_info().await {
            Ok(info) => Some(info),
            Err(err) => {
                tracing::warn!(error = format!("{:?}", err), "coordinate info unavailable");
                None
            }
        };

        self.core.update_snapshot(|snapshot| {
            snapshot.series_model = machine.as_ref().map(|m| m.series);
            apply_modules(snapshot, modules);
            if let Some(info) = coordinates {
                snapshot.coordinates = info.current;
                snapshot.is_homed = info.is_homed;
            }
        });

        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe_all(config.session.heartbeat_interval(), &tx).await?;

        let monitor = Monitor {
            core: self.core.clone(),
            client: self.client.clone(),
            keys: self.keys.clone(),
            updates: tx,
            refreshing: Arc::new(AtomicBool::new(false)),
            liveness: config.session.liveness_timeout(),
        };
        let handle = tokio::spawn(monitor.run(rx, self.shutdown.clone()));
        *self.monitor.lock() = Some(handle);

        Ok(machine)
    }

    /// Heartbeat is required; everything else is best effort, since tool
    /// heads only answer for their own telemetry.
    async fn subscribe_all(&self, interval: Duration, tx: &mpsc::UnboundedSender<Update>) -> Result<()> {
        let dispatcher = self.client.dispatcher();

        dispatcher
            .subscribe(CommandPair::HEARTBEAT, interval, forward(tx, Heartbeat::decode, Update::Heartbeat))
            .await
            .context("heartbeat subscription")?;

        let optional = [
            (
                CommandPair::COORDINATE_INFO,
                forward(tx, coordinates_push, Update::Coordinates),
            ),
            (
                CommandPair::EXTRUDER_INFO,
                forward(tx, ExtruderInfo::decode, Update::Extruder),
            ),
            (CommandPair::BED_INFO, forward(tx, BedInfo::decode, Update::Bed)),
            (CommandPair::LASER_INFO, forward(tx, LaserInfo::decode, Update::Laser)),
            (CommandPair::CNC_INFO, forward(tx, CncInfo::decode, Update::Cnc)),
            (
                CommandPair::PRINT_PROGRESS,
                forward(tx, PrintProgress::decode, Update::Progress),
            ),
        ];
        for (command, callback) in optional {
            if let Err(err) = dispatcher.subscribe(command, interval, callback).await {
                tracing::debug!(command = %command, error = %err, "subscription rejected");
            }
        }
        Ok(())
    }

    /// Protocol this session speaks.
    pub fn protocol(&self) -> Protocol {
        self.core.protocol()
    }

    /// The underlying business client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn tool_head_key(&self) -> Option<u8> {
        self.core.snapshot().tool_head.map(|m| m.key)
    }

    async fn transfer(&self, path: &Path) -> Result<UploadReport> {
        let remote_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("{} has no usable file name", path.display()))?
            .to_owned();
        let length = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?
            .len();

        let result = self.client.upload_file(path, &remote_name).await;
        self.core.events().emit(MachineEvent::FileTransferComplete {
            name: remote_name,
            success: result.is_ok(),
            bytes: length,
        });
        Ok(result?)
    }
}

type PushCallback = Box<dyn Fn(&Packet) + Send + Sync>;

/// Build a subscription callback that decodes a push and forwards it.
fn forward<T>(
    tx: &mpsc::UnboundedSender<Update>,
    decode: fn(&Packet) -> Result<T, DecodeError>,
    wrap: fn(T) -> Update,
) -> PushCallback
where
    T: 'static,
{
    let tx = tx.clone();
    Box::new(move |packet| match decode(packet) {
        Ok(value) => {
            let _ = tx.send(wrap(value));
        }
        Err(err) => {
            tracing::debug!(command = %packet.command, error = %err, "dropping undecodable push");
        }
    })
}

fn apply_modules(snapshot: &mut TelemetrySnapshot, modules: Vec<ModuleInfo>) {
    let head = module::tool_head(&modules).cloned();
    snapshot.head_type = head.as_ref().and_then(|m| m.kind().head_type());
    snapshot.tool_head = head;
    snapshot.installed_modules = modules;
}

/// Background task: the only writer of the snapshot and the module keys.
struct Monitor {
    core: Arc<SessionCore>,
    client: Client,
    keys: Arc<RwLock<ModuleKeys>>,
    updates: mpsc::UnboundedSender<Update>,
    refreshing: Arc<AtomicBool>,
    liveness: Duration,
}

impl Monitor {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Update>, shutdown: CancellationToken) {
        let dispatcher = self.client.dispatcher().clone();
        let mut deadline = Instant::now() + self.liveness;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = dispatcher.closed() => {
                    let reason = dispatcher.close_reason().unwrap_or_else(|| "transport closed".to_owned());
                    self.core.fail(reason);
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.core.fail(format!("no heartbeat for {:?}", self.liveness));
                    dispatcher.close().await;
                    return;
                }
                update = rx.recv() => {
                    let Some(update) = update else { return };
                    if matches!(update, Update::Heartbeat(_)) {
                        deadline = Instant::now() + self.liveness;
                    }
                    self.apply(update);
                }
            }
        }
    }

    fn apply(&self, update: Update) {
        match update {
            Update::Heartbeat(heartbeat) => {
                self.core.update_snapshot(|s| s.job_state = JobState::from(heartbeat.status));
                self.core.publish_snapshot();
                self.refresh_modules();
            }
            Update::Coordinates(info) => {
                self.core.update_snapshot(|s| {
                    s.coordinates = info.current;
                    s.is_homed = info.is_homed;
                });
            }
            Update::Extruder(info) => {
                self.keys.write().extruder = Some(info.key);
                self.core.update_snapshot(|s| s.nozzles = info.nozzles);
            }
            Update::Bed(info) => {
                self.keys.write().bed = Some(info.key);
                self.core.update_snapshot(|s| s.bed = info.zones);
            }
            Update::Laser(info) => self.keys.write().laser = Some(info.key),
            Update::Cnc(info) => self.keys.write().cnc = Some(info.key),
            Update::Progress(progress) => {
                self.core.events().emit(MachineEvent::JobProgress {
                    progress: JobProgress {
                        progress: progress.progress,
                        elapsed_secs: u64::from(progress.elapsed_secs),
                        remaining_secs: Some(u64::from(progress.remaining_secs)),
                    },
                });
            }
            Update::Modules(modules) => {
                if self.core.snapshot().installed_modules == modules {
                    return;
                }
                tracing::info!(count = modules.len(), "installed modules changed");
                self.core.update_snapshot(|s| apply_modules(s, modules.clone()));
                self.core.events().emit(MachineEvent::ModulesChanged { modules });
            }
        }
    }

    /// Re-read the module list in the background, at most one at a time.
    fn refresh_modules(&self) {
        if self.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }

        let client = self.client.clone();
        let updates = self.updates.clone();
        let refreshing = self.refreshing.clone();
        tokio::spawn(async move {
            match client.get_module_info().await {
                Ok(modules) => {
                    let _ = updates.send(Update::Modules(modules));
                }
                Err(err) => tracing::debug!(error = %err, "module refresh failed"),
            }
            refreshing.store(false, Ordering::Release);
        });
    }
}

impl Control for SacpSession {
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
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            if let Err(err) = monitor.await {
                tracing::warn!(error = format!("{:?}", err), "telemetry monitor panicked");
            }
        }

        let dispatcher = self.client.dispatcher();
        if orderly && !dispatcher.is_closed() {
            if let Err(err) = self.client.disconnect().await {
                tracing::debug!(error = %err, "disconnect not acknowledged");
            }
        }
        dispatcher.close().await;

        if orderly {
            self.core.transition(SessionState::Closed);
        }
        Ok(())
    }

    async fn home(&self) -> Result<()> {
        Ok(self.client.home().await?)
    }

    async fn jog(&self, x: f64, y: f64, z: f64, feed_rate: u16) -> Result<()> {
        let targets: Vec<(Axis, f64)> = [(Axis::X, x), (Axis::Y, y), (Axis::Z, z)]
            .into_iter()
            .filter(|(_, distance)| *distance != 0.0)
            .collect();
        if targets.is_empty() {
            return Ok(());
        }
        Ok(self.client.move_axes(MoveMode::Relative, feed_rate, &targets).await?)
    }

    async fn set_temperature(&self, heater: Heater, celsius: u16) -> Result<()> {
        let keys = *self.keys.read();
        match heater {
            Heater::Nozzle(nozzle) => {
                let Some(key) = keys.extruder.or_else(|| self.tool_head_key()) else {
                    bail!("no print head is mounted");
                };
                Ok(self.client.set_nozzle_temperature(key, nozzle, celsius).await?)
            }
            Heater::Bed(zone) => {
                let Some(key) = keys.bed else {
                    bail!("the machine has not reported a heated bed");
                };
                Ok(self.client.set_bed_temperature(key, zone, celsius).await?)
            }
        }
    }

    async fn set_tool_power(&self, percent: u8) -> Result<()> {
        let percent = percent.min(100);
        let snapshot = self.core.snapshot();
        let keys = *self.keys.read();
        let head_key = snapshot.tool_head.as_ref().map(|m| m.key);

        match snapshot.head_type {
            Some(HeadType::Laser) => {
                let Some(key) = keys.laser.or(head_key) else {
                    bail!("laser head has no key");
                };
                Ok(self.client.set_laser_power(key, percent).await?)
            }
            Some(HeadType::Cnc) => {
                let Some(key) = keys.cnc.or(head_key) else {
                    bail!("spindle has no key");
                };
                Ok(self.client.set_spindle_power(key, percent).await?)
            }
            other => bail!("tool power is not supported for head type {:?}", other),
        }
    }

    async fn execute_gcode(&self, line: &str) -> Result<String> {
        Ok(self.client.execute_gcode(line).await?)
    }
}

impl ControlJob for SacpSession {
    type Error = anyhow::Error;

    async fn start_job(&self, path: &Path) -> Result<()> {
        let report = self.transfer(path).await?;
        self.client.start_print(&report.remote_name, &report.digest).await?;
        tracing::info!(name = %report.remote_name, "job started");
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        Ok(self.client.pause().await?)
    }

    async fn resume(&self) -> Result<()> {
        Ok(self.client.resume().await?)
    }

    async fn stop(&self) -> Result<()> {
        Ok(self.client.stop().await?)
    }

    async fn upload_file(&self, path: &Path) -> Result<()> {
        self.transfer(path).await?;
        Ok(())
    }
}
