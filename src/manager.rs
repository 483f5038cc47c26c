use std::{path::Path, sync::Arc};

use anyhow::{bail, Context, Result};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    Mutex, OnceCell,
};

use crate::{
    detect,
    session::{HttpSession, SacpSession, SerialTextSession, SessionCore},
    transport::{self, BoxTransport},
    AnySession, Config, Control, ControlJob, DeviceEntry, Discovery, EventBus, Heater, JobState, MachineEvent,
    Protocol, SessionState, Target, TelemetrySnapshot,
};

/// The single entry point for driving a machine.
///
/// Holds at most one live session. Every command goes to that session,
/// whatever protocol it speaks, and every session reports on the same
/// event bus.
pub struct ConnectionManager {
    config: Config,
    events: EventBus,
    session: Mutex<Option<Arc<AnySession>>>,
    discovery: OnceCell<Arc<Discovery>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager with no session.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            events: EventBus::new(),
            session: Mutex::new(None),
            discovery: OnceCell::new(),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Receive every event from every session opened from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<MachineEvent> {
        self.events.subscribe()
    }

    /// Work out which protocol `target` speaks without opening a session.
    pub async fn detect(&self, target: &Target) -> Result<Protocol> {
        match target {
            Target::Network { host } => detect::detect_network(host, &self.config.network).await,
            Target::Serial { path } => {
                let mut stream = self.open_serial(path)?;
                detect::probe_stream(&mut stream, self.config.serial.probe_timeout()).await
            }
        }
    }

    /// Open a session to `target`, closing the current one first.
    pub async fn open(&self, target: &Target) -> Result<()> {
        let mut slot = self.session.lock().await;
        self.close_slot(&mut slot).await;

        tracing::info!(target = %target, "opening session");
        let session = match target {
            Target::Network { host } => self.open_network(host).await?,
            Target::Serial { path } => self.open_serial_session(path).await?,
        };
        *slot = Some(Arc::new(session));
        Ok(())
    }

    /// Open a session over an already connected `transport`, closing the
    /// current one first. The legacy HTTP api needs a host, not a stream.
    pub async fn attach(&self, protocol: Protocol, transport: BoxTransport) -> Result<()> {
        let mut slot = self.session.lock().await;
        self.close_slot(&mut slot).await;

        let core = self.core(protocol);
        core.transition(SessionState::Connecting);
        let session = self.establish(core, transport).await?;
        *slot = Some(Arc::new(session));
        Ok(())
    }

    /// Close the current session, if any.
    pub async fn close(&self) -> Result<()> {
        let mut slot = self.session.lock().await;
        self.close_slot(&mut slot).await;
        Ok(())
    }

    /// Protocol of the current session.
    pub async fn protocol(&self) -> Option<Protocol> {
        self.session.lock().await.as_ref().map(|s| s.protocol())
    }

    /// State of the current session; [SessionState::Idle] without one.
    pub async fn state(&self) -> SessionState {
        match self.session.lock().await.as_ref() {
            Some(session) => session.state(),
            None => SessionState::Idle,
        }
    }

    /// Latest telemetry of the current session.
    pub async fn snapshot(&self) -> Result<TelemetrySnapshot> {
        Ok(self.current().await?.snapshot())
    }

    /// Transfer `path` to the machine and start it.
    pub async fn start_job(&self, path: &Path) -> Result<()> {
        self.current().await?.start_job(path).await
    }

    /// Start `path` and wait until the machine completes or stops it.
    ///
    /// Returns [JobState::Completed] or [JobState::Stopped]. Fails if the
    /// session is lost or closed first.
    pub async fn run_job(&self, path: &Path) -> Result<JobState> {
        let mut events = self.subscribe_events();
        let session = self.current().await?;
        session.start_job(path).await?;

        let mut started = false;
        loop {
            let state = match events.recv().await {
                Ok(MachineEvent::Telemetry { snapshot }) => snapshot.job_state,
                Ok(MachineEvent::ConnectionLost { reason }) => bail!("connection lost during the job: {}", reason),
                Ok(MachineEvent::Closed) => bail!("session closed during the job"),
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "job watch fell behind");
                    session.snapshot().job_state
                }
                Err(RecvError::Closed) => bail!("event bus closed"),
            };

            match state {
                JobState::Running | JobState::Paused => started = true,
                // Until the job is seen running, a finished state is left over from the last one.
                JobState::Completed | JobState::Stopped if started => {
                    tracing::info!(path = %path.display(), state = %state, "job finished");
                    return Ok(state);
                }
                _ => {}
            }
        }
    }

    /// Store `path` on the machine without starting it.
    pub async fn upload_file(&self, path: &Path) -> Result<()> {
        self.current().await?.upload_file(path).await
    }

    /// Pause the running job.
    pub async fn pause(&self) -> Result<()> {
        self.current().await?.pause().await
    }

    /// Resume a paused job.
    pub async fn resume(&self) -> Result<()> {
        self.current().await?.resume().await
    }

    /// Stop the current job.
    pub async fn stop(&self) -> Result<()> {
        self.current().await?.stop().await
    }

    /// Home all axes.
    pub async fn home(&self) -> Result<()> {
        self.current().await?.home().await
    }

    /// Move relative to the current position.
    pub async fn jog(&self, x: f64, y: f64, z: f64, feed_rate: u16) -> Result<()> {
        self.current().await?.jog(x, y, z, feed_rate).await
    }

    /// Set a heater's target temperature.
    pub async fn set_temperature(&self, heater: Heater, celsius: u16) -> Result<()> {
        self.current().await?.set_temperature(heater, celsius).await
    }

    /// Set laser or spindle power.
    pub async fn set_tool_power(&self, percent: u8) -> Result<()> {
        self.current().await?.set_tool_power(percent).await
    }

    /// Run one raw G-code line.
    pub async fn execute_gcode(&self, line: &str) -> Result<String> {
        self.current().await?.execute_gcode(line).await
    }

    /// Broadcast for machines and list the ones heard from recently.
    pub async fn discover(&self) -> Result<Vec<DeviceEntry>> {
        let discovery = self
            .discovery
            .get_or_try_init(|| Discovery::bind(self.config.discovery))
            .await?;
        Ok(discovery.list().await)
    }

    async fn current(&self) -> Result<Arc<AnySession>> {
        match self.session.lock().await.as_ref() {
            Some(session) => Ok(session.clone()),
            None => bail!("no session is open"),
        }
    }

    async fn close_slot(&self, slot: &mut Option<Arc<AnySession>>) {
        let Some(session) = slot.take() else {
            return;
        };
        tracing::info!(protocol = %session.protocol(), "closing session");
        if let Err(err) = session.close().await {
            tracing::warn!(error = format!("{:?}", err), "session did not close cleanly");
        }
    }

    fn core(&self, protocol: Protocol) -> Arc<SessionCore> {
        Arc::new(SessionCore::new(protocol, self.events.clone()))
    }

    async fn establish(&self, core: Arc<SessionCore>, transport: BoxTransport) -> Result<AnySession> {
        Ok(match core.protocol() {
            Protocol::Sacp => SacpSession::establish(core, transport, &self.config).await?.into(),
            Protocol::SerialText => SerialTextSession::establish(core, transport, &self.config).await?.into(),
            Protocol::LegacyHttp => {
                core.fail("the legacy http api cannot run over a raw stream");
                bail!("the legacy http api cannot run over a raw stream");
            }
        })
    }

    async fn open_network(&self, host: &str) -> Result<AnySession> {
        let protocol = detect::detect_network(host, &self.config.network).await?;
        let core = self.core(protocol);
        core.transition(SessionState::Connecting);

        match protocol {
            Protocol::LegacyHttp => {
                let session = HttpSession::establish(core, host, self.config.network.http_port, &self.config).await?;
                Ok(session.into())
            }
            _ => {
                let port = self.config.network.sacp_port;
                let stream = match transport::connect_tcp(host, port, self.config.network.probe_timeout()).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        core.fail(format!("{:#}", err));
                        return Err(err);
                    }
                };
                self.establish(core, Box::new(stream)).await
            }
        }
    }

    async fn open_serial_session(&self, path: &str) -> Result<AnySession> {
        let mut stream = self.open_serial(path)?;
        let protocol = detect::probe_stream(&mut stream, self.config.serial.probe_timeout())
            .await
            .with_context(|| format!("probing {}", path))?;

        let core = self.core(protocol);
        core.transition(SessionState::Connecting);
        self.establish(core, stream).await
    }

    #[cfg(feature = "serial")]
    fn open_serial(&self, path: &str) -> Result<BoxTransport> {
        Ok(Box::new(transport::open_serial(path, self.config.serial.baud)?))
    }

    #[cfg(not(feature = "serial"))]
    fn open_serial(&self, path: &str) -> Result<BoxTransport> {
        bail!("cannot open {}: built without serial support", path)
    }
}
