//! Line-oriented G-code over a serial port: each command is answered by
//! `ok`, telemetry comes from polling `M105` and `M114`.

use std::{path::Path, sync::Arc, time::Duration};

use ::sacp::telemetry::{Coordinates, HeaterReading};
use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use super::SessionCore;
use crate::{
    config::Config, transport::BoxTransport, Control, ControlJob, Heater, JobProgress, JobState, MachineEvent,
    SessionState, TelemetrySnapshot,
};

/// Write side of the line and the replies the monitor forwards to it.
struct Exchange {
    writer: WriteHalf<BoxTransport>,
    replies: mpsc::UnboundedReceiver<String>,
}

/// One command in flight at a time; a command owns the line until its `ok`.
struct Line {
    exchange: tokio::sync::Mutex<Exchange>,
    timeout: Duration,
}

impl Line {
    /// Send `command` and collect everything up to its `ok`.
    async fn command(&self, command: &str) -> Result<String> {
        let mut exchange = self.exchange.lock().await;
        while exchange.replies.try_recv().is_ok() {}

        tracing::trace!(command, "sending");
        exchange.writer.write_all(format!("{}\n", command).as_bytes()).await?;
        exchange.writer.flush().await?;

        let mut reply = vec![];
        let mut deadline = Instant::now() + self.timeout;
        loop {
            let line = match tokio::time::timeout_at(deadline, exchange.replies.recv()).await {
                Ok(Some(line)) => line,
                Ok(None) => bail!("serial line closed"),
                Err(_) => bail!("timed out waiting for ok to {}", command),
            };

            if let Some(rest) = line.strip_prefix("ok") {
                let rest = rest.trim();
                if !rest.is_empty() {
                    reply.push(rest.to_owned());
                }
                return Ok(reply.join("\n"));
            }
            if line.starts_with("Error") || line.starts_with("!!") {
                bail!("machine rejected {}: {}", command, line);
            }
            // Long moves keep the command alive.
            if line.starts_with("echo:busy") {
                deadline = Instant::now() + self.timeout;
            }
            reply.push(line);
        }
    }

    async fn shutdown(&self) {
        let mut exchange = self.exchange.lock().await;
        if let Err(err) = exchange.writer.shutdown().await {
            tracing::debug!(error = %err, "serial shutdown failed");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobControl {
    Run,
    Pause,
    Stop,
}

struct JobRun {
    handle: JoinHandle<()>,
    control: watch::Sender<JobControl>,
}

/// A live serial text session.
pub struct SerialTextSession {
    core: Arc<SessionCore>,
    line: Arc<Line>,
    jobs: mpsc::UnboundedSender<JobState>,
    job: Mutex<Option<JobRun>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SerialTextSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTextSession")
            .field("state", &self.core.state())
            .finish_non_exhaustive()
    }
}

impl Drop for SerialTextSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(job) = self.job.lock().take() {
            job.handle.abort();
        }
    }
}

impl SerialTextSession {
    /// Take over `transport`, check the firmware answers, and start polling.
    pub async fn establish(core: Arc<SessionCore>, transport: BoxTransport, config: &Config) -> Result<Self> {
        core.transition(SessionState::Handshaking);

        let (reader, writer) = tokio::io::split(transport);
        let (replies_tx, replies) = mpsc::unbounded_channel();
        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let line = Arc::new(Line {
            exchange: tokio::sync::Mutex::new(Exchange { writer, replies }),
            timeout: config.session.request_timeout(),
        });

        let monitor = tokio::spawn(monitor(
            core.clone(),
            reader,
            line.clone(),
            replies_tx,
            jobs_rx,
            config.session.liveness_timeout(),
            shutdown.clone(),
        ));

        let session = Self {
            core: core.clone(),
            line: line.clone(),
            jobs,
            job: Mutex::new(None),
            tasks: Mutex::new(vec![monitor]),
            shutdown: shutdown.clone(),
        };

        match line.command("M115").await {
            Ok(firmware) => tracing::info!(firmware = %firmware, "serial machine answered"),
            Err(err) => {
                core.fail(format!("handshake failed: {:#}", err));
                shutdown.cancel();
                return Err(err);
            }
        }

        let poller = tokio::spawn(poll(
            core.clone(),
            line,
            config.session.heartbeat_interval(),
            shutdown,
        ));
        session.tasks.lock().push(poller);

        core.connected(None);
        Ok(session)
    }

    async fn gcode(&self, lines: &[String]) -> Result<()> {
        for line in lines {
            self.line.command(line).await?;
        }
        Ok(())
    }

    fn control_job(&self, control: JobControl) -> Result<()> {
        let job = self.job.lock();
        match job.as_ref() {
            Some(run) if !run.handle.is_finished() => {
                run.control.send_replace(control);
                Ok(())
            }
            _ => bail!("no job is running"),
        }
    }
}

/// Reads every inbound line: parses telemetry out of it, forwards it to
/// whoever is waiting on a command, and counts it as a sign of life. The
/// only writer of the snapshot. When the line goes quiet or closes it takes
/// the whole session down with it.
async fn monitor(
    core: Arc<SessionCore>,
    reader: ReadHalf<BoxTransport>,
    line: Arc<Line>,
    replies: mpsc::UnboundedSender<String>,
    mut jobs: mpsc::UnboundedReceiver<JobState>,
    liveness: Duration,
    shutdown: CancellationToken,
) {
    let mut lines = BufReader::new(reader).lines();
    let mut deadline = Instant::now() + liveness;

    let reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {
                break format!("no reply on the serial line for {:?}", liveness);
            }
            Some(state) = jobs.recv() => {
                core.update_snapshot(|s| s.job_state = state);
                core.publish_snapshot();
            }
            read = lines.next_line() => match read {
                Ok(Some(line)) => {
                    deadline = Instant::now() + liveness;
                    let line = line.trim().to_owned();
                    if line.is_empty() {
                        continue;
                    }
                    apply_report(&core, &line);
                    let _ = replies.send(line);
                }
                Ok(None) => break "serial line closed".to_owned(),
                Err(err) => break format!("serial read failed: {}", err),
            }
        }
    };

    core.update_snapshot(|s| {
        if matches!(s.job_state, JobState::Running | JobState::Paused) {
            s.job_state = JobState::Stopped;
        }
    });
    core.fail(reason);

    // Stops the poller and any job, then wakes a command waiting on a reply
    // so the line is free to shut.
    shutdown.cancel();
    drop(replies);
    line.shutdown().await;
}

async fn poll(core: Arc<SessionCore>, line: Arc<Line>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if core.state().is_terminal() {
            return;
        }

        for command in ["M105", "M114"] {
            if let Err(err) = line.command(command).await {
                tracing::debug!(command, error = format!("{:?}", err), "poll failed");
            }
        }
    }
}

/// Value following `prefix` in a whitespace-separated report.
fn field(tokens: &[&str], prefix: &str) -> Option<(usize, f64)> {
    tokens
        .iter()
        .enumerate()
        .find_map(|(i, token)| Some((i, token.strip_prefix(prefix)?.parse().ok()?)))
}

/// Parse `T:205.3 /210.0 B:60.1 /60.0` style temperature reports.
fn parse_temperatures(line: &str) -> (Option<HeaterReading>, Option<HeaterReading>) {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let reading = |prefix: &str| {
        let (i, current) = field(&tokens, prefix)?;
        let target = tokens
            .get(i + 1)
            .and_then(|t| t.strip_prefix('/'))
            .and_then(|t| t.parse().ok())
            .unwrap_or(0.0);
        Some(HeaterReading {
            index: 0,
            current,
            target,
        })
    };
    (reading("T:"), reading("B:"))
}

/// Parse `X:10.00 Y:20.00 Z:0.20 E:0.00 Count X:...` position reports.
fn parse_position(line: &str) -> Option<Coordinates> {
    let reported = line.split(" Count").next().unwrap_or(line);
    let tokens: Vec<&str> = reported.split_whitespace().collect();
    Some(Coordinates {
        x: field(&tokens, "X:")?.1,
        y: field(&tokens, "Y:")?.1,
        z: field(&tokens, "Z:")?.1,
        b: field(&tokens, "B:").map(|(_, b)| b).unwrap_or_default(),
    })
}

fn apply_report(core: &SessionCore, line: &str) {
    let (nozzle, bed) = parse_temperatures(line);
    if nozzle.is_some() || bed.is_some() {
        core.update_snapshot(|s| {
            s.nozzles = nozzle.into_iter().collect();
            s.bed = bed.into_iter().collect();
        });
        return;
    }

    if let Some(coordinates) = parse_position(line) {
        core.update_snapshot(|s| s.coordinates = coordinates);
        core.publish_snapshot();
    }
}

/// Strip comments and blank lines.
fn job_lines(gcode: &str) -> Vec<String> {
    gcode
        .lines()
        .map(|line| match line.split_once(';') {
            Some((command, _)) => command.trim().to_owned(),
            None => line.trim().to_owned(),
        })
        .filter(|line| !line.is_empty())
        .collect()
}

async fn run_job(
    core: Arc<SessionCore>,
    line: Arc<Line>,
    jobs: mpsc::UnboundedSender<JobState>,
    mut control: watch::Receiver<JobControl>,
    gcode: Vec<String>,
) {
    let started = Instant::now();
    let total = gcode.len();
    let mut last_percent = None;
    let _ = jobs.send(JobState::Running);

    for (i, command) in gcode.iter().enumerate() {
        let mut paused = false;
        loop {
            let requested = *control.borrow_and_update();
            match requested {
                JobControl::Run => break,
                JobControl::Stop => {
                    tracing::info!(sent = i, total, "job stopped");
                    let _ = jobs.send(JobState::Stopped);
                    return;
                }
                JobControl::Pause => {}
            }
            if !paused {
                paused = true;
                let _ = jobs.send(JobState::Paused);
            }
            if control.changed().await.is_err() {
                return;
            }
        }
        if paused {
            let _ = jobs.send(JobState::Running);
        }

        if let Err(err) = line.command(command).await {
            tracing::warn!(line = i, command = %command, error = format!("{:?}", err), "job aborted");
            let _ = jobs.send(JobState::Stopped);
            return;
        }

        let percent = (i + 1) * 100 / total;
        if last_percent != Some(percent) {
            last_percent = Some(percent);
            core.events().emit(MachineEvent::JobProgress {
                progress: JobProgress {
                    progress: (i + 1) as f64 / total as f64,
                    elapsed_secs: started.elapsed().as_secs(),
                    remaining_secs: None,
                },
            });
        }
    }

    tracing::info!(total, "job completed");
    let _ = jobs.send(JobState::Completed);
}

impl Control for SerialTextSession {
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
        let job = self.job.lock().take();
        if let Some(job) = job {
            job.handle.abort();
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = format!("{:?}", err), "serial task panicked");
            }
        }
        self.line.shutdown().await;

        if orderly {
            self.core.transition(SessionState::Closed);
        }
        Ok(())
    }

    async fn home(&self) -> Result<()> {
        self.line.command("G28").await?;
        Ok(())
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
        let command = match heater {
            Heater::Nozzle(0) => format!("M104 S{}", celsius),
            Heater::Nozzle(nozzle) => format!("M104 T{} S{}", nozzle, celsius),
            Heater::Bed(_) => format!("M140 S{}", celsius),
        };
        self.line.command(&command).await?;
        Ok(())
    }

    async fn set_tool_power(&self, percent: u8) -> Result<()> {
        let command = match percent.min(100) {
            0 => "M5".to_owned(),
            percent => format!("M3 P{}", percent),
        };
        self.line.command(&command).await?;
        Ok(())
    }

    async fn execute_gcode(&self, line: &str) -> Result<String> {
        self.line.command(line.trim()).await
    }
}

impl ControlJob for SerialTextSession {
    type Error = anyhow::Error;

    async fn start_job(&self, path: &Path) -> Result<()> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let gcode = job_lines(&text);
        if gcode.is_empty() {
            bail!("{} has no commands", path.display());
        }

        let mut job = self.job.lock();
        if job.as_ref().is_some_and(|run| !run.handle.is_finished()) {
            bail!("a job is already running");
        }

        tracing::info!(path = %path.display(), lines = gcode.len(), "streaming job");
        let (control, control_rx) = watch::channel(JobControl::Run);
        let job_run = run_job(
            self.core.clone(),
            self.line.clone(),
            self.jobs.clone(),
            control_rx,
            gcode,
        );
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => tracing::info!("session ended, job abandoned"),
                _ = job_run => {}
            }
        });
        *job = Some(JobRun { handle, control });
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.control_job(JobControl::Pause)
    }

    async fn resume(&self) -> Result<()> {
        self.control_job(JobControl::Run)
    }

    async fn stop(&self) -> Result<()> {
        self.control_job(JobControl::Stop)
    }

    async fn upload_file(&self, path: &Path) -> Result<()> {
        bail!(
            "{}: machines on the serial text protocol have no storage, stream it with start_job instead",
            path.display()
        )
    }
}
