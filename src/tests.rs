use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use sacp::{
    module::HeadType, payload::PayloadWriter, telemetry::SeriesModel, CommandPair, Packet, PacketParser, PeerId,
};
use test_context::{test_context, AsyncTestContext};
use testresult::TestResult;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::{broadcast, mpsc},
};

use crate::{Config, ConnectionManager, JobState, MachineEvent, Protocol, SessionState};

const HEAD_KEY: u8 = 3;

/// A scripted SACP machine on the far end of an in-memory stream. Answers
/// every request, logs what it was asked, and sends whatever pushes it is
/// handed.
struct FakeMachine {
    stream: DuplexStream,
    parser: PacketParser,
    refuse_connect: bool,
    log: Arc<Mutex<Vec<CommandPair>>>,
}

struct MachineHandle {
    host: DuplexStream,
    pushes: mpsc::UnboundedSender<Packet>,
    log: Arc<Mutex<Vec<CommandPair>>>,
}

impl FakeMachine {
    fn spawn(refuse_connect: bool) -> MachineHandle {
        let (host, device) = tokio::io::duplex(1 << 16);
        let (pushes, rx) = mpsc::unbounded_channel();
        let log = Arc::new(Mutex::new(vec![]));

        let machine = FakeMachine {
            stream: device,
            parser: PacketParser::new(),
            refuse_connect,
            log: log.clone(),
        };
        tokio::spawn(machine.run(rx));

        MachineHandle { host, pushes, log }
    }

    async fn run(mut self, mut pushes: mpsc::UnboundedReceiver<Packet>) {
        loop {
            tokio::select! {
                packet = self.recv() => {
                    let Some(packet) = packet else { return };
                    if packet.attribute == sacp::Attribute::Request {
                        self.log.lock().push(packet.command);
                        let reply = self.answer(&packet);
                        self.send(&Packet::response_to(&packet, reply)).await;
                    }
                }
                Some(push) = pushes.recv() => self.send(&push).await,
            }
        }
    }

    fn answer(&self, request: &Packet) -> Bytes {
        match request.command {
            CommandPair::CONNECT if self.refuse_connect => Bytes::from_static(&[1]),
            CommandPair::MACHINE_INFO => PayloadWriter::new()
                .u8(0)
                .u8(2)
                .u8(1)
                .string("SN0001")
                .string("2.1.0")
                .finish()
                .unwrap(),
            CommandPair::MODULE_INFO => PayloadWriter::new()
                .u8(0)
                .u8(1)
                .u8(HEAD_KEY)
                .u16(0)
                .u8(0)
                .u8(0)
                .u32(4242)
                .u8(1)
                .string("1.4.2")
                .finish()
                .unwrap(),
            // Coordinates are optional during the handshake.
            CommandPair::COORDINATE_INFO => Bytes::from_static(&[9]),
            _ => Bytes::from_static(&[0]),
        }
    }

    async fn recv(&mut self) -> Option<Packet> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.parser.next_packet() {
                return frame.ok();
            }
            match self.stream.read(&mut buf).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.parser.push(&buf[..n]),
            }
        }
    }

    async fn send(&mut self, packet: &Packet) {
        // The host may already have hung up.
        if let Ok(bytes) = packet.encode() {
            let _ = self.stream.write_all(&bytes).await;
        }
    }
}

fn heartbeat(sequence: u16) -> Packet {
    Packet::request(
        PeerId::CONTROLLER,
        PeerId::HOST,
        sequence,
        CommandPair::HEARTBEAT,
        Bytes::from_static(&[0, 0]),
    )
}

fn drain(events: &mut broadcast::Receiver<MachineEvent>) -> Vec<MachineEvent> {
    let mut seen = vec![];
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

struct SessionContext {
    manager: ConnectionManager,
    events: broadcast::Receiver<MachineEvent>,
    pushes: mpsc::UnboundedSender<Packet>,
    log: Arc<Mutex<Vec<CommandPair>>>,
}

impl SessionContext {
    async fn new() -> anyhow::Result<Self> {
        let manager = ConnectionManager::new(Config::default());
        let events = manager.subscribe_events();

        let machine = FakeMachine::spawn(false);
        manager.attach(Protocol::Sacp, Box::new(machine.host)).await?;

        Ok(Self {
            manager,
            events,
            pushes: machine.pushes,
            log: machine.log,
        })
    }
}

impl AsyncTestContext for SessionContext {
    async fn setup() -> Self {
        SessionContext::new().await.unwrap()
    }

    async fn teardown(self) {
        self.manager.close().await.unwrap();
    }
}

#[test_context(SessionContext)]
#[tokio::test(start_paused = true)]
async fn test_sacp_session_connects(ctx: &mut SessionContext) -> TestResult {
    assert_eq!(ctx.manager.state().await, SessionState::Connected);
    assert_eq!(ctx.manager.protocol().await, Some(Protocol::Sacp));

    let snapshot = ctx.manager.snapshot().await?;
    assert_eq!(snapshot.head_type, Some(HeadType::Printing));
    assert_eq!(snapshot.tool_head.map(|m| m.key), Some(HEAD_KEY));
    assert_eq!(snapshot.installed_modules.len(), 1);
    assert_eq!(snapshot.series_model, Some(SeriesModel::A350));

    let states: Vec<SessionState> = drain(&mut ctx.events)
        .into_iter()
        .filter_map(|event| match event {
            MachineEvent::StateChanged { state } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::Connecting,
            SessionState::Handshaking,
            SessionState::Connected
        ]
    );

    let log = ctx.log.lock().clone();
    assert_eq!(
        &log[..4],
        &[
            CommandPair::CONNECT,
            CommandPair::MACHINE_INFO,
            CommandPair::MODULE_INFO,
            CommandPair::COORDINATE_INFO
        ]
    );
    assert!(log.contains(&CommandPair::SUBSCRIBE));

    Ok(())
}

#[test_context(SessionContext)]
#[tokio::test(start_paused = true)]
async fn test_sacp_commands_reach_the_machine(ctx: &mut SessionContext) -> TestResult {
    ctx.manager.home().await?;
    ctx.manager.pause().await?;
    ctx.manager.resume().await?;

    let log = ctx.log.lock().clone();
    let tail = &log[log.len() - 3..];
    assert_eq!(
        tail,
        &[
            CommandPair::HOME,
            CommandPair::PAUSE_PRINT,
            CommandPair::RESUME_PRINT
        ]
    );

    Ok(())
}

#[test_context(SessionContext)]
#[tokio::test(start_paused = true)]
async fn test_heartbeat_silence_loses_the_session_once(ctx: &mut SessionContext) -> TestResult {
    ctx.pushes.send(heartbeat(1))?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(ctx.manager.state().await, SessionState::Connected);
    assert!(drain(&mut ctx.events)
        .iter()
        .any(|event| matches!(event, MachineEvent::Telemetry { .. })));

    // Nothing for longer than the liveness window.
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(ctx.manager.state().await, SessionState::Errored);

    // Late frames change nothing.
    for sequence in 2..5 {
        let _ = ctx.pushes.send(heartbeat(sequence));
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(ctx.manager.state().await, SessionState::Errored);

    let lost: Vec<MachineEvent> = drain(&mut ctx.events)
        .into_iter()
        .filter(|event| matches!(event, MachineEvent::ConnectionLost { .. }))
        .collect();
    assert_eq!(lost.len(), 1);

    assert!(ctx.manager.home().await.is_err());

    Ok(())
}

#[test_context(SessionContext)]
#[tokio::test(start_paused = true)]
async fn test_upload_of_missing_file_fails(ctx: &mut SessionContext) -> TestResult {
    let dir = tempfile::tempdir()?;
    let missing = dir.path().join("benchy.gcode");
    drain(&mut ctx.events);

    let err = ctx.manager.upload_file(&missing).await.expect_err("nothing to upload");
    assert!(format!("{:#}", err).contains("benchy.gcode"));

    assert!(!ctx.log.lock().contains(&CommandPair::UPLOAD_START));
    assert!(!drain(&mut ctx.events)
        .iter()
        .any(|event| matches!(event, MachineEvent::FileTransferComplete { .. })));
    assert_eq!(ctx.manager.state().await, SessionState::Connected);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_refused_handshake() -> TestResult {
    let manager = ConnectionManager::new(Config::default());
    let mut events = manager.subscribe_events();

    let machine = FakeMachine::spawn(true);
    let result = manager.attach(Protocol::Sacp, Box::new(machine.host)).await;
    assert!(result.is_err());
    assert_eq!(manager.state().await, SessionState::Idle);

    let seen = drain(&mut events);
    assert!(seen.contains(&MachineEvent::StateChanged {
        state: SessionState::Errored
    }));
    assert_eq!(
        seen.iter()
            .filter(|event| matches!(event, MachineEvent::ConnectionLost { .. }))
            .count(),
        1
    );
    assert!(!seen.iter().any(|event| matches!(event, MachineEvent::Connected { .. })));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_attach_replaces_the_open_session() -> TestResult {
    let manager = ConnectionManager::new(Config::default());

    let first = FakeMachine::spawn(false);
    let first_log = first.log.clone();
    manager.attach(Protocol::Sacp, Box::new(first.host)).await?;

    let mut events = manager.subscribe_events();
    let second = FakeMachine::spawn(false);
    manager.attach(Protocol::Sacp, Box::new(second.host)).await?;

    assert!(first_log.lock().contains(&CommandPair::DISCONNECT));
    assert_eq!(manager.state().await, SessionState::Connected);

    let seen = drain(&mut events);
    let closed = seen
        .iter()
        .position(|event| *event == MachineEvent::Closed)
        .ok_or("first session never closed")?;
    let connected = seen
        .iter()
        .position(|event| matches!(event, MachineEvent::Connected { .. }))
        .ok_or("second session never connected")?;
    assert!(closed < connected);

    manager.close().await?;
    assert_eq!(manager.state().await, SessionState::Idle);
    Ok(())
}

/// A serial G-code machine that acknowledges every line and records the
/// ones that are not telemetry polls.
fn spawn_serial_machine() -> (DuplexStream, Arc<Mutex<Vec<String>>>) {
    let (host, device) = tokio::io::duplex(1 << 12);
    let log = Arc::new(Mutex::new(vec![]));
    let seen = log.clone();

    tokio::spawn(async move {
        let (reader, mut writer) = tokio::io::split(device);
        let mut lines = tokio::io::BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let reply: &[u8] = match line.as_str() {
                "M105" => b"ok T:200.0 /200.0 B:60.0 /60.0\n",
                "M114" => b"X:0.00 Y:0.00 Z:0.00 E:0.00\nok\n",
                "M115" => b"FIRMWARE_NAME:Marlin\nok\n",
                _ => {
                    seen.lock().push(line.clone());
                    b"ok\n"
                }
            };
            if writer.write_all(reply).await.is_err() {
                return;
            }
        }
    });

    (host, log)
}

#[tokio::test(start_paused = true)]
async fn test_run_job_waits_for_the_serial_job() -> TestResult {
    let manager = ConnectionManager::new(Config::default());
    let (host, log) = spawn_serial_machine();
    manager.attach(Protocol::SerialText, Box::new(host)).await?;

    let file = tempfile::NamedTempFile::new()?;
    std::fs::write(file.path(), "G28 ; home\nG1 X10 Y10\nG1 X20\nM84\n")?;

    let state = manager.run_job(file.path()).await?;
    assert_eq!(state, JobState::Completed);
    assert_eq!(*log.lock(), vec!["G28", "G1 X10 Y10", "G1 X20", "M84"]);
    assert_eq!(manager.snapshot().await?.job_state, JobState::Completed);
    assert_eq!(manager.state().await, SessionState::Connected);

    manager.close().await?;
    Ok(())
}
