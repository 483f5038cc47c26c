//! Events emitted to whoever is driving the machine.
//!
//! Every session, whatever its protocol, reports through the same
//! [EventBus] with the same [MachineEvent] shapes, so callers never branch
//! on protocol.

use parse_display::Display;
use sacp::{
    module::{HeadType, ModuleInfo},
    telemetry::{Coordinates, HeaterReading, MachineInfo, MachineStatus, SeriesModel},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::Protocol;

const EVENT_CAPACITY: usize = 256;

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[display(style = "snake_case")]
pub enum SessionState {
    /// Not started.
    Idle,
    /// Opening the transport.
    Connecting,
    /// Transport open, protocol handshake in progress.
    Handshaking,
    /// Live.
    Connected,
    /// Orderly shutdown in progress.
    Closing,
    /// Shut down.
    Closed,
    /// Lost: transport failure or liveness timeout.
    Errored,
}

impl SessionState {
    /// Closed and Errored are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }

    /// Whether `self -> next` is a legal step.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Idle, Connecting) | (Connecting, Handshaking) | (Handshaking, Connected) | (Closing, Closed) => true,
            (Idle | Connecting | Handshaking | Connected, Closing) => true,
            (current, Errored) => !current.is_terminal(),
            _ => false,
        }
    }
}

/// What the machine is doing with its job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[display(style = "snake_case")]
pub enum JobState {
    /// No job.
    #[default]
    Idle,
    /// Running, including starting and resuming.
    Running,
    /// Paused, including pausing.
    Paused,
    /// Stopped before completion.
    Stopped,
    /// Ran to completion.
    Completed,
}

impl From<MachineStatus> for JobState {
    fn from(status: MachineStatus) -> Self {
        match status {
            MachineStatus::Starting
            | MachineStatus::Running
            | MachineStatus::Resuming
            | MachineStatus::Recovering
            | MachineStatus::Finishing => Self::Running,
            MachineStatus::Pausing | MachineStatus::Paused => Self::Paused,
            MachineStatus::Stopping | MachineStatus::Stopped => Self::Stopped,
            MachineStatus::Completed => Self::Completed,
            MachineStatus::Idle | MachineStatus::Unknown => Self::Idle,
        }
    }
}

/// Point-in-time view of the machine. Rebuilt from what the machine
/// reports; never incrementally trusted between polls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Broad class of the mounted tool head.
    pub head_type: Option<HeadType>,
    /// The mounted tool head module.
    pub tool_head: Option<ModuleInfo>,
    /// Everything plugged in.
    pub installed_modules: Vec<ModuleInfo>,
    /// Current position.
    pub coordinates: Coordinates,
    /// Whether all axes are homed.
    pub is_homed: bool,
    /// Machine series.
    pub series_model: Option<SeriesModel>,
    /// Nozzle temperatures.
    pub nozzles: Vec<HeaterReading>,
    /// Bed zone temperatures.
    pub bed: Vec<HeaterReading>,
    /// Job state.
    pub job_state: JobState,
}

/// Job progress report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Fraction complete, `0.0..=1.0`.
    pub progress: f64,
    /// Seconds since the job started.
    pub elapsed_secs: u64,
    /// Estimated seconds remaining, when the machine reports it.
    pub remaining_secs: Option<u64>,
}

/// Everything a session tells the outside world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MachineEvent {
    /// The session moved to a new lifecycle state.
    StateChanged {
        /// New state.
        state: SessionState,
    },
    /// The session is live.
    Connected {
        /// Protocol in use.
        protocol: Protocol,
        /// Machine details, when the protocol reports them.
        machine: Option<MachineInfo>,
    },
    /// The session was lost. Emitted at most once per session.
    ConnectionLost {
        /// Why.
        reason: String,
    },
    /// The session was closed on request.
    Closed,
    /// Periodic telemetry snapshot.
    Telemetry {
        /// Current snapshot.
        snapshot: TelemetrySnapshot,
    },
    /// Modules were plugged in or removed.
    ModulesChanged {
        /// The new module list.
        modules: Vec<ModuleInfo>,
    },
    /// Job progress.
    JobProgress {
        /// Progress report.
        progress: JobProgress,
    },
    /// An upload finished.
    FileTransferComplete {
        /// Name on the machine.
        name: String,
        /// Whether the machine accepted the file.
        success: bool,
        /// File length in bytes.
        bytes: u64,
    },
}

/// Fan-out of [MachineEvent]s. Clones share one channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MachineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a new bus.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Send an event to every current subscriber. Events with no
    /// subscribers are dropped.
    pub fn emit(&self, event: MachineEvent) {
        tracing::trace!(?event, "emitting event");
        let _ = self.tx.send(event);
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MachineEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_transitions() {
        use SessionState::*;

        assert!(Idle.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Errored));
        assert!(!Idle.can_transition_to(Connected));
        assert!(!Closed.can_transition_to(Errored));
        assert!(!Errored.can_transition_to(Errored));
        assert!(!Errored.can_transition_to(Closing));
    }

    #[test]
    fn test_event_serialization() {
        let event = MachineEvent::StateChanged { state: SessionState::Connected };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"event":"state_changed","state":"connected"}"#
        );
    }

    #[tokio::test]
    async fn test_bus_fan_out() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.clone().subscribe();

        bus.emit(MachineEvent::Closed);
        assert_eq!(first.recv().await.unwrap(), MachineEvent::Closed);
        assert_eq!(second.recv().await.unwrap(), MachineEvent::Closed);
    }
}
