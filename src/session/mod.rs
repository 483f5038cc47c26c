//! Live sessions to one machine, one module per protocol.
//!
//! Each session owns its transport and a [SessionCore], which holds the
//! lifecycle state, the latest [TelemetrySnapshot], and the [EventBus]
//! everything is reported through.

mod http;
mod sacp;
mod serial_text;

pub use self::{http::HttpSession, sacp::SacpSession, serial_text::SerialTextSession};

use parking_lot::RwLock;
use ::sacp::telemetry::MachineInfo;
use tokio::sync::watch;

use crate::{EventBus, MachineEvent, Protocol, SessionState, TelemetrySnapshot};

/// State shared between a session's public handle and its background tasks.
///
/// Only the session's own monitor writes the snapshot; everyone else reads.
#[derive(Debug)]
pub struct SessionCore {
    protocol: Protocol,
    state: watch::Sender<SessionState>,
    snapshot: RwLock<TelemetrySnapshot>,
    events: EventBus,
}

impl SessionCore {
    /// A new core in [SessionState::Idle].
    pub fn new(protocol: Protocol, events: EventBus) -> Self {
        Self {
            protocol,
            state: watch::Sender::new(SessionState::Idle),
            snapshot: RwLock::new(TelemetrySnapshot::default()),
            events,
        }
    }

    /// Protocol this session speaks.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Follow lifecycle changes.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// The bus this session reports on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Move to `next` if that is a legal step from the current state.
    /// Returns whether the state changed.
    pub fn transition(&self, next: SessionState) -> bool {
        let mut previous = None;
        let changed = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                previous = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });

        if changed {
            tracing::debug!(protocol = %self.protocol, from = ?previous, to = %next, "session state changed");
            self.events.emit(MachineEvent::StateChanged { state: next });
            if next == SessionState::Closed {
                self.events.emit(MachineEvent::Closed);
            }
        }
        changed
    }

    /// Mark the session live and announce it.
    pub fn connected(&self, machine: Option<MachineInfo>) -> bool {
        if !self.transition(SessionState::Connected) {
            return false;
        }
        self.events.emit(MachineEvent::Connected {
            protocol: self.protocol,
            machine,
        });
        true
    }

    /// Mark the session lost. Only the first call from a live state has any
    /// effect, so [MachineEvent::ConnectionLost] goes out at most once.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        if !self.transition(SessionState::Errored) {
            tracing::debug!(protocol = %self.protocol, reason = %reason, "ignoring failure of finished session");
            return false;
        }
        tracing::warn!(protocol = %self.protocol, reason = %reason, "connection lost");
        self.events.emit(MachineEvent::ConnectionLost { reason });
        true
    }

    /// Copy of the latest snapshot.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot.read().clone()
    }

    /// Apply `f` to the snapshot and return a copy of the result.
    pub(crate) fn update_snapshot(&self, f: impl FnOnce(&mut TelemetrySnapshot)) -> TelemetrySnapshot {
        let mut snapshot = self.snapshot.write();
        f(&mut snapshot);
        snapshot.clone()
    }

    /// Emit the current snapshot as telemetry.
    pub(crate) fn publish_snapshot(&self) {
        let snapshot = self.snapshot();
        self.events.emit(MachineEvent::Telemetry { snapshot });
    }
}
