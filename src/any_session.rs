use std::path::Path;

use anyhow::Result;

use crate::{
    session::{HttpSession, SacpSession, SerialTextSession},
    Control, ControlJob, Heater, Protocol, SessionState, TelemetrySnapshot,
};

/// AnySession is a live session over any supported protocol.
#[derive(Debug)]
pub enum AnySession {
    /// Binary SACP over TCP or serial.
    Sacp(SacpSession),

    /// Legacy HTTP api.
    Http(HttpSession),

    /// Line-oriented G-code over serial.
    SerialText(SerialTextSession),
}

macro_rules! def_session_stubs {
    ($name:ident($session:path)) => {
        impl From<$session> for AnySession {
            fn from(session: $session) -> Self {
                Self::$name(session)
            }
        }
    };
}

def_session_stubs!(Sacp(SacpSession));
def_session_stubs!(Http(HttpSession));
def_session_stubs!(SerialText(SerialTextSession));

macro_rules! for_all {
    (|$slf:ident, $session:ident| $body:block) => {
        match $slf {
            Self::Sacp($session) => $body,
            Self::Http($session) => $body,
            Self::SerialText($session) => $body,
        }
    };
}

impl AnySession {
    /// Protocol the session speaks.
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Sacp(_) => Protocol::Sacp,
            Self::Http(_) => Protocol::LegacyHttp,
            Self::SerialText(_) => Protocol::SerialText,
        }
    }
}

impl Control for AnySession {
    type Error = anyhow::Error;

    fn state(&self) -> SessionState {
        for_all!(|self, session| { session.state() })
    }

    fn snapshot(&self) -> TelemetrySnapshot {
        for_all!(|self, session| { session.snapshot() })
    }

    async fn close(&self) -> Result<()> {
        for_all!(|self, session| { session.close().await })
    }

    async fn home(&self) -> Result<()> {
        for_all!(|self, session| { session.home().await })
    }

    async fn jog(&self, x: f64, y: f64, z: f64, feed_rate: u16) -> Result<()> {
        for_all!(|self, session| { session.jog(x, y, z, feed_rate).await })
    }

    async fn set_temperature(&self, heater: Heater, celsius: u16) -> Result<()> {
        for_all!(|self, session| { session.set_temperature(heater, celsius).await })
    }

    async fn set_tool_power(&self, percent: u8) -> Result<()> {
        for_all!(|self, session| { session.set_tool_power(percent).await })
    }

    async fn execute_gcode(&self, line: &str) -> Result<String> {
        for_all!(|self, session| { session.execute_gcode(line).await })
    }
}

impl ControlJob for AnySession {
    type Error = anyhow::Error;

    async fn start_job(&self, path: &Path) -> Result<()> {
        for_all!(|self, session| { session.start_job(path).await })
    }

    async fn pause(&self) -> Result<()> {
        for_all!(|self, session| { session.pause().await })
    }

    async fn resume(&self) -> Result<()> {
        for_all!(|self, session| { session.resume().await })
    }

    async fn stop(&self) -> Result<()> {
        for_all!(|self, session| { session.stop().await })
    }

    async fn upload_file(&self, path: &Path) -> Result<()> {
        for_all!(|self, session| { session.upload_file(path).await })
    }
}
