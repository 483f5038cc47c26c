//! Decide which protocol a machine speaks before a session starts.

use std::{str::FromStr, time::Duration};

use anyhow::{bail, Result};
use parse_display::Display;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{config::NetworkConfig, transport::connect_tcp};

/// Vendor command that makes the firmware identify its protocol.
const PROBE_COMMAND: &[u8] = b"M1006\n";

/// Protocols a machine may speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[display(style = "snake_case")]
pub enum Protocol {
    /// Binary SACP, over TCP or serial.
    Sacp,
    /// REST-like HTTP api with status polling.
    LegacyHttp,
    /// Line-oriented G-code over serial.
    SerialText,
}

/// Where a machine is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// Reachable over the network at `host`.
    Network {
        /// Host name or IP address.
        host: String,
    },
    /// Attached to a serial port.
    Serial {
        /// Device path, e.g. `/dev/ttyACM0` or `COM3`.
        path: String,
    },
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Network { host } => write!(f, "{}", host),
            Target::Serial { path } => write!(f, "{}", path),
        }
    }
}

impl FromStr for Target {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            bail!("empty target");
        }

        let is_com_port = match (s.get(..3), s.get(3..)) {
            (Some(prefix), Some(number)) => {
                prefix.eq_ignore_ascii_case("com") && !number.is_empty() && number.chars().all(|c| c.is_ascii_digit())
            }
            _ => false,
        };
        if s.starts_with('/') || is_com_port {
            Ok(Target::Serial { path: s.to_owned() })
        } else {
            Ok(Target::Network { host: s.to_owned() })
        }
    }
}

/// Whether `host:port` accepts a TCP connection within `timeout`.
pub async fn probe_tcp(host: &str, port: u16, timeout: Duration) -> bool {
    match connect_tcp(host, port, timeout).await {
        Ok(_) => true,
        Err(err) => {
            tracing::debug!(host, port, error = format!("{:?}", err), "probe failed");
            false
        }
    }
}

/// Probe the SACP and legacy HTTP ports concurrently. SACP wins whenever
/// it answers; the legacy api is chosen only when SACP does not.
pub async fn detect_network(host: &str, config: &NetworkConfig) -> Result<Protocol> {
    let timeout = config.probe_timeout();

    let http = tokio::spawn({
        let host = host.to_owned();
        let port = config.http_port;
        async move { probe_tcp(&host, port, timeout).await }
    });

    if probe_tcp(host, config.sacp_port, timeout).await {
        http.abort();
        tracing::info!(host, "detected sacp");
        return Ok(Protocol::Sacp);
    }

    if http.await? {
        tracing::info!(host, "detected legacy http");
        return Ok(Protocol::LegacyHttp);
    }

    bail!(
        "{} is unreachable on ports {} and {}",
        host,
        config.sacp_port,
        config.http_port
    )
}

/// Classify a reply to the probe command, if it says anything meaningful.
pub fn classify(reply: &[u8]) -> Option<Protocol> {
    if reply.windows(sacp::packet::SIGNATURE.len()).any(|w| w == sacp::packet::SIGNATURE) {
        return Some(Protocol::Sacp);
    }

    let text = String::from_utf8_lossy(reply);
    if text.contains("SACP") {
        return Some(Protocol::Sacp);
    }
    if text.lines().any(|line| line.trim_start().starts_with("ok")) {
        return Some(Protocol::SerialText);
    }
    None
}

/// Send the probe command down a freshly opened serial line and classify
/// the reply. Silence for `timeout` means a plain G-code firmware.
pub async fn probe_stream<S>(stream: &mut S, timeout: Duration) -> Result<Protocol>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(PROBE_COMMAND).await?;
    stream.flush().await?;

    let deadline = tokio::time::Instant::now() + timeout;
    let mut reply = Vec::new();
    let mut buf = [0u8; 256];

    loop {
        let n = match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => {
                tracing::debug!(received = reply.len(), "no protocol marker before timeout, assuming text");
                return Ok(Protocol::SerialText);
            }
        };
        if n == 0 {
            bail!("serial line closed while probing");
        }

        reply.extend_from_slice(&buf[..n]);
        if let Some(protocol) = classify(&reply) {
            tracing::info!(%protocol, "detected serial protocol");
            return Ok(protocol);
        }
    }
}
