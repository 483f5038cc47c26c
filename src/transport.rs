//! Byte-stream transports: TCP sockets and serial lines.
//!
//! Both end up as a [BoxTransport], the duplex stream every session is
//! built on.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

/// A duplex byte stream a session can own.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased [Transport].
pub type BoxTransport = Box<dyn Transport>;

/// Connect to `host:port`, giving up after `timeout`.
pub async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .with_context(|| format!("timed out connecting to {}:{}", host, port))?
        .with_context(|| format!("failed to connect to {}:{}", host, port))?;

    // Frames are small and latency matters more than throughput.
    stream.set_nodelay(true)?;
    tracing::debug!(host, port, "tcp connected");
    Ok(stream)
}

/// Open a serial port.
#[cfg(feature = "serial")]
pub fn open_serial(path: &str, baud: u32) -> Result<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let stream = tokio_serial::new(path, baud)
        .open_native_async()
        .with_context(|| format!("failed to open serial port {}", path))?;
    tracing::debug!(path, baud, "serial port opened");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_connect_tcp() -> TestResult {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let stream = connect_tcp("127.0.0.1", port, Duration::from_secs(1)).await?;
        let boxed: BoxTransport = Box::new(stream);
        drop(boxed);
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_tcp_refused() -> TestResult {
        let port = portpicker::pick_unused_port().ok_or("no free port")?;
        assert!(connect_tcp("127.0.0.1", port, Duration::from_secs(1)).await.is_err());
        Ok(())
    }
}
