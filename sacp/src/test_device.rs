//! In-memory stand-in for a device on the far end of the transport.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::{CommandPair, Packet, PacketParser, PeerId};

pub(crate) struct TestDevice {
    stream: DuplexStream,
    parser: PacketParser,
}

impl TestDevice {
    /// Returns the host end of the transport and the device.
    pub(crate) fn pair() -> (DuplexStream, Self) {
        let (host, device) = tokio::io::duplex(1 << 20);
        (
            host,
            Self {
                stream: device,
                parser: PacketParser::new(),
            },
        )
    }

    pub(crate) async fn recv(&mut self) -> Packet {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.parser.next_packet() {
                return frame.expect("host sent a malformed frame");
            }
            let n = self.stream.read(&mut buf).await.expect("read from host");
            assert!(n > 0, "host closed the transport");
            self.parser.push(&buf[..n]);
        }
    }

    pub(crate) async fn send(&mut self, packet: &Packet) {
        let bytes = packet.encode().expect("encodable frame");
        self.stream.write_all(&bytes).await.expect("write to host");
    }

    pub(crate) async fn reply(&mut self, request: &Packet, data: impl Into<Bytes>) {
        self.send(&Packet::response_to(request, data.into())).await;
    }

    /// A device-initiated request, used both for pushes and for chunk pulls.
    pub(crate) async fn push(&mut self, command: CommandPair, sequence: u16, data: impl Into<Bytes>) {
        let packet = Packet::request(PeerId::CONTROLLER, PeerId::HOST, sequence, command, data.into());
        self.send(&packet).await;
    }
}
