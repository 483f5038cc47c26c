//! SACP wire framing.
//!
//! A frame on the wire:
//!
//! | offset  | width | field                                  |
//! |---------|-------|----------------------------------------|
//! | 0       | 2     | signature `0xAA 0x55`                  |
//! | 2       | 2     | length (LE), bytes following the header |
//! | 4       | 1     | protocol version (`0x01`)              |
//! | 5       | 1     | receiver id                            |
//! | 6       | 1     | CRC-8 over bytes `0..6`                |
//! | 7       | 1     | sender id                              |
//! | 8       | 1     | attribute (0 request, 1 response)      |
//! | 9       | 2     | sequence id (LE)                       |
//! | 11      | 1     | command set                            |
//! | 12      | 1     | command id                             |
//! | 13      | n     | payload                                |
//! | 13 + n  | 2     | checksum (LE) over bytes `7..13 + n`   |

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{CommandPair, DecodeError, Error};

/// Frame signature bytes.
pub const SIGNATURE: [u8; 2] = [0xAA, 0x55];

/// Protocol version this crate speaks.
pub const VERSION: u8 = 0x01;

/// Bytes up to and including the header CRC.
pub const HEADER_LEN: usize = 7;

/// Sender, attribute, sequence, and command pair.
const ROUTING_LEN: usize = 6;

/// Trailing checksum.
const CHECKSUM_LEN: usize = 2;

/// Smallest legal value of the length field (empty payload).
const MIN_BODY_LEN: usize = ROUTING_LEN + CHECKSUM_LEN;

/// Largest payload that fits the 16-bit length field.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - MIN_BODY_LEN;

/// Whether a frame is a request or the response to one.
///
/// Device pushes for subscriptions travel as requests; the dispatcher
/// tells them apart by command pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// A request (from either side).
    Request,
    /// A response echoing a request's sequence id.
    Response,
}

impl Attribute {
    fn to_byte(self) -> u8 {
        match self {
            Attribute::Request => 0,
            Attribute::Response => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        match byte {
            0 => Ok(Attribute::Request),
            1 => Ok(Attribute::Response),
            other => Err(DecodeError::UnknownAttribute(other)),
        }
    }
}

/// One decoded SACP frame. Checksums are computed on encode and verified
/// on decode, so they are not carried here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Peer the frame is addressed to.
    pub receiver_id: u8,
    /// Peer that sent the frame.
    pub sender_id: u8,
    /// Request or response.
    pub attribute: Attribute,
    /// Correlation id.
    pub sequence: u16,
    /// Operation.
    pub command: CommandPair,
    /// Operation-specific payload.
    pub data: Bytes,
}

impl Packet {
    /// Build a request frame.
    pub fn request(sender_id: u8, receiver_id: u8, sequence: u16, command: CommandPair, data: Bytes) -> Self {
        Self {
            receiver_id,
            sender_id,
            attribute: Attribute::Request,
            sequence,
            command,
            data,
        }
    }

    /// Build the response to `request`, swapping the peer ids and echoing
    /// its sequence id and command pair.
    pub fn response_to(request: &Packet, data: Bytes) -> Self {
        Self {
            receiver_id: request.sender_id,
            sender_id: request.receiver_id,
            attribute: Attribute::Response,
            sequence: request.sequence,
            command: request.command,
            data,
        }
    }

    /// The leading result byte of a response payload, if any.
    pub fn result(&self) -> Option<u8> {
        self.data.first().copied()
    }

    /// Serialize this frame to wire bytes. Payloads longer than
    /// [MAX_PAYLOAD_LEN] are rejected.
    pub fn encode(&self) -> Result<Bytes, Error> {
        let data = &self.data[..];
        if data.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge {
                len: data.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        let length = data.len() + MIN_BODY_LEN;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + length);
        buf.put_slice(&SIGNATURE);
        buf.put_u16_le(length as u16);
        buf.put_u8(VERSION);
        buf.put_u8(self.receiver_id);
        let header_crc = crc8(&buf[..HEADER_LEN - 1]);
        buf.put_u8(header_crc);

        buf.put_u8(self.sender_id);
        buf.put_u8(self.attribute.to_byte());
        buf.put_u16_le(self.sequence);
        buf.put_u8(self.command.main);
        buf.put_u8(self.command.sub);
        buf.put_slice(data);

        let checksum = checksum16(&buf[HEADER_LEN..]);
        buf.put_u16_le(checksum);

        Ok(buf.freeze())
    }

    /// Decode exactly one complete frame.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        if frame.len() < HEADER_LEN + MIN_BODY_LEN {
            return Err(DecodeError::BadLength(frame.len()));
        }

        let expected_crc = crc8(&frame[..HEADER_LEN - 1]);
        if expected_crc != frame[HEADER_LEN - 1] {
            return Err(DecodeError::HeaderChecksum {
                expected: expected_crc,
                actual: frame[HEADER_LEN - 1],
            });
        }

        if frame[4] != VERSION {
            return Err(DecodeError::UnsupportedVersion(frame[4]));
        }

        let length = u16::from_le_bytes([frame[2], frame[3]]) as usize;
        if length < MIN_BODY_LEN || HEADER_LEN + length != frame.len() {
            return Err(DecodeError::BadLength(length));
        }

        let body_end = frame.len() - CHECKSUM_LEN;
        let expected = checksum16(&frame[HEADER_LEN..body_end]);
        let actual = u16::from_le_bytes([frame[body_end], frame[body_end + 1]]);
        if expected != actual {
            return Err(DecodeError::Checksum { expected, actual });
        }

        let mut body = &frame[HEADER_LEN..body_end];
        let sender_id = body.get_u8();
        let attribute = Attribute::from_byte(body.get_u8())?;
        let sequence = body.get_u16_le();
        let main = body.get_u8();
        let sub = body.get_u8();

        Ok(Self {
            receiver_id: frame[5],
            sender_id,
            attribute,
            sequence,
            command: CommandPair::new(main, sub),
            data: Bytes::copy_from_slice(body),
        })
    }
}

/// Incremental frame parser.
///
/// Transport reads are pushed in as they arrive; complete frames are
/// pulled out with [PacketParser::next_packet]. A read may hold zero, one,
/// or many frames, and a frame may straddle several reads.
#[derive(Debug, Default)]
pub struct PacketParser {
    buf: BytesMut,
}

impl PacketParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pull the next frame out of the buffer.
    ///
    /// Returns `None` when more bytes are needed. A malformed frame yields
    /// `Some(Err(_))` once; its bytes are dropped and parsing resumes at the
    /// next signature, so later frames are unaffected.
    pub fn next_packet(&mut self) -> Option<Result<Packet, DecodeError>> {
        match find_signature(&self.buf) {
            Some(0) => {}
            Some(offset) => {
                tracing::debug!(skipped = offset, "discarding bytes before frame signature");
                self.buf.advance(offset);
            }
            None => {
                // Keep a trailing 0xAA, it may be the first half of a signature.
                let keep = usize::from(self.buf.last() == Some(&SIGNATURE[0]));
                let drop = self.buf.len() - keep;
                if drop > 0 {
                    tracing::debug!(dropped = drop, "no frame signature in buffer");
                    self.buf.advance(drop);
                }
                return None;
            }
        }

        if self.buf.len() < HEADER_LEN {
            return None;
        }

        let expected_crc = crc8(&self.buf[..HEADER_LEN - 1]);
        if expected_crc != self.buf[HEADER_LEN - 1] {
            let actual = self.buf[HEADER_LEN - 1];
            self.buf.advance(1);
            return Some(Err(DecodeError::HeaderChecksum {
                expected: expected_crc,
                actual,
            }));
        }

        if self.buf[4] != VERSION {
            let version = self.buf[4];
            self.buf.advance(1);
            return Some(Err(DecodeError::UnsupportedVersion(version)));
        }

        let length = u16::from_le_bytes([self.buf[2], self.buf[3]]) as usize;
        if length < MIN_BODY_LEN {
            self.buf.advance(1);
            return Some(Err(DecodeError::BadLength(length)));
        }

        let total = HEADER_LEN + length;
        if self.buf.len() < total {
            return None;
        }

        // The header is trustworthy, so the declared length bounds the frame
        // even when the body checksum turns out to be wrong.
        let frame = self.buf.split_to(total);
        Some(Packet::decode(&frame))
    }
}

fn find_signature(buf: &[u8]) -> Option<usize> {
    buf.windows(SIGNATURE.len()).position(|w| w == SIGNATURE)
}

/// CRC-8, polynomial 0x07, zero init, MSB first.
pub fn crc8(bytes: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for byte in bytes {
        for bit in (0..8).rev() {
            let data_bit = (byte >> bit) & 0x01 == 1;
            let top_bit = crc & 0x80 != 0;
            crc <<= 1;
            if data_bit ^ top_bit {
                crc ^= 0x07;
            }
        }
    }
    crc
}

/// One's complement sum of big-endian 16-bit words, folded to 16 bits.
pub fn checksum16(bytes: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = bytes.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u32::from(*last);
    }
    while sum > 0xffff {
        sum = (sum >> 16) + (sum & 0xffff);
    }
    !(sum as u16)
}
