use crate::CommandPair;

/// Result type used throughout the SACP crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures while turning bytes into frames or payload fields.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The CRC-8 over the fixed header did not match.
    #[error("header checksum mismatch (expected {expected:#04x}, got {actual:#04x})")]
    HeaderChecksum {
        /// Checksum computed locally.
        expected: u8,
        /// Checksum carried by the frame.
        actual: u8,
    },

    /// The 16-bit checksum over the frame body did not match.
    #[error("frame checksum mismatch (expected {expected:#06x}, got {actual:#06x})")]
    Checksum {
        /// Checksum computed locally.
        expected: u16,
        /// Checksum carried by the frame.
        actual: u16,
    },

    /// Protocol version byte we do not speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Attribute byte was neither request nor response.
    #[error("unknown frame attribute {0:#04x}")]
    UnknownAttribute(u8),

    /// Declared length is too short to hold a frame body.
    #[error("declared frame length {0} is invalid")]
    BadLength(usize),

    /// A payload field ran past the end of the data.
    #[error("payload truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the field needed.
        needed: usize,
        /// Bytes left in the payload.
        remaining: usize,
    },

    /// A length-prefixed string was not UTF-8.
    #[error("payload string is not valid utf-8")]
    InvalidString,
}

/// Errors surfaced by the dispatcher, client, and file transfer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport went away while the request was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    /// The dispatcher was already torn down when the call was made.
    #[error("dispatcher is closed")]
    Closed,

    /// No response arrived within the request timeout.
    #[error("timed out waiting for response to {command}")]
    Timeout {
        /// Command pair of the request that timed out.
        command: CommandPair,
    },

    /// The device answered with a non-zero result code.
    #[error("command {command} failed with result code {result}")]
    Command {
        /// Command pair of the failed request.
        command: CommandPair,
        /// Result code reported by the device.
        result: u8,
    },

    /// A frame or payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Transport or file I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A device-request handler is already registered for this command pair.
    #[error("a handler is already registered for {0}")]
    HandlerBusy(CommandPair),

    /// Every sequence slot is occupied by an in-flight request.
    #[error("too many requests in flight")]
    TooManyInFlight,

    /// A payload or one of its fields is too long to put on the wire.
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge {
        /// Bytes that were offered.
        len: usize,
        /// Largest length that fits.
        max: usize,
    },

    /// An upload failed; the connection itself remains usable.
    #[error("file transfer failed: {0}")]
    FileTransfer(String),
}
