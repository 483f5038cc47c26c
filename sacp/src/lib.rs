//! Rust client for SACP, the binary request/response protocol spoken by
//! networked and serial-attached fabrication machines.
//!
//! The crate is layered leaves first: [packet] frames bytes on the wire,
//! [dispatcher] correlates requests with responses over any duplex byte
//! stream, [client] exposes one typed method per device operation, and
//! [file_transfer] implements the device-pull upload protocol.

#![deny(missing_docs)]

pub mod client;
pub mod command;
pub mod dispatcher;
mod error;
pub mod file_transfer;
pub mod module;
pub mod packet;
pub mod payload;
mod pending;
pub mod telemetry;
#[cfg(test)]
mod test_device;

pub use client::Client;
pub use command::{CommandPair, PeerId};
pub use dispatcher::{check_result, Dispatcher, DispatcherConfig, SubscriptionId};
pub use error::{DecodeError, Error, Result};
pub use packet::{Attribute, Packet, PacketParser};
