#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

//! This crate is the control plane for networked and serial-attached
//! fabrication machines: 3D printers, laser engravers, and CNC mills. It
//! detects which protocol a machine speaks, holds one live session to it,
//! keeps a telemetry picture current, and moves files to it.

mod any_session;
pub mod config;
pub mod detect;
pub mod discover;
pub mod events;
mod manager;
pub mod session;
mod traits;
pub mod transport;

pub use any_session::AnySession;
pub use config::Config;
pub use detect::{Protocol, Target};
pub use discover::{DeviceEntry, DeviceRegistry, Discovery};
pub use events::{EventBus, JobProgress, JobState, MachineEvent, SessionState, TelemetrySnapshot};
pub use manager::ConnectionManager;
pub use traits::{Control, ControlJob, Heater};

#[cfg(test)]
mod tests;
