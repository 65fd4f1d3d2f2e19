//! Fan-out of copy jobs and commands across a fleet of devices.

mod manager;

use std::path::PathBuf;

use serde::Deserialize;

pub use manager::TaskManager;

/// Files to upload into one remote directory, applied to every device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CopyInfo {
    pub source: Vec<PathBuf>,
    pub destination: String,
}

/// Everything that happened on one device, in order.
///
/// An empty `log` means every copy and command went through cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecLog {
    pub device: String,
    pub log: String,
}
