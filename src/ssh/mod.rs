//! Pure Rust SSH layer for fleetcp.
//!
//! Nothing here shells out locally: connections, command execution and the
//! scp upload protocol are all driven through russh.
//!
//! ## Modules
//!
//! - [`config`] - Connection descriptors and fixed timeouts
//! - [`auth`] - Password / private key auth method selection
//! - [`client`] - Connection management, direct or via a jump host
//! - [`exec`] - Remote command execution
//! - [`scp`] - File upload through a remote `scp -t` sink

mod auth;
mod client;
pub mod config;
mod exec;
mod scp;
#[cfg(all(test, unix))]
mod test_server;

pub use client::{Connector, RemoteClient, SshConnector};
pub use config::ConnInfo;
