//! warmc: a persistent compile server coordinated through a port file.
//!
//! A server publishes its loopback port and a random cookie in a shared port
//! file, answers compile requests through a bounded worker pool and shuts
//! itself down when idle, when told to stop, or when it loses the port file.

pub mod backend;
pub mod client;
pub mod cmd;
pub mod compiler;
pub mod config;
pub mod error;
pub mod idle;
pub mod pool;
pub mod portfile;
pub mod protocol;
pub mod server;

pub use error::{Error, Result};
