//! Stop server command.
//!
//! Drops a stop marker next to the port file; the owning server notices it
//! on its next port file check and shuts down.

use std::path::PathBuf;

use console::style;

use crate::{Result, portfile::PortFileRegistry};

/// Executes the stop command for the server owning `portfile`.
pub async fn execute(portfile: PathBuf, registry: &PortFileRegistry) -> Result<()> {
   let handle = registry.get(&portfile)?;

   if !handle.exists() {
      println!("{}", style("No server running for this port file").yellow());
      return Ok(());
   }

   handle.request_stop()?;
   println!("{}", style("Stop requested").green());
   println!("Marker: {}", style(handle.stop_path().display()).dim());
   Ok(())
}
