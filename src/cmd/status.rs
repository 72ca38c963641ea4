//! Server status command.
//!
//! Shows the values published in a port file and whether the server behind
//! them accepts connections.

use std::{
   net::{Ipv4Addr, SocketAddr},
   path::PathBuf,
   sync::Arc,
};

use console::style;
use serde::Serialize;
use tokio::{net::TcpStream, time};

use crate::{
   Result,
   config::{self, ClientSettings},
   portfile::{PortFileRegistry, PortFileValues},
};

#[derive(Serialize)]
struct Status {
   portfile:     PathBuf,
   exists:       bool,
   stop_pending: bool,
   values:       Option<PortFileValues>,
   reachable:    bool,
}

/// Executes the status command for `portfile`.
pub async fn execute(portfile: PathBuf, json: bool, registry: &PortFileRegistry) -> Result<()> {
   let settings = ClientSettings::from_config(config::get());
   let handle = registry.get(&portfile)?;

   let exists = handle.exists();
   let stop_pending = handle.stop_path().exists();
   let reader = Arc::clone(&handle);
   let values = tokio::task::spawn_blocking(move || reader.current_values()).await??;

   let reachable = match values {
      Some(v) => {
         let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, v.port));
         let connected = time::timeout(settings.connect_timeout, TcpStream::connect(addr)).await;
         matches!(connected, Ok(Ok(_)))
      },
      None => false,
   };

   let status = Status {
      portfile: handle.path().to_path_buf(),
      exists,
      stop_pending,
      values,
      reachable,
   };
   if json {
      println!("{}", serde_json::to_string_pretty(&status)?);
      return Ok(());
   }

   let Some(values) = status.values else {
      println!("{}", style("No server running").dim());
      return Ok(());
   };

   let (dot, state) = if status.reachable {
      (style("●").green(), "running")
   } else {
      (style("●").red(), "stale")
   };
   println!(
      "  {dot} {} {}",
      status.portfile.display(),
      style(format!("({state}, port {}, cookie {:#018x})", values.port, values.cookie)).dim()
   );
   if status.stop_pending {
      println!("  {}", style("stop requested").yellow());
   }
   Ok(())
}
