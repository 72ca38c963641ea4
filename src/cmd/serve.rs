//! Long-running compile server command.
//!
//! Publishes the server in its port file and answers compile requests until
//! it goes idle, is asked to stop, loses the port file or gets Ctrl+C.

use std::{fs, sync::Arc};

use console::style;
use tokio::signal;

use crate::{
   Result,
   backend::ProcessBackend,
   compiler::Compiler,
   config::{self, ServerSettings},
   portfile::PortFileRegistry,
   server::{Server, Startup},
};

/// Runs a server for `settings`. Returns the process exit status.
pub async fn execute(settings: &str, registry: &PortFileRegistry) -> Result<i32> {
   let settings = ServerSettings::parse(settings, config::get())?;
   if let Some(parent) = settings.portfile.parent() {
      fs::create_dir_all(parent)?;
   }

   let portfile = registry.get(&settings.portfile)?;
   let backend: Arc<dyn Compiler> = Arc::new(ProcessBackend::new(settings.compiler.clone()));
   let pool_size = settings.pool_size;
   let keepalive = settings.keepalive;

   let running = match Server::new(settings, backend, Arc::clone(&portfile)).launch().await? {
      Startup::AlreadyRunning(values) => {
         println!(
            "{}",
            style(format!("Server already running on port {}", values.port)).yellow()
         );
         return Ok(0);
      },
      Startup::Listening(running) => running,
   };

   println!("{}", style("Starting warmc server...").green().bold());
   println!("Listening: {}", style(format!("127.0.0.1:{}", running.port())).cyan());
   println!("Port file: {}", style(portfile.path().display()).dim());
   println!("Workers: {pool_size}, keepalive: {}s", keepalive.as_secs());

   let shutdown = running.shutdown_handle();
   tokio::spawn(async move {
      if signal::ctrl_c().await.is_ok() {
         let stopped = tokio::task::spawn_blocking(move || shutdown.initiate("interrupted"));
         if let Err(e) = stopped.await {
            tracing::error!("shutdown after interrupt failed: {e}");
         }
      }
   });

   let code = running.run().await?;
   println!("{}", style("Server stopped").dim());
   Ok(code)
}
