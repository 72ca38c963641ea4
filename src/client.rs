//! Client side of the compile server.
//!
//! Finds the server through the port file, spawning one in the background
//! when allowed and none is published, then sends a single request and
//! relays the log lines it gets back.

use std::{
   net::{Ipv4Addr, SocketAddr},
   process::{Command, Stdio},
   sync::Arc,
};

use parking_lot::Mutex;
use tokio::{io::BufReader, net::TcpStream, time};

use crate::{
   Result,
   compiler::{CompileResult, LogLevel},
   config::{ClientSettings, ServerSettings},
   error::{Error, SocketError},
   portfile::{PortFile, PortFileValues},
   protocol,
};

pub struct Client {
   portfile:    Arc<PortFile>,
   settings:    ClientSettings,
   spawn:       Option<ServerSettings>,
   last_cookie: Mutex<Option<i64>>,
}

impl Client {
   pub fn new(portfile: Arc<PortFile>, settings: ClientSettings) -> Self {
      Self { portfile, settings, spawn: None, last_cookie: Mutex::new(None) }
   }

   /// Starts a background server with `server` when no valid values are
   /// published.
   pub fn with_spawn(mut self, server: ServerSettings) -> Self {
      self.spawn = Some(server);
      self
   }

   /// Cookie of the server that answered the last request.
   pub fn last_cookie(&self) -> Option<i64> {
      *self.last_cookie.lock()
   }

   /// Sends `args` to the server and waits for its result.
   pub async fn compile<F>(&self, args: &[String], on_log: F) -> Result<CompileResult>
   where
      F: FnMut(LogLevel, &str),
   {
      let values = self.resolve_values().await?;
      let stream = self.connect(values.port).await?;
      self.note_cookie(values);

      let (read_half, mut write_half) = stream.into_split();
      protocol::write_request(&mut write_half, args).await?;
      let mut reader = BufReader::new(read_half);
      protocol::read_response(&mut reader, on_log).await
   }

   async fn resolve_values(&self) -> Result<PortFileValues> {
      let portfile = Arc::clone(&self.portfile);
      let current = tokio::task::spawn_blocking(move || portfile.current_values()).await??;
      if let Some(values) = current {
         return Ok(values);
      }

      let Some(server) = &self.spawn else {
         return Err(Error::Server {
            op:     "connect",
            reason: format!("no server published in {}", self.portfile.path().display()),
         });
      };
      spawn_server(server)?;

      let portfile = Arc::clone(&self.portfile);
      let timeout = self.settings.start_timeout;
      let values =
         tokio::task::spawn_blocking(move || portfile.wait_for_valid_values(timeout)).await??;
      Ok(values)
   }

   async fn connect(&self, port: u16) -> Result<TcpStream> {
      let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
      let attempts = self.settings.connect_attempts.max(1);
      let mut last = SocketError::ConnectTimeout(port);

      for attempt in 1..=attempts {
         match time::timeout(self.settings.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(source)) => last = SocketError::Connect { port, source },
            Err(_) => last = SocketError::ConnectTimeout(port),
         }
         tracing::debug!(attempt, port, "connect failed: {last}");
         if attempt < attempts {
            time::sleep(self.settings.connect_retry_delay).await;
         }
      }
      Err(last.into())
   }

   fn note_cookie(&self, values: PortFileValues) {
      let mut last = self.last_cookie.lock();
      if let Some(previous) = *last
         && previous != values.cookie
      {
         tracing::debug!(
            previous,
            cookie = values.cookie,
            port = values.port,
            "reached a different server instance"
         );
      }
      *last = Some(values.cookie);
   }
}

/// Spawns `<current_exe> serve --settings <settings>` detached from our stdio.
pub fn spawn_server(server: &ServerSettings) -> Result<()> {
   let exe = std::env::current_exe().map_err(Error::ServerSpawn)?;
   if let Some(parent) = server.portfile.parent() {
      std::fs::create_dir_all(parent)?;
   }
   tracing::debug!("spawning server for {}", server.portfile.display());

   Command::new(&exe)
      .arg("serve")
      .arg("--settings")
      .arg(server.to_settings_string())
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .spawn()
      .map_err(Error::ServerSpawn)?;

   Ok(())
}
