//! Compile server: port file publication, accept loop and shutdown.
//!
//! Startup runs entirely under the port file lock: check for a live owner,
//! build the compiler chain, bind a loopback listener, publish
//! `(port, cookie)`, unlock. Only then does the monitor start and the accept
//! loop run. Any of the monitor, the idle timer or an explicit stop ends the
//! loop through [`Shutdown::initiate`].

pub mod connection;
mod error_log;
pub mod monitor;
mod shutdown;

use std::{
   net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener},
   sync::Arc,
   time::Duration,
};

pub use error_log::ErrorLog;
pub use monitor::PortFileMonitor;
pub use shutdown::Shutdown;
use tokio::{net::TcpListener, time};
use tokio_util::sync::CancellationToken;

use crate::{
   Result,
   compiler::Compiler,
   config::{RequestLimits, ServerSettings},
   error::SocketError,
   idle::{IdleResetCompiler, ShutdownTrigger},
   pool::PooledCompiler,
   portfile::{PortFile, PortFileValues},
};

/// Pause before accepting again after a failed accept.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Result of a startup attempt.
pub enum Startup {
   /// Another live server already published values in the port file.
   AlreadyRunning(PortFileValues),
   Listening(RunningServer),
}

pub struct Server {
   settings: ServerSettings,
   backend:  Arc<dyn Compiler>,
   portfile: Arc<PortFile>,
   cookie:   i64,
}

impl Server {
   pub fn new(
      settings: ServerSettings,
      backend: Arc<dyn Compiler>,
      portfile: Arc<PortFile>,
   ) -> Self {
      Self { settings, backend, portfile, cookie: new_cookie() }
   }

   pub fn cookie(&self) -> i64 {
      self.cookie
   }

   /// Runs [`Self::start`] on the blocking pool.
   pub async fn launch(self) -> Result<Startup> {
      tokio::task::spawn_blocking(move || self.start()).await?
   }

   /// Publishes this server in the port file and binds the listener.
   ///
   /// Blocks on the port file lock. Must be called from within a tokio
   /// runtime; async callers use [`Self::launch`].
   pub fn start(self) -> Result<Startup> {
      let Self { settings, backend, portfile, cookie } = self;
      let error_log = Arc::new(ErrorLog::for_portfile(portfile.path()));

      let mut lock = portfile.lock()?;
      if let Some(existing) = lock.read_values() {
         lock.unlock()?;
         tracing::info!(
            port = existing.port,
            "server already running for {}",
            portfile.path().display()
         );
         return Ok(Startup::AlreadyRunning(existing));
      }

      let shutdown = Arc::new(Shutdown::new(Arc::clone(&portfile), Arc::clone(&error_log)));
      let pooled: Arc<dyn Compiler> = Arc::new(PooledCompiler::new(backend, settings.pool_size));
      let idle = Arc::new(IdleResetCompiler::new(
         pooled,
         settings.keepalive,
         Arc::clone(&shutdown) as Arc<dyn ShutdownTrigger>,
      ));

      let bound = bind_loopback().and_then(|listener| {
         let port = listener.local_addr().map_err(SocketError::Bind)?.port();
         lock.set_values(port, cookie)?;
         Ok((listener, port))
      });
      let (listener, port) = match bound {
         Ok(bound) => bound,
         Err(e) => {
            idle.cancel_timer();
            return Err(e);
         },
      };
      lock.unlock()?;

      let values = PortFileValues { port, cookie };
      tracing::info!(
         port,
         pool_size = settings.pool_size,
         "server published in {}",
         portfile.path().display()
      );

      let monitor = PortFileMonitor::spawn(
         Arc::clone(&portfile),
         Arc::clone(&shutdown),
         settings.monitor_interval,
         shutdown.monitor_token(),
      );

      Ok(Startup::Listening(RunningServer {
         listener,
         compiler: idle,
         shutdown,
         monitor,
         error_log,
         values,
         limits: settings.limits,
      }))
   }
}

/// A fresh server incarnation cookie, all 64 bits random.
pub fn new_cookie() -> i64 {
   rand::random()
}

fn bind_loopback() -> Result<TcpListener> {
   let std_listener = StdTcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
      .map_err(SocketError::Bind)?;
   std_listener
      .set_nonblocking(true)
      .map_err(SocketError::Bind)?;
   Ok(TcpListener::from_std(std_listener).map_err(SocketError::Bind)?)
}

pub struct RunningServer {
   listener:  TcpListener,
   compiler:  Arc<IdleResetCompiler>,
   shutdown:  Arc<Shutdown>,
   monitor:   PortFileMonitor,
   error_log: Arc<ErrorLog>,
   values:    PortFileValues,
   limits:    RequestLimits,
}

impl RunningServer {
   pub fn port(&self) -> u16 {
      self.values.port
   }

   pub fn cookie(&self) -> i64 {
      self.values.cookie
   }

   pub fn values(&self) -> PortFileValues {
      self.values
   }

   pub fn shutdown_handle(&self) -> Arc<Shutdown> {
      Arc::clone(&self.shutdown)
   }

   pub fn error_log_path(&self) -> &std::path::Path {
      self.error_log.path()
   }

   /// Accepts connections until shutdown, then drains the worker pool.
   /// Returns the process exit status.
   pub async fn run(self) -> Result<i32> {
      let Self { listener, compiler, shutdown, monitor, error_log, limits, .. } = self;
      let accept = shutdown.accept_token();

      loop {
         tokio::select! {
            biased;
            () = accept.cancelled() => break,
            accepted = listener.accept() => match accepted {
               Ok((stream, peer)) => {
                  tracing::debug!(%peer, "connection accepted");
                  let compiler = Arc::clone(&compiler) as Arc<dyn Compiler>;
                  let error_log = Arc::clone(&error_log);
                  tokio::spawn(async move {
                     if let Err(e) = connection::handle(stream, compiler, error_log, limits).await {
                        tracing::debug!(%peer, "connection ended with error: {e}");
                     }
                  });
               },
               Err(e) => {
                  error_log.record("accept", &SocketError::Accept(e));
                  if !back_off(&accept).await {
                     break;
                  }
               },
            },
         }
      }
      drop(listener);
      let reason = shutdown.reason();
      tracing::info!(reason = reason.as_deref().unwrap_or("unknown"), "server stopped accepting");

      compiler.shutdown().await;
      monitor.join().await;
      Ok(0)
   }
}

/// Waits out [`ACCEPT_ERROR_BACKOFF`]. Returns `false` if shutdown began
/// meanwhile.
async fn back_off(accept: &CancellationToken) -> bool {
   tokio::select! {
      biased;
      () = accept.cancelled() => false,
      () = time::sleep(ACCEPT_ERROR_BACKOFF) => true,
   }
}
