#![allow(dead_code)]

use std::{
   path::Path,
   sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   },
   time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use warmc::{
   compiler::{CompileResult, Compiler, RequestLog},
   config::{Config, ServerSettings},
   idle::ShutdownTrigger,
   portfile::PortFile,
   server::{RunningServer, Server, Startup},
};

/// Logs every argument at INFO and succeeds, unless the first argument is
/// `fail`.
pub struct EchoCompiler;

#[async_trait]
impl Compiler for EchoCompiler {
   async fn compile(&self, args: &[String], log: &RequestLog) -> CompileResult {
      for arg in args {
         log.info(arg.clone());
      }
      if args.first().is_some_and(|a| a == "fail") {
         log.error("compilation failed");
         return CompileResult::Error;
      }
      CompileResult::Ok
   }
}

/// Panics on `panic`, otherwise behaves like [`EchoCompiler`].
pub struct PanickyCompiler;

#[async_trait]
impl Compiler for PanickyCompiler {
   async fn compile(&self, args: &[String], log: &RequestLog) -> CompileResult {
      if args.iter().any(|a| a == "panic") {
         log.warn("about to fail");
         panic!("backend exploded");
      }
      EchoCompiler.compile(args, log).await
   }
}

/// Blocks every compile until the test releases it, recording concurrency.
pub struct GatedCompiler {
   gate:     Semaphore,
   running:  AtomicUsize,
   max_seen: AtomicUsize,
   entered:  AtomicUsize,
}

impl GatedCompiler {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         gate:     Semaphore::new(0),
         running:  AtomicUsize::new(0),
         max_seen: AtomicUsize::new(0),
         entered:  AtomicUsize::new(0),
      })
   }

   pub fn release(&self, n: usize) {
      self.gate.add_permits(n);
   }

   pub fn running(&self) -> usize {
      self.running.load(Ordering::SeqCst)
   }

   pub fn max_seen(&self) -> usize {
      self.max_seen.load(Ordering::SeqCst)
   }

   pub fn entered(&self) -> usize {
      self.entered.load(Ordering::SeqCst)
   }
}

#[async_trait]
impl Compiler for GatedCompiler {
   async fn compile(&self, _args: &[String], log: &RequestLog) -> CompileResult {
      self.entered.fetch_add(1, Ordering::SeqCst);
      let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
      self.max_seen.fetch_max(now, Ordering::SeqCst);
      log.info("started");

      let permit = self.gate.acquire().await;
      if let Ok(permit) = permit {
         permit.forget();
      }

      self.running.fetch_sub(1, Ordering::SeqCst);
      CompileResult::Ok
   }
}

/// Records shutdown requests.
#[derive(Default)]
pub struct RecordingTrigger {
   reasons: Mutex<Vec<String>>,
}

impl RecordingTrigger {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn count(&self) -> usize {
      self.reasons.lock().len()
   }

   pub fn reasons(&self) -> Vec<String> {
      self.reasons.lock().clone()
   }
}

impl ShutdownTrigger for RecordingTrigger {
   fn shutdown(&self, reason: &str) {
      self.reasons.lock().push(reason.to_string());
   }
}

/// Polls `cond` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
   let start = Instant::now();
   while start.elapsed() < timeout {
      if cond() {
         return true;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
   }
   cond()
}

/// Settings with a fast monitor and a keepalive long enough not to interfere.
pub fn settings(portfile: &Path) -> ServerSettings {
   let mut settings = ServerSettings::new(portfile, &Config::default());
   settings.pool_size = 2;
   settings.keepalive = Duration::from_secs(30);
   settings.monitor_interval = Duration::from_millis(50);
   settings
}

/// Starts a server that must win the port file.
pub fn start(
   settings: ServerSettings,
   backend: Arc<dyn Compiler>,
   portfile: Arc<PortFile>,
) -> RunningServer {
   match Server::new(settings, backend, portfile).start() {
      Ok(Startup::Listening(running)) => running,
      Ok(Startup::AlreadyRunning(values)) => panic!("port file already owned: {values:?}"),
      Err(e) => panic!("server failed to start: {e}"),
   }
}
