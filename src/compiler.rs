//! The compile contract shared by the backend and its decorators.
//!
//! A request flows through `IdleResetCompiler(PooledCompiler(backend))`; each
//! layer implements [`Compiler`] and holds the next one as an
//! `Arc<dyn Compiler>`.

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait Compiler: Send + Sync {
   /// Runs one compilation. Log output for the requesting client goes to `log`.
   async fn compile(&self, args: &[String], log: &RequestLog) -> CompileResult;

   /// Releases resources once the server stops accepting requests.
   async fn shutdown(&self) {}
}

/// Outcome of a compile request, sent to the client as `RC:<name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompileResult {
   Ok,
   Error,
   CmdErr,
   SysErr,
   Abnormal,
}

impl CompileResult {
   pub const ALL: [Self; 5] = [Self::Ok, Self::Error, Self::CmdErr, Self::SysErr, Self::Abnormal];

   pub fn name(self) -> &'static str {
      match self {
         Self::Ok => "OK",
         Self::Error => "ERROR",
         Self::CmdErr => "CMDERR",
         Self::SysErr => "SYSERR",
         Self::Abnormal => "ABNORMAL",
      }
   }

   pub fn exit_code(self) -> i32 {
      match self {
         Self::Ok => 0,
         Self::Error => 1,
         Self::CmdErr => 2,
         Self::SysErr => 3,
         Self::Abnormal => 4,
      }
   }

   /// Maps a compiler process exit code; unknown codes are abnormal.
   pub fn from_exit_code(code: i32) -> Self {
      Self::ALL
         .into_iter()
         .find(|r| r.exit_code() == code)
         .unwrap_or(Self::Abnormal)
   }

   pub fn is_ok(self) -> bool {
      self == Self::Ok
   }
}

impl fmt::Display for CompileResult {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.name())
   }
}

impl FromStr for CompileResult {
   type Err = String;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      Self::ALL
         .into_iter()
         .find(|r| r.name() == s)
         .ok_or_else(|| s.to_string())
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
   Error,
   Warn,
   Info,
   Debug,
   Trace,
}

impl LogLevel {
   pub const ALL: [Self; 5] = [Self::Error, Self::Warn, Self::Info, Self::Debug, Self::Trace];

   pub fn name(self) -> &'static str {
      match self {
         Self::Error => "ERROR",
         Self::Warn => "WARN",
         Self::Info => "INFO",
         Self::Debug => "DEBUG",
         Self::Trace => "TRACE",
      }
   }
}

impl fmt::Display for LogLevel {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.name())
   }
}

impl FromStr for LogLevel {
   type Err = String;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      Self::ALL
         .into_iter()
         .find(|l| l.name() == s)
         .ok_or_else(|| s.to_string())
   }
}

/// Log sink for a single request.
///
/// Lines are relayed to the connection that issued the request. Once the
/// connection is gone, sends are silently dropped.
#[derive(Clone)]
pub struct RequestLog {
   tx: Option<mpsc::UnboundedSender<(LogLevel, String)>>,
}

impl RequestLog {
   pub fn channel() -> (Self, mpsc::UnboundedReceiver<(LogLevel, String)>) {
      let (tx, rx) = mpsc::unbounded_channel();
      (Self { tx: Some(tx) }, rx)
   }

   /// A log that discards everything.
   pub fn disabled() -> Self {
      Self { tx: None }
   }

   pub fn log(&self, level: LogLevel, message: impl Into<String>) {
      let message = message.into();
      tracing::trace!(%level, "{message}");
      if let Some(tx) = &self.tx {
         let _ = tx.send((level, message));
      }
   }

   pub fn error(&self, message: impl Into<String>) {
      self.log(LogLevel::Error, message);
   }

   pub fn warn(&self, message: impl Into<String>) {
      self.log(LogLevel::Warn, message);
   }

   pub fn info(&self, message: impl Into<String>) {
      self.log(LogLevel::Info, message);
   }

   pub fn debug(&self, message: impl Into<String>) {
      self.log(LogLevel::Debug, message);
   }
}
