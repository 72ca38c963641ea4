use std::io;

use thiserror::Error;

use crate::portfile::PortFileError;

/// Main error type for the warmc server and client.
///
/// Covers I/O, configuration, port file coordination, the line protocol and
/// socket handling. Coordination races that are part of normal operation
/// (another server already owns the port file) are not errors; see
/// [`crate::server::Startup`].
#[derive(Debug, Error)]
pub enum Error {
   /// I/O error occurred during file or network operations.
   #[error("io error: {0}")]
   Io(#[from] io::Error),

   /// Configuration or startup settings were invalid.
   #[error("config error: {0}")]
   Config(#[from] ConfigError),

   /// Port file locking, reading or deletion failed.
   #[error("port file error: {0}")]
   PortFile(#[from] PortFileError),

   /// The request/response line protocol was violated.
   #[error("protocol error: {0}")]
   Protocol(#[from] ProtocolError),

   /// Socket communication error occurred.
   #[error("socket error: {0}")]
   Socket(#[from] SocketError),

   /// JSON serialization error occurred.
   #[error("json error: {0}")]
   Json(#[from] serde_json::Error),

   /// A background task panicked or was cancelled.
   #[error("task failed: {0}")]
   Join(#[from] tokio::task::JoinError),

   /// Server error occurred during a specific operation.
   #[error("server error during {op}: {reason}")]
   Server { op: &'static str, reason: String },

   /// Failed to spawn the background server process.
   #[error("failed to spawn server: {0}")]
   ServerSpawn(#[source] io::Error),
}

impl Error {
   pub fn exit_code(&self) -> i32 {
      let reason = match self {
         Error::Server { reason, .. } => reason.to_lowercase(),
         other => other.to_string().to_lowercase(),
      };

      if reason.contains("timeout") || reason.contains("materialized") {
         11
      } else {
         1
      }
   }
}

/// Errors raised while parsing configuration and the server settings string.
#[derive(Debug, Error)]
pub enum ConfigError {
   /// The settings string did not name a port file.
   #[error("missing required setting 'portfile'")]
   MissingPortfile,

   /// A `key=value` segment had no `=`.
   #[error("malformed setting '{0}', expected key=value")]
   Malformed(String),

   /// The key is not a recognized server setting.
   #[error("unknown setting '{0}'")]
   UnknownSetting(String),

   /// The value could not be used for the given key.
   #[error("invalid value '{value}' for setting '{key}'")]
   InvalidSetting { key: String, value: String },
}

/// Errors in the line-oriented request/response protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
   /// Failed to read from the connection.
   #[error("failed to read: {0}")]
   Read(#[source] io::Error),

   /// Failed to write to the connection.
   #[error("failed to write: {0}")]
   Write(#[source] io::Error),

   /// The peer closed the connection before a complete message arrived.
   #[error("connection closed after {received} of {expected} lines")]
   UnexpectedEof { expected: usize, received: usize },

   /// The argument count line was not a non-negative integer.
   #[error("invalid argument count '{0}'")]
   InvalidArgCount(String),

   /// The request declared more arguments than the server accepts.
   #[error("too many arguments: {count} (max {max})")]
   TooManyArgs { count: usize, max: usize },

   /// A single line exceeded the configured byte limit.
   #[error("line exceeds {0} bytes")]
   LineTooLong(usize),

   /// Arguments are newline-delimited and cannot contain a newline.
   #[error("argument contains a newline: {0:?}")]
   ArgContainsNewline(String),

   /// The server closed the connection without a result line.
   #[error("server closed the connection without a result")]
   MissingResult,

   /// The result line named an unknown result code.
   #[error("unknown result code '{0}'")]
   UnknownResult(String),
}

/// Errors that can occur during socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
   #[error("failed to bind: {0}")]
   Bind(#[source] io::Error),

   #[error("failed to connect to port {port}: {source}")]
   Connect {
      port:   u16,
      #[source]
      source: io::Error,
   },

   #[error("connect to port {0} timed out")]
   ConnectTimeout(u16),

   #[error("accept failed: {0}")]
   Accept(#[source] io::Error),
}

/// Standard result type using [`enum@Error`] as the default error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
