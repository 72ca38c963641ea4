//! Per-connection request handling.

use std::sync::Arc;

use tokio::{
   io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
   task::JoinError,
};

use super::ErrorLog;
use crate::{
   compiler::{CompileResult, Compiler, LogLevel, RequestLog},
   config::RequestLimits,
   error::ProtocolError,
   protocol,
};

pub(crate) const INTERNAL_ERROR_NOTICE: &str = "server encountered an internal error, see";

/// Reads one request, runs it and streams logs plus the result line back.
///
/// The compile runs in its own task so a panicking backend only fails this
/// request. Its [`RequestLog`] is dropped with that task, which ends the log
/// relay below.
pub async fn handle<S>(
   stream: S,
   compiler: Arc<dyn Compiler>,
   error_log: Arc<ErrorLog>,
   limits: RequestLimits,
) -> Result<(), ProtocolError>
where
   S: AsyncRead + AsyncWrite + Send + 'static,
{
   let (read_half, mut writer) = tokio::io::split(stream);
   let mut reader = BufReader::new(read_half);

   let args = match protocol::read_request(&mut reader, limits).await {
      Ok(Some(args)) => args,
      Ok(None) => return Ok(()),
      Err(e @ (ProtocolError::Read(_) | ProtocolError::UnexpectedEof { .. })) => return Err(e),
      Err(e) => {
         let reply = protocol::format_log_line(LogLevel::Error, &format!("bad request: {e}"))
            + &protocol::format_result_line(CompileResult::CmdErr);
         write(&mut writer, &reply).await?;
         return Err(e);
      },
   };
   tracing::debug!(args = args.len(), "compile request");

   let (log, mut rx) = RequestLog::channel();
   let task = tokio::spawn(async move { compiler.compile(&args, &log).await });

   let mut relay_failed = None;
   while let Some((level, message)) = rx.recv().await {
      if relay_failed.is_some() {
         continue;
      }
      if let Err(e) = write(&mut writer, &protocol::format_log_line(level, &message)).await {
         relay_failed = Some(e);
      }
   }
   if let Some(e) = relay_failed {
      // Client is gone; still wait so the compile is not detached from us.
      let _ = task.await;
      return Err(e);
   }

   let result = match task.await {
      Ok(result) => result,
      Err(e) => {
         error_log.record("compile", &describe_failure(e));
         let notice = format!("{INTERNAL_ERROR_NOTICE} {}", error_log.path().display());
         write(&mut writer, &protocol::format_log_line(LogLevel::Error, &notice)).await?;
         CompileResult::SysErr
      },
   };
   write(&mut writer, &protocol::format_result_line(result)).await?;
   writer.shutdown().await.map_err(ProtocolError::Write)
}

fn describe_failure(err: JoinError) -> String {
   if !err.is_panic() {
      return err.to_string();
   }
   let payload = err.into_panic();
   let message = payload
      .downcast_ref::<&str>()
      .map(|s| (*s).to_string())
      .or_else(|| payload.downcast_ref::<String>().cloned());
   match message {
      Some(m) => format!("compile task panicked: {m}"),
      None => "compile task panicked".to_string(),
   }
}

async fn write<W>(writer: &mut W, text: &str) -> Result<(), ProtocolError>
where
   W: AsyncWrite + Unpin,
{
   writer
      .write_all(text.as_bytes())
      .await
      .map_err(ProtocolError::Write)?;
   writer.flush().await.map_err(ProtocolError::Write)
}
