//! Line protocol between client and server.
//!
//! Request: `<N>\n` followed by N argument lines. Response: any number of
//! `<LEVEL>:<message>\n` log lines, then exactly one `RC:<result>\n` line.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
   Result,
   compiler::{CompileResult, LogLevel},
   config::RequestLimits,
   error::ProtocolError,
};

pub const RESULT_PREFIX: &str = "RC:";

/// A line received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
   Log(LogLevel, String),
   Result(CompileResult),
}

/// Reads one newline-terminated line, without the terminator.
///
/// Returns `None` on a clean EOF before any byte.
async fn read_line<R>(reader: &mut R, max_bytes: usize) -> Result<Option<String>, ProtocolError>
where
   R: AsyncBufRead + Unpin,
{
   let mut buf = Vec::new();
   loop {
      let available = reader.fill_buf().await.map_err(ProtocolError::Read)?;
      if available.is_empty() {
         if buf.is_empty() {
            return Ok(None);
         }
         break;
      }
      if let Some(pos) = available.iter().position(|&b| b == b'\n') {
         buf.extend_from_slice(&available[..pos]);
         reader.consume(pos + 1);
         break;
      }
      let len = available.len();
      buf.extend_from_slice(available);
      reader.consume(len);
      if buf.len() > max_bytes {
         return Err(ProtocolError::LineTooLong(max_bytes));
      }
   }
   if buf.len() > max_bytes {
      return Err(ProtocolError::LineTooLong(max_bytes));
   }
   if buf.last() == Some(&b'\r') {
      buf.pop();
   }
   Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Reads a request. `Ok(None)` means the peer hung up before sending anything.
pub async fn read_request<R>(
   reader: &mut R,
   limits: RequestLimits,
) -> Result<Option<Vec<String>>, ProtocolError>
where
   R: AsyncBufRead + Unpin,
{
   let Some(count_line) = read_line(reader, limits.max_line_bytes).await? else {
      return Ok(None);
   };
   let count = count_line
      .trim()
      .parse::<usize>()
      .map_err(|_| ProtocolError::InvalidArgCount(count_line.clone()))?;
   if count > limits.max_args {
      return Err(ProtocolError::TooManyArgs { count, max: limits.max_args });
   }

   let mut args = Vec::with_capacity(count);
   while args.len() < count {
      match read_line(reader, limits.max_line_bytes).await? {
         Some(arg) => args.push(arg),
         None => {
            return Err(ProtocolError::UnexpectedEof { expected: count, received: args.len() });
         },
      }
   }
   Ok(Some(args))
}

pub async fn write_request<W>(writer: &mut W, args: &[String]) -> Result<(), ProtocolError>
where
   W: AsyncWrite + Unpin,
{
   if let Some(bad) = args.iter().find(|a| a.contains('\n')) {
      return Err(ProtocolError::ArgContainsNewline(bad.clone()));
   }
   let mut out = String::with_capacity(16 + args.iter().map(|a| a.len() + 1).sum::<usize>());
   out.push_str(&args.len().to_string());
   out.push('\n');
   for arg in args {
      out.push_str(arg);
      out.push('\n');
   }
   writer
      .write_all(out.as_bytes())
      .await
      .map_err(ProtocolError::Write)?;
   writer.flush().await.map_err(ProtocolError::Write)
}

/// Formats a log line. Embedded newlines are split so each physical line
/// keeps its level prefix.
pub fn format_log_line(level: LogLevel, message: &str) -> String {
   let mut out = String::new();
   for line in message.split('\n') {
      out.push_str(level.name());
      out.push(':');
      out.push_str(line.trim_end_matches('\r'));
      out.push('\n');
   }
   out
}

pub fn format_result_line(result: CompileResult) -> String {
   format!("{RESULT_PREFIX}{}\n", result.name())
}

pub fn parse_server_line(line: &str) -> Result<ServerLine, ProtocolError> {
   if let Some(name) = line.strip_prefix(RESULT_PREFIX) {
      return name
         .trim()
         .parse()
         .map(ServerLine::Result)
         .map_err(ProtocolError::UnknownResult);
   }
   if let Some((level, message)) = line.split_once(':')
      && let Ok(level) = level.parse::<LogLevel>()
   {
      return Ok(ServerLine::Log(level, message.to_string()));
   }
   Ok(ServerLine::Log(LogLevel::Info, line.to_string()))
}

/// Reads server lines until the result line, passing log lines to `on_log`.
pub async fn read_response<R, F>(reader: &mut R, mut on_log: F) -> Result<CompileResult>
where
   R: AsyncBufRead + Unpin,
   F: FnMut(LogLevel, &str),
{
   loop {
      let Some(line) = read_line(reader, usize::MAX).await? else {
         return Err(ProtocolError::MissingResult.into());
      };
      match parse_server_line(&line)? {
         ServerLine::Log(level, message) => on_log(level, &message),
         ServerLine::Result(result) => return Ok(result),
      }
   }
}
