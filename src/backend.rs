//! Compile backend that runs an external compiler program per request.

use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use tokio::{
   io::{AsyncBufReadExt, AsyncRead, BufReader},
   process::Command,
};

use crate::compiler::{CompileResult, Compiler, LogLevel, RequestLog};

pub struct ProcessBackend {
   program: PathBuf,
}

impl ProcessBackend {
   pub fn new(program: impl Into<PathBuf>) -> Self {
      Self { program: program.into() }
   }

   pub fn program(&self) -> &std::path::Path {
      &self.program
   }
}

async fn relay_lines<R>(reader: Option<R>, level: LogLevel, log: &RequestLog)
where
   R: AsyncRead + Unpin,
{
   let Some(reader) = reader else {
      return;
   };
   let mut lines = BufReader::new(reader).lines();
   loop {
      match lines.next_line().await {
         Ok(Some(line)) => log.log(level, line),
         Ok(None) => break,
         Err(e) => {
            tracing::debug!("compiler output stream failed: {e}");
            break;
         },
      }
   }
}

#[async_trait]
impl Compiler for ProcessBackend {
   async fn compile(&self, args: &[String], log: &RequestLog) -> CompileResult {
      let spawned = Command::new(&self.program)
         .args(args)
         .stdin(Stdio::null())
         .stdout(Stdio::piped())
         .stderr(Stdio::piped())
         .kill_on_drop(true)
         .spawn();

      let mut child = match spawned {
         Ok(child) => child,
         Err(e) => {
            log.error(format!("failed to start compiler {}: {e}", self.program.display()));
            return CompileResult::SysErr;
         },
      };

      let stdout = child.stdout.take();
      let stderr = child.stderr.take();
      tokio::join!(
         relay_lines(stdout, LogLevel::Info, log),
         relay_lines(stderr, LogLevel::Warn, log),
      );

      match child.wait().await {
         Ok(status) => status
            .code()
            .map_or(CompileResult::Abnormal, CompileResult::from_exit_code),
         Err(e) => {
            log.error(format!("failed to wait for compiler: {e}"));
            CompileResult::SysErr
         },
      }
   }
}
