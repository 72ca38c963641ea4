//! Server-local error log, kept apart from per-request output.

use std::{
   fmt,
   fs::{File, OpenOptions},
   io::Write,
   path::{Path, PathBuf},
};

use chrono::Utc;
use parking_lot::Mutex;

pub struct ErrorLog {
   path: PathBuf,
   file: Mutex<Option<File>>,
}

impl ErrorLog {
   pub fn new(path: impl Into<PathBuf>) -> Self {
      Self { path: path.into(), file: Mutex::new(None) }
   }

   /// `<portfile>.errorlog`
   pub fn for_portfile(portfile: &Path) -> Self {
      let mut name = portfile.as_os_str().to_os_string();
      name.push(".errorlog");
      Self::new(PathBuf::from(name))
   }

   pub fn path(&self) -> &Path {
      &self.path
   }

   pub fn record(&self, context: &str, err: &dyn fmt::Display) {
      tracing::error!("{context}: {err}");
      let now = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
      let mut file = self.file.lock();
      if file.is_none() {
         match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(f) => *file = Some(f),
            Err(e) => {
               tracing::warn!("failed to open error log {}: {e}", self.path.display());
               return;
            },
         }
      }
      if let Some(f) = file.as_mut()
         && let Err(e) = writeln!(f, "{now} [{context}] {err}")
      {
         tracing::warn!("failed to write error log {}: {e}", self.path.display());
      }
   }
}
