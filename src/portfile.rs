//! Rendezvous port file shared between one server and many clients.
//!
//! The file holds a fixed 16-byte big-endian record:
//! `[magic: u32 = 0x1174][port: i32][cookie: i64]`. Anything else (short
//! file, foreign magic, port out of range) reads back as "no valid values".
//!
//! Access is serialized twice: a mutex orders threads of this process and an
//! exclusive `fs4` file lock orders processes. [`PortFile::lock`] takes both,
//! in that order, and the returned [`PortFileLock`] releases both when it is
//! unlocked or dropped.

use std::{
   collections::HashMap,
   fs::{self, File, OpenOptions},
   io::{self, Read, Seek, SeekFrom, Write},
   path::{Path, PathBuf},
   sync::Arc,
   thread,
   time::{Duration, Instant},
};

use fs4::FileExt;
use parking_lot::{Mutex, MutexGuard};

pub const MAGIC: u32 = 0x1174;
pub const RECORD_LEN: usize = 16;

/// Interval between reads in [`PortFile::wait_for_valid_values`].
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Number of existence checks after unlinking in [`PortFile::delete`].
pub const DELETE_RETRIES: usize = 10;
pub const DELETE_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Bound on consecutive interrupted lock attempts in
/// [`PortFile::still_my_values`].
pub const INTERRUPT_RETRIES: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum PortFileError {
   #[error("failed to open {}: {source}", .path.display())]
   Open {
      path:   PathBuf,
      #[source]
      source: io::Error,
   },

   #[error("failed to lock {}: {source}", .path.display())]
   Lock {
      path:   PathBuf,
      #[source]
      source: io::Error,
   },

   #[error("lock on {} was interrupted", .path.display())]
   Interrupted { path: PathBuf },

   #[error("port file {} has been closed", .path.display())]
   Closed { path: PathBuf },

   #[error("port file {} disappeared", .path.display())]
   Missing { path: PathBuf },

   #[error("port file i/o failed: {0}")]
   Io(#[from] io::Error),

   #[error("failed to delete {}", .path.display())]
   DeleteFailed { path: PathBuf },

   #[error("no port file values materialized after {elapsed_ms} ms")]
   NoValues { elapsed_ms: u128 },
}

/// The (port, cookie) pair a server publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PortFileValues {
   pub port:   u16,
   pub cookie: i64,
}

impl PortFileValues {
   pub fn encode(&self) -> [u8; RECORD_LEN] {
      let mut buf = [0u8; RECORD_LEN];
      buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
      buf[4..8].copy_from_slice(&i32::from(self.port).to_be_bytes());
      buf[8..16].copy_from_slice(&self.cookie.to_be_bytes());
      buf
   }

   pub fn decode(buf: &[u8]) -> Option<Self> {
      let (magic, rest) = buf.split_first_chunk::<4>()?;
      if u32::from_be_bytes(*magic) != MAGIC {
         return None;
      }
      let (port, rest) = rest.split_first_chunk::<4>()?;
      let (cookie, _) = rest.split_first_chunk::<8>()?;
      let port = u16::try_from(i32::from_be_bytes(*port)).ok()?;
      Some(Self { port, cookie: i64::from_be_bytes(*cookie) })
   }
}

#[derive(Default)]
struct State {
   file:   Option<File>,
   closed: bool,
   mine:   Option<PortFileValues>,
}

pub struct PortFile {
   path:      PathBuf,
   stop_path: PathBuf,
   state:     Mutex<State>,
}

impl PortFile {
   pub fn new(path: impl Into<PathBuf>) -> Self {
      let path = path.into();
      let stop_path = stop_path_for(&path);
      Self { path, stop_path, state: Mutex::new(State::default()) }
   }

   pub fn path(&self) -> &Path {
      &self.path
   }

   pub fn stop_path(&self) -> &Path {
      &self.stop_path
   }

   /// Blocks until this thread owns the in-process mutex and the OS lock.
   ///
   /// A handle whose file was replaced since the last call is reopened first.
   /// A handle whose file was unlinked fails with [`PortFileError::Missing`]
   /// instead of recreating it.
   pub fn lock(&self) -> Result<PortFileLock<'_>, PortFileError> {
      let mut state = self.state.lock();
      if state.closed {
         return Err(PortFileError::Closed { path: self.path.clone() });
      }
      let reopen = state.file.as_ref().is_some_and(|f| !same_file(f, &self.path));
      if reopen {
         tracing::debug!("port file {} was replaced, reopening", self.path.display());
         state.file = None;
      }
      if state.file.is_none() {
         let file = OpenOptions::new()
            .create(!reopen)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| {
               if reopen && source.kind() == io::ErrorKind::NotFound {
                  PortFileError::Missing { path: self.path.clone() }
               } else {
                  PortFileError::Open { path: self.path.clone(), source }
               }
            })?;
         state.file = Some(file);
      }
      if let Some(file) = state.file.as_ref() {
         FileExt::lock_exclusive(file).map_err(|source| {
            if source.kind() == io::ErrorKind::Interrupted {
               PortFileError::Interrupted { path: self.path.clone() }
            } else {
               PortFileError::Lock { path: self.path.clone(), source }
            }
         })?;
      }
      Ok(PortFileLock { portfile: self, state, locked: true })
   }

   pub fn exists(&self) -> bool {
      self.path.exists()
   }

   /// Consumes a pending stop request, if any.
   pub fn marked_for_stop(&self) -> bool {
      if !self.stop_path.exists() {
         return false;
      }
      if let Err(e) = fs::remove_file(&self.stop_path) {
         tracing::debug!("failed to remove stop marker {}: {e}", self.stop_path.display());
      }
      true
   }

   /// Requests a forced stop of whichever server owns this port file.
   pub fn request_stop(&self) -> io::Result<()> {
      if let Some(parent) = self.stop_path.parent() {
         fs::create_dir_all(parent)?;
      }
      File::create(&self.stop_path).map(drop)
   }

   /// Closes the handle, unlinks the file and waits until it is really gone.
   ///
   /// The handle stays closed afterwards: later [`Self::lock`] calls fail with
   /// [`PortFileError::Closed`].
   pub fn delete(&self) -> Result<(), PortFileError> {
      {
         let mut state = self.state.lock();
         state.closed = true;
         state.file = None;
      }
      match fs::remove_file(&self.path) {
         Ok(()) => {},
         Err(e) if e.kind() == io::ErrorKind::NotFound => {},
         Err(e) => return Err(e.into()),
      }
      for _ in 0..DELETE_RETRIES {
         if !self.path.exists() {
            return Ok(());
         }
         thread::sleep(DELETE_RETRY_DELAY);
      }
      if self.path.exists() {
         return Err(PortFileError::DeleteFailed { path: self.path.clone() });
      }
      Ok(())
   }

   /// Polls until a server has published valid values or `timeout` passes.
   pub fn wait_for_valid_values(
      &self,
      timeout: Duration,
   ) -> Result<PortFileValues, PortFileError> {
      let start = Instant::now();
      while start.elapsed() < timeout {
         if let Some(values) = self.current_values()? {
            return Ok(values);
         }
         thread::sleep(WAIT_POLL_INTERVAL);
      }
      Err(PortFileError::NoValues { elapsed_ms: start.elapsed().as_millis() })
   }

   /// Reads the current values under the lock, if the file exists.
   pub fn current_values(&self) -> Result<Option<PortFileValues>, PortFileError> {
      if !self.exists() {
         return Ok(None);
      }
      let lock = match self.lock() {
         Ok(lock) => lock,
         Err(PortFileError::Missing { .. }) => return Ok(None),
         Err(e) => return Err(e),
      };
      let values = lock.read_values();
      lock.unlock()?;
      Ok(values)
   }

   /// Whether the file still carries the values this instance last wrote.
   ///
   /// A closed handle means the owner is shutting down and yields `false`.
   /// Interrupted lock attempts are retried up to [`INTERRUPT_RETRIES`] times.
   pub fn still_my_values(&self) -> Result<bool, PortFileError> {
      let mut interrupted = 0;
      loop {
         let lock = match self.lock() {
            Ok(lock) => lock,
            Err(PortFileError::Closed { .. }) => return Ok(false),
            Err(PortFileError::Interrupted { path }) => {
               interrupted += 1;
               if interrupted >= INTERRUPT_RETRIES {
                  return Err(PortFileError::Interrupted { path });
               }
               continue;
            },
            Err(e) => return Err(e),
         };
         let current = lock.read_values();
         let mine = lock.state.mine;
         lock.unlock()?;
         return Ok(match (current, mine) {
            (Some(current), Some(mine)) => current == mine,
            _ => false,
         });
      }
   }
}

/// Held lock on a [`PortFile`]; both levels are released on unlock or drop.
pub struct PortFileLock<'a> {
   portfile: &'a PortFile,
   state:    MutexGuard<'a, State>,
   locked:   bool,
}

impl PortFileLock<'_> {
   /// Reads the record. Any read failure or malformed content is `None`.
   pub fn read_values(&self) -> Option<PortFileValues> {
      let mut file = self.state.file.as_ref()?;
      let mut buf = [0u8; RECORD_LEN];
      file.seek(SeekFrom::Start(0)).ok()?;
      file.read_exact(&mut buf).ok()?;
      PortFileValues::decode(&buf)
   }

   /// Writes the full record from offset 0 and remembers it as ours.
   pub fn set_values(&mut self, port: u16, cookie: i64) -> Result<(), PortFileError> {
      let values = PortFileValues { port, cookie };
      let Some(mut file) = self.state.file.as_ref() else {
         return Err(PortFileError::Closed { path: self.portfile.path.clone() });
      };
      file.seek(SeekFrom::Start(0))?;
      file.write_all(&values.encode())?;
      file.flush()?;
      self.state.mine = Some(values);
      Ok(())
   }

   pub fn unlock(mut self) -> Result<(), PortFileError> {
      self.release().map_err(PortFileError::Io)
   }

   fn release(&mut self) -> io::Result<()> {
      if !self.locked {
         return Ok(());
      }
      self.locked = false;
      match self.state.file.as_ref() {
         Some(file) => FileExt::unlock(file),
         None => Ok(()),
      }
   }
}

impl Drop for PortFileLock<'_> {
   fn drop(&mut self) {
      if let Err(e) = self.release() {
         tracing::warn!("failed to unlock {}: {e}", self.portfile.path.display());
      }
   }
}

/// Whether `file` is still the file linked at `path`.
#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> bool {
   use std::os::unix::fs::MetadataExt;

   match (file.metadata(), fs::metadata(path)) {
      (Ok(open), Ok(linked)) => open.dev() == linked.dev() && open.ino() == linked.ino(),
      _ => false,
   }
}

#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> bool {
   path.exists()
}

pub fn stop_path_for(path: &Path) -> PathBuf {
   let mut name = path.as_os_str().to_os_string();
   name.push(".stop");
   PathBuf::from(name)
}

/// Process-wide cache of port file handles, keyed by absolute path.
///
/// Every component that touches a given path must share one [`PortFile`] so
/// that its in-process mutex actually serializes them.
#[derive(Default)]
pub struct PortFileRegistry {
   files: Mutex<HashMap<PathBuf, Arc<PortFile>>>,
}

impl PortFileRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn get(&self, path: &Path) -> io::Result<Arc<PortFile>> {
      let key = std::path::absolute(path)?;
      let mut files = self.files.lock();
      let entry = files
         .entry(key.clone())
         .or_insert_with(|| Arc::new(PortFile::new(key)));
      Ok(Arc::clone(entry))
   }
}
