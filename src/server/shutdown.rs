//! Exactly-once shutdown shared by the monitor, the idle timer and explicit
//! stop requests.

use std::sync::{
   Arc,
   atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::ErrorLog;
use crate::{idle::ShutdownTrigger, portfile::PortFile};

pub struct Shutdown {
   keep_accepting: AtomicBool,
   portfile:       Arc<PortFile>,
   error_log:      Arc<ErrorLog>,
   monitor:        CancellationToken,
   accept:         CancellationToken,
   reason:         Mutex<Option<String>>,
}

impl Shutdown {
   pub fn new(portfile: Arc<PortFile>, error_log: Arc<ErrorLog>) -> Self {
      Self {
         keep_accepting: AtomicBool::new(true),
         portfile,
         error_log,
         monitor: CancellationToken::new(),
         accept: CancellationToken::new(),
         reason: Mutex::new(None),
      }
   }

   pub fn is_accepting(&self) -> bool {
      self.keep_accepting.load(Ordering::SeqCst)
   }

   /// Reason given by the caller that won the shutdown race.
   pub fn reason(&self) -> Option<String> {
      self.reason.lock().clone()
   }

   pub(crate) fn monitor_token(&self) -> CancellationToken {
      self.monitor.clone()
   }

   pub(crate) fn accept_token(&self) -> CancellationToken {
      self.accept.clone()
   }

   /// Stops the monitor, deletes the port file, then closes the listener.
   ///
   /// Only the first caller runs the sequence and gets `true`; every other
   /// caller returns `false` immediately. Blocks while the port file deletion
   /// is verified.
   pub fn initiate(&self, reason: &str) -> bool {
      if self
         .keep_accepting
         .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
         .is_err()
      {
         return false;
      }
      tracing::info!(reason, "shutting down server");
      *self.reason.lock() = Some(reason.to_string());

      self.monitor.cancel();
      if let Err(e) = self.portfile.delete() {
         self.error_log.record("shutdown", &e);
      }
      self.accept.cancel();
      true
   }
}

impl ShutdownTrigger for Shutdown {
   fn shutdown(&self, reason: &str) {
      self.initiate(reason);
   }
}
