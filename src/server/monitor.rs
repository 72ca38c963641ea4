//! Periodic check that this server still owns its port file.

use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;

use super::Shutdown;
use crate::portfile::{PortFile, PortFileError};

pub const REASON_DELETED: &str = "portfile was deleted";
pub const REASON_STOP_MARKER: &str = "portfile stop marker was found";
pub const REASON_STOLEN: &str = "portfile is now owned by another server";

/// One poll: the first failing condition, or `None` if all is well.
pub fn check(portfile: &PortFile) -> Result<Option<&'static str>, PortFileError> {
   if !portfile.exists() {
      return Ok(Some(REASON_DELETED));
   }
   if portfile.marked_for_stop() {
      return Ok(Some(REASON_STOP_MARKER));
   }
   match portfile.still_my_values() {
      Ok(true) => Ok(None),
      Ok(false) => Ok(Some(REASON_STOLEN)),
      Err(PortFileError::Missing { .. }) => Ok(Some(REASON_DELETED)),
      Err(e) => Err(e),
   }
}

pub struct PortFileMonitor {
   handle: JoinHandle<()>,
}

impl PortFileMonitor {
   pub fn spawn(
      portfile: Arc<PortFile>,
      shutdown: Arc<Shutdown>,
      interval: Duration,
      token: CancellationToken,
   ) -> Self {
      let handle = tokio::spawn(async move {
         loop {
            tokio::select! {
               biased;
               () = token.cancelled() => break,
               () = time::sleep(interval) => {},
            }

            let pf = Arc::clone(&portfile);
            let verdict = match tokio::task::spawn_blocking(move || check(&pf)).await {
               Ok(Ok(verdict)) => verdict,
               Ok(Err(e)) => {
                  tracing::warn!("port file check failed: {e}");
                  continue;
               },
               Err(e) => {
                  tracing::warn!("port file check panicked: {e}");
                  continue;
               },
            };

            if let Some(reason) = verdict {
               if token.is_cancelled() {
                  break;
               }
               tracing::info!("{reason}");
               let shutdown = Arc::clone(&shutdown);
               let initiated = tokio::task::spawn_blocking(move || shutdown.initiate(reason));
               if let Err(e) = initiated.await {
                  tracing::error!("monitor shutdown failed: {e}");
               }
               break;
            }
         }
         tracing::debug!("port file monitor stopped");
      });
      Self { handle }
   }

   pub fn is_finished(&self) -> bool {
      self.handle.is_finished()
   }

   pub async fn join(self) {
      let _ = self.handle.await;
   }
}
