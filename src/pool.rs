//! Bounded worker pool in front of the compile backend.
//!
//! At most `size` compiles run at once. Excess requests wait in FIFO order on
//! a fair semaphore; nothing is rejected until the pool is shut down.

use std::sync::{
   Arc,
   atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::compiler::{CompileResult, Compiler, RequestLog};

pub struct PooledCompiler {
   delegate: Arc<dyn Compiler>,
   permits:  Arc<Semaphore>,
   size:     usize,
   queued:   AtomicUsize,
}

impl PooledCompiler {
   pub fn new(delegate: Arc<dyn Compiler>, size: usize) -> Self {
      let size = size.max(1);
      Self { delegate, permits: Arc::new(Semaphore::new(size)), size, queued: AtomicUsize::new(0) }
   }

   pub fn size(&self) -> usize {
      self.size
   }

   /// Requests currently waiting for a worker.
   pub fn queued(&self) -> usize {
      self.queued.load(Ordering::Relaxed)
   }

   /// Requests currently holding a worker.
   pub fn in_flight(&self) -> usize {
      self.size.saturating_sub(self.permits.available_permits())
   }
}

#[async_trait]
impl Compiler for PooledCompiler {
   async fn compile(&self, args: &[String], log: &RequestLog) -> CompileResult {
      self.queued.fetch_add(1, Ordering::Relaxed);
      let permit = self.permits.acquire().await;
      self.queued.fetch_sub(1, Ordering::Relaxed);

      let Ok(_permit) = permit else {
         log.error("server is shutting down");
         return CompileResult::SysErr;
      };
      self.delegate.compile(args, log).await
   }

   /// Waits for every running compile to finish, then refuses new ones.
   async fn shutdown(&self) {
      let size = u32::try_from(self.size).unwrap_or(u32::MAX);
      match self.permits.acquire_many(size).await {
         Ok(all) => {
            self.permits.close();
            drop(all);
         },
         Err(_) => tracing::debug!("worker pool already closed"),
      }
      self.delegate.shutdown().await;
   }
}
