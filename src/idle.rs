//! Idle shutdown: fires a shutdown once no compile has been outstanding for
//! the keepalive period.
//!
//! A single mutex guards the outstanding count and the pending timer. The
//! timer exists exactly while the count is zero and no shutdown has fired;
//! starting the first call cancels it, finishing the last call re-arms it.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{runtime::Handle, task::JoinHandle, time};

use crate::compiler::{CompileResult, Compiler, RequestLog};

/// Receiver of shutdown requests; implemented by the server.
pub trait ShutdownTrigger: Send + Sync {
   /// Initiates shutdown. May block; called from a blocking thread.
   fn shutdown(&self, reason: &str);
}

struct PendingTimer {
   generation: u64,
   handle:     JoinHandle<()>,
}

#[derive(Default)]
struct IdleState {
   outstanding: usize,
   timer:       Option<PendingTimer>,
   generation:  u64,
   fired:       bool,
   closed:      bool,
}

struct Inner {
   state:        Mutex<IdleState>,
   idle_timeout: Duration,
   trigger:      Arc<dyn ShutdownTrigger>,
   runtime:      Handle,
}

pub struct IdleResetCompiler {
   delegate: Arc<dyn Compiler>,
   inner:    Arc<Inner>,
}

impl IdleResetCompiler {
   /// Wraps `delegate` and arms the idle timer immediately.
   ///
   /// Must be called from within a tokio runtime.
   pub fn new(
      delegate: Arc<dyn Compiler>,
      idle_timeout: Duration,
      trigger: Arc<dyn ShutdownTrigger>,
   ) -> Self {
      let inner = Arc::new(Inner {
         state: Mutex::default(),
         idle_timeout,
         trigger,
         runtime: Handle::current(),
      });
      {
         let mut state = inner.state.lock();
         Inner::schedule(&inner, &mut state);
      }
      Self { delegate, inner }
   }

   pub fn outstanding(&self) -> usize {
      self.inner.state.lock().outstanding
   }

   /// Whether an idle shutdown is currently scheduled.
   pub fn timer_armed(&self) -> bool {
      self.inner.state.lock().timer.is_some()
   }

   /// Cancels the pending timer and prevents any further one.
   pub fn cancel_timer(&self) {
      let mut state = self.inner.state.lock();
      state.closed = true;
      if let Some(timer) = state.timer.take() {
         timer.handle.abort();
      }
   }

   fn start_call(&self) -> CallGuard {
      let mut state = self.inner.state.lock();
      let previous = state.outstanding;
      state.outstanding += 1;
      if previous == 0 {
         match state.timer.take() {
            Some(timer) => {
               timer.handle.abort();
               tracing::trace!("idle timer cancelled");
            },
            None if state.fired || state.closed => {},
            None => panic!("no idle timer scheduled while no calls were outstanding"),
         }
      }
      CallGuard { inner: Arc::clone(&self.inner) }
   }
}

impl Inner {
   fn schedule(this: &Arc<Self>, state: &mut IdleState) {
      assert!(state.timer.is_none(), "idle timer scheduled twice");
      state.generation += 1;
      let generation = state.generation;
      let inner = Arc::clone(this);
      let handle = this.runtime.spawn(async move {
         time::sleep(inner.idle_timeout).await;
         {
            let mut state = inner.state.lock();
            let current = state
               .timer
               .as_ref()
               .is_some_and(|t| t.generation == generation);
            if !current || state.outstanding != 0 {
               return;
            }
            state.timer = None;
            state.fired = true;
         }
         let reason = format!("idle for {} seconds", inner.idle_timeout.as_secs());
         tracing::info!("{reason}, requesting shutdown");
         let trigger = Arc::clone(&inner.trigger);
         if let Err(e) = tokio::task::spawn_blocking(move || trigger.shutdown(&reason)).await {
            tracing::error!("idle shutdown failed: {e}");
         }
      });
      state.timer = Some(PendingTimer { generation, handle });
      tracing::trace!(timeout_ms = this.idle_timeout.as_millis() as u64, "idle timer armed");
   }

   fn end_call(this: &Arc<Self>) {
      let mut state = this.state.lock();
      assert!(state.outstanding > 0, "idle call count underflow");
      state.outstanding -= 1;
      if state.outstanding == 0 && !state.fired && !state.closed {
         Self::schedule(this, &mut state);
      }
   }
}

/// Ends the call on drop, so the count is restored even if the delegate
/// panics or the request future is dropped.
struct CallGuard {
   inner: Arc<Inner>,
}

impl Drop for CallGuard {
   fn drop(&mut self) {
      Inner::end_call(&self.inner);
   }
}

#[async_trait]
impl Compiler for IdleResetCompiler {
   async fn compile(&self, args: &[String], log: &RequestLog) -> CompileResult {
      let _call = self.start_call();
      self.delegate.compile(args, log).await
   }

   async fn shutdown(&self) {
      self.cancel_timer();
      self.delegate.shutdown().await;
   }
}
