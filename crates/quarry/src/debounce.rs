//! Time-windowed call coalescer.
//!
//! A `Debouncer` accepts parameterized calls and delays emission by a fixed
//! window. A call arriving while an emission is pending cancels the pending
//! timer, merges the parameters through a caller-supplied combinator, and
//! restarts the window. The combinator is always called with the older value
//! first, so `k` coalesced calls fold left-to-right.
//!
//! If the emit callback is already running when a new call arrives, the new
//! call does not interrupt it; the next window begins independently.

use std::{
  future::Future,
  sync::{Arc, Mutex},
  time::Duration,
};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::trace;

type Combine<P> = Arc<dyn Fn(P, P) -> P + Send + Sync>;
type Emit<P> = Arc<dyn Fn(P) -> BoxFuture<'static, ()> + Send + Sync>;

/// A pending emission: the accumulated parameter plus the timer's token.
struct InProgress<P> {
  value: P,
  cancel: CancellationToken,
}

/// Coalesces bursts of calls into a single emission per quiet window.
pub struct Debouncer<P: Send + 'static> {
  window: Duration,
  combine: Combine<P>,
  emit: Emit<P>,
  /// At most one pending emission; non-empty exactly between a `schedule`
  /// call and the corresponding emission (or cancellation).
  in_progress: Arc<Mutex<Option<InProgress<P>>>>,
}

impl<P: Send + 'static> Debouncer<P> {
  pub fn new<C, E, F>(window: Duration, combine: C, emit: E) -> Self
  where
    C: Fn(P, P) -> P + Send + Sync + 'static,
    E: Fn(P) -> F + Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
  {
    Self {
      window,
      combine: Arc::new(combine),
      emit: Arc::new(move |p| Box::pin(emit(p)) as BoxFuture<'static, ()>),
      in_progress: Arc::new(Mutex::new(None)),
    }
  }

  /// Schedule an emission of `value`, merging with a pending one if present.
  pub fn schedule(&self, value: P) {
    let cancel = CancellationToken::new();

    {
      let mut guard = self.in_progress.lock().unwrap();
      let merged = match guard.take() {
        Some(pending) => {
          pending.cancel.cancel();
          (self.combine)(pending.value, value)
        }
        None => value,
      };
      *guard = Some(InProgress {
        value: merged,
        cancel: cancel.clone(),
      });
    }

    let window = self.window;
    let in_progress = Arc::clone(&self.in_progress);
    let emit = Arc::clone(&self.emit);
    tokio::spawn(async move {
      tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(window) => {}
      }

      // The lock serializes against `schedule`: a superseding call cancels
      // this token while holding the lock, so re-checking under the lock
      // guarantees we never emit a value that was already merged forward.
      let pending = {
        let mut guard = in_progress.lock().unwrap();
        if cancel.is_cancelled() {
          return;
        }
        guard.take()
      };
      if let Some(pending) = pending {
        emit(pending.value).await;
      }
    });
  }

  /// Drop the pending emission, if any. The timer is cancelled and `emit`
  /// will not be called for the accumulated value.
  pub fn cancel_pending(&self) {
    if let Some(pending) = self.in_progress.lock().unwrap().take() {
      pending.cancel.cancel();
      trace!("Cancelled pending debounced emission");
    }
  }
}
