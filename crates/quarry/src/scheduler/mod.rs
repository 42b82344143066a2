//! Priority-aware task scheduler with a bounded concurrency budget.
//!
//! The scheduler admits at most N tasks concurrently (N defaults to the CPU
//! count) and is intended to be shared process-wide: one instance arbitrates
//! preparation and index-store-update work across all workspaces.
//!
//! # Ordering
//!
//! Within equal priority, tasks start in FIFO order. Across priorities the
//! ready set is drained strictly higher-first. There is no preemption except
//! via the reschedule protocol below.
//!
//! # Rescheduling
//!
//! When a newly scheduled task would subsume work that is currently executing
//! (for example a narrow, user-blocking index request covering a subset of a
//! running target-wide background task), the running task is cancelled with
//! `CancelledToBeRescheduled` and requeued at a demoted effective priority.
//! Its description is executed again from scratch when a slot frees up.
//!
//! # Cancellation
//!
//! Cooperative: every execution attempt receives a `CancellationToken` and is
//! expected to observe it at natural suspension points. Subprocess-bearing
//! tasks relay cancellation as an interrupt signal and await exit.

use std::{
  fmt,
  sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

// ============================================================================
// Task Descriptions
// ============================================================================

/// Priority band of a scheduled task.
///
/// `Background` is for work the user is not waiting on; `UserInitiated` for
/// work blocking a client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
  Background,
  Default,
  UserInitiated,
}

impl TaskPriority {
  /// One band lower; used as the effective priority of rescheduled work.
  pub fn demoted(self) -> Self {
    match self {
      Self::UserInitiated => Self::Default,
      _ => Self::Background,
    }
  }
}

/// Execution-state transitions reported to the scheduling client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExecutionState {
  /// The task has been picked from the queue and is about to execute.
  Executing,
  /// The execution attempt was cancelled to let higher-priority work run;
  /// the task is back in the queue.
  CancelledToBeRescheduled,
  /// The task finished (or was cancelled by its owner) and will not run
  /// again.
  Finished,
}

/// Callback observing a task's execution-state transitions.
pub type StateCallback = Arc<dyn Fn(TaskExecutionState) + Send + Sync>;

/// What a schedulable unit of work looks like.
///
/// Descriptions are cheap to clone: a rescheduled task re-executes from its
/// description, and the scheduler compares descriptions to deduplicate and to
/// drive the reschedule protocol.
#[async_trait]
pub trait TaskDescription: Clone + fmt::Display + Send + Sync + 'static {
  /// Run the task. `cancel` must be observed at suspension points.
  async fn execute(&self, cancel: CancellationToken);

  fn priority(&self) -> TaskPriority;

  /// Whether executing `self` would redo exactly the work `other` performs.
  /// Used to deduplicate queued tasks.
  fn is_idempotent_with(&self, _other: &Self) -> bool {
    false
  }

  /// Whether a running `self` should be cancelled and requeued so that
  /// `newer` can run first.
  fn should_reschedule_for(&self, _newer: &Self) -> bool {
    false
  }
}

// ============================================================================
// Handles
// ============================================================================

/// Awaitable reference to a scheduled task.
///
/// Handles are cheap to clone and can be awaited by any number of consumers.
/// They never grant direct control over execution; cancellation is the only
/// lever and it is cooperative.
#[derive(Clone)]
pub struct TaskHandle {
  id: u64,
  cancel: CancellationToken,
  finished: watch::Receiver<bool>,
}

impl TaskHandle {
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Request cooperative cancellation of the task.
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  /// Wait until the task has finished. Rescheduled attempts do not count as
  /// completion; this resolves only on the terminal `Finished` transition.
  pub async fn wait(&self) {
    let mut finished = self.finished.clone();
    // An error means the scheduler dropped the record, which only happens
    // after completion.
    let _ = finished.wait_for(|done| *done).await;
  }

  pub fn is_finished(&self) -> bool {
    *self.finished.borrow()
  }
}

impl fmt::Debug for TaskHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskHandle").field("id", &self.id).finish()
  }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Bookkeeping for one scheduled task, queued or executing.
struct TaskRecord<D> {
  id: u64,
  /// FIFO position within a priority band; reassigned when requeued.
  seq: u64,
  /// Effective priority; may be elevated by dedup or demoted by reschedule.
  priority: TaskPriority,
  description: D,
  state_cb: Option<StateCallback>,
  /// Owner-requested cancellation; spans reschedules.
  cancel: CancellationToken,
  finished_tx: watch::Sender<bool>,
}

struct ExecutingTask<D> {
  record: TaskRecord<D>,
  /// Token for the current execution attempt only.
  attempt_cancel: CancellationToken,
  reschedule_requested: bool,
}

struct SchedulerState<D> {
  next_id: u64,
  queued: Vec<TaskRecord<D>>,
  executing: Vec<ExecutingTask<D>>,
}

struct SchedulerInner<D> {
  max_concurrent: usize,
  state: Mutex<SchedulerState<D>>,
}

/// Shared, priority-aware work queue. Clones refer to the same queue.
pub struct TaskScheduler<D: TaskDescription> {
  inner: Arc<SchedulerInner<D>>,
}

impl<D: TaskDescription> Clone for TaskScheduler<D> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<D: TaskDescription> TaskScheduler<D> {
  pub fn new(max_concurrent: usize) -> Self {
    Self {
      inner: Arc::new(SchedulerInner {
        max_concurrent: max_concurrent.max(1),
        state: Mutex::new(SchedulerState {
          next_id: 0,
          queued: Vec::new(),
          executing: Vec::new(),
        }),
      }),
    }
  }

  /// Scheduler bounded at the host's CPU count.
  pub fn with_default_concurrency() -> Self {
    Self::new(num_cpus::get())
  }

  pub fn max_concurrent(&self) -> usize {
    self.inner.max_concurrent
  }

  pub fn schedule(&self, description: D) -> TaskHandle {
    self.schedule_with_callback(description, None)
  }

  /// Enqueue a task, returning a handle that resolves when it finishes.
  ///
  /// If an idempotent task is already queued, its handle is returned instead
  /// and its effective priority is raised to the maximum of the two, so a
  /// user-blocking request is never gated behind a background duplicate.
  pub fn schedule_with_callback(&self, description: D, state_cb: Option<StateCallback>) -> TaskHandle {
    let handle = {
      let mut state = self.inner.state.lock().unwrap();

      if let Some(index) = state
        .queued
        .iter()
        .position(|queued| queued.description.is_idempotent_with(&description))
      {
        if description.priority() > state.queued[index].priority {
          trace!(
            task = %state.queued[index].description,
            "Elevating queued duplicate to {:?}",
            description.priority()
          );
          state.queued[index].priority = description.priority();
        }
        let effective = state.queued[index].priority;
        let handle = TaskHandle {
          id: state.queued[index].id,
          cancel: state.queued[index].cancel.clone(),
          finished: state.queued[index].finished_tx.subscribe(),
        };
        debug!(task = %description, "Deduplicated against queued task {}", handle.id);
        // An elevated duplicate counts as newly arrived work for the
        // reschedule protocol: running lower-priority tasks must still make
        // room for it.
        trigger_reschedules(&mut state, effective, &description);
        return handle;
      }

      let id = state.next_id;
      state.next_id += 1;
      let (finished_tx, finished_rx) = watch::channel(false);
      let record = TaskRecord {
        id,
        seq: id,
        priority: description.priority(),
        description,
        state_cb,
        cancel: CancellationToken::new(),
        finished_tx,
      };
      let handle = TaskHandle {
        id,
        cancel: record.cancel.clone(),
        finished: finished_rx,
      };

      trigger_reschedules(&mut state, record.priority, &record.description);
      state.queued.push(record);
      handle
    };

    self.poke();
    handle
  }

  /// Snapshot of (queued, executing) task counts.
  pub fn pressure(&self) -> (usize, usize) {
    let state = self.inner.state.lock().unwrap();
    (state.queued.len(), state.executing.len())
  }

  /// Start queued tasks while the concurrency budget allows. State
  /// callbacks fire from the spawned task, never in the caller's stack.
  fn poke(&self) {
    loop {
      let next = {
        let mut state = self.inner.state.lock().unwrap();
        if state.executing.len() >= self.inner.max_concurrent {
          return;
        }

        // Highest priority first; FIFO (smallest seq) within a band.
        let best = state
          .queued
          .iter()
          .enumerate()
          .max_by_key(|(_, record)| (record.priority, std::cmp::Reverse(record.seq)))
          .map(|(index, _)| index);
        let Some(index) = best else { return };

        let record = state.queued.swap_remove(index);
        let attempt_cancel = record.cancel.child_token();
        let description = record.description.clone();
        let state_cb = record.state_cb.clone();
        let id = record.id;
        state.executing.push(ExecutingTask {
          record,
          attempt_cancel: attempt_cancel.clone(),
          reschedule_requested: false,
        });
        (id, description, attempt_cancel, state_cb)
      };

      let (id, description, attempt_cancel, state_cb) = next;
      let scheduler = self.clone();
      tokio::spawn(async move {
        if let Some(cb) = &state_cb {
          cb(TaskExecutionState::Executing);
        }
        trace!(task = %description, id, "Task started executing");
        description.execute(attempt_cancel).await;
        scheduler.finalize(id);
      });
    }
  }

  /// Called when an execution attempt returns: either requeue the task (the
  /// attempt was cancelled to be rescheduled) or mark it finished.
  fn finalize(&self, id: u64) {
    let outcome = {
      let mut state = self.inner.state.lock().unwrap();
      let Some(position) = state.executing.iter().position(|task| task.record.id == id) else {
        return;
      };
      let task = state.executing.swap_remove(position);
      let reschedule = task.reschedule_requested && !task.record.cancel.is_cancelled();
      (task.record, reschedule)
    };

    let (mut record, reschedule) = outcome;
    if reschedule {
      if let Some(cb) = &record.state_cb {
        cb(TaskExecutionState::CancelledToBeRescheduled);
      }
      trace!(task = %record.description, "Requeueing rescheduled task at demoted priority");
      record.priority = record.priority.demoted();
      {
        let mut state = self.inner.state.lock().unwrap();
        record.seq = state.next_id;
        state.next_id += 1;
        state.queued.push(record);
      }
    } else {
      if let Some(cb) = &record.state_cb {
        cb(TaskExecutionState::Finished);
      }
      let _ = record.finished_tx.send(true);
    }

    self.poke();
  }
}

/// Cancel-to-reschedule every running task that should yield to newly
/// arrived (or newly elevated) work of the given priority.
fn trigger_reschedules<D: TaskDescription>(state: &mut SchedulerState<D>, priority: TaskPriority, newer: &D) {
  for executing in state.executing.iter_mut() {
    if !executing.reschedule_requested
      && priority > executing.record.priority
      && executing.record.description.should_reschedule_for(newer)
    {
      debug!(
        running = %executing.record.description,
        newer = %newer,
        "Cancelling running task to reschedule it behind higher-priority work"
      );
      executing.reschedule_requested = true;
      executing.attempt_cancel.cancel();
    }
  }
}
