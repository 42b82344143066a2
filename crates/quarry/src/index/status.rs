//! Per-file index freshness tracking.
//!
//! ```text
//!   (absent) ──schedule──▶ Scheduled(T)
//!   Scheduled(T) ──Executing──▶ Executing(T)
//!   Executing(T) ──CancelledToBeRescheduled──▶ Scheduled(T)
//!   Executing(T) ──Finished──▶ UpToDate
//! ```
//!
//! Transitions from an unexpected prior state log a fault and proceed with
//! the requested transition anyway.

use std::{
  collections::HashMap,
  future::Future,
  path::{Path, PathBuf},
};

use tokio::sync::watch;
use tracing::error;

use crate::scheduler::TaskExecutionState;

/// Awaitable, cheap-clone reference to one spawned index batch task (a
/// preparation followed by that batch's index-store updates).
#[derive(Clone)]
pub struct BatchIndexTask {
  finished: watch::Receiver<bool>,
}

impl BatchIndexTask {
  /// Spawn `make_future` as a batch task. The closure receives the task's
  /// own handle so state callbacks created inside the batch can reference
  /// it. Spawning is synchronous; nothing runs before this returns.
  pub(crate) fn spawn<F, Fut>(make_future: F) -> Self
  where
    F: FnOnce(BatchIndexTask) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let (tx, rx) = watch::channel(false);
    let task = Self { finished: rx };
    let future = make_future(task.clone());
    tokio::spawn(async move {
      future.await;
      let _ = tx.send(true);
    });
    task
  }

  pub async fn wait(&self) {
    let mut finished = self.finished.clone();
    let _ = finished.wait_for(|done| *done).await;
  }

  pub fn is_finished(&self) -> bool {
    *self.finished.borrow()
  }
}

impl std::fmt::Debug for BatchIndexTask {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BatchIndexTask").field("finished", &self.is_finished()).finish()
  }
}

/// Freshness of one file's index. A file absent from the status map has
/// never been indexed.
#[derive(Debug, Clone)]
pub enum FileIndexStatus {
  /// An index task covering the file has been created but its store update
  /// has not started executing.
  Scheduled(BatchIndexTask),
  /// The file's index-store update is executing.
  Executing(BatchIndexTask),
  UpToDate,
}

impl FileIndexStatus {
  pub fn is_up_to_date(&self) -> bool {
    matches!(self, Self::UpToDate)
  }

  /// The in-flight task, if any. At most one per file at any instant.
  pub fn task(&self) -> Option<&BatchIndexTask> {
    match self {
      Self::Scheduled(task) | Self::Executing(task) => Some(task),
      Self::UpToDate => None,
    }
  }
}

/// Apply a scheduler state transition for one file, returning whether the
/// transition was terminal. Unexpected prior states are faults: logged, then
/// the transition proceeds.
pub(crate) fn apply_transition(
  statuses: &mut HashMap<PathBuf, FileIndexStatus>,
  file: &Path,
  transition: TaskExecutionState,
  task: &BatchIndexTask,
) -> bool {
  let current = statuses.get(file);
  match transition {
    TaskExecutionState::Executing => {
      if !matches!(current, Some(FileIndexStatus::Scheduled(_))) {
        error!(
          file = %file.display(),
          state = state_name(current),
          "Index task started executing from an unexpected state"
        );
      }
      statuses.insert(file.to_path_buf(), FileIndexStatus::Executing(task.clone()));
      false
    }
    TaskExecutionState::CancelledToBeRescheduled => {
      if !matches!(current, Some(FileIndexStatus::Executing(_))) {
        error!(
          file = %file.display(),
          state = state_name(current),
          "Index task was rescheduled from an unexpected state"
        );
      }
      statuses.insert(file.to_path_buf(), FileIndexStatus::Scheduled(task.clone()));
      false
    }
    TaskExecutionState::Finished => {
      if !matches!(current, Some(FileIndexStatus::Executing(_))) {
        error!(
          file = %file.display(),
          state = state_name(current),
          "Index task finished from an unexpected state"
        );
      }
      statuses.insert(file.to_path_buf(), FileIndexStatus::UpToDate);
      true
    }
  }
}

fn state_name(status: Option<&FileIndexStatus>) -> &'static str {
  match status {
    None => "absent",
    Some(FileIndexStatus::Scheduled(_)) => "scheduled",
    Some(FileIndexStatus::Executing(_)) => "executing",
    Some(FileIndexStatus::UpToDate) => "up-to-date",
  }
}
