//! Semantic index manager.
//!
//! The manager is the per-workspace coordinator between the build system and
//! the task scheduler. It groups out-of-date files by target, orders targets
//! topologically, and for each batch schedules one preparation task followed
//! by per-file index-store updates, tracking every file's freshness in an
//! index-status map it exclusively owns.
//!
//! # Ordering
//!
//! The status map is guarded by a lock that is never held across an
//! `.await`. Index tasks are created and their files marked `Scheduled`
//! inside a single critical section: were there a suspension point in
//! between, a store update could transition a file to `UpToDate` before it
//! was ever marked `Scheduled`.
//!
//! Preparing a target builds its dependencies first (the build tool
//! guarantees that), so a batch's store updates only run against fully
//! prepared targets. Across concurrent invocations order is not global:
//! a narrow user-initiated request may leapfrog background work through the
//! scheduler's reschedule protocol.

use std::{
  collections::{HashMap, HashSet},
  fmt,
  path::PathBuf,
  sync::{Arc, Mutex},
};

use async_trait::async_trait;
use quarry_core::ConfiguredTarget;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use url::Url;

pub mod prepare;
pub mod status;
pub mod update;

#[cfg(test)]
pub(crate) mod __tests__;

pub use prepare::{PrepareExit, PrepareOutcome, PrepareResultCallback, PrepareTaskDescription};
pub use status::{BatchIndexTask, FileIndexStatus};
pub use update::{CompilerIndexer, IndexStore, IndexStoreError, UpdateIndexStoreTaskDescription};

use crate::{
  buildsystem::{DelegateBus, WorkspaceBuildSystem, resolver::DEPENDENCY_FANOUT_WINDOW},
  debounce::Debouncer,
  scheduler::{StateCallback, TaskDescription, TaskPriority, TaskScheduler},
};

/// Targets prepared per index task. The design permits widening this up to
/// half the CPU count; preparation currently stays narrow so a single
/// expensive target cannot gate unrelated ones.
const PREPARATION_BATCH_SIZE: usize = 1;

/// Files per index-store update task.
const UPDATE_SUB_BATCH_SIZE: usize = 1;

// ============================================================================
// Task description
// ============================================================================

/// The scheduler's view of index work: either a target preparation or a
/// per-file store update. Both kinds share one scheduler so its concurrency
/// budget bounds the whole pipeline.
#[derive(Clone)]
pub enum IndexTaskDescription {
  Prepare(PrepareTaskDescription),
  UpdateIndexStore(UpdateIndexStoreTaskDescription),
}

impl fmt::Display for IndexTaskDescription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Prepare(task) => task.fmt(f),
      Self::UpdateIndexStore(task) => task.fmt(f),
    }
  }
}

#[async_trait]
impl TaskDescription for IndexTaskDescription {
  async fn execute(&self, cancel: CancellationToken) {
    match self {
      Self::Prepare(task) => task.run(&cancel).await,
      Self::UpdateIndexStore(task) => task.run(&cancel).await,
    }
  }

  fn priority(&self) -> TaskPriority {
    match self {
      Self::Prepare(task) => task.priority(),
      Self::UpdateIndexStore(task) => task.priority(),
    }
  }

  fn is_idempotent_with(&self, other: &Self) -> bool {
    match (self, other) {
      (Self::Prepare(a), Self::Prepare(b)) => a.is_idempotent_with(b),
      (Self::UpdateIndexStore(a), Self::UpdateIndexStore(b)) => a.is_idempotent_with(b),
      _ => false,
    }
  }

  fn should_reschedule_for(&self, newer: &Self) -> bool {
    // Only running preparations yield: they are expensive, idempotent, and
    // restartable. Store updates are short enough to finish.
    matches!(self, Self::Prepare(_)) && newer.priority() > self.priority()
  }
}

// ============================================================================
// Manager
// ============================================================================

/// Observability hooks; all optional.
#[derive(Clone, Default)]
pub struct IndexHooks {
  /// Called with the number of index tasks created by a scheduling step.
  pub tasks_were_scheduled: Option<Arc<dyn Fn(usize) + Send + Sync>>,
  /// Called whenever an index task finishes a file.
  pub index_task_did_finish: Option<Arc<dyn Fn() + Send + Sync>>,
  /// Per-target preparation outcome, with captured build-tool output.
  pub prepare_result: Option<PrepareResultCallback>,
}

#[derive(Default)]
struct ManagerState {
  index_status: HashMap<PathBuf, FileIndexStatus>,
  /// The single build-graph-generation task; at most one runs at a time.
  generate_build_graph_task: Option<BatchIndexTask>,
}

/// Per-workspace coordinator for semantic indexing.
pub struct SemanticIndexManager {
  build_system: Arc<dyn WorkspaceBuildSystem>,
  index_store: Arc<dyn IndexStore>,
  scheduler: TaskScheduler<IndexTaskDescription>,
  hooks: IndexHooks,
  /// Exclusively owned; never locked across an `.await`.
  state: Arc<Mutex<ManagerState>>,
  dependency_debouncer: Arc<Debouncer<HashSet<PathBuf>>>,
}

impl SemanticIndexManager {
  pub fn new(
    build_system: Arc<dyn WorkspaceBuildSystem>,
    index_store: Arc<dyn IndexStore>,
    scheduler: TaskScheduler<IndexTaskDescription>,
    delegates: DelegateBus,
    hooks: IndexHooks,
  ) -> Arc<Self> {
    let dependency_debouncer = Arc::new(Debouncer::new(
      DEPENDENCY_FANOUT_WINDOW,
      |mut older: HashSet<PathBuf>, newer: HashSet<PathBuf>| {
        older.extend(newer);
        older
      },
      move |files: HashSet<PathBuf>| {
        let delegates = delegates.clone();
        async move {
          delegates.notify_file_dependencies_updated(&files);
        }
      },
    ));
    Arc::new(Self {
      build_system,
      index_store,
      scheduler,
      hooks,
      state: Arc::new(Mutex::new(ManagerState::default())),
      dependency_debouncer,
    })
  }

  /// Low-priority index pass over the given files. Files already up to date
  /// are skipped.
  pub fn schedule_background_index(self: &Arc<Self>, files: &[PathBuf]) {
    let tasks = self.schedule_index_tasks(files, TaskPriority::Background);
    debug!(count = tasks.len(), "Scheduled background index tasks");
  }

  /// Regenerate the build graph, then background-index every source file
  /// the build system reports. Only one such task runs at a time; requests
  /// arriving while one is in flight are dropped.
  pub fn schedule_build_graph_generation_and_background_index_all_files(self: &Arc<Self>) {
    let mut state = self.state.lock().unwrap();
    if let Some(task) = &state.generate_build_graph_task
      && !task.is_finished()
    {
      debug!("Build-graph generation already in progress; not scheduling another");
      return;
    }

    let manager = Arc::clone(self);
    let task = BatchIndexTask::spawn(move |_own| async move {
      if let Err(error) = manager.build_system.reload().await {
        error!(%error, "Build-graph generation failed; skipping background index");
        return;
      }
      let files: Vec<PathBuf> = manager
        .build_system
        .source_files()
        .iter()
        .filter_map(|info| info.uri.to_file_path().ok())
        .collect();
      manager.schedule_background_index(&files);
    });
    state.generate_build_graph_task = Some(task);
  }

  /// Wait until every already-scheduled index task has finished and the
  /// external store has ingested the produced units.
  pub async fn wait_for_up_to_date_index(&self) {
    let graph_task = self.state.lock().unwrap().generate_build_graph_task.clone();
    if let Some(task) = graph_task {
      task.wait().await;
    }

    // Snapshot after graph generation: it may have scheduled new tasks.
    let tasks: Vec<BatchIndexTask> = {
      let state = self.state.lock().unwrap();
      state.index_status.values().filter_map(|status| status.task().cloned()).collect()
    };
    futures::future::join_all(tasks.iter().map(|task| task.wait())).await;

    self.index_store.poll_for_unit_changes().await;
  }

  /// Wait until the index is up to date for the given files. The narrowed
  /// scope schedules at user-initiated priority, which can cancel-and-
  /// reschedule broader background work through the scheduler.
  pub async fn wait_for_up_to_date_index_for_files(self: &Arc<Self>, files: &[PathBuf]) {
    let graph_task = self.state.lock().unwrap().generate_build_graph_task.clone();
    if let Some(task) = graph_task {
      task.wait().await;
    }

    let tasks = self.schedule_index_tasks(files, TaskPriority::UserInitiated);
    futures::future::join_all(tasks.iter().map(|task| task.wait())).await;

    self.index_store.poll_for_unit_changes().await;
  }

  /// Files whose index tasks are currently (scheduled, executing).
  pub fn in_progress_index_tasks(&self) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let state = self.state.lock().unwrap();
    let mut scheduled = Vec::new();
    let mut executing = Vec::new();
    for (file, file_status) in &state.index_status {
      match file_status {
        FileIndexStatus::Scheduled(_) => scheduled.push(file.clone()),
        FileIndexStatus::Executing(_) => executing.push(file.clone()),
        FileIndexStatus::UpToDate => {}
      }
    }
    scheduled.sort();
    executing.sort();
    (scheduled, executing)
  }

  /// The scheduling algorithm: filter, order, batch, and spawn index tasks.
  ///
  /// Everything from task creation to the `Scheduled` status writes happens
  /// under the state lock, with no suspension point.
  fn schedule_index_tasks(self: &Arc<Self>, files: &[PathBuf], priority: TaskPriority) -> Vec<BatchIndexTask> {
    let mut state = self.state.lock().unwrap();

    let mut out_of_date: Vec<PathBuf> = files
      .iter()
      .filter(|file| !state.index_status.get(*file).is_some_and(FileIndexStatus::is_up_to_date))
      .cloned()
      .collect();
    out_of_date.sort();
    out_of_date.dedup();

    let mut files_by_target: HashMap<ConfiguredTarget, Vec<PathBuf>> = HashMap::new();
    for file in out_of_date {
      let Ok(uri) = Url::from_file_path(&file) else {
        error!(file = %file.display(), "File path is not expressible as a URI; not indexing");
        continue;
      };
      match self.build_system.configured_targets(&uri).into_iter().next() {
        Some(canonical) => files_by_target.entry(canonical).or_default().push(file),
        None => error!(file = %file.display(), "File is not part of any target; not updating index"),
      }
    }
    if files_by_target.is_empty() {
      return Vec::new();
    }

    let mut keys: Vec<ConfiguredTarget> = files_by_target.keys().cloned().collect();
    keys.sort();
    let sorted = self.build_system.topological_sort(&keys);
    let ordered = if is_same_target_set(&sorted, &keys) {
      sorted
    } else {
      // Sanity check tripped: index everything anyway, in a deterministic
      // (target id, run destination) order.
      error!("Topological sort changed the target set; falling back to lexicographic target order");
      keys
    };

    let mut batch_tasks = Vec::new();
    for batch in ordered.chunks(PREPARATION_BATCH_SIZE) {
      let batch_files: Vec<(ConfiguredTarget, Vec<PathBuf>)> = batch
        .iter()
        .filter_map(|target| files_by_target.remove(target).map(|files| (target.clone(), files)))
        .collect();
      let task = self.spawn_batch(batch_files.clone(), priority);
      for (_, files) in &batch_files {
        for file in files {
          state.index_status.insert(file.clone(), FileIndexStatus::Scheduled(task.clone()));
        }
      }
      batch_tasks.push(task);
    }
    drop(state);

    if !batch_tasks.is_empty()
      && let Some(hook) = &self.hooks.tasks_were_scheduled
    {
      hook(batch_tasks.len());
    }
    batch_tasks
  }

  /// One index task: prepare the batch's targets, then fan out store
  /// updates. Spawning is synchronous; the returned handle is what the
  /// status map stores. The preparation is enqueued here rather than inside
  /// the spawned future so that within one scheduling step preparations
  /// enter the scheduler in topological order.
  fn spawn_batch(
    self: &Arc<Self>,
    batch: Vec<(ConfiguredTarget, Vec<PathBuf>)>,
    priority: TaskPriority,
  ) -> BatchIndexTask {
    let targets: Vec<ConfiguredTarget> = batch.iter().map(|(target, _)| target.clone()).collect();
    let preparation = IndexTaskDescription::Prepare(PrepareTaskDescription::new(
      targets.clone(),
      priority,
      self.build_system.build_parameters().clone(),
      self.build_system.workspace_path().to_path_buf(),
      self.hooks.prepare_result.clone(),
    ));
    let prepare_handle = self.scheduler.schedule(preparation);

    let manager = Arc::clone(self);
    BatchIndexTask::spawn(move |own_handle| async move {
      prepare_handle.wait().await;

      // Preparation rebuilt these targets' products; every file they own may
      // now see updated dependencies.
      let prepared_sources = manager.build_system.sources_of_targets(&targets);
      if !prepared_sources.is_empty() {
        manager.dependency_debouncer.schedule(prepared_sources);
      }

      let mut update_handles = Vec::new();
      for (target, files) in &batch {
        for chunk in files.chunks(UPDATE_SUB_BATCH_SIZE) {
          let description = IndexTaskDescription::UpdateIndexStore(UpdateIndexStoreTaskDescription::new(
            chunk.to_vec(),
            target.clone(),
            priority,
            Arc::clone(&manager.build_system),
            Arc::clone(&manager.index_store),
          ));
          let callback: StateCallback = {
            let state = Arc::clone(&manager.state);
            let files: Vec<PathBuf> = chunk.to_vec();
            let own = own_handle.clone();
            let finish_hook = manager.hooks.index_task_did_finish.clone();
            Arc::new(move |transition| {
              let mut any_finished = false;
              {
                let mut state = state.lock().unwrap();
                for file in &files {
                  any_finished |= status::apply_transition(&mut state.index_status, file, transition, &own);
                }
              }
              if any_finished
                && let Some(hook) = &finish_hook
              {
                hook();
              }
            })
          };
          update_handles.push(manager.scheduler.schedule_with_callback(description, Some(callback)));
        }
      }
      futures::future::join_all(update_handles.iter().map(|handle| handle.wait())).await;
    })
  }
}

fn is_same_target_set(sorted: &[ConfiguredTarget], expected_sorted: &[ConfiguredTarget]) -> bool {
  let mut resorted = sorted.to_vec();
  resorted.sort();
  resorted == expected_sorted
}
