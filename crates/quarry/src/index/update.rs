//! Index-store updates for individual files.
//!
//! The on-disk index database is an external collaborator reached through
//! [`IndexStore`]. The update task resolves each file's build settings and
//! hands them to the store; [`CompilerIndexer`] is the default
//! implementation and re-runs the file's compiler invocation with the index
//! store attached.

use std::{
  fmt,
  path::{Path, PathBuf},
  process::Stdio,
  sync::Arc,
};

use async_trait::async_trait;
use quarry_core::{ConfiguredTarget, Language, Toolchain};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};
use url::Url;

use super::prepare::{interrupt, spawn_pipe_reader};
use crate::{
  buildsystem::{FileBuildSettings, WorkspaceBuildSystem},
  scheduler::TaskPriority,
};

#[derive(Debug, thiserror::Error)]
pub enum IndexStoreError {
  #[error("Failed to launch indexer: {0}")]
  Launch(#[source] std::io::Error),

  #[error("Indexer failed for {file}: {message}")]
  Indexer { file: PathBuf, message: String },
}

/// The external index store the core updates but never reads.
#[async_trait]
pub trait IndexStore: Send + Sync {
  /// Bring the store's record of `file` up to date using the file's
  /// compiler invocation.
  async fn update_file(
    &self,
    file: &Path,
    settings: &FileBuildSettings,
    cancel: &CancellationToken,
  ) -> Result<(), IndexStoreError>;

  /// Ingest unit files produced since the last poll, waiting until the
  /// store has processed them.
  async fn poll_for_unit_changes(&self);
}

/// Description of one index-store update: refresh a sub-batch of files that
/// belong to a single target.
#[derive(Clone)]
pub struct UpdateIndexStoreTaskDescription {
  pub files: Vec<PathBuf>,
  pub target: ConfiguredTarget,
  priority: TaskPriority,
  build_system: Arc<dyn WorkspaceBuildSystem>,
  index_store: Arc<dyn IndexStore>,
}

impl UpdateIndexStoreTaskDescription {
  pub fn new(
    files: Vec<PathBuf>,
    target: ConfiguredTarget,
    priority: TaskPriority,
    build_system: Arc<dyn WorkspaceBuildSystem>,
    index_store: Arc<dyn IndexStore>,
  ) -> Self {
    Self {
      files,
      target,
      priority,
      build_system,
      index_store,
    }
  }

  pub fn priority(&self) -> TaskPriority {
    self.priority
  }

  pub fn is_idempotent_with(&self, other: &Self) -> bool {
    self.target == other.target && self.files == other.files
  }

  pub(crate) async fn run(&self, cancel: &CancellationToken) {
    for file in &self.files {
      if cancel.is_cancelled() {
        return;
      }
      let Ok(uri) = Url::from_file_path(file) else {
        error!(file = %file.display(), "File path is not expressible as a URI; not indexing");
        continue;
      };
      let language = Language::from_path(file).unwrap_or(Language::Swift);
      match self.build_system.build_settings(&uri, &self.target, language) {
        Ok(Some(settings)) => {
          if let Err(store_error) = self.index_store.update_file(file, &settings, cancel).await {
            // Indexer failures never propagate out of the index pass.
            error!(file = %file.display(), error = %store_error, "Index-store update failed");
          }
        }
        Ok(None) => {
          error!(
            file = %file.display(),
            target = %self.target,
            "No build settings for file; omitting from index pass"
          );
        }
        Err(settings_error) => {
          error!(
            file = %file.display(),
            error = %settings_error,
            "Could not resolve build settings; omitting from index pass"
          );
        }
      }
    }
  }
}

impl fmt::Display for UpdateIndexStoreTaskDescription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "updating index store for {} file(s) in {}", self.files.len(), self.target)
  }
}

// ============================================================================
// Compiler-driven store
// ============================================================================

/// `IndexStore` that re-runs each file's compiler invocation with
/// `-index-store-path` pointed at the store directory. The compiler writes
/// unit files; the external database ingests them on its own schedule, so
/// polling is a no-op here.
pub struct CompilerIndexer {
  toolchain: Toolchain,
  store_path: PathBuf,
}

impl CompilerIndexer {
  pub fn new(toolchain: Toolchain, store_path: PathBuf) -> Self {
    Self { toolchain, store_path }
  }
}

#[async_trait]
impl IndexStore for CompilerIndexer {
  async fn update_file(
    &self,
    file: &Path,
    settings: &FileBuildSettings,
    cancel: &CancellationToken,
  ) -> Result<(), IndexStoreError> {
    let mut command = Command::new(self.toolchain.swiftc());
    command
      .args(&settings.arguments)
      .arg("-index-store-path")
      .arg(&self.store_path)
      .current_dir(&settings.working_directory)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped());

    trace!(file = %file.display(), "Launching indexer");
    let mut child = command.spawn().map_err(IndexStoreError::Launch)?;
    let stderr_reader = spawn_pipe_reader(child.stderr.take());

    let status = tokio::select! {
      status = child.wait() => status,
      _ = cancel.cancelled() => {
        interrupt(&child);
        child.wait().await
      }
    };

    match status {
      Ok(status) if status.success() || cancel.is_cancelled() => Ok(()),
      Ok(status) => {
        let stderr = stderr_reader.await.unwrap_or_default();
        debug!(file = %file.display(), ?status, "Indexer exited non-zero");
        Err(IndexStoreError::Indexer {
          file: file.to_path_buf(),
          message: stderr,
        })
      }
      Err(io_error) => Err(IndexStoreError::Launch(io_error)),
    }
  }

  async fn poll_for_unit_changes(&self) {
    trace!(store = %self.store_path.display(), "Unit ingestion is driven by the external database; nothing to poll");
  }
}
