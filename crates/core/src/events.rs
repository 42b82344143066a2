//! File-system events as delivered by the host.
//!
//! The core does not watch the filesystem itself; the host (typically an LSP
//! server forwarding `workspace/didChangeWatchedFiles`) calls
//! `files_did_change` with a batch of these events.

use serde::{Deserialize, Serialize};
use url::Url;

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEventKind {
  Created,
  Changed,
  Deleted,
  /// The watcher could not determine what happened. Treated conservatively
  /// as both a possible creation and a possible change.
  Unknown,
}

/// A single file-system event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
  pub uri: Url,
  pub kind: FileEventKind,
}

impl FileEvent {
  pub fn new(uri: Url, kind: FileEventKind) -> Self {
    Self { uri, kind }
  }

  /// The event's path, if the URI refers to a local file.
  pub fn file_path(&self) -> Option<std::path::PathBuf> {
    self.uri.to_file_path().ok()
  }
}
