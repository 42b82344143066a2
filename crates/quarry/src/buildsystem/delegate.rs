//! Build-system delegate bus.
//!
//! Observers register weakly: the bus must never prolong a delegate's
//! lifetime. Notifications upgrade on use and silently drop observers that
//! are gone.

use std::{
  collections::HashSet,
  path::PathBuf,
  sync::{Arc, Mutex, Weak},
};

use tracing::trace;

/// Observer of build-system state changes.
pub trait BuildSystemDelegate: Send + Sync {
  /// Build settings for the given files may have changed.
  fn file_build_settings_changed(&self, files: &HashSet<PathBuf>);

  /// Dependencies of the given files have been modified; indexed state for
  /// them may be stale.
  fn file_dependencies_updated(&self, files: &HashSet<PathBuf>);

  /// The set of files the build system can handle has changed.
  fn file_handling_capability_changed(&self);
}

/// Weakly-held fan-out to registered delegates. Clones share the observer
/// list.
#[derive(Clone, Default)]
pub struct DelegateBus {
  observers: Arc<Mutex<Vec<Weak<dyn BuildSystemDelegate>>>>,
}

impl DelegateBus {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, delegate: Weak<dyn BuildSystemDelegate>) {
    self.observers.lock().unwrap().push(delegate);
  }

  pub fn notify_file_build_settings_changed(&self, files: &HashSet<PathBuf>) {
    self.for_each(|delegate| delegate.file_build_settings_changed(files));
  }

  pub fn notify_file_dependencies_updated(&self, files: &HashSet<PathBuf>) {
    self.for_each(|delegate| delegate.file_dependencies_updated(files));
  }

  pub fn notify_file_handling_capability_changed(&self) {
    self.for_each(|delegate| delegate.file_handling_capability_changed());
  }

  /// Invoke `f` on every live observer, pruning dead ones.
  fn for_each(&self, f: impl Fn(&dyn BuildSystemDelegate)) {
    let mut observers = self.observers.lock().unwrap();
    observers.retain(|weak| match weak.upgrade() {
      Some(delegate) => {
        f(&*delegate);
        true
      }
      None => {
        trace!("Dropping notification for released delegate");
        false
      }
    });
  }
}
