//! Configured-target identity and source-file metadata.

use serde::{Deserialize, Serialize};
use url::Url;

/// Addressable identity for a build target in a specific build configuration.
///
/// A target is identified by its name plus the run destination it is built
/// for. The pair is cheap to clone, hash, and compare, and is used as the key
/// for all target maps.
///
/// The reserved sentinel with empty `target_id` and empty `run_destination_id`
/// addresses the package manifest itself. User targets always have non-empty
/// names, so the sentinel cannot collide with them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfiguredTarget {
  /// Stable target name as reported by the package loader
  pub target_id: String,
  /// Run destination the target is configured for
  pub run_destination_id: String,
}

impl ConfiguredTarget {
  pub fn new(target_id: impl Into<String>, run_destination_id: impl Into<String>) -> Self {
    Self {
      target_id: target_id.into(),
      run_destination_id: run_destination_id.into(),
    }
  }

  /// The sentinel addressing the package manifest rather than a user target.
  pub fn for_package_manifest() -> Self {
    Self {
      target_id: String::new(),
      run_destination_id: String::new(),
    }
  }

  /// Whether this is the package-manifest sentinel.
  pub fn is_package_manifest(&self) -> bool {
    self.target_id.is_empty()
  }
}

impl std::fmt::Display for ConfiguredTarget {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.is_package_manifest() {
      write!(f, "<package-manifest>")
    } else {
      write!(f, "{}-{}", self.target_id, self.run_destination_id)
    }
  }
}

/// Metadata about a source file known to the build system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFileInfo {
  /// Location of the source file
  pub uri: Url,
  /// Whether the file belongs to the root package rather than a dependency
  pub is_part_of_root_project: bool,
  /// Whether the file may contain test declarations
  pub may_contain_tests: bool,
}
