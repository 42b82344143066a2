//! Source language classification.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Language of a source file, derived from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
  Swift,
  C,
  Cpp,
  ObjectiveC,
  ObjectiveCpp,
}

impl Language {
  /// Classify a file by extension. Headers classify as C; the build-settings
  /// resolver synthesizes their invocations from a sibling source anyway.
  pub fn from_path(path: &Path) -> Option<Self> {
    match path.extension()?.to_str()? {
      "swift" => Some(Self::Swift),
      "c" | "h" => Some(Self::C),
      "cpp" | "cc" | "cxx" | "hpp" => Some(Self::Cpp),
      "m" => Some(Self::ObjectiveC),
      "mm" => Some(Self::ObjectiveCpp),
      _ => None,
    }
  }
}
