//! Build-setup configuration.
//!
//! A `BuildSetup` describes how the workspace should be built for indexing:
//! configuration, workspace kind, scratch directory, and extra compiler/linker
//! flags. Setups merge with a later setup taking precedence for scalars while
//! flag vectors are appended.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Build configuration to use for preparation and indexing.
///
/// `Unset` behaves as `Debug` everywhere a concrete configuration is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildConfiguration {
  Debug,
  Release,
  #[default]
  Unset,
}

impl BuildConfiguration {
  /// Resolve `Unset` to the default configuration.
  pub fn effective(self) -> Self {
    match self {
      Self::Unset => Self::Debug,
      other => other,
    }
  }

  /// The value passed to the build tool's `-c` flag.
  pub fn as_argument(self) -> &'static str {
    match self.effective() {
      Self::Release => "release",
      _ => "debug",
    }
  }
}

/// Which kind of workspace to open when several build systems could handle a
/// directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceType {
  BuildServer,
  CompilationDatabase,
  SwiftPm,
}

/// Extra flags forwarded to the respective tools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildFlags {
  pub c: Vec<String>,
  pub cxx: Vec<String>,
  pub swift: Vec<String>,
  pub linker: Vec<String>,
}

impl BuildFlags {
  /// Append `other`'s flags after this set's flags.
  fn appending(&self, other: &BuildFlags) -> BuildFlags {
    let join = |a: &[String], b: &[String]| a.iter().chain(b).cloned().collect();
    BuildFlags {
      c: join(&self.c, &other.c),
      cxx: join(&self.cxx, &other.cxx),
      swift: join(&self.swift, &other.swift),
      linker: join(&self.linker, &other.linker),
    }
  }
}

/// Host-provided build setup for a workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSetup {
  pub configuration: BuildConfiguration,
  pub default_workspace_type: Option<WorkspaceType>,
  /// Absolute path to the build scratch directory
  pub scratch_path: Option<PathBuf>,
  pub flags: BuildFlags,
}

impl BuildSetup {
  /// Merge two setups. Scalars from `other` win when set; flag vectors are
  /// appended with `other`'s flags last.
  pub fn merging(&self, other: &BuildSetup) -> BuildSetup {
    BuildSetup {
      configuration: match other.configuration {
        BuildConfiguration::Unset => self.configuration,
        set => set,
      },
      default_workspace_type: other.default_workspace_type.or(self.default_workspace_type),
      scratch_path: other.scratch_path.clone().or_else(|| self.scratch_path.clone()),
      flags: self.flags.appending(&other.flags),
    }
  }
}
