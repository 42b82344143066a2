//! Package build system: loading, build-settings resolution, and change
//! classification for a manifest-rooted workspace.
//!
//! # Components
//!
//! - [`resolver::PackageBuildSystem`]: owns the target maps and serves
//!   per-file build-settings queries
//! - [`loader::PackageLoader`]: seam to the external package manager
//! - [`delegate::DelegateBus`]: weakly-held observer fan-out
//! - [`discovery::find_package_root`]: upward manifest search

pub mod delegate;
pub mod discovery;
pub mod loader;
pub mod resolver;

use std::{
  collections::HashSet,
  path::{Path, PathBuf},
};

use async_trait::async_trait;
use quarry_core::{ConfiguredTarget, Language, SourceFileInfo};
use url::Url;

pub use delegate::{BuildSystemDelegate, DelegateBus};
pub use discovery::find_package_root;
pub use loader::{BuildParameters, LoadError, PackageGraph, PackageLoader, SwiftCliLoader, TargetDescription};
pub use resolver::{
  BuildSystemError, FileBuildSettings, PackageBuildSystem, ReloadStatus, ReloadStatusCallback, SettingsError,
};

/// File name of the package manifest at a workspace root.
pub const MANIFEST_FILE_NAME: &str = "Package.swift";

/// What the semantic index manager needs from a build system.
///
/// [`resolver::PackageBuildSystem`] is the production implementation; tests
/// substitute wrappers to exercise fallback paths.
#[async_trait]
pub trait WorkspaceBuildSystem: Send + Sync {
  fn workspace_path(&self) -> &Path;

  fn build_parameters(&self) -> &BuildParameters;

  /// Targets that can build the document, most specific first. Empty when
  /// the build system cannot handle the document.
  fn configured_targets(&self, uri: &Url) -> Vec<ConfiguredTarget>;

  /// Compiler invocation for a document within a target, synthesizing a
  /// substitute invocation for files the target does not list.
  fn build_settings(
    &self,
    uri: &Url,
    target: &ConfiguredTarget,
    language: Language,
  ) -> Result<Option<FileBuildSettings>, SettingsError>;

  /// Stable sort by topological index; unknown targets sort to the end.
  fn topological_sort(&self, targets: &[ConfiguredTarget]) -> Vec<ConfiguredTarget>;

  /// All targets that could depend on any of `targets`.
  fn targets_depending_on(&self, targets: &[ConfiguredTarget]) -> Vec<ConfiguredTarget>;

  /// Union of the source files of the given targets.
  fn sources_of_targets(&self, targets: &[ConfiguredTarget]) -> HashSet<PathBuf>;

  /// Every source file of the loaded graph.
  fn source_files(&self) -> Vec<SourceFileInfo>;

  /// Regenerate the build graph from the package manifest.
  async fn reload(&self) -> Result<(), LoadError>;
}
