//! Package-loader seam.
//!
//! The package manager itself is an external collaborator; the core talks to
//! it through [`PackageLoader`], which loads a module graph and answers two
//! side questions (does a file affect build settings, and which interpreter
//! flags evaluate the manifest). [`SwiftCliLoader`] is the default
//! implementation and shells out to `swift package describe --type json`.

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  process::Stdio,
  sync::Arc,
};

use async_trait::async_trait;
use quarry_core::{BuildConfiguration, BuildFlags, ConfiguredTarget, Toolchain};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, trace};

use super::MANIFEST_FILE_NAME;

/// Run destination assigned to targets loaded from a package manifest. The
/// package build system only builds for the host, so a single placeholder
/// destination is enough to address every target unambiguously.
pub const DEFAULT_RUN_DESTINATION: &str = "dummy";

/// Parameters the loader builds the module graph against.
#[derive(Debug, Clone)]
pub struct BuildParameters {
  pub configuration: BuildConfiguration,
  pub toolchain: Toolchain,
  /// Build products and intermediates go here.
  pub scratch_path: PathBuf,
  pub flags: BuildFlags,
  /// Index-only mode: operate against a private scratch directory and allow
  /// fetching unresolved dependencies during loads.
  pub index_only: bool,
}

/// One build target as reported by the package loader.
#[derive(Debug, Clone)]
pub struct TargetDescription {
  pub name: String,
  pub run_destination: String,
  /// Absolute paths of every source the target lists.
  pub sources: Vec<PathBuf>,
  /// The target's source root directory (absolute).
  pub source_root: PathBuf,
  /// Whether the target belongs to the root package rather than a dependency.
  pub is_part_of_root_package: bool,
  pub may_contain_tests: bool,
  /// Names of targets this target depends on.
  pub dependencies: Vec<String>,
}

impl TargetDescription {
  pub fn configured(&self) -> ConfiguredTarget {
    ConfiguredTarget::new(self.name.clone(), self.run_destination.clone())
  }
}

/// Source of per-file compiler invocations for the loaded graph.
pub trait BuildDescription: Send + Sync {
  /// Compiler arguments for a file the target lists. The returned vector
  /// contains the file's own path among the target's sources.
  fn compile_arguments(&self, target: &ConfiguredTarget, file: &Path) -> Result<Vec<String>, LoadError>;
}

/// Result of loading the package: targets in topological order (dependencies
/// first) plus the compile-argument source.
pub struct PackageGraph {
  pub targets: Vec<Arc<TargetDescription>>,
  pub description: Arc<dyn BuildDescription>,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
  #[error("Failed to launch package loader: {0}")]
  Launch(#[source] std::io::Error),

  #[error("Package loader failed: {0}")]
  Loader(String),

  #[error("Failed to parse package description: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("Package dependency graph contains a cycle involving {0}")]
  DependencyCycle(String),

  #[error("Unknown target: {0}")]
  UnknownTarget(ConfiguredTarget),
}

/// Loads a package rooted at a manifest and answers build-settings questions.
#[async_trait]
pub trait PackageLoader: Send + Sync {
  /// Load the module graph. Resolved dependency versions are forced unless
  /// `params.index_only`, in which case unresolved dependencies may be
  /// fetched.
  async fn load_package(&self, root: &Path, params: &BuildParameters) -> Result<PackageGraph, LoadError>;

  /// Whether the creation or deletion of a file at `path` can affect compile
  /// settings (and therefore requires a package reload).
  fn affects_build_settings(&self, path: &Path) -> bool;

  /// Interpreter flags for evaluating the package manifest itself.
  fn interpreter_flags(&self, manifest: &Path, params: &BuildParameters) -> Vec<String>;
}

// ============================================================================
// CLI-backed loader
// ============================================================================

/// `PackageLoader` backed by the package manager's own CLI.
///
/// `swift package describe --type json` yields the target graph; compile
/// arguments are synthesized from the description rather than read from a
/// build plan, which is sufficient for indexing invocations.
#[derive(Debug, Clone, Default)]
pub struct SwiftCliLoader;

#[derive(Debug, Deserialize)]
struct DescribedPackage {
  name: String,
  path: PathBuf,
  #[serde(default)]
  targets: Vec<DescribedTarget>,
}

#[derive(Debug, Deserialize)]
struct DescribedTarget {
  name: String,
  /// Target directory, relative to the package root.
  path: PathBuf,
  #[serde(default)]
  sources: Vec<PathBuf>,
  #[serde(default, rename = "type")]
  target_type: Option<String>,
  #[serde(default)]
  target_dependencies: Vec<String>,
}

#[async_trait]
impl PackageLoader for SwiftCliLoader {
  async fn load_package(&self, root: &Path, params: &BuildParameters) -> Result<PackageGraph, LoadError> {
    let mut command = Command::new(params.toolchain.swift());
    command
      .arg("package")
      .arg("--package-path")
      .arg(root)
      .arg("describe")
      .arg("--type")
      .arg("json")
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped());
    if !params.index_only {
      command.arg("--force-resolved-versions");
    }

    debug!(root = %root.display(), "Loading package description");
    let output = command.output().await.map_err(LoadError::Launch)?;
    if !output.status.success() {
      return Err(LoadError::Loader(String::from_utf8_lossy(&output.stderr).into_owned()));
    }

    let described: DescribedPackage = serde_json::from_slice(&output.stdout).map_err(LoadError::Parse)?;
    trace!(package = %described.name, targets = described.targets.len(), "Parsed package description");

    let targets = topological_targets(&described, root)?;
    let description = Arc::new(SynthesizedBuildDescription {
      targets: targets.iter().map(|t| (t.configured(), Arc::clone(t))).collect(),
      params: params.clone(),
    });
    Ok(PackageGraph { targets, description })
  }

  fn affects_build_settings(&self, path: &Path) -> bool {
    let by_name = path
      .file_name()
      .and_then(|name| name.to_str())
      .is_some_and(|name| name == MANIFEST_FILE_NAME || name == "Package.resolved");
    by_name || quarry_core::Language::from_path(path).is_some()
  }

  fn interpreter_flags(&self, _manifest: &Path, params: &BuildParameters) -> Vec<String> {
    // The ManifestAPI library ships next to the toolchain binaries.
    let manifest_api = params
      .toolchain
      .bin_dir()
      .parent()
      .map(|usr| usr.join("lib/swift/pm/ManifestAPI"))
      .unwrap_or_else(|| PathBuf::from("/usr/lib/swift/pm/ManifestAPI"));
    vec![
      "-swift-version".to_string(),
      "6".to_string(),
      "-I".to_string(),
      manifest_api.display().to_string(),
    ]
  }
}

/// Order the described targets dependencies-first (Kahn's algorithm) and
/// absolutize their paths.
fn topological_targets(described: &DescribedPackage, root: &Path) -> Result<Vec<Arc<TargetDescription>>, LoadError> {
  let mut remaining: HashMap<&str, &DescribedTarget> =
    described.targets.iter().map(|t| (t.name.as_str(), t)).collect();
  let mut ordered = Vec::with_capacity(described.targets.len());

  while !remaining.is_empty() {
    // Ready once no unplaced dependency remains. Dependencies on products of
    // other packages never appear in the map and do not block placement.
    let mut ready: Vec<&str> = remaining
      .iter()
      .filter(|(_, target)| {
        target
          .target_dependencies
          .iter()
          .all(|dep| !remaining.contains_key(dep.as_str()))
      })
      .map(|(name, _)| *name)
      .collect();

    if ready.is_empty() {
      let stuck = remaining.keys().next().map(|n| n.to_string()).unwrap_or_default();
      return Err(LoadError::DependencyCycle(stuck));
    }

    ready.sort_unstable();
    for name in ready {
      if let Some(target) = remaining.remove(name) {
        ordered.push(Arc::new(describe_to_target(target, root, &described.path)));
      }
    }
  }

  Ok(ordered)
}

fn describe_to_target(target: &DescribedTarget, root: &Path, package_path: &Path) -> TargetDescription {
  let source_root = root.join(&target.path);
  let is_test = target.target_type.as_deref() == Some("test");
  TargetDescription {
    name: target.name.clone(),
    run_destination: DEFAULT_RUN_DESTINATION.to_string(),
    sources: target.sources.iter().map(|s| source_root.join(s)).collect(),
    source_root,
    is_part_of_root_package: package_path == root,
    may_contain_tests: is_test,
    dependencies: target.target_dependencies.clone(),
  }
}

/// Compile arguments synthesized from the package description.
struct SynthesizedBuildDescription {
  targets: HashMap<ConfiguredTarget, Arc<TargetDescription>>,
  params: BuildParameters,
}

impl BuildDescription for SynthesizedBuildDescription {
  fn compile_arguments(&self, target: &ConfiguredTarget, _file: &Path) -> Result<Vec<String>, LoadError> {
    let description = self
      .targets
      .get(target)
      .ok_or_else(|| LoadError::UnknownTarget(target.clone()))?;

    let mut arguments = vec!["-module-name".to_string(), description.name.clone()];
    match self.params.configuration.effective() {
      BuildConfiguration::Release => arguments.push("-O".to_string()),
      _ => {
        arguments.push("-Onone".to_string());
        arguments.extend(["-g".to_string(), "-DDEBUG".to_string()]);
      }
    }
    arguments.push("-I".to_string());
    arguments.push(
      self
        .params
        .scratch_path
        .join(self.params.configuration.as_argument())
        .join("Modules")
        .display()
        .to_string(),
    );
    arguments.extend(self.params.flags.swift.iter().cloned());
    arguments.extend(description.sources.iter().map(|s| s.display().to_string()));
    Ok(arguments)
  }
}
