//! Build-settings resolver for a manifest-rooted workspace.
//!
//! The resolver loads the package, assigns every target a topological index,
//! and maintains three maps: configured target -> (index, target), source
//! file -> target, and source directory -> target. The maps are built off to
//! the side during a reload and swapped in atomically, so a failed reload
//! leaves the previous graph fully intact and readers always observe a
//! consistent snapshot.
//!
//! Per-file build settings come from the loaded build description. Files a
//! target does not list (headers, generated files) get a synthesized
//! invocation: the target's lexicographically least source serves as a
//! substitute and its argument vector is patched to mention the requested
//! file instead.

use std::{
  collections::{HashMap, HashSet},
  path::{Path, PathBuf},
  sync::{Arc, Mutex, RwLock},
  time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use quarry_core::{
  BuildSetup, ConfiguredTarget, FileEvent, FileEventKind, Language, SourceFileInfo, ToolchainRegistry,
};
use tracing::{debug, error, trace, warn};
use url::Url;

use super::{
  MANIFEST_FILE_NAME, WorkspaceBuildSystem,
  delegate::DelegateBus,
  loader::{BuildParameters, LoadError, PackageLoader, TargetDescription},
};
use crate::debounce::Debouncer;

/// Window for coalescing dependency fan-out notifications.
pub(crate) const DEPENDENCY_FANOUT_WINDOW: Duration = Duration::from_millis(500);

/// Phase marker surfaced through the reload status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadStatus {
  Start,
  End,
}

pub type ReloadStatusCallback = Arc<dyn Fn(ReloadStatus) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum BuildSystemError {
  #[error("No package manifest found at {0}")]
  NoManifest(PathBuf),

  #[error("Cannot determine a host toolchain")]
  CannotDetermineHostToolchain,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
  #[error("Failed to resolve symlinks for {path}: {source}")]
  SymlinkResolution {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Load(#[from] LoadError),
}

/// Compiler invocation for a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBuildSettings {
  pub arguments: Vec<String>,
  pub working_directory: PathBuf,
}

impl FileBuildSettings {
  /// Rewrite the invocation of a substitute file so that it compiles
  /// `actual` instead: every argument mentioning the substitute's path has
  /// that occurrence replaced with the actual path.
  fn patching(mut self, actual: &Path, substitute: &Path) -> Self {
    let actual = actual.to_string_lossy().into_owned();
    let substitute = substitute.to_string_lossy().into_owned();
    for argument in &mut self.arguments {
      if argument.contains(&substitute) {
        *argument = argument.replace(&substitute, &actual);
      }
    }
    self
  }
}

/// The three target maps, always replaced as a unit.
#[derive(Default)]
struct TargetMaps {
  /// Configured target -> (topological index, target description)
  targets: HashMap<ConfiguredTarget, (usize, Arc<TargetDescription>)>,
  /// Source file (absolute path) -> owning target
  file_to_target: HashMap<PathBuf, ConfiguredTarget>,
  /// Target source root -> target
  source_dir_to_target: HashMap<PathBuf, ConfiguredTarget>,
  description: Option<Arc<dyn super::loader::BuildDescription>>,
}

/// Fires the `End` reload status when dropped, so the callback pairs with
/// `Start` even when the load itself fails.
struct ReloadEndGuard {
  callback: Option<ReloadStatusCallback>,
}

impl Drop for ReloadEndGuard {
  fn drop(&mut self) {
    if let Some(callback) = &self.callback {
      callback(ReloadStatus::End);
    }
  }
}

/// Build system for a package-manifest workspace.
pub struct PackageBuildSystem {
  /// Symlink-resolved package root
  workspace_path: PathBuf,
  manifest_path: PathBuf,
  loader: Arc<dyn PackageLoader>,
  params: BuildParameters,
  delegates: DelegateBus,
  reload_status: Option<ReloadStatusCallback>,
  maps: RwLock<Arc<TargetMaps>>,
  /// Serializes reloads; the map swap itself goes through `maps`.
  reload_lock: tokio::sync::Mutex<()>,
  watched_files: Mutex<HashSet<PathBuf>>,
  source_files_callbacks: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
  /// Memoized symlink resolutions. Resolution is purely a filesystem
  /// property, so entries survive reloads.
  realpath_cache: DashMap<PathBuf, PathBuf>,
  dependency_debouncer: Debouncer<HashSet<PathBuf>>,
}

impl PackageBuildSystem {
  /// Open the workspace rooted at `workspace_path`.
  ///
  /// Fails with [`BuildSystemError::NoManifest`] when the root has no
  /// package manifest and [`BuildSystemError::CannotDetermineHostToolchain`]
  /// when the registry yields no usable toolchain. The package itself is not
  /// loaded yet; call [`Self::generate_build_graph`].
  pub fn new(
    workspace_path: &Path,
    toolchains: &ToolchainRegistry,
    build_setup: &BuildSetup,
    loader: Arc<dyn PackageLoader>,
    is_for_index_build: bool,
    delegates: DelegateBus,
    reload_status: Option<ReloadStatusCallback>,
  ) -> Result<Self, BuildSystemError> {
    let workspace_path = workspace_path
      .canonicalize()
      .unwrap_or_else(|_| workspace_path.to_path_buf());
    let manifest_path = workspace_path.join(MANIFEST_FILE_NAME);
    if !manifest_path.is_file() {
      return Err(BuildSystemError::NoManifest(workspace_path));
    }

    let toolchain = toolchains
      .host_toolchain()
      .cloned()
      .ok_or(BuildSystemError::CannotDetermineHostToolchain)?;

    let scratch_path = build_setup.scratch_path.clone().unwrap_or_else(|| {
      // Index-only mode stays out of the user's regular build products.
      workspace_path.join(if is_for_index_build { ".index-build" } else { ".build" })
    });
    let params = BuildParameters {
      configuration: build_setup.configuration,
      toolchain,
      scratch_path,
      flags: build_setup.flags.clone(),
      index_only: is_for_index_build,
    };

    let dependency_debouncer = {
      let bus = delegates.clone();
      Debouncer::new(
        DEPENDENCY_FANOUT_WINDOW,
        |mut older: HashSet<PathBuf>, newer: HashSet<PathBuf>| {
          older.extend(newer);
          older
        },
        move |files: HashSet<PathBuf>| {
          let bus = bus.clone();
          async move {
            bus.notify_file_dependencies_updated(&files);
          }
        },
      )
    };

    Ok(Self {
      workspace_path,
      manifest_path,
      loader,
      params,
      delegates,
      reload_status,
      maps: RwLock::new(Arc::new(TargetMaps::default())),
      reload_lock: tokio::sync::Mutex::new(()),
      watched_files: Mutex::new(HashSet::new()),
      source_files_callbacks: Mutex::new(Vec::new()),
      realpath_cache: DashMap::new(),
      dependency_debouncer,
    })
  }

  /// Like [`Self::new`], but treats a missing manifest as "not a package"
  /// instead of an error.
  pub fn maybe_new(
    workspace_path: &Path,
    toolchains: &ToolchainRegistry,
    build_setup: &BuildSetup,
    loader: Arc<dyn PackageLoader>,
    is_for_index_build: bool,
    delegates: DelegateBus,
    reload_status: Option<ReloadStatusCallback>,
  ) -> Result<Option<Self>, BuildSystemError> {
    match Self::new(
      workspace_path,
      toolchains,
      build_setup,
      loader,
      is_for_index_build,
      delegates,
      reload_status,
    ) {
      Ok(system) => Ok(Some(system)),
      Err(BuildSystemError::NoManifest(_)) => Ok(None),
      Err(error) => Err(error),
    }
  }

  /// Load (or re-load) the package and swap the target maps.
  ///
  /// On failure the previous maps remain in place. The reload status
  /// callback always observes a matching `Start`/`End` pair; `End` fires via
  /// a scoped guard even when loading fails.
  pub async fn generate_build_graph(&self) -> Result<(), LoadError> {
    let _serialize = self.reload_lock.lock().await;

    if let Some(callback) = &self.reload_status {
      callback(ReloadStatus::Start);
    }
    let _end = ReloadEndGuard {
      callback: self.reload_status.clone(),
    };

    let graph = self.loader.load_package(&self.workspace_path, &self.params).await?;

    let mut maps = TargetMaps {
      description: Some(Arc::clone(&graph.description)),
      ..Default::default()
    };
    for (index, target) in graph.targets.iter().enumerate() {
      let configured = target.configured();
      if maps
        .targets
        .insert(configured.clone(), (index, Arc::clone(target)))
        .is_some()
      {
        error!(target = %configured, "Duplicate configured target in package graph; keeping the later one");
      }
      for source in &target.sources {
        maps.file_to_target.insert(source.clone(), configured.clone());
      }
      maps.source_dir_to_target.insert(target.source_root.clone(), configured.clone());
    }

    debug!(
      targets = maps.targets.len(),
      files = maps.file_to_target.len(),
      "Swapping in freshly loaded build graph"
    );
    *self.maps.write().unwrap() = Arc::new(maps);

    let watched = self.watched_files.lock().unwrap().clone();
    self.delegates.notify_file_build_settings_changed(&watched);
    self.delegates.notify_file_handling_capability_changed();
    let callbacks: Vec<_> = self.source_files_callbacks.lock().unwrap().clone();
    for callback in callbacks {
      callback();
    }

    Ok(())
  }

  /// Classify file-system events: reload the package when they can affect
  /// the build graph, and fan out dependency updates for same-target files
  /// through the debouncer.
  pub async fn files_did_change(&self, events: &[FileEvent]) {
    if events.iter().any(|event| self.event_triggers_reload(event)) {
      if let Err(error) = self.generate_build_graph().await {
        error!(%error, "Package reload failed; keeping previous build graph");
      }
    }

    let maps = self.snapshot();
    let mut updated: HashSet<PathBuf> = HashSet::new();
    for event in events {
      if event.kind != FileEventKind::Changed && event.kind != FileEventKind::Unknown {
        continue;
      }
      let Some(path) = event.file_path() else { continue };
      match path.extension().and_then(|extension| extension.to_str()) {
        Some("swift") => {
          // A changed source may change what its target exports; report all
          // files of that target as having updated dependencies.
          if let Some(configured) = maps.file_to_target.get(&path)
            && let Some((_, target)) = maps.targets.get(configured)
          {
            updated.extend(target.sources.iter().cloned());
          }
        }
        Some("swiftmodule") if !self.params.index_only => {
          // Policy knob: a rebuilt module artifact fans out to every known
          // file. Deliberately over-broad.
          updated.extend(maps.file_to_target.keys().cloned());
        }
        _ => {}
      }
    }
    if !updated.is_empty() {
      self.dependency_debouncer.schedule(updated);
    }
  }

  fn event_triggers_reload(&self, event: &FileEvent) -> bool {
    let Some(path) = event.file_path() else { return false };
    let manifest_changed = || path.file_name().is_some_and(|name| name == MANIFEST_FILE_NAME);
    match event.kind {
      FileEventKind::Created | FileEventKind::Deleted => self.loader.affects_build_settings(&path),
      FileEventKind::Changed => manifest_changed(),
      FileEventKind::Unknown => self.loader.affects_build_settings(&path) || manifest_changed(),
    }
  }

  /// Whether this build system can answer queries about the document.
  pub fn file_handling_capability(&self, uri: &Url) -> bool {
    !self.configured_targets_for(uri).is_empty()
  }

  pub fn register_for_change_notifications(&self, uri: &Url) {
    if let Ok(path) = uri.to_file_path() {
      self.watched_files.lock().unwrap().insert(path);
    }
  }

  pub fn unregister_for_change_notifications(&self, uri: &Url) {
    if let Ok(path) = uri.to_file_path() {
      self.watched_files.lock().unwrap().remove(&path);
    }
  }

  /// Register a callback invoked after every successful reload, when the
  /// set of source files (and which of them may contain tests) can change.
  pub fn add_source_files_did_change_callback(&self, callback: Arc<dyn Fn() + Send + Sync>) {
    self.source_files_callbacks.lock().unwrap().push(callback);
  }

  pub fn delegates(&self) -> &DelegateBus {
    &self.delegates
  }

  fn snapshot(&self) -> Arc<TargetMaps> {
    Arc::clone(&self.maps.read().unwrap())
  }

  /// Resolve symlinks with memoization; resolution can hit the disk, so
  /// cache aggressively.
  fn resolve_symlinks(&self, path: &Path) -> Result<PathBuf, std::io::Error> {
    if let Some(hit) = self.realpath_cache.get(path) {
      return Ok(hit.clone());
    }
    let resolved = std::fs::canonicalize(path)?;
    self.realpath_cache.insert(path.to_path_buf(), resolved.clone());
    Ok(resolved)
  }

  fn configured_targets_for(&self, uri: &Url) -> Vec<ConfiguredTarget> {
    let Ok(path) = uri.to_file_path() else { return Vec::new() };
    let maps = self.snapshot();

    if let Some(configured) = maps.file_to_target.get(&path) {
      return vec![configured.clone()];
    }
    if let Ok(resolved) = self.resolve_symlinks(&path)
      && resolved != path
      && let Some(configured) = maps.file_to_target.get(&resolved)
    {
      return vec![configured.clone()];
    }

    if path.file_name().is_some_and(|name| name == MANIFEST_FILE_NAME) {
      return vec![ConfiguredTarget::for_package_manifest()];
    }

    // Files not listed in any target (headers, resources) map to the target
    // owning the nearest ancestor source directory.
    let mut ancestor = path.parent();
    while let Some(directory) = ancestor {
      if let Some(configured) = maps.source_dir_to_target.get(directory) {
        return vec![configured.clone()];
      }
      if let Ok(resolved) = self.resolve_symlinks(directory)
        && resolved != directory
        && let Some(configured) = maps.source_dir_to_target.get(resolved.as_path())
      {
        return vec![configured.clone()];
      }
      ancestor = directory.parent();
    }

    Vec::new()
  }

  fn build_settings_for(
    &self,
    uri: &Url,
    target: &ConfiguredTarget,
    language: Language,
  ) -> Result<Option<FileBuildSettings>, SettingsError> {
    let Ok(path) = uri.to_file_path() else { return Ok(None) };

    if target.is_package_manifest() {
      return self.manifest_build_settings(&path);
    }

    let maps = self.snapshot();
    let Some((_, description_target)) = maps.targets.get(target) else {
      debug!(%target, "Build settings requested for unknown target");
      return Ok(None);
    };
    let Some(build_description) = maps.description.as_ref() else {
      return Ok(None);
    };

    if description_target.sources.contains(&path) {
      let arguments = build_description.compile_arguments(target, &path)?;
      return Ok(Some(FileBuildSettings {
        arguments,
        working_directory: self.workspace_path.clone(),
      }));
    }

    // Substitute-file synthesis: the target does not list this file, so use
    // its lexicographically least source as a template and patch the
    // invocation. The substitute stays unresolved while the requested path
    // is symlink-resolved; the patch relies on that asymmetry.
    let Some(substitute) = description_target.sources.iter().min() else {
      debug!(%target, "Target has no sources to act as a substitute");
      return Ok(None);
    };
    trace!(
      file = %path.display(),
      substitute = %substitute.display(),
      ?language,
      "Synthesizing build settings from substitute file"
    );
    let arguments = build_description.compile_arguments(target, substitute)?;
    let resolved = self
      .resolve_symlinks(&path)
      .map_err(|source| SettingsError::SymlinkResolution { path: path.clone(), source })?;
    let settings = FileBuildSettings {
      arguments,
      working_directory: self.workspace_path.clone(),
    };
    Ok(Some(settings.patching(&resolved, substitute)))
  }

  fn manifest_build_settings(&self, path: &Path) -> Result<Option<FileBuildSettings>, SettingsError> {
    let manifest = if path == self.manifest_path {
      Some(path.to_path_buf())
    } else {
      match self.resolve_symlinks(path) {
        Ok(resolved) if resolved == self.manifest_path => Some(resolved),
        _ => None,
      }
    };
    let Some(manifest) = manifest else {
      debug!(path = %path.display(), "Manifest settings requested for a file outside this package");
      return Ok(None);
    };

    let mut arguments = self.loader.interpreter_flags(&manifest, &self.params);
    arguments.push(manifest.to_string_lossy().into_owned());
    Ok(Some(FileBuildSettings {
      arguments,
      working_directory: self.workspace_path.clone(),
    }))
  }

  fn topological_sort_of(&self, targets: &[ConfiguredTarget]) -> Vec<ConfiguredTarget> {
    let maps = self.snapshot();
    let mut sorted = targets.to_vec();
    sorted.sort_by_key(|configured| {
      maps
        .targets
        .get(configured)
        .map(|(index, _)| *index)
        .unwrap_or(usize::MAX)
    });
    sorted
  }

  /// All targets that could depend on any of `targets`, over-approximated as
  /// every target with a topological index greater than the minimum input
  /// index. If any input lacks an index, conservatively returns all targets.
  fn targets_depending_on_any(&self, targets: &[ConfiguredTarget]) -> Vec<ConfiguredTarget> {
    let maps = self.snapshot();

    let mut min_index: Option<usize> = None;
    for configured in targets {
      match maps.targets.get(configured) {
        Some((index, _)) => {
          min_index = Some(min_index.map_or(*index, |current| current.min(*index)));
        }
        None => {
          warn!(target = %configured, "Unknown target in dependency query; returning all targets");
          let mut all: Vec<_> = maps.targets.iter().map(|(ct, (index, _))| (*index, ct.clone())).collect();
          all.sort_by_key(|(index, _)| *index);
          return all.into_iter().map(|(_, ct)| ct).collect();
        }
      }
    }
    let Some(min_index) = min_index else { return Vec::new() };

    let mut dependents: Vec<_> = maps
      .targets
      .iter()
      .filter(|(_, (index, _))| *index > min_index)
      .map(|(configured, (index, _))| (*index, configured.clone()))
      .collect();
    dependents.sort_by_key(|(index, _)| *index);
    dependents.into_iter().map(|(_, configured)| configured).collect()
  }

  fn all_source_files(&self) -> Vec<SourceFileInfo> {
    let maps = self.snapshot();
    let mut files = Vec::new();
    for (_, target) in maps.targets.values() {
      for source in &target.sources {
        match Url::from_file_path(source) {
          Ok(uri) => files.push(SourceFileInfo {
            uri,
            is_part_of_root_project: target.is_part_of_root_package,
            may_contain_tests: target.may_contain_tests,
          }),
          Err(()) => warn!(path = %source.display(), "Source path is not expressible as a file URI"),
        }
      }
    }
    files.sort_by(|a, b| a.uri.as_str().cmp(b.uri.as_str()));
    files
  }
}

#[async_trait]
impl WorkspaceBuildSystem for PackageBuildSystem {
  fn workspace_path(&self) -> &Path {
    &self.workspace_path
  }

  fn build_parameters(&self) -> &BuildParameters {
    &self.params
  }

  fn configured_targets(&self, uri: &Url) -> Vec<ConfiguredTarget> {
    self.configured_targets_for(uri)
  }

  fn build_settings(
    &self,
    uri: &Url,
    target: &ConfiguredTarget,
    language: Language,
  ) -> Result<Option<FileBuildSettings>, SettingsError> {
    self.build_settings_for(uri, target, language)
  }

  fn topological_sort(&self, targets: &[ConfiguredTarget]) -> Vec<ConfiguredTarget> {
    self.topological_sort_of(targets)
  }

  fn targets_depending_on(&self, targets: &[ConfiguredTarget]) -> Vec<ConfiguredTarget> {
    self.targets_depending_on_any(targets)
  }

  fn sources_of_targets(&self, targets: &[ConfiguredTarget]) -> HashSet<PathBuf> {
    let maps = self.snapshot();
    let mut sources = HashSet::new();
    for configured in targets {
      if let Some((_, target)) = maps.targets.get(configured) {
        sources.extend(target.sources.iter().cloned());
      }
    }
    sources
  }

  fn source_files(&self) -> Vec<SourceFileInfo> {
    self.all_source_files()
  }

  async fn reload(&self) -> Result<(), LoadError> {
    self.generate_build_graph().await
  }
}
