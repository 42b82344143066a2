//! Test helpers for index end-to-end tests.
//!
//! Provides `TestWorkspace` (a temp-dir package with a stub `swift` binary),
//! `FakePackageLoader` (an in-memory package description), and recording
//! implementations of the delegate and index-store seams.

use std::{
  collections::{HashMap, HashSet},
  path::{Path, PathBuf},
  sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
  time::Duration,
};

use quarry_core::{BuildSetup, ConfiguredTarget, Toolchain, ToolchainRegistry};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::{
  buildsystem::{
    BuildParameters, BuildSystemDelegate, DelegateBus, FileBuildSettings, LoadError, MANIFEST_FILE_NAME,
    PackageBuildSystem, PackageGraph, PackageLoader, ReloadStatusCallback, TargetDescription, WorkspaceBuildSystem,
    loader::BuildDescription,
  },
  index::{IndexHooks, IndexStore, IndexStoreError, IndexTaskDescription, SemanticIndexManager},
  scheduler::TaskScheduler,
};

pub const MANIFEST_CONTENTS: &str =
  "// swift-tools-version: 6.0\nimport PackageDescription\nlet package = Package(name: \"fixture\")\n";

// ============================================================================
// Workspace fixture
// ============================================================================

/// On-disk workspace fixture: a package root with a manifest, plus a stub
/// toolchain whose `swift` binary is a shell script.
pub struct TestWorkspace {
  root: TempDir,
  toolchain_dir: TempDir,
}

impl TestWorkspace {
  pub fn new() -> Self {
    Self::with_build_script("#!/bin/sh\nexit 0\n")
  }

  pub fn with_build_script(script: &str) -> Self {
    let root = TempDir::new().expect("create workspace dir");
    std::fs::write(root.path().join(MANIFEST_FILE_NAME), MANIFEST_CONTENTS).expect("write manifest");
    let toolchain_dir = TempDir::new().expect("create toolchain dir");
    let workspace = Self { root, toolchain_dir };
    workspace.install_build_script(script);
    workspace
  }

  fn install_build_script(&self, script: &str) {
    let bin = self.toolchain_dir.path().join("bin");
    std::fs::create_dir_all(&bin).expect("create toolchain bin dir");
    let swift = bin.join("swift");
    std::fs::write(&swift, script).expect("write stub swift");
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      std::fs::set_permissions(&swift, std::fs::Permissions::from_mode(0o755)).expect("chmod stub swift");
    }
  }

  /// Canonicalized workspace root, matching what the build system stores.
  pub fn path(&self) -> PathBuf {
    self.root.path().canonicalize().expect("canonicalize workspace root")
  }

  pub fn manifest_path(&self) -> PathBuf {
    self.path().join(MANIFEST_FILE_NAME)
  }

  pub fn toolchains(&self) -> ToolchainRegistry {
    ToolchainRegistry::with_toolchain(Toolchain::new(self.toolchain_dir.path().join("bin")))
  }

  /// Write a file under the workspace root, creating parent directories.
  pub fn write_file(&self, relative: &str, contents: &str) -> PathBuf {
    let path = self.path().join(relative);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).expect("create source dirs");
    }
    std::fs::write(&path, contents).expect("write source file");
    path
  }
}

// ============================================================================
// Fake package loader
// ============================================================================

/// One fixture target. Order in the loader's target list is the topological
/// order (dependencies first).
#[derive(Clone)]
pub struct FakeTarget {
  pub name: String,
  pub source_root: PathBuf,
  pub sources: Vec<PathBuf>,
  pub dependencies: Vec<String>,
}

impl FakeTarget {
  pub fn new(name: &str, source_root: PathBuf, sources: Vec<PathBuf>) -> Self {
    Self {
      name: name.to_string(),
      source_root,
      sources,
      dependencies: Vec::new(),
    }
  }

  pub fn depending_on(mut self, dependency: &str) -> Self {
    self.dependencies.push(dependency.to_string());
    self
  }
}

/// In-memory package loader with injectable failures.
pub struct FakePackageLoader {
  targets: Mutex<Vec<FakeTarget>>,
  pub load_count: AtomicUsize,
  pub fail_next_load: AtomicBool,
}

impl FakePackageLoader {
  pub fn new(targets: Vec<FakeTarget>) -> Arc<Self> {
    Arc::new(Self {
      targets: Mutex::new(targets),
      load_count: AtomicUsize::new(0),
      fail_next_load: AtomicBool::new(false),
    })
  }

  pub fn set_targets(&self, targets: Vec<FakeTarget>) {
    *self.targets.lock().unwrap() = targets;
  }

  pub fn loads(&self) -> usize {
    self.load_count.load(Ordering::SeqCst)
  }
}

#[async_trait::async_trait]
impl PackageLoader for FakePackageLoader {
  async fn load_package(&self, _root: &Path, _params: &BuildParameters) -> Result<PackageGraph, LoadError> {
    self.load_count.fetch_add(1, Ordering::SeqCst);
    if self.fail_next_load.swap(false, Ordering::SeqCst) {
      return Err(LoadError::Loader("injected load failure".to_string()));
    }

    let targets: Vec<Arc<TargetDescription>> = self
      .targets
      .lock()
      .unwrap()
      .iter()
      .map(|fixture| {
        Arc::new(TargetDescription {
          name: fixture.name.clone(),
          run_destination: "dummy".to_string(),
          sources: fixture.sources.clone(),
          source_root: fixture.source_root.clone(),
          is_part_of_root_package: true,
          may_contain_tests: false,
          dependencies: fixture.dependencies.clone(),
        })
      })
      .collect();
    let description = Arc::new(FakeBuildDescription {
      targets: targets.iter().map(|target| (target.configured(), Arc::clone(target))).collect(),
    });
    Ok(PackageGraph { targets, description })
  }

  fn affects_build_settings(&self, path: &Path) -> bool {
    path.file_name().is_some_and(|name| name == MANIFEST_FILE_NAME)
      || quarry_core::Language::from_path(path).is_some()
  }

  fn interpreter_flags(&self, _manifest: &Path, _params: &BuildParameters) -> Vec<String> {
    vec![
      "-swift-version".to_string(),
      "6".to_string(),
      "-I".to_string(),
      "/toolchain/lib/ManifestAPI".to_string(),
    ]
  }
}

/// Deterministic per-file compile arguments: module name, primary file, then
/// the target's full source list.
pub struct FakeBuildDescription {
  targets: HashMap<ConfiguredTarget, Arc<TargetDescription>>,
}

impl BuildDescription for FakeBuildDescription {
  fn compile_arguments(&self, target: &ConfiguredTarget, file: &Path) -> Result<Vec<String>, LoadError> {
    let description = self.targets.get(target).ok_or_else(|| LoadError::UnknownTarget(target.clone()))?;
    let mut arguments = vec![
      "-module-name".to_string(),
      description.name.clone(),
      "-primary-file".to_string(),
      file.display().to_string(),
    ];
    arguments.extend(description.sources.iter().map(|source| source.display().to_string()));
    Ok(arguments)
  }
}

// ============================================================================
// Recording collaborators
// ============================================================================

#[derive(Default)]
pub struct RecordingDelegate {
  pub settings_changed: Mutex<Vec<HashSet<PathBuf>>>,
  pub dependencies_updated: Mutex<Vec<HashSet<PathBuf>>>,
  pub capability_changed: AtomicUsize,
}

impl RecordingDelegate {
  pub fn dependency_updates(&self) -> Vec<HashSet<PathBuf>> {
    self.dependencies_updated.lock().unwrap().clone()
  }
}

impl BuildSystemDelegate for RecordingDelegate {
  fn file_build_settings_changed(&self, files: &HashSet<PathBuf>) {
    self.settings_changed.lock().unwrap().push(files.clone());
  }

  fn file_dependencies_updated(&self, files: &HashSet<PathBuf>) {
    self.dependencies_updated.lock().unwrap().push(files.clone());
  }

  fn file_handling_capability_changed(&self) {
    self.capability_changed.fetch_add(1, Ordering::SeqCst);
  }
}

/// Index store that records updates instead of launching an indexer.
#[derive(Default)]
pub struct RecordingIndexStore {
  pub updated: Mutex<Vec<PathBuf>>,
  pub polls: AtomicUsize,
  /// Artificial per-file latency, observing cancellation.
  pub update_delay: Duration,
}

impl RecordingIndexStore {
  pub fn with_delay(update_delay: Duration) -> Self {
    Self {
      update_delay,
      ..Default::default()
    }
  }

  pub fn updated_files(&self) -> Vec<PathBuf> {
    self.updated.lock().unwrap().clone()
  }
}

#[async_trait::async_trait]
impl IndexStore for RecordingIndexStore {
  async fn update_file(
    &self,
    file: &Path,
    _settings: &FileBuildSettings,
    cancel: &CancellationToken,
  ) -> Result<(), IndexStoreError> {
    if !self.update_delay.is_zero() {
      tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        _ = tokio::time::sleep(self.update_delay) => {}
      }
    }
    self.updated.lock().unwrap().push(file.to_path_buf());
    Ok(())
  }

  async fn poll_for_unit_changes(&self) {
    self.polls.fetch_add(1, Ordering::SeqCst);
  }
}

// ============================================================================
// Wiring helpers
// ============================================================================

pub fn make_build_system(
  workspace: &TestWorkspace,
  loader: Arc<FakePackageLoader>,
  delegates: DelegateBus,
  reload_status: Option<ReloadStatusCallback>,
) -> Arc<PackageBuildSystem> {
  make_build_system_with(workspace, loader, delegates, reload_status, true)
}

pub fn make_build_system_with(
  workspace: &TestWorkspace,
  loader: Arc<FakePackageLoader>,
  delegates: DelegateBus,
  reload_status: Option<ReloadStatusCallback>,
  is_for_index_build: bool,
) -> Arc<PackageBuildSystem> {
  Arc::new(
    PackageBuildSystem::new(
      &workspace.path(),
      &workspace.toolchains(),
      &BuildSetup::default(),
      loader,
      is_for_index_build,
      delegates,
      reload_status,
    )
    .expect("create build system"),
  )
}

pub fn make_manager(
  build_system: Arc<dyn WorkspaceBuildSystem>,
  index_store: Arc<RecordingIndexStore>,
  delegates: DelegateBus,
  concurrency: usize,
  hooks: IndexHooks,
) -> Arc<SemanticIndexManager> {
  SemanticIndexManager::new(
    build_system,
    index_store,
    TaskScheduler::<IndexTaskDescription>::new(concurrency),
    delegates,
    hooks,
  )
}

/// The standard fixture: target `Lib` with `a.swift`, `b.swift`, and a
/// header the target does not list.
pub struct LibFixture {
  pub workspace: TestWorkspace,
  pub loader: Arc<FakePackageLoader>,
  pub delegates: DelegateBus,
  pub delegate: Arc<RecordingDelegate>,
  pub build_system: Arc<PackageBuildSystem>,
  pub a_swift: PathBuf,
  pub b_swift: PathBuf,
  pub header: PathBuf,
}

pub async fn lib_fixture() -> LibFixture {
  let workspace = TestWorkspace::new();
  let a_swift = workspace.write_file("Sources/Lib/a.swift", "func a() {}\n");
  let b_swift = workspace.write_file("Sources/Lib/b.swift", "func b() {}\n");
  let header = workspace.write_file("Sources/Lib/include/h.h", "void h(void);\n");

  let loader = FakePackageLoader::new(vec![FakeTarget::new(
    "Lib",
    workspace.path().join("Sources/Lib"),
    vec![a_swift.clone(), b_swift.clone()],
  )]);
  let delegate = Arc::new(RecordingDelegate::default());
  let delegates = DelegateBus::new();
  delegates.register(Arc::downgrade(&delegate) as Weak<dyn BuildSystemDelegate>);

  let build_system = make_build_system(&workspace, Arc::clone(&loader), delegates.clone(), None);
  build_system.generate_build_graph().await.expect("initial package load");

  LibFixture {
    workspace,
    loader,
    delegates,
    delegate,
    build_system,
    a_swift,
    b_swift,
    header,
  }
}
