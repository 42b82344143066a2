//! File-event classification end-to-end tests: reloads, dependency fan-out,
//! and handling capability.

#[cfg(test)]
mod tests {
  use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, Mutex, Weak},
    time::Duration,
  };

  use quarry_core::{FileEvent, FileEventKind};
  use url::Url;

  use crate::{
    buildsystem::{BuildSystemDelegate, DelegateBus, ReloadStatus, WorkspaceBuildSystem},
    index::__tests__::helpers::{
      FakePackageLoader, FakeTarget, RecordingDelegate, TestWorkspace, lib_fixture, make_build_system,
      make_build_system_with,
    },
  };

  fn changed(path: &PathBuf) -> FileEvent {
    FileEvent::new(Url::from_file_path(path).unwrap(), FileEventKind::Changed)
  }

  #[tokio::test]
  async fn test_manifest_change_triggers_exactly_one_reload() {
    let fixture = lib_fixture().await;
    assert_eq!(fixture.loader.loads(), 1);

    let a_uri = Url::from_file_path(&fixture.a_swift).unwrap();
    fixture.build_system.register_for_change_notifications(&a_uri);

    fixture
      .build_system
      .files_did_change(&[changed(&fixture.workspace.manifest_path())])
      .await;

    assert_eq!(fixture.loader.loads(), 2, "Manifest change must reload exactly once");

    // The reload notified the watched files and the capability change.
    let settings_changed = fixture.delegate.settings_changed.lock().unwrap().clone();
    assert_eq!(settings_changed.last().unwrap(), &HashSet::from([fixture.a_swift.clone()]));
    assert!(fixture.delegate.capability_changed.load(std::sync::atomic::Ordering::SeqCst) >= 1);
  }

  #[tokio::test]
  async fn test_created_source_file_triggers_reload() {
    let fixture = lib_fixture().await;
    let new_file = fixture.workspace.path().join("Sources/Lib/new.swift");

    fixture
      .build_system
      .files_did_change(&[FileEvent::new(Url::from_file_path(&new_file).unwrap(), FileEventKind::Created)])
      .await;

    assert_eq!(fixture.loader.loads(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_changed_source_fans_out_to_target_files_once() {
    let fixture = lib_fixture().await;

    // Two changes 100ms apart land in the same 500ms window.
    fixture.build_system.files_did_change(&[changed(&fixture.a_swift)]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    fixture.build_system.files_did_change(&[changed(&fixture.b_swift)]).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    let updates = fixture.delegate.dependency_updates();
    assert_eq!(updates.len(), 1, "Coalesced fan-out must fire exactly once: {updates:?}");
    assert_eq!(updates[0], HashSet::from([fixture.a_swift.clone(), fixture.b_swift.clone()]));

    // No reload happened for plain source changes.
    assert_eq!(fixture.loader.loads(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_changes_in_separate_windows_fan_out_separately() {
    let fixture = lib_fixture().await;

    fixture.build_system.files_did_change(&[changed(&fixture.a_swift)]).await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    fixture.build_system.files_did_change(&[changed(&fixture.b_swift)]).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(fixture.delegate.dependency_updates().len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_changed_module_artifact_fans_out_to_all_known_files() {
    let workspace = TestWorkspace::new();
    let a_swift = workspace.write_file("Sources/Lib/a.swift", "func a() {}\n");
    let other = workspace.write_file("Sources/Other/o.swift", "func o() {}\n");

    let loader = FakePackageLoader::new(vec![
      FakeTarget::new("Lib", workspace.path().join("Sources/Lib"), vec![a_swift.clone()]),
      FakeTarget::new("Other", workspace.path().join("Sources/Other"), vec![other.clone()]),
    ]);
    let delegate = Arc::new(RecordingDelegate::default());
    let delegates = DelegateBus::new();
    delegates.register(Arc::downgrade(&delegate) as Weak<dyn BuildSystemDelegate>);

    // Not in index-only mode: the artifact fan-out policy applies.
    let build_system = make_build_system_with(&workspace, loader, delegates, None, false);
    build_system.generate_build_graph().await.unwrap();

    let artifact = workspace.path().join(".build/debug/Modules/Lib.swiftmodule");
    build_system
      .files_did_change(&[FileEvent::new(Url::from_file_path(&artifact).unwrap(), FileEventKind::Changed)])
      .await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    let updates = delegate.dependency_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0], HashSet::from([a_swift, other]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_module_artifact_is_ignored_in_index_only_mode() {
    let fixture = lib_fixture().await;

    let artifact = fixture.workspace.path().join(".index-build/debug/Modules/Lib.swiftmodule");
    fixture
      .build_system
      .files_did_change(&[FileEvent::new(Url::from_file_path(&artifact).unwrap(), FileEventKind::Changed)])
      .await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(fixture.delegate.dependency_updates().is_empty());
  }

  #[tokio::test]
  async fn test_handling_capability_mirrors_target_mapping() {
    let fixture = lib_fixture().await;

    for uri in [
      Url::from_file_path(&fixture.a_swift).unwrap(),
      Url::from_file_path(&fixture.header).unwrap(),
      Url::from_file_path(fixture.workspace.manifest_path()).unwrap(),
      Url::from_file_path(fixture.workspace.path().join("Unrelated/x.txt")).unwrap(),
      Url::parse("untitled:Untitled-1").unwrap(),
    ] {
      let handled = fixture.build_system.file_handling_capability(&uri);
      let targets = fixture.build_system.configured_targets(&uri);
      assert_eq!(handled, !targets.is_empty(), "capability must mirror the mapping for {uri}");
    }
  }

  #[tokio::test]
  async fn test_reload_status_fires_end_even_when_load_fails() {
    let workspace = TestWorkspace::new();
    let a_swift = workspace.write_file("Sources/Lib/a.swift", "func a() {}\n");
    let loader = FakePackageLoader::new(vec![FakeTarget::new(
      "Lib",
      workspace.path().join("Sources/Lib"),
      vec![a_swift],
    )]);

    let statuses: Arc<Mutex<Vec<ReloadStatus>>> = Arc::new(Mutex::new(Vec::new()));
    let status_cb = {
      let statuses = Arc::clone(&statuses);
      Arc::new(move |status| statuses.lock().unwrap().push(status)) as Arc<dyn Fn(ReloadStatus) + Send + Sync>
    };
    let build_system = make_build_system(&workspace, Arc::clone(&loader), DelegateBus::new(), Some(status_cb));

    build_system.generate_build_graph().await.unwrap();
    loader.fail_next_load.store(true, std::sync::atomic::Ordering::SeqCst);
    assert!(build_system.generate_build_graph().await.is_err());

    assert_eq!(
      *statuses.lock().unwrap(),
      vec![ReloadStatus::Start, ReloadStatus::End, ReloadStatus::Start, ReloadStatus::End]
    );
  }
}
