use std::path::Path;

use mockall::Sequence;
use serde_json::json;
use tempfile::tempdir;

use dsa_sync_core::artifacts::FsArtifactCache;
use dsa_sync_core::config::SyncConfig;
use dsa_sync_core::contract::{
    ContainerRef, Credentials, MockArtifactCache, MockRemoteStore, MockSheetTransformer,
    ParentType, RemoteContainer, RemoteError, RemoteItem, Session, TransformError, UploadedFile,
};
use dsa_sync_core::synchronise::{synchronise, SyncError};
use dsa_sync_core::transform::WorkbookTransformer;

fn config(root: &Path) -> SyncConfig {
    SyncConfig {
        root: root.to_path_buf(),
        base_collection_id: "base".to_string(),
        credentials: Credentials {
            username: "admin".to_string(),
            password: "secret".to_string(),
        },
    }
}

fn write(root: &Path, rel: &str, contents: &[u8]) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn collection(id: &str, name: &str) -> RemoteContainer {
    RemoteContainer {
        id: id.to_string(),
        name: name.to_string(),
        model_type: ParentType::Collection,
        parent_id: None,
        parent_collection: None,
    }
}

fn folder(id: &str, name: &str, parent: &str) -> RemoteContainer {
    RemoteContainer {
        id: id.to_string(),
        name: name.to_string(),
        model_type: ParentType::Folder,
        parent_id: Some(parent.to_string()),
        parent_collection: Some("folder".to_string()),
    }
}

fn item(id: &str, name: &str) -> RemoteItem {
    RemoteItem {
        id: id.to_string(),
        name: name.to_string(),
        folder_id: None,
    }
}

fn uploaded(name: &str, size: u64) -> UploadedFile {
    UploadedFile {
        id: format!("file-{name}"),
        name: name.to_string(),
        size,
        item_id: Some(format!("item-{name}")),
    }
}

fn authenticated_remote() -> MockRemoteStore {
    let mut remote = MockRemoteStore::new();
    remote
        .expect_authenticate()
        .withf(|creds| creds.username == "admin" && creds.password == "secret")
        .times(1)
        .returning(|_| Ok(Session::new("girder-token")));
    remote
}

/// Remote where `lab-a` already exists as collection `c1`.
fn remote_with_lab_a() -> MockRemoteStore {
    let mut remote = authenticated_remote();
    remote
        .expect_find_collections()
        .withf(|_, name| name == "lab-a")
        .returning(|_, _| Ok(vec![collection("c1", "lab-a")]));
    remote.expect_create_collection().never();
    remote
}

fn idle_transformer() -> MockSheetTransformer {
    let mut transformer = MockSheetTransformer::new();
    transformer.expect_convert().never();
    transformer
}

#[tokio::test]
async fn first_run_creates_containers_and_uploads_files() {
    let root = tempdir().unwrap();
    write(root.path(), "lab-a/study-1/slide.svs", b"12345");

    let mut remote = authenticated_remote();
    remote
        .expect_find_collections()
        .withf(|session, name| session.token == "girder-token" && name == "lab-a")
        .times(1)
        // A partial search hit must not be reused.
        .returning(|_, _| Ok(vec![collection("c-old", "lab-a-old")]));
    remote
        .expect_create_collection()
        .withf(|_, name| name == "lab-a")
        .times(1)
        .returning(|_, _| Ok(collection("c1", "lab-a")));
    remote
        .expect_find_folders()
        .withf(|_, parent, name| parent == &ContainerRef::Collection("c1".into()) && name == "study-1")
        .times(1)
        .returning(|_, _, _| Ok(vec![]));
    remote
        .expect_create_folder()
        .withf(|_, parent, name| parent == &ContainerRef::Collection("c1".into()) && name == "study-1")
        .times(1)
        .returning(|_, _, _| Ok(folder("f1", "study-1", "c1")));
    remote
        .expect_find_items()
        .withf(|_, parent, name| parent == &ContainerRef::Folder("f1".into()) && name == "slide.svs")
        .times(1)
        .returning(|_, _, _| Ok(vec![]));
    remote
        .expect_upload_file()
        .withf(|_, parent, path, name, size| {
            parent == &ContainerRef::Folder("f1".into())
                && path.ends_with("lab-a/study-1/slide.svs")
                && name == "slide.svs"
                && *size == 5
        })
        .times(1)
        .returning(|_, _, _, name, size| Ok(uploaded(name, size)));

    let report = synchronise(
        &config(root.path()),
        &remote,
        &idle_transformer(),
        &MockArtifactCache::new(),
    )
    .await
    .expect("run should complete");

    assert_eq!(report.collections_created, 1);
    assert_eq!(report.folders_created, 1);
    assert_eq!(report.files_uploaded, 1);
    assert_eq!(report.failed, 0);
}

#[tokio::test]
async fn second_run_on_unchanged_tree_creates_and_uploads_nothing() {
    let root = tempdir().unwrap();
    write(root.path(), "lab-a/study-1/slide.svs", b"12345");

    let mut remote = remote_with_lab_a();
    remote
        .expect_find_folders()
        .withf(|_, parent, name| parent == &ContainerRef::Collection("c1".into()) && name == "study-1")
        .returning(|_, _, _| Ok(vec![folder("f1", "study-1", "c1")]));
    remote.expect_create_folder().never();
    remote
        .expect_find_items()
        .withf(|_, parent, name| parent == &ContainerRef::Folder("f1".into()) && name == "slide.svs")
        .returning(|_, _, _| Ok(vec![item("i1", "slide.svs")]));
    remote.expect_upload_file().never();

    let report = synchronise(
        &config(root.path()),
        &remote,
        &idle_transformer(),
        &MockArtifactCache::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.collections_created + report.folders_created, 0);
    assert_eq!(report.containers_reused, 2);
    assert_eq!(report.files_already_present, 1);
    assert_eq!(report.files_uploaded, 0);
}

#[tokio::test]
async fn changed_spreadsheet_replaces_the_derived_item() {
    let root = tempdir().unwrap();
    write(root.path(), "lab-a/plate.xlsx", b"not read by the mock");

    let mut seq = Sequence::new();
    let mut remote = remote_with_lab_a();
    remote
        .expect_find_items()
        .withf(|_, parent, name| parent == &ContainerRef::Collection("c1".into()) && name == "plate.json")
        .times(1)
        .returning(|_, _, _| Ok(vec![item("old-json", "plate.json")]));
    remote
        .expect_delete_item()
        .withf(|_, id| id == "old-json")
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(()));
    remote
        .expect_upload_file()
        .withf(|_, _, path, name, size| {
            path.ends_with("lab-a/plate.json") && name == "plate.json" && *size == 9
        })
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _, _, name, size| Ok(uploaded(name, size)));

    let mut transformer = MockSheetTransformer::new();
    transformer
        .expect_convert()
        .withf(|path, name| path.ends_with("lab-a/plate.xlsx") && name == "plate.xlsx")
        .times(1)
        .returning(|_, _| Ok(json!([{"a": 3}])));

    let mut cache = MockArtifactCache::new();
    cache
        .expect_write_derived()
        .withf(|path, contents| path.ends_with("lab-a/plate.json") && contents == br#"[{"a":3}]"#)
        .times(1)
        .returning(|_, _| Ok(()));

    let report = synchronise(&config(root.path()), &remote, &transformer, &cache)
        .await
        .unwrap();

    assert_eq!(report.derived_uploaded, 1);
    assert_eq!(report.derived_replaced, 1);
}

#[tokio::test]
async fn every_stale_derived_item_is_deleted_before_upload() {
    let root = tempdir().unwrap();
    write(root.path(), "lab-a/plate.xlsx", b"not read by the mock");

    let mut seq = Sequence::new();
    let mut remote = remote_with_lab_a();
    remote
        .expect_find_items()
        .withf(|_, _, name| name == "plate.json")
        .times(1)
        .returning(|_, _, _| {
            Ok(vec![
                item("old-1", "plate.json"),
                item("bak", "plate.json.bak"),
                item("old-2", "plate.json"),
            ])
        });
    remote
        .expect_delete_item()
        .withf(|_, id| id == "old-1")
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(()));
    remote
        .expect_delete_item()
        .withf(|_, id| id == "old-2")
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(()));
    remote
        .expect_upload_file()
        .withf(|_, _, _, name, _| name == "plate.json")
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _, _, name, size| Ok(uploaded(name, size)));

    let mut transformer = MockSheetTransformer::new();
    transformer.expect_convert().returning(|_, _| Ok(json!([])));
    let mut cache = MockArtifactCache::new();
    cache.expect_write_derived().returning(|_, _| Ok(()));

    let report = synchronise(&config(root.path()), &remote, &transformer, &cache)
        .await
        .unwrap();

    assert_eq!(report.derived_uploaded, 1);
    assert_eq!(report.derived_replaced, 2);
    assert_eq!(report.failed, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn symlinked_directories_are_not_followed() {
    let root = tempdir().unwrap();
    write(root.path(), "lab-a/a.svs", b"a");
    std::os::unix::fs::symlink(root.path(), root.path().join("lab-a/loop")).unwrap();

    let mut remote = remote_with_lab_a();
    remote.expect_find_folders().never();
    remote.expect_create_folder().never();
    remote
        .expect_find_items()
        .withf(|_, _, name| name == "a.svs")
        .returning(|_, _, _| Ok(vec![]));
    remote
        .expect_upload_file()
        .withf(|_, _, _, name, _| name == "a.svs")
        .times(1)
        .returning(|_, _, _, name, size| Ok(uploaded(name, size)));

    let report = synchronise(
        &config(root.path()),
        &remote,
        &idle_transformer(),
        &MockArtifactCache::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.files_uploaded, 1);
    assert_eq!(report.containers_reused, 1);
}

#[tokio::test]
async fn ignored_entries_produce_no_remote_calls() {
    let root = tempdir().unwrap();
    write(root.path(), "lab-a/.DS_Store", b"x");
    write(root.path(), "lab-a/~$plate.xlsx", b"x");
    write(root.path(), "lab-a/plate.json", b"[]");
    write(root.path(), "lab-a/plate_error_log.txt", b"x");

    let mut remote = remote_with_lab_a();
    remote.expect_find_items().never();
    remote.expect_upload_file().never();
    remote.expect_delete_item().never();
    remote.expect_set_folder_metadata().never();

    let report = synchronise(
        &config(root.path()),
        &remote,
        &idle_transformer(),
        &MockArtifactCache::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.ignored, 4);
    assert_eq!(report.failed, 0);
}

#[tokio::test]
async fn failed_spreadsheet_writes_sidecar_and_siblings_still_upload() {
    let root = tempdir().unwrap();
    write(root.path(), "lab-a/a.xlsx", b"a");
    write(root.path(), "lab-a/b.xlsx", b"b");
    write(root.path(), "lab-a/c.svs", b"c");

    let mut remote = remote_with_lab_a();
    remote.expect_find_items().returning(|_, _, _| Ok(vec![]));
    remote
        .expect_upload_file()
        .withf(|_, _, _, name, _| name == "a.json" || name == "c.svs")
        .times(2)
        .returning(|_, _, _, name, size| Ok(uploaded(name, size)));

    let mut transformer = MockSheetTransformer::new();
    transformer.expect_convert().returning(|_, name| {
        if name == "b.xlsx" {
            Err(TransformError::Workbook("zip header missing".into()))
        } else {
            Ok(json!([]))
        }
    });

    let mut cache = MockArtifactCache::new();
    cache
        .expect_write_derived()
        .withf(|path, _| path.ends_with("lab-a/a.json"))
        .times(1)
        .returning(|_, _| Ok(()));
    cache
        .expect_write_error_log()
        .withf(|path, report| {
            path.ends_with("lab-a/b_error_log.txt")
                && report.contains("Failed to process file: b.xlsx")
                && report.contains("zip header missing")
        })
        .times(1)
        .returning(|_, _| Ok(()));

    let report = synchronise(&config(root.path()), &remote, &transformer, &cache)
        .await
        .expect("a failing file must not fail the run");

    assert_eq!(report.derived_uploaded, 1);
    assert_eq!(report.files_uploaded, 1);
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn original_upload_failure_is_skipped_without_sidecar() {
    let root = tempdir().unwrap();
    write(root.path(), "lab-a/x.svs", b"xx");
    write(root.path(), "lab-a/y.svs", b"yy");

    let mut remote = remote_with_lab_a();
    remote.expect_find_items().returning(|_, _, _| Ok(vec![]));
    remote
        .expect_upload_file()
        .withf(|_, _, _, name, _| name == "x.svs")
        .times(1)
        .returning(|_, _, _, _, _| {
            Err(RemoteError::Api {
                status: 500,
                body: "chunk rejected".into(),
            })
        });
    remote
        .expect_upload_file()
        .withf(|_, _, _, name, _| name == "y.svs")
        .times(1)
        .returning(|_, _, _, name, size| Ok(uploaded(name, size)));

    // No expectations: any sidecar write would panic.
    let cache = MockArtifactCache::new();

    let report = synchronise(&config(root.path()), &remote, &idle_transformer(), &cache)
        .await
        .unwrap();

    assert_eq!(report.files_uploaded, 1);
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn stain_spreadsheet_marks_the_parent_folder() {
    let root = tempdir().unwrap();
    write(root.path(), "lab-a/study-1/HE stain.xlsx", b"x");

    let mut remote = remote_with_lab_a();
    remote
        .expect_find_folders()
        .returning(|_, _, _| Ok(vec![folder("f1", "study-1", "c1")]));
    remote.expect_find_items().returning(|_, _, _| Ok(vec![]));
    remote
        .expect_upload_file()
        .withf(|_, _, _, name, _| name == "HE stain.json")
        .times(1)
        .returning(|_, _, _, name, size| Ok(uploaded(name, size)));
    remote
        .expect_set_folder_metadata()
        .withf(|_, target, metadata| {
            target == &ContainerRef::Folder("f1".into())
                && metadata.get("type") == Some(&json!("tissue_microarray_stain"))
        })
        .times(1)
        .returning(|_, _, _| Ok(()));

    let mut transformer = MockSheetTransformer::new();
    transformer.expect_convert().returning(|_, _| Ok(json!([])));
    let mut cache = MockArtifactCache::new();
    cache.expect_write_derived().returning(|_, _| Ok(()));

    let report = synchronise(&config(root.path()), &remote, &transformer, &cache)
        .await
        .unwrap();
    assert_eq!(report.derived_uploaded, 1);
}

#[tokio::test]
async fn nested_levels_use_the_resolved_container_as_parent() {
    let root = tempdir().unwrap();
    write(root.path(), "lab-a/study-1/sample-1/core.svs", b"1");

    let mut remote = remote_with_lab_a();
    remote
        .expect_find_folders()
        .withf(|_, parent, name| parent == &ContainerRef::Collection("c1".into()) && name == "study-1")
        .returning(|_, _, _| Ok(vec![folder("f1", "study-1", "c1")]));
    remote
        .expect_find_folders()
        .withf(|_, parent, name| parent == &ContainerRef::Folder("f1".into()) && name == "sample-1")
        .returning(|_, _, _| Ok(vec![]));
    remote
        .expect_create_folder()
        .withf(|_, parent, name| parent == &ContainerRef::Folder("f1".into()) && name == "sample-1")
        .times(1)
        .returning(|_, _, _| Ok(folder("f2", "sample-1", "f1")));
    remote
        .expect_find_items()
        .withf(|_, parent, _| parent == &ContainerRef::Folder("f2".into()))
        .returning(|_, _, _| Ok(vec![]));
    remote
        .expect_upload_file()
        .withf(|_, parent, _, name, _| parent == &ContainerRef::Folder("f2".into()) && name == "core.svs")
        .times(1)
        .returning(|_, _, _, name, size| Ok(uploaded(name, size)));

    let report = synchronise(
        &config(root.path()),
        &remote,
        &idle_transformer(),
        &MockArtifactCache::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.containers_reused, 2);
    assert_eq!(report.folders_created, 1);
    assert_eq!(report.files_uploaded, 1);
}

#[tokio::test]
async fn root_level_files_go_to_the_base_collection() {
    let root = tempdir().unwrap();
    write(root.path(), "README.pdf", b"pdf");

    let mut remote = authenticated_remote();
    remote
        .expect_find_items()
        .withf(|_, parent, name| parent == &ContainerRef::Collection("base".into()) && name == "README.pdf")
        .returning(|_, _, _| Ok(vec![]));
    remote
        .expect_upload_file()
        .withf(|_, parent, _, _, size| parent == &ContainerRef::Collection("base".into()) && *size == 3)
        .times(1)
        .returning(|_, _, _, name, size| Ok(uploaded(name, size)));

    let report = synchronise(
        &config(root.path()),
        &remote,
        &idle_transformer(),
        &MockArtifactCache::new(),
    )
    .await
    .unwrap();
    assert_eq!(report.files_uploaded, 1);
}

#[tokio::test]
async fn container_failure_skips_only_that_subtree() {
    let root = tempdir().unwrap();
    write(root.path(), "lab-a/a.svs", b"a");
    write(root.path(), "lab-b/b.svs", b"b");

    let mut remote = remote_with_lab_a();
    remote
        .expect_find_collections()
        .withf(|_, name| name == "lab-b")
        .returning(|_, _| {
            Err(RemoteError::Api {
                status: 502,
                body: "bad gateway".into(),
            })
        });
    remote
        .expect_find_items()
        .withf(|_, _, name| name == "a.svs")
        .returning(|_, _, _| Ok(vec![]));
    remote
        .expect_upload_file()
        .withf(|_, _, _, name, _| name == "a.svs")
        .times(1)
        .returning(|_, _, _, name, size| Ok(uploaded(name, size)));

    let report = synchronise(
        &config(root.path()),
        &remote,
        &idle_transformer(),
        &MockArtifactCache::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.files_uploaded, 1);
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn authentication_failure_aborts_the_run() {
    let root = tempdir().unwrap();
    write(root.path(), "lab-a/a.svs", b"a");

    let mut remote = MockRemoteStore::new();
    remote.expect_authenticate().times(1).returning(|_| {
        Err(RemoteError::Api {
            status: 401,
            body: "Login failed.".into(),
        })
    });
    remote.expect_find_collections().never();
    remote.expect_find_items().never();
    remote.expect_upload_file().never();

    let result = synchronise(
        &config(root.path()),
        &remote,
        &idle_transformer(),
        &MockArtifactCache::new(),
    )
    .await;

    match result {
        Err(SyncError::Authentication(e)) => assert!(e.is_unauthorized()),
        other => panic!("expected authentication failure, got {other:?}"),
    }
}

#[tokio::test]
async fn real_workbooks_are_converted_and_broken_ones_leave_a_sidecar() {
    let root = tempdir().unwrap();
    let lab = root.path().join("lab-a");
    std::fs::create_dir_all(&lab).unwrap();

    let mut workbook = rust_xlsxwriter::Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.write_string(0, 0, "a").unwrap();
    sheet.write_string(0, 1, "b").unwrap();
    sheet.write_number(1, 0, 1.0).unwrap();
    sheet.write_number(1, 1, 2.0).unwrap();
    workbook.save(lab.join("plate.xlsx")).unwrap();
    std::fs::write(lab.join("broken.xlsx"), b"not a workbook").unwrap();

    let mut remote = remote_with_lab_a();
    remote.expect_find_items().returning(|_, _, _| Ok(vec![]));
    remote
        .expect_upload_file()
        .withf(|_, _, path, name, _| name == "plate.json" && path.exists())
        .times(1)
        .returning(|_, _, _, name, size| Ok(uploaded(name, size)));

    let report = synchronise(
        &config(root.path()),
        &remote,
        &WorkbookTransformer::new(),
        &FsArtifactCache,
    )
    .await
    .unwrap();

    assert_eq!(report.derived_uploaded, 1);
    assert_eq!(report.failed, 1);

    let derived: serde_json::Value =
        serde_json::from_slice(&std::fs::read(lab.join("plate.json")).unwrap()).unwrap();
    assert_eq!(derived, json!([{"a": 1, "b": 2}]));

    let sidecar = std::fs::read_to_string(lab.join("broken_error_log.txt")).unwrap();
    assert!(sidecar.contains("Failed to process file: broken.xlsx"));
    assert!(!lab.join("broken.json").exists());
}
