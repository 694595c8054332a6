use std::fs;
use std::sync::Arc;
use std::time::Duration;

use dagrun::cache::{
    Blake3TaskHasher, DirectoryRemoteCache, FileOutputsStore, MemoryOutputsStore,
    OutputsCoordinator, ResultCache, TaskHasher,
};
use dagrun::dag::Task;
use dagrun_test_utils::{TaskBuilder, init_tracing};
use tempfile::TempDir;

fn hashed(id: &str, hash: &str) -> Task {
    TaskBuilder::new(id).hash(hash).build()
}

fn cache_in(ws: &TempDir) -> ResultCache {
    ResultCache::new(ws.path().join(".dagrun/cache"), ws.path())
}

#[test]
fn stored_entries_are_returned_with_their_output_and_code() {
    init_tracing();
    let ws = tempfile::tempdir().unwrap();
    let cache = cache_in(&ws);
    let task = hashed("app:build", "h1");

    assert!(cache.get(&task).is_none());
    cache.put(&task, Some("built\n"), &[], 0).unwrap();

    let entry = cache.get(&task).unwrap();
    assert_eq!(entry.terminal_output, "built\n");
    assert_eq!(entry.code, 0);
    assert!(!entry.remote);
    assert!(ws.path().join(".dagrun/cache/h1.commit").exists());
    assert_eq!(
        fs::read_to_string(ws.path().join(".dagrun/cache/terminalOutputs/h1")).unwrap(),
        "built\n"
    );
}

#[test]
fn entries_without_a_commit_marker_are_misses() {
    init_tracing();
    let ws = tempfile::tempdir().unwrap();
    let cache = cache_in(&ws);
    let task = hashed("app:build", "h1");
    cache.put(&task, Some("built"), &[], 0).unwrap();

    fs::remove_file(ws.path().join(".dagrun/cache/h1.commit")).unwrap();

    assert!(cache.get(&task).is_none());
}

#[test]
fn committed_entries_are_never_overwritten() {
    init_tracing();
    let ws = tempfile::tempdir().unwrap();
    let cache = cache_in(&ws);
    let task = hashed("app:build", "h1");

    cache.put(&task, Some("first"), &[], 0).unwrap();
    cache.put(&task, Some("second"), &[], 1).unwrap();

    let entry = cache.get(&task).unwrap();
    assert_eq!(entry.terminal_output, "first");
    assert_eq!(entry.code, 0);
}

#[test]
fn failed_results_are_stored_with_their_code() {
    init_tracing();
    let ws = tempfile::tempdir().unwrap();
    let cache = cache_in(&ws);
    let task = hashed("app:lint", "h2");

    cache.put(&task, Some("lint errors"), &[], 2).unwrap();

    assert_eq!(cache.get(&task).unwrap().code, 2);
}

#[test]
fn unhashed_tasks_cannot_be_stored() {
    init_tracing();
    let ws = tempfile::tempdir().unwrap();
    let cache = cache_in(&ws);
    let task = TaskBuilder::new("app:build").build();

    assert!(cache.put(&task, Some("x"), &[], 0).is_err());
    assert!(cache.get(&task).is_none());
}

#[test]
fn outputs_are_captured_and_restored() {
    init_tracing();
    let ws = tempfile::tempdir().unwrap();
    let cache = cache_in(&ws);
    let outputs = vec!["dist".to_string()];
    let task = TaskBuilder::new("app:build").output("dist").hash("h3").build();

    fs::create_dir_all(ws.path().join("dist/assets")).unwrap();
    fs::write(ws.path().join("dist/main.js"), "main").unwrap();
    fs::write(ws.path().join("dist/assets/logo.svg"), "<svg/>").unwrap();
    cache.put(&task, None, &outputs, 0).unwrap();

    fs::remove_dir_all(ws.path().join("dist")).unwrap();
    fs::create_dir_all(ws.path().join("dist")).unwrap();
    fs::write(ws.path().join("dist/stale.js"), "stale").unwrap();

    let entry = cache.get(&task).unwrap();
    assert_eq!(entry.outputs, outputs);
    cache.copy_files_from_cache("h3", &entry, &outputs).unwrap();

    assert_eq!(fs::read_to_string(ws.path().join("dist/main.js")).unwrap(), "main");
    assert_eq!(
        fs::read_to_string(ws.path().join("dist/assets/logo.svg")).unwrap(),
        "<svg/>"
    );
    assert!(!ws.path().join("dist/stale.js").exists(), "stale files are removed");
}

#[test]
fn temporary_output_path_depends_only_on_the_hash() {
    let ws = tempfile::tempdir().unwrap();
    let cache = cache_in(&ws);

    let a = cache.temporary_output_path(&hashed("app:build", "same"));
    let b = cache.temporary_output_path(&TaskBuilder::new("app:build").hash("same").cache(false).build());
    assert_eq!(a, b);
    assert_eq!(a, ws.path().join(".dagrun/cache/terminalOutputs/same"));
}

#[test]
fn old_records_are_removed() {
    init_tracing();
    let ws = tempfile::tempdir().unwrap();
    let cache = cache_in(&ws).with_max_age(Duration::ZERO);
    cache.put(&hashed("a:build", "old1"), Some("a"), &[], 0).unwrap();
    cache.put(&hashed("b:build", "old2"), Some("b"), &[], 0).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let removed = cache.remove_old_cache_records().unwrap();

    assert_eq!(removed, 2);
    assert!(!ws.path().join(".dagrun/cache/old1").exists());
    assert!(!ws.path().join(".dagrun/cache/old1.commit").exists());
    assert!(!ws.path().join(".dagrun/cache/terminalOutputs/old1").exists());
}

#[test]
fn old_scratch_output_without_an_entry_is_removed() {
    init_tracing();
    let ws = tempfile::tempdir().unwrap();
    let failed = hashed("a:build", "never-cached");
    let fresh_cache = cache_in(&ws);
    let scratch = fresh_cache.temporary_output_path(&failed);
    fs::create_dir_all(scratch.parent().unwrap()).unwrap();
    fs::write(&scratch, "error: build failed\n").unwrap();

    assert_eq!(fresh_cache.remove_old_cache_records().unwrap(), 0);
    assert!(scratch.exists(), "recent scratch output is kept");

    std::thread::sleep(Duration::from_millis(50));
    let cache = cache_in(&ws).with_max_age(Duration::ZERO);
    assert_eq!(cache.remove_old_cache_records().unwrap(), 0, "no committed entry was removed");
    assert!(!scratch.exists());
}

#[test]
fn fresh_records_are_kept() {
    init_tracing();
    let ws = tempfile::tempdir().unwrap();
    let cache = cache_in(&ws);
    cache.put(&hashed("a:build", "fresh"), Some("a"), &[], 0).unwrap();

    assert_eq!(cache.remove_old_cache_records().unwrap(), 0);
    assert!(cache.get(&hashed("a:build", "fresh")).is_some());
}

#[test]
fn remote_entries_are_fetched_and_marked_remote() {
    init_tracing();
    let shared = tempfile::tempdir().unwrap();
    let producer_ws = tempfile::tempdir().unwrap();
    let consumer_ws = tempfile::tempdir().unwrap();
    let remote = Arc::new(DirectoryRemoteCache::new(shared.path()));

    let producer = cache_in(&producer_ws).with_remote(remote.clone());
    producer
        .put(&hashed("app:build", "shared1"), Some("from ci"), &[], 0)
        .unwrap();
    assert!(shared.path().join("shared1.commit").exists(), "put publishes to the remote");

    let consumer = cache_in(&consumer_ws).with_remote(remote);
    let entry = consumer.get(&hashed("app:build", "shared1")).unwrap();
    assert!(entry.remote);
    assert_eq!(entry.terminal_output, "from ci");

    let local = cache_in(&consumer_ws).get(&hashed("app:build", "shared1")).unwrap();
    assert!(!local.remote, "a retrieved entry is local afterwards");
}

#[test]
fn outputs_hashes_match_only_existing_outputs_with_the_same_hash() {
    let ws = tempfile::tempdir().unwrap();
    let outputs = vec!["dist/app.js".to_string()];

    let stores: Vec<Box<dyn OutputsCoordinator>> = vec![
        Box::new(MemoryOutputsStore::new(ws.path())),
        Box::new(FileOutputsStore::new(ws.path())),
    ];
    for store in stores {
        let _ = fs::remove_file(ws.path().join("dist/app.js"));
        assert!(!store.outputs_hashes_match(&outputs, "h").unwrap());

        store.record_outputs_hash(&outputs, "h").unwrap();
        assert!(!store.outputs_hashes_match(&outputs, "h").unwrap(), "file is missing");

        fs::create_dir_all(ws.path().join("dist")).unwrap();
        fs::write(ws.path().join("dist/app.js"), "x").unwrap();
        assert!(store.outputs_hashes_match(&outputs, "h").unwrap());
        assert!(!store.outputs_hashes_match(&outputs, "other").unwrap());
    }
}

#[test]
fn file_outputs_store_persists_between_instances() {
    let ws = tempfile::tempdir().unwrap();
    let outputs = vec!["dist/my app.js".to_string()];
    fs::create_dir_all(ws.path().join("dist")).unwrap();
    fs::write(ws.path().join("dist/my app.js"), "x").unwrap();

    FileOutputsStore::new(ws.path())
        .record_outputs_hash(&outputs, "h9")
        .unwrap();

    assert!(
        FileOutputsStore::new(ws.path())
            .outputs_hashes_match(&outputs, "h9")
            .unwrap()
    );
}

#[test]
fn hashes_are_deterministic_and_track_inputs() {
    init_tracing();
    let ws = tempfile::tempdir().unwrap();
    fs::create_dir_all(ws.path().join("libs/core/src")).unwrap();
    fs::write(ws.path().join("libs/core/src/lib.rs"), "fn a() {}").unwrap();
    fs::write(ws.path().join("libs/core/README.md"), "docs").unwrap();

    let hasher = Blake3TaskHasher::new(ws.path());
    let task = TaskBuilder::new("core:build")
        .project_root("libs/core")
        .input("src/**/*.rs")
        .build();

    let first = hasher.hash_task(&task, &[]).unwrap();
    assert_eq!(first, hasher.hash_task(&task, &[]).unwrap());
    assert_eq!(first.len(), 64);

    fs::write(ws.path().join("libs/core/README.md"), "more docs").unwrap();
    assert_eq!(first, hasher.hash_task(&task, &[]).unwrap(), "non-inputs are ignored");

    fs::write(ws.path().join("libs/core/src/lib.rs"), "fn b() {}").unwrap();
    let changed = hasher.hash_task(&task, &[]).unwrap();
    assert_ne!(first, changed);

    let with_dep = hasher
        .hash_task(&task, &[("util:build".to_string(), "d1".to_string())])
        .unwrap();
    assert_ne!(changed, with_dep, "dependency hashes feed the key");

    let other_command = TaskBuilder::new("core:build")
        .project_root("libs/core")
        .input("src/**/*.rs")
        .command("make")
        .build();
    assert_ne!(changed, hasher.hash_task(&other_command, &[]).unwrap());
}
