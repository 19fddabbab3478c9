mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use cellar::restore::{STEP_CHECK_SPACE, STEP_EXTRACT, STEP_RELOCATE_EXECUTABLE, STEP_RESTORE_STATE};
use cellar::{
    ArchiveFormat, Archiver, BackupRequest, ChannelObserver, Error, NoopObserver, NoopRegistrar,
    PipelineEvent, PreflightError, PrefixStore, RestoreOrchestrator, RestoreRequest, RewriteContext,
};
use cellar_archive::{ArchiveContext, CreateRequest};
use cellar_pipeline::CancellationToken;
use common::{CancelAfter, FakeArchiver, Fixture, FlakyState, Node, PREFIX, RecordingRegistrar, USER, snapshot};

/// Back up the fixture prefix and return the archive path.
fn backed_up(f: &Fixture) -> PathBuf {
    let archive = f.path("game.tar.zst");
    f.backup(f.home_links(), FakeArchiver::new())
        .run(BackupRequest::new(PREFIX, &archive, f.context()), Arc::new(NoopObserver))
        .unwrap()
        .join()
        .unwrap();
    archive
}

/// A target directory that already holds a prefix called `game`.
fn occupied_target(f: &Fixture) -> PathBuf {
    let target = f.path("restored");
    fs::create_dir_all(target.join(PREFIX).join("drive_c")).unwrap();
    fs::write(target.join(PREFIX).join("drive_c/old.txt"), "previous prefix").unwrap();
    target
}

fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn restore(f: &Fixture, target: &Path) -> RestoreOrchestrator {
    f.restore(target, f.home_links(), Arc::new(NoopRegistrar), FakeArchiver::new())
}

#[test]
fn test_round_trip() {
    let f = Fixture::new();
    let before = snapshot(&f.root);
    let archive = backed_up(&f);

    let target = f.path("restored");
    let registrar = Arc::new(RecordingRegistrar::default());
    let orchestrator = f.restore(&target, f.home_links(), registrar.clone(), FakeArchiver::new());
    let summary = orchestrator
        .run(RestoreRequest::new(&archive, &target, f.context()), Arc::new(NoopObserver))
        .unwrap()
        .join()
        .unwrap();

    let root = target.join(PREFIX);
    assert_eq!(summary.prefix_id, PREFIX);
    assert_eq!(summary.root, root);
    assert_eq!(summary.format, ArchiveFormat::Current);

    let mut restored = snapshot(&root);
    let program: Vec<_> = restored
        .keys()
        .filter(|p| p.starts_with(".cellar/program"))
        .cloned()
        .collect();
    for path in &program {
        restored.remove(path);
    }
    let record = Path::new(".cellar/prefix.json");
    let mut expected = before.clone();
    expected.remove(record);
    restored.remove(record);
    assert_eq!(restored, expected);

    assert_eq!(
        fs::read(root.join(".cellar/program/game.exe")).unwrap(),
        fs::read(&f.exe).unwrap()
    );
    assert_eq!(
        fs::read_to_string(root.join(".cellar/program/data/level1.dat")).unwrap(),
        "level one"
    );

    let store = cellar::JsonPrefixStore::new(&target);
    let loaded = store.load(PREFIX).unwrap();
    assert_eq!(loaded.executable, Some(root.join(".cellar/program/game.exe")));
    assert_eq!(loaded.runner, "wine");
    assert_eq!(registrar.registered.lock().unwrap()[0].id, PREFIX);
}

#[test]
fn test_restore_for_another_user() {
    let f = Fixture::new();
    let archive = backed_up(&f);

    let bob_home = f.path("home/bob");
    fs::create_dir_all(bob_home.join("Documents")).unwrap();
    let bob = RewriteContext::new(&bob_home, "bob");

    let target = f.path("restored");
    restore(&f, &target)
        .run(RestoreRequest::new(&archive, &target, bob), Arc::new(NoopObserver))
        .unwrap()
        .join()
        .unwrap();

    let users = target.join(PREFIX).join("drive_c/users");
    assert_eq!(entries(&users), ["Public", "bob"]);
    assert_eq!(
        fs::read_to_string(users.join("bob/AppData/config.ini")).unwrap(),
        format!("data={}/app/data\n", bob_home.display())
    );
    assert_eq!(
        fs::read_to_string(target.join(PREFIX).join("system.reg")).unwrap(),
        format!("\"Desktop\"=\"{}/Desktop\"\nowner=bob\n", bob_home.display())
    );
    assert_eq!(fs::read_link(users.join("bob/Documents")).unwrap(), bob_home.join("Documents"));
}

#[test]
fn test_failure_in_third_step_rolls_back() {
    let f = Fixture::new();
    let archive = backed_up(&f);
    let target = occupied_target(&f);
    let before = snapshot(&target);

    let state = FlakyState::new(&f.config);
    state.fail_internalize.store(true, Ordering::SeqCst);
    let err = f
        .restore(&target, state, Arc::new(NoopRegistrar), FakeArchiver::new())
        .run(RestoreRequest::new(&archive, &target, f.context()), Arc::new(NoopObserver))
        .unwrap()
        .join()
        .unwrap_err();

    assert_eq!(err.step(), Some(STEP_RESTORE_STATE));
    assert_eq!(snapshot(&target), before);
    assert_eq!(entries(&target), [PREFIX]);
}

#[test]
fn test_failure_without_existing_prefix_leaves_nothing() {
    let f = Fixture::new();
    let archive = backed_up(&f);
    let target = f.path("restored");

    let state = FlakyState::new(&f.config);
    state.fail_internalize.store(true, Ordering::SeqCst);
    f.restore(&target, state, Arc::new(NoopRegistrar), FakeArchiver::new())
        .run(RestoreRequest::new(&archive, &target, f.context()), Arc::new(NoopObserver))
        .unwrap()
        .join()
        .unwrap_err();

    assert!(entries(&target).is_empty());
}

#[test]
fn test_success_replaces_existing_prefix() {
    let f = Fixture::new();
    let archive = backed_up(&f);
    let target = occupied_target(&f);

    restore(&f, &target)
        .run(RestoreRequest::new(&archive, &target, f.context()), Arc::new(NoopObserver))
        .unwrap()
        .join()
        .unwrap();

    assert_eq!(entries(&target), [PREFIX]);
    assert!(!target.join(PREFIX).join("drive_c/old.txt").exists());
    assert!(target.join(PREFIX).join("system.reg").is_file());
}

#[test]
fn test_cancel_during_extract_rolls_back() {
    let f = Fixture::new();
    let archive = backed_up(&f);
    let target = occupied_target(&f);
    let before = snapshot(&target);

    let archiver = FakeArchiver::new();
    archiver.hang_extract.store(true, Ordering::SeqCst);
    let (observer, rx) = ChannelObserver::channel();
    let handle = f
        .restore(&target, f.home_links(), Arc::new(NoopRegistrar), archiver)
        .run(RestoreRequest::new(&archive, &target, f.context()), Arc::new(observer))
        .unwrap();

    for event in rx.iter() {
        if event == PipelineEvent::StepStarted(STEP_EXTRACT.to_string()) {
            break;
        }
    }
    handle.cancel();
    let err = handle.join().unwrap_err();

    assert!(matches!(&err, Error::Cancelled { label } if label == STEP_EXTRACT));
    assert_eq!(snapshot(&target), before);
    assert_eq!(entries(&target), [PREFIX]);
}

#[test]
fn test_cancel_at_every_step_boundary_rolls_back() {
    let labels = RestoreOrchestrator::step_labels(ArchiveFormat::Current);
    for label in &labels[..labels.len() - 1] {
        let f = Fixture::new();
        let archive = backed_up(&f);
        let target = occupied_target(&f);
        let before = snapshot(&target);

        let (observer, tx) = CancelAfter::new(label);
        let handle = restore(&f, &target)
            .run(RestoreRequest::new(&archive, &target, f.context()), observer)
            .unwrap();
        tx.send(handle.cancellation_token().clone()).unwrap();
        let err = handle.join().unwrap_err();

        assert!(err.is_cancelled(), "{label}: {err}");
        assert_eq!(snapshot(&target), before, "cancelled after {label}");
        assert_eq!(entries(&target), [PREFIX]);
    }
}

#[test]
fn test_insufficient_space() {
    let f = Fixture::new();
    let archive = backed_up(&f);
    let target = occupied_target(&f);
    let before = snapshot(&target);

    let archiver = FakeArchiver::new();
    *archiver.reported_size.lock().unwrap() = Some(u64::MAX);
    let err = f
        .restore(&target, f.home_links(), Arc::new(NoopRegistrar), archiver)
        .run(RestoreRequest::new(&archive, &target, f.context()), Arc::new(NoopObserver))
        .unwrap()
        .join()
        .unwrap_err();

    let Error::StepFailed { label, source } = err else {
        panic!("expected a step failure");
    };
    assert_eq!(label, STEP_CHECK_SPACE);
    assert!(matches!(
        source.downcast_ref::<PreflightError>(),
        Some(PreflightError::InsufficientSpace { required: u64::MAX, .. })
    ));
    assert_eq!(snapshot(&target), before);
}

/// A prefix archive whose record claims `hash` for its bundled executable.
fn archive_with_hash(f: &Fixture, name: &str, hash: &str) -> PathBuf {
    let src = f.path("src");
    let prefix = src.join(name);
    fs::create_dir_all(prefix.join(".cellar/program")).unwrap();
    fs::write(prefix.join(".cellar/program/game.exe"), "hello").unwrap();
    fs::write(
        prefix.join(".cellar/prefix.json"),
        format!(
            r#"{{"id":"{name}","executable":".cellar/program/game.exe","executable_hash":"{hash}"}}"#
        ),
    )
    .unwrap();

    let archive = f.path(&format!("{name}.tar.zst"));
    let token = CancellationToken::new();
    FakeArchiver::default()
        .create(
            &CreateRequest::new(&archive, ArchiveFormat::Current).source(&src, name),
            &ArchiveContext::new(&token),
        )
        .unwrap();
    archive
}

#[test]
fn test_executable_hash_is_verified() {
    let f = Fixture::new();
    let target = f.path("restored");
    let good = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    let archive = archive_with_hash(&f, "good", good);
    restore(&f, &target)
        .run(RestoreRequest::new(&archive, &target, f.context()), Arc::new(NoopObserver))
        .unwrap()
        .join()
        .unwrap();
    let record = cellar::JsonPrefixStore::new(&target).load("good").unwrap();
    assert_eq!(record.executable, Some(target.join("good/.cellar/program/game.exe")));

    let archive = archive_with_hash(&f, "tampered", &"0".repeat(64));
    let err = restore(&f, &target)
        .run(RestoreRequest::new(&archive, &target, f.context()), Arc::new(NoopObserver))
        .unwrap()
        .join()
        .unwrap_err();
    let Error::StepFailed { label, source } = err else {
        panic!("expected a step failure");
    };
    assert_eq!(label, STEP_RELOCATE_EXECUTABLE);
    assert!(matches!(source.downcast_ref::<Error>(), Some(Error::ExecutableMismatch { .. })));
    assert!(!target.join("tampered").exists());
}

#[test]
fn test_text_launcher_inside_prefix_restores_for_another_user() {
    let f = Fixture::new();
    let launcher = f.root.join("drive_c/game/run.sh");
    fs::create_dir_all(launcher.parent().unwrap()).unwrap();
    fs::write(&launcher, format!("cd {}/saves\n", f.home.display())).unwrap();
    f.store.set_executable_path(PREFIX, &launcher).unwrap();
    let archive = backed_up(&f);

    let bob_home = f.path("home/bob");
    let target = f.path("restored");
    restore(&f, &target)
        .run(
            RestoreRequest::new(&archive, &target, RewriteContext::new(&bob_home, "bob")),
            Arc::new(NoopObserver),
        )
        .unwrap()
        .join()
        .unwrap();

    let restored = target.join(PREFIX).join("drive_c/game/run.sh");
    assert_eq!(fs::read_to_string(&restored).unwrap(), format!("cd {}/saves\n", bob_home.display()));
    let record = cellar::JsonPrefixStore::new(&target).load(PREFIX).unwrap();
    assert_eq!(record.executable, Some(restored.clone()));
    assert_eq!(record.executable_hash, Some(cellar_fs::sha256_file(&restored).unwrap()));
}

#[test]
fn test_legacy_archive_merges_foreign_user() {
    let f = Fixture::new();
    let src = f.path("legacy");
    let users = src.join("old/drive_c/users");
    fs::create_dir_all(users.join("bob/AppData")).unwrap();
    fs::create_dir_all(users.join("Public")).unwrap();
    fs::write(users.join("bob/AppData/settings.ini"), "home=%CELLAR_HOME%\n").unwrap();

    let archive = f.path("old.tar.gz");
    let token = CancellationToken::new();
    FakeArchiver::default()
        .create(
            &CreateRequest::new(&archive, ArchiveFormat::Legacy).source(&src, "old"),
            &ArchiveContext::new(&token),
        )
        .unwrap();

    let target = f.path("restored");
    let registrar = Arc::new(RecordingRegistrar::default());
    let (observer, rx) = ChannelObserver::channel();
    let summary = f
        .restore(&target, f.home_links(), registrar.clone(), FakeArchiver::new())
        .run(RestoreRequest::new(&archive, &target, f.context()), Arc::new(observer))
        .unwrap()
        .join()
        .unwrap();

    assert_eq!(summary.format, ArchiveFormat::Legacy);
    let started: Vec<String> = rx
        .try_iter()
        .filter_map(|e| match e {
            PipelineEvent::StepStarted(label) => Some(label),
            _ => None,
        })
        .collect();
    assert_eq!(started, RestoreOrchestrator::step_labels(ArchiveFormat::Legacy));

    let restored = target.join("old/drive_c/users");
    assert_eq!(entries(&restored), ["Public", USER]);
    assert_eq!(
        fs::read_to_string(restored.join(USER).join("AppData/settings.ini")).unwrap(),
        format!("home={}\n", f.home.display())
    );

    let registered = registrar.registered.lock().unwrap();
    assert_eq!(registered[0].id, "old");
    assert_eq!(registered[0].root, target.join("old"));
}

#[test]
fn test_unrecognised_archive_is_rejected_up_front() {
    let f = Fixture::new();
    let archive = f.path("mystery.bin");
    fs::write(&archive, "definitely not an archive").unwrap();
    let target = f.path("restored");
    let err = restore(&f, &target)
        .run(RestoreRequest::new(&archive, &target, f.context()), Arc::new(NoopObserver))
        .unwrap_err();
    assert!(matches!(err, Error::Archive(cellar_archive::Error::UnsupportedFormat { .. })));
}

#[test]
fn test_restore_is_excluded_while_backup_runs() {
    let f = Fixture::new();
    let archive = backed_up(&f);

    let archiver = FakeArchiver::new();
    archiver.hang_create.store(true, Ordering::SeqCst);
    let (observer, rx) = ChannelObserver::channel();
    let backup = f
        .backup(f.home_links(), archiver)
        .run(BackupRequest::new(PREFIX, f.path("second.tar.zst"), f.context()), Arc::new(observer))
        .unwrap();
    for event in rx.iter() {
        if matches!(event, PipelineEvent::StepStarted(_)) {
            break;
        }
    }

    let err = restore(&f, &f.prefixes)
        .run(RestoreRequest::new(&archive, &f.prefixes, f.context()), Arc::new(NoopObserver))
        .unwrap_err();
    assert!(matches!(err, Error::Busy { .. }));

    backup.cancel();
    assert!(backup.join().unwrap_err().is_cancelled());
    assert!(!f.locks.is_locked(&f.root));
}

#[test]
fn test_restored_tree_has_no_leftover_metadata() {
    let f = Fixture::new();
    let archive = backed_up(&f);
    let target = f.path("restored");
    restore(&f, &target)
        .run(RestoreRequest::new(&archive, &target, f.context()), Arc::new(NoopObserver))
        .unwrap()
        .join()
        .unwrap();

    let tree = snapshot(&target.join(PREFIX));
    assert!(!tree.contains_key(Path::new(".cellar/home-links.json")));
    assert!(!tree.keys().any(|p| p.to_string_lossy().contains("%CELLAR_USER%")));
    assert!(matches!(
        tree.get(Path::new("drive_c/users/alice/Documents")),
        Some(Node::Link(_))
    ));
}
