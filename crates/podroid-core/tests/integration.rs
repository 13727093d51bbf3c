use flate2::write::GzEncoder;
use flate2::Compression;
use podroid_core::{CoreError, Engine, Settings};
use podroid_registry::mock::MockRegistry;
use podroid_runtime::{is_alive, terminate, MockRuntime, FAKE_ROOT_ENV};
use podroid_schema::ManifestResolver;
use podroid_store::{ContainerStatus, ImageSource, RunArgs};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn tar_of(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut b = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut h = tar::Header::new_gnu();
        h.set_size(data.len() as u64);
        h.set_mode(0o644);
        h.set_entry_type(tar::EntryType::Regular);
        b.append_data(&mut h, path, *data).unwrap();
    }
    b.into_inner().unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn base_layer() -> Vec<u8> {
    gzip(&tar_of(&[
        ("etc/hello", b"hello"),
        ("etc/gone", b"to be deleted"),
        ("srv/.keep", b""),
    ]))
}

fn upper_layer() -> Vec<u8> {
    tar_of(&[("etc/.wh.gone", b""), ("etc/motd", b"welcome")])
}

fn image_config(cmd: &[&str], env: &[&str], workdir: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {"Cmd": cmd, "Env": env, "WorkingDir": workdir},
    }))
    .unwrap()
}

fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_owned(), "-c".to_owned(), script.to_owned()]
}

fn args(command: Vec<String>, detach: bool) -> RunArgs {
    RunArgs {
        command,
        detach,
        fake_root: true,
        ..RunArgs::default()
    }
}

fn no_progress(_: &str) {}

struct Harness {
    store: tempfile::TempDir,
    runtime: Arc<MockRuntime>,
    engine: Engine,
}

fn harness() -> Harness {
    let store = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.registry.backoff_ms = 1;
    settings.runtime.stop_timeout_secs = 2;
    settings.runtime.startup_grace_ms = 300;
    let runtime = Arc::new(MockRuntime::new());
    let engine = Engine::with_runtime(store.path(), settings, runtime.clone());
    Harness {
        store,
        runtime,
        engine,
    }
}

fn push_app(registry: &MockRegistry, tag: &str) -> podroid_schema::Digest {
    registry.push_image(
        "library/app",
        Some(tag),
        &image_config(&["/bin/sh", "-c", "exit 0"], &["FOO=bar"], "/srv"),
        &[base_layer(), upper_layer()],
    )
}

fn docker_archive(dir: &Path, repo_tag: &str) -> PathBuf {
    let manifest = serde_json::to_vec(&serde_json::json!([{
        "Config": "config.json",
        "RepoTags": [repo_tag],
        "Layers": ["l1/layer.tar", "l2/layer.tar"],
    }]))
    .unwrap();
    let config = image_config(&["/bin/true"], &["LOCAL=1"], "/");
    let l1 = tar_of(&[("app/bin", b"#!/bin/sh"), ("app/old", b"old")]);
    let l2 = tar_of(&[("app/.wh.old", b"")]);
    let archive = tar_of(&[
        ("manifest.json", &manifest),
        ("config.json", &config),
        ("l1/layer.tar", &l1),
        ("l2/layer.tar", &l2),
    ]);
    let path = dir.join("app.tar");
    fs::write(&path, archive).unwrap();
    path
}

#[test]
fn pull_caches_assembled_rootfs_and_config() {
    let registry = MockRegistry::start();
    let digest = push_app(&registry, "v1");
    let h = harness();
    let image = registry.reference("library/app", "v1");

    let entry = h.engine.pull(&image, &no_progress).unwrap();
    assert_eq!(entry.image_url, image);
    assert_eq!(entry.source, ImageSource::Registry);
    assert_eq!(entry.content_hash, digest.hex());
    assert!(entry.cache_path.is_file());
    let config = entry.config.unwrap();
    assert_eq!(config.env(), ["FOO=bar"]);

    let images = h.engine.images().unwrap();
    assert_eq!(images.len(), 1);

    // Pulling again keeps a single entry for the name.
    h.engine.pull(&image, &no_progress).unwrap();
    assert_eq!(h.engine.images().unwrap().len(), 1);
}

#[test]
fn foreground_run_sees_layers_and_records_exit_code() {
    let registry = MockRegistry::start();
    push_app(&registry, "v1");
    let h = harness();
    let image = registry.reference("library/app", "v1");

    let script = "test -f etc/hello && test -f etc/motd && test ! -e etc/gone && test ! -e etc/.wh.gone && exit 3";
    let container = h
        .engine
        .run(&image, Some("check"), args(sh(script), false), &no_progress)
        .unwrap();

    assert_eq!(container.status, ContainerStatus::Exited);
    assert_eq!(container.exit_code, Some(3));
    assert_eq!(container.pid, None);
    assert!(!container.pid_file().exists());
    // run pulled the image on demand
    assert_eq!(h.engine.images().unwrap().len(), 1);
}

#[test]
fn image_config_supplies_launch_defaults() {
    let registry = MockRegistry::start();
    push_app(&registry, "v1");
    let h = harness();
    let image = registry.reference("library/app", "v1");

    let mut run_args = args(Vec::new(), false);
    run_args.env = vec!["EXTRA=1".to_owned()];
    run_args.binds = vec!["/tmp:/mnt/host-tmp".to_owned()];
    let container = h.engine.run(&image, None, run_args, &no_progress).unwrap();
    assert_eq!(container.exit_code, Some(0));

    let launches = h.runtime.launches();
    assert_eq!(launches.len(), 1);
    let launch = &launches[0];
    assert_eq!(launch.command, ["/bin/sh", "-c", "exit 0"]);
    assert_eq!(launch.workdir.as_deref(), Some("/srv"));
    assert!(launch.fake_root);
    assert!(launch.env.contains(&("FOO".to_owned(), "bar".to_owned())));
    assert!(launch.env.contains(&("EXTRA".to_owned(), "1".to_owned())));
    assert!(launch
        .child_env()
        .contains(&(FAKE_ROOT_ENV.to_owned(), "1".to_owned())));
    assert!(launch
        .binds
        .iter()
        .any(|b| b.target == Path::new("/tmp") && b.source.starts_with(container.writable_dir())));
    assert_eq!(
        launch.binds.last().unwrap().target,
        PathBuf::from("/mnt/host-tmp")
    );
    assert!(container.writable_dir().join("var/log").is_dir());
}

#[test]
fn detached_lifecycle() {
    let registry = MockRegistry::start();
    push_app(&registry, "v1");
    let h = harness();
    let image = registry.reference("library/app", "v1");

    let running = h
        .engine
        .run(&image, Some("web"), args(sh("exec sleep 30"), true), &no_progress)
        .unwrap();
    assert_eq!(running.status, ContainerStatus::Running);
    let pid = running.pid.unwrap();
    assert!(is_alive(pid));
    let pid_text = fs::read_to_string(running.pid_file()).unwrap();
    assert_eq!(pid_text.trim(), pid.to_string());

    let listed = h.engine.ps(false).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, running.id);

    let err = h.engine.start("web").unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition { .. }));
    let err = h.engine.rm("web", false).unwrap_err();
    assert!(matches!(err, CoreError::ContainerRunning(_)));

    let stopped = h.engine.stop("web").unwrap();
    assert_eq!(stopped.status, ContainerStatus::Stopped);
    assert!(!is_alive(pid));
    assert!(!stopped.pid_file().exists());
    assert!(h.engine.ps(false).unwrap().is_empty());
    assert_eq!(h.engine.ps(true).unwrap().len(), 1);

    let restarted = h.engine.start("web").unwrap();
    assert_eq!(restarted.status, ContainerStatus::Running);
    let again = h.engine.restart("web").unwrap();
    assert_eq!(again.status, ContainerStatus::Running);
    assert_ne!(again.pid, restarted.pid);

    let removed = h.engine.rm("web", true).unwrap();
    assert_eq!(removed.status, ContainerStatus::Removed);
    assert!(!is_alive(again.pid.unwrap()));
    assert!(!removed.container_dir.exists());
    assert!(h.engine.ps(true).unwrap().is_empty());
}

#[test]
fn detached_early_exit_is_recorded_with_output() {
    let registry = MockRegistry::start();
    push_app(&registry, "v1");
    let h = harness();
    let image = registry.reference("library/app", "v1");

    let container = h
        .engine
        .run(&image, None, args(sh("echo started; exit 7"), true), &no_progress)
        .unwrap();
    assert_eq!(container.status, ContainerStatus::Exited);
    assert_eq!(container.exit_code, Some(7));

    let id = container.id.to_string();
    let logs = h.engine.logs(&id[..8]).unwrap();
    assert!(logs.contains("started"));
}

#[test]
fn vanished_process_is_marked_exited() {
    let registry = MockRegistry::start();
    push_app(&registry, "v1");
    let h = harness();
    let image = registry.reference("library/app", "v1");

    let container = h
        .engine
        .run(&image, None, args(sh("exec sleep 30"), true), &no_progress)
        .unwrap();
    terminate(container.pid.unwrap(), true, Duration::from_secs(2)).unwrap();

    assert!(h.engine.ps(false).unwrap().is_empty());
    let record = h.engine.inspect(container.id.as_str()).unwrap();
    assert_eq!(record.status, ContainerStatus::Exited);
    assert_eq!(record.pid, None);

    let err = h.engine.stop(container.id.as_str()).unwrap_err();
    assert!(err.to_string().contains("exited -> stopped"));
}

#[test]
fn stop_of_created_container_is_rejected() {
    let registry = MockRegistry::start();
    push_app(&registry, "v1");
    let h = harness();
    let image = registry.reference("library/app", "v1");

    let created = h
        .engine
        .create(&image, Some("idle"), args(Vec::new(), false), &no_progress)
        .unwrap();
    assert_eq!(created.status, ContainerStatus::Created);
    assert!(created.rootfs_dir().join("etc/hello").is_file());
    assert!(matches!(
        h.engine.stop("idle"),
        Err(CoreError::InvalidTransition { .. })
    ));

    let err = h
        .engine
        .create(&image, Some("idle"), args(Vec::new(), false), &no_progress)
        .unwrap_err();
    assert!(err.to_string().contains("idle"));

    h.engine.rm("idle", false).unwrap();
}

#[test]
fn local_archive_loads_and_runs() {
    let h = harness();
    let work = tempfile::tempdir().unwrap();
    let archive = docker_archive(work.path(), "myapp:1.0");

    let entry = h.engine.load(&archive).unwrap();
    assert_eq!(entry.image_url, "myapp:1.0");
    assert_eq!(entry.source, ImageSource::Local);
    h.engine.load(&archive).unwrap();
    assert_eq!(h.engine.images().unwrap().len(), 1);

    let container = h
        .engine
        .run(
            "myapp:1.0",
            None,
            args(sh("test -f app/bin && test ! -e app/old"), false),
            &no_progress,
        )
        .unwrap();
    assert_eq!(container.exit_code, Some(0));
    let launch = &h.runtime.launches()[0];
    assert!(launch.env.contains(&("LOCAL".to_owned(), "1".to_owned())));

    assert_eq!(h.engine.rmi("myapp:1.0").unwrap(), 1);
    assert!(h.engine.images().unwrap().is_empty());
    // the container keeps its own rootfs
    assert!(container.rootfs_dir().join("app/bin").is_file());
}

#[test]
fn invalid_archive_is_an_image_error() {
    let h = harness();
    let work = tempfile::tempdir().unwrap();
    let path = work.path().join("broken.tar");
    fs::write(&path, tar_of(&[("config.json", b"{}")])).unwrap();

    let err = h.engine.load(&path).unwrap_err();
    let msg = err.to_string();
    assert!(msg.starts_with("image error:"), "{msg}");
    assert!(msg.contains("manifest.json"));
    assert!(h.engine.images().unwrap().is_empty());
}

#[test]
fn corrupt_layer_leaves_previous_entry() {
    let registry = MockRegistry::start();
    let good = push_app(&registry, "v1");
    let h = harness();
    let image = registry.reference("library/app", "v1");
    h.engine.pull(&image, &no_progress).unwrap();

    let corrupt = vec![0xab; 1024];
    let corrupt_digest = podroid_registry::mock::sha256_digest(&corrupt);
    registry.push_image(
        "library/app",
        Some("v1"),
        &image_config(&[], &[], "/"),
        &[base_layer(), corrupt],
    );

    let err = h.engine.pull(&image, &no_progress).unwrap_err();
    assert!(err.to_string().contains(&corrupt_digest.to_string()), "{err}");

    let images = h.engine.images().unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].content_hash, good.hex());
    let staging = h.store.path().join("staging");
    assert_eq!(fs::read_dir(staging).unwrap().count(), 0);
}

#[test]
fn index_resolves_to_requested_architecture() {
    let registry = MockRegistry::start();
    let amd64 = push_app(&registry, "amd64-only");
    let arm64 = registry.push_image(
        "library/app",
        None,
        &image_config(&["/bin/true"], &[], "/"),
        &[base_layer()],
    );
    registry.push_index("library/app", "multi", &[("amd64", &amd64), ("arm64", &arm64)]);
    registry.push_index("library/app", "x86", &[("amd64", &amd64)]);

    let h = harness();
    let engine = h.engine.with_resolver(ManifestResolver::new("aarch64"));

    let entry = engine
        .pull(&registry.reference("library/app", "multi"), &no_progress)
        .unwrap();
    assert_eq!(entry.content_hash, arm64.hex());

    let err = engine
        .pull(&registry.reference("library/app", "x86"), &no_progress)
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.starts_with("image error:"), "{msg}");
    assert!(msg.contains("arm64"));
    assert!(msg.contains("amd64"));
}

#[test]
fn missing_tag_is_registry_error() {
    let registry = MockRegistry::start();
    let h = harness();
    let err = h
        .engine
        .pull(&registry.reference("library/none", "v1"), &no_progress)
        .unwrap_err();
    assert!(matches!(err, CoreError::Registry(_)), "{err}");
}
