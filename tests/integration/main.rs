//! Integration tests for layercache

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn layercache() -> Command {
        cargo_bin_cmd!("layercache")
    }

    /// Config keeping every path inside `dir` and both runtimes off
    fn write_config(dir: &Path, retain_days: u32) -> std::path::PathBuf {
        let path = dir.join("config.toml");
        let root = dir.display();
        std::fs::write(
            &path,
            format!(
                r#"
[node]
host = "10.0.0.1:5000"

[storage]
download_dir = "{root}/download"
torrent_dir = "{root}/torrent"
transfer_dir = "{root}/transfer"
small_file_dir = "{root}/small"
oci_dir = "{root}/oci"

[runtime.docker]
enabled = false

[runtime.containerd]
enabled = false

[journal]
path = "{root}/journal.log"

[retention]
retain_days = {retain_days}
"#
            ),
        )
        .unwrap();
        path
    }

    #[test]
    fn help_displays() {
        layercache()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("distributed image layer cache"));
    }

    #[test]
    fn version_displays() {
        layercache()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("layercache"));
    }

    #[test]
    fn config_path_follows_env() {
        let dir = TempDir::new().unwrap();
        let path = write_config(dir.path(), 7);

        layercache()
            .env("LAYERCACHE_CONFIG", &path)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let dir = TempDir::new().unwrap();
        let path = write_config(dir.path(), 7);

        layercache()
            .arg("--config")
            .arg(&path)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[node]"))
            .stdout(predicate::str::contains("10.0.0.1:5000"));
    }

    #[test]
    fn config_init_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");

        layercache()
            .arg("--config")
            .arg(&path)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration initialized"));
        assert!(path.exists());
    }

    #[test]
    fn invalid_config_fails_with_hint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[journal]\nqueue_capacity = 0\n").unwrap();

        layercache()
            .arg("--config")
            .arg(&path)
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn gc_disabled() {
        let dir = TempDir::new().unwrap();
        let path = write_config(dir.path(), 0);

        layercache()
            .arg("--config")
            .arg(&path)
            .arg("gc")
            .assert()
            .success()
            .stdout(predicate::str::contains("Retention is disabled"));
    }

    #[test]
    fn gc_below_threshold() {
        let dir = TempDir::new().unwrap();
        let path = write_config(dir.path(), 7);

        layercache()
            .arg("--config")
            .arg(&path)
            .args(["gc", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("nothing to collect"));
    }

    #[test]
    fn status_reports_backends() {
        let dir = TempDir::new().unwrap();
        let path = write_config(dir.path(), 7);

        layercache()
            .arg("--config")
            .arg(&path)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Runtime backends"))
            .stdout(predicate::str::contains("unavailable"));
    }

    #[test]
    fn status_json() {
        let dir = TempDir::new().unwrap();
        let path = write_config(dir.path(), 7);

        let output = layercache()
            .arg("--config")
            .arg(&path)
            .args(["status", "--format", "json"])
            .output()
            .unwrap();
        assert!(output.status.success());

        let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(status["host"], "10.0.0.1:5000");
        assert_eq!(status["store"], "memory");
        assert_eq!(status["runtimes"].as_array().unwrap().len(), 2);
    }
}

mod cache_scenarios {
    use layercache::cache::{CacheStore, LayerKind, DEFAULT_LOCATOR_TTL};
    use layercache::error::LayerCacheError;
    use layercache::lock::{DistributedLock, LockSettings};
    use layercache::store::{KeyValueStore, MemoryStore};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn publish_query_withdraw() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = CacheStore::new(store, "10.0.0.1", DEFAULT_LOCATOR_TTL);

        cache
            .put(LayerKind::Dockerd, "abc123", "/var/lib/docker/overlay2/l1/diff")
            .await
            .unwrap();

        let found = cache.query(LayerKind::all(), "abc123").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].host, "10.0.0.1");

        cache.delete_host_entries("10.0.0.1").await.unwrap();
        assert!(cache.query(LayerKind::all(), "abc123").await.unwrap().is_empty());
    }

    fn lock_on(store: &Arc<dyn KeyValueStore>) -> DistributedLock {
        DistributedLock::new(
            store.clone(),
            LockSettings {
                lease: Duration::from_secs(5),
                renew_interval: Duration::from_secs(1),
                acquire_timeout: Duration::from_secs(5),
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
            },
        )
    }

    #[tokio::test]
    async fn contended_acquire_waits_for_release() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let lock = lock_on(&store);

        let first = lock.acquire("digest-x", "caller-a").await.unwrap();
        assert!(!lock
            .try_acquire("digest-x", "caller-b", Duration::from_secs(5))
            .await
            .unwrap());

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire("digest-x", "caller-b").await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            lock.holder("digest-x").await.unwrap().as_deref(),
            Some("caller-a")
        );
        first.release().await.unwrap();

        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.owner_id(), "caller-b");
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn contended_acquire_times_out() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let lock = lock_on(&store);

        let _held = lock.acquire("digest-x", "caller-a").await.unwrap();
        let err = lock
            .acquire_within("digest-x", "caller-b", Duration::from_millis(150))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, LayerCacheError::LockTimeout { .. }));
    }
}
