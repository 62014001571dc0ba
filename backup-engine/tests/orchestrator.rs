use async_trait::async_trait;
use backup_engine::config::{
    BackupTarget, DatabaseSource, DomainFlags, DomainSources, EngineConfig, LogConfig,
    RegistryConfig, RetentionPolicy,
};
use backup_engine::fs::fingerprint_bytes;
use backup_engine::notify::RunNotifier;
use backup_engine::orchestrator::retention;
use backup_engine::registry::{BackupRun, RunRegistry, RunStatus};
use backup_engine::storage::local::LocalBackend;
use backup_engine::storage::{
    keys, BackendKind, BackendParams, DeleteReport, DownloadOptions, ListOptions, ListPage,
    LocalParams, RetryPolicy, SignedOperation, StorageBackend, StorageError, UploadOptions,
    UploadReceipt,
};
use backup_engine::{BackupOrchestrator, BackupService, Domain, EngineError, ManifestFormat};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Changes made to the source tree the first time an object key is checked,
/// which is after the manifest was built and before the upload.
enum Tamper {
    Rewrite(PathBuf, Vec<u8>),
    Remove(PathBuf),
}

/// Local backend that can be told to fail specific operations.
struct FaultyBackend {
    inner: LocalBackend,
    fail_file: Mutex<Option<String>>,
    fail_manifests: AtomicBool,
    fail_manifest_domain: Mutex<Option<&'static str>>,
    fail_deletes: AtomicBool,
    deny_all: AtomicBool,
    tamper: Mutex<Option<(String, Tamper)>>,
    checks_in_flight: AtomicUsize,
    peak_checks: AtomicUsize,
    uploads: Mutex<Vec<String>>,
}

impl FaultyBackend {
    fn new(root: &Path) -> Self {
        Self {
            inner: LocalBackend::new(root.to_path_buf()),
            fail_file: Mutex::new(None),
            fail_manifests: AtomicBool::new(false),
            fail_manifest_domain: Mutex::new(None),
            fail_deletes: AtomicBool::new(false),
            deny_all: AtomicBool::new(false),
            tamper: Mutex::new(None),
            checks_in_flight: AtomicUsize::new(0),
            peak_checks: AtomicUsize::new(0),
            uploads: Mutex::new(Vec::new()),
        }
    }

    fn fail_file(&self, name: Option<&str>) {
        *self.fail_file.lock().unwrap() = name.map(str::to_string);
    }

    fn tamper_on_check(&self, key: String, tamper: Tamper) {
        *self.tamper.lock().unwrap() = Some((key, tamper));
    }

    fn object_uploads(&self) -> Vec<String> {
        self.uploads
            .lock()
            .unwrap()
            .iter()
            .filter(|k| k.contains("/objects/"))
            .cloned()
            .collect()
    }

    fn reset_uploads(&self) {
        self.uploads.lock().unwrap().clear();
    }
}

#[async_trait]
impl StorageBackend for FaultyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        options: &UploadOptions,
    ) -> Result<UploadReceipt, StorageError> {
        self.uploads.lock().unwrap().push(key.to_string());
        if self.deny_all.load(Ordering::SeqCst) {
            return Err(StorageError::Auth("access key rejected".into()));
        }
        if key.contains("/manifests/") {
            let domain_fails = self
                .fail_manifest_domain
                .lock()
                .unwrap()
                .is_some_and(|domain| key.contains(domain));
            if domain_fails || self.fail_manifests.load(Ordering::SeqCst) {
                return Err(StorageError::Connection("connection reset by peer".into()));
            }
        }
        let name = local_path.file_name().map(|n| n.to_string_lossy().into_owned());
        if name.is_some() && *self.fail_file.lock().unwrap() == name {
            return Err(StorageError::Connection("connection reset by peer".into()));
        }
        self.inner.upload(local_path, key, options).await
    }

    async fn download(
        &self,
        key: &str,
        local_path: &Path,
        options: &DownloadOptions,
    ) -> Result<u64, StorageError> {
        self.inner.download(key, local_path, options).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let fired = {
            let mut tamper = self.tamper.lock().unwrap();
            if tamper.as_ref().is_some_and(|(k, _)| k == key) {
                tamper.take().map(|(_, t)| t)
            } else {
                None
            }
        };
        match fired {
            Some(Tamper::Rewrite(path, data)) => fs::write(path, data).unwrap(),
            Some(Tamper::Remove(path)) => fs::remove_file(path).unwrap(),
            None => {}
        }

        let now = self.checks_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_checks.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let result = self.inner.exists(key).await;
        self.checks_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn list(&self, prefix: &str, options: &ListOptions) -> Result<ListPage, StorageError> {
        self.inner.list(prefix, options).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<DeleteReport, StorageError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Connection("connection reset by peer".into()));
        }
        self.inner.delete_many(keys).await
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<(), StorageError> {
        self.inner.copy(src_key, dst_key).await
    }

    async fn signed_url(
        &self,
        operation: SignedOperation,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        self.inner.signed_url(operation, key, ttl).await
    }

    async fn test_connection(&self) -> Result<bool, StorageError> {
        self.inner.test_connection().await
    }
}

#[derive(Default)]
struct RecordingNotifier {
    runs: Mutex<Vec<BackupRun>>,
}

#[async_trait]
impl RunNotifier for RecordingNotifier {
    async fn on_run_completed(&self, run: &BackupRun) -> anyhow::Result<()> {
        self.runs.lock().unwrap().push(run.clone());
        Ok(())
    }
}

struct Fixture {
    dir: TempDir,
    registry: RunRegistry,
    notifier: Arc<RecordingNotifier>,
    orchestrator: BackupOrchestrator,
    backend: Arc<FaultyBackend>,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        let registry = RunRegistry::open(&dir.path().join("registry.db")).unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let orchestrator = BackupOrchestrator::new(
            registry.clone(),
            notifier.clone(),
            dir.path().join("work"),
        );
        let backend = Arc::new(FaultyBackend::new(&dir.path().join("store")));
        Self {
            dir,
            registry,
            notifier,
            orchestrator,
            backend,
        }
    }

    fn src(&self) -> PathBuf {
        self.dir.path().join("src")
    }

    fn store(&self) -> PathBuf {
        self.dir.path().join("store")
    }

    fn write(&self, name: &str, data: &[u8]) {
        let path = self.src().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, data).unwrap();
    }

    fn target(&self) -> BackupTarget {
        target(&self.src(), &self.store())
    }

    fn object_exists(&self, data: &[u8]) -> bool {
        let key = keys::object_key("site", &fingerprint_bytes(data));
        self.store().join(key).is_file()
    }

    async fn run(&self, target: &BackupTarget) -> Result<BackupRun, EngineError> {
        self.orchestrator.run(target, self.backend.clone()).await
    }
}

fn target(src: &Path, store: &Path) -> BackupTarget {
    BackupTarget {
        id: "site".into(),
        enabled: true,
        schedule: None,
        backend: BackendParams::Local(LocalParams {
            root: store.to_path_buf(),
        }),
        prefix: "site".into(),
        domains: DomainFlags {
            database: false,
            active_assets: true,
            archives: false,
        },
        sources: DomainSources {
            database: None,
            active_assets: Some(src.to_path_buf()),
            archives: None,
        },
        retention: RetentionPolicy::default(),
        concurrency: 2,
        multipart_threshold_bytes: 64 * 1024 * 1024,
        chunk_size_bytes: 16 * 1024 * 1024,
        max_parallel_chunks: 4,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        },
        manifest_format: ManifestFormat::Json,
        notify_failure_threshold: 1,
        exclude: vec![],
    }
}

#[tokio::test]
async fn test_incremental_run_transfers_only_changes() {
    let fx = Fixture::new();
    fx.write("A", b"unchanged");
    fx.write("B", b"before");
    let target = fx.target();

    let first = fx.run(&target).await.unwrap();
    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(first.files_transferred, 2);
    let first_manifest = fx
        .registry
        .latest_successful("site", Domain::ActiveAssets)
        .await
        .unwrap()
        .unwrap();

    fx.write("B", b"after");
    fx.write("C", b"new");
    fx.backend.reset_uploads();

    let second = fx.run(&target).await.unwrap();
    assert_eq!(second.status, RunStatus::Succeeded);
    assert_eq!(second.files_transferred, 2);

    let mut uploaded = fx.backend.object_uploads();
    uploaded.sort();
    let mut expected = vec![
        keys::object_key("site", &fingerprint_bytes(b"after")),
        keys::object_key("site", &fingerprint_bytes(b"new")),
    ];
    expected.sort();
    assert_eq!(uploaded, expected);

    let manifest = fx
        .registry
        .latest_successful("site", Domain::ActiveAssets)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(manifest.parent.as_deref(), Some(first_manifest.id.as_str()));
    let paths: Vec<&str> = manifest.entries.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["A", "B", "C"]);
    assert_eq!(
        manifest.entry("A").unwrap().fingerprint,
        first_manifest.entry("A").unwrap().fingerprint
    );
    assert_eq!(manifest.entry("B").unwrap().fingerprint, fingerprint_bytes(b"after"));
    assert!(fx.notifier.runs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unchanged_tree_uploads_nothing() {
    let fx = Fixture::new();
    fx.write("nested/file.txt", b"content");
    fx.write("empty", b"");
    let target = fx.target();

    fx.run(&target).await.unwrap();
    fx.backend.reset_uploads();
    let second = fx.run(&target).await.unwrap();

    assert_eq!(second.status, RunStatus::Succeeded);
    assert_eq!(second.files_transferred, 0);
    assert!(fx.backend.object_uploads().is_empty());
    // The manifest is still written for every run
    assert_eq!(second.manifests.len(), 1);
}

#[tokio::test]
async fn test_one_failing_file_makes_run_partial() {
    let fx = Fixture::new();
    for name in ["one", "two", "three", "bad.bin"] {
        fx.write(name, name.as_bytes());
    }
    fx.backend.fail_file(Some("bad.bin"));
    let target = fx.target();

    let run = fx.run(&target).await.unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.files_transferred, 3);
    assert_eq!(run.failures.len(), 1);
    assert_eq!(run.failures[0].path, "bad.bin");
    assert_eq!(run.failures[0].attempts, 3);
    assert!(run.failures[0].error.contains("connection reset"));
    assert_eq!(run.manifests.len(), 1);

    // A file that was never stored stays out of the manifest
    let manifest = fx
        .registry
        .latest_successful("site", Domain::ActiveAssets)
        .await
        .unwrap()
        .unwrap();
    assert!(manifest.entry("bad.bin").is_none());
    assert_eq!(manifest.entries.len(), 3);

    let notified = fx.notifier.runs.lock().unwrap().clone();
    assert_eq!(notified.len(), 1);
    assert_eq!(notified[0].id, run.id);

    // The next run picks the file up again
    fx.backend.fail_file(None);
    let retry = fx.run(&target).await.unwrap();
    assert_eq!(retry.status, RunStatus::Succeeded);
    assert_eq!(retry.files_transferred, 1);
    assert!(fx.object_exists(b"bad.bin"));
}

#[tokio::test]
async fn test_failed_modification_keeps_previous_entry() {
    let fx = Fixture::new();
    fx.write("doc.txt", b"v1");
    let target = fx.target();
    fx.run(&target).await.unwrap();

    fx.write("doc.txt", b"v2");
    fx.backend.fail_file(Some("doc.txt"));
    let run = fx.run(&target).await.unwrap();
    assert_eq!(run.status, RunStatus::Partial);

    let manifest = fx
        .registry
        .latest_successful("site", Domain::ActiveAssets)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(manifest.entry("doc.txt").unwrap().fingerprint, fingerprint_bytes(b"v1"));
}

#[tokio::test]
async fn test_manifest_upload_failure_fails_run() {
    let fx = Fixture::new();
    fx.write("a", b"a");
    fx.backend.fail_manifests.store(true, Ordering::SeqCst);
    let target = fx.target();

    let run = fx.run(&target).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.manifests.is_empty());
    assert!(run.error.as_deref().unwrap().contains("manifest"));
    assert!(fx
        .registry
        .latest_successful("site", Domain::ActiveAssets)
        .await
        .unwrap()
        .is_none());
    assert_eq!(fx.notifier.runs.lock().unwrap().len(), 1);

    // The lock was released
    fx.backend.fail_manifests.store(false, Ordering::SeqCst);
    assert_eq!(fx.run(&target).await.unwrap().status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_auth_failure_stops_run() {
    let fx = Fixture::new();
    for i in 0..6 {
        fx.write(&format!("f{i}"), format!("payload {i}").as_bytes());
    }
    fx.backend.deny_all.store(true, Ordering::SeqCst);
    let mut target = fx.target();
    target.domains.archives = true;
    target.sources.archives = Some(fx.src());

    let run = fx.run(&target).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("Authentication"));
    assert!(run.manifests.is_empty());
    // Authentication errors are not retried, and the archives domain never starts
    let uploads = fx.backend.uploads.lock().unwrap().clone();
    assert!(uploads.len() <= 6);
    assert!(uploads.iter().all(|k| !k.contains("archives")));
}

#[tokio::test]
async fn test_second_trigger_is_rejected_while_running() {
    let fx = Fixture::new();
    fx.write("a", b"a");
    let target = fx.target();

    let held = fx.registry.acquire("site").await.unwrap();
    let err = fx.run(&target).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyRunning(_)));

    let history = fx.registry.history("site", 1, 50).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, held.id);
}

#[tokio::test]
async fn test_invalid_target_is_rejected_before_locking() {
    let fx = Fixture::new();
    let mut target = fx.target();
    target.concurrency = 0;

    assert!(matches!(fx.run(&target).await, Err(EngineError::Validation(_))));
    assert!(fx.registry.history("site", 1, 50).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retention_prunes_runs_and_orphaned_objects() {
    let fx = Fixture::new();
    fx.write("shared", b"shared");
    let mut target = fx.target();
    target.retention.max_count = Some(2);

    let mut runs = Vec::new();
    for version in ["one", "two", "three"] {
        fx.write("doc", version.as_bytes());
        runs.push(fx.run(&target).await.unwrap());
    }

    let kept = fx.registry.successful_runs("site").await.unwrap();
    let kept_ids: Vec<&str> = kept.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(kept_ids, vec![runs[2].id.as_str(), runs[1].id.as_str()]);
    assert!(matches!(
        fx.registry.status(&runs[0].id).await,
        Err(EngineError::NotFound(_))
    ));

    assert!(!fx.object_exists(b"one"));
    assert!(fx.object_exists(b"two"));
    assert!(fx.object_exists(b"three"));
    assert!(fx.object_exists(b"shared"));
    assert!(!fx.store().join(&runs[0].manifests[0].storage_key).exists());
    assert!(fx.store().join(&runs[2].manifests[0].storage_key).exists());
}

#[tokio::test]
async fn test_database_domain_is_dumped_and_backed_up() {
    let fx = Fixture::new();
    let db_path = fx.dir.path().join("app.db");
    {
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute_batch("CREATE TABLE notes (body TEXT); INSERT INTO notes VALUES ('hi');")
            .unwrap();
    }
    fx.write("asset", b"asset");
    let mut target = fx.target();
    target.domains.database = true;
    target.sources.database = Some(DatabaseSource {
        dump_dir: fx.dir.path().join("dump"),
        sqlite_path: Some(db_path),
        dump_command: None,
    });

    let run = fx.run(&target).await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.manifests.len(), 2);

    let manifest = fx
        .registry
        .latest_successful("site", Domain::Database)
        .await
        .unwrap()
        .unwrap();
    assert!(manifest.entry("app.db").is_some());
}

fn service_config(dir: &TempDir) -> EngineConfig {
    let src = dir.path().join("src");
    let store = dir.path().join("store");
    let mut target = target(&src, &store);
    target.manifest_format = ManifestFormat::Yaml;
    EngineConfig {
        registry: RegistryConfig {
            db_path: dir.path().join("registry.db"),
            work_dir: dir.path().join("work"),
        },
        log: LogConfig::default(),
        targets: vec![target],
    }
}

#[tokio::test]
async fn test_service_backup_restore_and_delete() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    fs::create_dir_all(src.join("img")).unwrap();
    fs::write(src.join("img/logo.png"), b"png bytes").unwrap();
    fs::write(src.join("readme"), b"hello").unwrap();
    fs::write(src.join("copy-of-readme"), b"hello").unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let service = BackupService::from_config(&service_config(&dir), notifier)
        .await
        .unwrap();

    let run_id = service.trigger_backup("site").await.unwrap();
    service.wait_for_runs().await;
    let run = service.get_status(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    // Identical content is stored once
    assert_eq!(run.files_transferred, 2);

    let history = service.list_history("site", 1, 10).await.unwrap();
    assert_eq!(history.len(), 1);

    let dest = dir.path().join("restore");
    let summary = service.download_backup(&run_id, &dest).await.unwrap();
    assert_eq!(summary.files_restored, 3);
    assert!(summary.failures.is_empty());
    let root = dest.join(Domain::ActiveAssets.as_str());
    assert_eq!(fs::read(root.join("img/logo.png")).unwrap(), b"png bytes");
    assert_eq!(fs::read(root.join("copy-of-readme")).unwrap(), b"hello");

    service.delete_backup(&run_id).await.unwrap();
    assert!(matches!(
        service.get_status(&run_id).await,
        Err(EngineError::NotFound(_))
    ));
    let stats = service.backend_stats("site").await.unwrap();
    assert_eq!(stats.total_count, 0);
}

#[tokio::test]
async fn test_service_rejects_unknown_and_busy_targets() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("src")).unwrap();
    let service = BackupService::from_config(&service_config(&dir), Arc::new(RecordingNotifier::default()))
        .await
        .unwrap();

    assert!(matches!(
        service.trigger_backup("missing").await,
        Err(EngineError::NotFound(_))
    ));

    let held = service.registry().acquire("site").await.unwrap();
    assert!(matches!(
        service.trigger_backup("site").await,
        Err(EngineError::AlreadyRunning(_))
    ));
    assert!(matches!(
        service.delete_backup(&held.id).await,
        Err(EngineError::InUse(_))
    ));
    let mut update = service.targets().await.remove(0);
    update.concurrency = 8;
    assert!(matches!(
        service.update_target(update).await,
        Err(EngineError::InUse(_))
    ));
}

#[tokio::test]
async fn test_service_tests_backend_connection() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("src")).unwrap();
    let service = BackupService::from_config(&service_config(&dir), Arc::new(RecordingNotifier::default()))
        .await
        .unwrap();

    let good = BackendParams::Local(LocalParams {
        root: dir.path().join("reachable"),
    });
    service.test_backend_connection(&good).await.unwrap();

    let bad = BackendParams::Local(LocalParams { root: PathBuf::new() });
    assert!(matches!(
        service.test_backend_connection(&bad).await,
        Err(EngineError::Validation(_))
    ));
}

fn object_key(data: &[u8]) -> String {
    keys::object_key("site", &fingerprint_bytes(data))
}

#[tokio::test]
async fn test_content_changed_before_upload_is_not_stored() {
    let fx = Fixture::new();
    fx.write("a", b"original");
    fx.write("b", b"other");
    fx.backend.tamper_on_check(
        object_key(b"original"),
        Tamper::Rewrite(fx.src().join("a"), b"rewritten".to_vec()),
    );
    let target = fx.target();

    let run = fx.run(&target).await.unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.failures.len(), 1);
    assert_eq!(run.failures[0].path, "a");
    assert!(run.failures[0].error.contains("changed"));
    // Nothing is stored under a key that does not match its content
    assert!(!fx.object_exists(b"original"));
    assert!(!fx.object_exists(b"rewritten"));
    assert!(fx.object_exists(b"other"));

    let manifest = fx
        .registry
        .latest_successful("site", Domain::ActiveAssets)
        .await
        .unwrap()
        .unwrap();
    assert!(manifest.entry("a").is_none());
    assert!(manifest.entry("b").is_some());

    let next = fx.run(&target).await.unwrap();
    assert_eq!(next.status, RunStatus::Succeeded);
    assert!(fx.object_exists(b"rewritten"));
}

#[tokio::test]
async fn test_changed_modification_keeps_previous_entry() {
    let fx = Fixture::new();
    fx.write("doc", b"v1");
    let target = fx.target();
    fx.run(&target).await.unwrap();

    fx.write("doc", b"v2");
    fx.backend.tamper_on_check(
        object_key(b"v2"),
        Tamper::Rewrite(fx.src().join("doc"), b"v3".to_vec()),
    );
    let run = fx.run(&target).await.unwrap();
    assert_eq!(run.status, RunStatus::Partial);

    let manifest = fx
        .registry
        .latest_successful("site", Domain::ActiveAssets)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(manifest.entry("doc").unwrap().fingerprint, fingerprint_bytes(b"v1"));
    assert!(fx.object_exists(b"v1"));
    assert!(!fx.object_exists(b"v2"));
}

#[tokio::test]
async fn test_file_removed_before_upload_is_dropped() {
    let fx = Fixture::new();
    fx.write("a", b"short lived");
    fx.write("b", b"stays");
    fx.backend
        .tamper_on_check(object_key(b"short lived"), Tamper::Remove(fx.src().join("a")));
    let target = fx.target();

    let run = fx.run(&target).await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.failures.is_empty());
    assert_eq!(run.files_transferred, 1);

    let manifest = fx
        .registry
        .latest_successful("site", Domain::ActiveAssets)
        .await
        .unwrap()
        .unwrap();
    let paths: Vec<&str> = manifest.entries.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["b"]);
    assert!(!fx.object_exists(b"short lived"));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_non_utf8_file_name_is_reported() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let fx = Fixture::new();
    fx.write("ok", b"fine");
    fs::write(fx.src().join(OsStr::from_bytes(b"report-\xff.pdf")), b"pdf").unwrap();
    let target = fx.target();

    let run = fx.run(&target).await.unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.failures.len(), 1);
    assert!(run.failures[0].error.contains("UTF-8"));
    assert!(run.failures[0].path.starts_with("report-"));

    let manifest = fx
        .registry
        .latest_successful("site", Domain::ActiveAssets)
        .await
        .unwrap()
        .unwrap();
    let paths: Vec<&str> = manifest.entries.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["ok"]);
    assert!(!fx.object_exists(b"pdf"));
}

#[tokio::test]
async fn test_failed_run_does_not_become_parent() {
    let fx = Fixture::new();
    fx.write("A", b"v1");
    let mut target = fx.target();
    target.domains.archives = true;
    target.sources.archives = Some(fx.src());

    let first = fx.run(&target).await.unwrap();
    assert_eq!(first.status, RunStatus::Succeeded);
    let first_assets = first
        .manifests
        .iter()
        .find(|m| m.domain == Domain::ActiveAssets)
        .unwrap()
        .manifest_id
        .clone();

    // The assets manifest of this run is written, then archives fails
    fx.write("A", b"v2");
    *fx.backend.fail_manifest_domain.lock().unwrap() = Some("archives");
    let failed = fx.run(&target).await.unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.manifests.len(), 1);

    *fx.backend.fail_manifest_domain.lock().unwrap() = None;
    let parent = fx
        .registry
        .latest_successful("site", Domain::ActiveAssets)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parent.id, first_assets);

    let third = fx.run(&target).await.unwrap();
    assert_eq!(third.status, RunStatus::Succeeded);
    let manifest = fx
        .registry
        .latest_successful("site", Domain::ActiveAssets)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(manifest.parent.as_deref(), Some(first_assets.as_str()));
    assert_eq!(manifest.entry("A").unwrap().fingerprint, fingerprint_bytes(b"v2"));
}

#[tokio::test]
async fn test_transfers_stay_within_concurrency() {
    let fx = Fixture::new();
    for i in 0..12 {
        fx.write(&format!("f{i:02}"), format!("content {i}").as_bytes());
    }
    let target = fx.target();

    let run = fx.run(&target).await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.files_transferred, 12);
    let peak = fx.backend.peak_checks.load(Ordering::SeqCst);
    assert!(peak <= target.concurrency, "peak of {peak} concurrent transfers");
}

#[tokio::test]
async fn test_unconfirmed_deletions_are_retried() {
    let fx = Fixture::new();
    let target = fx.target();
    fx.write("doc", b"one");
    let first = fx.run(&target).await.unwrap();
    fx.write("doc", b"two");
    fx.run(&target).await.unwrap();

    fx.backend.fail_deletes.store(true, Ordering::SeqCst);
    fx.registry.delete_run(&first.id).await.unwrap();
    let result = retention::collect_garbage(&fx.registry, fx.backend.as_ref(), "site", "site").await;
    assert!(matches!(result, Err(EngineError::RetentionPrune(_))));
    assert!(fx.object_exists(b"one"));
    assert_eq!(fx.registry.pending_deletions("site").await.unwrap().len(), 2);

    // The next run drains the queue
    fx.backend.fail_deletes.store(false, Ordering::SeqCst);
    assert_eq!(fx.run(&target).await.unwrap().status, RunStatus::Succeeded);
    assert!(!fx.object_exists(b"one"));
    assert!(!fx.store().join(&first.manifests[0].storage_key).exists());
    assert!(fx.registry.pending_deletions("site").await.unwrap().is_empty());
    assert!(fx.object_exists(b"two"));
}

#[tokio::test]
async fn test_queued_object_referenced_again_is_kept() {
    let fx = Fixture::new();
    let target = fx.target();
    fx.write("doc", b"one");
    let first = fx.run(&target).await.unwrap();
    fx.write("doc", b"two");
    fx.run(&target).await.unwrap();

    fx.backend.fail_deletes.store(true, Ordering::SeqCst);
    fx.registry.delete_run(&first.id).await.unwrap();
    assert!(retention::collect_garbage(&fx.registry, fx.backend.as_ref(), "site", "site")
        .await
        .is_err());

    // The content comes back before the deletion went through
    fx.backend.fail_deletes.store(false, Ordering::SeqCst);
    fx.write("doc", b"one");
    let run = fx.run(&target).await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(fx.object_exists(b"one"));
    assert!(fx.registry.pending_deletions("site").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_maintenance_blocks_runs_and_updates() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("src")).unwrap();
    fs::write(dir.path().join("src/a"), b"a").unwrap();
    let service = BackupService::from_config(&service_config(&dir), Arc::new(RecordingNotifier::default()))
        .await
        .unwrap();

    service.registry().begin_maintenance("site", "deleting a backup").await.unwrap();
    assert!(matches!(
        service.trigger_backup("site").await,
        Err(EngineError::InUse(_))
    ));
    let update = service.targets().await.remove(0);
    assert!(matches!(
        service.update_target(update.clone()).await,
        Err(EngineError::InUse(_))
    ));
    assert!(service.list_history("site", 1, 10).await.unwrap().is_empty());

    service.registry().end_maintenance("site").await.unwrap();
    service.update_target(update).await.unwrap();
    let run_id = service.trigger_backup("site").await.unwrap();
    service.wait_for_runs().await;
    assert_eq!(service.get_status(&run_id).await.unwrap().status, RunStatus::Succeeded);
}
