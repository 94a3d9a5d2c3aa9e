use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use app::prelude::*;
use storage::{
    unix_seconds, FileInfo, LocalStorage, PathConvention, ReadStream, Storage, StorageError,
    StorageResult, Visitor, WalkControl, WalkPolicy, WriteStream,
};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Info,
    Error,
}

/// Keeps every reported line for later inspection.
#[derive(Default)]
struct RecordingReporter {
    lines: Mutex<Vec<(Level, String)>>,
}

impl RecordingReporter {
    fn infos(&self) -> Vec<String> {
        self.collect(Level::Info)
    }

    fn errors(&self) -> Vec<String> {
        self.collect(Level::Error)
    }

    fn collect(&self, level: Level) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }

    fn clear(&self) {
        self.lines.lock().unwrap().clear();
    }
}

impl Reporter for RecordingReporter {
    fn info(&self, message: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((Level::Info, message.to_string()));
    }

    fn error(&self, message: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((Level::Error, message.to_string()));
    }
}

/// Local storage with injectable faults.
#[derive(Default)]
struct FlakyStorage {
    inner: LocalStorage,
    /// Base name of an entry the walk reports as unreadable
    unreadable: Option<&'static str>,
    fail_close: bool,
    fail_times: bool,
    /// Speak forward-slash paths, as an SFTP server does
    posix: bool,
    /// Permission bits reported by `stat` instead of the real ones
    mode: Option<u32>,
}

struct PoisonVisitor<'a> {
    inner: &'a mut dyn Visitor,
    name: &'static str,
}

#[async_trait::async_trait]
impl<'a> Visitor for PoisonVisitor<'a> {
    async fn visit(
        &mut self, path: &str, info: Option<&FileInfo>, err: Option<&StorageError>,
    ) -> WalkControl {
        let poisoned = Path::new(path).file_name().is_some_and(|n| n == self.name);
        if !poisoned {
            return self.inner.visit(path, info, err).await;
        }

        let denied = StorageError::PermissionDenied {
            path: path.to_string(),
        };
        self.inner.visit(path, None, Some(&denied)).await;
        WalkControl::SkipDir
    }
}

#[async_trait::async_trait]
impl Storage for FlakyStorage {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn convention(&self) -> PathConvention {
        if self.posix {
            PathConvention::Posix
        } else {
            self.inner.convention()
        }
    }

    async fn stat(&self, path: &str) -> StorageResult<FileInfo> {
        let mut info = self.inner.stat(path).await?;
        if let (Some(mode), false) = (self.mode, info.is_dir) {
            info.mode = mode;
        }
        Ok(info)
    }

    async fn walk(
        &self, root: &str, policy: WalkPolicy, visitor: &mut dyn Visitor,
    ) -> StorageResult<()> {
        match self.unreadable {
            Some(name) => {
                let mut poison = PoisonVisitor {
                    inner: visitor,
                    name,
                };
                self.inner.walk(root, policy, &mut poison).await
            }
            None => self.inner.walk(root, policy, visitor).await,
        }
    }

    async fn open(&self, path: &str) -> StorageResult<ReadStream> {
        self.inner.open(path).await
    }

    async fn create(&self, path: &str) -> StorageResult<WriteStream> {
        self.inner.create(path).await
    }

    async fn remove(&self, path: &str) -> StorageResult<()> {
        self.inner.remove(path).await
    }

    async fn create_dir_all(&self, path: &str) -> StorageResult<()> {
        self.inner.create_dir_all(path).await
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> StorageResult<()> {
        self.inner.set_permissions(path, mode).await
    }

    async fn set_times(
        &self, path: &str, accessed: SystemTime, modified: SystemTime,
    ) -> StorageResult<()> {
        if self.fail_times {
            return Err(StorageError::Sftp {
                path: path.to_string(),
                message: "setstat refused".to_string(),
            });
        }
        self.inner.set_times(path, accessed, modified).await
    }

    async fn close(&self) -> StorageResult<()> {
        if self.fail_close {
            return Err(StorageError::Session("channel reset".to_string()));
        }
        self.inner.close().await
    }
}

struct Fixture {
    _dir: TempDir,
    src: PathBuf,
    dst: PathBuf,
    reporter: Arc<RecordingReporter>,
}

impl Fixture {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        Self {
            _dir: dir,
            src,
            dst,
            reporter: Arc::new(RecordingReporter::default()),
        }
    }

    fn params(&self) -> SyncParams {
        SyncParams {
            source: self.src.to_string_lossy().into_owned(),
            target: self.dst.to_string_lossy().into_owned(),
            ..SyncParams::default()
        }
    }

    fn syncer(&self, params: SyncParams) -> Syncer {
        Syncer::with_reporter(params, self.reporter.clone())
    }

    async fn run(&self, params: SyncParams) -> Result<SyncStats, SyncError> {
        self.syncer(params).sync().await
    }

    async fn run_between(
        &self, params: SyncParams, src: FlakyStorage, dst: FlakyStorage,
    ) -> Result<SyncStats, SyncError> {
        self.syncer(params)
            .sync_between(
                Box::new(src),
                &self.src.to_string_lossy(),
                Box::new(dst),
                &self.dst.to_string_lossy(),
            )
            .await
    }
}

fn write_with_mtime(path: &Path, content: &[u8], secs: u64) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

fn mtime_secs(path: &Path) -> i64 {
    unix_seconds(fs::metadata(path).unwrap().modified().unwrap())
}

#[tokio::test]
async fn copies_new_file_with_metadata() {
    let fx = Fixture::new();
    write_with_mtime(&fx.src.join("a.txt"), b"hello", 1_600_000_000);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(fx.src.join("a.txt"), fs::Permissions::from_mode(0o640)).unwrap();
    }

    let stats = fx.run(fx.params()).await.unwrap();

    assert_eq!(fx.reporter.infos(), vec!["copying a.txt".to_string()]);
    assert!(fx.reporter.errors().is_empty());
    assert_eq!(stats.copied, 1);
    assert_eq!(stats.bytes, 5);

    let copied = fx.dst.join("a.txt");
    assert_eq!(fs::read(&copied).unwrap(), b"hello");
    assert_eq!(mtime_secs(&copied), 1_600_000_000);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&copied).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }
}

#[tokio::test]
async fn identical_file_is_left_alone() {
    let fx = Fixture::new();
    write_with_mtime(&fx.src.join("a.txt"), b"same", 1_600_000_000);
    write_with_mtime(&fx.dst.join("a.txt"), b"same", 1_600_000_000);

    let stats = fx.run(fx.params()).await.unwrap();

    assert!(fx.reporter.infos().is_empty());
    assert!(fx.reporter.errors().is_empty());
    assert_eq!(stats.unchanged, 1);
    assert_eq!(stats.copied + stats.updated, 0);
}

#[tokio::test]
async fn second_run_has_nothing_to_do() {
    let fx = Fixture::new();
    write_with_mtime(&fx.src.join("a.txt"), b"one", 1_600_000_000);
    write_with_mtime(&fx.src.join("sub/b.txt"), b"two", 1_600_000_100);

    let first = fx.run(fx.params()).await.unwrap();
    assert_eq!(first.copied, 2);

    fx.reporter.clear();
    let second = fx.run(fx.params()).await.unwrap();

    assert!(fx.reporter.infos().is_empty());
    assert_eq!(second.unchanged, 2);
    assert_eq!(second.copied + second.updated, 0);
}

#[tokio::test]
async fn changed_file_is_updated() {
    let fx = Fixture::new();
    write_with_mtime(&fx.src.join("a.txt"), b"new content", 1_600_000_500);
    write_with_mtime(&fx.dst.join("a.txt"), b"old", 1_600_000_000);

    let stats = fx.run(fx.params()).await.unwrap();

    assert_eq!(fx.reporter.infos(), vec!["updating a.txt".to_string()]);
    assert_eq!(stats.updated, 1);
    assert_eq!(fs::read(fx.dst.join("a.txt")).unwrap(), b"new content");
    assert_eq!(mtime_secs(&fx.dst.join("a.txt")), 1_600_000_500);
}

#[tokio::test]
async fn orphans_are_deleted_only_when_asked() {
    let fx = Fixture::new();
    write_with_mtime(&fx.src.join("keep.txt"), b"keep", 1_600_000_000);
    write_with_mtime(&fx.dst.join("keep.txt"), b"keep", 1_600_000_000);
    write_with_mtime(&fx.dst.join("orphan.txt"), b"bye", 1_600_000_000);

    fx.run(fx.params()).await.unwrap();
    assert!(fx.dst.join("orphan.txt").exists());
    assert!(fx.reporter.infos().is_empty());

    let params = SyncParams {
        delete_missing: true,
        ..fx.params()
    };
    let stats = fx.run(params).await.unwrap();

    assert_eq!(fx.reporter.infos(), vec!["deleting orphan.txt".to_string()]);
    assert_eq!(stats.deleted, 1);
    assert!(!fx.dst.join("orphan.txt").exists());
    assert!(fx.dst.join("keep.txt").exists());
}

#[tokio::test]
async fn pruning_keeps_directories() {
    let fx = Fixture::new();
    write_with_mtime(&fx.dst.join("old/stale.txt"), b"stale", 1_600_000_000);

    let params = SyncParams {
        delete_missing: true,
        ..fx.params()
    };
    fx.run(params).await.unwrap();

    assert!(!fx.dst.join("old/stale.txt").exists());
    assert!(fx.dst.join("old").is_dir());
}

#[tokio::test]
async fn source_must_be_a_directory() {
    let fx = Fixture::new();
    let file = fx.src.join("plain.txt");
    write_with_mtime(&file, b"x", 1_600_000_000);

    let params = SyncParams {
        source: file.to_string_lossy().into_owned(),
        ..fx.params()
    };
    let err = fx.run(params).await.unwrap_err();

    assert!(matches!(err, SyncError::SourceNotDirectory(_)));
    assert!(!fx.dst.exists());
}

#[tokio::test]
async fn missing_source_is_fatal() {
    let fx = Fixture::new();
    let params = SyncParams {
        source: fx.src.join("nope").to_string_lossy().into_owned(),
        ..fx.params()
    };

    match fx.run(params).await {
        Err(SyncError::Source(e)) => assert!(e.is_not_found()),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn unreadable_entry_does_not_stop_the_run() {
    let fx = Fixture::new();
    write_with_mtime(&fx.src.join("a.txt"), b"a", 1_600_000_000);
    write_with_mtime(&fx.src.join("secret.txt"), b"s", 1_600_000_000);
    write_with_mtime(&fx.src.join("z.txt"), b"z", 1_600_000_000);

    let src = FlakyStorage {
        unreadable: Some("secret.txt"),
        ..FlakyStorage::default()
    };
    let stats = fx
        .run_between(fx.params(), src, FlakyStorage::default())
        .await
        .unwrap();

    let errors = fx.reporter.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("failed to access"));
    assert!(errors[0].contains("secret.txt"));
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.copied, 2);
    assert!(fx.dst.join("a.txt").exists());
    assert!(fx.dst.join("z.txt").exists());
    assert!(!fx.dst.join("secret.txt").exists());
}

#[tokio::test]
async fn checksum_mode_sees_content_changes() {
    let fx = Fixture::new();
    write_with_mtime(&fx.src.join("a.txt"), b"AAAA", 1_600_000_000);
    write_with_mtime(&fx.dst.join("a.txt"), b"BBBB", 1_600_000_000);

    fx.run(fx.params()).await.unwrap();
    assert!(fx.reporter.infos().is_empty());
    assert_eq!(fs::read(fx.dst.join("a.txt")).unwrap(), b"BBBB");

    let params = SyncParams {
        checksum: true,
        ..fx.params()
    };
    fx.run(params).await.unwrap();

    assert_eq!(fx.reporter.infos(), vec!["updating a.txt".to_string()]);
    assert_eq!(fs::read(fx.dst.join("a.txt")).unwrap(), b"AAAA");
}

#[tokio::test]
async fn nested_directories_are_created() {
    let fx = Fixture::new();
    write_with_mtime(&fx.src.join("x/y/deep.txt"), b"deep", 1_600_000_000);

    let params = SyncParams {
        target: fx.dst.join("more/levels").to_string_lossy().into_owned(),
        ..fx.params()
    };
    fx.run(params).await.unwrap();

    let copied = fx.dst.join("more/levels/x/y/deep.txt");
    assert_eq!(fs::read(copied).unwrap(), b"deep");
    let rel = Path::new("x").join("y").join("deep.txt");
    assert_eq!(
        fx.reporter.infos(),
        vec![format!("copying {}", rel.display())]
    );
}

#[tokio::test]
async fn directory_in_place_of_file_is_an_entry_error() {
    let fx = Fixture::new();
    write_with_mtime(&fx.src.join("clash"), b"file", 1_600_000_000);
    write_with_mtime(&fx.src.join("ok.txt"), b"fine", 1_600_000_000);
    fs::create_dir_all(fx.dst.join("clash")).unwrap();

    let stats = fx.run(fx.params()).await.unwrap();

    assert_eq!(
        fx.reporter.errors(),
        vec!["failed to update clash: target is a directory".to_string()]
    );
    assert_eq!(stats.errors, 1);
    assert!(fx.dst.join("clash").is_dir());
    assert!(fx.dst.join("ok.txt").exists());
}

#[tokio::test]
async fn metadata_failure_is_a_partial_copy() {
    let fx = Fixture::new();
    write_with_mtime(&fx.src.join("a.txt"), b"body", 1_600_000_000);

    let dst = FlakyStorage {
        fail_times: true,
        ..FlakyStorage::default()
    };
    let stats = fx
        .run_between(fx.params(), FlakyStorage::default(), dst)
        .await
        .unwrap();

    assert_eq!(stats.copied, 0);
    assert_eq!(stats.errors, 1);
    let errors = fx.reporter.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("failed to copy a.txt"));
    assert!(errors[0].contains("metadata not applied"));
    // content made it across
    assert_eq!(fs::read(fx.dst.join("a.txt")).unwrap(), b"body");
}

#[tokio::test]
async fn release_error_surfaces_after_a_clean_run() {
    let fx = Fixture::new();
    write_with_mtime(&fx.src.join("a.txt"), b"a", 1_600_000_000);

    let dst = FlakyStorage {
        fail_close: true,
        ..FlakyStorage::default()
    };
    let err = fx
        .run_between(fx.params(), FlakyStorage::default(), dst)
        .await
        .unwrap_err();

    match err {
        SyncError::Release { backend, source } => {
            assert_eq!(backend, "flaky");
            assert!(matches!(source, StorageError::Session(_)));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(fx.dst.join("a.txt").exists());
}

#[tokio::test]
async fn release_error_does_not_mask_run_error() {
    let fx = Fixture::new();
    let file = fx.src.join("plain.txt");
    write_with_mtime(&file, b"x", 1_600_000_000);

    let src = FlakyStorage {
        fail_close: true,
        ..FlakyStorage::default()
    };
    let err = fx
        .syncer(fx.params())
        .sync_between(
            Box::new(src),
            &file.to_string_lossy(),
            Box::new(FlakyStorage::default()),
            &fx.dst.to_string_lossy(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::SourceNotDirectory(_)));
    let errors = fx.reporter.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("closing flaky storage"));
}

#[cfg(unix)]
#[tokio::test]
async fn copy_without_owner_read_keeps_metadata() {
    let fx = Fixture::new();
    write_with_mtime(&fx.src.join("a.txt"), b"restricted", 1_577_836_800);

    let src = || FlakyStorage {
        mode: Some(0o004),
        ..FlakyStorage::default()
    };
    let stats = fx
        .run_between(fx.params(), src(), FlakyStorage::default())
        .await
        .unwrap();

    assert!(fx.reporter.errors().is_empty());
    assert_eq!(stats.copied, 1);
    let copied = fx.dst.join("a.txt");
    assert_eq!(mtime_secs(&copied), 1_577_836_800);
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&copied).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o004);
    }

    fx.reporter.clear();
    let again = fx
        .run_between(fx.params(), src(), FlakyStorage::default())
        .await
        .unwrap();

    assert!(fx.reporter.infos().is_empty());
    assert!(fx.reporter.errors().is_empty());
    assert_eq!(again.unchanged, 1);
}

/// 目标端使用 POSIX 路径约定（本地到远端）
#[cfg(unix)]
#[tokio::test]
async fn copies_into_posix_target() {
    let fx = Fixture::new();
    write_with_mtime(&fx.src.join("top.txt"), b"top", 1_600_000_000);
    write_with_mtime(&fx.src.join("x/y/deep.txt"), b"deep", 1_600_000_000);

    let dst = FlakyStorage {
        posix: true,
        ..FlakyStorage::default()
    };
    let dst_root = format!("{}/", fx.dst.to_string_lossy());
    let stats = fx
        .syncer(fx.params())
        .sync_between(
            Box::new(FlakyStorage::default()),
            &fx.src.to_string_lossy(),
            Box::new(dst),
            &dst_root,
        )
        .await
        .unwrap();

    assert_eq!(stats.copied, 2);
    assert_eq!(
        fx.reporter.infos(),
        vec!["copying top.txt".to_string(), "copying x/y/deep.txt".to_string()]
    );
    assert_eq!(fs::read(fx.dst.join("x/y/deep.txt")).unwrap(), b"deep");
    assert_eq!(mtime_secs(&fx.dst.join("x/y/deep.txt")), 1_600_000_000);
}

/// 源端使用 POSIX 路径约定（远端到本地），删除阶段反向映射
#[cfg(unix)]
#[tokio::test]
async fn prunes_against_posix_source() {
    let fx = Fixture::new();
    write_with_mtime(&fx.src.join("x/y/keep.txt"), b"keep", 1_600_000_000);
    write_with_mtime(&fx.dst.join("x/y/keep.txt"), b"keep", 1_600_000_000);
    write_with_mtime(&fx.dst.join("x/y/gone.txt"), b"gone", 1_600_000_000);

    let src = FlakyStorage {
        posix: true,
        ..FlakyStorage::default()
    };
    let params = SyncParams {
        delete_missing: true,
        ..fx.params()
    };
    let stats = fx
        .run_between(params, src, FlakyStorage::default())
        .await
        .unwrap();

    assert_eq!(fx.reporter.infos(), vec!["deleting x/y/gone.txt".to_string()]);
    assert!(fx.reporter.errors().is_empty());
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.unchanged, 1);
    assert!(fx.dst.join("x/y/keep.txt").exists());
    assert!(!fx.dst.join("x/y/gone.txt").exists());
}
