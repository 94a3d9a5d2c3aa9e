use std::sync::Arc;

use storage::{
    create_storage, Endpoint, FileInfo, Storage, StorageError, Visitor, WalkControl, WalkPolicy,
};

use super::compare::{compare_files, CompareStrategy};
use super::copy::copy_file;
use super::report::{LogReporter, Reporter};
use super::{SyncError, SyncParams, SyncStats};

/// Runs one synchronization from `params.source` to `params.target`.
pub struct Syncer {
    params: SyncParams,
    reporter: Arc<dyn Reporter>,
}

impl Syncer {
    pub fn new(params: SyncParams) -> Self {
        Self::with_reporter(params, Arc::new(LogReporter))
    }

    pub fn with_reporter(params: SyncParams, reporter: Arc<dyn Reporter>) -> Self {
        Self { params, reporter }
    }

    /// Resolve both endpoints, connect, and synchronize.
    pub async fn sync(&self) -> Result<SyncStats, SyncError> {
        let source = Endpoint::parse(&self.params.source);
        let target = Endpoint::parse(&self.params.target);
        let options = self.params.connect_options();

        log::debug!("syncing {} -> {}", source, target);

        // 先连源端，再连目标端；目标端失败时要释放已建立的源端连接

        let src = create_storage(&source, &options)
            .await
            .map_err(SyncError::Source)?;

        let dst = match create_storage(&target, &options).await {
            Ok(dst) => dst,
            Err(e) => {
                if let Err(release) = self.release(src).await {
                    self.reporter.error(&release.to_string());
                }
                return Err(SyncError::Target(e));
            }
        };

        self.sync_between(src, &source.path, dst, &target.path).await
    }

    /// Synchronize between two already opened storages. Both handles are
    /// closed before returning, whatever the outcome.
    pub async fn sync_between(
        &self, src: Box<dyn Storage>, src_root: &str, dst: Box<dyn Storage>, dst_root: &str,
    ) -> Result<SyncStats, SyncError> {
        let outcome = self.run(&*src, src_root, &*dst, dst_root).await;

        let released = [self.release(src).await, self.release(dst).await];

        match outcome {
            Err(e) => {
                // 返回运行本身的错误，释放错误只记录
                for err in released.into_iter().filter_map(Result::err) {
                    self.reporter.error(&err.to_string());
                }
                Err(e)
            }
            Ok(stats) => {
                // 运行成功时返回第一个释放错误
                let mut first = None;
                for err in released.into_iter().filter_map(Result::err) {
                    match first {
                        None => first = Some(err),
                        Some(_) => self.reporter.error(&err.to_string()),
                    }
                }
                match first {
                    Some(err) => Err(err),
                    None => Ok(stats),
                }
            }
        }
    }

    async fn release(&self, handle: Box<dyn Storage>) -> Result<(), SyncError> {
        let backend = handle.name();
        handle
            .close()
            .await
            .map_err(|source| SyncError::Release { backend, source })
    }

    async fn run(
        &self, src: &dyn Storage, src_root: &str, dst: &dyn Storage, dst_root: &str,
    ) -> Result<SyncStats, SyncError> {
        // 源根必须是目录
        let root = src.stat(src_root).await.map_err(SyncError::Source)?;
        if !root.is_dir {
            return Err(SyncError::SourceNotDirectory(src_root.to_string()));
        }

        dst.create_dir_all(dst_root)
            .await
            .map_err(SyncError::PrepareTarget)?;

        let mut stats = SyncStats::default();

        // 第一遍：遍历源端，复制新增和变更的文件

        let mut copy_pass = CopyPass {
            src,
            src_root,
            dst,
            dst_root,
            strategy: self.params.strategy(),
            reporter: &*self.reporter,
            stats: &mut stats,
        };
        src.walk(src_root, WalkPolicy::Tolerant, &mut copy_pass)
            .await
            .map_err(SyncError::Walk)?;

        // 第二遍：遍历目标端，删除源端已不存在的文件
        if self.params.delete_missing {
            let mut prune_pass = PrunePass {
                src,
                src_root,
                dst,
                dst_root,
                reporter: &*self.reporter,
                stats: &mut stats,
            };
            dst.walk(dst_root, WalkPolicy::Tolerant, &mut prune_pass)
                .await
                .map_err(SyncError::Walk)?;
        }

        log::debug!("sync finished: {:?}", stats);
        Ok(stats)
    }
}

/// Map `path` under `from_root` on one storage onto the matching path under
/// `to_root` on the other. Returns `(relative, mapped)`.
fn map_path(
    from: &dyn Storage, from_root: &str, path: &str, to: &dyn Storage, to_root: &str,
) -> Result<(String, String), StorageError> {
    let from_conv = from.convention();
    let to_conv = to.convention();
    let rel = from_conv.relative(from_root, path)?;
    let mapped = to_conv.join(to_root, &from_conv.translate(&rel, to_conv));
    Ok((rel, mapped))
}

/// Source walk: create missing files, rewrite changed ones.
struct CopyPass<'a> {
    src: &'a dyn Storage,
    src_root: &'a str,
    dst: &'a dyn Storage,
    dst_root: &'a str,
    strategy: CompareStrategy,
    reporter: &'a dyn Reporter,
    stats: &'a mut SyncStats,
}

impl CopyPass<'_> {
    fn fail(&mut self, message: String) {
        self.stats.errors += 1;
        self.reporter.error(&message);
    }

    async fn copy(&mut self, rel: &str, src_path: &str, dst_path: &str, verb: &str) -> bool {
        match copy_file(self.src, src_path, self.dst, dst_path).await {
            Ok(bytes) => {
                self.stats.bytes += bytes;
                true
            }
            Err(e) => {
                self.fail(format!("failed to {} {}: {}", verb, rel, e));
                false
            }
        }
    }

    async fn propagate(&mut self, path: &str) {
        let (rel, dst_path) = match map_path(self.src, self.src_root, path, self.dst, self.dst_root)
        {
            Ok(mapped) => mapped,
            Err(e) => {
                self.fail(format!("failed to get relative path for {}: {}", path, e));
                return;
            }
        };

        match self.dst.stat(&dst_path).await {
            // 目标不存在：补齐父目录后复制
            Err(e) if e.is_not_found() => {
                let parent = self.dst.convention().parent(&dst_path);
                if let Err(e) = self.dst.create_dir_all(&parent).await {
                    self.fail(format!("failed to create directory for {}: {}", rel, e));
                    return;
                }
                self.reporter.info(&format!("copying {}", rel));
                if self.copy(&rel, path, &dst_path, "copy").await {
                    self.stats.copied += 1;
                }
            }
            Err(e) => self.fail(format!("failed to access {} in target: {}", rel, e)),
            Ok(existing) if existing.is_dir => {
                self.fail(format!("failed to update {}: target is a directory", rel));
            }
            // 目标存在：按比较策略决定是否覆盖
            Ok(_) => {
                match compare_files(self.src, path, self.dst, &dst_path, self.strategy).await {
                    Ok(true) => self.stats.unchanged += 1,
                    Ok(false) => {
                        self.reporter.info(&format!("updating {}", rel));
                        if self.copy(&rel, path, &dst_path, "update").await {
                            self.stats.updated += 1;
                        }
                    }
                    Err(e) => self.fail(format!("failed to compare {}: {}", rel, e)),
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl<'a> Visitor for CopyPass<'a> {
    async fn visit(
        &mut self, path: &str, info: Option<&FileInfo>, err: Option<&StorageError>,
    ) -> WalkControl {
        // 单个条目出错只记录，不中断遍历
        if let Some(err) = err {
            self.fail(format!("failed to access {}: {}", path, err));
            return WalkControl::Continue;
        }

        // 目录只作为父目录按需创建
        if info.is_some_and(|info| !info.is_dir) {
            self.propagate(path).await;
        }

        WalkControl::Continue
    }
}

/// Target walk: remove files the source no longer has.
struct PrunePass<'a> {
    src: &'a dyn Storage,
    src_root: &'a str,
    dst: &'a dyn Storage,
    dst_root: &'a str,
    reporter: &'a dyn Reporter,
    stats: &'a mut SyncStats,
}

impl PrunePass<'_> {
    fn fail(&mut self, message: String) {
        self.stats.errors += 1;
        self.reporter.error(&message);
    }

    async fn prune(&mut self, path: &str) {
        let (rel, src_path) = match map_path(self.dst, self.dst_root, path, self.src, self.src_root)
        {
            Ok(mapped) => mapped,
            Err(e) => {
                self.fail(format!("failed to get relative path for {}: {}", path, e));
                return;
            }
        };

        match self.src.stat(&src_path).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                self.reporter.info(&format!("deleting {}", rel));
                match self.dst.remove(path).await {
                    Ok(()) => self.stats.deleted += 1,
                    Err(e) => self.fail(format!("failed to delete {}: {}", rel, e)),
                }
            }
            // 源端无法确认时保留目标文件
            Err(e) => self.fail(format!("failed to access {} in source: {}", rel, e)),
        }
    }
}

#[async_trait::async_trait]
impl<'a> Visitor for PrunePass<'a> {
    async fn visit(
        &mut self, path: &str, info: Option<&FileInfo>, err: Option<&StorageError>,
    ) -> WalkControl {
        if let Some(err) = err {
            self.fail(format!("failed to access {}: {}", path, err));
            return WalkControl::Continue;
        }

        if info.is_some_and(|info| !info.is_dir) {
            self.prune(path).await;
        }

        WalkControl::Continue
    }
}
