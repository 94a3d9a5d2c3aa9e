use std::fs::Metadata;
use std::io;
use std::path::Path;
use std::time::SystemTime;
use filetime::FileTime;
use tokio::fs as tokio_fs;
use walkdir::WalkDir;

use crate::common::{
    FileInfo, PathConvention, StorageError, StorageResult, Visitor, WalkControl, WalkPolicy,
};
use crate::{ReadStream, Storage, WriteStream};

/// Storage backed by the host filesystem.
#[derive(Debug, Default, Clone)]
pub struct LocalStorage;

impl LocalStorage {
    pub fn new() -> Self {
        Self
    }
}

/// Build a [`FileInfo`] from std metadata
pub fn file_info(path: &Path, info: &Metadata) -> FileInfo {
    let name = path
        .file_name()
        .unwrap_or(path.as_os_str())
        .to_string_lossy()
        .into_owned();

    FileInfo {
        name,
        size: info.len(),
        mode: mode_of(info),
        modified: info.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        is_dir: info.is_dir(),
    }
}

fn mode_of(info: &Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        info.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        if info.permissions().readonly() {
            0o444
        } else {
            0o666
        }
    }
}

/// 将 walkdir 错误转换为带路径的存储错误
fn walk_error(err: walkdir::Error) -> StorageError {
    let path = err
        .path()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    match err.into_io_error() {
        Some(io_err) => StorageError::from_io(&path, io_err),
        None => StorageError::Io {
            path: path.clone(),
            source: io::Error::other("filesystem loop detected"),
        },
    }
}

#[async_trait::async_trait]
impl Storage for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    fn convention(&self) -> PathConvention {
        PathConvention::Native
    }

    async fn stat(&self, path: &str) -> StorageResult<FileInfo> {
        let info = tokio_fs::metadata(path)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        Ok(file_info(Path::new(path), &info))
    }

    async fn walk(
        &self, root: &str, policy: WalkPolicy, visitor: &mut dyn Visitor,
    ) -> StorageResult<()> {
        // 不跟随符号链接，按文件名排序保证遍历顺序稳定
        let mut entries = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = entries.next() {
            let visited = entry
                .map_err(walk_error)
                .and_then(|e| match e.metadata() {
                    Ok(info) => Ok((e, info)),
                    Err(err) => Err(walk_error(err)),
                });

            match visited {
                Ok((entry, info)) => {
                    let path = entry.path().to_string_lossy().into_owned();
                    let info = file_info(entry.path(), &info);
                    match visitor.visit(&path, Some(&info), None).await {
                        WalkControl::Continue => {}
                        WalkControl::SkipDir => {
                            if info.is_dir {
                                entries.skip_current_dir();
                            }
                        }
                        WalkControl::Stop => return Ok(()),
                    }
                }
                Err(err) => {
                    // 出错条目同样交给访问者，由策略决定是否继续
                    let path = match &err {
                        StorageError::NotFound { path }
                        | StorageError::PermissionDenied { path }
                        | StorageError::Io { path, .. } => path.clone(),
                        _ => root.to_string(),
                    };
                    let control = visitor.visit(&path, None, Some(&err)).await;
                    if policy == WalkPolicy::FailFast {
                        return Err(err);
                    }
                    if control == WalkControl::Stop {
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }

    async fn open(&self, path: &str) -> StorageResult<ReadStream> {
        let file = tokio_fs::File::open(path)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        Ok(Box::pin(file))
    }

    async fn create(&self, path: &str) -> StorageResult<WriteStream> {
        let file = tokio_fs::File::create(path)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        Ok(Box::pin(file))
    }

    async fn remove(&self, path: &str) -> StorageResult<()> {
        tokio_fs::remove_file(path)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn create_dir_all(&self, path: &str) -> StorageResult<()> {
        match tokio_fs::metadata(path).await {
            Ok(info) if info.is_dir() => return Ok(()),
            // 同名文件占位时不能建目录
            Ok(_) => {
                return Err(StorageError::NotADirectory {
                    path: path.to_string(),
                })
            }
            Err(_) => {}
        }

        tokio_fs::create_dir_all(path)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> StorageResult<()> {
        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            std::fs::Permissions::from_mode(mode & 0o7777)
        };
        #[cfg(not(unix))]
        let permissions = {
            let mut permissions = tokio_fs::metadata(path)
                .await
                .map_err(|e| StorageError::from_io(path, e))?
                .permissions();
            permissions.set_readonly(mode & 0o222 == 0);
            permissions
        };

        tokio_fs::set_permissions(path, permissions)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn set_times(
        &self, path: &str, accessed: SystemTime, modified: SystemTime,
    ) -> StorageResult<()> {
        let accessed = FileTime::from_system_time(accessed);
        let modified = FileTime::from_system_time(modified);
        // 按路径设置时间，只需属主身份，不需要读写权限
        filetime::set_file_times(path, accessed, modified)
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}
