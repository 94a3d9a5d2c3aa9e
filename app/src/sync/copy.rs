use storage::{Storage, StorageError};
use tokio::io::AsyncWriteExt;

use super::SyncError;

/// Copy one file between storages and replicate its permission bits and
/// modification time.
///
/// The destination's parent directory must exist. Returns the number of bytes
/// written. A failure after the content landed is a [`SyncError::PartialCopy`].
pub async fn copy_file(
    src: &dyn Storage, src_path: &str, dst: &dyn Storage, dst_path: &str,
) -> Result<u64, SyncError> {
    // 先取源文件元数据，复制完成后回放到目标
    let info = src.stat(src_path).await?;

    let mut reader = src.open(src_path).await?;
    let mut writer = dst.create(dst_path).await?;

    let written = tokio::io::copy(&mut reader, &mut writer)
        .await
        .map_err(|e| StorageError::from_io(dst_path, e))?;
    // shutdown 会刷新缓冲并关闭远端句柄
    writer
        .shutdown()
        .await
        .map_err(|e| StorageError::from_io(dst_path, e))?;
    drop(writer);
    drop(reader);

    // 内容已落盘，此后的失败只算部分完成
    let replicate = async {
        dst.set_permissions(dst_path, info.mode).await?;
        dst.set_times(dst_path, info.modified, info.modified).await
    };
    replicate.await.map_err(|source| SyncError::PartialCopy {
        path: dst_path.to_string(),
        source,
    })?;

    Ok(written)
}
