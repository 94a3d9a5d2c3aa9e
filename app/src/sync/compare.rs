//! Decide whether a target file already matches its source.

use sha2::{Digest, Sha256};
use storage::{unix_seconds, FileInfo, Storage, StorageError, StorageResult};
use tokio::io::AsyncReadExt;

const CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompareStrategy {
    /// Same size and same modification second.
    #[default]
    Metadata,
    /// Same SHA-256 digest, metadata ignored.
    Checksum,
}

/// `true` when the two files are considered identical under `strategy`.
pub async fn compare_files(
    src: &dyn Storage, src_path: &str, dst: &dyn Storage, dst_path: &str,
    strategy: CompareStrategy,
) -> StorageResult<bool> {
    match strategy {
        CompareStrategy::Metadata => compare_metadata(src, src_path, dst, dst_path).await,
        CompareStrategy::Checksum => compare_checksum(src, src_path, dst, dst_path).await,
    }
}

pub async fn compare_metadata(
    src: &dyn Storage, src_path: &str, dst: &dyn Storage, dst_path: &str,
) -> StorageResult<bool> {
    let src_info = src.stat(src_path).await?;
    let dst_info = dst.stat(dst_path).await?;
    Ok(same_metadata(&src_info, &dst_info))
}

/// Sizes equal and modification times equal once truncated to whole seconds.
pub fn same_metadata(a: &FileInfo, b: &FileInfo) -> bool {
    a.size == b.size && unix_seconds(a.modified) == unix_seconds(b.modified)
}

pub async fn compare_checksum(
    src: &dyn Storage, src_path: &str, dst: &dyn Storage, dst_path: &str,
) -> StorageResult<bool> {
    let src_digest = sha256_hex(src, src_path).await?;
    let dst_digest = sha256_hex(dst, dst_path).await?;
    Ok(src_digest == dst_digest)
}

/// Stream `path` through SHA-256 and return the lowercase hex digest.
pub async fn sha256_hex(storage: &dyn Storage, path: &str) -> StorageResult<String> {
    let mut reader = storage.open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    // 分块读取，避免整个文件进内存
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
