//! 元数据工件的原子写入与目录同步。

use std::io;
use std::path::Path;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

/// 原子写入完整内容：同目录临时文件写入并落盘后再 rename 覆盖目标。
///
/// 临时文件名以 `.` 开头，崩溃残留会在启动扫描时清除。
pub async fn write_atomic(target: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target path"))?;
    let base = target
        .file_name()
        .map(|name| name.to_string_lossy())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target path"))?;
    let temp_path = parent.join(format!(".{base}.tmp.{}", Uuid::new_v4()));

    if let Err(err) = write_synced(&temp_path, contents).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    if let Err(err) = replace(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    if let Err(err) = sync_dir(parent).await {
        warn!(path = %parent.display(), error = %err, "failed to sync directory after rename");
    }
    Ok(())
}

async fn write_synced(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(contents).await?;
    file.sync_all().await
}

#[cfg(not(windows))]
async fn replace(from: &Path, to: &Path) -> io::Result<()> {
    fs::rename(from, to).await
}

// Windows 上 rename 不覆盖已存在的目标。
#[cfg(windows)]
async fn replace(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::remove_file(to).await?;
            fs::rename(from, to).await
        }
    }
}

/// 同步目录项，使 rename/unlink 落盘。
pub async fn sync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let dir = std::fs::File::open(path)?;
            dir.sync_all()
        })
        .await
        .map_err(|err| io::Error::other(err.to_string()))?
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}
