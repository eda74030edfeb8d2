//! 可续传上传存储：数据文件、元数据工件与按 id 串行化的追加写入。
//!
//! 每个未完成的上传在存储根目录下有两个隐藏工件：
//! `.{id}.part`（已确认的数据）与 `.{id}.upload.json`（会话元数据）。
//! 元数据中的 offset 是权威值，数据文件在持锁访问前总会被校正到该长度。
//! 收满声明长度后数据文件被重命名为最终文件名，元数据随即删除。

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::atomic::{sync_dir, write_atomic};
use crate::locking::{LockManager, UploadLock};
use crate::sanitize::FinalNameAllocator;
use crate::storage::{Storage, StorageError, is_artifact_name};

const METADATA_SUFFIX: &str = ".upload.json";
const PART_SUFFIX: &str = ".part";
const TEMP_MARKER: &str = ".tmp.";

/// Metadata key carrying the client's filename hint.
pub const FILENAME_KEY: &str = "filename";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid path")]
    InvalidPath,
    #[error("upload not found")]
    NotFound,
    #[error("offset mismatch, current offset is {current}")]
    OffsetConflict { current: u64 },
    #[error("upload length exceeded")]
    LengthExceeded,
    #[error("upload exceeds maximum size of {max} bytes")]
    TooLarge { max: u64 },
    #[error("upload is locked by another request")]
    Busy,
    #[error("request body stalled")]
    Stalled,
    #[error("request body interrupted: {0}")]
    Interrupted(String),
    #[error("corrupt upload metadata: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<StorageError> for StoreError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => StoreError::InvalidPath,
            StorageError::Io(err) => StoreError::Io(err),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Uploading,
    Completed,
    Aborted,
}

/// Persisted record of one upload; serialized as the metadata artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub id: String,
    pub declared_length: u64,
    pub offset: u64,
    pub metadata: BTreeMap<String, String>,
    pub final_name: String,
    pub created_at: DateTime<Utc>,
    /// 最近一次确认写入的时间，过期清理按它计算空闲时长。
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn state(&self) -> SessionState {
        if self.offset >= self.declared_length {
            SessionState::Completed
        } else if self.offset == 0 {
            SessionState::Created
        } else {
            SessionState::Uploading
        }
    }
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// 0 disables the limit.
    pub max_size: u64,
    pub lock_wait: Duration,
    /// Longest gap between two body frames; 0 disables the check.
    pub chunk_idle: Duration,
}

/// Outcome of a startup or expiry sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub resumable: usize,
    pub removed: usize,
}

pub struct UploadStore {
    storage: Arc<Storage>,
    locks: LockManager,
    names: FinalNameAllocator,
    config: StoreConfig,
}

impl UploadStore {
    pub fn new(storage: Arc<Storage>, config: StoreConfig) -> Self {
        Self {
            storage,
            locks: LockManager::new(),
            names: FinalNameAllocator::new(),
            config,
        }
    }

    pub fn max_size(&self) -> u64 {
        self.config.max_size
    }

    /// 创建上传会话：空数据文件与元数据工件要么都存在，要么都不存在。
    pub async fn create(
        &self,
        declared_length: u64,
        metadata: BTreeMap<String, String>,
    ) -> Result<UploadSession, StoreError> {
        if self.config.max_size > 0 && declared_length > self.config.max_size {
            return Err(StoreError::TooLarge {
                max: self.config.max_size,
            });
        }

        let id = Uuid::new_v4().to_string();
        let final_name = self
            .names
            .allocate(metadata.get(FILENAME_KEY).map(String::as_str));
        let now = Utc::now();
        let session = UploadSession {
            id,
            declared_length,
            offset: 0,
            metadata,
            final_name,
            created_at: now,
            updated_at: now,
        };

        if declared_length == 0 {
            let target = self.final_path(&session.final_name).await?;
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&target)
                .await?;
            file.sync_all().await?;
            info!(
                upload_id = session.id,
                final_name = session.final_name,
                "empty upload completed on creation"
            );
            return Ok(session);
        }

        let part = self.part_path(&session.id).await?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part)
            .await?;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = self.write_metadata(&session).await {
            let _ = fs::remove_file(&part).await;
            return Err(err);
        }

        info!(
            upload_id = session.id,
            final_name = session.final_name,
            declared_length,
            "upload created"
        );
        Ok(session)
    }

    /// 返回会话当前状态；已完成、已终止或未知的 id 返回 NotFound。
    pub async fn get_state(&self, id: &str) -> Result<UploadSession, StoreError> {
        let _lock = self.lock(id).await?;
        self.load_locked(id).await
    }

    /// 在 `expected_offset` 处追加分片；失败时数据文件回滚，offset 不变。
    pub async fn append<S>(
        &self,
        id: &str,
        expected_offset: u64,
        content_length: Option<u64>,
        body: S,
    ) -> Result<UploadSession, StoreError>
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Unpin,
    {
        let _lock = self.lock(id).await?;
        self.append_locked(id, expected_offset, content_length, body)
            .await
    }

    /// 终止上传并删除全部工件。
    pub async fn abort(&self, id: &str) -> Result<SessionState, StoreError> {
        let _lock = self.lock(id).await?;
        self.abort_locked(id).await
    }

    /// 启动时扫描：校正每个会话，清理孤立工件与残留临时文件。
    pub async fn recover(&self) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        let mut dir = fs::read_dir(self.storage.root_path()).await?;
        let mut session_ids = Vec::new();
        let mut parts = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_artifact_name(&name) {
                continue;
            }
            if name.contains(TEMP_MARKER) {
                warn!(name, "removing leftover temp file");
                remove_if_exists(&entry.path()).await?;
                report.removed += 1;
            } else if let Some(id) = artifact_id(&name, METADATA_SUFFIX) {
                session_ids.push(id.to_string());
            } else if let Some(id) = artifact_id(&name, PART_SUFFIX) {
                parts.push((id.to_string(), entry.path()));
            }
        }

        for id in &session_ids {
            match self.get_state(id).await {
                Ok(_) => report.resumable += 1,
                Err(StoreError::NotFound) => report.removed += 1,
                Err(err) => warn!(upload_id = id, error = %err, "failed to recover upload"),
            }
        }

        for (id, path) in parts {
            if !session_ids.contains(&id) {
                warn!(upload_id = id, "removing orphaned upload data");
                remove_if_exists(&path).await?;
                report.removed += 1;
            }
        }

        info!(
            resumable = report.resumable,
            removed = report.removed,
            "upload recovery finished"
        );
        Ok(report)
    }

    /// 删除空闲（最近一次写入距今）超过 `ttl` 的未完成上传。
    pub async fn expire(&self, ttl: Duration) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        for id in self.session_ids().await? {
            // 检查与删除在同一把锁内完成，避免误删刚刚推进的上传。
            let _lock = match self.lock(&id).await {
                Ok(lock) => lock,
                Err(_) => {
                    report.resumable += 1;
                    continue;
                }
            };
            let session = match self.load_locked(&id).await {
                Ok(session) => session,
                Err(StoreError::NotFound) => continue,
                Err(err) => {
                    warn!(upload_id = id, error = %err, "skip unreadable upload");
                    continue;
                }
            };
            if now.signed_duration_since(session.updated_at) < ttl {
                report.resumable += 1;
                continue;
            }
            match self.abort_locked(&id).await {
                Ok(_) => {
                    info!(upload_id = id, offset = session.offset, "expired idle upload");
                    report.removed += 1;
                }
                Err(StoreError::NotFound) => {}
                Err(err) => warn!(upload_id = id, error = %err, "failed to expire upload"),
            }
        }

        Ok(report)
    }

    async fn lock(&self, id: &str) -> Result<UploadLock, StoreError> {
        self.locks
            .lock_with_timeout(id, self.config.lock_wait)
            .await
            .map_err(|_| StoreError::Busy)
    }

    async fn append_locked<S>(
        &self,
        id: &str,
        expected_offset: u64,
        content_length: Option<u64>,
        body: S,
    ) -> Result<UploadSession, StoreError>
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Unpin,
    {
        let mut session = self.load_locked(id).await?;
        if expected_offset != session.offset {
            debug!(
                upload_id = id,
                expected_offset,
                current = session.offset,
                "offset conflict"
            );
            return Err(StoreError::OffsetConflict {
                current: session.offset,
            });
        }
        let remaining = session.declared_length - session.offset;
        if content_length.is_some_and(|len| len > remaining) {
            return Err(StoreError::LengthExceeded);
        }

        let part = self.part_path(id).await?;
        let previous = session.offset;
        let written = match self.write_chunk(&part, previous, remaining, body).await {
            Ok(written) => written,
            Err(err) => {
                self.rollback(id, &part, previous).await;
                return Err(err);
            }
        };
        if written == 0 {
            return Ok(session);
        }

        session.offset = previous + written;
        session.updated_at = Utc::now();
        let persisted = if session.offset == session.declared_length {
            self.finalize(&session, &part).await
        } else {
            self.write_metadata(&session).await
        };
        if let Err(err) = persisted {
            self.rollback(id, &part, previous).await;
            return Err(err);
        }

        debug!(
            upload_id = id,
            offset = session.offset,
            bytes = written,
            "chunk appended"
        );
        Ok(session)
    }

    async fn write_chunk<S>(
        &self,
        part: &Path,
        offset: u64,
        remaining: u64,
        mut body: S,
    ) -> Result<u64, StoreError>
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Unpin,
    {
        let mut file = OpenOptions::new().write(true).open(part).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut written: u64 = 0;
        loop {
            let next = if self.config.chunk_idle.is_zero() {
                body.next().await
            } else {
                time::timeout(self.config.chunk_idle, body.next())
                    .await
                    .map_err(|_| StoreError::Stalled)?
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|err| StoreError::Interrupted(err.to_string()))?;
            if chunk.is_empty() {
                continue;
            }
            written += chunk.len() as u64;
            if written > remaining {
                return Err(StoreError::LengthExceeded);
            }
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    async fn rollback(&self, id: &str, part: &Path, offset: u64) {
        if let Err(err) = truncate(part, offset).await {
            warn!(upload_id = id, offset, error = %err, "failed to roll back partial chunk");
        }
    }

    async fn finalize(&self, session: &UploadSession, part: &Path) -> Result<(), StoreError> {
        let target = self.final_path(&session.final_name).await?;
        if fs::try_exists(&target).await? {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", session.final_name),
            )));
        }
        fs::rename(part, &target).await?;
        if let Err(err) = sync_dir(self.storage.root_path()).await {
            warn!(upload_id = session.id, error = %err, "failed to sync storage directory");
        }

        let meta_path = self.metadata_path(&session.id).await?;
        if let Err(err) = remove_if_exists(&meta_path).await {
            // 重新访问时会按完整数据文件判定为已完成并再次清理。
            warn!(upload_id = session.id, error = %err, "failed to remove metadata of completed upload");
        }

        info!(
            upload_id = session.id,
            final_name = session.final_name,
            size = session.declared_length,
            "upload complete"
        );
        Ok(())
    }

    async fn abort_locked(&self, id: &str) -> Result<SessionState, StoreError> {
        let session = self.load_locked(id).await?;
        remove_if_exists(&self.part_path(id).await?).await?;
        remove_if_exists(&self.metadata_path(id).await?).await?;
        info!(upload_id = id, offset = session.offset, "upload aborted");
        Ok(SessionState::Aborted)
    }

    /// 读取元数据并把数据文件校正到记录的 offset，调用方须持有锁。
    async fn load_locked(&self, id: &str) -> Result<UploadSession, StoreError> {
        let meta_path = self.metadata_path(id).await?;
        let bytes = match fs::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound);
            }
            Err(err) => return Err(err.into()),
        };
        let mut session: UploadSession =
            serde_json::from_slice(&bytes).map_err(|err| StoreError::Corrupt(err.to_string()))?;
        if session.id != id {
            return Err(StoreError::Corrupt(format!("id mismatch in {id}")));
        }

        let part = self.part_path(id).await?;
        let actual = match fs::metadata(&part).await {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.discard_stale_metadata(&session, &meta_path).await?;
                return Err(StoreError::NotFound);
            }
            Err(err) => return Err(err.into()),
        };

        if actual > session.offset {
            warn!(
                upload_id = id,
                recorded = session.offset,
                actual,
                "truncating unconfirmed bytes"
            );
            truncate(&part, session.offset).await?;
        } else if actual < session.offset {
            warn!(
                upload_id = id,
                recorded = session.offset,
                actual,
                "data file shorter than recorded offset"
            );
            session.offset = actual;
            self.write_metadata(&session).await?;
        }

        if session.offset >= session.declared_length {
            self.finalize(&session, &part).await?;
            return Err(StoreError::NotFound);
        }
        Ok(session)
    }

    async fn discard_stale_metadata(
        &self,
        session: &UploadSession,
        meta_path: &Path,
    ) -> Result<(), StoreError> {
        let target = self.final_path(&session.final_name).await?;
        match fs::metadata(&target).await {
            Ok(metadata) if metadata.is_file() && metadata.len() == session.declared_length => {
                info!(upload_id = session.id, "removing stale metadata of completed upload");
            }
            _ => warn!(upload_id = session.id, "removing orphaned upload metadata"),
        }
        remove_if_exists(meta_path).await?;
        Ok(())
    }

    async fn write_metadata(&self, session: &UploadSession) -> Result<(), StoreError> {
        let path = self.metadata_path(&session.id).await?;
        let contents = serde_json::to_vec(session).map_err(io::Error::other)?;
        write_atomic(&path, &contents).await?;
        Ok(())
    }

    async fn session_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut dir = fs::read_dir(self.storage.root_path()).await?;
        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = artifact_id(&name, METADATA_SUFFIX) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    async fn metadata_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        self.artifact_path(id, METADATA_SUFFIX).await
    }

    async fn part_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        self.artifact_path(id, PART_SUFFIX).await
    }

    async fn artifact_path(&self, id: &str, suffix: &str) -> Result<PathBuf, StoreError> {
        if !is_upload_id(id) {
            return Err(StoreError::NotFound);
        }
        Ok(self
            .storage
            .resolve_path_checked(&format!(".{id}{suffix}"), true)
            .await?)
    }

    async fn final_path(&self, final_name: &str) -> Result<PathBuf, StoreError> {
        if final_name.is_empty() || is_artifact_name(final_name) {
            return Err(StoreError::InvalidPath);
        }
        Ok(self
            .storage
            .resolve_path_checked(final_name, true)
            .await?)
    }
}

fn is_upload_id(id: &str) -> bool {
    Uuid::parse_str(id).is_ok_and(|uuid| uuid.hyphenated().to_string() == id)
}

fn artifact_id<'a>(name: &'a str, suffix: &str) -> Option<&'a str> {
    let id = name.strip_prefix('.')?.strip_suffix(suffix)?;
    is_upload_id(id).then_some(id)
}

async fn truncate(path: &Path, len: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(len).await?;
    file.sync_all().await
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
