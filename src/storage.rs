use chrono::{DateTime, SecondsFormat, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::ErrorKind;
use tracing::debug;

const URL_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Prefix shared by every upload artifact (in-progress data, metadata, temp files).
pub const ARTIFACT_PREFIX: char = '.';

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Resolves `relative` under the root, rejecting traversal and symlinks.
    pub async fn resolve_path_checked(
        &self,
        relative: &str,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        let target = self.resolve(relative)?;
        self.ensure_no_symlink_components(&target, allow_missing_leaf)
            .await?;
        Ok(target)
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let mut normalized = PathBuf::new();

        for component in Path::new(relative).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidPath);
                }
            }
        }
        if relative.contains('\\') && cfg!(not(windows)) {
            return Err(StorageError::InvalidPath);
        }

        let target = self.root.join(normalized);
        if target != self.root && !target.starts_with(&self.root) {
            return Err(StorageError::InvalidPath);
        }
        Ok(target)
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                    return Ok(());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    /// Lists finalized files directly under the root, newest first.
    pub async fn list_files(&self) -> Result<Vec<FileRecord>, StorageError> {
        let mut dir = fs::read_dir(&self.root).await?;
        let mut records = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_artifact_name(&name) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) => {
                    debug!(name, error = %err, "skip unreadable entry");
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            records.push(FileRecord::new(name, metadata.len(), modified));
        }

        records.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(records)
    }
}

/// Returns true for names in the upload artifact namespace.
pub fn is_artifact_name(name: &str) -> bool {
    name.starts_with(ARTIFACT_PREFIX)
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub name: String,
    pub size: u64,
    pub uploaded_at: String,
    pub download_url: String,
    #[serde(skip)]
    modified: SystemTime,
}

impl FileRecord {
    fn new(name: String, size: u64, modified: SystemTime) -> Self {
        let datetime: DateTime<Utc> = modified.into();
        Self {
            download_url: download_url(&name),
            uploaded_at: datetime.to_rfc3339_opts(SecondsFormat::Millis, true),
            name,
            size,
            modified,
        }
    }
}

pub fn download_url(name: &str) -> String {
    format!(
        "/api/download/{}",
        utf8_percent_encode(name, URL_COMPONENT)
    )
}
