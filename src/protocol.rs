//! tus 1.0.0 协议状态机：解析协议头并驱动上传存储。
//!
//! 创建、查询、追加与终止四类请求都先经过口令校验，
//! 再由 [`UploadStore`] 在按 id 加锁的前提下完成状态迁移。

use axum::body::Bytes;
use axum::http::{HeaderMap, header};
use base64::{Engine as _, engine::general_purpose};
use futures_util::stream::Stream;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::auth::{Unauthorized, UploadAuth};
use crate::store::{SessionState, StoreError, UploadSession, UploadStore};

pub const TUS_VERSION: &str = "1.0.0";
pub const TUS_EXTENSIONS: &str = "creation,termination";
pub const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

pub const TUS_RESUMABLE_HEADER: &str = "tus-resumable";
pub const TUS_VERSION_HEADER: &str = "tus-version";
pub const TUS_EXTENSION_HEADER: &str = "tus-extension";
pub const TUS_MAX_SIZE_HEADER: &str = "tus-max-size";
pub const UPLOAD_LENGTH_HEADER: &str = "upload-length";
pub const UPLOAD_OFFSET_HEADER: &str = "upload-offset";
pub const UPLOAD_METADATA_HEADER: &str = "upload-metadata";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid upload password")]
    Unauthorized,
    #[error("Upload-Length must be a non-negative integer")]
    InvalidLength,
    #[error("Upload-Offset must be a non-negative integer")]
    InvalidOffset,
    #[error("invalid Upload-Metadata: {0}")]
    InvalidMetadata(String),
    #[error("unsupported Tus-Resumable version")]
    UnsupportedVersion,
    #[error("Content-Type must be application/offset+octet-stream")]
    UnsupportedMediaType,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<Unauthorized> for ProtocolError {
    fn from(_: Unauthorized) -> Self {
        ProtocolError::Unauthorized
    }
}

/// Result of an offset query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetReport {
    pub offset: u64,
    pub length: u64,
    pub state: SessionState,
}

pub struct UploadProtocol {
    store: Arc<UploadStore>,
    auth: UploadAuth,
}

impl UploadProtocol {
    pub fn new(store: Arc<UploadStore>, auth: UploadAuth) -> Self {
        Self { store, auth }
    }

    pub fn max_size(&self) -> u64 {
        self.store.max_size()
    }

    /// 创建请求：需要 Upload-Length 与可选的 Upload-Metadata。
    pub async fn create(&self, headers: &HeaderMap) -> Result<UploadSession, ProtocolError> {
        self.admit(headers)?;
        let length = parse_upload_length(headers)?;
        let metadata = match header_str(headers, UPLOAD_METADATA_HEADER) {
            Some(value) => parse_metadata(value)?,
            None => BTreeMap::new(),
        };
        Ok(self.store.create(length, metadata).await?)
    }

    /// 偏移查询：返回权威 offset；已完成或终止的上传为 NotFound。
    pub async fn query(&self, id: &str, headers: &HeaderMap) -> Result<OffsetReport, ProtocolError> {
        self.admit(headers)?;
        let session = self.store.get_state(id).await?;
        Ok(OffsetReport {
            offset: session.offset,
            length: session.declared_length,
            state: session.state(),
        })
    }

    /// 追加分片：客户端声明的 offset 必须与存储中的 offset 完全一致。
    pub async fn append<S>(
        &self,
        id: &str,
        headers: &HeaderMap,
        body: S,
    ) -> Result<UploadSession, ProtocolError>
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Unpin,
    {
        self.admit(headers)?;
        if let Some(content_type) = header_str(headers, header::CONTENT_TYPE.as_str())
            && !content_type.eq_ignore_ascii_case(OFFSET_CONTENT_TYPE)
        {
            return Err(ProtocolError::UnsupportedMediaType);
        }
        let offset = header_str(headers, UPLOAD_OFFSET_HEADER)
            .and_then(parse_u64)
            .ok_or(ProtocolError::InvalidOffset)?;
        let content_length = header_str(headers, header::CONTENT_LENGTH.as_str()).and_then(parse_u64);
        Ok(self.store.append(id, offset, content_length, body).await?)
    }

    /// 终止请求：删除会话的全部工件。
    pub async fn terminate(
        &self,
        id: &str,
        headers: &HeaderMap,
    ) -> Result<SessionState, ProtocolError> {
        self.admit(headers)?;
        Ok(self.store.abort(id).await?)
    }

    fn admit(&self, headers: &HeaderMap) -> Result<(), ProtocolError> {
        self.auth.verify(headers)?;
        if let Some(version) = header_str(headers, TUS_RESUMABLE_HEADER)
            && version != TUS_VERSION
        {
            return Err(ProtocolError::UnsupportedVersion);
        }
        Ok(())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
}

fn parse_u64(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

fn parse_upload_length(headers: &HeaderMap) -> Result<u64, ProtocolError> {
    header_str(headers, UPLOAD_LENGTH_HEADER)
        .and_then(parse_u64)
        .ok_or(ProtocolError::InvalidLength)
}

/// 解析 `key base64,key2 base64` 形式的 Upload-Metadata，值可省略。
pub fn parse_metadata(value: &str) -> Result<BTreeMap<String, String>, ProtocolError> {
    let mut metadata = BTreeMap::new();
    if value.trim().is_empty() {
        return Ok(metadata);
    }

    for pair in value.split(',') {
        let mut parts = pair.trim().splitn(2, ' ');
        let key = parts.next().unwrap_or_default();
        if key.is_empty() || !key.is_ascii() {
            return Err(ProtocolError::InvalidMetadata("empty or non-ascii key".into()));
        }
        let decoded = match parts.next().map(str::trim) {
            Some(encoded) if !encoded.is_empty() => {
                let bytes = general_purpose::STANDARD.decode(encoded).map_err(|err| {
                    ProtocolError::InvalidMetadata(format!("{key}: {err}"))
                })?;
                String::from_utf8(bytes)
                    .map_err(|_| ProtocolError::InvalidMetadata(format!("{key}: not utf-8")))?
            }
            _ => String::new(),
        };
        if metadata.insert(key.to_string(), decoded).is_some() {
            return Err(ProtocolError::InvalidMetadata(format!("duplicate key {key}")));
        }
    }

    Ok(metadata)
}
