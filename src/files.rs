//! 已完成文件的列表与下载处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::fmt_http_date;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::storage::{FileRecord, Storage, StorageError, is_artifact_name};

/// 列出已完成的文件，最新的在前。
pub async fn list_files(
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<Vec<FileRecord>>, ApiError> {
    let files = match storage.list_files().await {
        Ok(files) => files,
        Err(StorageError::Io(err)) if err.kind() == ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err.into()),
    };
    debug!(count = files.len(), "list files");
    Ok(JsonResponse(files))
}

/// 以附件形式下载单个已完成文件。
pub async fn download_file(
    Path(name): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    if name.is_empty() || is_artifact_name(&name) {
        return Err(ApiError::NotFound("file not found".into()));
    }
    let target = storage.resolve_path_checked(&name, false).await?;
    let metadata = fs::metadata(&target).await.map_err(StorageError::from)?;
    if !metadata.is_file() {
        return Err(ApiError::NotFound("file not found".into()));
    }
    let file_size = metadata.len();
    let mime = mime_guess::from_path(&name).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    response_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(file_size),
    );
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition(&name))
            .map_err(|_| ApiError::Internal("failed to build response headers".into()))?,
    );
    if let Ok(modified) = metadata.modified() {
        response_headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(modified))
                .map_err(|_| ApiError::Internal("failed to build response headers".into()))?,
        );
    }

    let file = File::open(&target).await.map_err(StorageError::from)?;
    info!(name, size = file_size, "download file");
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// `attachment` 头：ASCII 回退名加 RFC 5987 编码的原始名。
fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            ch if ch.is_ascii() && !ch.is_ascii_control() => ch,
            _ => '_',
        })
        .collect();
    if fallback == name {
        return format!("attachment; filename=\"{fallback}\"");
    }
    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        utf8_percent_encode(name, NON_ALPHANUMERIC)
    )
}
