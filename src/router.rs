//! 与 Web 框架无关的协议请求分发与状态码映射。

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use futures_util::stream::Stream;
use std::io;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    ProtocolError, TUS_EXTENSION_HEADER, TUS_EXTENSIONS, TUS_MAX_SIZE_HEADER,
    TUS_RESUMABLE_HEADER, TUS_VERSION, TUS_VERSION_HEADER, UPLOAD_LENGTH_HEADER,
    UPLOAD_OFFSET_HEADER, UploadProtocol,
};
use crate::store::{SessionState, StoreError};

/// Inbound protocol request, independent of the HTTP framework.
pub struct ProtocolRequest<S> {
    pub method: Method,
    pub upload_id: Option<String>,
    pub headers: HeaderMap,
    pub body: S,
}

/// Outbound protocol response.
#[derive(Debug)]
pub struct ProtocolResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl ProtocolResponse {
    fn new(status: StatusCode) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(TUS_RESUMABLE_HEADER),
            HeaderValue::from_static(TUS_VERSION),
        );
        Self {
            status,
            headers,
            body: String::new(),
        }
    }

    fn with_header(mut self, name: &'static str, value: impl ToString) -> Self {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            self.headers.insert(HeaderName::from_static(name), value);
        }
        self
    }

    fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    #[cfg(test)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// 按方法与路径形态分发请求；`location_base` 为上传集合的外部 URL。
pub async fn handle<S>(
    protocol: &UploadProtocol,
    location_base: &str,
    request: ProtocolRequest<S>,
) -> ProtocolResponse
where
    S: Stream<Item = Result<Bytes, io::Error>> + Unpin,
{
    let ProtocolRequest {
        method,
        upload_id,
        headers,
        body,
    } = request;

    let result = match (&method, upload_id.as_deref()) {
        (&Method::OPTIONS, _) => Ok(capabilities(protocol)),
        (&Method::POST, None) => create(protocol, location_base, &headers).await,
        (&Method::HEAD, Some(id)) => query(protocol, id, &headers).await,
        (&Method::PATCH, Some(id)) => append(protocol, id, &headers, body).await,
        (&Method::DELETE, Some(id)) => terminate(protocol, id, &headers).await,
        _ => Ok(ProtocolResponse::new(StatusCode::METHOD_NOT_ALLOWED)
            .with_body("method not allowed")),
    };

    let response = result.unwrap_or_else(|err| error_response(&method, upload_id.as_deref(), err));
    if method == Method::HEAD {
        return ProtocolResponse {
            body: String::new(),
            ..response
        };
    }
    response
}

fn capabilities(protocol: &UploadProtocol) -> ProtocolResponse {
    let response = ProtocolResponse::new(StatusCode::NO_CONTENT)
        .with_header(TUS_VERSION_HEADER, TUS_VERSION)
        .with_header(TUS_EXTENSION_HEADER, TUS_EXTENSIONS);
    match protocol.max_size() {
        0 => response,
        max => response.with_header(TUS_MAX_SIZE_HEADER, max),
    }
}

async fn create(
    protocol: &UploadProtocol,
    location_base: &str,
    headers: &HeaderMap,
) -> Result<ProtocolResponse, ProtocolError> {
    let session = protocol.create(headers).await?;
    let location = format!("{}/{}", location_base.trim_end_matches('/'), session.id);
    Ok(ProtocolResponse::new(StatusCode::CREATED)
        .with_header("location", location)
        .with_header(UPLOAD_OFFSET_HEADER, session.offset))
}

async fn query(
    protocol: &UploadProtocol,
    id: &str,
    headers: &HeaderMap,
) -> Result<ProtocolResponse, ProtocolError> {
    let report = protocol.query(id, headers).await?;
    debug!(upload_id = id, state = ?report.state, offset = report.offset, "upload offset query");
    Ok(ProtocolResponse::new(StatusCode::OK)
        .with_header(UPLOAD_OFFSET_HEADER, report.offset)
        .with_header(UPLOAD_LENGTH_HEADER, report.length)
        .with_header("cache-control", "no-store"))
}

async fn append<S>(
    protocol: &UploadProtocol,
    id: &str,
    headers: &HeaderMap,
    body: S,
) -> Result<ProtocolResponse, ProtocolError>
where
    S: Stream<Item = Result<Bytes, io::Error>> + Unpin,
{
    let session = protocol.append(id, headers, body).await?;
    if session.state() == SessionState::Completed {
        info!(upload_id = id, final_name = session.final_name, "upload finished");
    }
    Ok(ProtocolResponse::new(StatusCode::NO_CONTENT).with_header(UPLOAD_OFFSET_HEADER, session.offset))
}

async fn terminate(
    protocol: &UploadProtocol,
    id: &str,
    headers: &HeaderMap,
) -> Result<ProtocolResponse, ProtocolError> {
    protocol.terminate(id, headers).await?;
    Ok(ProtocolResponse::new(StatusCode::NO_CONTENT))
}

fn error_response(method: &Method, upload_id: Option<&str>, err: ProtocolError) -> ProtocolResponse {
    let status = match &err {
        ProtocolError::Unauthorized => StatusCode::UNAUTHORIZED,
        ProtocolError::InvalidLength
        | ProtocolError::InvalidOffset
        | ProtocolError::InvalidMetadata(_) => StatusCode::BAD_REQUEST,
        ProtocolError::UnsupportedVersion => StatusCode::PRECONDITION_FAILED,
        ProtocolError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ProtocolError::Store(store) => match store {
            StoreError::NotFound => StatusCode::NOT_FOUND,
            StoreError::OffsetConflict { .. } => StatusCode::CONFLICT,
            StoreError::InvalidPath
            | StoreError::LengthExceeded
            | StoreError::Interrupted(_) => StatusCode::BAD_REQUEST,
            StoreError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            StoreError::Busy => StatusCode::LOCKED,
            StoreError::Stalled => StatusCode::REQUEST_TIMEOUT,
            StoreError::Corrupt(_) | StoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        },
    };

    let upload_id = upload_id.unwrap_or_default();
    if status.is_server_error() {
        error!(%method, upload_id, error = %err, "upload request failed");
    } else if status == StatusCode::UNAUTHORIZED {
        warn!(%method, upload_id, "upload request rejected: unauthorized");
    }

    let response = ProtocolResponse::new(status).with_body(err.to_string());
    match err {
        ProtocolError::Store(StoreError::OffsetConflict { current }) => {
            response.with_header(UPLOAD_OFFSET_HEADER, current)
        }
        ProtocolError::UnsupportedVersion => response.with_header(TUS_VERSION_HEADER, TUS_VERSION),
        _ => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{PASSWORD_HEADER, UploadAuth};
    use crate::protocol::UPLOAD_METADATA_HEADER;
    use crate::storage::Storage;
    use crate::store::{StoreConfig, UploadStore};
    use futures_util::stream::{self, BoxStream, StreamExt};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    const SECRET: &str = "letmein";
    const BASE: &str = "http://files.test/api/upload";

    struct Harness {
        _temp: tempfile::TempDir,
        storage: Arc<Storage>,
        protocol: Arc<UploadProtocol>,
    }

    fn harness(secret: Option<&str>) -> Harness {
        harness_with(
            secret,
            StoreConfig {
                max_size: 10 * 1024,
                lock_wait: Duration::from_secs(5),
                chunk_idle: Duration::from_secs(5),
            },
        )
    }

    fn harness_with(secret: Option<&str>, config: StoreConfig) -> Harness {
        let temp = tempdir().expect("tempdir");
        let storage = Arc::new(Storage::new(temp.path().join("uploads")));
        std::fs::create_dir_all(storage.root_path()).expect("create root");
        let store = Arc::new(UploadStore::new(storage.clone(), config));
        let protocol = Arc::new(UploadProtocol::new(
            store,
            UploadAuth::new(secret.map(str::to_string)),
        ));
        Harness {
            _temp: temp,
            storage,
            protocol,
        }
    }

    fn request(
        method: Method,
        upload_id: Option<&str>,
        headers: &[(&'static str, String)],
        body: Vec<u8>,
    ) -> ProtocolRequest<BoxStream<'static, Result<Bytes, io::Error>>> {
        let mut map = HeaderMap::new();
        map.insert(PASSWORD_HEADER, HeaderValue::from_static(SECRET));
        map.insert(TUS_RESUMABLE_HEADER, HeaderValue::from_static(TUS_VERSION));
        for (name, value) in headers {
            map.insert(*name, HeaderValue::from_str(value).expect("header value"));
        }
        ProtocolRequest {
            method,
            upload_id: upload_id.map(str::to_string),
            headers: map,
            body: stream::iter(vec![Ok(Bytes::from(body))]).boxed(),
        }
    }

    async fn create(h: &Harness, length: u64, filename: &str) -> String {
        let metadata = format!(
            "filename {}",
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, filename)
        );
        let response = handle(
            &h.protocol,
            BASE,
            request(
                Method::POST,
                None,
                &[
                    (UPLOAD_LENGTH_HEADER, length.to_string()),
                    (UPLOAD_METADATA_HEADER, metadata),
                ],
                Vec::new(),
            ),
        )
        .await;
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.header(UPLOAD_OFFSET_HEADER), Some("0"));
        let location = response.header("location").expect("location");
        location
            .strip_prefix(&format!("{BASE}/"))
            .expect("location under base")
            .to_string()
    }

    async fn patch(h: &Harness, id: &str, offset: u64, data: Vec<u8>) -> ProtocolResponse {
        let len = data.len().to_string();
        handle(
            &h.protocol,
            BASE,
            request(
                Method::PATCH,
                Some(id),
                &[
                    (UPLOAD_OFFSET_HEADER, offset.to_string()),
                    ("content-type", "application/offset+octet-stream".into()),
                    ("content-length", len),
                ],
                data,
            ),
        )
        .await
    }

    async fn head(h: &Harness, id: &str) -> ProtocolResponse {
        handle(&h.protocol, BASE, request(Method::HEAD, Some(id), &[], Vec::new())).await
    }

    #[tokio::test]
    async fn resumable_upload_walkthrough() {
        let h = harness(Some(SECRET));
        let id = create(&h, 300, "a.bin").await;

        let first = patch(&h, &id, 0, vec![1; 100]).await;
        assert_eq!(first.status, StatusCode::NO_CONTENT);
        assert_eq!(first.header(UPLOAD_OFFSET_HEADER), Some("100"));

        let replay = patch(&h, &id, 0, vec![1; 100]).await;
        assert_eq!(replay.status, StatusCode::CONFLICT);
        assert_eq!(replay.header(UPLOAD_OFFSET_HEADER), Some("100"));

        let too_long = patch(&h, &id, 100, vec![2; 250]).await;
        assert_eq!(too_long.status, StatusCode::BAD_REQUEST);

        let state = head(&h, &id).await;
        assert_eq!(state.status, StatusCode::OK);
        assert_eq!(state.header(UPLOAD_OFFSET_HEADER), Some("100"));
        assert_eq!(state.header(UPLOAD_LENGTH_HEADER), Some("300"));
        assert_eq!(state.header("cache-control"), Some("no-store"));
        assert!(state.body.is_empty());

        let last = patch(&h, &id, 100, vec![2; 200]).await;
        assert_eq!(last.status, StatusCode::NO_CONTENT);
        assert_eq!(last.header(UPLOAD_OFFSET_HEADER), Some("300"));

        assert_eq!(head(&h, &id).await.status, StatusCode::NOT_FOUND);
        assert_eq!(patch(&h, &id, 300, vec![0]).await.status, StatusCode::NOT_FOUND);

        let files = h.storage.list_files().await.expect("list");
        assert_eq!(files.len(), 1);
        assert!(files[0].name.ends_with("-a.bin"));
        assert_eq!(files[0].size, 300);
    }

    #[tokio::test]
    async fn every_response_carries_tus_resumable() {
        let h = harness(Some(SECRET));
        let response = head(&h, "00000000-0000-0000-0000-000000000000").await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.header(TUS_RESUMABLE_HEADER), Some(TUS_VERSION));
    }

    #[tokio::test]
    async fn missing_or_wrong_credential_creates_nothing() {
        for secret in [Some(SECRET), None] {
            let h = harness(secret);
            let mut unauthenticated = request(
                Method::POST,
                None,
                &[(UPLOAD_LENGTH_HEADER, "10".into())],
                Vec::new(),
            );
            unauthenticated
                .headers
                .insert(PASSWORD_HEADER, HeaderValue::from_static("wrong"));
            let response = handle(&h.protocol, BASE, unauthenticated).await;
            assert_eq!(response.status, StatusCode::UNAUTHORIZED);

            let mut anonymous = request(
                Method::POST,
                None,
                &[(UPLOAD_LENGTH_HEADER, "10".into())],
                Vec::new(),
            );
            anonymous.headers.remove(PASSWORD_HEADER);
            let response = handle(&h.protocol, BASE, anonymous).await;
            assert_eq!(response.status, StatusCode::UNAUTHORIZED);

            let entries = std::fs::read_dir(h.storage.root_path())
                .expect("read")
                .count();
            assert_eq!(entries, 0, "no artifacts may be created");
        }
    }

    #[tokio::test]
    async fn append_with_wrong_credential_is_unauthorized() {
        let h = harness(Some(SECRET));
        let id = create(&h, 10, "a.bin").await;
        let mut req = request(
            Method::PATCH,
            Some(&id),
            &[(UPLOAD_OFFSET_HEADER, "0".into())],
            vec![1; 5],
        );
        req.headers
            .insert(PASSWORD_HEADER, HeaderValue::from_static("nope"));
        let response = handle(&h.protocol, BASE, req).await;
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(head(&h, &id).await.header(UPLOAD_OFFSET_HEADER), Some("0"));
    }

    #[tokio::test]
    async fn invalid_length_and_oversize_are_client_errors() {
        let h = harness(Some(SECRET));
        let negative = handle(
            &h.protocol,
            BASE,
            request(
                Method::POST,
                None,
                &[(UPLOAD_LENGTH_HEADER, "-1".into())],
                Vec::new(),
            ),
        )
        .await;
        assert_eq!(negative.status, StatusCode::BAD_REQUEST);

        let oversized = handle(
            &h.protocol,
            BASE,
            request(
                Method::POST,
                None,
                &[(UPLOAD_LENGTH_HEADER, (20 * 1024).to_string())],
                Vec::new(),
            ),
        )
        .await;
        assert_eq!(oversized.status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn terminate_removes_upload() {
        let h = harness(Some(SECRET));
        let id = create(&h, 10, "a.bin").await;
        patch(&h, &id, 0, vec![1; 3]).await;

        let response = handle(
            &h.protocol,
            BASE,
            request(Method::DELETE, Some(&id), &[], Vec::new()),
        )
        .await;
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert_eq!(head(&h, &id).await.status, StatusCode::NOT_FOUND);

        let again = handle(
            &h.protocol,
            BASE,
            request(Method::DELETE, Some(&id), &[], Vec::new()),
        )
        .await;
        assert_eq!(again.status, StatusCode::NOT_FOUND);
        let entries = std::fs::read_dir(h.storage.root_path())
            .expect("read")
            .count();
        assert_eq!(entries, 0);
    }

    #[tokio::test]
    async fn options_advertises_capabilities_without_auth() {
        let h = harness(Some(SECRET));
        let mut req = request(Method::OPTIONS, None, &[], Vec::new());
        req.headers.clear();
        let response = handle(&h.protocol, BASE, req).await;
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert_eq!(response.header(TUS_VERSION_HEADER), Some(TUS_VERSION));
        assert_eq!(response.header(TUS_EXTENSION_HEADER), Some(TUS_EXTENSIONS));
        assert_eq!(response.header(TUS_MAX_SIZE_HEADER), Some("10240"));
    }

    #[tokio::test]
    async fn unsupported_method_or_shape_is_405() {
        let h = harness(Some(SECRET));
        let patch_collection = handle(
            &h.protocol,
            BASE,
            request(Method::PATCH, None, &[], Vec::new()),
        )
        .await;
        assert_eq!(patch_collection.status, StatusCode::METHOD_NOT_ALLOWED);

        let get_resource = handle(
            &h.protocol,
            BASE,
            request(Method::GET, Some("x"), &[], Vec::new()),
        )
        .await;
        assert_eq!(get_resource.status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn wrong_version_returns_412_with_supported_version() {
        let h = harness(Some(SECRET));
        let mut req = request(
            Method::POST,
            None,
            &[(UPLOAD_LENGTH_HEADER, "10".into())],
            Vec::new(),
        );
        req.headers
            .insert(TUS_RESUMABLE_HEADER, HeaderValue::from_static("0.2.2"));
        let response = handle(&h.protocol, BASE, req).await;
        assert_eq!(response.status, StatusCode::PRECONDITION_FAILED);
        assert_eq!(response.header(TUS_VERSION_HEADER), Some(TUS_VERSION));
    }

    fn hanging_patch(
        id: &str,
        offset: u64,
    ) -> ProtocolRequest<BoxStream<'static, Result<Bytes, io::Error>>> {
        let mut request = request(
            Method::PATCH,
            Some(id),
            &[
                (UPLOAD_OFFSET_HEADER, offset.to_string()),
                ("content-type", "application/offset+octet-stream".into()),
            ],
            Vec::new(),
        );
        request.body = stream::iter(vec![Ok(Bytes::from_static(b"abc"))])
            .chain(stream::pending())
            .boxed();
        request
    }

    #[tokio::test]
    async fn locked_upload_returns_423_without_offset() {
        let h = harness_with(
            Some(SECRET),
            StoreConfig {
                max_size: 10 * 1024,
                lock_wait: Duration::from_millis(50),
                chunk_idle: Duration::from_secs(30),
            },
        );
        let id = create(&h, 10, "a.bin").await;

        let holder = {
            let protocol = h.protocol.clone();
            let id = id.clone();
            tokio::spawn(async move { handle(&protocol, BASE, hanging_patch(&id, 0)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let busy_head = head(&h, &id).await;
        assert_eq!(busy_head.status, StatusCode::LOCKED);
        assert_eq!(busy_head.header(UPLOAD_OFFSET_HEADER), None);
        let busy_patch = patch(&h, &id, 0, vec![1; 3]).await;
        assert_eq!(busy_patch.status, StatusCode::LOCKED);
        assert_eq!(busy_patch.header(UPLOAD_OFFSET_HEADER), None);

        holder.abort();
        let _ = holder.await;
        let state = head(&h, &id).await;
        assert_eq!(state.status, StatusCode::OK);
        assert_eq!(state.header(UPLOAD_OFFSET_HEADER), Some("0"));
    }

    #[tokio::test]
    async fn stalled_chunk_returns_408_and_keeps_offset() {
        let h = harness_with(
            Some(SECRET),
            StoreConfig {
                max_size: 10 * 1024,
                lock_wait: Duration::from_secs(5),
                chunk_idle: Duration::from_millis(50),
            },
        );
        let id = create(&h, 10, "a.bin").await;

        let stalled = handle(&h.protocol, BASE, hanging_patch(&id, 0)).await;
        assert_eq!(stalled.status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(stalled.header(UPLOAD_OFFSET_HEADER), None);

        let state = head(&h, &id).await;
        assert_eq!(state.header(UPLOAD_OFFSET_HEADER), Some("0"));
    }
}
