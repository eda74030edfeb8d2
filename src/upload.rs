//! tus 上传接口的 axum 适配层。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use std::io;
use std::sync::Arc;

use crate::config::UPLOAD_PATH;
use crate::http::{RequestScheme, public_url};
use crate::protocol::UploadProtocol;
use crate::router::{self, ProtocolRequest, ProtocolResponse};

/// 上传集合（创建、能力探测）。
pub async fn upload_collection(
    Extension(protocol): Extension<Arc<UploadProtocol>>,
    Extension(scheme): Extension<RequestScheme>,
    request: Request<AxumBody>,
) -> Response {
    dispatch(&protocol, scheme, None, request).await
}

/// 单个上传资源（查询、追加、终止）。
pub async fn upload_resource(
    Path(upload_id): Path<String>,
    Extension(protocol): Extension<Arc<UploadProtocol>>,
    Extension(scheme): Extension<RequestScheme>,
    request: Request<AxumBody>,
) -> Response {
    dispatch(&protocol, scheme, Some(upload_id), request).await
}

async fn dispatch(
    protocol: &UploadProtocol,
    scheme: RequestScheme,
    upload_id: Option<String>,
    request: Request<AxumBody>,
) -> Response {
    let (parts, body) = request.into_parts();
    let location_base = public_url(&parts.headers, scheme, UPLOAD_PATH);
    let body = BodyExt::into_data_stream(body).map(|chunk| chunk.map_err(io::Error::other));

    let response = router::handle(
        protocol,
        &location_base,
        ProtocolRequest {
            method: parts.method,
            upload_id,
            headers: parts.headers,
            body,
        },
    )
    .await;
    into_response(response)
}

fn into_response(response: ProtocolResponse) -> Response {
    let ProtocolResponse {
        status,
        headers,
        body,
    } = response;
    if body.is_empty() {
        return (status, headers).into_response();
    }
    (status, headers, body).into_response()
}
