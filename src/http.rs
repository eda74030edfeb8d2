//! HTTP 辅助工具：请求方案识别、上传地址、CORS 与安全头。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, header};
use axum::{middleware, response::Response};
use std::net::IpAddr;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

use crate::auth::PASSWORD_HEADER;
use crate::protocol::{
    TUS_EXTENSION_HEADER, TUS_MAX_SIZE_HEADER, TUS_RESUMABLE_HEADER, TUS_VERSION_HEADER,
    UPLOAD_LENGTH_HEADER, UPLOAD_METADATA_HEADER, UPLOAD_OFFSET_HEADER,
};

#[derive(Clone, Copy, Debug)]
pub enum RequestScheme {
    Http,
    Https,
}

impl RequestScheme {
    /// 判断请求是否为 HTTPS。
    pub fn is_https(self) -> bool {
        matches!(self, RequestScheme::Https)
    }
}

/// 构建 CORS Layer（支持逗号分隔的来源列表），放行 tus 协议头。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins = cors_origins?
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return None;
    }

    let tus_headers = [
        TUS_RESUMABLE_HEADER,
        TUS_VERSION_HEADER,
        TUS_EXTENSION_HEADER,
        TUS_MAX_SIZE_HEADER,
        UPLOAD_LENGTH_HEADER,
        UPLOAD_OFFSET_HEADER,
        UPLOAD_METADATA_HEADER,
    ]
    .map(HeaderName::from_static);

    let mut allow_headers = tus_headers.to_vec();
    allow_headers.extend([
        HeaderName::from_static(PASSWORD_HEADER),
        header::CONTENT_TYPE,
        HeaderName::from_static("x-http-method-override"),
        HeaderName::from_static("x-requested-with"),
    ]);
    let mut expose_headers = tus_headers.to_vec();
    expose_headers.push(header::LOCATION);

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([
                Method::GET,
                Method::HEAD,
                Method::POST,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers(allow_headers)
            .expose_headers(expose_headers)
            .allow_credentials(true),
    )
}

/// 从 `x-forwarded-for` 解析客户端 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<IpAddr>().ok())
}

/// 判断请求是否为 HTTPS（含反向代理头）。
pub fn is_https_request(headers: &HeaderMap, scheme: RequestScheme) -> bool {
    if let Some(value) = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
    {
        return value.eq_ignore_ascii_case("https");
    }
    scheme.is_https()
}

/// 计算对外可见的资源地址；缺少 Host 时退化为相对路径。
pub fn public_url(headers: &HeaderMap, scheme: RequestScheme, path: &str) -> String {
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty() && !value.contains(['/', '\\', '@']));

    match host {
        Some(host) => {
            let proto = if is_https_request(headers, scheme) {
                "https"
            } else {
                "http"
            };
            format!("{proto}://{host}{path}")
        }
        None => path.to_string(),
    }
}

/// 添加基础安全响应头。
pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}
