//! TLS 证书加载与自签名生成。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::generate_simple_self_signed;
use std::net::IpAddr;

/// 构建 Rustls 配置；未提供证书时生成内存中的自签名证书。
pub async fn build_rustls_config(
    cert_path: Option<&str>,
    key_path: Option<&str>,
    host: IpAddr,
) -> Result<RustlsConfig, std::io::Error> {
    match (cert_path, key_path) {
        (Some(cert), Some(key)) => RustlsConfig::from_pem_file(cert, key).await,
        (None, None) => {
            let (cert, key) = self_signed_pem(host)?;
            tracing::info!(%host, "using generated self-signed certificate");
            RustlsConfig::from_pem(cert, key).await
        }
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "tls cert and key must be provided together",
        )),
    }
}

fn self_signed_pem(host: IpAddr) -> Result<(Vec<u8>, Vec<u8>), std::io::Error> {
    let mut names = vec!["localhost".to_string()];
    if !host.is_unspecified() {
        names.push(host.to_string());
    }
    let cert = generate_simple_self_signed(names)
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    Ok((
        cert.cert.pem().into_bytes(),
        cert.key_pair.serialize_pem().into_bytes(),
    ))
}
