//! TLS 证书加载：同时提供证书与私钥时启用 HTTPS。

use axum_server::tls_rustls::RustlsConfig;
use std::io;
use tokio::fs;
use tracing::info;

use crate::config::Args;

/// 构建 Rustls 配置；未配置证书时返回 `None`，以纯 HTTP 运行。
pub async fn build_rustls_config(args: &Args) -> io::Result<Option<RustlsConfig>> {
    let (cert_path, key_path) = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => (cert, key),
        (None, None) => return Ok(None),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tls cert and key must be provided together",
            ));
        }
    };

    let cert = fs::read(cert_path).await?;
    let key = fs::read(key_path).await?;
    info!(cert = cert_path, "tls enabled");
    RustlsConfig::from_pem(cert, key).await.map(Some)
}
