use axum_server::tls_rustls::RustlsConfig;
use std::path::Path;

use crate::config::RelayConfig;

pub fn init() {
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("crypto provider was already installed");
    }
}

/// TLS is enabled when both the certificate and the key file exist.
pub async fn config(config: &RelayConfig) -> Option<RustlsConfig> {
    let (cert, key) = (Path::new(&config.tls_cert_file), Path::new(&config.tls_key_file));
    if !cert.exists() || !key.exists() {
        return None;
    }

    match RustlsConfig::from_pem_file(cert, key).await {
        Ok(tls) => Some(tls),
        Err(err) => {
            tracing::warn!("failed to load TLS certificate, falling back to http: {err}");
            None
        }
    }
}
