use anyhow::{Context, anyhow};
use rustls::pki_types::pem::PemObject;
use std::{fs, sync::Arc};

pub fn init() -> anyhow::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install default crypto provider"))?;
    Ok(())
}

fn read_ca_cert(cert_path: &str) -> anyhow::Result<Vec<u8>> {
    fs::read(cert_path)
        .with_context(|| format!("failed to read CA certificate at path: {}", cert_path))
}

/// Websocket TLS config trusting only the given CA. `None` leaves the native
/// roots to tokio-tungstenite.
pub fn client_config(
    ca_cert_path: &Option<String>,
) -> anyhow::Result<Option<Arc<rustls::ClientConfig>>> {
    let Some(cert_path) = ca_cert_path.as_ref() else {
        return Ok(None);
    };

    let ca_cert = read_ca_cert(cert_path)?;
    let pem = rustls::pki_types::CertificateDer::from_pem_slice(&ca_cert)
        .context("CA certificate is not valid PEM")?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store
        .add(pem)
        .context("failed to add CA certificate to RootCertStore")?;

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(Some(Arc::new(config)))
}

/// HTTP client used for body transfers with the relay and for calling the target.
pub fn http_client(ca_cert_path: &Option<String>) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().use_rustls_tls();
    if let Some(cert_path) = ca_cert_path.as_ref() {
        let certificate = reqwest::Certificate::from_pem(&read_ca_cert(cert_path)?)
            .context("CA certificate is not valid PEM")?;
        builder = builder.add_root_certificate(certificate);
    }
    builder
        .build()
        .context("failed to build reqwest http client")
}
