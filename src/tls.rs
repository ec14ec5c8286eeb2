//! TLS material loading.
//!
//! Builds the client-auth TLS configuration for both transports from the
//! PEM files named in [`TlsOptions`]: a rustls client config for the
//! WebSocket event stream, and the certificate/identity pair consumed by
//! the HTTP channel builder.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use crate::error::{GridLinkError, Result};
use crate::options::TlsOptions;

/// TLS material shared by the unary channel and the event stream.
#[derive(Debug)]
pub(crate) struct TlsMaterial {
    /// Client config for WebSocket upgrades.
    pub ws_client_config: Arc<rustls::ClientConfig>,
    /// CA bundle for the HTTP channel.
    pub ca_certificate: reqwest::Certificate,
    /// Client identity for the HTTP channel.
    pub identity: reqwest::Identity,
}

/// Load TLS material when enabled; `None` for plaintext sessions.
pub(crate) fn load(options: &TlsOptions) -> Result<Option<TlsMaterial>> {
    if !options.enabled {
        return Ok(None);
    }
    options.validate()?;

    // validate() guarantees the paths are present.
    let ca_path = options.ca_cert_path.as_deref().expect("validated");
    let cert_path = options.client_cert_path.as_deref().expect("validated");
    let key_path = options.client_key_path.as_deref().expect("validated");

    let ca_pem = read_pem("tls.ca_cert_path", ca_path)?;
    let cert_pem = read_pem("tls.client_cert_path", cert_path)?;
    let key_pem = read_pem("tls.client_key_path", key_path)?;

    // rustls config for the event stream.
    let mut root_store = rustls::RootCertStore::empty();
    for cert in certs_from("tls.ca_cert_path", ca_path)? {
        root_store.add(cert).map_err(|e| {
            GridLinkError::BadConfig(format!("Invalid CA certificate '{}': {}", ca_path, e))
        })?;
    }

    let client_certs = certs_from("tls.client_cert_path", cert_path)?;
    let client_key = private_key_from(key_path)?;

    let rustls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_client_auth_cert(client_certs, client_key)
        .map_err(|e| {
            GridLinkError::BadConfig(format!("Failed to configure client TLS: {}", e))
        })?;

    // reqwest material for the unary channel.
    let ca_certificate = reqwest::Certificate::from_pem(&ca_pem).map_err(|e| {
        GridLinkError::BadConfig(format!("Invalid CA certificate '{}': {}", ca_path, e))
    })?;

    let mut identity_pem = cert_pem;
    identity_pem.extend_from_slice(&key_pem);
    let identity = reqwest::Identity::from_pem(&identity_pem).map_err(|e| {
        GridLinkError::BadConfig(format!("Invalid client identity '{}': {}", cert_path, e))
    })?;

    Ok(Some(TlsMaterial {
        ws_client_config: Arc::new(rustls_config),
        ca_certificate,
        identity,
    }))
}

fn read_pem(label: &str, path: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| GridLinkError::BadConfig(format!("Failed reading {} '{}': {}", label, path, e)))
}

fn certs_from(label: &str, path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| GridLinkError::BadConfig(format!("Failed reading {} '{}': {}", label, path, e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GridLinkError::BadConfig(format!("Invalid PEM in '{}': {}", path, e)))?;
    if certs.is_empty() {
        return Err(GridLinkError::BadConfig(format!(
            "No certificates found in '{}'",
            path
        )));
    }
    Ok(certs)
}

fn private_key_from(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        GridLinkError::BadConfig(format!("Failed reading tls.client_key_path '{}': {}", path, e))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| GridLinkError::BadConfig(format!("Invalid PEM in '{}': {}", path, e)))?
        .ok_or_else(|| GridLinkError::BadConfig(format!("No private key found in '{}'", path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_loads_nothing() {
        let material = load(&TlsOptions::default()).unwrap();
        assert!(material.is_none());
    }

    #[test]
    fn test_missing_path_fails() {
        let options = TlsOptions::new()
            .with_enabled(true)
            .with_client_cert_path("/tmp/cert.pem")
            .with_client_key_path("/tmp/key.pem");
        let err = load(&options).unwrap_err();
        assert!(matches!(err, GridLinkError::BadConfig(_)));
    }
}
