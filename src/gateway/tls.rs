//! TLS termination for the HTTPS listener

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, OnceLock};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::config::TlsConfig;
use crate::error::PortalError;

/// Build an acceptor from the configured PEM files
///
/// # Errors
///
/// Returns [`PortalError::Tls`] if either file is missing or holds no
/// usable certificate or key. Callers treat this as fatal at startup.
pub fn create_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, PortalError> {
    static CRYPTO_INIT: OnceLock<()> = OnceLock::new();
    CRYPTO_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });

    let certs = load_certs(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| PortalError::Tls(format!("invalid certificate/key pair: {e}")))?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    info!(cert = %config.cert_path.display(), "TLS material loaded");
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn open(path: &Path, what: &str) -> Result<BufReader<File>, PortalError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| PortalError::Tls(format!("cannot open {what} {}: {e}", path.display())))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, PortalError> {
    let mut reader = open(path, "certificate")?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PortalError::Tls(format!("failed to parse certificate {}: {e}", path.display())))?;

    if certs.is_empty() {
        return Err(PortalError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, PortalError> {
    let mut reader = open(path, "private key")?;

    if let Some(Ok(key)) = rustls_pemfile::pkcs8_private_keys(&mut reader).next() {
        return Ok(PrivateKeyDer::Pkcs8(key));
    }

    if reader.seek(SeekFrom::Start(0)).is_ok() {
        if let Some(Ok(key)) = rustls_pemfile::rsa_private_keys(&mut reader).next() {
            return Ok(PrivateKeyDer::Pkcs1(key));
        }
    }

    if reader.seek(SeekFrom::Start(0)).is_ok() {
        if let Some(Ok(key)) = rustls_pemfile::ec_private_keys(&mut reader).next() {
            return Ok(PrivateKeyDer::Sec1(key));
        }
    }

    Err(PortalError::Tls(format!(
        "no valid private key found in {}",
        path.display()
    )))
}
