//! TLS acceptor construction.

use crate::config::TlsConfig;
use crate::error::ServerError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{danger::ClientCertVerifier, WebPkiClientVerifier};
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Builds an acceptor from the configured certificate, key and optional
/// client CA.
pub fn build_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, ServerError> {
    let cert_path = config
        .cert_path
        .as_deref()
        .ok_or_else(|| tls_error("cert_path not set"))?;
    let key_path = config
        .key_path
        .as_deref()
        .ok_or_else(|| tls_error("key_path not set"))?;
    let client_ca = match (config.require_client_cert, config.client_ca_path.as_deref()) {
        (true, None) => return Err(tls_error("client_ca_path not set for mTLS")),
        (true, Some(path)) => Some(path),
        (false, _) => None,
    };

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let builder = rustls::ServerConfig::builder();
    let server_config = match client_ca {
        Some(path) => builder.with_client_cert_verifier(client_verifier(path)?),
        None => builder.with_no_client_auth(),
    }
    .with_single_cert(certs, key)
    .map_err(|e| tls_error(format!("invalid server cert/key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn client_verifier(ca_path: &Path) -> Result<Arc<dyn ClientCertVerifier>, ServerError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots
            .add(cert)
            .map_err(|e| tls_error(format!("invalid client CA cert: {}", e)))?;
    }
    WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| tls_error(format!("failed to build client verifier: {}", e)))
}

fn open(path: &Path, what: &str) -> Result<BufReader<File>, ServerError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| tls_error(format!("cannot open {} file {:?}: {}", what, path, e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let mut reader = open(path, "cert")?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("invalid cert file {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(tls_error(format!("no certificates found in {:?}", path)));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let mut reader = open(path, "key")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| tls_error(format!("invalid key file {:?}: {}", path, e)))?
        .ok_or_else(|| tls_error(format!("no private key found in {:?}", path)))
}

fn tls_error(message: impl Into<String>) -> ServerError {
    ServerError::TlsConfig(message.into())
}
