//! TLS acceptor construction
//!
//! Certificates come from PEM files named in the settings. The acceptor is
//! built once at startup and shared; STARTTLS and the implicit-TLS listener
//! use the same one.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Install the process-wide rustls crypto provider. Callers may race to do
/// this, so an already-installed provider is not an error.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Build a TLS acceptor from a PEM certificate chain and private key.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    install_crypto_provider();
    let certs = rustls_pemfile::certs(&mut pem_reader(cert_path)?)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Tls(format!("Invalid certificate {}: {e}", cert_path.display())))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "No certificates in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut pem_reader(key_path)?)
        .map_err(|e| Error::Tls(format!("Invalid key {}: {e}", key_path.display())))?
        .ok_or_else(|| Error::Tls(format!("No private key in {}", key_path.display())))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn pem_reader(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::Config(format!("Cannot open {}: {e}", path.display())))
}
