//! Mutual-TLS configuration built from PEM files.
//!
//! Both sides trust exactly one CA. The server demands a client certificate
//! signed by it; the client verifies the server certificate against it.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsFiles;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Reads every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse certificates in {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates in {}", path.display());
    Ok(certs)
}

/// Reads the first private key from a PEM file.
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("parse private key in {}", path.display()))?
        .with_context(|| format!("no private key in {}", path.display()))
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .with_context(|| format!("add CA certificate from {}", path.display()))?;
    }
    Ok(roots)
}

/// Builds an acceptor that requires CA-signed client certificates.
pub fn acceptor(files: &TlsFiles) -> Result<TlsAcceptor> {
    let roots = load_roots(&files.ca)?;
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
        .build()
        .context("build client certificate verifier")?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("select TLS protocol versions")?
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(&files.cert)?, load_key(&files.key)?)
        .context("install server certificate")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Builds a connector presenting the client certificate.
pub fn connector(files: &TlsFiles) -> Result<TlsConnector> {
    let roots = load_roots(&files.ca)?;

    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("select TLS protocol versions")?
        .with_root_certificates(roots)
        .with_client_auth_cert(load_certs(&files.cert)?, load_key(&files.key)?)
        .context("install client certificate")?;

    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_are_reported_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let files = TlsFiles::client(dir.path());
        let Err(err) = connector(&files) else {
            panic!("connector built without TLS material");
        };
        assert!(format!("{err:#}").contains("ca.cert.pem"));
    }

    #[test]
    fn empty_pem_has_no_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.cert.pem");
        std::fs::write(&path, "not a pem file\n").unwrap();
        let err = load_certs(&path).unwrap_err();
        assert!(err.to_string().contains("no certificates"));
    }

    #[test]
    fn empty_pem_has_no_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.key.pem");
        std::fs::write(&path, "").unwrap();
        let err = load_key(&path).unwrap_err();
        assert!(err.to_string().contains("no private key"));
    }
}
