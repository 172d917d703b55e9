//! TLS setup for the signaling channel

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::rustls::{
    self,
    pki_types::{CertificateDer, PrivateKeyDer},
    RootCertStore,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsFiles;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("No certificates found in {0}")]
    NoCertificates(PathBuf),
    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Load PEM certificates
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Load a PEM private key
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Acceptor for the relay listener
pub fn server_acceptor(files: &TlsFiles) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(&files.certfile)?;
    let key = load_key(&files.keyfile)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Connector trusting the bundled web roots plus an optional extra CA
pub fn client_connector(ca_certfile: Option<&Path>) -> Result<TlsConnector, TlsError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(path) = ca_certfile {
        for cert in load_certs(path)? {
            roots.add(cert)?;
        }
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_file(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("duocall-{}.pem", Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_missing_cert_file() {
        let result = load_certs(Path::new("/nonexistent/duocall/server.crt"));
        assert!(matches!(result, Err(TlsError::Io(_))));
    }

    #[test]
    fn test_file_without_pem_blocks() {
        let path = temp_file("not a certificate\n");

        assert!(matches!(load_certs(&path), Err(TlsError::NoCertificates(_))));
        assert!(matches!(load_key(&path), Err(TlsError::NoPrivateKey(_))));

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_client_connector_with_web_roots() {
        assert!(client_connector(None).is_ok());
    }
}
