//! TLS setup for the signaling socket

use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::{
    self,
    pki_types::{CertificateDer, PrivateKeyDer},
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::ServerError;

/// Load TLS certificates
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ServerError::Tls(format!("No certificates in {}", path.display())));
    }
    Ok(certs)
}

/// Load TLS private key
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| ServerError::Tls(format!("No private key in {}", path.display())))
}

pub fn acceptor(certfile: &Path, keyfile: &Path) -> Result<TlsAcceptor, ServerError> {
    let certs = load_certs(certfile)?;
    let key = load_key(keyfile)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client connector trusting only the given root certificate
pub fn connector(ca_certfile: &Path) -> Result<TlsConnector, ServerError> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(ca_certfile)? {
        roots
            .add(cert)
            .map_err(|e| ServerError::Tls(e.to_string()))?;
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}
