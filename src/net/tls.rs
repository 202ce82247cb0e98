//! TLS setup for the lobby server

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use super::error::NetworkError;

/// Load TLS certificates from PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, NetworkError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;

    if certs.is_empty() {
        return Err(NetworkError::Tls(format!("no certificates in {:?}", path)));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#1, PKCS#8 or SEC1) from PEM file
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, NetworkError> {
    let mut reader = BufReader::new(File::open(path)?);

    for item in rustls_pemfile::read_all(&mut reader) {
        match item? {
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }

    Err(NetworkError::Tls(format!("no private key in {:?}", path)))
}

/// Create TLS acceptor from certificate and key files
pub fn create_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, NetworkError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_are_io_errors() {
        let path = std::env::temp_dir().join("pairup-no-such-cert.pem");
        assert!(matches!(load_certs(&path), Err(NetworkError::Io(_))));
        assert!(matches!(load_key(&path), Err(NetworkError::Io(_))));
    }

    #[test]
    fn test_pem_without_key() {
        let path = std::env::temp_dir().join("pairup-empty-key.pem");
        std::fs::write(&path, "not a pem file\n").unwrap();
        assert!(matches!(load_key(&path), Err(NetworkError::Tls(_))));
        let _ = std::fs::remove_file(&path);
    }
}
