use std::fs;
use std::io;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {kind} from '{path}': {source}")]
    Read {
        kind: &'static str,
        path: String,
        source: io::Error,
    },
    #[error("'{0}' contains no PEM certificates")]
    NoCertificates(String),
    #[error("'{0}' contains no PEM private key")]
    NoPrivateKey(String),
    #[error("invalid serving certificate: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Builds the server side of the webhook listener from the mounted
/// certificate chain and key.
pub fn load_tls_config(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = read_certificates(cert_path)?;
    let key = read_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

fn read_certificates(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let read_err = |source| TlsError::Read {
        kind: "certificate chain",
        path: path.to_string(),
        source,
    };
    let pem = fs::read(path).map_err(read_err)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err)?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_string()));
    }
    Ok(certs)
}

fn read_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let read_err = |source| TlsError::Read {
        kind: "private key",
        path: path.to_string(),
        source,
    };
    let pem = fs::read(path).map_err(read_err)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(read_err)?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_string()))
}
