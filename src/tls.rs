use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::{self, ServerConfig};
use pgwire::tokio::TlsAcceptor;
use tracing::info;

use crate::config::{Config, ConfigError};

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("no certificates found in {0}")]
    NoCertificates(String),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("invalid certificate or key: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Acceptor for the configured cert/key pair, or `None` when TLS is off.
pub fn load_tls_acceptor(config: &Config) -> Result<Option<TlsAcceptor>, TlsError> {
    let (cert_path, key_path) = match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => return Err(ConfigError::PartialTls.into()),
    };

    let certs = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| read_err(cert_path, source))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.to_string()));
    }

    let key = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(|source| read_err(key_path, source))?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_string()))?;

    let mut server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    server.alpn_protocols = vec![b"postgresql".to_vec()];

    info!(cert = cert_path, "tls certificate loaded");
    Ok(Some(TlsAcceptor::from(Arc::new(server))))
}

fn open(path: &str) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| read_err(path, source))
}

fn read_err(path: &str, source: io::Error) -> TlsError {
    TlsError::Read {
        path: path.to_string(),
        source,
    }
}
