//! TLS listener with optional client certificates
//!
//! Client certificates are verified against the configured CA. A connection
//! without one is still accepted (health and metrics scrapes rarely present
//! one); its requests simply carry no [`ClientIdentity`].

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

use crate::config::{expand_path, ConfigError, TlsFiles};

#[derive(Error, Debug)]
pub enum TlsError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("No certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("No private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("Invalid TLS material: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("Invalid client CA: {0}")]
    ClientVerifier(String),
}

/// Verified name of the peer, taken from its certificate's common name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

impl ClientIdentity {
    pub fn name(&self) -> &str {
        &self.0
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    let path = expand_path(path);
    File::open(&path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io { path, source })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Build the acceptor; `Ok(None)` when no TLS files are configured
pub fn build_tls_acceptor(files: &TlsFiles) -> Result<Option<TlsAcceptor>, TlsError> {
    if !files.validate()? {
        return Ok(None);
    }
    let (Some(ca_file), Some(cert_file), Some(key_file)) =
        (&files.ca_file, &files.cert_file, &files.key_file)
    else {
        return Err(ConfigError::PartialTls.into());
    };

    let mut roots = RootCertStore::empty();
    for ca in load_certs(ca_file)? {
        roots.add(ca)?;
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .allow_unauthenticated()
        .build()
        .map_err(|e| TlsError::ClientVerifier(e.to_string()))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(cert_file)?, load_key(key_file)?)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

/// Common name of the end-entity certificate of a verified chain
pub fn peer_identity(chain: Option<&[CertificateDer<'_>]>) -> Option<ClientIdentity> {
    let leaf = chain?.first()?;
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref()).ok()?;
    let cn = cert.subject().iter_common_name().next()?.as_str().ok()?;
    Some(ClientIdentity(cn.to_string()))
}
