//! This module contains abstractions related to the TLS layer of connections.
//!
//! The full picture looks like this:
//!
//! ┌─←─ TlsMaterial (PEM from a bundle or a metadata response)
//! │
//! │ builds
//! │
//! ↳ rustls::ClientConfig (shared by an EndpointFactory)
//!   │
//!   │ wrapped with the endpoint's SNI name into
//!   │
//!   ↳ TlsConfig (specific for the particular connection)

use std::io;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// A wrapper around a TLS error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TlsError {
    #[error(transparent)]
    InvalidName(#[from] rustls::pki_types::InvalidDnsNameError),
    #[error(transparent)]
    PemParse(#[from] rustls::pki_types::pem::Error),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
    /// The PEM input contained no certificate.
    #[error("No certificate found in PEM input")]
    NoCertificates,
}

impl From<TlsError> for io::Error {
    fn from(value: TlsError) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, value)
    }
}

/// The crypto provider used by every TLS context built here.
///
/// Selecting it explicitly means no process-wide default provider has to
/// be installed.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub(crate) fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs: Vec<_> = CertificateDer::pem_slice_iter(pem).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates);
    }
    Ok(certs)
}

pub(crate) fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    Ok(PrivateKeyDer::from_pem_slice(pem)?)
}

/// PEM-encoded certificate material for mutually authenticated TLS.
///
/// Two values are equal when they hold the same bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    ca_cert: Vec<u8>,
    client_cert: Vec<u8>,
    client_key: Vec<u8>,
}

impl TlsMaterial {
    pub fn new(ca_cert: Vec<u8>, client_cert: Vec<u8>, client_key: Vec<u8>) -> Self {
        Self {
            ca_cert,
            client_cert,
            client_key,
        }
    }

    /// Same client identity, trusting a different CA.
    pub fn with_ca_cert(&self, ca_cert: Vec<u8>) -> Self {
        Self {
            ca_cert,
            ..self.clone()
        }
    }

    pub fn ca_cert(&self) -> &[u8] {
        &self.ca_cert
    }

    pub fn client_cert(&self) -> &[u8] {
        &self.client_cert
    }

    /// Builds a client context that verifies servers against the CA and
    /// presents the client certificate.
    pub fn client_config(&self) -> Result<ClientConfig, TlsError> {
        let mut root_store = RootCertStore::empty();
        for ca in parse_certificates(&self.ca_cert)? {
            root_store.add(ca)?;
        }
        let cert_chain = parse_certificates(&self.client_cert)?;
        let key = parse_private_key(&self.client_key)?;

        let config = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(root_store)
            .with_client_auth_cert(cert_chain, key)?;
        Ok(config)
    }
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_cert_len", &self.ca_cert.len())
            .field("client_cert_len", &self.client_cert.len())
            .field("client_key", &"<redacted>")
            .finish()
    }
}

/// Encapsulates TLS-regarding configuration that is specific for a particular endpoint:
/// the shared client context and the name to send in SNI.
#[derive(Clone)]
pub struct TlsConfig {
    context: Arc<ClientConfig>,
    sni: Option<String>,
}

impl TlsConfig {
    pub fn new(context: Arc<ClientConfig>, sni: Option<String>) -> Self {
        Self { context, sni }
    }

    pub fn sni(&self) -> Option<&str> {
        self.sni.as_deref()
    }

    /// Name to verify the server certificate against; the SNI name when
    /// set, the host otherwise. IP addresses are accepted as well.
    pub(crate) fn server_name(&self, host: &str) -> Result<ServerName<'static>, TlsError> {
        let name = self.sni.as_deref().unwrap_or(host);
        Ok(ServerName::try_from(name.to_owned())?)
    }

    pub(crate) fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.context.clone())
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").field("sni", &self.sni).finish()
    }
}
