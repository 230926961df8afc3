use std::fmt;
use std::sync::Arc;

use rustls::ClientConfig;
use thiserror::Error;

use super::tls::{TlsConfig, TlsError, TlsMaterial};

/// A network address of a cluster node, with an optional SNI name
/// to present when the node sits behind an SNI proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
    sni: Option<String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            sni: None,
        }
    }

    pub fn with_sni(mut self, sni: impl Into<String>) -> Self {
        self.sni = Some(sni.into());
        self
    }

    /// Parses `host:port`. IPv6 hosts must be enclosed in brackets.
    pub fn parse(address: &str) -> Result<Self, EndpointParseError> {
        let invalid = || EndpointParseError(address.to_owned());
        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        let host = match host.strip_prefix('[') {
            Some(bracketed) => bracketed.strip_suffix(']').ok_or_else(invalid)?,
            None if host.contains(':') => return Err(invalid()),
            None => host,
        };
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn sni(&self) -> Option<&str> {
        self.sni.as_deref()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)?;
        } else {
            write!(f, "{}:{}", self.host, self.port)?;
        }
        if let Some(sni) = &self.sni {
            write!(f, " (sni: {sni})")?;
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid endpoint address {0:?}, expected host:port")]
pub struct EndpointParseError(pub String);

#[derive(Clone)]
struct FactoryTls {
    material: TlsMaterial,
    context: Arc<ClientConfig>,
}

#[derive(Clone)]
struct EndpointFactoryInner {
    endpoints: Vec<Endpoint>,
    local_dc: Option<String>,
    tls: Option<FactoryTls>,
}

/// The resolved contact points of a cluster and the TLS setup used to reach them.
///
/// Immutable once built and cheap to clone, so one factory can serve any
/// number of connection attempts.
#[derive(Clone)]
pub struct EndpointFactory {
    inner: Arc<EndpointFactoryInner>,
}

impl EndpointFactory {
    /// Contact points reached over plain TCP.
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            inner: Arc::new(EndpointFactoryInner {
                endpoints,
                local_dc: None,
                tls: None,
            }),
        }
    }

    /// Contact points reached over mutually authenticated TLS.
    pub fn with_tls(
        endpoints: Vec<Endpoint>,
        local_dc: Option<String>,
        material: TlsMaterial,
    ) -> Result<Self, TlsError> {
        let context = Arc::new(material.client_config()?);
        Ok(Self {
            inner: Arc::new(EndpointFactoryInner {
                endpoints,
                local_dc,
                tls: Some(FactoryTls { material, context }),
            }),
        })
    }

    /// The contact points, in the order they should be tried.
    pub fn contact_points(&self) -> &[Endpoint] {
        &self.inner.endpoints
    }

    pub fn local_dc(&self) -> Option<&str> {
        self.inner.local_dc.as_deref()
    }

    pub fn tls_material(&self) -> Option<&TlsMaterial> {
        self.inner.tls.as_ref().map(|tls| &tls.material)
    }

    /// TLS configuration for a connection to `endpoint`, if the factory uses TLS.
    pub fn tls_config_for(&self, endpoint: &Endpoint) -> Option<TlsConfig> {
        self.inner.tls.as_ref().map(|tls| {
            TlsConfig::new(tls.context.clone(), endpoint.sni().map(ToOwned::to_owned))
        })
    }
}

// The built client context is derived from the material, so comparing the
// material is enough.
impl PartialEq for EndpointFactory {
    fn eq(&self, other: &Self) -> bool {
        self.inner.endpoints == other.inner.endpoints
            && self.inner.local_dc == other.inner.local_dc
            && self.tls_material() == other.tls_material()
    }
}

impl Eq for EndpointFactory {}

impl fmt::Debug for EndpointFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointFactory")
            .field("endpoints", &self.inner.endpoints)
            .field("local_dc", &self.inner.local_dc)
            .field("tls", &self.tls_material())
            .finish()
    }
}
