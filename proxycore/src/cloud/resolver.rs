use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::Bundle;
use crate::errors::ResolveError;
use crate::network::{Endpoint, EndpointFactory};

const SUPPORTED_METADATA_VERSION: u32 = 1;
const SNI_PROXY_CONTACT_TYPE: &str = "sni_proxy";

/// Configuration of the metadata service client.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Bound on the whole metadata request, including connecting.
    pub request_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Fetches the raw metadata document describing how to reach a cluster.
#[async_trait]
pub trait MetadataService: Send + Sync {
    async fn fetch(&self, bundle: &Bundle) -> Result<Bytes, ResolveError>;
}

/// Fetches metadata over HTTPS from the URL in the bundle, authenticating
/// with the bundle's client certificate and basic-auth credentials.
#[derive(Debug, Clone, Default)]
pub struct HttpMetadataService {
    config: ResolverConfig,
}

impl HttpMetadataService {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MetadataService for HttpMetadataService {
    async fn fetch(&self, bundle: &Bundle) -> Result<Bytes, ResolveError> {
        let url = bundle.metadata_url();
        let unreachable = |reason: String| ResolveError::Unreachable {
            url: url.clone(),
            reason,
        };

        let client = reqwest::Client::builder()
            .use_preconfigured_tls(bundle.tls_material().client_config()?)
            .timeout(self.config.request_timeout)
            .build()
            .map_err(|err| unreachable(err.to_string()))?;

        debug!("Fetching cluster metadata from {}", url);
        let config = bundle.config();
        let response = client
            .get(&url)
            .basic_auth(config.username(), Some(config.password()))
            .send()
            .await
            .map_err(|err| unreachable(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ResolveError::Unauthorized {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(unreachable(format!("HTTP {status}")));
        }

        response
            .bytes()
            .await
            .map_err(|err| unreachable(err.to_string()))
    }
}

#[derive(Deserialize)]
struct MetadataResponse {
    version: Option<u32>,
    region: Option<String>,
    contact_info: ContactInfo,
}

#[derive(Deserialize)]
struct ContactInfo {
    #[serde(rename = "type")]
    contact_type: Option<String>,
    local_dc: Option<String>,
    contact_points: Vec<String>,
    sni_proxy_address: Option<String>,
    ca_cert: Option<String>,
}

/// Turns a secure connect bundle into the contact points of its cluster.
///
/// Resolution never modifies the bundle, so the same bundle may be resolved
/// any number of times, e.g. to pick up topology changes.
#[derive(Clone)]
pub struct AstraResolver {
    service: Arc<dyn MetadataService>,
}

impl AstraResolver {
    /// A resolver fetching metadata over HTTPS.
    pub fn new(config: ResolverConfig) -> Self {
        Self::with_metadata_service(Arc::new(HttpMetadataService::new(config)))
    }

    pub fn with_metadata_service(service: Arc<dyn MetadataService>) -> Self {
        Self { service }
    }

    pub async fn resolve(&self, bundle: &Bundle) -> Result<EndpointFactory, ResolveError> {
        let body = self.service.fetch(bundle).await?;
        let metadata: MetadataResponse = serde_json::from_slice(&body)
            .map_err(|err| ResolveError::MalformedResponse(err.to_string()))?;
        let factory = build_factory(bundle, metadata)?;
        info!(
            "Resolved {} contact points (local dc: {:?})",
            factory.contact_points().len(),
            factory.local_dc()
        );
        Ok(factory)
    }
}

impl Default for AstraResolver {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}

impl std::fmt::Debug for AstraResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AstraResolver").finish_non_exhaustive()
    }
}

/// Resolves `bundle` over HTTPS with the default configuration.
pub async fn resolve_astra(bundle: &Bundle) -> Result<EndpointFactory, ResolveError> {
    AstraResolver::default().resolve(bundle).await
}

fn build_factory(
    bundle: &Bundle,
    metadata: MetadataResponse,
) -> Result<EndpointFactory, ResolveError> {
    if metadata.version != Some(SUPPORTED_METADATA_VERSION) {
        warn!(
            "Unexpected metadata version {:?}, expected {}",
            metadata.version, SUPPORTED_METADATA_VERSION
        );
    }
    let info = metadata.contact_info;
    if info.contact_type.as_deref() != Some(SNI_PROXY_CONTACT_TYPE) {
        warn!("Unexpected contact info type {:?}", info.contact_type);
    }
    if info.contact_points.is_empty() {
        return Err(ResolveError::MalformedResponse(
            "contact_points is empty".to_owned(),
        ));
    }

    let proxy = info
        .sni_proxy_address
        .as_deref()
        .map(Endpoint::parse)
        .transpose()
        .map_err(|err| ResolveError::MalformedResponse(format!("sni_proxy_address: {err}")))?;

    let endpoints = info
        .contact_points
        .iter()
        .map(|contact_point| contact_point_endpoint(contact_point, proxy.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;

    let material = match info.ca_cert {
        Some(ca_cert) => bundle.tls_material().with_ca_cert(ca_cert.into_bytes()),
        None => bundle.tls_material().clone(),
    };
    let local_dc = info
        .local_dc
        .or_else(|| bundle.config().local_dc().map(ToOwned::to_owned));
    debug!(
        "Metadata for region {:?} lists {} contact points",
        metadata.region,
        endpoints.len()
    );

    Ok(EndpointFactory::with_tls(endpoints, local_dc, material)?)
}

/// `host:port` contact points are connected to directly; anything else is a
/// host id reached through the SNI proxy.
fn contact_point_endpoint(
    contact_point: &str,
    proxy: Option<&Endpoint>,
) -> Result<Endpoint, ResolveError> {
    if let Ok(endpoint) = Endpoint::parse(contact_point) {
        return Ok(endpoint);
    }
    if contact_point.is_empty() || contact_point.contains(':') {
        return Err(ResolveError::MalformedResponse(format!(
            "invalid contact point {contact_point:?}"
        )));
    }
    let proxy = proxy.ok_or_else(|| {
        ResolveError::MalformedResponse(format!(
            "contact point {contact_point:?} is a host id, but there is no sni_proxy_address"
        ))
    })?;
    Ok(Endpoint::new(proxy.host(), proxy.port()).with_sni(contact_point))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        bundle_zip, refused_endpoint, setup_tracing, MockMetadataServer, TestPki,
    };
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedMetadata {
        body: serde_json::Value,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MetadataService for FixedMetadata {
        async fn fetch(&self, _bundle: &Bundle) -> Result<Bytes, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::to_vec(&self.body).unwrap().into())
        }
    }

    fn test_bundle(
        pki: &TestPki,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Bundle {
        let config = json!({
            "host": host,
            "port": port,
            "username": username,
            "password": password,
            "localDC": "bundle-dc",
        });
        Bundle::from_reader(Cursor::new(bundle_zip(&config, pki))).unwrap()
    }

    async fn resolve_fixed(
        bundle: &Bundle,
        body: serde_json::Value,
    ) -> Result<EndpointFactory, ResolveError> {
        let service = Arc::new(FixedMetadata {
            body,
            calls: AtomicUsize::new(0),
        });
        AstraResolver::with_metadata_service(service)
            .resolve(bundle)
            .await
    }

    fn sni_metadata() -> serde_json::Value {
        json!({
            "version": 1,
            "region": "us-east1",
            "contact_info": {
                "type": "sni_proxy",
                "local_dc": "dc-1",
                "contact_points": ["6f1a2b3c-host-1", "6f1a2b3c-host-2"],
                "sni_proxy_address": "proxy.db.example.com:29042",
            }
        })
    }

    #[tokio::test]
    async fn host_ids_go_through_the_sni_proxy() {
        let pki = TestPki::generate("localhost");
        let bundle = test_bundle(&pki, "db.example.com", 29080, "u", "p");

        let factory = resolve_fixed(&bundle, sni_metadata()).await.unwrap();
        assert_eq!(
            factory.contact_points(),
            &[
                Endpoint::new("proxy.db.example.com", 29042).with_sni("6f1a2b3c-host-1"),
                Endpoint::new("proxy.db.example.com", 29042).with_sni("6f1a2b3c-host-2"),
            ]
        );
        assert_eq!(factory.local_dc(), Some("dc-1"));
        assert_eq!(factory.tls_material(), Some(bundle.tls_material()));
    }

    #[tokio::test]
    async fn resolution_is_repeatable() {
        let pki = TestPki::generate("localhost");
        let bundle = test_bundle(&pki, "db.example.com", 29080, "u", "p");
        let service = Arc::new(FixedMetadata {
            body: sni_metadata(),
            calls: AtomicUsize::new(0),
        });
        let resolver = AstraResolver::with_metadata_service(service.clone());

        let first = resolver.resolve(&bundle).await.unwrap();
        let second = resolver.resolve(&bundle).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn direct_contact_points_and_ca_override() {
        let pki = TestPki::generate("localhost");
        let other_ca = TestPki::generate("localhost").ca_pem();
        let bundle = test_bundle(&pki, "db.example.com", 29080, "u", "p");
        let metadata = json!({
            "version": 1,
            "contact_info": {
                "type": "sni_proxy",
                "contact_points": ["10.0.0.1:9042", "10.0.0.2:9042"],
                "ca_cert": String::from_utf8(other_ca.clone()).unwrap(),
            }
        });

        let factory = resolve_fixed(&bundle, metadata).await.unwrap();
        assert_eq!(
            factory.contact_points(),
            &[
                Endpoint::new("10.0.0.1", 9042),
                Endpoint::new("10.0.0.2", 9042)
            ]
        );
        // Falls back to the bundle's data center.
        assert_eq!(factory.local_dc(), Some("bundle-dc"));
        let material = factory.tls_material().unwrap();
        assert_eq!(material.ca_cert(), &other_ca[..]);
        assert_eq!(material.client_cert(), bundle.tls_material().client_cert());
    }

    #[tokio::test]
    async fn malformed_metadata_is_rejected() {
        let pki = TestPki::generate("localhost");
        let bundle = test_bundle(&pki, "db.example.com", 29080, "u", "p");

        let cases = [
            json!({"version": 1}),
            json!({"version": 1, "contact_info": {"contact_points": []}}),
            json!({"version": 1, "contact_info": {"contact_points": ["host-id"]}}),
            json!({"version": 1, "contact_info": {
                "contact_points": ["host-id"],
                "sni_proxy_address": "no-port",
            }}),
            json!({"version": 1, "contact_info": {"contact_points": ["bad:address:here"]}}),
        ];
        for metadata in cases {
            assert_matches!(
                resolve_fixed(&bundle, metadata.clone()).await,
                Err(ResolveError::MalformedResponse(_)),
                "{metadata}"
            );
        }

        let bad_ca = json!({"version": 1, "contact_info": {
            "contact_points": ["10.0.0.1:9042"],
            "ca_cert": "not a certificate",
        }});
        assert_matches!(
            resolve_fixed(&bundle, bad_ca).await,
            Err(ResolveError::Tls(_))
        );
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn fetches_metadata_over_mutual_tls() {
        setup_tracing();
        let pki = TestPki::generate("localhost");
        let server = MockMetadataServer::start(&pki, "user", "pass", sni_metadata()).await;

        let bundle = test_bundle(&pki, "127.0.0.1", server.port(), "user", "pass");
        let factory = AstraResolver::default().resolve(&bundle).await.unwrap();
        assert_eq!(factory.contact_points().len(), 2);

        let wrong_password = test_bundle(&pki, "127.0.0.1", server.port(), "user", "wrong");
        assert_matches!(
            AstraResolver::default().resolve(&wrong_password).await,
            Err(ResolveError::Unauthorized { status: 401 })
        );
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn unreachable_metadata_service() {
        setup_tracing();
        let pki = TestPki::generate("localhost");
        let port = refused_endpoint().await.port();
        let bundle = test_bundle(&pki, "127.0.0.1", port, "user", "pass");

        let resolver = AstraResolver::new(ResolverConfig {
            request_timeout: Duration::from_secs(5),
        });
        assert_matches!(
            resolver.resolve(&bundle).await,
            Err(ResolveError::Unreachable { .. })
        );
    }
}
