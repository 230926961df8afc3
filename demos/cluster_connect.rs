use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use proxycore::authentication::PlainTextAuthenticator;
use proxycore::cloud::{load_bundle, AstraResolver, ResolverConfig};
use proxycore::cluster::ClusterConnector;
use proxycore::ProtocolVersion;
use tokio_util::sync::CancellationToken;
use tracing::info;

// Connects to a managed cluster described by a secure connect bundle.
// Credentials are read from the environment:
// PROXYCORE_USERNAME=... PROXYCORE_PASSWORD=... RUST_LOG=debug \
//     cargo run --example cluster_connect -- secure-connect-db.zip
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let bundle_path = env::args()
        .nth(1)
        .context("usage: cluster_connect <secure-connect-bundle.zip>")?;
    let username = env::var("PROXYCORE_USERNAME").context("PROXYCORE_USERNAME is not set")?;
    let password = env::var("PROXYCORE_PASSWORD").context("PROXYCORE_PASSWORD is not set")?;

    let bundle = load_bundle(&bundle_path).await?;
    info!("Metadata service at {}", bundle.metadata_url());

    let resolver = AstraResolver::new(ResolverConfig {
        request_timeout: Duration::from_secs(5),
    });
    let factory = resolver.resolve(&bundle).await?;
    for endpoint in factory.contact_points() {
        info!("Contact point {}", endpoint);
    }

    // Ctrl-C stops trying further endpoints.
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let connector = ClusterConnector::builder()
        .connect_timeout(Duration::from_secs(5))
        .handshake_timeout(Duration::from_secs(5))
        .build();
    let auth = PlainTextAuthenticator::new(username, password);
    let cluster = connector
        .connect(ProtocolVersion::V4, &auth, &factory, Some(&cancel))
        .await?;

    println!(
        "Connected to {} using protocol {} ({:?}), {} endpoints failed before",
        cluster.endpoint(),
        cluster.version(),
        cluster.result().auth,
        cluster.failed_attempts().len()
    );

    cluster.connection().close();
    cluster.connection().is_closed().await;
    Ok(())
}
