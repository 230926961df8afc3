//! Connection core of a CQL proxy.
//!
//! This crate opens authenticated connections to a Cassandra-compatible
//! cluster, including managed clusters that are only reachable through a
//! secure connect bundle.
//!
//! # Overview
//! The pieces, from the leaves up:
//! * [`Bundle`](cloud::Bundle) - the secure connect archive: TLS identity and
//!   the coordinates of the cluster's metadata service,
//! * [`AstraResolver`](cloud::AstraResolver) - asks the metadata service for
//!   contact points and produces an [`EndpointFactory`](network::EndpointFactory),
//! * [`Connection`](network::Connection) - one socket driven by a background
//!   task, written to through [`Sender`](network::Sender)s and read from by a
//!   [`Receiver`](network::Receiver),
//! * [`perform_handshake`](network::perform_handshake) - protocol version and
//!   authentication negotiation on a fresh connection,
//! * [`ClusterConnector`](cluster::ClusterConnector) - tries the contact points
//!   in order until one of them handshakes.
//!
//! ```rust,no_run
//! use proxycore::authentication::PlainTextAuthenticator;
//! use proxycore::cluster::connect_with_bundle;
//! use proxycore::ProtocolVersion;
//! use std::error::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!     let auth = PlainTextAuthenticator::new("client_id", "client_secret");
//!     let cluster = connect_with_bundle(
//!         "secure-connect-db.zip",
//!         ProtocolVersion::V4,
//!         &auth,
//!         None,
//!     )
//!     .await?;
//!     println!("connected to {} at {}", cluster.endpoint(), cluster.version());
//!
//!     cluster.connection().close();
//!     cluster.connection().is_closed().await;
//!     Ok(())
//! }
//! ```

pub mod authentication;
pub mod cloud;
pub mod cluster;
pub mod errors;
pub mod network;

pub use proxycore_cql::frame;
pub use proxycore_cql::ProtocolVersion;

#[cfg(test)]
pub(crate) mod test_utils;
