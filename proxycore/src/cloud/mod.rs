//! Support for managed clusters reachable through a secure connect bundle.
//!
//! A [`Bundle`] holds the client's TLS identity and the address of a metadata
//! service; an [`AstraResolver`] asks that service for the cluster's contact
//! points and returns them as an [`EndpointFactory`](crate::network::EndpointFactory).

mod bundle;
mod resolver;

pub use bundle::{load_bundle, Bundle, BundleConfig};
pub use resolver::{
    resolve_astra, AstraResolver, HttpMetadataService, MetadataService, ResolverConfig,
};
