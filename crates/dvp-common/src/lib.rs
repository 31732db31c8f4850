//! Common types for the DVP cloud provider: errors, config, CRDs and utilities

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod lookup;
pub mod provider_id;
pub mod retry;
pub mod telemetry;

pub use config::{CloudConfig, LoadBalancerConfig};
pub use error::Error;
pub use lookup::Lookup;
pub use provider_id::{parse_provider_id, provider_id, PROVIDER_NAME};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Kubernetes topology label carrying the region of a node
pub const TOPOLOGY_REGION_LABEL: &str = "topology.kubernetes.io/region";

/// Kubernetes topology label carrying the zone of a node
pub const TOPOLOGY_ZONE_LABEL: &str = "topology.kubernetes.io/zone";
