//! DVP cloud provider
//!
//! Exposes virtual machines of a DVP infrastructure cluster as the nodes of a
//! tenant cluster:
//! - Per-node metadata (provider ID, addresses, topology) from the backing VM
//! - LoadBalancer Services realized as Services in the infrastructure cluster
//! - Controllers that drive both from the tenant cluster

#![deny(missing_docs)]

pub mod client;
pub mod cloud;
pub mod controller;
pub mod instances;
pub mod labels;
pub mod load_balancer;
pub mod metadata;

#[cfg(test)]
mod testing;

pub use client::{InfraClient, InfraClientImpl};
pub use cloud::{Capabilities, CloudProvider, DvpCloud};
pub use instances::InstanceGetter;
pub use load_balancer::{DvpLoadBalancer, LoadBalancer};
pub use metadata::{DvpInstances, InstanceMetadata, InstancesV2};
