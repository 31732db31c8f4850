//! Provider facade
//!
//! Composes the load balancer reconciler and the instance metadata resolver
//! into the capability set the host cluster consumes.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use dvp_common::kube_utils::create_client;
use dvp_common::{CloudConfig, Error, PROVIDER_NAME};

use crate::client::{InfraClient, InfraClientImpl};
use crate::load_balancer::{DvpLoadBalancer, LoadBalancer};
use crate::metadata::{DvpInstances, InstancesV2};

/// Which provider interfaces are implemented
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Service load balancers
    pub load_balancer: bool,
    /// Legacy per-node instance queries
    pub instances: bool,
    /// Per-node metadata queries
    pub instances_v2: bool,
    /// Zone discovery
    pub zones: bool,
    /// Multi-cluster management
    pub clusters: bool,
    /// Pod network routes
    pub routes: bool,
}

/// Provider interface exposed to the host cluster
pub trait CloudProvider: Send + Sync {
    /// Registered provider name
    fn provider_name(&self) -> &'static str;

    /// Whether the provider requires a cluster ID
    fn has_cluster_id(&self) -> bool;

    /// Called once before any other method
    fn initialize(&self) {}

    /// Load balancer support, if any
    fn load_balancer(&self) -> Option<&dyn LoadBalancer>;

    /// Per-node metadata support, if any
    fn instances_v2(&self) -> Option<&dyn InstancesV2>;

    /// The full capability matrix
    fn capabilities(&self) -> Capabilities;
}

/// Cloud provider over DVP virtual machines
pub struct DvpCloud {
    load_balancer: DvpLoadBalancer,
    instances: DvpInstances,
}

impl DvpCloud {
    /// Capability matrix of this provider
    pub const CAPABILITIES: Capabilities = Capabilities {
        load_balancer: true,
        instances: false,
        instances_v2: true,
        zones: false,
        clusters: false,
        routes: false,
    };

    /// Build the provider over an existing infrastructure client.
    ///
    /// `config.namespace` must already be resolved.
    pub fn new(client: Arc<dyn InfraClient>, config: CloudConfig) -> Self {
        let instances = DvpInstances::new(
            client.clone(),
            config.namespace.clone(),
            config.zone_and_region_enabled,
        );
        let load_balancer = DvpLoadBalancer::new(
            client,
            config.namespace,
            config.load_balancer,
            config.infra_labels,
        );
        Self {
            load_balancer,
            instances,
        }
    }

    /// Build the provider from configuration, connecting to the
    /// infrastructure cluster named by `kubeconfigPath`.
    ///
    /// An empty namespace is taken from the kubeconfig's current context.
    pub async fn from_config(mut config: CloudConfig) -> Result<Self, Error> {
        config.validate()?;

        let ctx = create_client(Some(Path::new(&config.kubeconfig_path))).await?;
        if config.namespace.is_empty() {
            config.namespace = ctx.namespace;
        }

        info!(
            kubeconfig = %config.kubeconfig_path,
            namespace = %config.namespace,
            zone_and_region = config.zone_and_region_enabled,
            selector_less = config.load_balancer.selector_less,
            "Connected to infrastructure cluster"
        );

        Ok(Self::new(Arc::new(InfraClientImpl::new(ctx.client)), config))
    }
}

impl CloudProvider for DvpCloud {
    fn provider_name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn has_cluster_id(&self) -> bool {
        true
    }

    fn load_balancer(&self) -> Option<&dyn LoadBalancer> {
        Some(&self.load_balancer)
    }

    fn instances_v2(&self) -> Option<&dyn InstancesV2> {
        Some(&self.instances)
    }

    fn capabilities(&self) -> Capabilities {
        Self::CAPABILITIES
    }
}
