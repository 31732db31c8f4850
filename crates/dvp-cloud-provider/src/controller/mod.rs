//! Tenant cluster controllers
//!
//! Drive the provider from the tenant cluster's Services and Nodes: one
//! controller keeps load balancers in line with LoadBalancer Services, the
//! other keeps Node metadata in line with the backing VMs.

pub mod node;
pub mod service;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Node, NodeAddress, Service, Taint};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[cfg(test)]
use mockall::automock;

use dvp_common::Error;

use crate::client::FIELD_MANAGER;
use crate::cloud::CloudProvider;

/// Watcher timeout (seconds), below the client read timeout so idle watches
/// are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Requeue delay for errors that may clear on their own
const REQUEUE_RETRYABLE_SECS: u64 = 15;
/// Requeue delay for errors that need operator attention
const REQUEUE_PERMANENT_SECS: u64 = 300;

/// Writes the controllers perform against the tenant cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TenantClient: Send + Sync {
    /// Replace `status.loadBalancer` of a Service
    async fn patch_service_status(
        &self,
        name: &str,
        namespace: &str,
        status: &LoadBalancerStatus,
    ) -> Result<(), Error>;

    /// Set the finalizer list of a Service
    async fn patch_service_finalizers(
        &self,
        name: &str,
        namespace: &str,
        finalizers: &[String],
    ) -> Result<(), Error>;

    /// Replace `status.addresses` of a Node
    async fn patch_node_addresses(
        &self,
        name: &str,
        addresses: &[NodeAddress],
    ) -> Result<(), Error>;

    /// Merge labels into a Node
    async fn patch_node_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error>;

    /// Replace `spec.taints` of a Node
    async fn patch_node_taints(&self, name: &str, taints: &[Taint]) -> Result<(), Error>;

    /// Delete a Node; already deleted counts as success
    async fn delete_node(&self, name: &str) -> Result<(), Error>;
}

/// Real tenant client
pub struct TenantClientImpl {
    client: Client,
}

impl TenantClientImpl {
    /// Create a new TenantClientImpl
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TenantClient for TenantClientImpl {
    async fn patch_service_status(
        &self,
        name: &str,
        namespace: &str,
        status: &LoadBalancerStatus,
    ) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "status": {
                "loadBalancer": status
            }
        });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_service_finalizers(
        &self,
        name: &str,
        namespace: &str,
        finalizers: &[String],
    ) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_node_addresses(
        &self,
        name: &str,
        addresses: &[NodeAddress],
    ) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "status": {
                "addresses": addresses
            }
        });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_node_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": {
                "labels": labels
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_node_taints(&self, name: &str, taints: &[Taint]) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "spec": {
                "taints": taints
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(node = %name, "Node not found (already deleted)");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Shared state of both controllers
pub struct Context {
    /// Provider the controllers drive
    pub cloud: Arc<dyn CloudProvider>,
    /// Tenant cluster writes
    pub tenant: Arc<dyn TenantClient>,
    /// Name of the tenant cluster, used to label and select backing objects
    pub cluster_name: String,
    /// Fired on shutdown to abort in-flight load balancer waits
    pub cancel: CancellationToken,
}

/// Requeue policy shared by both controllers
pub fn error_policy<K>(obj: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action
where
    K: Resource,
{
    error!(
        ?error,
        object = %obj.name_any(),
        namespace = %obj.namespace().unwrap_or_default(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(REQUEUE_RETRYABLE_SECS))
    } else {
        Action::requeue(Duration::from_secs(REQUEUE_PERMANENT_SECS))
    }
}

/// Build the Service and Node controller futures against the tenant cluster
pub fn build_controllers(
    client: Client,
    ctx: Arc<Context>,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let mut controllers: Vec<Pin<Box<dyn Future<Output = ()> + Send>>> = Vec::new();

    if ctx.cloud.load_balancer().is_some() {
        info!("- Service controller");
        let services: Api<Service> = Api::all(client.clone());
        controllers.push(Box::pin(
            Controller::new(services, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
                .shutdown_on_signal()
                .run(service::reconcile, error_policy, ctx.clone())
                .for_each(log_reconcile_result("Service")),
        ));
    }

    if ctx.cloud.instances_v2().is_some() {
        info!("- Node controller");
        let nodes: Api<Node> = Api::all(client);
        controllers.push(Box::pin(
            Controller::new(nodes, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
                .shutdown_on_signal()
                .run(node::reconcile, error_policy, ctx)
                .for_each(log_reconcile_result("Node")),
        ));
    }

    controllers
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
