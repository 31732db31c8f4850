//! Node controller: keeps tenant Nodes in line with their VMs

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, NodeAddress, Taint};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use dvp_common::{Error, TOPOLOGY_REGION_LABEL, TOPOLOGY_ZONE_LABEL};

use super::Context;
use crate::metadata::InstanceMetadata;

/// Periodic resync so address changes inside the VM are picked up
const RESYNC_SECS: u64 = 60;

/// Address type the kubelet reports for the node's hostname
pub const NODE_HOSTNAME: &str = "Hostname";

/// Taint marking nodes whose instance is powered off
pub const SHUTDOWN_TAINT_KEY: &str = "node.cloudprovider.kubernetes.io/shutdown";

fn provider_id(node: &Node) -> &str {
    node.spec
        .as_ref()
        .and_then(|s| s.provider_id.as_deref())
        .unwrap_or_default()
}

fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn taints(node: &Node) -> &[Taint] {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_deref())
        .unwrap_or_default()
}

fn has_shutdown_taint(node: &Node) -> bool {
    taints(node).iter().any(|t| t.key == SHUTDOWN_TAINT_KEY)
}

fn shutdown_taint() -> Taint {
    Taint {
        key: SHUTDOWN_TAINT_KEY.to_string(),
        effect: "NoSchedule".to_string(),
        ..Default::default()
    }
}

/// Provider addresses plus the Hostname entries the node already carries
fn desired_addresses(current: &[NodeAddress], meta: &InstanceMetadata) -> Vec<NodeAddress> {
    let mut addresses = meta.node_addresses.clone();
    for hostname in current.iter().filter(|a| a.type_ == NODE_HOSTNAME) {
        if !addresses.contains(hostname) {
            addresses.push(hostname.clone());
        }
    }
    addresses
}

/// Order-insensitive address comparison
fn same_addresses(a: &[NodeAddress], b: &[NodeAddress]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.contains(x))
}

/// Topology labels to merge into the node, only those that differ
fn topology_patch(node: &Node, meta: &InstanceMetadata) -> BTreeMap<String, String> {
    let current = node.labels();
    [
        (TOPOLOGY_REGION_LABEL, meta.region.as_str()),
        (TOPOLOGY_ZONE_LABEL, meta.zone.as_str()),
    ]
    .into_iter()
    .filter(|(key, value)| {
        !value.is_empty() && current.get(*key).map(String::as_str) != Some(*value)
    })
    .map(|(key, value)| (key.to_string(), value.to_string()))
    .collect()
}

/// Reconcile a tenant Node
pub async fn reconcile(node: Arc<Node>, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some(instances) = ctx.cloud.instances_v2() else {
        return Ok(Action::await_change());
    };
    let name = node.name_any();

    if provider_id(&node).is_empty() {
        debug!(node = %name, "Node has no provider ID yet");
        return Ok(Action::await_change());
    }

    if !instances.instance_exists(&node).await? {
        // A Ready kubelet contradicts the lookup; keep the node
        if is_ready(&node) {
            warn!(node = %name, "Instance not found but node is Ready, not deleting");
            return Ok(Action::requeue(Duration::from_secs(RESYNC_SECS)));
        }
        info!(node = %name, "Instance no longer exists, deleting node");
        ctx.tenant.delete_node(&name).await?;
        return Ok(Action::await_change());
    }

    if instances.instance_shutdown(&node).await? {
        if !has_shutdown_taint(&node) {
            let mut updated = taints(&node).to_vec();
            updated.push(shutdown_taint());
            ctx.tenant.patch_node_taints(&name, &updated).await?;
            warn!(node = %name, "Instance is shut down, tainted node");
        }
        return Ok(Action::requeue(Duration::from_secs(RESYNC_SECS)));
    }

    if has_shutdown_taint(&node) {
        let remaining: Vec<Taint> = taints(&node)
            .iter()
            .filter(|t| t.key != SHUTDOWN_TAINT_KEY)
            .cloned()
            .collect();
        ctx.tenant.patch_node_taints(&name, &remaining).await?;
        info!(node = %name, "Instance is running again, removed shutdown taint");
    }

    let meta = instances.instance_metadata(&node).await?;

    let current = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_deref())
        .unwrap_or_default();
    if !meta.node_addresses.is_empty() {
        let addresses = desired_addresses(current, &meta);
        if !same_addresses(current, &addresses) {
            ctx.tenant.patch_node_addresses(&name, &addresses).await?;
            info!(node = %name, ?addresses, "Updated node addresses");
        }
    }

    let labels = topology_patch(&node, &meta);
    if !labels.is_empty() {
        ctx.tenant.patch_node_labels(&name, &labels).await?;
        info!(node = %name, ?labels, "Updated node topology labels");
    }

    Ok(Action::requeue(Duration::from_secs(RESYNC_SECS)))
}
