//! Per-node instance metadata
//!
//! Maps the live status of a node's VirtualMachine into the metadata the host
//! cluster records on the Node: provider ID, addresses, region and zone.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeAddress};
use tracing::{debug, error};

#[cfg(test)]
use mockall::automock;

use dvp_common::crd::VirtualMachine;
use dvp_common::{provider_id, Error, TOPOLOGY_REGION_LABEL, TOPOLOGY_ZONE_LABEL};

use crate::client::InfraClient;
use crate::instances::{instance_not_found, InstanceGetter};

/// Node address type for cluster-internal IPs
pub const NODE_INTERNAL_IP: &str = "InternalIP";

/// Metadata attributed to a node
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstanceMetadata {
    /// `dvp://<vm-name>`
    pub provider_id: String,
    /// Addresses to publish on the node status
    pub node_addresses: Vec<NodeAddress>,
    /// Region, empty when unknown or disabled
    pub region: String,
    /// Zone, empty when unknown or disabled
    pub zone: String,
}

/// Per-node instance queries the host cluster performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstancesV2: Send + Sync {
    /// Whether the node still has a backing VM
    ///
    /// A missing VM is `Ok(false)`; any other failure is an error.
    async fn instance_exists(&self, node: &Node) -> Result<bool, Error>;

    /// Whether the node's VM is powered off. The VM must exist.
    async fn instance_shutdown(&self, node: &Node) -> Result<bool, Error>;

    /// Resolve provider ID, addresses and topology for the node
    async fn instance_metadata(&self, node: &Node) -> Result<InstanceMetadata, Error>;
}

/// InstancesV2 over DVP virtual machines
pub struct DvpInstances {
    client: Arc<dyn InfraClient>,
    getter: InstanceGetter,
    namespace: String,
    zone_and_region_enabled: bool,
}

impl DvpInstances {
    /// Create the resolver for VMs in `namespace`
    pub fn new(
        client: Arc<dyn InfraClient>,
        namespace: impl Into<String>,
        zone_and_region_enabled: bool,
    ) -> Self {
        Self {
            getter: InstanceGetter::new(client.clone()),
            client,
            namespace: namespace.into(),
            zone_and_region_enabled,
        }
    }

    /// Fetch the VM a node points at, requiring it to exist
    async fn instance_for(&self, node: &Node) -> Result<VirtualMachine, Error> {
        let id = node_provider_id(node);
        self.getter
            .get_by_provider_id(id, &self.namespace)
            .await
            .found_or_else(|| {
                instance_not_found(
                    dvp_common::parse_provider_id(id).unwrap_or(id),
                    &self.namespace,
                )
            })
            .inspect_err(|e| {
                error!(
                    provider_id = %id,
                    namespace = %self.namespace,
                    error = %e,
                    "Failed to get instance"
                )
            })
    }

    /// Read region and zone from the infrastructure node hosting the VM
    async fn region_and_zone(&self, vm: &VirtualMachine) -> Result<(String, String), Error> {
        if !self.zone_and_region_enabled {
            return Ok((String::new(), String::new()));
        }
        let Some(node_name) = vm.node_name() else {
            debug!(
                instance = %vm.metadata.name.as_deref().unwrap_or_default(),
                "Instance is not scheduled to a node yet, leaving topology empty"
            );
            return Ok((String::new(), String::new()));
        };

        let node = self
            .client
            .get_node(node_name)
            .await?
            .ok_or_else(|| Error::not_found("Node", node_name, ""))?;

        let labels = node.metadata.labels.unwrap_or_default();
        let region = labels.get(TOPOLOGY_REGION_LABEL).cloned().unwrap_or_default();
        let zone = labels.get(TOPOLOGY_ZONE_LABEL).cloned().unwrap_or_default();
        Ok((region, zone))
    }
}

fn node_provider_id(node: &Node) -> &str {
    node.spec
        .as_ref()
        .and_then(|s| s.provider_id.as_deref())
        .unwrap_or_default()
}

/// Append an address unless an identical one is already present
fn add_node_address(addresses: &mut Vec<NodeAddress>, address: NodeAddress) {
    if !addresses
        .iter()
        .any(|a| a.type_ == address.type_ && a.address == address.address)
    {
        addresses.push(address);
    }
}

/// Pick the addresses to publish for a node.
///
/// A live IP from the VM always wins. Without one, the internal addresses the
/// node already carries are kept so they don't disappear while the guest
/// agent has not reported yet.
pub fn node_addresses(vm: &VirtualMachine, previous: &[NodeAddress]) -> Vec<NodeAddress> {
    let mut addresses = Vec::new();
    match vm.ip_address() {
        Some(ip) => add_node_address(
            &mut addresses,
            NodeAddress {
                type_: NODE_INTERNAL_IP.to_string(),
                address: ip.to_string(),
            },
        ),
        None => {
            for prev in previous.iter().filter(|a| a.type_ == NODE_INTERNAL_IP) {
                add_node_address(&mut addresses, prev.clone());
            }
        }
    }
    addresses
}

#[async_trait]
impl InstancesV2 for DvpInstances {
    async fn instance_exists(&self, node: &Node) -> Result<bool, Error> {
        let id = node_provider_id(node);
        self.getter
            .get_by_provider_id(id, &self.namespace)
            .await
            .exists()
            .inspect_err(|e| {
                error!(
                    provider_id = %id,
                    namespace = %self.namespace,
                    error = %e,
                    "Failed to get instance"
                )
            })
    }

    async fn instance_shutdown(&self, node: &Node) -> Result<bool, Error> {
        Ok(self.instance_for(node).await?.is_stopped())
    }

    async fn instance_metadata(&self, node: &Node) -> Result<InstanceMetadata, Error> {
        let vm = self.instance_for(node).await?;

        let previous = node
            .status
            .as_ref()
            .and_then(|s| s.addresses.as_deref())
            .unwrap_or_default();
        let node_addresses = node_addresses(&vm, previous);

        let (region, zone) = self.region_and_zone(&vm).await?;

        Ok(InstanceMetadata {
            provider_id: provider_id(vm.metadata.name.as_deref().unwrap_or_default()),
            node_addresses,
            region,
            zone,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockInfraClient;
    use dvp_common::crd::{MachinePhase, VirtualMachineSpec, VirtualMachineStatus};
    use k8s_openapi::api::core::v1::{NodeSpec, NodeStatus};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    const NS: &str = "tenant-infra";

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn vm(name: &str, phase: MachinePhase, ip: &str, host: &str) -> VirtualMachine {
        let mut vm = VirtualMachine::new(name, VirtualMachineSpec::default());
        vm.metadata.namespace = Some(NS.to_string());
        vm.status = Some(VirtualMachineStatus {
            phase: Some(phase),
            ip_address: Some(ip.to_string()),
            node_name: Some(host.to_string()),
        });
        vm
    }

    fn internal(ip: &str) -> NodeAddress {
        NodeAddress {
            type_: NODE_INTERNAL_IP.to_string(),
            address: ip.to_string(),
        }
    }

    fn hostname(name: &str) -> NodeAddress {
        NodeAddress {
            type_: "Hostname".to_string(),
            address: name.to_string(),
        }
    }

    fn tenant_node(provider_id: &str, addresses: Vec<NodeAddress>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("worker-0".to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(provider_id.to_string()),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                addresses: Some(addresses),
                ..Default::default()
            }),
        }
    }

    fn infra_node(name: &str, region: Option<&str>, zone: Option<&str>) -> Node {
        let mut labels = BTreeMap::new();
        if let Some(r) = region {
            labels.insert(TOPOLOGY_REGION_LABEL.to_string(), r.to_string());
        }
        if let Some(z) = zone {
            labels.insert(TOPOLOGY_ZONE_LABEL.to_string(), z.to_string());
        }
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn instances(mock: MockInfraClient, topology: bool) -> DvpInstances {
        DvpInstances::new(Arc::new(mock), NS, topology)
    }

    // =========================================================================
    // Existence
    // =========================================================================

    #[tokio::test]
    async fn exists_is_false_when_vm_is_missing() {
        let mut mock = MockInfraClient::new();
        mock.expect_get_virtual_machine().returning(|_, _| Ok(None));

        let node = tenant_node("dvp://worker-0", vec![]);
        assert!(!instances(mock, false).instance_exists(&node).await.unwrap());
    }

    #[tokio::test]
    async fn exists_is_true_when_vm_is_present() {
        let mut mock = MockInfraClient::new();
        mock.expect_get_virtual_machine()
            .returning(|name, _| Ok(Some(vm(name, MachinePhase::Running, "", ""))));

        let node = tenant_node("dvp://worker-0", vec![]);
        assert!(instances(mock, false).instance_exists(&node).await.unwrap());
    }

    #[tokio::test]
    async fn exists_propagates_transport_errors() {
        let mut mock = MockInfraClient::new();
        mock.expect_get_virtual_machine()
            .returning(|_, _| Err(Error::internal("connection refused")));

        let node = tenant_node("dvp://worker-0", vec![]);
        assert!(instances(mock, false).instance_exists(&node).await.is_err());
    }

    #[tokio::test]
    async fn exists_rejects_foreign_provider_id() {
        let mock = MockInfraClient::new();
        let node = tenant_node("aws:///eu-west-1a/i-0abc", vec![]);
        assert!(matches!(
            instances(mock, false).instance_exists(&node).await,
            Err(Error::InvalidProviderId { .. })
        ));
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    #[tokio::test]
    async fn shutdown_reflects_stopped_phase() {
        let mut mock = MockInfraClient::new();
        mock.expect_get_virtual_machine()
            .returning(|name, _| Ok(Some(vm(name, MachinePhase::Stopped, "", ""))));

        let node = tenant_node("dvp://worker-0", vec![]);
        assert!(instances(mock, false).instance_shutdown(&node).await.unwrap());
    }

    #[tokio::test]
    async fn shutdown_is_false_for_running_and_transitional_phases() {
        for phase in [
            MachinePhase::Running,
            MachinePhase::Stopping,
            MachinePhase::Starting,
        ] {
            let mut mock = MockInfraClient::new();
            mock.expect_get_virtual_machine()
                .returning(move |name, _| Ok(Some(vm(name, phase, "", ""))));

            let node = tenant_node("dvp://worker-0", vec![]);
            assert!(!instances(mock, false).instance_shutdown(&node).await.unwrap());
        }
    }

    #[tokio::test]
    async fn shutdown_treats_missing_vm_as_error() {
        let mut mock = MockInfraClient::new();
        mock.expect_get_virtual_machine().returning(|_, _| Ok(None));

        let node = tenant_node("dvp://worker-0", vec![]);
        let err = instances(mock, false)
            .instance_shutdown(&node)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("worker-0"));
    }

    // =========================================================================
    // Address selection
    // =========================================================================

    #[test]
    fn live_ip_replaces_previous_addresses() {
        let vm = vm("worker-0", MachinePhase::Running, "10.0.0.5", "");
        let previous = vec![internal("10.0.0.1"), internal("10.0.0.2"), hostname("worker-0")];
        assert_eq!(node_addresses(&vm, &previous), vec![internal("10.0.0.5")]);
    }

    #[test]
    fn previous_internal_addresses_survive_missing_live_ip() {
        let vm = vm("worker-0", MachinePhase::Running, "", "");
        let previous = vec![internal("10.0.0.1"), hostname("worker-0"), internal("10.0.0.2")];
        assert_eq!(
            node_addresses(&vm, &previous),
            vec![internal("10.0.0.1"), internal("10.0.0.2")]
        );
    }

    #[test]
    fn duplicate_previous_addresses_are_collapsed() {
        let vm = vm("worker-0", MachinePhase::Running, "", "");
        let previous = vec![internal("10.0.0.1"), internal("10.0.0.1")];
        assert_eq!(node_addresses(&vm, &previous), vec![internal("10.0.0.1")]);
    }

    #[test]
    fn no_addresses_when_nothing_is_known() {
        let vm = vm("worker-0", MachinePhase::Pending, "", "");
        assert!(node_addresses(&vm, &[hostname("worker-0")]).is_empty());
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    #[tokio::test]
    async fn metadata_without_topology_lookup() {
        let mut mock = MockInfraClient::new();
        mock.expect_get_virtual_machine().returning(|name, _| {
            Ok(Some(vm(name, MachinePhase::Running, "10.0.0.5", "virt-3")))
        });
        mock.expect_get_node().never();

        let node = tenant_node("dvp://worker-0", vec![internal("10.0.0.1")]);
        let meta = instances(mock, false)
            .instance_metadata(&node)
            .await
            .unwrap();
        assert_eq!(
            meta,
            InstanceMetadata {
                provider_id: "dvp://worker-0".to_string(),
                node_addresses: vec![internal("10.0.0.5")],
                region: String::new(),
                zone: String::new(),
            }
        );
    }

    #[tokio::test]
    async fn metadata_reads_topology_from_hosting_node() {
        let mut mock = MockInfraClient::new();
        mock.expect_get_virtual_machine().returning(|name, _| {
            Ok(Some(vm(name, MachinePhase::Running, "10.0.0.5", "virt-3")))
        });
        mock.expect_get_node()
            .withf(|name| name == "virt-3")
            .times(1)
            .returning(|name| Ok(Some(infra_node(name, Some("eu-central"), Some("eu-central-a")))));

        let node = tenant_node("dvp://worker-0", vec![]);
        let meta = instances(mock, true).instance_metadata(&node).await.unwrap();
        assert_eq!(meta.region, "eu-central");
        assert_eq!(meta.zone, "eu-central-a");
    }

    #[tokio::test]
    async fn missing_topology_labels_leave_fields_empty() {
        let mut mock = MockInfraClient::new();
        mock.expect_get_virtual_machine().returning(|name, _| {
            Ok(Some(vm(name, MachinePhase::Running, "10.0.0.5", "virt-3")))
        });
        mock.expect_get_node()
            .returning(|name| Ok(Some(infra_node(name, Some("eu-central"), None))));

        let node = tenant_node("dvp://worker-0", vec![]);
        let meta = instances(mock, true).instance_metadata(&node).await.unwrap();
        assert_eq!(meta.region, "eu-central");
        assert_eq!(meta.zone, "");
    }

    #[tokio::test]
    async fn topology_fetch_failure_fails_metadata() {
        let mut mock = MockInfraClient::new();
        mock.expect_get_virtual_machine().returning(|name, _| {
            Ok(Some(vm(name, MachinePhase::Running, "10.0.0.5", "virt-3")))
        });
        mock.expect_get_node()
            .returning(|_| Err(Error::internal("connection refused")));

        let node = tenant_node("dvp://worker-0", vec![]);
        assert!(instances(mock, true).instance_metadata(&node).await.is_err());
    }

    #[tokio::test]
    async fn missing_hosting_node_fails_metadata() {
        let mut mock = MockInfraClient::new();
        mock.expect_get_virtual_machine().returning(|name, _| {
            Ok(Some(vm(name, MachinePhase::Running, "10.0.0.5", "virt-3")))
        });
        mock.expect_get_node().returning(|_| Ok(None));

        let node = tenant_node("dvp://worker-0", vec![]);
        let err = instances(mock, true)
            .instance_metadata(&node)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn unscheduled_vm_skips_topology_lookup() {
        let mut mock = MockInfraClient::new();
        mock.expect_get_virtual_machine()
            .returning(|name, _| Ok(Some(vm(name, MachinePhase::Pending, "", ""))));
        mock.expect_get_node().never();

        let node = tenant_node("dvp://worker-0", vec![]);
        let meta = instances(mock, true).instance_metadata(&node).await.unwrap();
        assert_eq!(meta.region, "");
        assert_eq!(meta.zone, "");
        assert_eq!(meta.provider_id, "dvp://worker-0");
    }
}
