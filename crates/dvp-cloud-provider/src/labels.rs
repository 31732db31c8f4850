//! Labels stamped onto backing load balancer services

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;

/// Cluster the VM or backing service belongs to
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";
/// Name of the tenant Service a backing service realizes
pub const TENANT_SERVICE_NAME_LABEL: &str = "cluster.x-k8s.io/tenant-service-name";
/// Namespace of the tenant Service a backing service realizes
pub const TENANT_SERVICE_NAMESPACE_LABEL: &str = "cluster.x-k8s.io/tenant-service-namespace";

/// Label sets for one backing service
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DesiredLabels {
    /// Selects the cluster's VMs as endpoints
    pub selector: BTreeMap<String, String>,
    /// Metadata labels of the backing service
    pub service: BTreeMap<String, String>,
}

/// Compute both label sets for a tenant service.
///
/// Infra labels are applied last and win on key collisions.
pub fn desired_labels(
    service: &Service,
    cluster_name: &str,
    infra_labels: &BTreeMap<String, String>,
) -> DesiredLabels {
    let selector = BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string())]);

    let mut labels = BTreeMap::from([
        (
            TENANT_SERVICE_NAME_LABEL.to_string(),
            service.metadata.name.clone().unwrap_or_default(),
        ),
        (
            TENANT_SERVICE_NAMESPACE_LABEL.to_string(),
            service.metadata.namespace.clone().unwrap_or_default(),
        ),
        (CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string()),
    ]);
    labels.extend(infra_labels.iter().map(|(k, v)| (k.clone(), v.clone())));

    DesiredLabels {
        selector,
        service: labels,
    }
}
