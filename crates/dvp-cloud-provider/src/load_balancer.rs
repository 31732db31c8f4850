//! Load balancer reconciliation
//!
//! Each tenant Service of type LoadBalancer is realized by one Service of type
//! LoadBalancer in the infrastructure cluster (the "backing service"). The
//! backing service selects the tenant cluster's VMs and forwards each listener
//! port to the tenant's node port, so traffic enters the tenant cluster through
//! kube-proxy exactly as it would behind a cloud load balancer.
//!
//! All state lives in the backing service itself. Every entry point re-reads it
//! by its deterministic name, which makes the entry points idempotent and safe
//! to call repeatedly from the host's reconcile loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Node, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[cfg(test)]
use mockall::automock;

use dvp_common::retry::{retry_on_conflict, RetryConfig};
use dvp_common::{Error, LoadBalancerConfig, Lookup};

use crate::client::InfraClient;
use crate::labels::{desired_labels, DesiredLabels};

/// Service type of backing services
pub const SERVICE_TYPE_LOAD_BALANCER: &str = "LoadBalancer";

/// Protocol the API server assumes for ports that don't set one
const DEFAULT_PROTOCOL: &str = "TCP";

/// Upper bound on generated backing service names
const MAX_LOAD_BALANCER_NAME_LENGTH: usize = 32;

/// Load balancer operations the host cluster performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Name of the backing service for a tenant service
    fn load_balancer_name(&self, cluster_name: &str, service: &Service) -> String;

    /// Current status, `None` when no backing service exists
    async fn get_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
    ) -> Result<Option<LoadBalancerStatus>, Error>;

    /// Create the backing service or bring its ports in line.
    ///
    /// On creation, waits until the infrastructure cluster assigns an ingress
    /// point, the configured timeout elapses, or `cancel` fires.
    async fn ensure_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
        nodes: &[Node],
        cancel: &CancellationToken,
    ) -> Result<LoadBalancerStatus, Error>;

    /// Bring the ports of an existing backing service in line
    async fn update_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
        nodes: &[Node],
    ) -> Result<(), Error>;

    /// Delete the backing service if it exists
    async fn ensure_load_balancer_deleted(
        &self,
        cluster_name: &str,
        service: &Service,
    ) -> Result<(), Error>;
}

/// Default backing service name: `a` + the tenant service UID without dashes,
/// capped at 32 characters.
pub fn default_load_balancer_name(service: &Service) -> String {
    let uid = service.metadata.uid.as_deref().unwrap_or_default();
    std::iter::once('a')
        .chain(uid.chars().filter(|c| *c != '-'))
        .take(MAX_LOAD_BALANCER_NAME_LENGTH)
        .collect()
}

/// Backing ports for a tenant service: each listener forwards to the tenant
/// node port.
pub fn desired_ports(service: &Service) -> Vec<ServicePort> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| ServicePort {
                    name: p.name.clone(),
                    protocol: p.protocol.clone(),
                    port: p.port,
                    target_port: Some(IntOrString::Int(p.node_port.unwrap_or_default())),
                    ..Default::default()
                })
                .collect()
        })
        .unwrap_or_default()
}

fn protocol(port: &ServicePort) -> &str {
    port.protocol.as_deref().unwrap_or(DEFAULT_PROTOCOL)
}

fn same_listener(a: &ServicePort, b: &ServicePort) -> bool {
    a.name.as_deref().unwrap_or_default() == b.name.as_deref().unwrap_or_default()
        && protocol(a) == protocol(b)
        && a.port == b.port
}

/// Order-sensitive comparison on name, protocol, port and target port
pub fn ports_match(current: &[ServicePort], desired: &[ServicePort]) -> bool {
    current.len() == desired.len()
        && current
            .iter()
            .zip(desired)
            .all(|(c, d)| same_listener(c, d) && c.target_port == d.target_port)
}

/// Desired ports, keeping node ports the API server already allocated for
/// unchanged listeners
fn with_allocated_node_ports(desired: &[ServicePort], current: &[ServicePort]) -> Vec<ServicePort> {
    desired
        .iter()
        .map(|port| ServicePort {
            node_port: current
                .iter()
                .find(|c| same_listener(c, port))
                .and_then(|c| c.node_port),
            ..port.clone()
        })
        .collect()
}

fn load_balancer_status(service: &Service) -> LoadBalancerStatus {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.clone())
        .unwrap_or_default()
}

fn has_ingress(service: &Service) -> bool {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .is_some_and(|ingress| !ingress.is_empty())
}

/// LoadBalancer backed by Services in the infrastructure cluster
pub struct DvpLoadBalancer {
    client: Arc<dyn InfraClient>,
    namespace: String,
    config: LoadBalancerConfig,
    infra_labels: BTreeMap<String, String>,
    conflict_retry: RetryConfig,
}

impl DvpLoadBalancer {
    /// Create a reconciler managing backing services in `namespace`
    pub fn new(
        client: Arc<dyn InfraClient>,
        namespace: impl Into<String>,
        config: LoadBalancerConfig,
        infra_labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            config,
            infra_labels,
            conflict_retry: RetryConfig::default(),
        }
    }

    /// Override the backoff used when a port update hits a write conflict
    pub fn with_conflict_retry(mut self, retry: RetryConfig) -> Self {
        self.conflict_retry = retry;
        self
    }

    async fn lookup(&self, name: &str) -> Lookup<Service> {
        Lookup::from(self.client.get_service(name, &self.namespace).await)
    }

    fn log_lookup_error(&self, name: &str, e: &Error) {
        error!(
            name = %name,
            namespace = %self.namespace,
            error = %e,
            "Failed to get LoadBalancer service"
        );
    }

    fn build_service(
        &self,
        name: &str,
        service: &Service,
        labels: DesiredLabels,
        ports: Vec<ServicePort>,
    ) -> Service {
        let tenant = service.spec.clone().unwrap_or_default();

        let spec = ServiceSpec {
            type_: Some(SERVICE_TYPE_LOAD_BALANCER.to_string()),
            ports: Some(ports),
            selector: (!self.config.selector_less).then_some(labels.selector),
            external_traffic_policy: tenant.external_traffic_policy,
            external_ips: tenant.external_ips.filter(|ips| !ips.is_empty()),
            load_balancer_class: tenant.load_balancer_class,
            load_balancer_ip: tenant.load_balancer_ip.filter(|ip| !ip.is_empty()),
            health_check_node_port: tenant.health_check_node_port.filter(|p| *p > 0),
            ..Default::default()
        };

        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                annotations: service.metadata.annotations.clone(),
                labels: Some(labels.service),
                ..Default::default()
            },
            spec: Some(spec),
            status: None,
        }
    }

    /// Replace the ports of `svc` if they differ from `desired`.
    ///
    /// On a write conflict the object is re-read and the comparison repeated,
    /// so a concurrent writer that already applied the same ports ends the
    /// retry without a second write.
    async fn sync_ports(&self, svc: Service, desired: &[ServicePort]) -> Result<(), Error> {
        let name = svc.metadata.name.clone().unwrap_or_default();
        let name = name.as_str();
        let mut fresh = Some(svc);

        retry_on_conflict(&self.conflict_retry, "update load balancer ports", || {
            let current = fresh.take();
            async move {
                let svc = match current {
                    Some(svc) => svc,
                    None => self
                        .lookup(name)
                        .await
                        .found_or_else(|| Error::not_found("Service", name, &self.namespace))?,
                };
                self.apply_ports(svc, desired).await
            }
        })
        .await
    }

    async fn apply_ports(&self, mut svc: Service, desired: &[ServicePort]) -> Result<(), Error> {
        let name = svc.metadata.name.clone().unwrap_or_default();
        let spec = svc.spec.get_or_insert_with(ServiceSpec::default);
        let current = spec.ports.as_deref().unwrap_or_default();

        if ports_match(current, desired) {
            debug!(name = %name, namespace = %self.namespace, "LoadBalancer ports unchanged");
            return Ok(());
        }

        let ports = with_allocated_node_ports(desired, current);
        spec.ports = Some(ports);

        self.client.replace_service(&svc).await.inspect_err(|e| {
            error!(
                name = %name,
                namespace = %self.namespace,
                error = %e,
                "Failed to update LoadBalancer service"
            )
        })?;

        info!(
            name = %name,
            namespace = %self.namespace,
            ports = desired.len(),
            "Updated LoadBalancer service ports"
        );
        Ok(())
    }

    /// Poll until the backing service reports an ingress point.
    ///
    /// The object returned by create is checked first; after that every poll
    /// re-reads it. A read error ends the wait immediately.
    async fn wait_for_ingress(
        &self,
        name: &str,
        created: Service,
        cancel: &CancellationToken,
    ) -> Result<LoadBalancerStatus, Error> {
        if has_ingress(&created) {
            return Ok(load_balancer_status(&created));
        }

        let timeout = self.config.poll_timeout();
        let interval = self.config.poll_interval();
        let deadline = Instant::now() + timeout;

        loop {
            let current = self
                .client
                .get_service(name, &self.namespace)
                .await
                .inspect_err(|e| self.log_lookup_error(name, e))?;

            if let Some(svc) = current.filter(has_ingress) {
                info!(name = %name, namespace = %self.namespace, "LoadBalancer ingress assigned");
                return Ok(load_balancer_status(&svc));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::ConvergenceTimeout {
                    name: name.to_string(),
                    namespace: self.namespace.clone(),
                    timeout,
                });
            }

            debug!(name = %name, namespace = %self.namespace, "Waiting for LoadBalancer ingress");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled {
                        context: format!("waiting for load balancer {}/{}", self.namespace, name),
                    });
                }
                _ = tokio::time::sleep(interval.min(deadline - now)) => {}
            }
        }
    }
}

#[async_trait]
impl LoadBalancer for DvpLoadBalancer {
    fn load_balancer_name(&self, _cluster_name: &str, service: &Service) -> String {
        default_load_balancer_name(service)
    }

    async fn get_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
    ) -> Result<Option<LoadBalancerStatus>, Error> {
        let name = self.load_balancer_name(cluster_name, service);
        let svc = self
            .lookup(&name)
            .await
            .into_option()
            .inspect_err(|e| self.log_lookup_error(&name, e))?;
        Ok(svc.as_ref().map(load_balancer_status))
    }

    async fn ensure_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
        _nodes: &[Node],
        cancel: &CancellationToken,
    ) -> Result<LoadBalancerStatus, Error> {
        let name = self.load_balancer_name(cluster_name, service);
        let existing = self
            .lookup(&name)
            .await
            .into_option()
            .inspect_err(|e| self.log_lookup_error(&name, e))?;
        let ports = desired_ports(service);

        if let Some(svc) = existing {
            let status = load_balancer_status(&svc);
            self.sync_ports(svc, &ports).await?;
            return Ok(status);
        }

        let labels = desired_labels(service, cluster_name, &self.infra_labels);
        let svc = self.build_service(&name, service, labels, ports);
        let created = self.client.create_service(&svc).await.inspect_err(|e| {
            error!(
                name = %name,
                namespace = %self.namespace,
                error = %e,
                "Failed to create LoadBalancer service"
            )
        })?;
        info!(
            name = %name,
            namespace = %self.namespace,
            tenant_service = %service.metadata.name.as_deref().unwrap_or_default(),
            cluster = %cluster_name,
            "Created LoadBalancer service"
        );

        self.wait_for_ingress(&name, created, cancel)
            .await
            .inspect_err(|e| {
                error!(
                    name = %name,
                    namespace = %self.namespace,
                    error = %e,
                    "Failed to poll LoadBalancer service"
                )
            })
    }

    async fn update_load_balancer(
        &self,
        cluster_name: &str,
        service: &Service,
        _nodes: &[Node],
    ) -> Result<(), Error> {
        let name = self.load_balancer_name(cluster_name, service);
        let svc = self
            .lookup(&name)
            .await
            .found_or_else(|| Error::not_found("Service", &name, &self.namespace))
            .inspect_err(|e| self.log_lookup_error(&name, e))?;

        self.sync_ports(svc, &desired_ports(service)).await
    }

    async fn ensure_load_balancer_deleted(
        &self,
        cluster_name: &str,
        service: &Service,
    ) -> Result<(), Error> {
        let name = self.load_balancer_name(cluster_name, service);
        let existing = self
            .lookup(&name)
            .await
            .into_option()
            .inspect_err(|e| self.log_lookup_error(&name, e))?;

        if existing.is_none() {
            debug!(name = %name, namespace = %self.namespace, "LoadBalancer service already absent");
            return Ok(());
        }

        self.client
            .delete_service(&name, &self.namespace)
            .await
            .inspect_err(|e| {
                error!(
                    name = %name,
                    namespace = %self.namespace,
                    error = %e,
                    "Failed to delete LoadBalancer service"
                )
            })?;
        info!(name = %name, namespace = %self.namespace, "Deleted LoadBalancer service");
        Ok(())
    }
}
