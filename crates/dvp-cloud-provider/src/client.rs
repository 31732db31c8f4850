//! Infrastructure cluster client
//!
//! Provides a trait-based abstraction over the handful of reads and writes the
//! provider performs against the virtualization cluster, allowing tests to
//! mock Kubernetes interactions while production code uses real API calls.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use dvp_common::crd::VirtualMachine;
use dvp_common::Error;

/// Field manager recorded on objects this provider writes
pub const FIELD_MANAGER: &str = "dvp-cloud-controller-manager";

/// Trait abstracting infrastructure cluster operations
///
/// Getters return `Ok(None)` when the object does not exist so callers can
/// tell absence apart from a failed read.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InfraClient: Send + Sync {
    /// Get a VirtualMachine by name and namespace
    async fn get_virtual_machine(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<VirtualMachine>, Error>;

    /// Get an infrastructure Node by name
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;

    /// Get a Service by name and namespace
    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error>;

    /// Create a Service, returning the object as stored by the API server
    async fn create_service(&self, service: &Service) -> Result<Service, Error>;

    /// Replace a Service; fails with a conflict when `service` is stale
    async fn replace_service(&self, service: &Service) -> Result<Service, Error>;

    /// Delete a Service by name and namespace
    async fn delete_service(&self, name: &str, namespace: &str) -> Result<(), Error>;
}

/// Real client implementation
pub struct InfraClientImpl {
    client: Client,
}

impl InfraClientImpl {
    /// Create a new InfraClientImpl
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn object_coordinates(service: &Service) -> Result<(&str, &str), Error> {
    let name = service
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("infra_client", "service has no name"))?;
    let namespace = service
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("infra_client", "service has no namespace"))?;
    Ok((name, namespace))
}

#[async_trait]
impl InfraClient for InfraClientImpl {
    async fn get_virtual_machine(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<VirtualMachine>, Error> {
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(vm) => Ok(Some(vm)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(node) => Ok(Some(node)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(svc) => Ok(Some(svc)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_service(&self, service: &Service) -> Result<Service, Error> {
        let (_, namespace) = object_coordinates(service)?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(api.create(&params, service).await?)
    }

    async fn replace_service(&self, service: &Service) -> Result<Service, Error> {
        let (name, namespace) = object_coordinates(service)?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(api.replace(name, &params, service).await?)
    }

    async fn delete_service(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(name = %name, namespace = %namespace, "service already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
