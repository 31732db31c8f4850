//! Virtual machine lookup by name or provider ID

use std::sync::Arc;

use tracing::error;

use dvp_common::crd::VirtualMachine;
use dvp_common::{parse_provider_id, Error, Lookup};

use crate::client::InfraClient;

/// Kind reported in not-found errors for virtual machines
pub const INSTANCE_KIND: &str = "VirtualMachine";

/// Fetches virtual machines with the strategies the host cluster needs
#[derive(Clone)]
pub struct InstanceGetter {
    client: Arc<dyn InfraClient>,
}

impl InstanceGetter {
    /// Create a getter over the given infrastructure client
    pub fn new(client: Arc<dyn InfraClient>) -> Self {
        Self { client }
    }

    /// Look up a virtual machine by name
    pub async fn get_by_name(&self, name: &str, namespace: &str) -> Lookup<VirtualMachine> {
        Lookup::from(self.client.get_virtual_machine(name, namespace).await)
    }

    /// Look up a virtual machine by the provider ID recorded on a node
    ///
    /// A malformed ID is reported as `Failed(InvalidProviderId)` without
    /// touching the API.
    pub async fn get_by_provider_id(
        &self,
        provider_id: &str,
        namespace: &str,
    ) -> Lookup<VirtualMachine> {
        match parse_provider_id(provider_id) {
            Ok(name) => self.get_by_name(name, namespace).await,
            Err(e) => {
                error!(provider_id = %provider_id, error = %e, "Failed to parse provider ID");
                Lookup::Failed(e)
            }
        }
    }
}

/// Error for a virtual machine that should exist but does not
pub fn instance_not_found(name: &str, namespace: &str) -> Error {
    Error::not_found(INSTANCE_KIND, name, namespace)
}
