//! DVP VirtualMachine, the compute backing of a tenant cluster node

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Virtual machine managed by the virtualization platform.
///
/// The provider never writes these; it only reads the observed status.
///
/// Example:
/// ```yaml
/// apiVersion: virtualization.deckhouse.io/v1alpha2
/// kind: VirtualMachine
/// metadata:
///   name: demo-worker-0
///   namespace: tenant-infra
/// status:
///   phase: Running
///   ipAddress: 10.66.10.12
///   nodeName: virt-node-3
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "virtualization.deckhouse.io",
    version = "v1alpha2",
    kind = "VirtualMachine",
    namespaced,
    status = "VirtualMachineStatus",
    shortname = "vm"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Power management policy (AlwaysOn, Manual, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_policy: Option<String>,

    /// Name of the VirtualMachineClass sizing this VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine_class_name: Option<String>,
}

/// Observed state of a virtual machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Power phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<MachinePhase>,

    /// Primary internal IP address, empty until the guest network is up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    /// Infrastructure node currently hosting the VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

/// Virtual machine power phase
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MachinePhase {
    /// Waiting for resources
    Pending,
    /// Powering on
    Starting,
    /// Guest is running
    Running,
    /// Running with a failed condition
    Degraded,
    /// Live migration in progress
    Migrating,
    /// Powering off
    Stopping,
    /// Powered off
    Stopped,
    /// Execution paused
    Pause,
    /// Being deleted
    Terminating,
    /// Phase introduced by a newer platform version
    #[serde(other)]
    Unknown,
}

impl VirtualMachine {
    /// Observed power phase, if reported
    pub fn phase(&self) -> Option<MachinePhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// True when the VM is powered off
    pub fn is_stopped(&self) -> bool {
        self.phase() == Some(MachinePhase::Stopped)
    }

    /// Internal IP address, `None` when unset or empty
    pub fn ip_address(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.ip_address.as_deref())
            .filter(|ip| !ip.is_empty())
    }

    /// Name of the hosting infrastructure node, `None` when unset or empty
    pub fn node_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .filter(|n| !n.is_empty())
    }
}
