//! Custom resources read from the infrastructure cluster
//!
//! These are partial definitions: only the fields the provider consumes are
//! modelled, everything else on the live objects is ignored on deserialization.

mod virtual_machine;

pub use virtual_machine::{MachinePhase, VirtualMachine, VirtualMachineSpec, VirtualMachineStatus};
