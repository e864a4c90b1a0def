//! The virtualization toolstack as seen by the lifecycle controller.
//!
//! Everything the controller needs from libvirt goes through [`Toolstack`], so
//! reconciliation can run against an in-memory fake in tests.

pub mod libvirt;

#[cfg(test)]
pub mod fake;

use crate::error::AgentVirtError;

/// Where a named domain currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Absent,
    Stopped,
    Running,
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DomainState::Absent => "not defined",
            DomainState::Stopped => "stopped",
            DomainState::Running => "running",
        })
    }
}

/// Which copy of the definition a change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeScope {
    /// The running domain and its persistent config.
    LiveAndPersistent,
    /// The persistent config only; takes effect on next boot.
    PersistentOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainInfo {
    pub vcpus: u32,
    pub memory_kib: u64,
    pub max_memory_kib: u64,
}

pub trait Toolstack {
    /// Start the named NAT network if it is defined but inactive.
    fn ensure_network(&self, network: &str) -> Result<(), AgentVirtError>;

    fn domain_state(&self, name: &str) -> Result<DomainState, AgentVirtError>;

    /// Runtime metadata; only succeeds once the hypervisor answers for the domain.
    fn domain_info(&self, name: &str) -> Result<DomainInfo, AgentVirtError>;

    /// Persistent (inactive) definition XML.
    fn domain_xml(&self, name: &str) -> Result<String, AgentVirtError>;

    /// Define a persistent domain from XML and boot it.
    fn define_and_start(&self, xml: &str) -> Result<(), AgentVirtError>;

    fn start(&self, name: &str) -> Result<(), AgentVirtError>;

    /// Request an ACPI shutdown. Returns before the guest has stopped.
    fn shutdown(&self, name: &str) -> Result<(), AgentVirtError>;

    /// Force the domain off.
    fn destroy(&self, name: &str) -> Result<(), AgentVirtError>;

    /// Remove the definition. Disk images are never touched.
    fn undefine(&self, name: &str) -> Result<(), AgentVirtError>;

    fn set_vcpus(&self, name: &str, count: u32, scope: ChangeScope)
    -> Result<(), AgentVirtError>;

    fn set_memory(
        &self,
        name: &str,
        memory_kib: u64,
        scope: ChangeScope,
    ) -> Result<(), AgentVirtError>;

    fn attach_device(&self, name: &str, xml: &str, scope: ChangeScope)
    -> Result<(), AgentVirtError>;
}
