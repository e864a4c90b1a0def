use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::{self as virt_error, ErrorNumber};
use virt::network::Network;
use virt::sys;

use super::{ChangeScope, DomainInfo, DomainState, Toolstack};
use crate::error::AgentVirtError;

struct ConnGuard(Connect);

impl std::ops::Deref for ConnGuard {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.0
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.close().ok();
    }
}

/// Only a missing-domain error means the domain is absent. Denied access or
/// a dropped connection is reported as an error.
fn is_missing_domain(code: ErrorNumber) -> bool {
    matches!(code, ErrorNumber::NoDomain)
}

/// [`Toolstack`] backed by a libvirt connection.
pub struct LibvirtToolstack {
    conn: ConnGuard,
    uri: String,
}

impl LibvirtToolstack {
    pub fn connect(uri: &str) -> Result<Self, AgentVirtError> {
        // Errors surface through Result only; libvirt would otherwise print
        // them to stderr as well.
        virt_error::clear_error_callback();

        let conn = Connect::open(Some(uri))
            .map(ConnGuard)
            .map_err(|e| AgentVirtError::Libvirt {
                message: format!("failed to connect to libvirt: {e}"),
                hint: format!("ensure libvirtd is running and you have access to {uri}"),
            })?;
        tracing::debug!(uri, "connected to libvirt");
        Ok(Self {
            conn,
            uri: uri.to_string(),
        })
    }

    fn lookup(&self, name: &str) -> Result<Domain, AgentVirtError> {
        Domain::lookup_by_name(&self.conn, name).map_err(|e| AgentVirtError::Libvirt {
            message: format!("domain '{name}' not found: {e}"),
            hint: format!("check `virsh -c {} list --all`", self.uri),
        })
    }

    fn modify_flags(scope: ChangeScope) -> u32 {
        match scope {
            ChangeScope::LiveAndPersistent => {
                sys::VIR_DOMAIN_AFFECT_LIVE as u32 | sys::VIR_DOMAIN_AFFECT_CONFIG as u32
            }
            ChangeScope::PersistentOnly => sys::VIR_DOMAIN_AFFECT_CONFIG as u32,
        }
    }
}

impl Toolstack for LibvirtToolstack {
    fn ensure_network(&self, network: &str) -> Result<(), AgentVirtError> {
        let net = Network::lookup_by_name(&self.conn, network).map_err(|_| {
            AgentVirtError::Libvirt {
                message: format!("network '{network}' not found"),
                hint: format!(
                    "run `sudo virsh net-define /usr/share/libvirt/networks/{network}.xml && sudo virsh net-start {network}`"
                ),
            }
        })?;

        if !net.is_active().unwrap_or(false) {
            tracing::info!(network, "starting inactive network");
            net.create().map_err(|e| AgentVirtError::Libvirt {
                message: format!("failed to start network '{network}': {e}"),
                hint: format!("try `sudo virsh net-start {network}`"),
            })?;
        }
        Ok(())
    }

    fn domain_state(&self, name: &str) -> Result<DomainState, AgentVirtError> {
        let dom = match Domain::lookup_by_name(&self.conn, name) {
            Ok(dom) => dom,
            Err(e) if is_missing_domain(e.code()) => return Ok(DomainState::Absent),
            Err(e) => {
                return Err(AgentVirtError::Libvirt {
                    message: format!("failed to look up domain '{name}': {e}"),
                    hint: format!("check access with `virsh -c {} list --all`", self.uri),
                });
            }
        };
        let active = dom.is_active().map_err(|e| AgentVirtError::Libvirt {
            message: format!("failed to query state of '{name}': {e}"),
            hint: "check libvirt permissions".into(),
        })?;
        Ok(if active {
            DomainState::Running
        } else {
            DomainState::Stopped
        })
    }

    fn domain_info(&self, name: &str) -> Result<DomainInfo, AgentVirtError> {
        let info = self
            .lookup(name)?
            .get_info()
            .map_err(|e| AgentVirtError::Libvirt {
                message: format!("failed to query info of '{name}': {e}"),
                hint: "the domain may still be starting".into(),
            })?;
        Ok(DomainInfo {
            vcpus: info.nr_virt_cpu,
            memory_kib: info.memory,
            max_memory_kib: info.max_mem,
        })
    }

    fn domain_xml(&self, name: &str) -> Result<String, AgentVirtError> {
        self.lookup(name)?
            .get_xml_desc(sys::VIR_DOMAIN_XML_INACTIVE)
            .map_err(|e| AgentVirtError::Libvirt {
                message: format!("failed to read definition of '{name}': {e}"),
                hint: "check libvirt permissions".into(),
            })
    }

    fn define_and_start(&self, xml: &str) -> Result<(), AgentVirtError> {
        let dom = Domain::define_xml(&self.conn, xml).map_err(|e| AgentVirtError::Libvirt {
            message: format!("failed to define domain: {e}"),
            hint: "check the generated domain XML for errors".into(),
        })?;
        dom.create().map_err(|e| AgentVirtError::Libvirt {
            message: format!("failed to start domain: {e}"),
            hint: format!("check `virsh -c {} start <name>` for details", self.uri),
        })?;
        Ok(())
    }

    fn start(&self, name: &str) -> Result<(), AgentVirtError> {
        self.lookup(name)?
            .create()
            .map_err(|e| AgentVirtError::Libvirt {
                message: format!("failed to start domain '{name}': {e}"),
                hint: format!("check `virsh -c {} start {name}` for details", self.uri),
            })?;
        Ok(())
    }

    fn shutdown(&self, name: &str) -> Result<(), AgentVirtError> {
        self.lookup(name)?
            .shutdown()
            .map_err(|e| AgentVirtError::Libvirt {
                message: format!("shutdown of '{name}' failed: {e}"),
                hint: "VM may not support ACPI shutdown".into(),
            })?;
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<(), AgentVirtError> {
        self.lookup(name)?
            .destroy()
            .map_err(|e| AgentVirtError::Libvirt {
                message: format!("force stop of '{name}' failed: {e}"),
                hint: "check libvirt permissions".into(),
            })?;
        Ok(())
    }

    fn undefine(&self, name: &str) -> Result<(), AgentVirtError> {
        self.lookup(name)?
            .undefine()
            .map_err(|e| AgentVirtError::Libvirt {
                message: format!("failed to undefine domain '{name}': {e}"),
                hint: "check libvirt permissions".into(),
            })?;
        Ok(())
    }

    fn set_vcpus(
        &self,
        name: &str,
        count: u32,
        scope: ChangeScope,
    ) -> Result<(), AgentVirtError> {
        let dom = self.lookup(name)?;
        if scope == ChangeScope::PersistentOnly {
            // Raising the count past the configured maximum needs the maximum
            // raised first.
            let flags = sys::VIR_DOMAIN_VCPU_MAXIMUM as u32 | sys::VIR_DOMAIN_AFFECT_CONFIG as u32;
            if let Err(e) = dom.set_vcpus_flags(count, flags) {
                tracing::debug!(name, count, "raising vCPU maximum failed: {e}");
            }
        }
        dom.set_vcpus_flags(count, Self::modify_flags(scope))
            .map_err(|e| AgentVirtError::Libvirt {
                message: format!("failed to set {count} vCPUs on '{name}': {e}"),
                hint: format!("try `virsh -c {} setvcpus {name} {count} --config`", self.uri),
            })?;
        Ok(())
    }

    fn set_memory(
        &self,
        name: &str,
        memory_kib: u64,
        scope: ChangeScope,
    ) -> Result<(), AgentVirtError> {
        let dom = self.lookup(name)?;
        if scope == ChangeScope::PersistentOnly {
            let flags = sys::VIR_DOMAIN_MEM_MAXIMUM as u32 | sys::VIR_DOMAIN_AFFECT_CONFIG as u32;
            if let Err(e) = dom.set_memory_flags(memory_kib, flags) {
                tracing::debug!(name, memory_kib, "raising memory maximum failed: {e}");
            }
        }
        dom.set_memory_flags(memory_kib, Self::modify_flags(scope))
            .map_err(|e| AgentVirtError::Libvirt {
                message: format!("failed to set memory of '{name}' to {memory_kib} KiB: {e}"),
                hint: format!(
                    "try `virsh -c {} setmaxmem {name} {memory_kib}K --config && virsh -c {} setmem {name} {memory_kib}K --config`",
                    self.uri, self.uri
                ),
            })?;
        Ok(())
    }

    fn attach_device(
        &self,
        name: &str,
        xml: &str,
        scope: ChangeScope,
    ) -> Result<(), AgentVirtError> {
        self.lookup(name)?
            .attach_device_flags(xml, Self::modify_flags(scope))
            .map_err(|e| AgentVirtError::Libvirt {
                message: format!("failed to attach device to '{name}': {e}"),
                hint: format!(
                    "save the device XML to a file and run `virsh -c {} attach-device {name} FILE --config`",
                    self.uri
                ),
            })?;
        Ok(())
    }
}
