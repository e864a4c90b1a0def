//! In-memory toolstack for lifecycle tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};

use super::{ChangeScope, DomainInfo, DomainState, Toolstack};
use crate::error::AgentVirtError;

#[derive(Debug, Clone)]
pub struct FakeDomain {
    pub running: bool,
    pub vcpus: u32,
    pub memory_kib: u64,
    /// Tags in the persistent definition.
    pub filesystems: Vec<String>,
}

/// Knobs for simulating toolstack failures.
#[derive(Debug, Default)]
pub struct FakeBehavior {
    /// The domain never reports running after boot.
    pub never_ready: bool,
    /// ACPI shutdown requests are ignored.
    pub ignore_shutdown: bool,
    pub fail_start: bool,
    /// State queries fail, as with a denied or dropped connection.
    pub fail_state: bool,
    pub fail_live_attach: HashSet<String>,
    pub fail_attach: HashSet<String>,
    pub fail_live_update: bool,
    pub fail_update: bool,
}

#[derive(Default)]
pub struct FakeToolstack {
    pub domains: RefCell<BTreeMap<String, FakeDomain>>,
    pub calls: RefCell<Vec<String>>,
    pub behavior: FakeBehavior,
}

impl FakeToolstack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            ..Self::default()
        }
    }

    pub fn insert(&self, name: &str, domain: FakeDomain) {
        self.domains.borrow_mut().insert(name.to_string(), domain);
    }

    pub fn domain(&self, name: &str) -> Option<FakeDomain> {
        self.domains.borrow().get(name).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls.borrow().iter().any(|c| c.starts_with(prefix))
    }

    fn record(&self, call: String) {
        self.calls.borrow_mut().push(call);
    }

    fn missing(name: &str) -> AgentVirtError {
        AgentVirtError::Libvirt {
            message: format!("domain '{name}' not found"),
            hint: String::new(),
        }
    }

    fn failure(message: &str) -> AgentVirtError {
        AgentVirtError::Libvirt {
            message: message.to_string(),
            hint: String::new(),
        }
    }

    fn with_domain<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut FakeDomain) -> R,
    ) -> Result<R, AgentVirtError> {
        let mut domains = self.domains.borrow_mut();
        let dom = domains.get_mut(name).ok_or_else(|| Self::missing(name))?;
        Ok(f(dom))
    }
}

fn xml_value<'a>(xml: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = xml.find(open)? + open.len();
    let end = xml[start..].find(close)? + start;
    Some(&xml[start..end])
}

impl Toolstack for FakeToolstack {
    fn ensure_network(&self, network: &str) -> Result<(), AgentVirtError> {
        self.record(format!("ensure_network {network}"));
        Ok(())
    }

    fn domain_state(&self, name: &str) -> Result<DomainState, AgentVirtError> {
        if self.behavior.fail_state {
            return Err(Self::failure("access denied"));
        }
        Ok(match self.domains.borrow().get(name) {
            None => DomainState::Absent,
            Some(d) if d.running && !self.behavior.never_ready => DomainState::Running,
            Some(_) => DomainState::Stopped,
        })
    }

    fn domain_info(&self, name: &str) -> Result<DomainInfo, AgentVirtError> {
        self.with_domain(name, |d| DomainInfo {
            vcpus: d.vcpus,
            memory_kib: d.memory_kib,
            max_memory_kib: d.memory_kib,
        })
    }

    fn domain_xml(&self, name: &str) -> Result<String, AgentVirtError> {
        self.with_domain(name, |d| {
            let shares: String = d
                .filesystems
                .iter()
                .map(|t| format!("<filesystem type='mount'><target dir='{t}'/></filesystem>"))
                .collect();
            format!("<domain><name>{name}</name><devices>{shares}</devices></domain>")
        })
    }

    fn define_and_start(&self, xml: &str) -> Result<(), AgentVirtError> {
        let name = xml_value(xml, "<name>", "</name>")
            .ok_or_else(|| Self::failure("no <name> in XML"))?
            .to_string();
        let vcpus = xml_value(xml, "<vcpu>", "</vcpu>")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        let memory_kib = xml_value(xml, "<memory unit='KiB'>", "</memory>")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        self.record(format!("define_and_start {name}"));
        if self.behavior.fail_start {
            return Err(Self::failure("start failed"));
        }
        let mut domains = self.domains.borrow_mut();
        if domains.contains_key(&name) {
            return Err(Self::failure("domain already exists"));
        }
        domains.insert(
            name,
            FakeDomain {
                running: true,
                vcpus,
                memory_kib,
                filesystems: Vec::new(),
            },
        );
        Ok(())
    }

    fn start(&self, name: &str) -> Result<(), AgentVirtError> {
        self.record(format!("start {name}"));
        if self.behavior.fail_start {
            return Err(Self::failure("start failed"));
        }
        self.with_domain(name, |d| d.running = true)
    }

    fn shutdown(&self, name: &str) -> Result<(), AgentVirtError> {
        self.record(format!("shutdown {name}"));
        let ignore = self.behavior.ignore_shutdown;
        self.with_domain(name, |d| {
            if !ignore {
                d.running = false;
            }
        })
    }

    fn destroy(&self, name: &str) -> Result<(), AgentVirtError> {
        self.record(format!("destroy {name}"));
        self.with_domain(name, |d| d.running = false)
    }

    fn undefine(&self, name: &str) -> Result<(), AgentVirtError> {
        self.record(format!("undefine {name}"));
        self.domains
            .borrow_mut()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::missing(name))
    }

    fn set_vcpus(
        &self,
        name: &str,
        count: u32,
        scope: ChangeScope,
    ) -> Result<(), AgentVirtError> {
        self.record(format!("set_vcpus {name} {count} {scope:?}"));
        self.check_update(scope)?;
        self.with_domain(name, |d| d.vcpus = count)
    }

    fn set_memory(
        &self,
        name: &str,
        memory_kib: u64,
        scope: ChangeScope,
    ) -> Result<(), AgentVirtError> {
        self.record(format!("set_memory {name} {memory_kib} {scope:?}"));
        self.check_update(scope)?;
        self.with_domain(name, |d| d.memory_kib = memory_kib)
    }

    fn attach_device(
        &self,
        name: &str,
        xml: &str,
        scope: ChangeScope,
    ) -> Result<(), AgentVirtError> {
        let tag = xml_value(xml, "<target dir='", "'")
            .ok_or_else(|| Self::failure("no target in device XML"))?
            .to_string();
        self.record(format!("attach {name} {tag} {scope:?}"));
        if self.behavior.fail_attach.contains(&tag) {
            return Err(Self::failure("attach failed"));
        }
        if scope == ChangeScope::LiveAndPersistent && self.behavior.fail_live_attach.contains(&tag)
        {
            return Err(Self::failure("live attach failed"));
        }
        self.with_domain(name, |d| d.filesystems.push(tag))
    }
}

impl FakeToolstack {
    fn check_update(&self, scope: ChangeScope) -> Result<(), AgentVirtError> {
        if self.behavior.fail_update
            || (scope == ChangeScope::LiveAndPersistent && self.behavior.fail_live_update)
        {
            return Err(Self::failure("update failed"));
        }
        Ok(())
    }
}
