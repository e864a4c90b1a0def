//! VM lifecycle reconciliation.
//!
//! A single pass takes a VM from whatever state libvirt reports (absent,
//! stopped, running) to running with the desired mounts attached:
//!
//! 1. Compare the desired mount signature with the stored one; on mismatch,
//!    stop and undefine the existing definition (the disk is kept).
//! 2. Create, start or reuse the domain, then poll until it is ready.
//! 3. Attach each mount, falling back to a persistent-only attach.
//! 4. Store the new signature.
//!
//! Only precondition and create/start failures abort. Resource updates and
//! attach failures are logged, since the guest-side bootstrap can retry.

use std::time::Duration;

use indicatif::ProgressBar;

use crate::domain_xml::{self, DomainSpec};
use crate::error::AgentVirtError;
use crate::mounts::{self, MountSpec};
use crate::state::SignatureStore;
use crate::toolstack::{ChangeScope, DomainInfo, DomainState, Toolstack};

/// Attempts to wait for an ACPI shutdown before forcing the domain off.
const SHUTDOWN_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval: Duration::from_secs(1),
        }
    }
}

/// Resource changes requested for an existing domain (`--cpu`/`--ram`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUpdate {
    pub cpus: Option<u32>,
    pub memory_mib: Option<u64>,
}

/// What reconciliation should converge to.
#[derive(Debug, Clone)]
pub struct VmRequest<'a> {
    /// Definition used when the domain has to be (re)created.
    pub domain: DomainSpec<'a>,
    pub mounts: &'a [MountSpec],
    /// Applied only to a domain that already exists.
    pub update: ResourceUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    /// Undefined because the mounts changed, then created again.
    Recreated,
    Started,
    Reused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// The poll cap elapsed; we carried on anyway.
    TimedOut,
    /// The domain was already running.
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOutcome {
    Unchanged,
    Live,
    /// Written to the persistent config; applies after the next boot.
    PersistentOnly,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountReport {
    pub tag: String,
    pub outcome: ChangeOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub action: Action,
    pub readiness: Readiness,
    pub cpus: Option<ChangeOutcome>,
    pub memory: Option<ChangeOutcome>,
    pub mounts: Vec<MountReport>,
}

impl ReconcileReport {
    /// Mounts that still need a reboot or manual attention.
    pub fn pending_mounts(&self) -> impl Iterator<Item = &MountReport> {
        self.mounts
            .iter()
            .filter(|m| !matches!(m.outcome, ChangeOutcome::Live | ChangeOutcome::Unchanged))
    }
}

/// Keep the old definition's vCPUs and memory unless new values were requested.
fn carry_over_resources(domain: &mut DomainSpec<'_>, update: ResourceUpdate, info: DomainInfo) {
    if update.cpus.is_none() {
        domain.cpus = info.vcpus;
    }
    if update.memory_mib.is_none() {
        domain.memory_mib = info.max_memory_kib / 1024;
    }
}

pub struct Controller<'a, T: Toolstack> {
    toolstack: &'a T,
    readiness: ReadinessPolicy,
}

impl<'a, T: Toolstack> Controller<'a, T> {
    pub fn new(toolstack: &'a T, readiness: ReadinessPolicy) -> Self {
        Self {
            toolstack,
            readiness,
        }
    }

    pub async fn reconcile(
        &self,
        req: &VmRequest<'_>,
        network: &str,
        store: &SignatureStore,
    ) -> Result<ReconcileReport, AgentVirtError> {
        let name = req.domain.name;
        mounts::validate_mounts(req.mounts)?;
        self.toolstack.ensure_network(network)?;

        let desired = mounts::signature(req.mounts);
        let stored = store.load()?;
        let mut state = self.toolstack.domain_state(name)?;
        tracing::debug!(name, %state, "current domain state");

        let mut domain = req.domain.clone();
        let mut recreated = false;
        if state != DomainState::Absent && mounts::mounts_changed(&desired, stored.as_deref()) {
            tracing::info!(name, "mounts changed, recreating VM definition (disk is kept)");
            println!("Mounts changed, recreating VM '{name}' (disk is kept)...");
            match self.toolstack.domain_info(name) {
                Ok(info) => carry_over_resources(&mut domain, req.update, info),
                Err(e) => tracing::warn!(name, "could not read current resources: {e}"),
            }
            if state == DomainState::Running {
                self.stop(name).await?;
            }
            self.toolstack.undefine(name)?;
            store.clear()?;
            state = DomainState::Absent;
            recreated = true;
        }

        let mut cpus = None;
        let mut memory = None;
        let (action, readiness) = match state {
            DomainState::Absent => {
                println!("Creating VM '{name}'...");
                let xml = domain_xml::generate_domain_xml(&domain);
                self.toolstack.define_and_start(&xml)?;
                tracing::info!(name, "domain defined and started");
                let action = if recreated {
                    Action::Recreated
                } else {
                    Action::Created
                };
                (action, self.wait_until_ready(name).await)
            }
            DomainState::Stopped => {
                cpus = self.update_vcpus(name, req.update.cpus, &[ChangeScope::PersistentOnly]);
                memory =
                    self.update_memory(name, req.update.memory_mib, &[ChangeScope::PersistentOnly]);
                println!("Starting VM '{name}'...");
                self.toolstack.start(name)?;
                tracing::info!(name, "domain started");
                (Action::Started, self.wait_until_ready(name).await)
            }
            DomainState::Running => {
                tracing::info!(name, "VM already running");
                let scopes = [ChangeScope::LiveAndPersistent, ChangeScope::PersistentOnly];
                cpus = self.update_vcpus(name, req.update.cpus, &scopes);
                memory = self.update_memory(name, req.update.memory_mib, &scopes);
                (Action::Reused, Readiness::AlreadyRunning)
            }
        };

        let mounts = self.attach_mounts(name, req.mounts);
        store.save(&desired)?;

        Ok(ReconcileReport {
            action,
            readiness,
            cpus,
            memory,
            mounts,
        })
    }

    /// Stop (if running) and undefine a domain. Returns whether it existed.
    pub async fn teardown(&self, name: &str) -> Result<bool, AgentVirtError> {
        match self.toolstack.domain_state(name)? {
            DomainState::Absent => Ok(false),
            state => {
                if state == DomainState::Running {
                    self.stop(name).await?;
                }
                self.toolstack.undefine(name)?;
                tracing::info!(name, "domain undefined");
                Ok(true)
            }
        }
    }

    /// Poll until the domain runs and answers a metadata query.
    ///
    /// Never fails: once the cap elapses we log and proceed.
    async fn wait_until_ready(&self, name: &str) -> Readiness {
        let spinner = ProgressBar::new_spinner();
        spinner.set_message(format!("Waiting for VM '{name}' to come up..."));
        spinner.enable_steady_tick(Duration::from_millis(120));

        for attempt in 1..=self.readiness.attempts {
            let running = matches!(
                self.toolstack.domain_state(name),
                Ok(DomainState::Running)
            );
            if running && self.toolstack.domain_info(name).is_ok() {
                spinner.finish_and_clear();
                tracing::debug!(name, attempt, "domain ready");
                return Readiness::Ready;
            }
            if attempt < self.readiness.attempts {
                tokio::time::sleep(self.readiness.interval).await;
            }
        }

        spinner.finish_and_clear();
        tracing::warn!(
            name,
            attempts = self.readiness.attempts,
            "VM did not report ready in time, continuing anyway"
        );
        Readiness::TimedOut
    }

    /// ACPI shutdown with a bounded wait, then force.
    async fn stop(&self, name: &str) -> Result<(), AgentVirtError> {
        match self.toolstack.shutdown(name) {
            Ok(()) => {
                let spinner = ProgressBar::new_spinner();
                spinner.set_message(format!("Shutting down VM '{name}'..."));
                spinner.enable_steady_tick(Duration::from_millis(120));
                for _ in 0..SHUTDOWN_ATTEMPTS {
                    if self.toolstack.domain_state(name)? != DomainState::Running {
                        spinner.finish_and_clear();
                        tracing::info!(name, "VM shut down");
                        return Ok(());
                    }
                    tokio::time::sleep(self.readiness.interval).await;
                }
                spinner.finish_and_clear();
                tracing::warn!(name, "ACPI shutdown timed out, force stopping");
            }
            Err(e) => tracing::warn!(name, "ACPI shutdown failed, force stopping: {e}"),
        }
        self.toolstack.destroy(name)
    }

    fn update_vcpus(
        &self,
        name: &str,
        wanted: Option<u32>,
        scopes: &[ChangeScope],
    ) -> Option<ChangeOutcome> {
        let count = wanted?;
        if self
            .toolstack
            .domain_info(name)
            .is_ok_and(|info| info.vcpus == count)
        {
            return Some(ChangeOutcome::Unchanged);
        }
        Some(self.apply(name, "vCPUs", scopes, |scope| {
            self.toolstack.set_vcpus(name, count, scope)
        }))
    }

    fn update_memory(
        &self,
        name: &str,
        wanted_mib: Option<u64>,
        scopes: &[ChangeScope],
    ) -> Option<ChangeOutcome> {
        let kib = wanted_mib? * 1024;
        if self
            .toolstack
            .domain_info(name)
            .is_ok_and(|info| info.memory_kib == kib)
        {
            return Some(ChangeOutcome::Unchanged);
        }
        Some(self.apply(name, "memory", scopes, |scope| {
            self.toolstack.set_memory(name, kib, scope)
        }))
    }

    /// Try each scope in order until one succeeds.
    fn apply(
        &self,
        name: &str,
        what: &str,
        scopes: &[ChangeScope],
        mut change: impl FnMut(ChangeScope) -> Result<(), AgentVirtError>,
    ) -> ChangeOutcome {
        let mut last_error = String::new();
        for &scope in scopes {
            match change(scope) {
                Ok(()) => {
                    tracing::info!(name, ?scope, "updated {what}");
                    return match scope {
                        ChangeScope::LiveAndPersistent => ChangeOutcome::Live,
                        ChangeScope::PersistentOnly => ChangeOutcome::PersistentOnly,
                    };
                }
                Err(e) => {
                    tracing::warn!(name, ?scope, "updating {what} failed: {e}");
                    last_error = e.to_string();
                }
            }
        }
        ChangeOutcome::Failed(last_error)
    }

    fn attach_mounts(&self, name: &str, mounts: &[MountSpec]) -> Vec<MountReport> {
        let existing = match self.toolstack.domain_xml(name) {
            Ok(xml) => xml,
            Err(e) => {
                tracing::debug!(name, "could not read definition: {e}");
                String::new()
            }
        };

        mounts
            .iter()
            .map(|mount| {
                let tag = mount.tag.as_str();
                let outcome = if domain_xml::has_filesystem_tag(&existing, tag) {
                    tracing::debug!(name, tag, "mount already attached");
                    ChangeOutcome::Unchanged
                } else {
                    let xml = domain_xml::filesystem_xml(mount);
                    let scopes = [ChangeScope::LiveAndPersistent, ChangeScope::PersistentOnly];
                    let outcome = self.apply(name, &format!("mount '{tag}'"), &scopes, |scope| {
                        self.toolstack.attach_device(name, &xml, scope)
                    });
                    if let ChangeOutcome::Failed(ref e) = outcome {
                        tracing::error!(
                            name,
                            tag,
                            source = %mount.source.display(),
                            "could not attach mount: {e}"
                        );
                    }
                    outcome
                };
                MountReport {
                    tag: tag.to_string(),
                    outcome,
                }
            })
            .collect()
    }
}
