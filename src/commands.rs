//! Command implementations wiring images, mounts, state and the lifecycle
//! controller together.

use std::path::{Path, PathBuf};

use console::style;
use facet::Facet;

use crate::cli::ResourceArgs;
use crate::config::{self, Settings};
use crate::domain_xml::{self, DomainSpec};
use crate::error::AgentVirtError;
use crate::lifecycle::{
    Action, ChangeOutcome, Controller, Readiness, ReadinessPolicy, ReconcileReport,
    ResourceUpdate, VmRequest,
};
use crate::mounts::{self, MountSpec};
use crate::state::{self, MountRecord, SignatureStore, VmLock};
use crate::toolstack::libvirt::LibvirtToolstack;
use crate::toolstack::{DomainState, Toolstack};
use crate::{guest, image, paths, preflight, util};

/// Installer ISO consumed by `create-base-image`.
pub const ISO_ENV: &str = "UBUNTU_ISO";

/// Resources requested on the command line.
fn resource_update(args: &ResourceArgs) -> Result<ResourceUpdate, AgentVirtError> {
    if let Some(cpus) = args.cpus {
        config::validate_cpus(cpus)?;
    }
    let memory_mib = args.ram.as_deref().map(util::parse_ram_mib).transpose()?;
    if let Some(mib) = memory_mib {
        config::validate_ram(mib)?;
    }
    Ok(ResourceUpdate {
        cpus: args.cpus,
        memory_mib,
    })
}

fn readiness(settings: &Settings) -> ReadinessPolicy {
    ReadinessPolicy {
        attempts: settings.config.readiness.attempts,
        interval: settings.poll_interval(),
    }
}

/// `BASE` is a name under `base/`, or a path to an existing image.
fn resolve_base(settings: &Settings, base: &str) -> Result<PathBuf, AgentVirtError> {
    let as_path = Path::new(base);
    if base.contains('/') || base.ends_with(".qcow2") {
        if as_path.is_file() {
            return Ok(as_path.to_path_buf());
        }
    } else {
        config::validate_name(base)?;
        let named = settings.layout.base_image(base);
        if named.is_file() {
            return Ok(named);
        }
        return Err(AgentVirtError::BaseImageNotFound {
            path: named.display().to_string(),
        });
    }
    Err(AgentVirtError::BaseImageNotFound {
        path: as_path.display().to_string(),
    })
}

fn require_dir(path: &Path) -> Result<PathBuf, AgentVirtError> {
    if !path.is_dir() {
        return Err(AgentVirtError::MountSourceNotFound {
            path: path.display().to_string(),
        });
    }
    path.canonicalize().map_err(|e| AgentVirtError::Io {
        context: format!("resolving {}", path.display()),
        source: e,
    })
}

fn ensure_setup_dir(settings: &Settings) -> Result<PathBuf, AgentVirtError> {
    let dir = settings.layout.setup_dir();
    std::fs::create_dir_all(&dir).map_err(|e| AgentVirtError::Io {
        context: format!("creating setup directory {}", dir.display()),
        source: e,
    })?;
    Ok(dir)
}

fn write_bootstrap(
    settings: &Settings,
    name: &str,
    mounts: &[MountSpec],
) -> Result<(), AgentVirtError> {
    let path = settings.layout.bootstrap_script(name);
    state::write_atomic(&path, &guest::bootstrap_script(name, mounts))?;
    tracing::debug!(path = %path.display(), "wrote guest bootstrap script");
    Ok(())
}

/// Connect to libvirt and make sure the NAT network is up.
fn connect(settings: &Settings) -> Result<LibvirtToolstack, AgentVirtError> {
    let toolstack = LibvirtToolstack::connect(settings.libvirt_uri())?;
    toolstack.ensure_network(&settings.config.libvirt.network)?;
    Ok(toolstack)
}

/// `create` after its preconditions: disk, mount record, then [`bring_up`].
async fn provision<T: Toolstack>(
    settings: &Settings,
    toolstack: &T,
    name: &str,
    base_path: &Path,
    read_dir: &Path,
    write_dir: &Path,
    update: ResourceUpdate,
) -> Result<ReconcileReport, AgentVirtError> {
    let layout = &settings.layout;
    let disk = layout.disk(name);
    if !disk.exists() {
        println!("Creating disk from {}...", base_path.display());
    }
    image::ensure_disk(base_path, &disk).await?;

    MountRecord {
        read_dir: read_dir.to_path_buf(),
        write_dir: write_dir.to_path_buf(),
    }
    .save(&layout.mount_record(name))?;

    bring_up(settings, toolstack, name, read_dir, write_dir, update).await
}

/// Shared tail of `create` and `run`: bootstrap script, reconcile, report.
async fn bring_up<T: Toolstack>(
    settings: &Settings,
    toolstack: &T,
    name: &str,
    read_dir: &Path,
    write_dir: &Path,
    update: ResourceUpdate,
) -> Result<ReconcileReport, AgentVirtError> {
    let layout = &settings.layout;
    let disk = layout.disk(name);
    let cfg = &settings.config;

    let setup_dir = ensure_setup_dir(settings)?;
    let mounts = mounts::standard_mounts(&setup_dir, read_dir, write_dir);
    write_bootstrap(settings, name, &mounts)?;

    let req = VmRequest {
        domain: DomainSpec {
            name,
            cpus: update.cpus.unwrap_or(cfg.defaults.cpus),
            memory_mib: update.memory_mib.unwrap_or(settings.default_ram_mib),
            disk: &disk,
            network: &cfg.libvirt.network,
            domain_type: &cfg.libvirt.domain_type,
            machine: &cfg.libvirt.machine,
            install_iso: None,
        },
        mounts: &mounts,
        update,
    };
    let store = SignatureStore::new(layout.signature(name));

    let report = Controller::new(toolstack, readiness(settings))
        .reconcile(&req, &cfg.libvirt.network, &store)
        .await?;

    print_report(name, &report);
    print_guest_commands(name, &mounts);
    Ok(report)
}

fn print_report(name: &str, report: &ReconcileReport) {
    let verb = match report.action {
        Action::Created => "created",
        Action::Recreated => "recreated",
        Action::Started => "started",
        Action::Reused => "already running",
    };
    println!("VM '{name}' {verb}.");
    if report.readiness == Readiness::TimedOut {
        println!(
            "{} VM did not report ready in time; mounts were attached anyway.",
            style("warning:").yellow().bold()
        );
    }
    for (what, outcome) in [("vCPUs", &report.cpus), ("memory", &report.memory)] {
        match outcome {
            Some(ChangeOutcome::PersistentOnly) => {
                println!("  {what}: updated, applies after the next reboot")
            }
            Some(ChangeOutcome::Failed(e)) => {
                println!(
                    "  {} {what} not updated: {e}",
                    style("warning:").yellow().bold()
                );
                println!("    shut the VM down and run `agent-virt run` with the same flags again");
            }
            _ => {}
        }
    }
    for m in report.pending_mounts() {
        match &m.outcome {
            ChangeOutcome::PersistentOnly => {
                println!("  mount '{}': attached, available after the next reboot", m.tag)
            }
            ChangeOutcome::Failed(e) => println!(
                "  {} mount '{}' not attached: {e}",
                style("error:").red().bold(),
                m.tag
            ),
            _ => {}
        }
    }
}

fn print_guest_commands(name: &str, mounts: &[MountSpec]) {
    println!();
    println!("{}", style("Inside the VM, run:").bold());
    for cmd in guest::guest_commands(name) {
        println!("  {cmd}");
    }
    println!();
    for m in mounts {
        let mode = if m.readonly { "ro" } else { "rw" };
        println!(
            "  {} -> {} ({mode})",
            m.source.display(),
            style(m.guest_path()).cyan()
        );
    }
}

// ── create / run ─────────────────────────────────────────

pub async fn create(
    settings: &Settings,
    resources: &ResourceArgs,
    base: &str,
    read_dir: &Path,
    write_dir: &Path,
    name: &str,
) -> Result<(), AgentVirtError> {
    config::validate_name(name)?;
    let update = resource_update(resources)?;
    let base_path = resolve_base(settings, base)?;
    let read_dir = require_dir(read_dir)?;
    let write_dir = require_dir(write_dir)?;

    preflight::check_host(settings).await?;
    let _lock = VmLock::acquire(name, settings.layout.lock(name))?;
    let toolstack = connect(settings)?;

    provision(settings, &toolstack, name, &base_path, &read_dir, &write_dir, update).await?;
    Ok(())
}

pub async fn run(
    settings: &Settings,
    resources: &ResourceArgs,
    name: &str,
) -> Result<(), AgentVirtError> {
    config::validate_name(name)?;
    let update = resource_update(resources)?;
    let layout = &settings.layout;

    let disk = layout.disk(name);
    if !disk.is_file() {
        return Err(AgentVirtError::VmNotCreated {
            name: name.to_string(),
            path: disk.display().to_string(),
        });
    }
    let record_path = layout.mount_record(name);
    let record = MountRecord::load(&record_path)?.ok_or_else(|| AgentVirtError::Validation {
        message: format!(
            "VM '{name}' has no mount record at {}; re-run `agent-virt create` for it",
            record_path.display()
        ),
    })?;
    let read_dir = require_dir(&record.read_dir)?;
    let write_dir = require_dir(&record.write_dir)?;

    preflight::check_host(settings).await?;
    let _lock = VmLock::acquire(name, layout.lock(name))?;
    let toolstack = connect(settings)?;

    bring_up(settings, &toolstack, name, &read_dir, &write_dir, update).await?;
    Ok(())
}

// ── create-base-image ────────────────────────────────────

pub async fn create_base_image(settings: &Settings, name: &str) -> Result<(), AgentVirtError> {
    config::validate_name(name)?;
    let iso = std::env::var_os(ISO_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| AgentVirtError::MissingEnv {
            variable: ISO_ENV.into(),
            hint: format!("export {ISO_ENV}=/path/to/ubuntu-live-server-amd64.iso"),
        })?;
    if !iso.is_file() {
        return Err(AgentVirtError::Validation {
            message: format!("{ISO_ENV} does not point to a file: {}", iso.display()),
        });
    }
    let iso = iso.canonicalize().map_err(|e| AgentVirtError::Io {
        context: format!("resolving {}", iso.display()),
        source: e,
    })?;

    let layout = &settings.layout;
    let base = layout.base_image(name);
    if base.exists() {
        return Err(AgentVirtError::BaseImageExists {
            path: base.display().to_string(),
        });
    }
    preflight::require_command("qemu-img", "install qemu-utils (Debian/Ubuntu) or qemu-img (Fedora)")?;
    preflight::check_group_membership(settings).await?;

    let domain = paths::base_install_domain(name);
    let cfg = &settings.config;
    let toolstack = LibvirtToolstack::connect(settings.libvirt_uri())?;
    if toolstack.domain_state(&domain)? != DomainState::Absent {
        return Err(AgentVirtError::Validation {
            message: format!(
                "domain '{domain}' already exists; undefine it with `virsh -c {} undefine {domain}`",
                settings.libvirt_uri()
            ),
        });
    }
    toolstack.ensure_network(&cfg.libvirt.network)?;

    println!("Creating empty base image {}...", base.display());
    image::create_empty_image(&base, &cfg.image.base_size).await?;

    let xml = domain_xml::generate_domain_xml(&DomainSpec {
        name: &domain,
        cpus: cfg.defaults.cpus,
        memory_mib: settings.default_ram_mib,
        disk: &base,
        network: &cfg.libvirt.network,
        domain_type: &cfg.libvirt.domain_type,
        machine: &cfg.libvirt.machine,
        install_iso: Some(&iso),
    });
    toolstack.define_and_start(&xml)?;
    tracing::info!(domain, iso = %iso.display(), "installer VM started");

    let uri = settings.libvirt_uri();
    println!("Installer VM '{domain}' started.");
    println!();
    println!("{}", style("Finish the installation in the viewer:").bold());
    println!("  virt-viewer --connect {uri} {domain}");
    println!();
    println!("When the installer has finished and the VM is shut down, remove the installer VM:");
    println!("  virsh -c {uri} undefine {domain}");
    println!();
    println!("Then create agent VMs with:");
    println!("  agent-virt create {name} READ_DIR WRITE_DIR NAME");
    Ok(())
}

// ── destroy ──────────────────────────────────────────────

pub async fn destroy(settings: &Settings, name: &str, keep_disk: bool) -> Result<(), AgentVirtError> {
    config::validate_name(name)?;
    preflight::check_group_membership(settings).await?;
    let layout = &settings.layout;
    let _lock = VmLock::acquire(name, layout.lock(name))?;

    let toolstack = LibvirtToolstack::connect(settings.libvirt_uri())?;
    let had_domain = Controller::new(&toolstack, readiness(settings))
        .teardown(name)
        .await?;

    let mut had_artifacts = SignatureStore::new(layout.signature(name)).clear()?;
    had_artifacts |= state::remove_if_exists(&layout.mount_record(name))?;
    had_artifacts |= state::remove_if_exists(&layout.bootstrap_script(name))?;
    if !keep_disk && state::remove_if_exists(&layout.disk(name))? {
        had_artifacts = true;
        tracing::info!(name, "removed disk");
    }

    match (had_domain, had_artifacts) {
        (true, _) => println!("VM '{name}' destroyed."),
        (false, true) => println!("Removed state for '{name}'."),
        (false, false) => println!("VM '{name}' not found, nothing to destroy."),
    }
    if keep_disk && layout.disk(name).exists() {
        println!("Disk kept at {}.", layout.disk(name).display());
    }
    Ok(())
}

// ── status ───────────────────────────────────────────────

#[derive(Debug, Facet)]
struct StatusJson {
    name: String,
    state: String,
    vcpus: Option<u32>,
    memory_mib: Option<u64>,
    max_memory_mib: Option<u64>,
    disk: Option<String>,
    mounts: Vec<String>,
}

pub async fn status(settings: &Settings, name: &str, json: bool) -> Result<(), AgentVirtError> {
    config::validate_name(name)?;
    let layout = &settings.layout;
    let toolstack = LibvirtToolstack::connect(settings.libvirt_uri())?;

    let state = toolstack.domain_state(name)?;
    let info = match state {
        DomainState::Absent => None,
        _ => toolstack.domain_info(name).ok(),
    };
    let disk = layout.disk(name);
    let signature = SignatureStore::new(layout.signature(name)).load()?;
    let mounts: Vec<String> = signature
        .as_deref()
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default();

    if json {
        let out = StatusJson {
            name: name.to_string(),
            state: state.to_string(),
            vcpus: info.map(|i| i.vcpus),
            memory_mib: info.map(|i| i.memory_kib / 1024),
            max_memory_mib: info.map(|i| i.max_memory_kib / 1024),
            disk: disk.exists().then(|| disk.display().to_string()),
            mounts,
        };
        let text = facet_json::to_string(&out).map_err(|e| AgentVirtError::Validation {
            message: format!("serializing status: {e}"),
        })?;
        println!("{text}");
        return Ok(());
    }

    println!("VM '{name}': {state}");
    if let Some(info) = info {
        println!("  vCPUs: {}", info.vcpus);
        println!(
            "  Memory: {} MiB (max {} MiB)",
            info.memory_kib / 1024,
            info.max_memory_kib / 1024
        );
    }
    if disk.exists() {
        println!("  Disk: {}", disk.display());
    }
    for line in &mounts {
        if let Some((path, tag)) = line.rsplit_once(' ') {
            println!("  Mount: {path} -> /opt/{tag}");
        }
    }
    Ok(())
}
