//! Host checks that run before any mutating libvirt call.

use crate::config::Settings;
use crate::error::AgentVirtError;
use crate::util;

/// Fail unless `command` is on `PATH`.
pub fn require_command(command: &str, hint: &str) -> Result<(), AgentVirtError> {
    match util::find_in_path(command) {
        Some(path) => {
            tracing::debug!(command, path = %path.display(), "found dependency");
            Ok(())
        }
        None => Err(AgentVirtError::MissingDependency {
            command: command.to_string(),
            hint: hint.to_string(),
        }),
    }
}

/// Non-root users need the libvirt group to manage system domains.
pub async fn check_group_membership(settings: &Settings) -> Result<(), AgentVirtError> {
    if !settings.is_system_uri() {
        return Ok(());
    }
    let uid = run_id(&["-u"]).await?;
    if uid.trim() == "0" {
        return Ok(());
    }

    let group = &settings.config.libvirt.group;
    let groups = run_id(&["-nG"]).await?;
    if in_group(&groups, group) {
        return Ok(());
    }

    let user = run_id(&["-un"]).await?.trim().to_string();
    Err(AgentVirtError::GroupMembership {
        hint: format!("run `sudo usermod -aG {group} {user}`, then log out and back in"),
        user,
        group: group.clone(),
    })
}

/// Places distributions install virtiofsd outside of `PATH`.
const VIRTIOFSD_LOCATIONS: &[&str] = &[
    "/usr/libexec/virtiofsd",
    "/usr/lib/qemu/virtiofsd",
    "/usr/lib/virtiofsd",
];

/// libvirt spawns virtiofsd on the host for every share; without it each
/// attach fails.
pub fn check_virtiofsd(settings: &Settings) -> Result<(), AgentVirtError> {
    if !settings.libvirt_uri().starts_with("qemu:///") {
        // Remote hypervisor, nothing to check locally.
        return Ok(());
    }
    let found = util::find_in_path("virtiofsd").is_some()
        || VIRTIOFSD_LOCATIONS
            .iter()
            .any(|p| std::path::Path::new(p).is_file());
    if found {
        Ok(())
    } else {
        Err(AgentVirtError::MissingDependency {
            command: "virtiofsd".into(),
            hint: "install it, e.g. `sudo apt install virtiofsd` or `sudo dnf install virtiofsd`"
                .into(),
        })
    }
}

/// Run the checks shared by every command that attaches mounts.
pub async fn check_host(settings: &Settings) -> Result<(), AgentVirtError> {
    check_virtiofsd(settings)?;
    check_group_membership(settings).await
}

fn in_group(id_output: &str, group: &str) -> bool {
    id_output.split_whitespace().any(|g| g == group)
}

async fn run_id(args: &[&str]) -> Result<String, AgentVirtError> {
    let output = tokio::process::Command::new("id")
        .args(args)
        .output()
        .await
        .map_err(|e| AgentVirtError::Io {
            context: "running id".into(),
            source: e,
        })?;
    if !output.status.success() {
        return Err(AgentVirtError::ExternalCommand {
            command: format!("id {}", args.join(" ")),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
