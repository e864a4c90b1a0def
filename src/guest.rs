//! Guest-side bootstrap.
//!
//! The host can't reach into the guest, so it writes a script into the
//! read-only `setup` share and prints the commands that run it. The script
//! owns everything in `/etc/fstab` from the marker line down, which makes
//! re-running it idempotent.

use std::fmt::Write;

use crate::mounts::{MountSpec, SETUP_TAG};
use crate::paths::bootstrap_script_name;

pub const FSTAB_MARKER: &str = "# agent-virt mounts";

/// fstab lines for the managed block, starting with the marker.
pub fn fstab_block(mounts: &[MountSpec]) -> String {
    let mut block = format!("{FSTAB_MARKER}\n");
    for m in mounts {
        let options = if m.readonly {
            "defaults,nofail,ro"
        } else {
            "defaults,nofail"
        };
        let _ = writeln!(block, "{} {} virtiofs {options} 0 0", m.tag, m.guest_path());
    }
    block
}

/// Render the bootstrap script for a VM's mounts.
///
/// `FSTAB` and `AGENT_VIRT_SKIP_MOUNT=1` can be set to run it against a scratch
/// file without mounting anything.
pub fn bootstrap_script(name: &str, mounts: &[MountSpec]) -> String {
    let block = fstab_block(mounts);
    let mount_points: Vec<String> = mounts.iter().map(MountSpec::guest_path).collect();
    let mount_points = mount_points.join(" ");

    format!(
        r#"#!/bin/sh
# Guest bootstrap for VM '{name}'. Run as root inside the VM.
set -eu

FSTAB="${{FSTAB:-/etc/fstab}}"
MARKER='{FSTAB_MARKER}'

tmp="$(mktemp)"
trap 'rm -f "$tmp"' EXIT

# Keep everything above the marker, replace the managed block.
if [ -f "$FSTAB" ]; then
  awk -v m="$MARKER" '$0 == m {{ exit }} {{ print }}' "$FSTAB" > "$tmp"
fi
cat >> "$tmp" <<'AGENT_VIRT_EOF'
{block}AGENT_VIRT_EOF
cat "$tmp" > "$FSTAB"

if [ "${{AGENT_VIRT_SKIP_MOUNT:-0}}" = "1" ]; then
  exit 0
fi

for dir in {mount_points}; do
  mkdir -p "$dir"
  if ! mountpoint -q "$dir"; then
    mount "$dir" || echo "agent-virt: could not mount $dir (is the share attached? try rebooting the VM)" >&2
  fi
done
"#
    )
}

/// Copy-paste commands for the operator to run inside the guest.
pub fn guest_commands(name: &str) -> Vec<String> {
    let setup = format!("/opt/{SETUP_TAG}");
    vec![
        format!("sudo mkdir -p {setup}"),
        format!("mountpoint -q {setup} || sudo mount -t virtiofs {SETUP_TAG} {setup}"),
        format!("sudo sh {setup}/{}", bootstrap_script_name(name)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn mounts() -> Vec<MountSpec> {
        vec![
            MountSpec::new("/host/setup", "setup", true),
            MountSpec::new("/host/src", "read", true),
            MountSpec::new("/host/out", "write", false),
        ]
    }

    fn run_script(script: &std::path::Path, fstab: &std::path::Path) {
        let status = Command::new("sh")
            .arg(script)
            .env("FSTAB", fstab)
            .env("AGENT_VIRT_SKIP_MOUNT", "1")
            .status()
            .unwrap();
        assert!(status.success());
    }

    #[test]
    fn block_lists_each_tag_under_opt() {
        let block = fstab_block(&mounts());
        assert_eq!(
            block,
            "# agent-virt mounts\n\
             setup /opt/setup virtiofs defaults,nofail,ro 0 0\n\
             read /opt/read virtiofs defaults,nofail,ro 0 0\n\
             write /opt/write virtiofs defaults,nofail 0 0\n"
        );
    }

    #[test]
    fn script_rewrites_fstab_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let fstab = dir.path().join("fstab");
        let original = "UUID=abc / ext4 defaults 0 1\n/swap.img none swap sw 0 0\n";
        std::fs::write(&fstab, original).unwrap();

        let script = dir.path().join("bootstrap.sh");
        std::fs::write(&script, bootstrap_script("agent1", &mounts())).unwrap();

        run_script(&script, &fstab);
        let first = std::fs::read_to_string(&fstab).unwrap();
        assert_eq!(first, format!("{original}{}", fstab_block(&mounts())));

        run_script(&script, &fstab);
        assert_eq!(std::fs::read_to_string(&fstab).unwrap(), first);
    }

    #[test]
    fn script_replaces_a_stale_block() {
        let dir = tempfile::tempdir().unwrap();
        let fstab = dir.path().join("fstab");
        std::fs::write(
            &fstab,
            "UUID=abc / ext4 defaults 0 1\n# agent-virt mounts\nold /opt/old virtiofs defaults 0 0\n",
        )
        .unwrap();

        let only_write = [MountSpec::new("/host/out", "write", false)];
        let script = dir.path().join("bootstrap.sh");
        std::fs::write(&script, bootstrap_script("agent1", &only_write)).unwrap();
        run_script(&script, &fstab);

        let fstab = std::fs::read_to_string(&fstab).unwrap();
        assert!(!fstab.contains("/opt/old"));
        assert!(fstab.starts_with("UUID=abc / ext4 defaults 0 1\n# agent-virt mounts\n"));
        assert!(fstab.ends_with("write /opt/write virtiofs defaults,nofail 0 0\n"));
    }

    #[test]
    fn commands_mount_setup_then_run_script() {
        let cmds = guest_commands("agent1");
        assert!(cmds[1].contains("mount -t virtiofs setup /opt/setup"));
        assert_eq!(cmds[2], "sudo sh /opt/setup/bootstrap-agent1.sh");
    }
}
