use std::path::PathBuf;

use crate::config::CONFIG_FILE;

/// On-disk layout under the state root (`AGENT_VIRT_DIR`).
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Immutable base images: `base/`
    pub fn base_dir(&self) -> PathBuf {
        self.root.join("base")
    }

    /// Per-VM state: `run/`
    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    /// Directory shared read-only into every VM under the `setup` tag.
    pub fn setup_dir(&self) -> PathBuf {
        self.root.join("setup")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// `base/<name>.qcow2`
    pub fn base_image(&self, name: &str) -> PathBuf {
        self.base_dir().join(format!("{name}.qcow2"))
    }

    /// `run/<name>.qcow2`
    pub fn disk(&self, name: &str) -> PathBuf {
        self.run_dir().join(format!("{name}.qcow2"))
    }

    /// `run/<name>.mount`, the shell-sourceable READ_DIR/WRITE_DIR record.
    pub fn mount_record(&self, name: &str) -> PathBuf {
        self.run_dir().join(format!("{name}.mount"))
    }

    /// `run/<name>.vm-mounts`, the stored mount signature.
    pub fn signature(&self, name: &str) -> PathBuf {
        self.run_dir().join(format!("{name}.vm-mounts"))
    }

    pub fn lock(&self, name: &str) -> PathBuf {
        self.run_dir().join(format!("{name}.lock"))
    }

    pub fn bootstrap_script(&self, name: &str) -> PathBuf {
        self.setup_dir().join(bootstrap_script_name(name))
    }

    pub fn log_file(&self, name: &str) -> PathBuf {
        self.logs_dir().join(format!("{name}.log"))
    }
}

pub fn bootstrap_script_name(name: &str) -> String {
    format!("bootstrap-{name}.sh")
}

/// Libvirt domain name used while installing a base image.
pub fn base_install_domain(name: &str) -> String {
    format!("agent-virt-base-{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecars_live_next_to_disk() {
        let layout = Layout::new(PathBuf::from("/srv/av"));
        assert_eq!(layout.disk("dev"), PathBuf::from("/srv/av/run/dev.qcow2"));
        assert_eq!(layout.mount_record("dev"), PathBuf::from("/srv/av/run/dev.mount"));
        assert_eq!(layout.signature("dev"), PathBuf::from("/srv/av/run/dev.vm-mounts"));
        assert_eq!(layout.base_image("noble"), PathBuf::from("/srv/av/base/noble.qcow2"));
        assert_eq!(
            layout.bootstrap_script("dev"),
            PathBuf::from("/srv/av/setup/bootstrap-dev.sh")
        );
    }
}
