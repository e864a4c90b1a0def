use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::error::AgentVirtError;
use crate::paths::Layout;
use crate::util;

/// Environment variable naming the state root directory.
pub const ROOT_ENV: &str = "AGENT_VIRT_DIR";

/// Optional config file name inside the state root.
pub const CONFIG_FILE: &str = "agent-virt.toml";

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    #[facet(default)]
    pub defaults: DefaultsConfig,
    #[facet(default)]
    pub libvirt: LibvirtConfig,
    #[facet(default)]
    pub readiness: ReadinessConfig,
    #[facet(default)]
    pub image: ImageConfig,
}

/// Resources used when a VM is first created without `--cpu`/`--ram`.
#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct DefaultsConfig {
    #[facet(default = 4)]
    pub cpus: u32,
    #[facet(default = "8G")]
    pub ram: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            cpus: 4,
            ram: "8G".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct LibvirtConfig {
    #[facet(default = "qemu:///system")]
    pub uri: String,
    #[facet(default = "default")]
    pub network: String,
    #[facet(default = "kvm")]
    pub domain_type: String,
    #[facet(default = "q35")]
    pub machine: String,
    /// Group a non-root user must belong to for system connections.
    #[facet(default = "libvirt")]
    pub group: String,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".into(),
            network: "default".into(),
            domain_type: "kvm".into(),
            machine: "q35".into(),
            group: "libvirt".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ReadinessConfig {
    #[facet(default = 60)]
    pub attempts: u32,
    #[facet(default = 1000)]
    pub interval_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ImageConfig {
    #[facet(default = "40G")]
    pub base_size: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            base_size: "40G".into(),
        }
    }
}

// ── Settings ──────────────────────────────────────────────

/// Resolved runtime settings: the state root plus the parsed config file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub layout: Layout,
    pub config: Config,
    /// Default RAM in MiB, parsed from `defaults.ram`.
    pub default_ram_mib: u64,
}

impl Settings {
    pub fn libvirt_uri(&self) -> &str {
        &self.config.libvirt.uri
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.readiness.interval_ms)
    }

    /// Whether the connection targets the system libvirt daemon.
    pub fn is_system_uri(&self) -> bool {
        self.config.libvirt.uri.ends_with(":///system")
    }
}

/// Resolve the state root from the `AGENT_VIRT_DIR` value, if any.
///
/// A leading `~/` is expanded against the home directory. Without a value
/// the root is `~/vms/agent-virt`.
pub fn resolve_root(env_value: Option<&str>) -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
    match env_value.map(str::trim) {
        Some("") | None => home.join("vms").join("agent-virt"),
        Some("~") => home,
        Some(v) => match v.strip_prefix("~/") {
            Some(rest) => home.join(rest),
            None => PathBuf::from(v),
        },
    }
}

fn validate_config(config: &Config) -> Result<u64, AgentVirtError> {
    if config.defaults.cpus < 1 {
        return Err(AgentVirtError::Validation {
            message: "defaults.cpus must be at least 1".into(),
        });
    }
    let ram_mib = util::parse_ram_mib(&config.defaults.ram)?;
    validate_ram(ram_mib)?;
    if config.readiness.attempts < 1 {
        return Err(AgentVirtError::Validation {
            message: "readiness.attempts must be at least 1".into(),
        });
    }
    util::parse_size(&config.image.base_size)?;
    if config.libvirt.network.is_empty() {
        return Err(AgentVirtError::Validation {
            message: "libvirt.network must not be empty".into(),
        });
    }
    Ok(ram_mib)
}

/// Upper bound on guest RAM: 16 TiB.
pub const MAX_RAM_MIB: u64 = 16 * 1024 * 1024;

pub fn validate_ram(ram_mib: u64) -> Result<(), AgentVirtError> {
    if ram_mib < 256 {
        return Err(AgentVirtError::Validation {
            message: format!("RAM must be at least 256 MiB (got {ram_mib} MiB)"),
        });
    }
    if ram_mib > MAX_RAM_MIB {
        return Err(AgentVirtError::Validation {
            message: format!("RAM must be at most {MAX_RAM_MIB} MiB (got {ram_mib} MiB)"),
        });
    }
    Ok(())
}

pub fn validate_cpus(cpus: u32) -> Result<(), AgentVirtError> {
    if cpus < 1 {
        return Err(AgentVirtError::Validation {
            message: "CPU count must be at least 1".into(),
        });
    }
    Ok(())
}

/// VM and base-image names become libvirt domain names and file names.
pub fn validate_name(name: &str) -> Result<(), AgentVirtError> {
    let valid = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(AgentVirtError::Validation {
            message: format!("name must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"),
        });
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

/// Load settings for the given root. The config file is optional.
pub fn load_settings_at(root: &Path) -> Result<Settings, AgentVirtError> {
    let layout = Layout::new(root.to_path_buf());
    let path = layout.config_file();

    let config = if path.exists() {
        let contents =
            std::fs::read_to_string(&path).map_err(|source| AgentVirtError::ConfigLoad {
                path: path.display().to_string(),
                source,
            })?;
        facet_toml::from_str(&contents).map_err(|e| AgentVirtError::ConfigParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
    } else {
        Config::default()
    };

    let default_ram_mib = validate_config(&config)?;

    Ok(Settings {
        layout,
        config,
        default_ram_mib,
    })
}

/// Load settings from the root named by `AGENT_VIRT_DIR`.
pub fn load_settings() -> Result<Settings, AgentVirtError> {
    let env_value = std::env::var(ROOT_ENV).ok();
    let root = resolve_root(env_value.as_deref());
    tracing::debug!(root = %root.display(), "resolved state root");
    load_settings_at(&root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_at(dir.path()).unwrap();
        assert_eq!(settings.config.defaults.cpus, 4);
        assert_eq!(settings.default_ram_mib, 8192);
        assert_eq!(settings.libvirt_uri(), "qemu:///system");
        assert_eq!(settings.config.readiness.attempts, 60);
        assert_eq!(settings.poll_interval(), Duration::from_secs(1));
        assert!(settings.is_system_uri());
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
[defaults]
cpus = 2
ram = "2048"

[libvirt]
uri = "qemu:///session"
"#,
        )
        .unwrap();
        let settings = load_settings_at(dir.path()).unwrap();
        assert_eq!(settings.config.defaults.cpus, 2);
        assert_eq!(settings.default_ram_mib, 2048);
        assert_eq!(settings.libvirt_uri(), "qemu:///session");
        assert!(!settings.is_system_uri());
        assert_eq!(settings.config.libvirt.network, "default");
        assert_eq!(settings.config.image.base_size, "40G");
    }

    #[test]
    fn too_little_ram_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[defaults]\nram = \"128M\"\n",
        )
        .unwrap();
        assert!(load_settings_at(dir.path()).is_err());
    }

    #[test]
    fn ram_bounds() {
        assert!(validate_ram(256).is_ok());
        assert!(validate_ram(MAX_RAM_MIB).is_ok());
        assert!(validate_ram(MAX_RAM_MIB + 1).is_err());
        assert!(validate_ram(1 << 54).is_err());
    }

    #[test]
    fn malformed_config_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[defaults\ncpus = ").unwrap();
        let err = load_settings_at(dir.path()).unwrap_err();
        assert!(matches!(err, AgentVirtError::ConfigParse { .. }));
    }

    #[test]
    fn root_defaults_under_home() {
        let root = resolve_root(None);
        assert!(root.ends_with("vms/agent-virt"));
        assert_eq!(resolve_root(Some("")), root);
    }

    #[test]
    fn root_expands_tilde() {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        assert_eq!(resolve_root(Some("~/x/y")), home.join("x/y"));
        assert_eq!(resolve_root(Some("/srv/vms")), PathBuf::from("/srv/vms"));
    }

    #[test]
    fn valid_names() {
        for name in ["agent1", "test-vm", "vm.dev", "VM_01", "a"] {
            validate_name(name).unwrap();
        }
    }

    #[test]
    fn invalid_names() {
        for name in ["", "-bad", ".bad", "../etc", "a/b", "vm<x>", "hello world"] {
            assert!(
                validate_name(name).is_err(),
                "expected name '{name}' to be rejected"
            );
        }
    }
}
