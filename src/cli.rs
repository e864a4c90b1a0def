use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "agent-virt",
    about = "Run AI coding agents in isolated libvirt VMs with virtiofs mounts"
)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// vCPU/RAM overrides shared by `create` and `run`.
#[derive(Args, Debug, Clone, Default)]
pub struct ResourceArgs {
    /// Number of vCPUs
    #[arg(long = "cpu", value_name = "N")]
    pub cpus: Option<u32>,

    /// RAM size, e.g. 8G or 8192 (MiB)
    #[arg(long, value_name = "N")]
    pub ram: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create (or reconcile) a VM from a base image with read/write mounts
    Create {
        #[command(flatten)]
        resources: ResourceArgs,

        /// Base image name under base/, or a path to an image
        base: String,

        /// Host directory shared read-only at /opt/read
        read_dir: PathBuf,

        /// Host directory shared read-write at /opt/write
        write_dir: PathBuf,

        /// VM name
        name: String,
    },

    /// Start an existing VM (or reattach its mounts if already running)
    Run {
        #[command(flatten)]
        resources: ResourceArgs,

        /// VM name
        name: String,
    },

    /// Install a new base image from the ISO in $UBUNTU_ISO
    CreateBaseImage {
        /// Base image name
        name: String,
    },

    /// Stop and undefine a VM, removing its state
    Destroy {
        /// Keep the VM's disk image
        #[arg(long)]
        keep_disk: bool,

        /// VM name
        name: String,
    },

    /// Show VM state and stored mounts
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,

        /// VM name
        name: String,
    },
}

impl Command {
    /// VM whose log file this command writes to, if any.
    pub fn logged_vm(&self) -> Option<&str> {
        match self {
            Command::Create { name, .. } | Command::Run { name, .. } => Some(name),
            Command::CreateBaseImage { .. } | Command::Destroy { .. } | Command::Status { .. } => {
                None
            }
        }
    }
}
