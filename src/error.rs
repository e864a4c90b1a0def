use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AgentVirtError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("base image not found: {path}")]
    #[diagnostic(help("create one with `agent-virt create-base-image <NAME>`"))]
    BaseImageNotFound { path: String },

    #[error("base image already exists: {path}")]
    #[diagnostic(help("remove it first if you want to reinstall"))]
    BaseImageExists { path: String },

    #[error("host directory not found: {path}")]
    MountSourceNotFound { path: String },

    #[error("VM '{name}' has no disk at {path}")]
    #[diagnostic(help("run `agent-virt create BASE READ_DIR WRITE_DIR NAME` first"))]
    VmNotCreated { name: String, path: String },

    #[error("{variable} is not set")]
    MissingEnv {
        variable: String,
        #[help]
        hint: String,
    },

    #[error("required command `{command}` not found on PATH")]
    MissingDependency {
        command: String,
        #[help]
        hint: String,
    },

    #[error("user '{user}' is not a member of the '{group}' group")]
    GroupMembership {
        user: String,
        group: String,
        #[help]
        hint: String,
    },

    #[error("VM '{name}' is in use by another agent-virt process ({owner})")]
    VmLocked {
        name: String,
        owner: String,
        #[help]
        hint: String,
    },

    #[error("libvirt error: {message}")]
    Libvirt {
        message: String,
        #[help]
        hint: String,
    },

    #[error("{command} failed: {message}")]
    ExternalCommand { command: String, message: String },

    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}
