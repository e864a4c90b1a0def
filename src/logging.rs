use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable overriding the terminal log filter.
pub const LOG_ENV: &str = "AGENT_VIRT_LOG";

type SharedFile = Arc<Mutex<Option<File>>>;

fn lock(inner: &SharedFile) -> MutexGuard<'_, Option<File>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A `MakeWriter` that discards writes until a file is set through its
/// [`LogFileHandle`].
///
/// The subscriber is installed before we know which VM the command is about,
/// so the per-VM log file is switched on later.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: SharedFile,
}

/// Activates a [`DeferredFileWriter`].
#[derive(Clone)]
pub struct LogFileHandle {
    inner: SharedFile,
}

impl DeferredFileWriter {
    pub fn new() -> (Self, LogFileHandle) {
        let inner = SharedFile::default();
        (
            Self {
                inner: inner.clone(),
            },
            LogFileHandle { inner },
        )
    }
}

impl LogFileHandle {
    /// Start appending to `path`.
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *lock(&self.inner) = Some(file);
        Ok(())
    }
}

pub struct DeferredWriter {
    inner: SharedFile,
}

impl std::io::Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

/// Install the global subscriber: stderr at info (debug with `verbose`,
/// or whatever `AGENT_VIRT_LOG` says) plus a deferred debug-level file layer.
pub fn init(verbose: bool) -> LogFileHandle {
    let default_level = if verbose { "debug" } else { "info" };
    let terminal_filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(format!("agent_virt={default_level}")));

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(terminal_filter);

    let (file_writer, handle) = DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("agent_virt=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    handle
}
