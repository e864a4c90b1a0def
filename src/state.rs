//! Persisted per-VM records under `run/`.
//!
//! All writes go through a temp file + rename so a crash never leaves a
//! half-written record behind.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::AgentVirtError;
use crate::util::shell_quote;

/// Write `contents` to `path` atomically.
pub fn write_atomic(path: &Path, contents: &str) -> Result<(), AgentVirtError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AgentVirtError::Io {
            context: format!("creating directory {}", parent.display()),
            source: e,
        })?;
    }
    let tmp = sibling(path, "tmp");
    fs::write(&tmp, contents).map_err(|e| AgentVirtError::Io {
        context: format!("writing {}", tmp.display()),
        source: e,
    })?;
    fs::rename(&tmp, path).map_err(|e| AgentVirtError::Io {
        context: format!("renaming {} to {}", tmp.display(), path.display()),
        source: e,
    })
}

/// Remove `path`, reporting whether it existed.
pub fn remove_if_exists(path: &Path) -> Result<bool, AgentVirtError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(AgentVirtError::Io {
            context: format!("removing {}", path.display()),
            source: e,
        }),
    }
}

// ── SignatureStore ───────────────────────────────────────

/// The stored mount signature (`run/<name>.vm-mounts`).
#[derive(Debug, Clone)]
pub struct SignatureStore {
    path: PathBuf,
}

impl SignatureStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `None` when no signature has ever been stored.
    pub fn load(&self) -> Result<Option<String>, AgentVirtError> {
        match fs::read_to_string(&self.path) {
            Ok(s) => Ok(Some(s.strip_suffix('\n').unwrap_or(&s).to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AgentVirtError::Io {
                context: format!("reading mount signature {}", self.path.display()),
                source: e,
            }),
        }
    }

    pub fn save(&self, signature: &str) -> Result<(), AgentVirtError> {
        write_atomic(&self.path, &format!("{signature}\n"))
    }

    pub fn clear(&self) -> Result<bool, AgentVirtError> {
        remove_if_exists(&self.path)
    }
}

// ── MountRecord ──────────────────────────────────────────

/// Host directories chosen at `create` time (`run/<name>.mount`).
///
/// Stored as shell-sourceable `KEY='value'` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub read_dir: PathBuf,
    pub write_dir: PathBuf,
}

impl MountRecord {
    pub fn render(&self) -> String {
        format!(
            "READ_DIR={}\nWRITE_DIR={}\n",
            shell_quote(&self.read_dir.to_string_lossy()),
            shell_quote(&self.write_dir.to_string_lossy()),
        )
    }

    pub fn parse(contents: &str) -> Result<Self, String> {
        let mut read_dir = None;
        let mut write_dir = None;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(format!("expected KEY=value, got '{line}'"));
            };
            let value = unquote(value)?;
            match key.trim() {
                "READ_DIR" => read_dir = Some(PathBuf::from(value)),
                "WRITE_DIR" => write_dir = Some(PathBuf::from(value)),
                _ => {}
            }
        }
        match (read_dir, write_dir) {
            (Some(read_dir), Some(write_dir)) => Ok(Self {
                read_dir,
                write_dir,
            }),
            (None, _) => Err("missing READ_DIR".into()),
            (_, None) => Err("missing WRITE_DIR".into()),
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>, AgentVirtError> {
        let contents = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AgentVirtError::Io {
                    context: format!("reading mount record {}", path.display()),
                    source: e,
                });
            }
        };
        Self::parse(&contents)
            .map(Some)
            .map_err(|message| AgentVirtError::ConfigParse {
                path: path.display().to_string(),
                message,
            })
    }

    pub fn save(&self, path: &Path) -> Result<(), AgentVirtError> {
        write_atomic(path, &self.render())
    }
}

/// Undo POSIX shell quoting for a single assignment value.
fn unquote(raw: &str) -> Result<String, String> {
    let mut out = String::new();
    let mut chars = raw.trim().chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => loop {
                match chars.next() {
                    Some('\'') => break,
                    Some(c) => out.push(c),
                    None => return Err(format!("unterminated quote in {raw}")),
                }
            },
            '"' => loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(c) => out.push(c),
                        None => return Err(format!("dangling escape in {raw}")),
                    },
                    Some(c) => out.push(c),
                    None => return Err(format!("unterminated quote in {raw}")),
                }
            },
            '\\' => match chars.next() {
                Some(c) => out.push(c),
                None => return Err(format!("dangling escape in {raw}")),
            },
            c => out.push(c),
        }
    }
    Ok(out)
}

// ── VmLock ───────────────────────────────────────────────

/// Exclusive per-VM lock held for the duration of a mutating command.
///
/// The lock file holds the owner's PID and is published with a hard link, so
/// it is never observed empty. A lock whose owner is gone is taken over; one
/// whose owner can't be read counts as held.
#[derive(Debug)]
pub struct VmLock {
    path: PathBuf,
}

/// Who the lock file says owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockOwner {
    /// The file disappeared before it could be read.
    Gone,
    Pid(u32),
    Unknown,
}

const LOCK_ATTEMPTS: u32 = 3;

impl VmLock {
    pub fn acquire(name: &str, path: PathBuf) -> Result<Self, AgentVirtError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| AgentVirtError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
        }

        let pid = std::process::id();
        let staged = sibling(&path, &format!("{pid}.tmp"));
        fs::write(&staged, format!("{pid}\n")).map_err(|e| AgentVirtError::Io {
            context: format!("writing lock file {}", staged.display()),
            source: e,
        })?;
        let result = Self::publish(name, path, &staged, pid);
        let _ = fs::remove_file(&staged);
        result
    }

    fn publish(
        name: &str,
        path: PathBuf,
        staged: &Path,
        pid: u32,
    ) -> Result<Self, AgentVirtError> {
        for _ in 0..LOCK_ATTEMPTS {
            match fs::hard_link(staged, &path) {
                Ok(()) => return Ok(Self { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match read_owner(&path) {
                    LockOwner::Gone => continue,
                    LockOwner::Pid(owner) if owner != pid && !process_alive(owner) => {
                        take_over_stale(name, &path, owner, pid)?;
                    }
                    owner => return Err(locked(name, &path, owner)),
                },
                Err(e) => {
                    return Err(AgentVirtError::Io {
                        context: format!("creating lock file {}", path.display()),
                        source: e,
                    });
                }
            }
        }

        Err(AgentVirtError::Io {
            context: format!("acquiring lock {}", path.display()),
            source: std::io::Error::new(ErrorKind::WouldBlock, "lock contended"),
        })
    }
}

impl Drop for VmLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// `<dir>/.<file>.<suffix>`, next to `path`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{file_name}.{suffix}"))
}

fn read_owner(path: &Path) -> LockOwner {
    match fs::read_to_string(path) {
        Ok(s) => s
            .trim()
            .parse::<u32>()
            .map_or(LockOwner::Unknown, LockOwner::Pid),
        Err(e) if e.kind() == ErrorKind::NotFound => LockOwner::Gone,
        Err(_) => LockOwner::Unknown,
    }
}

fn locked(name: &str, path: &Path, owner: LockOwner) -> AgentVirtError {
    let owner = match owner {
        LockOwner::Pid(pid) => format!("pid {pid}"),
        LockOwner::Gone | LockOwner::Unknown => "unknown owner".to_string(),
    };
    AgentVirtError::VmLocked {
        name: name.to_string(),
        owner,
        hint: format!(
            "wait for it to finish, or remove {} if no agent-virt process is running",
            path.display()
        ),
    }
}

/// Move a dead owner's lock aside. If another process replaced it in the
/// meantime, put that lock back and report it as held.
fn take_over_stale(
    name: &str,
    path: &Path,
    dead: u32,
    pid: u32,
) -> Result<(), AgentVirtError> {
    let aside = sibling(path, &format!("{pid}.stale"));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(AgentVirtError::Io {
                context: format!("moving stale lock {}", path.display()),
                source: e,
            });
        }
    }

    let moved = read_owner(&aside);
    if moved == LockOwner::Pid(dead) {
        tracing::warn!(path = %path.display(), pid = dead, "removed stale lock");
        remove_if_exists(&aside)?;
        return Ok(());
    }

    // Not the lock we judged stale. Restoring fails only if yet another
    // process has published since, which then holds the lock anyway.
    let _ = fs::hard_link(&aside, path);
    remove_if_exists(&aside)?;
    Err(locked(name, path, moved))
}

fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}
