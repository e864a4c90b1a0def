use std::path::{Path, PathBuf};

use crate::error::AgentVirtError;

const MIB: u64 = 1024 * 1024;

/// Parse a human-readable size string into bytes.
///
/// Accepts formats like `"40G"`, `"512M"`, `"100K"`, `"1073741824"`.
/// Uses binary units (1G = 1024³ bytes).
pub fn parse_size(s: &str) -> Result<u64, AgentVirtError> {
    let (num, suffix) = split_size(s)?;
    let multiplier: u64 = match suffix.as_str() {
        "" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => MIB,
        "G" | "GB" => 1024 * MIB,
        "T" | "TB" => 1024 * 1024 * MIB,
        _ => {
            return Err(AgentVirtError::Validation {
                message: format!("unknown size suffix: '{suffix}' (use G, M, K, or T)"),
            });
        }
    };
    checked(num, multiplier, s)
}

/// Parse a RAM size into MiB. A bare number is already MiB; suffixed values
/// follow [`parse_size`].
pub fn parse_ram_mib(s: &str) -> Result<u64, AgentVirtError> {
    let (num, suffix) = split_size(s)?;
    if suffix.is_empty() {
        checked(num, MIB, s)?;
        return Ok(num);
    }
    let bytes = parse_size(s)?;
    if bytes % MIB != 0 {
        return Err(AgentVirtError::Validation {
            message: format!("RAM size must be a whole number of MiB (got '{s}')"),
        });
    }
    Ok(bytes / MIB)
}

fn split_size(s: &str) -> Result<(u64, String), AgentVirtError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(AgentVirtError::Validation {
            message: "size cannot be empty".into(),
        });
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str.parse().map_err(|_| AgentVirtError::Validation {
        message: format!("invalid size number: '{num_str}'"),
    })?;
    Ok((num, suffix))
}

fn checked(num: u64, multiplier: u64, s: &str) -> Result<u64, AgentVirtError> {
    num.checked_mul(multiplier)
        .ok_or_else(|| AgentVirtError::Validation {
            message: format!("size overflows: '{s}'"),
        })
}

/// Look up an executable on `PATH`.
pub fn find_in_path(command: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(command))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Escape a string for use inside a single-quoted XML attribute or text node.
pub fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Quote a string for POSIX `sh` using single quotes.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
