//! Resolution of user path patterns into local file lists.
//!
//! Each worker expands the patterns from the task descriptor against its own
//! filesystem. A pattern goes through the following stages:
//!
//! 1. **Pinning and substitution.** `%N:rest` (decimal rank) restricts the
//!    pattern to the worker with that rank; `%h` is replaced by the local
//!    hostname wherever it occurs.
//! 2. **Glob expansion.** Patterns containing `*?[` are expanded with the
//!    `glob` crate; each match continues through the stages below.
//! 3. **Time expansion.** With a time range, a pattern containing strftime
//!    directives is formatted once per rotation boundary; a directory gets
//!    the canonical `%Y/%m/%d/<prefix>.%Y%m%d%H%M%S` layout appended. Files
//!    that do not exist produce a warning, not an error.
//! 4. **Walking.** Without a time range, directories are walked recursively;
//!    dotfiles and `bfi.` index sidecars are skipped.
//!
//! Every returned path exists at resolution time and the order is
//! deterministic per pattern (boundary order, lexicographic within
//! directories), so running the resolver twice yields identical lists.

use crate::storage::bloom::is_sidecar_name;
use crate::task::TaskSpec;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Directory layout of rotated capture files under a capture root.
pub const ROTATION_DIR_TEMPLATE: &str = "%Y/%m/%d";

/// File-name template of one rotated capture, after the configured prefix.
pub const ROTATION_FILE_TEMPLATE: &str = "%Y%m%d%H%M%S";

/// Expand all patterns of `task` on this worker.
#[must_use]
pub fn resolve_patterns(task: &TaskSpec, rank: u32, hostname: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for pattern in &task.patterns {
        resolve_one(pattern, task, rank, hostname, &mut out);
    }
    out
}

fn resolve_one(pattern: &str, task: &TaskSpec, rank: u32, hostname: &str, out: &mut Vec<PathBuf>) {
    // stage 1: rank pinning and hostname substitution
    let mut rest = pattern;
    if let Some(stripped) = strip_rank_pin(rest, rank) {
        match stripped {
            Some(r) => rest = r,
            None => return, // pinned to another rank
        }
    }
    let substituted = rest.replace("%h", hostname);
    let rest = substituted.as_str();

    // stage 2: glob expansion
    if rest.contains(['*', '?', '[']) {
        match glob::glob(rest) {
            Ok(matches) => {
                let mut found: Vec<PathBuf> = matches.filter_map(std::result::Result::ok).collect();
                found.sort();
                for m in found {
                    resolve_path(&m, task, out);
                }
            }
            Err(e) => warn!(pattern, error = %e, "invalid glob pattern, skipped"),
        }
        return;
    }

    // stage 3: strftime directives in the pattern itself
    if rest.contains('%') {
        if task.time_range.is_some() && strftime_valid(rest) {
            for t in rotation_boundaries(task) {
                let path = PathBuf::from(t.format(rest).to_string());
                emit_existing(&path, out);
            }
        } else {
            warn!(pattern, "unsupported % directive, pattern skipped");
        }
        return;
    }

    resolve_path(Path::new(rest), task, out);
}

/// `%N:` rank pinning. Returns `Some(Some(rest))` when pinned to us,
/// `Some(None)` when pinned elsewhere, `None` when not a rank pin.
fn strip_rank_pin(pattern: &str, rank: u32) -> Option<Option<&str>> {
    let digits = pattern.strip_prefix('%')?;
    let colon = digits.find(':')?;
    let n: u32 = digits[..colon].parse().ok()?;
    if n == rank {
        Some(Some(&digits[colon + 1..]))
    } else {
        Some(None)
    }
}

fn strftime_valid(pattern: &str) -> bool {
    StrftimeItems::new(pattern).all(|i| !matches!(i, Item::Error))
}

/// Rotation boundaries of the task's aligned time range. A zero-length
/// range yields exactly the point file.
fn rotation_boundaries(task: &TaskSpec) -> impl Iterator<Item = DateTime<Utc>> + '_ {
    let (begin, end) = task.time_range.unwrap_or((0, 0));
    let step = i64::from(task.rotation_interval);
    let last = if begin == end { begin } else { end - 1 };
    (0..)
        .map(move |i| begin + i * step)
        .take_while(move |t| *t <= last)
        .filter_map(|t| DateTime::from_timestamp(t, 0))
}

fn resolve_path(path: &Path, task: &TaskSpec, out: &mut Vec<PathBuf>) {
    if path.is_file() {
        out.push(path.to_path_buf());
    } else if path.is_dir() {
        if task.time_range.is_some() {
            let template = format!(
                "{ROTATION_DIR_TEMPLATE}/{}.{ROTATION_FILE_TEMPLATE}",
                task.file_prefix
            );
            for t in rotation_boundaries(task) {
                let file = path.join(t.format(&template).to_string());
                emit_existing(&file, out);
            }
        } else {
            walk_dir(path, out);
        }
    } else {
        warn!(path = %path.display(), "no such file or directory, skipped");
    }
}

fn emit_existing(path: &Path, out: &mut Vec<PathBuf>) {
    if path.is_file() {
        out.push(path.to_path_buf());
    } else {
        warn!(path = %path.display(), "expected capture file does not exist");
    }
}

fn walk_dir(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "cannot list directory, skipped");
            return;
        }
    };
    let mut children: Vec<PathBuf> = Vec::new();
    for entry in entries {
        match entry {
            Ok(e) => children.push(e.path()),
            Err(e) => warn!(path = %dir.display(), error = %e, "unreadable entry, skipped"),
        }
    }
    children.sort();
    for child in children {
        let name = child.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        if name.starts_with('.') || is_sidecar_name(&name) {
            continue;
        }
        if child.is_dir() {
            walk_dir(&child, out);
        } else if child.is_file() {
            out.push(child);
        }
    }
}
