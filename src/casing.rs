//! Recovery of the authoritative on-disk spelling of paths
//!
//! Windows filesystems are case-insensitive but case-preserving: a DLL imported as `KERNEL32.dll`
//! lives at `C:\Windows\System32\kernel32.dll`. Two spellings of the same file must collapse to a
//! single identity, so every resolved path is rewritten with the names the directory entries
//! actually carry. Names are kept as `OsStr` end to end; no lossy narrowing takes place.

use crate::common::ResolveError;
use fs_err as fs;
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};

/// Look up the directory entry of `folder` matching `name` regardless of case
///
/// An exact match wins over case-insensitive ones; among several case-insensitive matches (only
/// possible on case-sensitive filesystems) the lexicographically smallest is taken.
fn find_entry_case_insensitive(folder: &Path, name: &OsStr) -> Option<OsString> {
    let entries = fs::read_dir(folder).ok()?;
    let lower_name = name.to_str().map(str::to_lowercase);
    let mut candidates: Vec<OsString> = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let entry_name = entry.file_name();
        if entry_name.as_os_str() == name {
            return Some(entry_name);
        }
        // names that are not valid Unicode can only match exactly
        let matches = match (&lower_name, entry_name.to_str()) {
            (Some(l), Some(e)) => e.to_lowercase() == *l,
            _ => false,
        };
        if matches {
            candidates.push(entry_name);
        }
    }
    candidates.into_iter().min()
}

fn root_component(c: &Component) -> OsString {
    use std::path::Prefix;
    match c {
        Component::Prefix(p) => match p.kind() {
            Prefix::Disk(d) | Prefix::VerbatimDisk(d) => {
                OsString::from(format!("{}:", (d as char).to_ascii_uppercase()))
            }
            _ => p.as_os_str().to_owned(),
        },
        other => other.as_os_str().to_owned(),
    }
}

/// Rewrite an absolute path with the on-disk spelling of each of its segments
///
/// The path is taken apart leaf to root, then rebuilt root to leaf, each segment being looked up
/// in the already corrected parent directory. Fails if any segment does not exist.
pub fn correct_path_casing<P: AsRef<Path>>(path: P) -> Result<PathBuf, ResolveError> {
    let path = path.as_ref();

    let mut segments: Vec<&OsStr> = Vec::new();
    let mut root = PathBuf::new();
    let mut iteration_path = path;
    loop {
        match iteration_path.components().next_back() {
            Some(Component::Normal(name)) => segments.push(name),
            Some(Component::CurDir) => {}
            // no directory entry spells `..`; callers normalize first
            Some(Component::ParentDir) => {
                return Err(ResolveError::LookupError {
                    path: path.to_owned(),
                    segment: "..".to_owned(),
                })
            }
            // filesystem / drive root reached
            Some(Component::Prefix(_)) | Some(Component::RootDir) | None => {
                for c in iteration_path.components() {
                    root.push(root_component(&c));
                }
                break;
            }
        }
        match iteration_path.parent() {
            Some(parent) => iteration_path = parent,
            None => break,
        }
    }

    let mut updated_path = root;
    for segment in segments.iter().rev() {
        let properly_capitalized = find_entry_case_insensitive(&updated_path, segment)
            .ok_or_else(|| ResolveError::LookupError {
                path: path.to_owned(),
                segment: segment.to_string_lossy().into_owned(),
            })?;
        updated_path.push(properly_capitalized);
    }

    Ok(updated_path)
}
