use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// File name suffixes of executable programs, which are never reported as referenced libraries
pub const EXECUTABLE_SUFFIXES: &[&str] = &[".exe"];

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Specified file not found at {0}")]
    SubjectNotFound(PathBuf),

    #[error("Could not read {path}")]
    CouldNotOpenFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Not a PE image: {0}")]
    WrongFileFormat(PathBuf),

    #[error("Failed parsing PE file {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Path segment {segment:?} of {path} does not exist on disk")]
    LookupError { path: PathBuf, segment: String },

    #[error("Failed writing results to {path}")]
    OutputWriteError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Resolution context building error: {0}")]
    ContextDeductionError(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    SerializationError(#[from] serde_json::Error),
}

/// Strip the verbatim prefix that canonicalization adds to paths on Windows
pub fn decanonicalize(s: &str) -> String {
    s.strip_prefix(r"\\?\").unwrap_or(s).to_owned()
}

pub fn path_to_string<P: AsRef<Path>>(p: P) -> String {
    decanonicalize(&p.as_ref().to_string_lossy())
}

/// Final component of a path-like name, accepting both separator styles
pub fn file_name_of(name: &str) -> &str {
    name.rsplit(['\\', '/']).next().unwrap_or(name)
}

pub fn has_executable_suffix(name: &str) -> bool {
    let lower = name.to_lowercase();
    EXECUTABLE_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

/// Drop `.` and resolve `..` components lexically, without touching the filesystem
///
/// `..` at the root stays at the root.
pub fn normalize_path<P: AsRef<Path>>(p: P) -> PathBuf {
    let mut normalized = PathBuf::new();
    for c in p.as_ref().components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn component_key(c: &Component) -> String {
    match c {
        Component::Prefix(p) => decanonicalize(&p.as_os_str().to_string_lossy()).to_lowercase(),
        other => other.as_os_str().to_string_lossy().to_lowercase(),
    }
}

/// Case-insensitive, component-wise prefix test, as the Windows filesystem would see it
pub fn path_starts_with_case_insensitive<P: AsRef<Path>, Q: AsRef<Path>>(
    path: P,
    prefix: Q,
) -> bool {
    let mut path_components = path.as_ref().components();
    for prefix_component in prefix.as_ref().components() {
        match path_components.next() {
            Some(c) if component_key(&c) == component_key(&prefix_component) => {}
            _ => return false,
        }
    }
    true
}
