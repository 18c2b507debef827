//! Classification of the converged dependency closure, and its serialization

use crate::common::{file_name_of, has_executable_suffix, path_to_string, ResolveError};
use crate::lookup_path::SearchOrderResolver;
use crate::runner::ClosureState;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Environment variable naming the home directory of the invoking user
#[cfg(windows)]
pub const USER_PROFILE_VARIABLE: &str = "USERPROFILE";
#[cfg(not(windows))]
pub const USER_PROFILE_VARIABLE: &str = "HOME";

/// The home directory of the invoking user, rewritten as `%VARIABLE%` in reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub variable: String,
    pub directory: Option<String>,
}

impl UserProfile {
    pub fn new(variable: &str, directory: Option<&str>) -> Self {
        Self {
            variable: variable.to_owned(),
            directory: directory
                .map(|d| d.trim_end_matches(['\\', '/']).to_owned())
                .filter(|d| !d.is_empty()),
        }
    }

    pub fn from_env() -> Self {
        let directory = std::env::var(USER_PROFILE_VARIABLE).ok();
        Self::new(USER_PROFILE_VARIABLE, directory.as_deref())
    }

    /// Replace the user profile part of the path with the environment variable, if applicable
    ///
    /// The comparison ignores case and only matches whole path segments.
    pub fn redact(&self, path: &str) -> String {
        let Some(directory) = &self.directory else {
            return path.to_owned();
        };
        let Some(prefix) = path.get(..directory.len()) else {
            return path.to_owned();
        };
        let rest = &path[directory.len()..];
        if prefix.to_lowercase() == directory.to_lowercase()
            && (rest.is_empty() || rest.starts_with(['\\', '/']))
        {
            format!("%{}%{}", self.variable, rest)
        } else {
            path.to_owned()
        }
    }
}

fn redacted_sorted<I: Iterator<Item = String>>(names: I, user_profile: &UserProfile) -> Vec<String> {
    names
        .map(|n| user_profile.redact(&n))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Outcome of a resolution run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDependencies {
    /// Found, but could not be loaded
    #[serde(rename = "dll-load-failures")]
    pub load_failures: Vec<String>,
    /// Could not be opened or parsed as an image
    #[serde(rename = "missing-dlls")]
    pub missing: Vec<String>,
    /// Every library in the closure, whatever its status
    #[serde(rename = "referenced-dlls")]
    pub referenced: Vec<String>,
}

impl ResolvedDependencies {
    /// Turn the converged closure into the three report lists
    ///
    /// The subject must already have been removed from the discovered modules.
    pub fn classify(
        state: &ClosureState,
        resolver: &dyn SearchOrderResolver,
        user_profile: &UserProfile,
    ) -> Self {
        let missing = redacted_sorted(state.missing().map(|m| m.to_string()), user_profile);

        let load_failures = redacted_sorted(
            state
                .discovered()
                .filter(|m| !state.is_missing(m))
                .map(|m| m.to_string())
                .filter(|name| !has_executable_suffix(name))
                .filter(|name| {
                    if resolver.resolve(file_name_of(name)).is_none() {
                        log::debug!("{} could not be loaded by its file name", name);
                        true
                    } else {
                        false
                    }
                }),
            user_profile,
        );

        let referenced = redacted_sorted(
            state
                .discovered()
                .map(|m| m.to_string())
                .filter(|name| !has_executable_suffix(name)),
            user_profile,
        );

        Self {
            load_failures,
            missing,
            referenced,
        }
    }

    /// JSON representation, indented by 4 spaces
    pub fn to_json(&self) -> Result<String, ResolveError> {
        let mut buffer = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        self.serialize(&mut serializer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ResolveError> {
        let output = self.to_json()?;
        log::info!("Writing result JSON to {}...", path_to_string(&path));
        fs::write(path.as_ref(), output).map_err(|e| ResolveError::OutputWriteError {
            path: PathBuf::from(path.as_ref()),
            source: e,
        })
    }
}
