//! Data structures that must be filled with the input and the parameters for the DLL scan

use crate::casing::correct_path_casing;
use crate::common::{normalize_path, ResolveError};
use crate::report::UserProfile;
use crate::system::WindowsSystem;
use std::path::{Path, PathBuf};

/// Complete specification of a resolution run
#[derive(Clone, Debug)]
pub struct ResolutionContext {
    /// Absolute path to the subject executable
    pub subject: PathBuf,
    /// Parent directory of the subject, cached for performance purposes
    pub app_dir: PathBuf,
    /// Working directory as it should appear in the search path
    pub working_dir: PathBuf,
    /// Additional executable search path set by the user
    pub user_path: Vec<PathBuf>,
    /// Windows installation providing the system DLLs, if one could be found
    pub system: Option<WindowsSystem>,
    /// Resolve, but do not parse, the dependencies living in the System directory
    pub skip_system_dlls: bool,
    /// Walk the search order over the filesystem instead of asking the native loader
    ///
    /// Always the case when not running on Windows.
    pub emulate_search_order: bool,
    /// Where to write the report, if anywhere
    pub output_path: Option<PathBuf>,
    /// Home directory to be redacted from the report
    pub user_profile: UserProfile,
}

impl ResolutionContext {
    /// autodetects the settings with sensible defaults
    ///
    /// The working directory will be set to the one containing the executable (i.e. the app_dir)
    pub fn deduce_from_executable_location<P: AsRef<Path>>(
        subject: P,
    ) -> Result<Self, ResolveError> {
        let subject = Self::absolute_subject_path(subject.as_ref())?;
        let app_dir = subject
            .parent()
            .ok_or_else(|| {
                ResolveError::ContextDeductionError(format!(
                    "Could not find application directory for given executable {}",
                    subject.display()
                ))
            })?
            .to_owned();

        #[cfg(windows)]
        let system = Some(WindowsSystem::current()?);
        #[cfg(not(windows))]
        let system = WindowsSystem::from_exe_location(&subject)?;

        Ok(Self {
            subject,
            working_dir: app_dir.clone(),
            app_dir,
            user_path: Vec::new(),
            system,
            skip_system_dlls: false,
            emulate_search_order: !cfg!(windows),
            output_path: None,
            user_profile: UserProfile::from_env(),
        })
    }

    /// Make sure the subject is an existing regular file, and spell it as it is on disk
    fn absolute_subject_path(subject: &Path) -> Result<PathBuf, ResolveError> {
        if !subject.is_file() {
            return Err(ResolveError::SubjectNotFound(subject.to_owned()));
        }
        let absolute = if subject.is_absolute() {
            subject.to_owned()
        } else {
            std::env::current_dir()?.join(subject)
        };
        let normalized = normalize_path(&absolute);
        Ok(correct_path_casing(&normalized).unwrap_or(normalized))
    }
}
