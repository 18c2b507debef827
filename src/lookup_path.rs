use crate::common::{file_name_of, path_starts_with_case_insensitive, ResolveError};
use crate::query::ResolutionContext;
use crate::system::{WinFileSystemCache, WindowsSystem};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Maps a bare library name to the absolute path the platform loader would pick
pub trait SearchOrderResolver {
    fn resolve(&self, name: &str) -> Option<PathBuf>;
}

/// Directory trees a resolved library is allowed to come from
///
/// Anything found elsewhere (e.g. through a stray PATH entry) is treated as not found.
#[derive(Debug, Clone)]
pub struct ResolutionScope {
    pub app_dir: PathBuf,
    pub system: Option<WindowsSystem>,
}

impl ResolutionScope {
    pub fn new(context: &ResolutionContext) -> Self {
        Self {
            app_dir: context.app_dir.clone(),
            system: context.system.clone(),
        }
    }

    pub fn accepts<P: AsRef<Path>>(&self, p: P) -> bool {
        path_starts_with_case_insensitive(&p, &self.app_dir)
            || self
                .system
                .as_ref()
                .map_or(false, |s| s.is_in_system_tree(&p))
    }
}

/// Directory/set of DLLs to be searched, and relative metadata
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum LookupPathEntry {
    /// Modules this process already resolved; the loader reuses them without searching again
    LoadedModules,
    /// Directory where the root executable sits
    ExecutableDir(PathBuf),
    /// Windows System directory (typically C:\Windows\System32), or its API set `downlevel` subfolder
    SystemDir(PathBuf),
    // SystemDir16, // ignored
    /// Windows directory (typically C:\Windows)
    WindowsDir(PathBuf),
    /// Working directory of the (virtual) process whose DLL lookup we are simulating
    WorkingDir(PathBuf),
    /// PATH as specified by the system
    SystemPath(PathBuf),
    /// Additional path entries specified by the user
    UserPath(PathBuf),
}

impl LookupPathEntry {
    pub fn is_system(&self) -> bool {
        matches!(self, Self::WindowsDir(_) | Self::SystemDir(_))
    }

    pub fn get_path(&self) -> Option<PathBuf> {
        match self {
            Self::LoadedModules => None,
            Self::ExecutableDir(p)
            | Self::SystemDir(p)
            | Self::WindowsDir(p)
            | Self::WorkingDir(p)
            | Self::SystemPath(p)
            | Self::UserPath(p) => Some(p.clone()),
        }
    }
}

/// Full location of a DLL found during lookup
#[derive(Debug, Clone)]
pub struct LookupResult {
    pub location: LookupPathEntry,
    pub fullpath: PathBuf,
}

/// Emulation of the loader search order over the filesystem
///
/// It is built from a resolution context, depending on the Windows installation it describes
/// (availability of a Windows root, and its configuration that influences the lookup).
/// Libraries resolved once are remembered for the lifetime of this object, as the loader keeps
/// them mapped in the process.
pub struct LookupPath {
    pub entries: Vec<LookupPathEntry>,
    scope: ResolutionScope,
    loaded_modules: RefCell<HashMap<String, PathBuf>>,
    fs_cache: RefCell<WinFileSystemCache>,
}

impl LookupPath {
    pub fn deduce(context: &ResolutionContext) -> Self {
        let entries = if let Some(system) = &context.system {
            let system_entries = vec![
                LookupPathEntry::SystemDir(system.sys_dir.clone()),
                LookupPathEntry::SystemDir(system.sys_dir.join("downlevel")),
                // 16-bit system directory ignored
                LookupPathEntry::WindowsDir(system.win_dir.clone()),
            ];

            if system.safe_dll_search_mode_on.unwrap_or(true) {
                // default mode (assume if not specified)
                [
                    vec![
                        LookupPathEntry::LoadedModules,
                        LookupPathEntry::ExecutableDir(context.app_dir.clone()),
                    ],
                    system_entries,
                    vec![LookupPathEntry::WorkingDir(context.working_dir.clone())],
                    Self::system_path_entries(context),
                    Self::user_path_entries(context),
                ]
                .concat()
            } else {
                [
                    vec![
                        LookupPathEntry::LoadedModules,
                        LookupPathEntry::ExecutableDir(context.app_dir.clone()),
                        LookupPathEntry::WorkingDir(context.working_dir.clone()),
                    ],
                    system_entries,
                    Self::system_path_entries(context),
                    Self::user_path_entries(context),
                ]
                .concat()
            }
        } else {
            [
                vec![
                    LookupPathEntry::LoadedModules,
                    LookupPathEntry::ExecutableDir(context.app_dir.clone()),
                    LookupPathEntry::WorkingDir(context.working_dir.clone()),
                ],
                Self::user_path_entries(context),
            ]
            .concat()
        };

        Self {
            entries,
            scope: ResolutionScope::new(context),
            loaded_modules: RefCell::new(HashMap::new()),
            fs_cache: RefCell::new(WinFileSystemCache::new()),
        }
    }

    /// Get the PATH entries specified by the system
    fn system_path_entries(context: &ResolutionContext) -> Vec<LookupPathEntry> {
        context
            .system
            .as_ref()
            .and_then(|s| s.system_path.as_ref())
            .map(|path| {
                path.iter()
                    .map(|s| LookupPathEntry::SystemPath(s.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get the PATH entries that were provided by the user when running the program
    fn user_path_entries(context: &ResolutionContext) -> Vec<LookupPathEntry> {
        context
            .user_path
            .iter()
            .map(|s| LookupPathEntry::UserPath(s.clone()))
            .collect()
    }

    // linearize the lookup path into a single vector of directories
    pub fn search_path(&self) -> Vec<PathBuf> {
        self.entries.iter().flat_map(|e| e.get_path()).collect()
    }

    /// looks for a DLL by name, walking the entries in order
    pub fn search_dll(&self, library: &str) -> Result<Option<LookupResult>, ResolveError> {
        for e in &self.entries {
            match e {
                LookupPathEntry::LoadedModules => {
                    if let Some(p) = self.loaded_modules.borrow().get(&library.to_lowercase()) {
                        return Ok(Some(LookupResult {
                            location: e.clone(),
                            fullpath: p.clone(),
                        }));
                    }
                }
                LookupPathEntry::ExecutableDir(p)
                | LookupPathEntry::SystemDir(p)
                | LookupPathEntry::WindowsDir(p)
                | LookupPathEntry::SystemPath(p)
                | LookupPathEntry::UserPath(p)
                | LookupPathEntry::WorkingDir(p) => {
                    // a missing directory in the search path is not an error
                    if let Ok(Some(r)) = self.search_file_in_folder(library, p) {
                        return Ok(Some(LookupResult {
                            location: e.clone(),
                            fullpath: r,
                        }));
                    }
                }
            }
        }
        Ok(None)
    }

    fn search_file_in_folder<P: AsRef<Path>>(
        &self,
        filename: &str,
        p: P,
    ) -> Result<Option<PathBuf>, ResolveError> {
        self.fs_cache
            .borrow_mut()
            .test_file_in_folder_case_insensitive(filename, p.as_ref())
    }
}

impl SearchOrderResolver for LookupPath {
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let found = match self.search_dll(file_name_of(name)) {
            Ok(found) => found?,
            Err(e) => {
                log::warn!("Searching {} failed: {}", name, e);
                return None;
            }
        };
        if !self.scope.accepts(&found.fullpath) {
            log::debug!(
                "Ignoring {} found outside of the application and system directories",
                found.fullpath.display()
            );
            return None;
        }
        // as the loader would, keep the module around for later lookups by the same name
        self.loaded_modules
            .borrow_mut()
            .entry(file_name_of(name).to_lowercase())
            .or_insert_with(|| found.fullpath.clone());
        Some(found.fullpath)
    }
}

/// Resolution through the native loader of the running Windows system
///
/// Modules are loaded into this process and deliberately never freed: unloading is expensive
/// and the same names are resolved over and over during a run.
#[cfg(windows)]
pub struct LoaderResolver {
    scope: ResolutionScope,
}

#[cfg(windows)]
impl LoaderResolver {
    pub fn new(context: &ResolutionContext) -> Result<Self, ResolveError> {
        use std::os::windows::ffi::OsStrExt;

        // the subject directory takes part in the search order as the application directory would
        let app_dir: Vec<u16> = context
            .app_dir
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        if unsafe { winapi::um::winbase::SetDllDirectoryW(app_dir.as_ptr()) } == 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self {
            scope: ResolutionScope::new(context),
        })
    }
}

#[cfg(windows)]
impl SearchOrderResolver for LoaderResolver {
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        use std::ffi::OsString;
        use std::os::windows::ffi::{OsStrExt, OsStringExt};
        use winapi::um::libloaderapi::{GetModuleFileNameW, LoadLibraryW};

        let wide_name: Vec<u16> = std::ffi::OsStr::new(file_name_of(name))
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        let module_handle = unsafe { LoadLibraryW(wide_name.as_ptr()) };
        if module_handle.is_null() {
            return None;
        }

        const BFR_SIZE: usize = 32768;
        let mut bfr = vec![0u16; BFR_SIZE];
        let ret = unsafe { GetModuleFileNameW(module_handle, bfr.as_mut_ptr(), BFR_SIZE as u32) };
        if ret == 0 {
            log::warn!(
                "GetModuleFileNameW() failed on {}: {}",
                name,
                std::io::Error::last_os_error()
            );
            return None;
        }

        let fullpath = PathBuf::from(OsString::from_wide(&bfr[..ret as usize]));
        if self.scope.accepts(&fullpath) {
            Some(fullpath)
        } else {
            log::debug!(
                "Ignoring {} loaded from outside of the application and system directories",
                fullpath.display()
            );
            None
        }
    }
}
