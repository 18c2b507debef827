//! Throwaway Windows-like directory trees and in-memory collaborators for unit tests

use crate::common::{file_name_of, path_to_string, ResolveError};
use crate::lookup_path::SearchOrderResolver;
use crate::pe::{ImportReader, ImportedNames};
use crate::query::ResolutionContext;
use crate::report::UserProfile;
use crate::system::WindowsSystem;
use fs_err as fs;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A fake partition: `Windows/System32` with KERNEL32.dll, and an application in the home of Alice
///
/// ```text
/// <root>/Windows/System32/KERNEL32.dll
/// <root>/Users/Alice/App/App.exe
/// <root>/Elsewhere/
/// ```
pub struct WindowsTree {
    pub root: TempDir,
    pub home: PathBuf,
    pub app_dir: PathBuf,
    pub subject: PathBuf,
    pub win_dir: PathBuf,
    pub sys_dir: PathBuf,
    pub elsewhere: PathBuf,
}

impl WindowsTree {
    pub fn new() -> Result<Self, ResolveError> {
        let root = tempfile::tempdir()?;
        let win_dir = root.path().join("Windows");
        let sys_dir = win_dir.join("System32");
        let home = root.path().join("Users").join("Alice");
        let app_dir = home.join("App");
        let elsewhere = root.path().join("Elsewhere");
        for d in [&sys_dir, &app_dir, &elsewhere] {
            fs::create_dir_all(d)?;
        }
        fs::write(sys_dir.join("KERNEL32.dll"), b"")?;
        let subject = app_dir.join("App.exe");
        fs::write(&subject, b"")?;

        Ok(Self {
            root,
            home,
            app_dir,
            subject,
            win_dir,
            sys_dir,
            elsewhere,
        })
    }

    /// Context for the tree's application, independent of the host environment
    pub fn context(&self) -> Result<ResolutionContext, ResolveError> {
        let system = WindowsSystem::from_root(self.root.path()).ok_or_else(|| {
            ResolveError::ContextDeductionError("test tree lost its System32".to_owned())
        })?;
        Ok(ResolutionContext {
            subject: self.subject.clone(),
            app_dir: self.app_dir.clone(),
            working_dir: self.app_dir.clone(),
            user_path: Vec::new(),
            system: Some(system),
            skip_system_dlls: false,
            emulate_search_order: true,
            output_path: None,
            user_profile: UserProfile::new("USERPROFILE", Some(&path_to_string(&self.home))),
        })
    }

    pub fn add_system_dll(&self, name: &str) -> Result<PathBuf, ResolveError> {
        Self::touch(self.sys_dir.join(name))
    }

    pub fn add_app_dll(&self, name: &str) -> Result<PathBuf, ResolveError> {
        Self::touch(self.app_dir.join(name))
    }

    fn touch(p: PathBuf) -> Result<PathBuf, ResolveError> {
        fs::write(&p, b"")?;
        Ok(p)
    }
}

/// Import tables by (case-insensitive) file name; unknown images fail to parse
#[derive(Debug, Default)]
pub struct MemoryImportReader {
    imports: HashMap<String, Vec<String>>,
}

impl MemoryImportReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, image: &str, imports: &[&str]) -> Self {
        self.imports.insert(
            image.to_lowercase(),
            imports.iter().map(|s| s.to_string()).collect(),
        );
        self
    }
}

impl ImportReader for MemoryImportReader {
    fn read_imports(&self, path: &Path) -> Result<ImportedNames, ResolveError> {
        let name = path_to_string(path);
        self.imports
            .get(&file_name_of(&name).to_lowercase())
            .map(|imports| imports.clone().into_iter())
            .ok_or_else(|| ResolveError::ParseError {
                path: path.to_owned(),
                reason: "no such image".to_owned(),
            })
    }
}

/// Fixed name to path mapping, ignoring case; the paths need not exist
#[derive(Debug, Default)]
pub struct MemoryResolver {
    locations: HashMap<String, PathBuf>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, location: PathBuf) -> Self {
        self.locations.insert(name.to_lowercase(), location);
        self
    }
}

impl SearchOrderResolver for MemoryResolver {
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        self.locations
            .get(&file_name_of(name).to_lowercase())
            .cloned()
    }
}

fn put(image: &mut [u8], at: usize, bytes: &[u8]) {
    image[at..at + bytes.len()].copy_from_slice(bytes);
}

/// Smallest PE image the loaders accept, importing `Entry` from each library in the given order
///
/// One `.idata` section at RVA 0x1000 holds the import directory, the lookup and address
/// tables, the hint/name entries and the library names.
pub fn pe_image(is_64: bool, libraries: &[&str]) -> Vec<u8> {
    const E_LFANEW: usize = 0x80;
    const SIZE_OF_HEADERS: usize = 0x200;
    const SECTION_RVA: usize = 0x1000;
    const SECTION_SIZE: usize = 0x400;
    const DESCRIPTOR_SIZE: usize = 20;

    let mut image = vec![0u8; SIZE_OF_HEADERS + SECTION_SIZE];
    put(&mut image, 0, b"MZ");
    put(&mut image, 0x3c, &(E_LFANEW as u32).to_le_bytes());
    put(&mut image, E_LFANEW, b"PE\0\0");

    // COFF header
    let coff = E_LFANEW + 4;
    let (machine, characteristics, optional_size): (u16, u16, u16) = if is_64 {
        (0x8664, 0x0022, 0xf0)
    } else {
        (0x014c, 0x0102, 0xe0)
    };
    put(&mut image, coff, &machine.to_le_bytes());
    put(&mut image, coff + 2, &1u16.to_le_bytes());
    put(&mut image, coff + 16, &optional_size.to_le_bytes());
    put(&mut image, coff + 18, &characteristics.to_le_bytes());

    // optional header, standard fields
    let optional = coff + 20;
    let magic: u16 = if is_64 { 0x20b } else { 0x10b };
    put(&mut image, optional, &magic.to_le_bytes());
    put(&mut image, optional + 16, &(SECTION_RVA as u32).to_le_bytes());
    put(&mut image, optional + 20, &(SECTION_RVA as u32).to_le_bytes());

    // windows fields
    let windows = optional + if is_64 { 24 } else { 28 };
    let (fields, data_directories) = if is_64 {
        put(&mut image, windows, &0x1_4000_0000u64.to_le_bytes());
        (windows + 8, windows + 88)
    } else {
        put(&mut image, windows, &0x40_0000u32.to_le_bytes());
        (windows + 4, windows + 68)
    };
    put(&mut image, fields, &0x1000u32.to_le_bytes()); // section alignment
    put(&mut image, fields + 4, &0x200u32.to_le_bytes()); // file alignment
    put(&mut image, fields + 8, &6u16.to_le_bytes()); // OS version
    put(&mut image, fields + 16, &6u16.to_le_bytes()); // subsystem version
    put(&mut image, fields + 24, &0x2000u32.to_le_bytes()); // size of image
    put(&mut image, fields + 28, &(SIZE_OF_HEADERS as u32).to_le_bytes());
    put(&mut image, fields + 36, &3u16.to_le_bytes()); // console subsystem
    put(&mut image, data_directories - 4, &16u32.to_le_bytes());

    if !libraries.is_empty() {
        let import_directory = data_directories + 8;
        let size = (libraries.len() + 1) * DESCRIPTOR_SIZE;
        put(&mut image, import_directory, &(SECTION_RVA as u32).to_le_bytes());
        put(&mut image, import_directory + 4, &(size as u32).to_le_bytes());
    }

    // section table
    let section = optional + optional_size as usize;
    put(&mut image, section, b".idata\0\0");
    put(&mut image, section + 8, &(SECTION_SIZE as u32).to_le_bytes());
    put(&mut image, section + 12, &(SECTION_RVA as u32).to_le_bytes());
    put(&mut image, section + 16, &(SECTION_SIZE as u32).to_le_bytes());
    put(&mut image, section + 20, &(SIZE_OF_HEADERS as u32).to_le_bytes());
    put(&mut image, section + 36, &0xc000_0040u32.to_le_bytes());

    // import data
    let to_offset = |rva: usize| rva - SECTION_RVA + SIZE_OF_HEADERS;
    let thunk_size = if is_64 { 8 } else { 4 };
    let mut cursor = SECTION_RVA + (libraries.len() + 1) * DESCRIPTOR_SIZE;
    for (i, library) in libraries.iter().enumerate() {
        cursor = (cursor + 7) & !7;
        let lookup_table = cursor;
        let address_table = lookup_table + 2 * thunk_size;
        let hint_name = address_table + 2 * thunk_size;
        let name = hint_name + 8;
        cursor = name + library.len() + 1;
        assert!(cursor <= SECTION_RVA + SECTION_SIZE, "too many imports for the fixture");

        let descriptor = to_offset(SECTION_RVA + i * DESCRIPTOR_SIZE);
        put(&mut image, descriptor, &(lookup_table as u32).to_le_bytes());
        put(&mut image, descriptor + 12, &(name as u32).to_le_bytes());
        put(&mut image, descriptor + 16, &(address_table as u32).to_le_bytes());
        for table in [lookup_table, address_table] {
            if is_64 {
                put(&mut image, to_offset(table), &(hint_name as u64).to_le_bytes());
            } else {
                put(&mut image, to_offset(table), &(hint_name as u32).to_le_bytes());
            }
        }
        put(&mut image, to_offset(hint_name) + 2, b"Entry");
        put(&mut image, to_offset(name), library.as_bytes());
    }

    image
}
