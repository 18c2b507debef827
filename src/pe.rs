//! Low-level PE file format access through the goblin and pelite libraries

use crate::common::ResolveError;
use fs_err as fs;
use std::path::{Path, PathBuf};

/// Names of the libraries declared in an import directory, in directory order
pub type ImportedNames = std::vec::IntoIter<String>;

/// Extracts the statically imported library names of a binary image
pub trait ImportReader {
    fn read_imports(&self, path: &Path) -> Result<ImportedNames, ResolveError>;
}

pub struct PEFileMap {
    path: PathBuf,
    content: Vec<u8>,
}

impl PEFileMap {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, ResolveError> {
        let content = fs::read(path.as_ref()).map_err(|e| ResolveError::CouldNotOpenFile {
            path: path.as_ref().to_owned(),
            source: e,
        })?;
        Ok(Self {
            path: PathBuf::from(path.as_ref()),
            content,
        })
    }
}

pub struct PEFile<'a> {
    path: &'a Path,
    content: &'a [u8],
    peobject: Option<goblin::pe::PE<'a>>,
}

impl<'a> PEFile<'a> {
    pub fn new(filemap: &'a PEFileMap) -> Result<Self, ResolveError> {
        let peobject = match goblin::Object::parse(&filemap.content) {
            Ok(goblin::Object::PE(pe)) => Some(pe),
            Ok(_) => return Err(ResolveError::WrongFileFormat(filemap.path.clone())),
            Err(e) => {
                log::debug!(
                    "goblin could not parse {}, falling back to pelite: {}",
                    filemap.path.display(),
                    e
                );
                None
            }
        };
        Ok(Self {
            path: &filemap.path,
            content: &filemap.content,
            peobject,
        })
    }

    /// read the names of the DLLs this executable depends on
    pub fn read_dependencies(&self) -> Result<Vec<String>, ResolveError> {
        // prefer goblin since it seems to be less fragile
        if let Some(peo) = self.peobject.as_ref() {
            // not `libraries`, which goblin sorts and deduplicates
            return Ok(peo
                .import_data
                .as_ref()
                .map(|id| {
                    id.import_data
                        .iter()
                        .map(|entry| entry.name)
                        .filter(|name| !name.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default());
        }

        read_dependencies_pelite(self.content).map_err(|e| match e {
            pelite::Error::BadMagic | pelite::Error::PeMagic => {
                ResolveError::WrongFileFormat(self.path.to_owned())
            }
            other => ResolveError::ParseError {
                path: self.path.to_owned(),
                reason: other.to_string(),
            },
        })
    }
}

fn read_dependencies_pelite(content: &[u8]) -> Result<Vec<String>, pelite::Error> {
    let names = match pelite::PeFile::from_bytes(content)? {
        pelite::Wrap::T32(file) => {
            use pelite::pe32::Pe;
            let imports = match file.imports() {
                // no import directory at all
                Err(pelite::Error::Null) => return Ok(Vec::new()),
                imports => imports?,
            };
            imports
                .iter()
                .map(|desc| desc.dll_name().map(|n| n.to_str().ok().map(str::to_owned)))
                .collect::<Result<Vec<_>, pelite::Error>>()?
        }
        pelite::Wrap::T64(file) => {
            use pelite::pe64::Pe;
            let imports = match file.imports() {
                // no import directory at all
                Err(pelite::Error::Null) => return Ok(Vec::new()),
                imports => imports?,
            };
            imports
                .iter()
                .map(|desc| desc.dll_name().map(|n| n.to_str().ok().map(str::to_owned)))
                .collect::<Result<Vec<_>, pelite::Error>>()?
        }
    };
    Ok(names.into_iter().flatten().collect())
}

/// Reads import directories from PE images on disk
#[derive(Debug, Default, Clone, Copy)]
pub struct PEImportReader;

impl ImportReader for PEImportReader {
    fn read_imports(&self, path: &Path) -> Result<ImportedNames, ResolveError> {
        let filemap = PEFileMap::new(path)?;
        let pefile = PEFile::new(&filemap)?;
        Ok(pefile.read_dependencies()?.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::{read_dependencies_pelite, ImportReader, PEFile, PEFileMap, PEImportReader};
    use crate::common::ResolveError;
    use crate::testutil::pe_image;
    use fs_err as fs;

    const IMPORTS: &[&str] = &["LibB.dll", "KERNEL32.dll", "LibA.dll"];

    #[test]
    fn imports_in_directory_order() -> Result<(), ResolveError> {
        let dir = tempfile::tempdir()?;
        for (is_64, name) in [(true, "App64.exe"), (false, "App32.exe")] {
            let path = dir.path().join(name);
            fs::write(&path, pe_image(is_64, IMPORTS))?;

            let filemap = PEFileMap::new(&path)?;
            let pefile = PEFile::new(&filemap)?;
            assert!(pefile.peobject.is_some());
            assert_eq!(pefile.read_dependencies()?, IMPORTS);

            let names: Vec<String> = PEImportReader.read_imports(&path)?.collect();
            assert_eq!(names, IMPORTS);
        }
        Ok(())
    }

    #[test]
    fn pelite_fallback_reads_the_same_imports() -> Result<(), pelite::Error> {
        for is_64 in [true, false] {
            let image = pe_image(is_64, IMPORTS);
            assert_eq!(read_dependencies_pelite(&image)?, IMPORTS);
            assert!(read_dependencies_pelite(&pe_image(is_64, &[]))?.is_empty());
        }
        Ok(())
    }

    #[test]
    fn image_without_imports() -> Result<(), ResolveError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("Leaf.dll");
        fs::write(&path, pe_image(true, &[]))?;
        assert_eq!(PEImportReader.read_imports(&path)?.count(), 0);
        Ok(())
    }

    #[test]
    fn missing_file_cannot_be_opened() {
        let dir = tempfile::tempdir().unwrap();
        let res = PEImportReader.read_imports(&dir.path().join("absent.dll"));
        assert!(matches!(res, Err(ResolveError::CouldNotOpenFile { .. })));
    }

    #[test]
    fn garbage_is_not_an_image() -> Result<(), ResolveError> {
        let dir = tempfile::tempdir()?;
        let garbage = dir.path().join("garbage.dll");
        fs::write(&garbage, b"this is certainly not a portable executable")?;
        let res = PEImportReader.read_imports(&garbage);
        assert!(matches!(
            res,
            Err(ResolveError::WrongFileFormat(_)) | Err(ResolveError::ParseError { .. })
        ));
        Ok(())
    }

    #[test]
    fn empty_file_is_not_an_image() -> Result<(), ResolveError> {
        let dir = tempfile::tempdir()?;
        let empty = dir.path().join("empty.dll");
        fs::write(&empty, b"")?;
        assert!(PEImportReader.read_imports(&empty).is_err());
        Ok(())
    }
}
