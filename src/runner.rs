use crate::casing::correct_path_casing;
use crate::common::{path_to_string, ResolveError};
use crate::lookup_path::SearchOrderResolver;
use crate::pe::{ImportReader, ImportedNames};
use crate::query::ResolutionContext;
use crate::report::ResolvedDependencies;
use crate::timer::ExecutionTimer;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

/// A dependency, as named in an import table or as located on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleIdentity {
    /// Bare library name that the search order could not map to a file
    Unresolved(String),
    /// Absolute path, spelled as on disk
    Resolved(PathBuf),
}

impl ModuleIdentity {
    /// Identities are compared ignoring case, as the Windows filesystem does
    fn key(&self) -> String {
        self.to_string().to_lowercase()
    }

    pub fn resolved_path(&self) -> Option<&Path> {
        match self {
            Self::Resolved(p) => Some(p),
            Self::Unresolved(_) => None,
        }
    }

    /// File to read the import table from; bare names are looked up next to the subject
    fn image_path(&self, app_dir: &Path) -> PathBuf {
        match self {
            Self::Resolved(p) => p.clone(),
            Self::Unresolved(name) => app_dir.join(name),
        }
    }
}

impl Display for ModuleIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unresolved(name) => f.write_str(name),
            Self::Resolved(p) => f.write_str(&path_to_string(p)),
        }
    }
}

/// Collection of module identities, using the lowercase spelling as key
///
/// The first spelling inserted for a key is the one kept.
#[derive(Debug, Clone, Default)]
pub struct ModuleSet {
    index: BTreeMap<String, ModuleIdentity>,
}

impl ModuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the module was not yet in the set
    pub fn insert(&mut self, m: ModuleIdentity) -> bool {
        match self.index.entry(m.key()) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(m);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn contains(&self, m: &ModuleIdentity) -> bool {
        self.index.contains_key(&m.key())
    }

    pub fn remove(&mut self, m: &ModuleIdentity) -> Option<ModuleIdentity> {
        self.index.remove(&m.key())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleIdentity> {
        self.index.values()
    }

    pub fn clear(&mut self) {
        self.index.clear()
    }
}

/// Everything the closure has learned so far; scoped to a single run
#[derive(Debug, Clone, Default)]
pub struct ClosureState {
    discovered: ModuleSet,
    parsed: HashSet<String>,
    missing: ModuleSet,
    discovered_counts: Vec<usize>,
}

impl ClosureState {
    pub fn discovered(&self) -> impl Iterator<Item = &ModuleIdentity> {
        self.discovered.iter()
    }

    pub fn missing(&self) -> impl Iterator<Item = &ModuleIdentity> {
        self.missing.iter()
    }

    pub fn is_missing(&self, m: &ModuleIdentity) -> bool {
        self.missing.contains(m)
    }

    pub fn is_parsed(&self, m: &ModuleIdentity) -> bool {
        self.parsed.contains(&m.key())
    }

    /// Number of discovered modules at the end of each iteration
    pub fn discovered_counts(&self) -> &[usize] {
        &self.discovered_counts
    }

    fn reset(&mut self) {
        self.discovered.clear();
        self.parsed.clear();
        self.missing.clear();
        self.discovered_counts.clear();
    }
}

/// Finds the transitive dependencies of the subject executable within the given context
///
/// Every iteration walks a snapshot of the modules discovered so far, parsing those that were
/// not parsed yet and adding the libraries they import; the closure is complete the first time
/// an iteration discovers nothing new.
pub struct Runner<'a> {
    context: &'a ResolutionContext,
    resolver: &'a dyn SearchOrderResolver,
    reader: &'a dyn ImportReader,
    state: ClosureState,
}

impl<'a> Runner<'a> {
    pub fn new(
        context: &'a ResolutionContext,
        resolver: &'a dyn SearchOrderResolver,
        reader: &'a dyn ImportReader,
    ) -> Self {
        Self {
            context,
            resolver,
            reader,
            state: ClosureState::default(),
        }
    }

    pub fn state(&self) -> &ClosureState {
        &self.state
    }

    /// Forget everything learned by a previous run
    pub fn reset(&mut self) {
        self.state.reset()
    }

    pub fn run(&mut self) -> Result<ResolvedDependencies, ResolveError> {
        self.reset();

        info!("Finding dependent DLLs recursively...");
        let timer = ExecutionTimer::new();

        let subject = ModuleIdentity::Resolved(self.context.subject.clone());
        self.state.discovered.insert(subject.clone());
        self.converge(&subject)?;
        self.state.discovered.remove(&subject);

        let report = ResolvedDependencies::classify(
            &self.state,
            self.resolver,
            &self.context.user_profile,
        );
        info!("{}", timer.build_log_message("DLL references resolver"));
        Ok(report)
    }

    fn converge(&mut self, subject: &ModuleIdentity) -> Result<(), ResolveError> {
        loop {
            let snapshot: Vec<ModuleIdentity> = self.state.discovered.iter().cloned().collect();
            let previous_count = snapshot.len();
            // each name is resolved at most once per iteration
            let mut resolutions: HashMap<String, Option<PathBuf>> = HashMap::new();

            for module in &snapshot {
                if self.context.skip_system_dlls && self.is_in_system_dir(module) {
                    debug!("Skipping to parse system directory module {}...", module);
                    continue;
                }

                if self.state.is_parsed(module) {
                    debug!("Module {} already parsed, skipping...", module);
                    continue;
                }

                match self.parse_module(module) {
                    Ok(imports) => {
                        self.state.parsed.insert(module.key());
                        for name in imports {
                            let dependency = self.resolve_import(&name, &mut resolutions);
                            self.state.discovered.insert(dependency);
                        }
                        debug!("Module name count: {}", self.state.discovered.len());
                    }
                    Err(e) if module == subject => return Err(e),
                    Err(e) => {
                        error!("{}", e);
                        self.state.missing.insert(module.clone());
                    }
                }
            }

            let updated_count = self.state.discovered.len();
            self.state.discovered_counts.push(updated_count);
            if updated_count == previous_count {
                debug!("No more new modules found...");
                return Ok(());
            }
        }
    }

    fn is_in_system_dir(&self, module: &ModuleIdentity) -> bool {
        match (module.resolved_path(), &self.context.system) {
            (Some(p), Some(system)) => system.is_in_system_dir(p),
            _ => false,
        }
    }

    fn parse_module(&self, module: &ModuleIdentity) -> Result<ImportedNames, ResolveError> {
        let path = module.image_path(&self.context.app_dir);
        let timer = ExecutionTimer::new();
        debug!("Parsing PE file {}...", path.display());
        let imports = self.reader.read_imports(&path)?;
        debug!(
            "{}",
            timer.build_log_message(&format!("Getting imported modules for {}", path.display()))
        );
        Ok(imports)
    }

    fn resolve_import(
        &self,
        name: &str,
        resolutions: &mut HashMap<String, Option<PathBuf>>,
    ) -> ModuleIdentity {
        let resolved = resolutions
            .entry(name.to_lowercase())
            .or_insert_with(|| self.resolve_canonical(name));
        match resolved {
            Some(p) => ModuleIdentity::Resolved(p.clone()),
            None => ModuleIdentity::Unresolved(name.to_owned()),
        }
    }

    fn resolve_canonical(&self, name: &str) -> Option<PathBuf> {
        let timer = ExecutionTimer::new();
        let found = self.resolver.resolve(name)?;
        debug!("{}", timer.build_log_message(&format!("Resolving {}", name)));
        match correct_path_casing(&found) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("Leaving {} unresolved: {}", name, e);
                None
            }
        }
    }
}
