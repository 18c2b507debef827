extern crate thiserror;

mod casing;
mod timer;

pub mod common;
pub mod lookup_path;
pub mod pe;
pub mod query;
pub mod report;
pub mod runner;
pub mod system;

#[cfg(test)]
mod testutil;

pub use casing::correct_path_casing;
pub use common::{decanonicalize, path_to_string, ResolveError};
pub use lookup_path::{LookupPath, SearchOrderResolver};
pub use pe::{ImportReader, PEImportReader};
pub use query::ResolutionContext;
pub use report::ResolvedDependencies;

/// Compute the transitive closure of the subject's dependencies with the given collaborators
pub fn resolve(
    context: &ResolutionContext,
    resolver: &dyn SearchOrderResolver,
    reader: &dyn ImportReader,
) -> Result<ResolvedDependencies, ResolveError> {
    let mut runner = runner::Runner::new(context, resolver, reader);
    runner.run()
}

/// Resolver matching the context: the native loader if running on Windows, unless emulation was asked
pub fn default_resolver(
    context: &ResolutionContext,
) -> Result<Box<dyn SearchOrderResolver>, ResolveError> {
    #[cfg(windows)]
    if !context.emulate_search_order {
        return Ok(Box::new(lookup_path::LoaderResolver::new(context)?));
    }
    Ok(Box::new(LookupPath::deduce(context)))
}

/// Resolve the dependencies of the subject, log the report and write it where requested
pub fn resolve_references(
    context: &ResolutionContext,
) -> Result<ResolvedDependencies, ResolveError> {
    let resolver = default_resolver(context)?;
    let res = resolve(context, resolver.as_ref(), &PEImportReader)?;

    log::info!("Result JSON:\n{}", res.to_json()?);
    if let Some(output_path) = &context.output_path {
        res.write_to_file(output_path)?;
    }
    Ok(res)
}
