extern crate dll_references;

use anyhow::Context;
use clap::{ArgAction, Parser};
use dll_references::common::path_to_string;
use dll_references::lookup_path::LookupPath;
use dll_references::query::ResolutionContext;
use dll_references::system::WindowsSystem;
use log::LevelFilter;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "dllrefs",
    version,
    about = "List the DLLs a Windows executable transitively depends on"
)]
struct Cli {
    /// Executable whose dependencies are resolved
    #[arg(long, value_name = "FILE")]
    pe_file_path: PathBuf,
    /// Do not parse the imports of libraries living in the System directory
    #[arg(long)]
    skip_parsing_system32_dll_dependencies: bool,
    /// Write the result JSON to this file
    #[arg(long, value_name = "FILE")]
    results_output_file_path: Option<PathBuf>,
    /// Verbosity level
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// Walk the DLL search order over the filesystem instead of loading the libraries
    #[arg(long)]
    emulate_search_order: bool,
    /// Windows partition to use for system DLLs lookup (default: the one the executable lies in)
    #[arg(long, value_name = "DIR")]
    windows_root: Option<PathBuf>,
    /// Additional directories for the DLL search path, separated by ';'
    #[arg(long, value_name = "PATH")]
    userpath: Option<String>,
}

fn init_logging(verbosity: u8) {
    let log_level = match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();
}

fn build_context(cli: &Cli) -> anyhow::Result<ResolutionContext> {
    let mut context = ResolutionContext::deduce_from_executable_location(&cli.pe_file_path)?;
    context.skip_system_dlls = cli.skip_parsing_system32_dll_dependencies;
    context.emulate_search_order |= cli.emulate_search_order;
    context.output_path = cli.results_output_file_path.clone();

    // overrides (must be last)

    if let Some(root) = &cli.windows_root {
        context.system = Some(WindowsSystem::from_root(root).with_context(|| {
            format!("No Windows installation found at {}", path_to_string(root))
        })?);
    } else if let Some(system) = &context.system {
        log::debug!(
            "Windows partition root not specified, assumed {}",
            path_to_string(&system.win_dir)
        );
    } else {
        log::warn!("Windows partition root not specified, and executable doesn't lie in one; system DLL imports will not be resolved");
    }

    if let Some(userpath) = &cli.userpath {
        for entry in userpath.split(';').filter(|s| !s.is_empty()) {
            let p = PathBuf::from(entry);
            if p.is_dir() {
                context.user_path.push(p);
            } else {
                log::warn!("Skipping non-existing path entry {}", entry);
            }
        }
    }

    Ok(context)
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let context = build_context(cli)?;

    log::info!(
        "Looking for dependencies of binary {}",
        path_to_string(&context.subject)
    );
    if context.emulate_search_order {
        let search_path: Vec<String> = LookupPath::deduce(&context)
            .search_path()
            .iter()
            .map(path_to_string)
            .collect();
        log::debug!("Search path: {}", search_path.join(", "));
    }

    dll_references::resolve_references(&context).with_context(|| {
        format!(
            "Resolving the DLL references of {} failed",
            path_to_string(&context.subject)
        )
    })?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(&cli) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}
