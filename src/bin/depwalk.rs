extern crate depwalker;

use anyhow::{bail, Context};
use clap::Parser;
use depwalker::apiset::ApiSetMap;
use depwalker::common::{path_to_string, readable_canonical_path};
use depwalker::models::{AssemblyNode, AssemblyTreeView};
use depwalker::{ScanQuery, ScanResult, ScanSettings, Scanner, WindowsSystem};
use fs_err as fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "depwalk")]
#[command(about = "Dependency graph of managed and native Windows executables")]
#[command(version)]
struct Args {
    /// Entry file (.exe or .dll)
    input: PathBuf,

    /// JSON file with the scan switches
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Follow the references of assemblies resolved outside the application tree
    #[arg(long)]
    scan_global_managed: bool,

    /// Follow the imports of system libraries
    #[arg(long)]
    scan_global_native: bool,

    /// Do not follow the native imports of mixed-mode assemblies
    #[arg(long)]
    skip_cli_references: bool,

    /// Do not follow DllImport declarations
    #[arg(long)]
    skip_dll_import: bool,

    /// Windows partition to use for system library lookup (default: the one INPUT lies in)
    #[arg(short, long, value_name = "DIR")]
    windows_root: Option<PathBuf>,

    /// System directory, overriding the one of the Windows partition
    #[arg(long, value_name = "DIR")]
    system_dir: Option<PathBuf>,

    /// apisetschema.dll to read the API set map from
    #[arg(long, value_name = "FILE", conflicts_with = "apiset_json")]
    apiset_schema: Option<PathBuf>,

    /// JSON file with the API set map
    #[arg(long, value_name = "FILE")]
    apiset_json: Option<PathBuf>,

    /// Additional global assembly cache directory
    #[arg(long, value_name = "DIR")]
    global_assembly_dir: Vec<PathBuf>,

    /// Maximum depth of the printed tree (default: unlimited)
    #[arg(short = 'd', long)]
    max_depth: Option<usize>,

    /// Include system libraries in the output
    #[arg(long)]
    print_system: bool,

    /// Print every dependency once, ldd style
    #[arg(long)]
    flat: bool,

    /// Path for output in JSON format
    #[arg(short = 'j', long, value_name = "OUTPUT_JSON_PATH")]
    output_json_path: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn folder(node: &AssemblyNode) -> String {
    if !node.is_resolved {
        return "not found".to_owned();
    }
    match &node.file_path {
        Some(p) => p
            .parent()
            .and_then(|d| readable_canonical_path(d).ok())
            .unwrap_or_else(|| "INVALID".to_owned()),
        None => "global".to_owned(),
    }
}

fn tags(node: &AssemblyNode) -> String {
    let mut ret = vec![if node.is_native { "native" } else { "managed" }.to_owned()];
    if node.is_system() {
        ret.push("system".to_owned());
    }
    if !node.is_native && !node.is_il_only && node.is_resolved {
        ret.push("mixed".to_owned());
    }
    if let Some(p) = node.target_processor {
        ret.push(format!("{p:?}"));
    }
    if node.is_debug == Some(true) {
        ret.push("debug".to_owned());
    }
    format!("[{}]", ret.join(", "))
}

fn print_tree(result: &ScanResult, view: &AssemblyTreeView, index: usize, print_system: bool) {
    let entry = &view.arena[index];
    let node = result.graph.node(entry.node);
    if !print_system && node.is_system() {
        return;
    }
    let version = match entry.link.map(|l| result.graph.link(l)) {
        Some(link) if link.is_version_mismatch(&result.graph) => format!(
            " (requested {}, found {})",
            link.requested_version.as_deref().unwrap_or("?"),
            node.loaded_version.as_deref().unwrap_or("?")
        ),
        _ => String::new(),
    };
    println!(
        "{}{}{} => {} {}",
        "\t".repeat(entry.depth),
        node.name,
        version,
        folder(node),
        tags(node)
    );
    for &child in &entry.children {
        print_tree(result, view, child, print_system);
    }
}

fn print_flat(result: &ScanResult, print_system: bool) {
    for id in result.graph.reachable(result.root) {
        let node = result.graph.node(id);
        if !print_system && node.is_system() {
            continue;
        }
        let location = match &node.file_path {
            Some(p) if node.is_resolved => path_to_string(p),
            _ => folder(node),
        };
        println!("\t{} => {}", node.name, location);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if !args.input.exists() {
        bail!(
            "Specified file not found at {}\nCurrent working directory: {}",
            args.input.display(),
            std::env::current_dir()?.display()
        );
    }
    if args.input.is_dir() {
        bail!(
            "The specified path is a directory, not an executable file: {}",
            args.input.display()
        );
    }
    let entry = fs::canonicalize(&args.input)?;

    let mut query = ScanQuery::deduce_from_entry_location(&entry)?;

    if let Some(settings_path) = &args.settings {
        query.settings = ScanSettings::from_json_file(settings_path)
            .with_context(|| format!("Could not read settings from {}", settings_path.display()))?;
    }
    query.settings.scan_global_managed |= args.scan_global_managed;
    query.settings.scan_global_native |= args.scan_global_native;
    if args.skip_cli_references {
        query.settings.scan_cli_references = false;
    }
    if args.skip_dll_import {
        query.settings.scan_dll_import = false;
    }

    // overrides (must be last)

    if let Some(root) = &args.windows_root {
        query.system = WindowsSystem::from_root(root);
        if query.system.is_none() {
            warn!("No Windows installation found at {}", root.display());
        }
        query.global_assembly_dirs = query
            .system
            .as_ref()
            .map(WindowsSystem::global_assembly_dirs)
            .unwrap_or_default();
    } else if let Some(system) = &query.system {
        info!("Windows partition root not specified, assumed {}", path_to_string(&system.sys_dir));
    } else {
        info!("Windows partition root not specified, and the entry doesn't lie in one; system libraries will not be resolved");
    }
    query.global_assembly_dirs.extend(args.global_assembly_dir.iter().cloned());

    let mut scanner = Scanner::from_query(&query);
    if let Some(system_dir) = &args.system_dir {
        scanner = scanner.with_system_dir(Some(system_dir.clone()));
    }
    if let Some(schema) = &args.apiset_schema {
        let map = ApiSetMap::from_schema_file(schema)
            .with_context(|| format!("Could not read the API set schema {}", schema.display()))?;
        scanner = scanner.with_apiset(Arc::new(map));
    } else if let Some(json) = &args.apiset_json {
        let map = ApiSetMap::from_json_file(json)
            .with_context(|| format!("Could not read the API set map {}", json.display()))?;
        scanner = scanner.with_apiset(Arc::new(map));
    }

    let mut result = scanner
        .scan_async(&entry)
        .await
        .with_context(|| format!("Could not scan {}", entry.display()))?;
    result.normalize();

    if let Some(json_path) = &args.output_json_path {
        let js = serde_json::to_string_pretty(&result)?;
        fs::write(json_path, js)?;
    }

    if args.flat {
        print_flat(&result, args.print_system);
    } else {
        let view = AssemblyTreeView::new(&result.graph, result.root, args.max_depth);
        if !view.is_empty() {
            print_tree(&result, &view, 0, args.print_system);
        }
    }

    Ok(())
}
