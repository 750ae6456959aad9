//! sbdump - dump the libsandbox tables of a dyld shared cache.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use sbdump::sandbox::{
    decode_operand, extract_filters, extract_modifiers, extract_operations, reference,
    ChainLimits, FixedBound, NoPool, Table, FILTER_COUNT, LIBSANDBOX_IMAGE, MODIFIER_COUNT,
};
use sbdump::{
    extract_from_cache, webkit_version, CacheImage, DyldContext, ExtractOptions,
    LibSandboxSnapshot, SnapshotDiff,
};

/// Default locations to search for dyld shared caches on macOS.
const DEFAULT_CACHE_PATHS: &[&str] = &[
    // macOS Ventura+ (cryptex)
    "/System/Volumes/Preboot/Cryptexes/OS/System/Library/dyld",
    // Traditional location
    "/System/Library/dyld",
    // Alternative location
    "/var/db/dyld",
];

/// Dump libsandbox operation, filter and modifier tables from a dyld shared cache.
#[derive(Parser, Debug)]
#[command(name = "sbdump")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v warnings, -vv info, -vvv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Selects a cache file.
#[derive(Args, Debug)]
struct CacheArgs {
    /// Architecture to use (e.g., "arm64e", "x86_64").
    /// Substring match: "arm64" matches "arm64e"
    #[arg(short, long)]
    arch: Option<String>,

    /// Path to the dyld shared cache (file or directory).
    /// If not specified, searches default system locations.
    cache: Option<PathBuf>,
}

/// Table sizing and walker limits.
#[derive(Args, Debug)]
struct TableArgs {
    /// Highest filter id
    #[arg(long, default_value_t = FILTER_COUNT)]
    filter_bound: usize,

    /// Number of modifier rows
    #[arg(long, default_value_t = MODIFIER_COUNT)]
    modifier_bound: usize,

    /// Maximum length of a zero-terminated list
    #[arg(long, default_value_t = ChainLimits::default().max_len)]
    max_chain: usize,
}

impl TableArgs {
    fn options(&self) -> ExtractOptions {
        ExtractOptions {
            filter_bound: Box::new(FixedBound(self.filter_bound)),
            modifier_bound: Box::new(FixedBound(self.modifier_bound)),
            chain_limits: ChainLimits {
                max_len: self.max_chain,
            },
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the filter table as JSON
    Filters {
        #[command(flatten)]
        cache: CacheArgs,
        #[command(flatten)]
        tables: TableArgs,
        /// Pretty-print the JSON
        #[arg(short, long)]
        pretty: bool,
    },

    /// Print the modifier table as JSON
    Modifiers {
        #[command(flatten)]
        cache: CacheArgs,
        #[command(flatten)]
        tables: TableArgs,
        /// Pretty-print the JSON
        #[arg(short, long)]
        pretty: bool,
    },

    /// Print the operation table as JSON
    Operations {
        #[command(flatten)]
        cache: CacheArgs,
        #[command(flatten)]
        tables: TableArgs,
        /// Pretty-print the JSON
        #[arg(short, long)]
        pretty: bool,
    },

    /// Write all three tables as one snapshot
    Dump {
        #[command(flatten)]
        cache: CacheArgs,
        #[command(flatten)]
        tables: TableArgs,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// gzip-compress the snapshot
        #[arg(short, long)]
        gzip: bool,
        /// Pretty-print the JSON (ignored with --gzip)
        #[arg(short, long)]
        pretty: bool,
    },

    /// Compare the cache's tables with a reference snapshot
    Diff {
        #[command(flatten)]
        cache: CacheArgs,
        #[command(flatten)]
        tables: TableArgs,
        /// Reference snapshot (JSON, optionally gzip-compressed)
        #[arg(short, long)]
        reference: PathBuf,
        /// Print the differing ids as JSON
        #[arg(long)]
        json: bool,
    },

    /// Decode a raw filter operand using a reference snapshot
    Decode {
        /// Reference snapshot (JSON, optionally gzip-compressed)
        #[arg(short, long)]
        reference: PathBuf,
        /// Filter id
        #[arg(short, long)]
        filter: usize,
        /// Raw operand value (decimal or 0x-prefixed hex)
        #[arg(long, value_parser = parse_u16)]
        value: u16,
    },

    /// Print the source version of the cached WebKit framework
    Webkit {
        #[command(flatten)]
        cache: CacheArgs,
    },

    /// List available cache architectures
    Arches {
        /// Path to the dyld shared cache directory.
        /// If not specified, searches default system locations.
        path: Option<PathBuf>,
    },
}

/// Information about a discovered cache file.
#[derive(Debug, Clone)]
struct CacheInfo {
    /// Path to the cache file
    path: PathBuf,
    /// Architecture string (e.g., "arm64e")
    arch: String,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Filters {
            cache,
            tables,
            pretty,
        } => {
            let filters = extract_table(&cache, &tables, Table::Filter, |image, options| {
                extract_filters(image, options)
            })?;
            print_json(&filters, pretty)?;
        }
        Commands::Modifiers {
            cache,
            tables,
            pretty,
        } => {
            let modifiers = extract_table(&cache, &tables, Table::Modifier, |image, options| {
                extract_modifiers(image, options)
            })?;
            print_json(&modifiers, pretty)?;
        }
        Commands::Operations {
            cache,
            tables,
            pretty,
        } => {
            let operations = extract_table(&cache, &tables, Table::Operation, |image, options| {
                extract_operations(image, options)
            })?;
            print_json(&operations, pretty)?;
        }
        Commands::Dump {
            cache,
            tables,
            output,
            gzip,
            pretty,
        } => cmd_dump(&cache, &tables, output, gzip, pretty)?,
        Commands::Diff {
            cache,
            tables,
            reference,
            json,
        } => return cmd_diff(&cache, &tables, &reference, json),
        Commands::Decode {
            reference,
            filter,
            value,
        } => cmd_decode(&reference, filter, value)?,
        Commands::Webkit { cache } => cmd_webkit(&cache)?,
        Commands::Arches { path } => cmd_arches(path)?,
    }

    Ok(ExitCode::SUCCESS)
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid operand value '{s}': {e}"))
}

/// Finds the default dyld cache directory by checking known locations.
fn find_default_cache_dir() -> Result<PathBuf> {
    for path_str in DEFAULT_CACHE_PATHS {
        let path = Path::new(path_str);
        if path.is_dir() && discover_caches(path).is_ok_and(|c| !c.is_empty()) {
            return Ok(path.to_path_buf());
        }
    }

    bail!(
        "No dyld shared cache found in default locations:\n  {}",
        DEFAULT_CACHE_PATHS.join("\n  ")
    );
}

/// Gets the cache path, using defaults if not specified.
fn get_cache_path(cache: Option<PathBuf>) -> Result<PathBuf> {
    match cache {
        Some(path) => Ok(path),
        None => find_default_cache_dir(),
    }
}

/// Discovers all main dyld shared cache files in a directory.
fn discover_caches(dir: &Path) -> Result<Vec<CacheInfo>> {
    if !dir.is_dir() {
        bail!("Path is not a directory: {}", dir.display());
    }

    let mut caches = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        // Subcaches and the symbols file carry an extension.
        let Some(arch) = name.strip_prefix("dyld_shared_cache_") else {
            continue;
        };
        if arch.contains('.') {
            continue;
        }

        caches.push(CacheInfo {
            arch: arch.to_string(),
            path,
        });
    }

    caches.sort_by(|a, b| a.arch.cmp(&b.arch));
    Ok(caches)
}

/// Resolves a cache path with optional architecture filter.
///
/// If path is a file, returns it directly.
/// If path is a directory, discovers caches and filters by arch.
fn resolve_cache_path(path: &Path, arch: Option<&str>) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }

    if !path.is_dir() {
        bail!("Cache path does not exist: {}", path.display());
    }

    let caches = discover_caches(path)?;
    if caches.is_empty() {
        bail!("No dyld shared caches found in: {}", path.display());
    }

    let matching: Vec<_> = match arch {
        Some(arch_filter) => caches
            .iter()
            .filter(|c| c.arch.contains(arch_filter))
            .collect(),
        None => caches.iter().collect(),
    };

    match matching.as_slice() {
        [] => {
            let available: Vec<_> = caches.iter().map(|c| c.arch.as_str()).collect();
            bail!(
                "No cache matches architecture '{}'. Available: {}",
                arch.unwrap_or(""),
                available.join(", ")
            );
        }
        [only] => Ok(only.path.clone()),
        _ => {
            let available: Vec<_> = matching.iter().map(|c| c.arch.as_str()).collect();
            bail!(
                "Multiple caches match. Please specify --arch. Available: {}",
                available.join(", ")
            );
        }
    }
}

fn open_cache(args: &CacheArgs) -> Result<DyldContext> {
    let cache_path = get_cache_path(args.cache.clone())?;
    let resolved_path = resolve_cache_path(&cache_path, args.arch.as_deref())?;

    info!("Opening cache: {}", resolved_path.display());
    let cache = DyldContext::open(&resolved_path)
        .with_context(|| format!("Failed to open cache: {}", resolved_path.display()))?;

    debug!("{}", cache.header);
    info!(
        "{} images, {} subcaches, {:.2} MB",
        cache.image_count(),
        cache.subcaches.len(),
        cache.total_size() as f64 / 1024.0 / 1024.0
    );
    Ok(cache)
}

/// Runs `work` behind a spinner labelled with the cache's architecture.
fn with_spinner<T>(cache: &DyldContext, what: &str, work: impl FnOnce() -> T) -> Result<T> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message(format!("Walking {} ({})", what, cache.architecture()));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = work();
    spinner.finish_and_clear();
    Ok(result)
}

/// Opens the cache and extracts all three tables.
fn extract(args: &CacheArgs, tables: &TableArgs) -> Result<LibSandboxSnapshot> {
    let start = Instant::now();
    let cache = open_cache(args)?;

    let snapshot = with_spinner(&cache, "libsandbox tables", || {
        extract_from_cache(&cache, &tables.options())
    })?
    .context("Failed to extract libsandbox tables")?;

    info!(
        "Extracted {} operations, {} filters, {} modifiers in {:.2}s",
        snapshot.operations.len(),
        snapshot.filters.len(),
        snapshot.modifiers.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(snapshot)
}

/// Opens the cache and runs a single table pipeline, leaving the others untouched.
fn extract_table<T>(
    args: &CacheArgs,
    tables: &TableArgs,
    table: Table,
    pipeline: impl FnOnce(&CacheImage<'_>, &ExtractOptions) -> sbdump::Result<Vec<T>>,
) -> Result<Vec<T>> {
    let start = Instant::now();
    let cache = open_cache(args)?;
    let image = CacheImage::new(&cache, LIBSANDBOX_IMAGE)
        .with_context(|| format!("Failed to load {LIBSANDBOX_IMAGE}"))?;

    let rows = with_spinner(&cache, &format!("the {table} table"), || {
        pipeline(&image, &tables.options())
    })?
    .with_context(|| format!("Failed to extract the {table} table"))?;

    info!(
        "Extracted {} {} rows in {:.2}s",
        rows.len(),
        table,
        start.elapsed().as_secs_f64()
    );
    Ok(rows)
}

fn print_json<T: Serialize + ?Sized>(value: &T, pretty: bool) -> Result<()> {
    let mut out = BufWriter::new(io::stdout().lock());
    if pretty {
        serde_json::to_writer_pretty(&mut out, value)?;
    } else {
        serde_json::to_writer(&mut out, value)?;
    }
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

fn load_reference(path: &Path) -> Result<&'static LibSandboxSnapshot> {
    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read reference: {}", path.display()))?;
    reference::install(&bytes)
        .with_context(|| format!("Failed to load reference: {}", path.display()))
}

fn cmd_dump(
    args: &CacheArgs,
    tables: &TableArgs,
    output: Option<PathBuf>,
    gzip: bool,
    pretty: bool,
) -> Result<()> {
    let snapshot = extract(args, tables)?;

    match output {
        Some(path) => {
            let file = File::create(&path)
                .with_context(|| format!("Failed to create: {}", path.display()))?;
            let mut out = BufWriter::new(file);
            snapshot.write_to(&mut out, gzip, pretty)?;
            out.flush()?;
            info!("Wrote snapshot to {}", path.display());
        }
        None => {
            if gzip && io::IsTerminal::is_terminal(&io::stdout()) {
                bail!("Refusing to write gzip data to a terminal; use --output");
            }
            let mut out = BufWriter::new(io::stdout().lock());
            snapshot.write_to(&mut out, gzip, pretty)?;
            if !gzip {
                writeln!(out)?;
            }
            out.flush()?;
        }
    }

    Ok(())
}

fn cmd_diff(
    args: &CacheArgs,
    tables: &TableArgs,
    reference_path: &Path,
    json: bool,
) -> Result<ExitCode> {
    let reference = load_reference(reference_path)?;
    let extracted = extract(args, tables)?;
    let diff = SnapshotDiff::between(reference, &extracted);

    if json {
        print_json(&diff, true)?;
    } else {
        print!("{diff}");
    }

    if diff.is_empty() {
        info!("Tables match {}", reference_path.display());
        Ok(ExitCode::SUCCESS)
    } else {
        warn!("Tables differ from {}", reference_path.display());
        Ok(ExitCode::FAILURE)
    }
}

fn cmd_decode(reference_path: &Path, filter_id: usize, value: u16) -> Result<()> {
    let db = load_reference(reference_path)?;
    let filter = db.filter(filter_id)?;
    let operand = decode_operand(filter, value, &NoPool)
        .with_context(|| format!("Failed to decode {:#x} for filter {}", value, filter.name))?;

    println!("({} {})", filter.name, operand);
    Ok(())
}

fn cmd_webkit(args: &CacheArgs) -> Result<()> {
    let cache = open_cache(args)?;
    let version = webkit_version(&cache).context("Failed to read WebKit version")?;
    println!("WebKit Version: {version}");
    Ok(())
}

fn cmd_arches(path: Option<PathBuf>) -> Result<()> {
    let cache_path = get_cache_path(path)?;
    let caches = discover_caches(&cache_path)?;

    if caches.is_empty() {
        println!("No dyld shared caches found in: {}", cache_path.display());
        return Ok(());
    }

    println!("Available architectures in {}:", cache_path.display());
    for cache in &caches {
        println!("  {} - {}", cache.arch, cache.path.display());
    }

    Ok(())
}
