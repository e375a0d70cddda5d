#![forbid(unsafe_code)]

mod shell;

use anyhow::{Context, Result, bail};
use pfs::{
    ByteDevice, DirEntry, FileByteDevice, Fs, FsConfig, JsonMetadataStore, MetadataStore,
    NodeKind, Usage, probe,
};
use serde::Serialize;
use std::env;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// ── Logging ─────────────────────────────────────────────────────────────────

const DEFAULT_LOG_FILTER: &str = "warn";

/// Install a stderr subscriber. `PACKFS_LOG` wins over `RUST_LOG`.
fn init_tracing() -> Result<()> {
    let filter = env::var("PACKFS_LOG")
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .try_init()
        .context("failed to initialize tracing subscriber")
}

// ── Arguments ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct CliOptions {
    image: PathBuf,
    metadata: Option<PathBuf>,
    config: FsConfig,
    json: bool,
}

fn parse_options(command: &str, mut args: impl Iterator<Item = String>) -> Result<CliOptions> {
    let mut image = None;
    let mut metadata = None;
    let mut config = FsConfig::default();
    let mut json = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--capacity" => {
                let Some(value) = args.next() else {
                    bail!("--capacity requires a byte count");
                };
                config.capacity = value
                    .parse()
                    .with_context(|| format!("invalid --capacity value {value:?}"))?;
            }
            "--metadata" => {
                let Some(value) = args.next() else {
                    bail!("--metadata requires a path");
                };
                metadata = Some(PathBuf::from(value));
            }
            "--no-sync" => config.sync_on_commit = false,
            "--json" if command == "inspect" => json = true,
            flag if flag.starts_with("--") => bail!("{command}: unknown option {flag}"),
            _ if image.is_none() => image = Some(PathBuf::from(arg)),
            _ => bail!("{command}: unexpected argument {arg:?}"),
        }
    }

    let Some(image) = image else {
        bail!("{command} requires an <image> argument");
    };
    Ok(CliOptions {
        image,
        metadata,
        config,
        json,
    })
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    init_tracing()?;

    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "shell" => shell_cmd(&parse_options(&command, args)?),
        "format" => format_cmd(&parse_options(&command, args)?),
        "inspect" => inspect_cmd(&parse_options(&command, args)?),
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("pfs-cli\n");
    println!("USAGE:");
    println!("  pfs-cli shell <image> [--capacity <bytes>] [--metadata <path>] [--no-sync]");
    println!("  pfs-cli format <image> [--capacity <bytes>] [--metadata <path>]");
    println!("  pfs-cli inspect <image> [--metadata <path>] [--json]");
    println!();
    println!("Logging is controlled by PACKFS_LOG or RUST_LOG (default: warn).");
}

fn metadata_store(options: &CliOptions) -> JsonMetadataStore {
    options
        .metadata
        .clone()
        .map_or_else(
            || JsonMetadataStore::for_image(&options.image),
            JsonMetadataStore::new,
        )
        .with_sync(options.config.sync_on_commit)
}

// ── Commands ────────────────────────────────────────────────────────────────

fn shell_cmd(options: &CliOptions) -> Result<()> {
    let mut fs = Fs::open_path(
        &options.image,
        options.metadata.clone(),
        options.config.clone(),
    )
    .with_context(|| format!("failed to open {}", options.image.display()))?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    shell::Shell::new(&mut fs, stdin.lock(), stdout.lock())
        .run()
        .context("shell I/O failed")
}

fn format_cmd(options: &CliOptions) -> Result<()> {
    let dev = FileByteDevice::open_or_create(&options.image, options.config.capacity)
        .with_context(|| format!("failed to open {}", options.image.display()))?;
    let fs = Fs::format(dev, metadata_store(options), options.config.clone())
        .with_context(|| format!("failed to format {}", options.image.display()))?;
    let usage = fs.usage();
    println!(
        "formatted {}: {} bytes, {} free",
        options.image.display(),
        usage.capacity,
        usage.free_bytes
    );
    Ok(())
}

#[derive(Debug, Serialize)]
struct InspectEntry {
    path: String,
    #[serde(flatten)]
    entry: DirEntry,
    extent: Option<pfs::Extent>,
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    format_version: u8,
    usage: Usage,
    entries: Vec<InspectEntry>,
}

fn inspect_cmd(options: &CliOptions) -> Result<()> {
    let dev = FileByteDevice::open(&options.image)
        .with_context(|| format!("failed to open {}", options.image.display()))?;
    let header = probe(&dev)
        .with_context(|| format!("{} is not a PackFS image", options.image.display()))?;
    let meta = metadata_store(options);
    let config = FsConfig {
        persist: false,
        sync_on_commit: false,
        ..options.config.clone()
    };
    let fs = Fs::open(dev, meta, config).context("failed to load metadata")?;
    fs.check().context("consistency check failed")?;

    let mut entries = Vec::new();
    collect_entries(&fs, "/", &mut entries)?;
    let output = InspectOutput {
        format_version: header.version,
        usage: fs.usage(),
        entries,
    };

    if options.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("PackFS Inspector");
        println!("format_version: {}", output.format_version);
        println!("capacity: {}", output.usage.capacity);
        println!("used: {}", output.usage.used_bytes);
        println!("free: {}", output.usage.free_bytes);
        println!("high_water_mark: {}", output.usage.high_water_mark);
        println!(
            "nodes: {} files, {} directories",
            output.usage.files, output.usage.directories
        );
        for entry in &output.entries {
            match (entry.entry.kind, entry.extent) {
                (NodeKind::Directory, _) => println!("  {}/", entry.path),
                (NodeKind::File, Some(extent)) => {
                    println!("  {} {} bytes at {extent}", entry.path, extent.len());
                }
                (NodeKind::File, None) => println!("  {} (empty)", entry.path),
            }
        }
    }
    Ok(())
}

/// Depth-first listing of every node below `dir`.
fn collect_entries<D: ByteDevice, M: MetadataStore>(
    fs: &Fs<D, M>,
    dir: &str,
    out: &mut Vec<InspectEntry>,
) -> Result<()> {
    for entry in fs.list(dir)? {
        let path = if dir == "/" {
            format!("/{}", entry.name)
        } else {
            format!("{dir}/{}", entry.name)
        };
        let extent = fs.stat(&path)?.extent;
        let is_dir = entry.kind == NodeKind::Directory;
        out.push(InspectEntry {
            path: path.clone(),
            entry,
            extent,
        });
        if is_dir {
            collect_entries(fs, &path, out)?;
        }
    }
    Ok(())
}
