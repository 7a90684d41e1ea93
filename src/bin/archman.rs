//! # archman CLI - Write-protected archives from the command line
//!
//! A thin command-line front end for the archman library. Every command
//! locates the archive from the path it is given, so commands work from
//! anywhere inside an archive.
//!
//! ## Usage
//! ```bash
//! # Create an archive
//! archman new ~/archive
//!
//! # Add a file and a directory
//! archman add notes.txt ~/archive/notes.txt
//! archman add --recursive photos ~/archive/photos
//!
//! # Show the archive tree
//! archman list --recursive ~/archive
//!
//! # Collapse duplicate photos into hard links
//! archman dedup --hardlink ~/archive/photos
//!
//! # Look for bit rot and interrupted operations
//! archman check ~/archive
//! ```

use anyhow::Context;
use archman::types::Listing;
use archman::{utils, ArchiveBackend, ArchiveConfig, ArchiveError, ArchiveKind};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// archman CLI - write-protected archives with integrity tracking
#[derive(Parser)]
#[command(name = "archman")]
#[command(version)]
#[command(about = "Manage write-protected archives whose content is tracked by an index")]
#[command(long_about = None)]
struct Cli {
    /// JSON file holding an archive configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Archive implementation (overrides the configuration file)
    #[arg(long, value_enum, global = true)]
    backend: Option<BackendMode>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (overrides --verbose and RUST_LOG)
    #[arg(long, value_enum, global = true, ignore_case = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty archive
    New {
        /// Destination path
        dst: PathBuf,
    },

    /// Add a file or a directory to an archive
    Add {
        /// Source path
        src: PathBuf,

        /// Destination path
        dst: PathBuf,

        /// Needed when the operation is on a directory
        #[arg(short, long)]
        recursive: bool,
    },

    /// Delete a file or a directory from an archive
    #[command(alias = "rm")]
    Delete {
        /// Target path
        dst: PathBuf,

        /// Needed when the operation is on a directory
        #[arg(short, long)]
        recursive: bool,
    },

    /// Move or rename a file or a directory within the archive
    #[command(alias = "mv")]
    Move {
        /// Source path
        src: PathBuf,

        /// Destination path
        dst: PathBuf,

        /// Needed when the operation is on a directory
        #[arg(short, long)]
        recursive: bool,
    },

    /// Copy a file or a directory out of the archive
    Export {
        /// Source path
        src: PathBuf,

        /// Destination path
        dst: PathBuf,

        /// Needed when the operation is on a directory
        #[arg(short, long)]
        recursive: bool,
    },

    /// Change the content of a file
    Update {
        /// Source path
        src: PathBuf,

        /// Destination path
        dst: PathBuf,
    },

    /// Output the content of a directory
    #[command(alias = "ls")]
    List {
        /// Source path
        src: PathBuf,

        /// Recurse in sub directories
        #[arg(short, long)]
        recursive: bool,
    },

    /// Operations on files with equivalent content
    Dedup {
        /// Source path
        src: PathBuf,

        /// Turn all equivalent files into hard links instead of deleting them
        #[arg(long)]
        hardlink: bool,
    },

    /// Sanity check
    Check {
        /// Any path inside the archive
        src: PathBuf,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum BackendMode {
    Indexed,
    Reference,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let explicit = match (cli.log_level, cli.verbose) {
        (Some(level), _) => Some(level.as_str()),
        (None, true) => Some("debug"),
        (None, false) => None,
    };
    let filter = match explicit {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    // Run command
    if let Err(e) = run(cli) {
        let message = match e.downcast_ref::<ArchiveError>() {
            Some(err) => err.user_message(),
            None => format!("{:#}", e),
        };
        eprintln!("{}: {}", "Error".red().bold(), message);
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ArchiveConfig::default(),
    };
    match cli.backend {
        Some(BackendMode::Indexed) => config.kind = ArchiveKind::Indexed,
        Some(BackendMode::Reference) => config.kind = ArchiveKind::Reference,
        None => {}
    }

    match cli.command {
        Commands::New { dst } => cmd_new(config, &dst),
        Commands::Add { src, dst, recursive } => cmd_add(config, &src, &dst, recursive),
        Commands::Delete { dst, recursive } => cmd_delete(config, &dst, recursive),
        Commands::Move { src, dst, recursive } => cmd_move(config, &src, &dst, recursive),
        Commands::Export { src, dst, recursive } => cmd_export(config, &src, &dst, recursive),
        Commands::Update { src, dst } => cmd_update(config, &src, &dst),
        Commands::List { src, recursive } => cmd_list(config, &src, recursive),
        Commands::Dedup { src, hardlink } => cmd_dedup(config, &src, hardlink),
        Commands::Check { src } => cmd_check(config, &src),
    }
}

fn load_config(path: &Path) -> anyhow::Result<ArchiveConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading configuration {}", path.display()))?;
    let config = serde_json::from_str(&text)
        .with_context(|| format!("parsing configuration {}", path.display()))?;
    Ok(config)
}

/// Open the archive containing `path`
fn open(path: &Path, config: ArchiveConfig) -> archman::Result<Box<dyn ArchiveBackend>> {
    archman::open_archive(path, config)
}

/// `--recursive` must be given exactly when `path` is a directory
fn check_recursive(path: &Path, recursive: bool) -> archman::Result<()> {
    let is_dir = fs::symlink_metadata(path).map(|m| m.is_dir()).unwrap_or(false);
    match (is_dir, recursive) {
        (true, false) => Err(ArchiveError::NotAFile(path.to_path_buf())),
        (false, true) => Err(ArchiveError::NotADirectory(path.to_path_buf())),
        _ => Ok(()),
    }
}

/// Create an empty archive
fn cmd_new(config: ArchiveConfig, dst: &Path) -> anyhow::Result<()> {
    let archive = archman::create_archive(dst, config)?;
    println!("{} Created archive", "✓".green().bold());
    println!("  Root: {}", archive.root().display().to_string().cyan());
    Ok(())
}

/// Add a file or a directory, then commit
fn cmd_add(config: ArchiveConfig, src: &Path, dst: &Path, recursive: bool) -> anyhow::Result<()> {
    check_recursive(src, recursive)?;
    let mut archive = open(dst, config)?;

    let start = Instant::now();
    if recursive {
        archive.add_dir(src, dst)?;
    } else {
        archive.add_file(src, dst)?;
    }
    archive.commit()?;

    println!("{} Added {}", "✓".green().bold(), dst.display().to_string().cyan());
    println!("  Time: {}", format_duration(start.elapsed()).to_string().cyan());
    Ok(())
}

/// Delete a file or a directory, then commit
fn cmd_delete(config: ArchiveConfig, dst: &Path, recursive: bool) -> anyhow::Result<()> {
    check_recursive(dst, recursive)?;
    let mut archive = open(dst, config)?;
    if recursive {
        archive.delete_dir(dst)?;
    } else {
        archive.delete_file(dst)?;
    }
    archive.commit()?;

    println!("{} Deleted {}", "✓".green().bold(), dst.display().to_string().cyan());
    Ok(())
}

/// Move a file or a directory, then commit
fn cmd_move(config: ArchiveConfig, src: &Path, dst: &Path, recursive: bool) -> anyhow::Result<()> {
    check_recursive(src, recursive)?;
    let mut archive = open(src, config)?;
    if recursive {
        archive.move_dir(src, dst)?;
    } else {
        archive.move_file(src, dst)?;
    }
    archive.commit()?;

    println!(
        "{} Moved {} to {}",
        "✓".green().bold(),
        src.display().to_string().cyan(),
        dst.display().to_string().cyan()
    );
    Ok(())
}

/// Copy a file or a directory out of the archive
fn cmd_export(config: ArchiveConfig, src: &Path, dst: &Path, recursive: bool) -> anyhow::Result<()> {
    check_recursive(src, recursive)?;
    let archive = open(src, config)?;

    let start = Instant::now();
    if recursive {
        archive.export_dir(src, dst)?;
    } else {
        archive.export_file(src, dst)?;
    }

    println!("{} Exported to {}", "✓".green().bold(), dst.display().to_string().cyan());
    println!("  Time: {}", format_duration(start.elapsed()).to_string().cyan());
    Ok(())
}

/// Replace the content of an archived file, then commit
fn cmd_update(config: ArchiveConfig, src: &Path, dst: &Path) -> anyhow::Result<()> {
    let mut archive = open(dst, config)?;
    archive.update_file(src, dst)?;
    archive.commit()?;

    println!("{} Updated {}", "✓".green().bold(), dst.display().to_string().cyan());
    Ok(())
}

/// Print the content of a directory as a tree
fn cmd_list(config: ArchiveConfig, src: &Path, recursive: bool) -> anyhow::Result<()> {
    let archive = open(src, config)?;
    let path = utils::absolute_entry_path(src)?;
    utils::require_dir(&path)?;
    let listing = archive.list(&path, recursive)?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    println!("archive '{}':", archive.root().display());
    println!("{}/", name);
    for line in render_tree(&listing) {
        println!("{}", line);
    }
    Ok(())
}

/// Tree lines for `listing`, folders before files
fn render_tree(listing: &Listing) -> Vec<String> {
    let mut lines = Vec::new();
    render_level(listing, &mut Vec::new(), &mut lines);
    lines
}

fn render_level(listing: &Listing, parents_last: &mut Vec<bool>, lines: &mut Vec<String>) {
    let header: String = parents_last
        .iter()
        .map(|last| if *last { "  " } else { "│ " })
        .collect();

    let folder_count = listing.folders.len();
    let file_count = listing.files.len();

    for (i, folder) in listing.folders.iter().enumerate() {
        let last = file_count == 0 && i + 1 == folder_count;
        let mark = if last { "└─" } else { "├─" };
        lines.push(format!("{}{}{}/", header, mark, folder.name));

        parents_last.push(last);
        render_level(&folder.contents, parents_last, lines);
        parents_last.pop();
    }

    for (i, file) in listing.files.iter().enumerate() {
        let mark = if i + 1 == file_count { "└─" } else { "├─" };
        lines.push(format!("{}{}{}", header, mark, file.name));
    }
}

/// Collapse duplicate content, then commit
fn cmd_dedup(config: ArchiveConfig, src: &Path, hardlink: bool) -> anyhow::Result<()> {
    let mut archive = open(src, config)?;

    let start = Instant::now();
    let report = archive.dedup(src, hardlink)?;
    archive.commit()?;

    for (keep, dispose) in &report.pairs {
        println!(
            "  {} {} {}",
            keep.display().to_string().cyan(),
            (if hardlink { "<=" } else { "x" }).dimmed(),
            dispose.display()
        );
    }
    println!(
        "{} {} duplicates in {} files {}",
        "✓".green().bold(),
        report.duplicates(),
        report.files_scanned,
        if hardlink { "hard-linked" } else { "removed" }
    );
    println!("  Time: {}", format_duration(start.elapsed()).to_string().cyan());
    Ok(())
}

/// Audit the archive containing `src`
fn cmd_check(config: ArchiveConfig, src: &Path) -> anyhow::Result<()> {
    let archive = open(src, config)?;

    let start = Instant::now();
    let stats = archive.check()?;

    println!("{} Archive is consistent", "✓".green().bold());
    println!("  Root: {}", archive.root().display().to_string().cyan());
    println!("  Folders: {}", stats.folders);
    println!("  Files: {}", stats.files);
    println!("  Time: {}", format_duration(start.elapsed()).to_string().cyan());
    Ok(())
}
