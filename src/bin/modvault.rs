//! # Modvault CLI - Reversible package installs
//!
//! Command-line front end for the modvault library.
//!
//! ## Usage
//! ```bash
//! # See what is in the library and what is installed
//! modvault -l ./library -d ./game -b ./backups list
//!
//! # Preview, then install with a progress bar
//! modvault -l ./library -d ./game -b ./backups footprint "Better Textures"
//! modvault -l ./library -d ./game -b ./backups install "Better Textures" --progress
//!
//! # Undo it
//! modvault -l ./library -d ./game -b ./backups uninstall "Better Textures"
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use modvault::utils::format_bytes;
use modvault::{
    Identity, ItemDisposition, Location, LocationBuilder, ModvaultError, Package, PackageSide,
    PathCase, ProgressInfo, Result,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Modvault CLI - install packages into a shared tree and take them back out
#[derive(Parser)]
#[command(name = "modvault")]
#[command(version)]
#[command(about = "Reversible package installs with backups and overlap detection")]
#[command(long_about = None)]
struct Cli {
    /// Directory holding package folders and archives
    #[arg(short, long, global = true, default_value = "library")]
    library: PathBuf,

    /// Destination tree packages are installed into
    #[arg(short, long, global = true, default_value = ".")]
    destination: PathBuf,

    /// Directory holding backup stores
    #[arg(short, long, global = true, default_value = "backups")]
    backup: PathBuf,

    /// Backup mode: -1 for folders, 0 to store, 1-9 to deflate
    #[arg(short, long, global = true, default_value_t = 6, allow_negative_numbers = true)]
    zip_level: i32,

    /// Path comparison rule for overlaps
    #[arg(long, global = true, value_enum, default_value = "native")]
    case: CaseMode,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List packages
    #[command(alias = "ls")]
    List {
        /// Only installed packages
        #[arg(long)]
        installed: bool,
    },

    /// Show what installing a package would do
    #[command(alias = "fp")]
    Footprint {
        /// Package name or identity
        package: String,
    },

    /// Install a package
    #[command(alias = "i")]
    Install {
        /// Package name or identity
        package: String,

        /// Show progress
        #[arg(long)]
        progress: bool,
    },

    /// Uninstall a package, restoring what it overwrote
    #[command(alias = "rm")]
    Uninstall {
        /// Package name or identity
        package: String,

        /// Show progress
        #[arg(long)]
        progress: bool,
    },

    /// Forget a package's backup without restoring anything
    Discard {
        /// Package name or identity
        package: String,
    },

    /// Move every backup store to another directory
    Relocate {
        /// New backup directory
        directory: PathBuf,
    },

    /// Show package details
    Info {
        /// Package name or identity
        package: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum CaseMode {
    Native,
    Sensitive,
    Insensitive,
}

impl From<CaseMode> for PathCase {
    fn from(mode: CaseMode) -> Self {
        match mode {
            CaseMode::Native => PathCase::native(),
            CaseMode::Sensitive => PathCase::Sensitive,
            CaseMode::Insensitive => PathCase::Insensitive,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("modvault=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> Result<()> {
    let location = LocationBuilder::new()
        .zip_level(cli.zip_level)
        .case(cli.case.into())
        .build(cli.library, cli.destination, cli.backup)?;

    match cli.command {
        Commands::List { installed } => cmd_list(&location, installed),
        Commands::Footprint { package } => cmd_footprint(&location, &package),
        Commands::Install { package, progress } => cmd_install(&location, &package, progress),
        Commands::Uninstall { package, progress } => cmd_uninstall(&location, &package, progress),
        Commands::Discard { package } => cmd_discard(&location, &package),
        Commands::Relocate { directory } => cmd_relocate(&location, directory),
        Commands::Info { package, json } => cmd_info(&location, &package, json),
    }
}

fn resolve(location: &Location, query: &str) -> Result<Package> {
    location
        .find(query)
        .and_then(|id| location.get(id))
        .ok_or_else(|| ModvaultError::PackageNotFound(query.to_string()))
}

fn side_label(side: Option<PackageSide>) -> ColoredString {
    match side {
        Some(PackageSide::Both) => "installed".green(),
        Some(PackageSide::BackupOnly) => "installed (source missing)".yellow(),
        Some(PackageSide::SourceOnly) => "available".normal(),
        None => "invalid".red(),
    }
}

fn name_of(location: &Location, identity: Identity) -> String {
    location
        .get(identity)
        .map(|p| p.name().to_string())
        .unwrap_or_else(|| identity.to_string())
}

/// Build a progress callback backed by an indicatif bar
fn progress_bar(enabled: bool, verb: &str) -> (Option<ProgressBar>, impl FnMut(&ProgressInfo) -> bool) {
    let bar = enabled.then(|| {
        let pb = ProgressBar::new(0);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        pb.set_style(style);
        pb.set_message(verb.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    });
    let handle = bar.clone();
    let callback = move |info: &ProgressInfo| {
        if let Some(pb) = &handle {
            pb.set_length(info.total as u64);
            pb.set_position(info.processed as u64);
            if let Some(item) = &info.current_item {
                pb.set_message(item.display().to_string());
            }
        }
        true
    };
    (bar, callback)
}

/// List packages with their state, version and overlaps
fn cmd_list(location: &Location, installed_only: bool) -> Result<()> {
    let packages = if installed_only {
        location.installed()
    } else {
        location.packages()
    };

    if packages.is_empty() {
        println!("{}", "No packages found".yellow());
        return Ok(());
    }

    println!("{}", format!("Packages in {}", location.config().name).bold());
    for package in &packages {
        let version = package
            .version()
            .map(|v| format!(" v{}", v))
            .unwrap_or_default();
        println!(
            "  {} {}{} - {}",
            package.identity().to_string().dimmed(),
            package.core_name().cyan().bold(),
            version,
            side_label(package.side())
        );
        if let Some(overlaps) = package.overlaps().filter(|o| !o.is_empty()) {
            let names: Vec<_> = overlaps.iter().map(|id| name_of(location, *id)).collect();
            println!("      overwrites: {}", names.join(", ").yellow());
        }
    }
    println!("\n{} packages", packages.len());
    Ok(())
}

/// Preview an install
fn cmd_footprint(location: &Location, query: &str) -> Result<()> {
    let package = resolve(location, query)?;
    let footprint = package.footprint(&location.config().destination_path)?;

    println!("{} {}", "Footprint of".blue().bold(), package.name().yellow());
    for entry in footprint.iter() {
        let marker = match (entry.is_directory(), entry.disposition) {
            (_, ItemDisposition::CopyOverwrite) => "~".yellow(),
            (_, ItemDisposition::DeleteOnUninstall) => "+".green(),
            (true, ItemDisposition::None) => "=".dimmed(),
            (false, ItemDisposition::None) => "?".red(),
        };
        println!("  {} {}", marker, entry.path.display());
    }

    let overwrites = footprint
        .with_disposition(ItemDisposition::CopyOverwrite)
        .count();
    println!(
        "\n{} entries, {} overwritten",
        footprint.len(),
        overwrites.to_string().yellow()
    );

    let overlaps = location.overlapping(package.identity())?;
    if !overlaps.is_empty() {
        let names: Vec<_> = overlaps.iter().map(|id| name_of(location, *id)).collect();
        println!(
            "{} overwrites files of installed package(s): {}",
            "Warning:".yellow().bold(),
            names.join(", ")
        );
    }
    Ok(())
}

/// Install a package
fn cmd_install(location: &Location, query: &str, show_progress: bool) -> Result<()> {
    let package = resolve(location, query)?;
    if let Some(previous) = location.installed_predecessor(package.identity())? {
        println!(
            "{} upgrades installed {}",
            "Note:".blue().bold(),
            name_of(location, previous)
        );
    }
    let missing = location.missing_dependencies(package.identity())?;
    if !missing.is_empty() {
        println!("{} missing dependencies: {}", "Warning:".yellow().bold(), missing.join(", "));
    }

    println!("{} {}", "Installing".blue().bold(), package.name().yellow());
    let (bar, callback) = progress_bar(show_progress, "installing");
    let result = location.install(package.identity(), callback);
    if let Some(pb) = bar {
        pb.finish_and_clear();
    }
    let report = result?;

    println!("{} Installed {}", "✓".green().bold(), package.name().yellow().bold());
    println!("  Files: {}", report.files_installed.to_string().cyan());
    println!("  Backed up: {}", report.files_backed_up.to_string().cyan());
    println!("  Written: {}", format_bytes(report.bytes_written).cyan());
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(report.duration_ms)).to_string().cyan()
    );
    if !report.overlaps.is_empty() {
        let names: Vec<_> = report.overlaps.iter().map(|id| name_of(location, *id)).collect();
        println!("  {} {}", "Overwrote files of:".yellow(), names.join(", "));
    }
    Ok(())
}

/// Uninstall a package
fn cmd_uninstall(location: &Location, query: &str, show_progress: bool) -> Result<()> {
    let package = resolve(location, query)?;
    let dependents = location.dependents(package.identity())?;
    if !dependents.is_empty() {
        let names: Vec<_> = dependents.iter().map(|id| name_of(location, *id)).collect();
        println!("{} still needed by: {}", "Warning:".yellow().bold(), names.join(", "));
    }

    println!("{} {}", "Uninstalling".blue().bold(), package.name().yellow());
    let (bar, callback) = progress_bar(show_progress, "restoring");
    let result = location.uninstall(package.identity(), callback);
    if let Some(pb) = bar {
        pb.finish_and_clear();
    }
    let report = result?;

    println!("{} Uninstalled {}", "✓".green().bold(), package.name().yellow().bold());
    println!("  Restored: {}", report.files_restored.to_string().cyan());
    println!("  Deleted: {}", report.files_deleted.to_string().cyan());
    println!(
        "  Directories: {} removed, {} kept",
        report.directories_removed.to_string().cyan(),
        report.directories_kept.to_string().cyan()
    );
    Ok(())
}

/// Drop a backup without restoring
fn cmd_discard(location: &Location, query: &str) -> Result<()> {
    let package = resolve(location, query)?;
    location.discard_backup(package.identity())?;
    println!(
        "{} Discarded backup of {}; the destination was left as is",
        "✓".green().bold(),
        package.name().yellow()
    );
    Ok(())
}

/// Move backups
fn cmd_relocate(location: &Location, directory: PathBuf) -> Result<()> {
    println!(
        "{} {}",
        "Moving backups to".blue().bold(),
        directory.display().to_string().cyan()
    );
    let report = location.relocate_backups(&directory, |_| true)?;

    for failure in &report.failures {
        println!("  {} {}", "✗".red(), failure);
    }
    if report.failures.is_empty() {
        println!("{} Moved {} backups", "✓".green().bold(), report.moved.len());
    } else {
        println!(
            "{} backups stay in the old location",
            "Note:".yellow().bold()
        );
    }
    Ok(())
}

/// Show package details
fn cmd_info(location: &Location, query: &str, json: bool) -> Result<()> {
    let package = resolve(location, query)?;
    let identity = package.identity();
    let missing = location.missing_dependencies(identity)?;

    if json {
        let value = serde_json::json!({
            "identity": identity.to_string(),
            "name": package.name(),
            "core_name": package.core_name(),
            "version": package.version().map(|v| v.to_string()),
            "side": package.side(),
            "source": package.source().map(|s| s.root.clone()),
            "source_items": package.source().map(|s| s.items.len()),
            "backup": package.backup().map(|b| b.path.clone()),
            "backup_items": package.backup().map(|b| b.items.len()),
            "overlaps": package.overlaps(),
            "dependencies": package.dependencies(),
            "missing_dependencies": missing,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{}", "Package Information".bold());
    println!("  Identity: {}", identity.to_string().yellow());
    println!("  Name: {}", package.name().cyan());
    println!("  Core name: {}", package.core_name());
    if let Some(version) = package.version() {
        println!("  Version: {}", version);
    }
    println!("  State: {}", side_label(package.side()));

    if let Some(source) = package.source() {
        println!("\n{}", "Source".bold());
        println!("  Path: {}", source.root.display());
        println!(
            "  Entries: {} ({} files)",
            source.items.len(),
            source.items.file_count()
        );
    }
    if let Some(backup) = package.backup() {
        println!("\n{}", "Backup".bold());
        println!("  Path: {}", backup.path.display());
        println!("  Entries: {}", backup.items.len());
        println!(
            "  Preserved files: {}",
            backup.items.with_disposition(ItemDisposition::CopyOverwrite).count()
        );
        println!("  Size: {}", format_bytes(modvault::utils::disk_usage(&backup.path)));
    }

    if !package.dependencies().is_empty() {
        println!("\n{}", "Dependencies".bold());
        for dependency in package.dependencies() {
            let marker = if missing.contains(dependency) {
                "✗".red()
            } else {
                "✓".green()
            };
            println!("  {} {}", marker, dependency);
        }
    }
    Ok(())
}
