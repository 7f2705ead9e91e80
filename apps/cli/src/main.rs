//! markerwatch CLI - keep a directory status index in sync with on-disk markers
//!
//! Usage:
//!   markerwatch init --root <path>   - Write the config file
//!   markerwatch watch                - Run the engine until Ctrl-C
//!   markerwatch scan                 - One bootstrap pass over the root
//!   markerwatch list [--json]        - Show the cached index
//!   markerwatch reconcile            - Prune records of deleted directories
//!   markerwatch set <name> <status>  - Force a directory's status
//!   markerwatch reset <name>         - Clear a directory's markers

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use markerwatch_core::{
    apply_reset, apply_status, load_all, reconcile_once, records_to_json,
    scanner::{ensure_root, snapshot, sort_newest_first},
    storage::DATE_FORMAT,
    Config, DirectoryRecord, Engine, IndexStore, Status,
};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// markerwatch - directory status index
#[derive(Parser)]
#[command(name = "markerwatch")]
#[command(about = "Keep a directory status index in sync with on-disk markers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file for a watched root
    Init {
        /// Directory whose children are tracked
        #[arg(short, long)]
        root: PathBuf,

        /// SQLite index file
        #[arg(short, long)]
        index: Option<PathBuf>,

        /// Seconds between orphan sweeps
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Run the engine until Ctrl-C
    Watch,

    /// Load every directory under the root into the index once
    Scan,

    /// Show tracked directories, newest first
    List {
        /// Print `{"data": [...]}` JSON instead of a table
        #[arg(long)]
        json: bool,

        /// Read markers from disk instead of the index
        #[arg(long)]
        live: bool,
    },

    /// Remove index records whose directory is gone
    Reconcile,

    /// Force a directory into a status (none, uploading, uploaded, dupe, failed)
    Set { name: String, status: Status },

    /// Remove every marker from a directory
    Reset { name: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    let config_path = cli.config.clone();
    match cli.command {
        Commands::Init {
            root,
            index,
            interval,
        } => cmd_init(config_path.as_deref(), root, index, interval),
        Commands::Watch => cmd_watch(&load_config(config_path.as_deref())?),
        Commands::Scan => cmd_scan(&load_config(config_path.as_deref())?),
        Commands::List { json, live } => cmd_list(&load_config(config_path.as_deref())?, json, live),
        Commands::Reconcile => cmd_reconcile(&load_config(config_path.as_deref())?),
        Commands::Set { name, status } => {
            cmd_set(&load_config(config_path.as_deref())?, &name, status)
        }
        Commands::Reset { name } => cmd_reset(&load_config(config_path.as_deref())?, &name),
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("markerwatch={}", log_level).parse()?)
                .add_directive(format!("markerwatch_core={}", log_level).parse()?),
        )
        .with_target(false)
        .init();
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.validate().context("Run 'markerwatch init --root <path>' first")?;
    debug!("[CLI] Root {}, index {}", config.root()?.display(), config.index_path.display());
    Ok(config)
}

fn open_store(config: &Config) -> Result<IndexStore> {
    IndexStore::open(&config.index_path)
}

// ============ INIT COMMAND ============

fn cmd_init(
    config_path: Option<&Path>,
    root: PathBuf,
    index: Option<PathBuf>,
    interval: Option<u64>,
) -> Result<()> {
    ensure_root(&root)?;

    let mut config = Config::with_root_path(root.canonicalize()?);
    if let Some(index) = index {
        config.index_path = index;
    }
    if let Some(interval) = interval {
        config.reconcile_interval_secs = interval;
    }
    config.validate()?;

    let path = match config_path {
        Some(path) => {
            config.save(path)?;
            path.to_path_buf()
        }
        None => config.save_default()?,
    };

    println!("{}", "✓ Config written".green());
    println!("Config:   {}", path.display());
    println!("Root:     {}", config.root()?.display());
    println!("Index:    {}", config.index_path.display());
    Ok(())
}

// ============ WATCH COMMAND ============

fn cmd_watch(config: &Config) -> Result<()> {
    println!("{}", "👀 markerwatch".bold().cyan());
    println!();

    let mut engine = Engine::start(config)?;
    println!("Root:     {}", engine.root().display());
    println!("Index:    {}", engine.store().path().display());
    println!("Tracked:  {}", engine.store().count()?.to_string().cyan());
    println!("Watching: {}", engine.registry().len().to_string().cyan());
    println!();
    println!("Press {} to stop.", "Ctrl-C".yellow());

    // Engine threads do the work; the runtime only waits for the signal.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async { tokio::signal::ctrl_c().await })?;

    println!();
    println!("Shutting down...");
    engine.shutdown();
    println!("{}", "Stopped.".green());
    Ok(())
}

// ============ SCAN COMMAND ============

fn cmd_scan(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let summary = load_all(config.root()?, &store)?;

    println!(
        "{} {} directories ({} new, {} updated, {} skipped)",
        "✓".green(),
        summary.loaded.len(),
        summary.inserted(),
        summary.updated(),
        summary.skipped
    );
    Ok(())
}

// ============ LIST COMMAND ============

fn cmd_list(config: &Config, json: bool, live: bool) -> Result<()> {
    let mut records = if live {
        snapshot(config.root()?)?
    } else {
        let store = open_store(config)?;
        if store.is_fresh() {
            warn!("[CLI] Index was just created; run 'markerwatch scan' to fill it");
        }
        store.list_all()?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&records_to_json(&records))?);
        return Ok(());
    }

    if records.is_empty() {
        println!("{}", "No directories tracked.".yellow());
        return Ok(());
    }

    sort_newest_first(&mut records);
    for record in &records {
        print_record(record);
    }
    println!();
    println!("Total: {}", records.len().to_string().cyan());
    Ok(())
}

fn print_record(record: &DirectoryRecord) {
    let status = match record.status {
        Status::None => record.status.as_str().normal(),
        Status::Uploading => record.status.as_str().yellow(),
        Status::Uploaded => record.status.as_str().green(),
        Status::Dupe => record.status.as_str().blue(),
        Status::Failed => record.status.as_str().red(),
    };
    println!(
        "{}  {:<9}  {}",
        record.creation_date.format(DATE_FORMAT).to_string().dimmed(),
        status,
        record.name
    );
}

// ============ RECONCILE COMMAND ============

fn cmd_reconcile(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let report = reconcile_once(config.root()?, &store)?;

    for name in &report.removed {
        println!("  - {}", name);
    }
    println!(
        "{} Checked {}, removed {}",
        "✓".green(),
        report.checked,
        report.removed.len()
    );
    Ok(())
}

// ============ SET / RESET COMMANDS ============

fn cmd_set(config: &Config, name: &str, status: Status) -> Result<()> {
    let store = open_store(config)?;
    apply_status(config.root()?, &store, name, status)?;
    println!("{} {} is now {}", "✓".green(), name, status.to_string().cyan());
    Ok(())
}

fn cmd_reset(config: &Config, name: &str) -> Result<()> {
    let store = open_store(config)?;
    apply_reset(config.root()?, &store, name)?;
    println!("{} {} reset", "✓".green(), name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use markerwatch_core::config::default_config_path;

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["markerwatch", "-v", "set", "ReleaseA", "uploaded"])
            .expect("parse");
        assert!(cli.verbose);
        match cli.command {
            Commands::Set { name, status } => {
                assert_eq!(name, "ReleaseA");
                assert_eq!(status, Status::Uploaded);
            }
            _ => panic!("expected set"),
        }

        assert!(Cli::try_parse_from(["markerwatch", "set", "A", "bogus"]).is_err());
    }

    #[test]
    fn test_default_config_path_name() {
        assert!(default_config_path().ends_with("markerwatch.toml"));
    }
}
