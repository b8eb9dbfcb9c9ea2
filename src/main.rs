use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod config;
mod db;
mod folder;
mod listing;
mod session;
mod tree;
mod util;

#[cfg(test)]
mod testing;

use folder::{JournalFolder, SyncFolder};
use listing::DavListing;
use session::{ApplyReport, SelectiveSync};
use tree::{Address, ChildCount, Selection};

#[derive(Parser)]
#[command(
    name = "selsync",
    version,
    long_version = concat!(env!("CARGO_PKG_VERSION"), " (built ", env!("BUILD_DATE"), ")"),
    about = "Choose which remote folders a WebDAV sync folder keeps in sync"
)]
struct Cli {
    /// Path to config file [default: ~/.config/selsync/config.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configured folders and their selective sync state
    Folders,
    /// List a folder's remote sub-folders with their selection
    Tree {
        /// Folder alias from the config
        alias: String,
        /// Start below this relative path
        #[arg(long, default_value = "")]
        path: String,
        /// Levels to list
        #[arg(short, long, default_value_t = 1)]
        depth: usize,
    },
    /// Exclude or include remote sub-folders and apply the result
    Select {
        /// Folder alias from the config
        alias: String,
        /// Relative path to stop syncing (repeatable)
        #[arg(short, long)]
        exclude: Vec<String>,
        /// Relative path to sync again (repeatable)
        #[arg(short, long)]
        include: Vec<String>,
        /// Show the resulting blacklist without applying it
        #[arg(long)]
        dry_run: bool,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "selsync=info",
        1 => "selsync=debug",
        2 => "selsync=trace",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(cli.config.as_deref())?;
    let pool = db::init_db(cfg.general.journal_path.as_deref()).await?;

    match cli.command {
        Command::Folders => {
            print_folders(&pool, &cfg).await?;
        }
        Command::Tree { alias, path, depth } => {
            let root = folder_index(&cfg, &alias)?;
            let mut session = open_session(&pool, &cfg).await?;

            let start = session.expand_path(root, &path).await?;
            for failure in session.expand_to_depth(&start, depth).await {
                eprintln!("warning: {failure}");
            }
            let level = print_ancestors(&session, &start);
            print_subtree(&session, &start, level);
        }
        Command::Select {
            alias,
            exclude,
            include,
            dry_run,
            json,
        } => {
            let root = folder_index(&cfg, &alias)?;
            let mut session = open_session(&pool, &cfg).await?;

            let changes = exclude
                .iter()
                .map(|p| (p, Selection::Excluded))
                .chain(include.iter().map(|p| (p, Selection::Included)));
            for (path, state) in changes {
                let address = session.expand_path(root, path).await?;
                session
                    .toggle(&address, state)
                    .with_context(|| format!("Cannot select '{path}' in {alias}"))?;
            }
            for event in session.take_events() {
                tracing::trace!(?event, "tree event");
            }

            if !session.is_dirty() {
                println!("selection unchanged");
            } else if dry_run {
                print_preview(&session, json)?;
            } else {
                let report = session.apply_pending_changes().await;
                print_report(&report, json)?;
                let failed = report.folders.iter().filter(|f| f.error.is_some()).count();
                if failed > 0 {
                    pool.close().await;
                    anyhow::bail!("{failed} folder(s) could not be updated");
                }
            }
        }
    }

    pool.close().await;
    Ok(())
}

fn folder_index(cfg: &config::Config, alias: &str) -> Result<usize> {
    cfg.folders
        .iter()
        .position(|f| f.alias == alias)
        .with_context(|| format!("No folder with alias '{alias}' in config"))
}

async fn open_session(pool: &sqlx::SqlitePool, cfg: &config::Config) -> Result<SelectiveSync> {
    let mut folders: Vec<Arc<dyn SyncFolder>> = Vec::with_capacity(cfg.folders.len());
    for f in &cfg.folders {
        let url = cfg.account.folder_url(&f.remote_path);
        folders.push(Arc::new(JournalFolder::open(pool.clone(), &f.alias, url).await?));
    }
    let listing = Arc::new(DavListing::new(&cfg.account, &cfg.general)?);
    Ok(SelectiveSync::new(folders, listing))
}

async fn print_folders(pool: &sqlx::SqlitePool, cfg: &config::Config) -> Result<()> {
    println!("selsync folders");
    println!("===============");

    if cfg.folders.is_empty() {
        println!("No folders configured.");
        return Ok(());
    }

    for (i, f) in cfg.folders.iter().enumerate() {
        let blacklist = folder::journal::load_blacklist(pool, &f.alias).await?;
        let avoided = folder::journal::avoided_paths(pool, &f.alias).await?;
        let state = folder::journal::get_state(pool, &f.alias).await?;

        println!();
        println!(
            "Folder #{i}: {} -> {}",
            f.local_path.display(),
            cfg.account.folder_url(&f.remote_path)
        );
        println!("  Alias: {}", f.alias);
        if blacklist.is_empty() {
            println!("  Excluded: nothing");
        } else {
            println!("  Excluded:");
            for entry in &blacklist {
                println!("    {entry}");
            }
        }
        if !avoided.is_empty() {
            println!("  Pending re-discovery: {}", avoided.join(", "));
        }
        if state.sync_running {
            println!("  Sync running");
        }
        match state.resync_requested_at {
            Some(ts) => println!("  Resync requested: {ts}"),
            None => println!("  Resync requested: never"),
        }
        if let Some(ts) = state.last_aborted_at {
            println!("  Last aborted: {ts}");
        }
    }
    Ok(())
}

/// Print the path from the root down to `address`, excluding it. Returns
/// the indentation level for the node itself.
fn print_ancestors(session: &SelectiveSync, address: &Address) -> usize {
    let mut trail = Vec::new();
    let mut cursor = session.tree().parent_of(address);
    while let Some(node) = cursor {
        trail.push(format!("{} {}", node.selection().marker(), node.name()));
        cursor = session.tree().parent_of(node.address());
    }
    for (level, line) in trail.iter().rev().enumerate() {
        println!("{:indent$}{line}", "", indent = level * 2);
    }
    trail.len()
}

fn print_subtree(session: &SelectiveSync, address: &Address, level: usize) {
    let Some(node) = session.tree().node(address) else {
        return;
    };
    let size = match node.remote_size() {
        0 => String::new(),
        n => format!("  ({})", format_size(n)),
    };
    // Unlisted folders may still have children.
    let more = if session.can_expand(address) { " ..." } else { "" };
    println!(
        "{:indent$}{} {}{size}{more}",
        "",
        node.selection().marker(),
        node.name(),
        indent = level * 2
    );

    if let Ok(ChildCount::Known(count)) = session.child_count(address) {
        for i in 0..count {
            if let Some(child) = session.child_at(address, i) {
                print_subtree(session, child.address(), level + 1);
            }
        }
    }
}

fn print_preview(session: &SelectiveSync, json: bool) -> Result<()> {
    let preview = session.preview();
    if json {
        let value: Vec<_> = preview
            .iter()
            .map(|(folder, r)| serde_json::json!({ "folder": folder, "reconciliation": r }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    for (folder, r) in &preview {
        println!("{folder} (dry run)");
        print_entries("blacklist", &r.blacklist);
        print_entries("changed", r.changed.iter());
    }
    Ok(())
}

fn print_report(report: &ApplyReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    for outcome in &report.folders {
        match outcome.error {
            Some(ref e) => println!("{}: failed: {e}", outcome.folder),
            None if outcome.changed.is_empty() => println!("{}: unchanged", outcome.folder),
            None => println!(
                "{}: {} path(s) changed{}",
                outcome.folder,
                outcome.changed.len(),
                if outcome.aborted_sync {
                    ", running sync aborted"
                } else {
                    ""
                }
            ),
        }
        print_entries("blacklist", &outcome.blacklist);
    }
    Ok(())
}

fn print_entries<'a>(label: &str, entries: impl IntoIterator<Item = &'a String>) {
    let entries: Vec<&str> = entries.into_iter().map(String::as_str).collect();
    if entries.is_empty() {
        println!("  {label}: (none)");
    } else {
        println!("  {label}: {}", entries.join(", "));
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
