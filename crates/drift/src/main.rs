//! `drift`: push, pull and inspect content-addressed file streams.
//!
//! # Usage
//!
//! ```text
//! drift push ./build                         # push ./build as a tree
//! drift push big.iso -r /mnt/shared/repo     # push one file to a directory repository
//! drift pull <stream-id> ./restored.iso      # fetch and reassemble a stream
//! drift deploy <tree-id> ./release           # recreate a pushed directory
//! drift status ./build                       # what a push would still transfer
//! drift ls                                   # streams committed locally
//! drift gc                                   # reclaim unreferenced chunks
//! ```

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use drift_repo::{FileRepository, HttpRepository, Repository};
use drift_store::ContentStore;
use drift_sync::{CancelToken, StatusReport, SyncEngine, SyncFailure, SyncReport, TreeReport};
use drift_types::{StorageBackend, StreamId, TreeId};
use tracing::{info, warn};

use config::{CliConfig, RepositoryKind};

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "drift",
    version,
    about = "Content-addressed file sync against a remote repository"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true, env = "DRIFT_CONFIG")]
    config: Option<PathBuf>,

    /// Override the local store directory.
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Override the repository: a directory or an `http(s)://` URL.
    #[arg(short, long, global = true, env = "DRIFT_REPOSITORY")]
    repository: Option<String>,

    /// Override the number of concurrent chunk transfers.
    #[arg(short = 'j', long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push a file, or a directory as a tree.
    Push {
        /// File or directory to push.
        path: PathBuf,
    },

    /// Pull a stream and write it to a file.
    Pull {
        /// Stream ID (64 hex characters).
        stream_id: StreamId,
        /// Destination file.
        dest: PathBuf,
    },

    /// Recreate a pushed directory tree.
    Deploy {
        /// Tree ID (64 hex characters).
        tree_id: TreeId,
        /// Destination directory.
        dest: PathBuf,
    },

    /// Compare a file or directory against the local store and repository.
    Status {
        /// File or directory to inspect.
        path: PathBuf,

        /// List every chunk the repository is missing.
        #[arg(short, long)]
        verbose: bool,
    },

    /// List streams committed in the local store.
    Ls,

    /// Reclaim chunks no local stream references.
    Gc,
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    // CLI args override config file values.
    if let Some(dir) = cli.store {
        config.store.path = dir;
    }
    if let Some(target) = cli.repository.as_deref() {
        config.set_repository(target);
    }
    if let Some(n) = cli.concurrency {
        config.sync.concurrency = Some(n);
    }

    setup_tracing(&config.log.level);

    let ok = match cli.command {
        Commands::Push { path } => cmd_push(&config, &path).await?,
        Commands::Pull { stream_id, dest } => cmd_pull(&config, stream_id, &dest).await?,
        Commands::Deploy { tree_id, dest } => cmd_deploy(&config, tree_id, &dest).await?,
        Commands::Status { path, verbose } => cmd_status(&config, &path, verbose).await?,
        Commands::Ls => cmd_ls(&config)?,
        Commands::Gc => cmd_gc(&config).await?,
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Initialize the `tracing` subscriber with the given level filter.
///
/// Respects `RUST_LOG` env var if set, otherwise uses the config value.
/// Logs go to stderr so stdout stays machine-readable.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// -----------------------------------------------------------------------
// Wiring
// -----------------------------------------------------------------------

fn open_store(config: &CliConfig) -> Result<Arc<ContentStore>> {
    let store = match config.store.backend {
        StorageBackend::Memory => {
            info!("using in-memory content store");
            ContentStore::in_memory()
        }
        StorageBackend::File => {
            let path = &config.store.path;
            info!(path = %path.display(), "using file content store");
            ContentStore::open(path)
                .with_context(|| format!("failed to open store at {}", path.display()))?
        }
    };
    Ok(Arc::new(store))
}

fn open_repository(config: &CliConfig) -> Result<Arc<dyn Repository>> {
    match config.repository.kind {
        RepositoryKind::File => {
            let Some(path) = config.repository.path.as_deref() else {
                bail!("no repository configured: set [repository] path or pass --repository");
            };
            info!(path = %path.display(), "using file repository");
            let repo = FileRepository::new(path)
                .with_context(|| format!("failed to open repository at {}", path.display()))?;
            Ok(Arc::new(repo))
        }
        RepositoryKind::Http => {
            let Some(url) = config.repository.url.as_deref() else {
                bail!("no repository URL configured: set [repository] url or pass --repository");
            };
            info!(%url, "using http repository");
            let repo = HttpRepository::with_timeout(url, config.http_timeout())
                .with_context(|| format!("invalid repository URL {url}"))?;
            Ok(Arc::new(repo))
        }
    }
}

fn engine(config: &CliConfig) -> Result<SyncEngine> {
    Ok(SyncEngine::new(
        open_store(config)?,
        open_repository(config)?,
        config.sync_config(),
    ))
}

/// A token cancelled on Ctrl-C.
fn interrupt_token() -> CancelToken {
    let token = CancelToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping transfers");
            on_signal.cancel();
        }
    });
    token
}

// -----------------------------------------------------------------------
// Output
// -----------------------------------------------------------------------

fn print_report(report: &SyncReport) {
    let id = report
        .stream_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".into());
    let path = report
        .path
        .as_deref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "-".into());
    println!(
        "{id} {path} transferred={} skipped={}",
        report.transferred, report.skipped
    );
}

/// The stream ID if the run got that far, otherwise the path.
fn failure_identifier(failure: &SyncFailure) -> String {
    match (failure.report.stream_id, failure.report.path.as_deref()) {
        (Some(id), Some(path)) => format!("{id} ({})", path.display()),
        (Some(id), None) => id.to_string(),
        (None, Some(path)) => path.display().to_string(),
        (None, None) => "-".into(),
    }
}

/// One line per failure: `failed: <identifier>: <error>`.
fn failure_line(failure: &SyncFailure) -> String {
    format!("failed: {}: {}", failure_identifier(failure), failure.error)
}

fn print_failure(failure: &SyncFailure) {
    eprintln!("{}", failure_line(failure));
}

/// Per-file lines, then `tree <tree-id> <root>` once the tree is complete.
fn print_tree(report: &TreeReport) -> bool {
    for result in &report.files {
        match result {
            Ok(file) => print_report(file),
            Err(failure) => print_failure(failure),
        }
    }
    match report.tree_id {
        Some(id) if report.complete => {
            println!("tree {id} {}", report.root.display());
            true
        }
        _ => false,
    }
}

fn print_status(report: &StatusReport, verbose: bool) {
    let state = |committed: bool| if committed { "committed" } else { "absent" };
    println!(
        "{} {} chunks={} missing_remote={} local={} remote={}",
        report.stream_id,
        report.path.display(),
        report.chunks,
        report.missing_remote.len(),
        state(report.local_committed),
        state(report.remote_committed),
    );
    if verbose {
        for hash in &report.missing_remote {
            println!("  missing {hash}");
        }
    }
}

// -----------------------------------------------------------------------
// Commands
// -----------------------------------------------------------------------

async fn cmd_push(config: &CliConfig, path: &Path) -> Result<bool> {
    let engine = engine(config)?;
    let cancel = interrupt_token();

    if tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir()) {
        return match engine.push_tree(path, &cancel).await {
            Ok(report) => Ok(print_tree(&report)),
            Err(error) => {
                eprintln!("failed: {}: {error}", path.display());
                Ok(false)
            }
        };
    }

    let results = engine
        .push_path(path, &cancel)
        .await
        .with_context(|| format!("cannot push {}", path.display()))?;

    let mut ok = true;
    for result in &results {
        match result {
            Ok(report) => print_report(report),
            Err(failure) => {
                print_failure(failure);
                ok = false;
            }
        }
    }
    Ok(ok)
}

async fn cmd_pull(config: &CliConfig, id: StreamId, dest: &Path) -> Result<bool> {
    let engine = engine(config)?;
    let cancel = interrupt_token();

    match engine.pull_to(id, dest, &cancel).await {
        Ok(report) => {
            print_report(&report);
            Ok(true)
        }
        Err(failure) => {
            print_failure(&failure);
            Ok(false)
        }
    }
}

async fn cmd_deploy(config: &CliConfig, id: TreeId, dest: &Path) -> Result<bool> {
    let engine = engine(config)?;
    let cancel = interrupt_token();

    match engine.pull_tree(id, dest, &cancel).await {
        Ok(report) => Ok(print_tree(&report)),
        Err(error) => {
            eprintln!("failed: {id}: {error}");
            Ok(false)
        }
    }
}

async fn cmd_status(config: &CliConfig, path: &Path, verbose: bool) -> Result<bool> {
    let engine = engine(config)?;
    let reports = engine
        .status_path(path)
        .await
        .with_context(|| format!("cannot inspect {}", path.display()))?;
    for report in &reports {
        print_status(report, verbose);
    }
    Ok(true)
}

fn cmd_ls(config: &CliConfig) -> Result<bool> {
    let store = open_store(config)?;
    for id in store.list_streams()? {
        let stream = store.get_stream(&id)?;
        println!(
            "{id} {} {}",
            stream.meta.size,
            stream.meta.path.as_deref().unwrap_or("-")
        );
    }
    Ok(true)
}

async fn cmd_gc(config: &CliConfig) -> Result<bool> {
    let store = open_store(config)?;
    let reclaimed = store.gc().await?;
    println!("reclaimed {reclaimed} chunks");
    Ok(true)
}
