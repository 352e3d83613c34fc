//! # Docshelf CLI (`shelf`)
//!
//! The `shelf` binary drives the document pipeline: scanning folders into
//! the index, converting, summarizing, classifying, and inspecting the
//! result.
//!
//! ## Usage
//!
//! ```bash
//! shelf --config ./config/shelf.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `shelf init` | Create the SQLite index and run schema migrations |
//! | `shelf scan <paths>` | Fingerprint files and update the index |
//! | `shelf convert` | Convert indexed documents to markdown |
//! | `shelf summarize` | Write a brief for every converted document |
//! | `shelf classify` | Label documents and link them into the views |
//! | `shelf run <paths>` | Scan, then every stage in order |
//! | `shelf status` | Counts per stage, views, failures |
//! | `shelf export` | Dump the index as JSON |
//! | `shelf retry` | Give exhausted failures another chance |
//! | `shelf label <path>` | Override one axis label |
//! | `shelf views rebuild` | Recreate the symlink views from the index |
//!
//! ## Examples
//!
//! ```bash
//! # What would be picked up?
//! shelf scan ~/Documents --dry-run
//!
//! # Everything, end to end
//! shelf run ~/Documents
//!
//! # Conversions only, summaries later when the model host is up
//! shelf run ~/Documents --skip-summarize
//! ```

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use docshelf::config::{self, Config};
use docshelf::discover::absolute;
use docshelf::error::IndexError;
use docshelf::index;
use docshelf::models::Axis;
use docshelf::pipeline::{self, Pipeline, RunOptions};
use docshelf::progress::ProgressMode;
use docshelf::report::RunReport;
use docshelf::stages::classify;
use docshelf::store::SqliteIndexStore;
use docshelf::{db, export, migrate, status};

/// Docshelf: turn a pile of documents into an indexed, summarized and
/// classified shelf.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/shelf.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "shelf",
    about = "Docshelf: fingerprint, convert, summarize and classify a pile of documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/shelf.toml")]
    config: PathBuf,

    /// Print reports as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    /// Progress on stderr.
    #[arg(long, global = true, value_enum, default_value = "auto")]
    progress: ProgressMode,

    /// Debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the index schema.
    ///
    /// Idempotent: running it again is safe.
    Init,

    /// Discover documents under the given paths and update the index.
    ///
    /// New files are fingerprinted and recorded, byte-identical copies are
    /// grouped under one canonical document, and edited files lose their
    /// derived artifacts.
    Scan {
        /// Files or directories to scan.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// List what would be indexed, grouped by format. Writes nothing.
        #[arg(long)]
        dry_run: bool,

        /// Drop records whose files no longer exist.
        #[arg(long)]
        prune: bool,
    },

    /// Convert indexed documents to markdown.
    Convert,

    /// Write a brief for every converted document.
    Summarize,

    /// Label summarized documents on every axis and link them into the views.
    Classify,

    /// Scan, convert, summarize and classify in one go.
    Run {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        #[arg(long)]
        skip_summarize: bool,

        #[arg(long)]
        skip_classify: bool,

        #[arg(long)]
        prune: bool,
    },

    /// Show counts per stage, the classification views and failures.
    Status,

    /// Export the whole index as JSON.
    Export {
        /// Output file (default: stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Reset attempt counters of failed documents.
    Retry,

    /// Override one axis label of a classified document.
    Label {
        path: PathBuf,

        #[arg(long)]
        axis: Axis,

        #[arg(long)]
        category: String,
    },

    /// Manage the symlink views.
    Views {
        #[command(subcommand)]
        action: ViewsAction,
    },

    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ViewsAction {
    /// Recreate every link from the index and remove stale ones.
    Rebuild,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "warn,docshelf=debug,shelf=debug"
    } else {
        "warn,docshelf=info,shelf=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn open_store(cfg: &Config) -> Result<SqliteIndexStore> {
    let pool = db::connect(cfg).await?;
    migrate::run_migrations(&pool).await?;
    Ok(SqliteIndexStore::new(pool))
}

/// Ctrl-C sets the flag; workers finish the document in flight.
fn stop_flag() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing documents in flight");
            flag.store(true, Ordering::SeqCst);
        }
    });
    stop
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        print_json(report)
    } else {
        print!("{}", report.render_human());
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "shelf", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    let result = dispatch(cli, cfg).await;
    if let Err(err) = &result {
        if err
            .chain()
            .any(|cause| matches!(cause.downcast_ref::<IndexError>(), Some(IndexError::Corruption(_))))
        {
            tracing::error!("index is inconsistent; repair or delete it and rescan");
        }
    }
    result
}

async fn dispatch(cli: Cli, cfg: Config) -> Result<()> {
    let json = cli.json;

    match cli.command {
        Commands::Init => {
            open_store(&cfg).await?;
            println!("Index initialized at {}.", cfg.db.path.display());
        }
        Commands::Scan {
            paths,
            dry_run: true,
            ..
        } => {
            let preview = pipeline::preview(&cfg, &paths)?;
            if json {
                print_json(&preview)?;
            } else {
                print!("{}", preview.render_human());
            }
        }
        Commands::Scan { paths, prune, .. } => {
            let pipeline = open_pipeline(&cfg, cli.progress).await?;
            let mut report = RunReport::new("scan");
            pipeline.scan(&paths, prune, &mut report).await?;
            let report = pipeline.finish(report).await?;
            print_report(&report, json)?;
        }
        Commands::Convert => {
            let pipeline = open_pipeline(&cfg, cli.progress).await?;
            let mut report = RunReport::new("convert");
            pipeline.convert(&mut report).await?;
            print_report(&pipeline.finish(report).await?, json)?;
        }
        Commands::Summarize => {
            let pipeline = open_pipeline(&cfg, cli.progress).await?;
            let mut report = RunReport::new("summarize");
            pipeline.summarize(&mut report).await?;
            print_report(&pipeline.finish(report).await?, json)?;
        }
        Commands::Classify => {
            let pipeline = open_pipeline(&cfg, cli.progress).await?;
            let mut report = RunReport::new("classify");
            pipeline.classify(&mut report).await?;
            print_report(&pipeline.finish(report).await?, json)?;
        }
        Commands::Run {
            paths,
            skip_summarize,
            skip_classify,
            prune,
        } => {
            let pipeline = open_pipeline(&cfg, cli.progress).await?;
            let options = RunOptions {
                prune,
                summarize: !skip_summarize,
                classify: !skip_classify,
            };
            let report = pipeline.run(&paths, options).await?;
            print_report(&report, json)?;
        }
        Commands::Status => {
            let store = open_store(&cfg).await?;
            let status = status::build(&store, &cfg).await?;
            if json {
                print_json(&status)?;
            } else {
                print!("{}", status.render_human());
            }
        }
        Commands::Export { output } => {
            let store = open_store(&cfg).await?;
            export::run_export(&store, output.as_deref()).await?;
        }
        Commands::Retry => {
            let store = open_store(&cfg).await?;
            let reset = index::retry(&store).await?;
            if json {
                print_json(&serde_json::json!({ "reset": reset }))?;
            } else {
                println!("Reset {} failed document(s); the next stage run tries them again.", reset);
            }
        }
        Commands::Label {
            path,
            axis,
            category,
        } => {
            let pipeline = open_pipeline(&cfg, cli.progress).await?;
            let path = absolute(&path);
            let label = classify::set_label(
                pipeline.store(),
                pipeline.views(),
                &cfg.taxonomy,
                &path,
                axis,
                &category,
            )
            .await?;
            if json {
                print_json(&serde_json::json!({
                    "path": path,
                    "axis": axis,
                    "category": label.name(),
                }))?;
            } else {
                println!("{}: {} = {}", path.display(), axis, label);
            }
        }
        Commands::Views {
            action: ViewsAction::Rebuild,
        } => {
            let pipeline = open_pipeline(&cfg, cli.progress).await?;
            let summary = pipeline.rebuild_views().await?;
            if json {
                print_json(&summary)?;
            } else {
                println!(
                    "Views under {}: {} created, {} kept, {} removed.",
                    pipeline.views().root().display(),
                    summary.created,
                    summary.kept,
                    summary.removed
                );
            }
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}

async fn open_pipeline(cfg: &Config, progress: ProgressMode) -> Result<Pipeline> {
    let pipeline = Pipeline::open(cfg)
        .await
        .with_context(|| format!("Failed to open index at {}", cfg.db.path.display()))?;
    Ok(pipeline
        .with_progress(progress.reporter())
        .with_stop_flag(stop_flag()))
}
