mod display;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use aeroschema_core::{ExtractionConfig, PatternScope, normalize_version};
use aeroschema_engine::{Consolidator, FactExtractor, HttpExtractor, StructuralExtractor};
use aeroschema_runtime::{RunCoordinator, RunSettings};
use aeroschema_store::{Backend, CatalogStore, WorkspaceRegistry};
use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "aeroschema")]
#[command(about = "Learn and identify structural patterns in airline XML messages")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Tenant whose catalog is used
    #[arg(long, global = true, env = "AEROSCHEMA_WORKSPACE", default_value = "default")]
    workspace: String,

    /// Directory holding one DuckDB file per workspace
    #[arg(long, global = true, env = "AEROSCHEMA_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Extraction config (JSON); built-in defaults when omitted
    #[arg(long, global = true, env = "AEROSCHEMA_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Learn patterns from a document
    Discover(RunArgs),

    /// Match a document against the learned catalog
    Identify(RunArgs),

    /// Inspect or maintain the pattern catalog
    #[command(subcommand)]
    Patterns(PatternCommands),

    /// Inspect runs
    #[command(subcommand)]
    Runs(RunCommands),
}

#[derive(Args)]
struct RunArgs {
    /// XML document to process
    file: PathBuf,

    /// Parallel extraction workers
    #[arg(long, env = "AEROSCHEMA_WORKERS", default_value_t = RunSettings::DEFAULT_WORKERS)]
    workers: usize,

    /// Run deadline in seconds
    #[arg(long, default_value_t = RunSettings::DEFAULT_TIMEOUT.as_secs())]
    timeout_secs: u64,

    /// Remote fact extractor; structural extraction when omitted
    #[arg(long, env = "AEROSCHEMA_EXTRACTOR_URL")]
    extractor_url: Option<String>,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum PatternCommands {
    /// List patterns in the workspace
    List {
        /// Include deactivated patterns
        #[arg(long)]
        all: bool,

        /// Only this spec version
        #[arg(long)]
        spec_version: Option<String>,

        /// Only this message root
        #[arg(long)]
        message_root: Option<String>,

        /// Show decision rules
        #[arg(long)]
        verbose: bool,
    },

    /// Merge near-duplicate patterns within one version and message root
    Consolidate {
        #[arg(long)]
        spec_version: String,

        #[arg(long)]
        message_root: String,
    },
}

#[derive(Subcommand)]
enum RunCommands {
    /// List runs, newest first
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one run with its warnings, failures and gap report
    Show { run_id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let registry = WorkspaceRegistry::new(Backend::DuckDb {
        data_dir: cli.data_dir.clone(),
    });
    let store = registry
        .open(&cli.workspace)
        .with_context(|| format!("opening workspace {}", cli.workspace))?;

    match cli.command {
        Commands::Discover(args) => cmd_run(store, config, args, false).await,
        Commands::Identify(args) => cmd_run(store, config, args, true).await,
        Commands::Patterns(PatternCommands::List {
            all,
            spec_version,
            message_root,
            verbose,
        }) => cmd_patterns_list(
            store.as_ref(),
            all,
            spec_version.as_deref(),
            message_root.as_deref(),
            verbose,
        ),
        Commands::Patterns(PatternCommands::Consolidate {
            spec_version,
            message_root,
        }) => cmd_consolidate(store, &config, &cli.workspace, &spec_version, &message_root),
        Commands::Runs(RunCommands::List { limit }) => cmd_runs_list(store.as_ref(), limit),
        Commands::Runs(RunCommands::Show { run_id }) => cmd_runs_show(store.as_ref(), run_id),
    }
}

fn load_config(path: Option<&Path>) -> Result<Arc<ExtractionConfig>> {
    let config = match path {
        Some(path) => ExtractionConfig::from_path(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ExtractionConfig::default(),
    };
    if config.profiles.is_empty() {
        tracing::warn!("no extraction profiles configured; runs will find no target sections");
    }
    Ok(Arc::new(config))
}

fn version_arg(raw: &str) -> Result<String> {
    match normalize_version(raw) {
        Some(v) => Ok(v),
        None => bail!("unrecognised spec version {raw:?}"),
    }
}

// ── Commands ──

async fn cmd_run(
    store: Arc<dyn CatalogStore>,
    config: Arc<ExtractionConfig>,
    args: RunArgs,
    identify: bool,
) -> Result<()> {
    let file = File::open(&args.file)
        .with_context(|| format!("opening {}", args.file.display()))?;
    let extractor: Arc<dyn FactExtractor> = match &args.extractor_url {
        Some(url) => Arc::new(HttpExtractor::new(url.as_str())),
        None => Arc::new(StructuralExtractor::new()),
    };
    let settings = RunSettings {
        workers: args.workers,
        run_timeout: Duration::from_secs(args.timeout_secs),
        queue_depth: None,
    };
    let coordinator = RunCoordinator::new(Arc::clone(&store), config, extractor).with_settings(settings);

    let source = BufReader::new(file);
    let summary = if identify {
        coordinator.identify(source).await?
    } else {
        coordinator.discover(source).await?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        let run = store.get_run(summary.run_id)?;
        display::print_run_card(&run, Some(&summary));
    }
    Ok(())
}

fn cmd_patterns_list(
    store: &dyn CatalogStore,
    all: bool,
    spec_version: Option<&str>,
    message_root: Option<&str>,
    verbose: bool,
) -> Result<()> {
    let spec_version = spec_version.map(version_arg).transpose()?;
    let patterns: Vec<_> = store
        .list_patterns(all)?
        .into_iter()
        .filter(|p| spec_version.as_deref().is_none_or(|v| p.spec_version == v))
        .filter(|p| message_root.is_none_or(|r| p.message_root == r))
        .collect();
    display::print_pattern_table(&patterns);
    if verbose {
        for p in &patterns {
            display::print_pattern_card(p)?;
        }
    }
    Ok(())
}

fn cmd_consolidate(
    store: Arc<dyn CatalogStore>,
    config: &ExtractionConfig,
    workspace: &str,
    spec_version: &str,
    message_root: &str,
) -> Result<()> {
    let spec_version = version_arg(spec_version)?;
    let scope = PatternScope::new(workspace, &spec_version, message_root);
    let consolidator = Consolidator::new(store, config.synonyms_for(&spec_version));
    let outcomes = consolidator.consolidate(&scope)?;
    display::print_merge_outcomes(&scope, &outcomes);
    Ok(())
}

fn cmd_runs_list(store: &dyn CatalogStore, limit: usize) -> Result<()> {
    let runs = store.list_runs()?;
    display::print_run_table(&runs[..runs.len().min(limit)]);
    Ok(())
}

fn cmd_runs_show(store: &dyn CatalogStore, run_id: Uuid) -> Result<()> {
    let run = store
        .get_run(run_id)
        .with_context(|| format!("run {run_id}"))?;
    display::print_run_card(&run, None);
    Ok(())
}
