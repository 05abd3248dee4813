use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use ledgerlabel_core::{normalize_description, Fingerprint, Label};
use ledgerlabel_engine::{cancel_pair, CacheBackendKind, EngineConfig, Orchestrator, RunManifest};
use ledgerlabel_remote::{ClassificationError, ClassificationRequest, OpenAiClassifier, RemoteClassifier};
use ledgerlabel_storage::{
    CacheBackend, CacheEntry, ClassificationCache, JsonlBackend, MemoryBackend, SqliteBackend,
};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod csv_io;

#[derive(Parser)]
#[command(name = "ledgerlabel")]
#[command(about = "Categorize bank transactions with rules, fuzzy matching, a persistent cache and a remote model")]
#[command(version)]
struct Cli {
    /// Engine configuration (TOML); built-in defaults when omitted
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Cache location, overriding `[cache] path`
    #[arg(long, global = true, value_name = "PATH")]
    cache: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Label every transaction in a CSV file
    Classify {
        /// Input CSV with `account_id,date,description,amount` columns
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Labeled CSV output (defaults to stdout)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Write the run manifest as JSON
        #[arg(long, value_name = "FILE")]
        manifest: Option<PathBuf>,
    },
    /// Inspect or maintain the classification cache
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Entry counts by category and source
    Stats,
    /// Pin a description to a category, replacing any cached label
    Set {
        description: String,
        category: String,
        #[arg(long)]
        vendor: Option<String>,
    },
    /// Remove the cached label for a description
    Invalidate { description: String },
    /// Rewrite the persisted cache with only live entries
    Compact,
}

/// Stands in for the remote client when it could not be built, so the run
/// still labels what it can locally and reports the failure in its manifest.
struct Unavailable(ClassificationError);

#[async_trait]
impl RemoteClassifier for Unavailable {
    async fn classify(&self, _: &ClassificationRequest) -> Result<Label, ClassificationError> {
        Err(self.0.clone())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let cache = Arc::new(open_cache(&config, cli.cache.as_deref()).await?);

    match cli.command {
        Command::Classify {
            input,
            output,
            manifest,
        } => classify(&config, cache, &input, output.as_deref(), manifest.as_deref()).await,
        Command::Cache(command) => {
            cache_command(&config, &cache, command).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn classify(
    config: &EngineConfig,
    cache: Arc<ClassificationCache>,
    input: &Path,
    output: Option<&Path>,
    manifest_path: Option<&Path>,
) -> Result<ExitCode> {
    let file = File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let records = csv_io::read_transactions(file)
        .with_context(|| format!("reading {}", input.display()))?;

    let remote: Arc<dyn RemoteClassifier> =
        match OpenAiClassifier::from_env(&config.remote.client, config.categories.clone()) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                tracing::warn!(error = %e, "remote classifier unavailable; only local stages can resolve");
                Arc::new(Unavailable(e))
            }
        };
    let orchestrator = Orchestrator::from_config(config, cache, remote)?;

    let (handle, token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; finishing without further remote calls");
            handle.cancel();
        }
    });

    let report = orchestrator.run_raw_cancellable(records, token).await;

    match output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
            csv_io::write_labeled(BufWriter::new(file), &report.labeled)?;
        }
        None => csv_io::write_labeled(std::io::stdout().lock(), &report.labeled)?,
    }
    if let Some(path) = manifest_path {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &report.manifest)?;
    }

    print_summary(&report.manifest);
    Ok(if report.manifest.aborted.is_some() {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

fn print_summary(manifest: &RunManifest) {
    let c = &manifest.counts;
    eprintln!(
        "{} labeled: {} rule, {} fuzzy, {} cache, {} remote, {} unresolved ({} remote calls)",
        c.total(),
        c.rule,
        c.fuzzy,
        c.cache,
        c.remote,
        c.unresolved,
        manifest.remote_calls
    );
    if !manifest.rejected.is_empty() {
        eprintln!("{} input rows rejected:", manifest.rejected.len());
        for r in &manifest.rejected {
            eprintln!("  row {}: {}", r.index + 1, r.error);
        }
    }
    if !manifest.unresolved.is_empty() {
        eprintln!("Unrecognized vendors found:");
        for u in &manifest.unresolved {
            eprintln!("  {} ({})", u.key.description, u.reason);
        }
    }
    if manifest.cache_write_failures > 0 {
        eprintln!("{} cache writes failed; those labels were not persisted", manifest.cache_write_failures);
    }
    if let Some(reason) = &manifest.aborted {
        eprintln!("Remote classification aborted: {reason}");
    }
    if manifest.cancelled {
        eprintln!("Run interrupted before all remote requests were sent");
    }
}

async fn cache_command(config: &EngineConfig, cache: &ClassificationCache, command: CacheCommand) -> Result<()> {
    match command {
        CacheCommand::Stats => {
            let entries = cache.snapshot();
            let mut by_category: BTreeMap<&str, usize> = BTreeMap::new();
            let mut by_source: BTreeMap<String, usize> = BTreeMap::new();
            for (_, entry) in &entries {
                *by_category.entry(entry.category.as_str()).or_default() += 1;
                *by_source.entry(entry.source.to_string()).or_default() += 1;
            }
            println!("entries: {}", entries.len());
            if cache.skipped_on_load() > 0 {
                println!("unreadable (skipped): {}", cache.skipped_on_load());
            }
            for (source, n) in by_source {
                println!("  source {source}: {n}");
            }
            for (category, n) in by_category {
                println!("  {category}: {n}");
            }
        }
        CacheCommand::Set {
            description,
            category,
            vendor,
        } => {
            let Some((category, _)) = config.categories.reconcile(&category) else {
                bail!("unknown category '{category}'");
            };
            let normalized = normalize_description(&description);
            if normalized.is_empty() {
                bail!("description has no matchable text");
            }
            let fp = Fingerprint::of(&normalized);
            let entry = CacheEntry::manual(&normalized, category, vendor.as_deref());
            cache.store(&fp, entry, true).await?;
            println!("{fp} {normalized} -> {category}");
        }
        CacheCommand::Invalidate { description } => {
            let normalized = normalize_description(&description);
            let fp = Fingerprint::of(&normalized);
            match cache.invalidate(&fp).await? {
                Some(entry) => println!("removed {fp} {normalized} ({})", entry.category),
                None => println!("no cached label for '{normalized}'"),
            }
        }
        CacheCommand::Compact => {
            let live = cache.compact().await?;
            println!("compacted; {live} live entries");
        }
    }
    Ok(())
}

async fn open_cache(config: &EngineConfig, path_override: Option<&Path>) -> Result<ClassificationCache> {
    let kind = config.cache.backend;
    let path = path_override
        .map(Path::to_path_buf)
        .or_else(|| config.cache.path.clone())
        .unwrap_or_else(|| default_cache_path(kind));

    let backend: Box<dyn CacheBackend> = match kind {
        CacheBackendKind::Jsonl => Box::new(JsonlBackend::new(&path)),
        CacheBackendKind::Sqlite => Box::new(
            SqliteBackend::open(&path)
                .await
                .with_context(|| format!("opening cache database {}", path.display()))?,
        ),
        CacheBackendKind::Memory => Box::new(MemoryBackend::new()),
    };
    if kind != CacheBackendKind::Memory {
        tracing::info!(path = %path.display(), "using classification cache");
    }
    ClassificationCache::open_boxed(backend)
        .await
        .with_context(|| format!("loading cache {}", path.display()))
}

fn default_cache_path(kind: CacheBackendKind) -> PathBuf {
    let dir = directories::ProjectDirs::from("com", "ledgerlabel", "LedgerLabel")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("data"));
    match kind {
        CacheBackendKind::Sqlite => dir.join("classifications.db"),
        _ => dir.join("classifications.jsonl"),
    }
}
