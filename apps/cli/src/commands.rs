//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use repoqa_core::backends::IndexSearchBackend;
use repoqa_core::cache::{MokaResultCache, ResultCache};
use repoqa_core::compress::KeywordCompressor;
use repoqa_core::git::{self, SyncOutcome};
use repoqa_core::ingest::{self, IngestOptions, IngestStats, ProgressReporter};
use repoqa_core::sink::{ChannelSink, EventKind, StreamEvent};
use repoqa_core::{Backends, CancellationFlag, Orchestrator, RunOutcome, RunRequest, RunStatus};
use repoqa_llm::OpenRouterClient;
use repoqa_shared::{
    AppConfig, EmbeddingBackend, PipelineConfig, api_key, expand_home, init_config, load_config,
    validate_api_key,
};
use repoqa_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// repoqa: answer questions from indexed documentation repositories.
#[derive(Parser)]
#[command(
    name = "repoqa",
    version,
    about = "Answer questions from indexed documentation repositories.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Ask a question.
    Ask {
        /// The question.
        query: String,

        /// Caller identity, used to scope cached search results.
        #[arg(short, long, default_value = "local")]
        user: String,

        /// Restrict the search to these repositories (repeatable).
        #[arg(short, long = "repo")]
        repos: Vec<String>,

        /// Print the full run outcome as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Index a repository checkout, cloning or updating it first when a URL is given.
    Index {
        /// Path to the checkout. Defaults to the checkouts directory when --url is set.
        path: Option<PathBuf>,

        /// Repository name used in search results.
        #[arg(short, long)]
        name: String,

        /// Git URL to clone or fetch before indexing.
        #[arg(long)]
        url: Option<String>,

        /// Compute embeddings for semantic search.
        #[arg(long)]
        embed: bool,
    },

    /// Manage indexed repositories (lists them by default).
    Repos {
        #[command(subcommand)]
        action: Option<ReposAction>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Repository subcommands.
#[derive(Subcommand)]
pub(crate) enum ReposAction {
    /// List indexed repositories.
    List,
    /// Remove a repository and its files from the index.
    Remove {
        /// Repository name.
        name: String,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "repoqa=info",
        1 => "repoqa=debug",
        _ => "repoqa=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Ask {
            query,
            user,
            repos,
            json,
        } => cmd_ask(query, user, repos, json).await,
        Command::Index {
            path,
            name,
            url,
            embed,
        } => cmd_index(path, name, url, embed).await,
        Command::Repos { action } => match action.unwrap_or(ReposAction::List) {
            ReposAction::List => cmd_repos().await,
            ReposAction::Remove { name } => cmd_repos_remove(name).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

fn index_path(config: &AppConfig) -> PathBuf {
    expand_home(&config.defaults.index_path)
}

fn client(config: &AppConfig) -> Result<Arc<OpenRouterClient>> {
    let key = api_key(config)?;
    Ok(Arc::new(OpenRouterClient::new(&config.openrouter, Some(key))?))
}

// ---------------------------------------------------------------------------
// ask
// ---------------------------------------------------------------------------

async fn cmd_ask(query: String, user: String, repos: Vec<String>, json: bool) -> Result<()> {
    let config = load_config()?;
    validate_api_key(&config)?;

    let storage = Arc::new(Storage::open_readonly(&index_path(&config)).await?);
    let llm = client(&config)?;
    let embedder: Arc<dyn EmbeddingBackend> = llm.clone();
    let cache: Option<Arc<dyn ResultCache>> = config
        .cache
        .enabled
        .then(|| Arc::new(MokaResultCache::new(config.cache.max_entries)) as Arc<dyn ResultCache>);

    let orchestrator = Orchestrator::new(
        PipelineConfig::from(&config),
        Backends {
            language: llm,
            search: Arc::new(IndexSearchBackend::new(storage, Some(embedder))),
            compressor: Arc::new(KeywordCompressor),
            cache,
        },
    );

    let cancel = CancellationFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let (sink, mut events) = ChannelSink::new();
    let spinner = spinner();
    let display = spinner.clone();
    let drain = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            show_event(&display, &event);
        }
    });

    let mut request = RunRequest::new(query.clone(), user);
    request.repositories = repos;
    info!(query = %query, "asking");

    let outcome = orchestrator.run(request, &sink, &cancel).await;
    drop(sink);
    if let Err(e) = drain.await {
        warn!(error = %e, "event display task failed");
    }
    spinner.finish_and_clear();

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
    }

    match outcome.status {
        RunStatus::Completed | RunStatus::Degraded => Ok(()),
        RunStatus::Aborted | RunStatus::Cancelled => Err(eyre!(outcome.short_summary)),
    }
}

fn spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    spinner
}

fn show_event(spinner: &ProgressBar, event: &StreamEvent) {
    match event.kind {
        EventKind::Status | EventKind::Progress => spinner.set_message(event.content.clone()),
        EventKind::Error => spinner.println(format!("  error: {}", event.content)),
        EventKind::Result => {}
        EventKind::Done => spinner.set_message(format!("done ({})", event.content)),
    }
}

fn print_outcome(outcome: &RunOutcome) {
    println!();
    match (&outcome.answer, &outcome.partial_answer) {
        (Some(answer), _) => {
            println!("{}", answer.answer);
            if !answer.source_documents.is_empty() {
                println!();
                println!("  Sources:");
                for (i, source) in answer.source_documents.iter().enumerate() {
                    println!(
                        "  [{}] {}/{} ({:.2})",
                        i + 1,
                        source.repository,
                        source.filepath,
                        source.relevance_score
                    );
                }
            }
            if !answer.additional_resources.is_empty() {
                println!();
                println!("  See also:");
                for resource in &answer.additional_resources {
                    println!("  - {resource}");
                }
            }
        }
        (None, Some(partial)) => {
            if let Some(message) = &outcome.error_message {
                println!("{message}");
            }
            println!("{partial}");
        }
        (None, None) => {
            if let Some(message) = &outcome.error_message {
                println!("{message}");
            }
        }
    }
    if outcome.status == RunStatus::Degraded {
        println!();
        println!("  (degraded: {})", outcome.degraded_steps.join(", "));
    }
    println!();
}

// ---------------------------------------------------------------------------
// index
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        Self { spinner: spinner() }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn file_processed(&self, path: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Indexing [{current}/{total}] {path}"));
    }

    fn done(&self, _stats: &IngestStats) {
        self.spinner.finish_and_clear();
    }
}

fn print_sync(name: &str, checkout: &std::path::Path, outcome: &SyncOutcome) {
    let short = |oid: &str| oid.chars().take(8).collect::<String>();
    match outcome {
        SyncOutcome::Cloned { head } => {
            println!("  Cloned {name} into {} at {}", checkout.display(), short(head));
        }
        SyncOutcome::Updated { from, to, changed } => {
            println!(
                "  Updated {name} {}..{} ({} changed files)",
                short(from),
                short(to),
                changed.len()
            );
        }
        SyncOutcome::UpToDate { head } => {
            println!("  {name} is up to date at {}", short(head));
        }
    }
}

async fn cmd_index(
    path: Option<PathBuf>,
    name: String,
    url: Option<String>,
    embed: bool,
) -> Result<()> {
    let config = load_config()?;

    let root = match (url.as_deref(), path) {
        (Some(url), path) => {
            let checkout = path
                .unwrap_or_else(|| expand_home(&config.defaults.checkouts_path).join(&name));
            let spinner = spinner();
            spinner.set_message(format!("Syncing {url}"));
            let outcome = git::sync_checkout(url, &checkout).await;
            spinner.finish_and_clear();
            print_sync(&name, &checkout, &outcome?);
            checkout
        }
        (None, Some(path)) => path,
        (None, None) => return Err(eyre!("give a checkout path, or --url to clone one")),
    };

    let embedder: Option<Arc<dyn EmbeddingBackend>> = if embed {
        validate_api_key(&config)?;
        Some(client(&config)?)
    } else {
        None
    };

    let storage = Storage::open(&index_path(&config)).await?;
    let mut options = IngestOptions::new(name.clone(), root);
    options.url = url;
    options.embedder = embedder;

    info!(name = %name, root = %options.root.display(), embed, "indexing repository");

    let reporter = CliProgress::new();
    let stats = ingest::ingest_repository(&storage, &options, &reporter).await?;

    println!();
    println!("  Repository indexed!");
    println!("  Name:      {name}");
    println!("  Indexed:   {}", stats.indexed);
    println!("  Unchanged: {}", stats.unchanged);
    println!("  Skipped:   {}", stats.skipped);
    if stats.removed > 0 {
        println!("  Removed:   {}", stats.removed);
    }
    if embed {
        println!("  Embedded:  {}", stats.embedded);
    }
    if stats.failed > 0 {
        println!("  Failed:    {}", stats.failed);
    }
    println!("  Time:      {:.1}s", stats.elapsed.as_secs_f64());
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// repos / config
// ---------------------------------------------------------------------------

async fn cmd_repos() -> Result<()> {
    let config = load_config()?;
    let storage = Storage::open_readonly(&index_path(&config)).await?;
    let repositories = storage.list_repositories().await?;

    if repositories.is_empty() {
        println!("No repositories indexed yet. Run `repoqa index <path> --name <repo>`.");
        return Ok(());
    }

    println!("{:<24} {:>8}  URL", "NAME", "FILES");
    for repo in repositories {
        println!(
            "{:<24} {:>8}  {}",
            repo.name,
            repo.file_count,
            repo.url.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn cmd_repos_remove(name: String) -> Result<()> {
    let config = load_config()?;
    let storage = Storage::open(&index_path(&config)).await?;
    let root = storage
        .list_repositories()
        .await?
        .into_iter()
        .find(|r| r.name == name)
        .and_then(|r| r.root_path);

    let Some(files) = storage.delete_repository(&name).await? else {
        return Err(eyre!("no repository named '{name}' is indexed"));
    };
    info!(name = %name, files, "repository removed");
    println!("Removed {name} ({files} files)");

    // Only checkouts this tool cloned are deleted from disk.
    let checkouts = expand_home(&config.defaults.checkouts_path);
    if let Some(root) = root.map(PathBuf::from) {
        if root.starts_with(&checkouts) && root.is_dir() {
            match std::fs::remove_dir_all(&root) {
                Ok(()) => println!("Deleted checkout {}", root.display()),
                Err(e) => warn!(path = %root.display(), error = %e, "could not delete checkout"),
            }
        }
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
