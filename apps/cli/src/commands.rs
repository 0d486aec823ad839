//! CLI command definitions, routing, and tracing setup.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use url::Url;

use shelfscrape_core::{DomainReport, Orchestrator, ProgressReporter};
use shelfscrape_fetch::HttpRenderer;
use shelfscrape_model::OpenRouterClient;
use shelfscrape_shared::{
    AppConfig, RunConfig, init_config, load_config, resolve_db_path, url_base_domain,
    validate_api_key,
};
use shelfscrape_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Shelfscrape — extract product data from e-commerce sites.
#[derive(Parser)]
#[command(
    name = "shelfscrape",
    version,
    about = "Discover category pages and extract product data from e-commerce sites.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Override the crawl database path.
    #[arg(long, global = true)]
    pub db: Option<String>,

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
    /// Discover category pages from a storefront entry URL.
    Categories {
        /// Storefront entry URL (usually the homepage).
        url: String,
    },

    /// Extract products from the pending category links of a site.
    Products {
        /// Any URL on the site (used to identify the domain).
        url: String,
    },

    /// Full pipeline: discover categories, then extract their products.
    Run {
        /// Storefront entry URL (usually the homepage).
        url: String,
    },

    /// Show crawl progress and product counts per domain.
    Status {
        /// Limit output to one site.
        url: Option<String>,
    },

    /// Return a site's failed category links to the pending state.
    Reset {
        /// Any URL on the site (used to identify the domain).
        url: String,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
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
        0 => "shelfscrape=info",
        1 => "shelfscrape=debug",
        _ => "shelfscrape=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let db = cli.db.clone();
    match cli.command {
        Command::Categories { url } => cmd_categories(&url, db.as_deref()).await,
        Command::Products { url } => cmd_products(&url, db.as_deref()).await,
        Command::Run { url } => cmd_run(&url, db.as_deref()).await,
        Command::Status { url } => cmd_status(url.as_deref(), db.as_deref()).await,
        Command::Reset { url } => cmd_reset(&url, db.as_deref()).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

async fn open_storage(config: &AppConfig, db_override: Option<&str>) -> Result<Arc<Storage>> {
    let path = resolve_db_path(config, db_override)?;
    Ok(Arc::new(Storage::open(&path).await?))
}

async fn open_storage_readonly(config: &AppConfig, db_override: Option<&str>) -> Result<Storage> {
    let path = resolve_db_path(config, db_override)?;
    Ok(Storage::open_readonly(&path).await?)
}

fn build_orchestrator(config: &AppConfig) -> Result<Orchestrator> {
    let api_key = validate_api_key(config)?;
    let renderer = HttpRenderer::new().map_err(|e| eyre!("renderer setup failed: {e}"))?;
    let model = OpenRouterClient::new(&config.openrouter, api_key);
    Ok(Orchestrator::new(
        RunConfig::from(config),
        Arc::new(renderer),
        Arc::new(model),
    ))
}

fn parse_entry_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| eyre!("invalid URL '{url}': {e}"))
}

fn domain_name(url: &Url) -> Result<String> {
    let name = url_base_domain(url);
    if name.is_empty() {
        return Err(eyre!("URL has no host: {url}"));
    }
    Ok(name.to_string())
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_categories(url: &str, db: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let entry_url = parse_entry_url(url)?;
    let storage = open_storage(&config, db).await?;
    let orch = build_orchestrator(&config)?;

    info!(url, "discovering categories");
    let reporter = CliProgress::new();
    let (domain, summary) = orch
        .discover_categories(&storage, &entry_url, &reporter)
        .await?;
    reporter.clear();

    println!();
    println!("  Category discovery for {}", domain.name);
    println!("  Anchors seen:    {}", summary.anchors_seen);
    println!("  Candidates:      {}", summary.candidates);
    println!("  Accepted:        {}", summary.accepted);
    println!("  Newly stored:    {}", summary.inserted);
    if summary.failed_batches > 0 {
        println!("  Failed batches:  {}", summary.failed_batches);
    }
    println!();

    Ok(())
}

async fn cmd_products(url: &str, db: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let entry_url = parse_entry_url(url)?;
    let name = domain_name(&entry_url)?;
    let storage = open_storage(&config, db).await?;

    let Some(domain) = storage.get_domain(&name).await? else {
        return Err(eyre!(
            "unknown site '{name}' — run `shelfscrape categories {url}` first"
        ));
    };

    let orch = build_orchestrator(&config)?;
    spawn_cancel_handler(&orch);

    info!(domain = %domain.name, "extracting products");
    let reporter = CliProgress::new();
    let report = orch.extract_domain(&storage, &domain, &reporter).await?;
    print_report(&report);

    Ok(())
}

async fn cmd_run(url: &str, db: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let entry_url = parse_entry_url(url)?;
    let storage = open_storage(&config, db).await?;
    let orch = build_orchestrator(&config)?;
    spawn_cancel_handler(&orch);

    info!(url, "running full pipeline");
    let reporter = CliProgress::new();
    let (summary, report) = orch.run(&storage, &entry_url, &reporter).await?;

    println!();
    println!("  Categories accepted: {} ({} new)", summary.accepted, summary.inserted);
    print_report(&report);

    Ok(())
}

async fn cmd_status(url: Option<&str>, db: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage_readonly(&config, db).await?;

    let domains = match url {
        Some(url) => {
            let name = domain_name(&parse_entry_url(url)?)?;
            match storage.get_domain(&name).await? {
                Some(d) => vec![d],
                None => return Err(eyre!("unknown site '{name}'")),
            }
        }
        None => storage.list_domains().await?,
    };

    if domains.is_empty() {
        println!("No sites crawled yet.");
        return Ok(());
    }

    println!();
    println!(
        "  {:<28} {:>8} {:>8} {:>8} {:>8} {:>10}",
        "site", "links", "pending", "done", "failed", "products"
    );
    for domain in domains {
        let counts = storage.domain_counts(&domain.id).await?;
        println!(
            "  {:<28} {:>8} {:>8} {:>8} {:>8} {:>10}",
            domain.name,
            counts.links_total,
            counts.links_pending,
            counts.links_done,
            counts.links_failed,
            counts.products
        );
    }
    println!();

    Ok(())
}

async fn cmd_reset(url: &str, db: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let name = domain_name(&parse_entry_url(url)?)?;
    let storage = open_storage(&config, db).await?;

    let Some(domain) = storage.get_domain(&name).await? else {
        return Err(eyre!("unknown site '{name}'"));
    };

    let reset = storage.reset_failed_links(&domain.id).await?;
    println!("Reset {reset} failed link(s) for {name}.");
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

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Ctrl-C sets the cancel flag; in-flight links finish and commit before
/// the run winds down.
fn spawn_cancel_handler(orch: &Orchestrator) {
    let cancel = orch.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling — letting in-flight pages finish...");
            cancel.store(true, Ordering::Relaxed);
        }
    });
}

fn print_report(report: &DomainReport) {
    println!();
    println!("  Extraction run for {}", report.domain);
    println!("  Links crawled:   {} ({} failed)", report.links_done, report.links_failed);
    if !report.failed_urls.is_empty() {
        println!("  Failed links (retry with `shelfscrape reset`):");
        for url in &report.failed_urls {
            println!("    {url}");
        }
    }
    if report.cancelled > 0 {
        println!("  Cancelled:       {} link(s) left pending", report.cancelled);
    }
    println!("  Products found:  {}", report.products_found);
    println!("  Newly stored:    {}", report.products_inserted);
    if report.fallback_pages > 0 {
        println!("  Fallback pages:  {}", report.fallback_pages);
    }
    if report.schema_invalidations > 0 {
        println!("  Schema resets:   {}", report.schema_invalidations);
    }
    println!("  Time:            {:.1}s", report.elapsed.as_secs_f64());
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn clear(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn link_done(&self, url: &str, failed: bool, inserted: usize) {
        if failed {
            self.spinner.set_message(format!("Failed {url}"));
        } else {
            self.spinner
                .set_message(format!("Extracted {inserted} from {url}"));
        }
    }

    fn done(&self, _report: &DomainReport) {
        self.spinner.finish_and_clear();
    }
}
