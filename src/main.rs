use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{self, Sampler},
    Resource,
};
use tracing::{info, warn};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry as Subscriber};

use modeldepot::config::{AppConfig, Overrides};
use modeldepot::fetch::HttpFetcher;
use modeldepot::registry::Registry;
use modeldepot::resolver::Resolver;
use modeldepot::storage::{ContentStore, OperatorStore};
use modeldepot::sync::{SyncReport, Synchronizer};

/// Publish model binaries and their catalog manifest to blob storage
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Additional configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct StoreArgs {
    /// Storage backend: fs, s3 or azblob
    #[arg(short, long)]
    backend: Option<String>,

    /// Store location: fs root directory, S3 bucket or Azure storage account
    #[arg(short, long)]
    store: Option<String>,

    /// Container (or path prefix) the artifacts are written under
    #[arg(long)]
    container: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every registered model, upload it and publish catalog.json
    Sync {
        #[command(flatten)]
        store: StoreArgs,

        /// Publisher recorded in the catalog
        #[arg(short, long)]
        publisher: Option<String>,

        /// Registry file (JSON or TOML) replacing the built-in model table
        #[arg(short, long)]
        registry: Option<PathBuf>,

        /// Number of artifacts transferred at the same time
        #[arg(long)]
        concurrency: Option<usize>,

        /// Exit non-zero when any artifact fails, even if the catalog was published
        #[arg(long)]
        strict: bool,

        /// Base URL prepended to file paths in the catalog
        #[arg(long)]
        public_base_url: Option<String>,

        /// Print the sync report as JSON instead of the summary
        #[arg(long)]
        json: bool,
    },

    /// Show the model table a sync would use
    Registry {
        /// Registry file (JSON or TOML) replacing the built-in model table
        #[arg(short, long)]
        registry: Option<PathBuf>,
    },

    /// List the objects currently in the content store
    List {
        #[command(flatten)]
        store: StoreArgs,
    },
}

/// Exit status when the catalog was published but the strict policy saw failures
const EXIT_PARTIAL_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let result = match cli.command {
        Commands::Sync {
            store,
            publisher,
            registry,
            concurrency,
            strict,
            public_base_url,
            json,
        } => {
            let overrides = Overrides {
                config_file: cli.config,
                backend: store.backend,
                store: store.store,
                container: store.container,
                publisher,
                concurrency,
                strict,
                public_base_url,
            };
            cmd_sync(&overrides, registry.as_deref(), json).await
        }
        Commands::Registry { registry } => cmd_registry(registry.as_deref()),
        Commands::List { store } => {
            let overrides = Overrides {
                config_file: cli.config,
                backend: store.backend,
                store: store.store,
                container: store.container,
                ..Default::default()
            };
            cmd_list(&overrides).await
        }
    };

    // Flush any exported spans before leaving
    global::shutdown_tracer_provider();
    result
}

fn init_tracing(verbose: bool) -> Result<()> {
    let tracer = init_tracer()?;

    let env_filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if let Some(tracer) = tracer {
        Subscriber::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .with(OpenTelemetryLayer::new(tracer))
            .init();
    } else {
        Subscriber::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    }

    Ok(())
}

// Initialize OpenTelemetry tracer
fn init_tracer() -> Result<Option<trace::Tracer>> {
    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();

    if let Some(otlp_endpoint) = otlp_endpoint {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(otlp_endpoint)
            )
            .with_trace_config(
                trace::config()
                    .with_sampler(Sampler::AlwaysOn)
                    .with_resource(Resource::new(vec![
                        KeyValue::new("service.name", "modeldepot"),
                        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    ]))
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;

        Ok(Some(tracer))
    } else {
        Ok(None)
    }
}

fn load_registry(path: Option<&Path>) -> Result<Registry> {
    match path {
        Some(path) => Registry::from_file(path)
            .with_context(|| format!("Failed to load registry from {}", path.display())),
        None => Ok(Registry::builtin()),
    }
}

async fn cmd_sync(overrides: &Overrides, registry: Option<&Path>, json: bool) -> Result<ExitCode> {
    let config = AppConfig::load_with(overrides).context("Failed to load configuration")?;
    let registry = load_registry(registry)?;
    info!(
        "Syncing {} artifacts to {} store {} (container {})",
        registry.len(),
        config.storage.backend,
        config.storage.location().unwrap_or_default(),
        config.storage.container
    );

    let store: Arc<dyn ContentStore> = Arc::new(OperatorStore::new(&config)?);
    let fetcher = Arc::new(HttpFetcher::new(config.timeout())?);
    let resolver = Resolver::new(fetcher, config.scratch_root());
    let synchronizer = Synchronizer::new(resolver, store, &config);

    match synchronizer.sync(&registry).await {
        Ok(report) => {
            print_report(&report, json)?;
            if report.exit_policy_violated(config.partial_failure) {
                warn!("{} artifacts failed and the partial failure policy is strict", report.failed.len());
                return Ok(ExitCode::from(EXIT_PARTIAL_FAILURE));
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            print_report(err.report(), json)?;
            Err(err.into())
        }
    }
}

fn cmd_registry(registry: Option<&Path>) -> Result<ExitCode> {
    let registry = load_registry(registry)?;

    println!("{}", "Model Registry".cyan().bold());
    println!("{}", "==============".cyan());
    for descriptor in registry.entries() {
        println!();
        println!("{}: {}", "Key".yellow(), descriptor.key.green());
        println!("{}: {}", "Name".yellow(), descriptor.display_name);
        println!("{}: {}", "Canonical Name".yellow(), descriptor.canonical_name);
        println!("{}: {}", "Execution Provider".yellow(), descriptor.capability_tag);
        println!("{}: {}", "Archive".yellow(), descriptor.is_archive);
        println!("{}: {}", "Source".yellow(), descriptor.source_locator);
    }

    Ok(ExitCode::SUCCESS)
}

async fn cmd_list(overrides: &Overrides) -> Result<ExitCode> {
    let config = AppConfig::load_with(overrides).context("Failed to load configuration")?;
    let store = OperatorStore::new(&config)?;

    for name in store.list().await? {
        println!("{}", store.download_path(&name));
    }

    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &SyncReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print_summary(report);
    }
    Ok(())
}

fn print_summary(report: &SyncReport) {
    println!();
    println!("{} {}", "Sync Summary".cyan().bold(), report.run_id.to_string().dimmed());
    println!("{}", "============".cyan());

    for uploaded in &report.succeeded {
        println!(
            "{} {} -> {} ({} bytes, sha256 {})",
            "✓".green(),
            uploaded.key.green(),
            uploaded.download_path,
            uploaded.size_bytes,
            uploaded.sha256
        );
    }

    for failed in &report.failed {
        println!(
            "{} {} [{}] {}",
            "✗".red(),
            failed.key.red(),
            failed.kind.to_string().yellow(),
            failed.message
        );
    }

    println!();
    let catalog = if report.manifest_published {
        "published".green()
    } else {
        "NOT published".red().bold()
    };
    println!(
        "{}: {} succeeded, {} failed, catalog.json {}",
        "Result".yellow(),
        report.succeeded.len(),
        report.failed.len(),
        catalog
    );
}
