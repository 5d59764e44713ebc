//! tome: local retrieval-augmented context
//!
//! tome embeds a prompt, finds the nearest documents in a prebuilt HNSW
//! dataset and hands both back to the host application, either from the
//! command line or over HTTP.

mod config;
mod corpus;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use config::Config;
use tome_index::Dataset;
use tome_rag::{
    BridgeServer, FileBridge, HashEmbedder, ImportOutcome, LoggingEmbedder, OllamaConfig,
    OllamaEmbedder, RetrievalService, ServerConfig, SharedEmbedder, build_dataset,
};

/// Local retrieval-augmented context for host applications
#[derive(Parser)]
#[command(name = "tome")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to .tome directory (default: search for .tome/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Dataset file (overrides [database] path)
    #[arg(long, global = true, env = "TOME_DATABASE")]
    database: Option<PathBuf>,

    /// Embedding provider: onnx, ollama, hash (overrides [embedder] provider)
    #[arg(long, global = true, env = "TOME_EMBEDDER")]
    embedder: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the documents nearest to a prompt
    Query {
        /// Prompt text
        prompt: String,

        /// Number of documents to fetch
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Prefix the output with the configured context prompt
        #[arg(long)]
        converse: bool,

        /// Print the documents as JSON instead of the prompt text
        #[arg(long)]
        json: bool,
    },

    /// Embed a corpus and write a dataset
    Build {
        /// Directory of .txt/.md files, or a JSON array of documents
        input: PathBuf,

        /// Output dataset path (default: the configured database path)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Serve the retrieval service over HTTP
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(long)]
        port: Option<u16>,

        /// Write daily-rotated logs to this directory instead of stderr
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Show the shape of a dataset
    Stats,

    /// Initialize a new .tome directory with config file
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },
}

fn env_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Initialize logging for interactive commands.
/// Logs go to stderr so stdout carries only results.
fn init_logging(verbose: bool) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter(verbose))
        .init();
}

/// Initialize logging for server mode.
/// Logs to rotating files with daily rotation.
fn init_file_logging(logs_dir: &Path, verbose: bool) {
    if let Err(e) = std::fs::create_dir_all(logs_dir) {
        eprintln!("Warning: Failed to create logs directory: {}", e);
        init_logging(verbose);
        return;
    }

    let file_appender = RollingFileAppender::new(Rotation::DAILY, logs_dir, "tome.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard stops the writer thread.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(env_filter(verbose))
        .init();
}

/// Load config from file or auto-discover from `.tome/config.toml`.
///
/// Returns the config and the `.tome` directory used to resolve relative paths.
fn load_config(override_path: Option<&PathBuf>) -> Result<(Config, Option<PathBuf>)> {
    if let Some(path) = override_path {
        let config_file = if path.is_dir() {
            path.join(config::CONFIG_FILE)
        } else {
            path.clone()
        };
        let tome_dir = config_file.parent().unwrap_or(path).to_path_buf();
        let config = Config::from_file(&config_file)?;
        info!("Loaded config from {}", config_file.display());
        return Ok((config, Some(tome_dir)));
    }

    match Config::find_and_load() {
        Ok(Some((config, tome_dir))) => {
            info!("Found config at {}", tome_dir.display());
            Ok((config, Some(tome_dir)))
        }
        Ok(None) => {
            tracing::debug!("No .tome/config.toml found, using defaults");
            Ok((Config::default(), None))
        }
        Err(e) => {
            tracing::warn!("Error searching for config: {}, using defaults", e);
            Ok((Config::default(), None))
        }
    }
}

/// Create the configured embedder.
fn create_embedder(config: &Config, tome_dir: Option<&Path>) -> Result<SharedEmbedder> {
    let embedder: SharedEmbedder = match config.embedder.provider.as_str() {
        "hash" => Arc::new(HashEmbedder::new(config.embedder.dimension)),
        "ollama" => {
            let mut ollama = OllamaConfig::new();
            if let Some(model) = &config.embedder.model {
                ollama = ollama.with_model(model);
            }
            if let Some(url) = &config.embedder.base_url {
                ollama = ollama.with_base_url(url);
            }
            Arc::new(LoggingEmbedder::new(OllamaEmbedder::new(ollama)?))
        }
        "onnx" => create_onnx_embedder(config, tome_dir)?,
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    };
    info!(embedder = embedder.name(), "Using embedder");
    Ok(embedder)
}

#[cfg(feature = "onnx")]
fn create_onnx_embedder(config: &Config, tome_dir: Option<&Path>) -> Result<SharedEmbedder> {
    let onnx = config.onnx_config(tome_dir)?;
    info!(
        model = %onnx.model_id,
        root = %onnx.model_root.display(),
        "Model will load on first use"
    );
    Ok(Arc::new(tome_rag::lazy_onnx_embedder(onnx)))
}

#[cfg(not(feature = "onnx"))]
fn create_onnx_embedder(_config: &Config, _tome_dir: Option<&Path>) -> Result<SharedEmbedder> {
    anyhow::bail!(
        "tome was built without the `onnx` feature. Rebuild with `--features onnx` \
         or set [embedder] provider to \"ollama\" or \"hash\"."
    )
}

/// Build a retrieval service whose bridge reads `database`.
fn create_service(
    config: &Config,
    tome_dir: Option<&Path>,
    database: PathBuf,
) -> Result<RetrievalService> {
    let embedder = create_embedder(config, tome_dir)?;
    let mut bridge = FileBridge::new(Some(database));
    if let Some(out) = config.documents_out(tome_dir) {
        bridge = bridge.with_documents_out(out);
    }
    Ok(RetrievalService::new(
        embedder,
        Arc::new(bridge),
        config.retrieval_config(),
    ))
}

fn log_import(outcome: ImportOutcome) {
    match outcome {
        ImportOutcome::Skipped => tracing::warn!("No dataset loaded, serving an empty index"),
        ImportOutcome::Imported { nodes, layers } => {
            info!(nodes, layers, "Dataset loaded")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Serve {
        log_dir: Some(dir), ..
    } = &cli.command
    {
        init_file_logging(dir, cli.verbose);
    } else {
        init_logging(cli.verbose);
    }

    let (mut config, tome_dir) = load_config(cli.config.as_ref())?;
    if let Some(provider) = cli.embedder {
        config.embedder.provider = provider;
    }
    let database = cli
        .database
        .unwrap_or_else(|| config.database_path(tome_dir.as_deref()));

    if !matches!(cli.command, Commands::Init { .. }) {
        let errors = config.validate();
        if !errors.is_empty() {
            for error in &errors {
                tracing::error!("Invalid config: {}", error);
            }
            anyhow::bail!("Configuration has {} error(s)", errors.len());
        }
    }

    match cli.command {
        Commands::Query {
            prompt,
            top_k,
            converse,
            json,
        } => {
            let service = create_service(&config, tome_dir.as_deref(), database)?;
            log_import(service.handle_import().await?);

            if converse {
                let text = service
                    .converse_with_context(&prompt, top_k, &config.retrieval.context_prompt)
                    .await?;
                if let Some(text) = text {
                    println!("{}", text);
                }
            } else {
                let retrieval = service.fetch_documents(&prompt, top_k).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&retrieval.documents)?);
                } else {
                    println!("{}", retrieval.prompt_text);
                }
            }
        }

        Commands::Build { input, output } => {
            let output = output.unwrap_or(database);
            let keys = corpus::load_keys(&input)?;
            if keys.is_empty() {
                anyhow::bail!("No documents found in {}", input.display());
            }
            info!(documents = keys.len(), input = %input.display(), "Building dataset");

            let embedder = create_embedder(&config, tome_dir.as_deref())?;
            let dataset = build_dataset(
                keys,
                &embedder,
                config.hnsw_config()?,
                config.embedder.batch_size,
            )
            .await?;

            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&output, dataset.to_json()?)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!(
                "Wrote {} documents to {}",
                dataset.len(),
                output.display()
            );
        }

        Commands::Serve {
            host,
            port,
            log_dir: _,
        } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            let addr: SocketAddr = format!("{}:{}", host, port)
                .parse()
                .with_context(|| format!("Invalid bind address {}:{}", host, port))?;

            let service = create_service(&config, tome_dir.as_deref(), database)?;
            log_import(service.handle_import().await?);

            let server = BridgeServer::new(
                ServerConfig::new(addr).with_cors(config.server.cors),
                Arc::new(service),
            );
            server
                .run_with_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Shutting down");
                })
                .await?;
        }

        Commands::Stats => {
            let json = std::fs::read_to_string(&database)
                .with_context(|| format!("Failed to read {}", database.display()))?;
            let index = Dataset::from_json(&json)?.into_index()?;
            let params = index.config();
            println!("Dataset:     {}", database.display());
            println!("Documents:   {}", index.len());
            println!("Layers:      {}", index.layer_count());
            match index.dimension() {
                Some(dimension) => println!("Dimension:   {}", dimension),
                None => println!("Dimension:   -"),
            }
            println!("Distance:    {}", params.distance.as_str());
            println!(
                "Parameters:  m={} mMax0={} efConstruction={}",
                params.m, params.m_max0, params.ef_construction
            );
            if let Some(entry) = index.entry_point() {
                println!(
                    "Entry point: {}",
                    entry.lines().next().unwrap_or_default()
                );
            }
        }

        Commands::Init { force } => {
            let tome_dir = PathBuf::from(config::TOME_DIR);
            let config_path = tome_dir.join(config::CONFIG_FILE);

            if config_path.exists() && !force {
                anyhow::bail!(".tome/config.toml already exists. Use --force to overwrite.");
            }

            if !tome_dir.exists() {
                std::fs::create_dir_all(&tome_dir)?;
                info!("Created {}/", tome_dir.display());
            }

            std::fs::write(&config_path, config::DEFAULT_CONFIG)?;
            println!("Created {}", config_path.display());
            println!(
                "Place local models under {}/embedder/ or switch [embedder] provider.",
                tome_dir.display()
            );
        }
    }

    Ok(())
}
