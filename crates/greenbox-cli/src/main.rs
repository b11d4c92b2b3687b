//! greenbox CLI — serve the gateway, run local code, build the sandbox image

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use greenbox_core::doctor::{CheckStatus, run_doctor};
use greenbox_core::{
    Config, ContainerEngine, DockerCli, GithubFetcher, ImageManager, ImageRecipe, RunJob,
    RunPatch, Runner,
};
use greenbox_gateway::GatewayServer;

#[derive(Parser)]
#[command(name = "greenbox")]
#[command(author, version, about = "Run Python code in a sandbox and estimate its energy use")]
struct Cli {
    /// Config file (default: $GREENBOX_CONFIG or ~/.greenbox/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run a local code directory in the sandbox and print the report
    Run {
        /// Directory mounted read-only into the container
        #[arg(short, long)]
        dir: PathBuf,

        /// Python file to execute, relative to the directory
        #[arg(short, long)]
        entrypoint: Option<String>,

        /// Wait timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Build the sandbox image
    BuildImage {
        /// full (installs the dependency manifest) or minimal
        #[arg(long)]
        recipe: Option<ImageRecipe>,

        /// Directory holding the dependency manifest
        #[arg(long)]
        context: Option<PathBuf>,

        #[arg(long)]
        tag: Option<String>,
    },

    /// Check the environment
    Doctor,
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(greenbox_core::config::default_config_path);
    let mut config = Config::load_or_default(&config_path)?;
    debug!("Using config path {}", config_path.display());

    let engine: Arc<dyn ContainerEngine> = Arc::new(DockerCli::default());

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            config.validate()?;
            info!("greenbox v{} starting", env!("CARGO_PKG_VERSION"));

            let fetcher = Arc::new(GithubFetcher::new(config.fetch.clone())?);
            GatewayServer::new(config, engine, fetcher)?.start().await
        }

        Commands::Run {
            dir,
            entrypoint,
            timeout,
        } => {
            let job = build_job(&config, &dir, entrypoint, timeout)?;
            let runner = Runner::new(engine, &config);
            match runner.run(&job).await {
                Ok(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    Ok(())
                }
                Err(e) => {
                    eprintln!("Run failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::BuildImage {
            recipe,
            context,
            tag,
        } => {
            if let Some(recipe) = recipe {
                config.image.recipe = recipe;
            }
            if let Some(context) = context {
                config.image.build_context = context;
            }
            let tag = tag.unwrap_or_else(|| config.runner.image.clone());

            info!("Building '{}' from the {} recipe", tag, config.image.recipe);
            ImageManager::new(engine, config.image.clone())
                .build(&tag)
                .await
                .with_context(|| format!("Failed to build image '{}'", tag))?;
            println!("Built {}", tag);
            Ok(())
        }

        Commands::Doctor => {
            let report = run_doctor(&config_path, &config, engine).await;
            for check in &report.checks {
                println!("[{}] {}: {}", check.status, check.name, check.message);
                if let Some(hint) = &check.fix_hint
                    && check.status != CheckStatus::Pass
                {
                    println!("       hint: {}", hint);
                }
            }
            println!("\n{}", report.summary());
            if !report.is_healthy() {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

/// Merge command-line overrides over the config into a runnable job
fn build_job(
    config: &Config,
    dir: &Path,
    entrypoint: Option<String>,
    timeout: Option<u64>,
) -> Result<RunJob> {
    if timeout == Some(0) {
        bail!("--timeout must be greater than zero");
    }
    let patch = RunPatch {
        code_entrypoint: entrypoint,
        ..RunPatch::default()
    };
    let resolved = config.resolve(&patch)?;
    Ok(RunJob {
        code_dir: dir.to_path_buf(),
        entrypoint: resolved.entrypoint,
        power: resolved.power,
        co2_rate: resolved.co2_rate,
        timeout: timeout.map(Duration::from_secs),
    })
}
