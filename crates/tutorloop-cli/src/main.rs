//! Tutorloop CLI
//!
//! Loads the configuration and template catalog, then serves the event API
//! the messaging transport posts to.

use std::net::SocketAddr;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::time::interval;
use tracing_subscriber::EnvFilter;
use tutorloop_orchestrator::{
    create_router, AppState, Config, HttpLlmProxy, InMemoryRepository, SessionOrchestrator,
    TemplateRegistry,
};

/// Tutorloop - homework tutoring bot orchestrator
///
/// Receives chat events over HTTP, walks each chat through the tutoring
/// conversation and delegates image reading, hints and grading to the LLM
/// proxy.
#[derive(Parser, Debug)]
#[command(name = "tutorloop")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: tutorloop.json in current directory)
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Template catalog directory
    #[arg(long, value_name = "DIR")]
    catalog: Option<String>,

    /// Port for the HTTP API server
    #[arg(short, long)]
    port: Option<u16>,

    /// Base URL of the LLM proxy
    #[arg(long, value_name = "URL")]
    proxy_url: Option<String>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Tutorloop starting");
    tracing::debug!(config = ?args.config, "Config file");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;

    if let Some(ref catalog) = args.catalog {
        config.catalog_dir.clone_from(catalog);
    }
    if let Some(ref proxy_url) = args.proxy_url {
        config.proxy_base_url.clone_from(proxy_url);
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    // Re-validate after overrides
    config.validate()?;

    print_config(&config);

    let registry = TemplateRegistry::load_dir(&config.catalog_dir)?;
    if registry.is_empty() {
        tracing::warn!(dir = %config.catalog_dir, "Template catalog has no templates; hints will use the proxy default");
    }

    let proxy = HttpLlmProxy::new(&config.proxy_base_url, &config.engine);
    let orchestrator = SessionOrchestrator::new(
        config.clone(),
        Arc::new(registry),
        Arc::new(InMemoryRepository::new()),
        Arc::new(proxy),
    );
    let state = AppState::new(orchestrator);
    spawn_session_eviction(Arc::clone(&state.orchestrator));
    let router = create_router(state);

    let addr: SocketAddr = ([127, 0, 0, 1], config.port).into();
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to bind to {addr}: {e}\n\nSuggestion: Try a different port with --port"
        )
    })?;

    println!();
    println!("HTTP API server running on http://{addr}");
    println!("Press Ctrl+C to stop");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, shutting down");
            }
        })
        .await?;

    Ok(())
}

/// Periodically drops idle chat sessions from memory.
fn spawn_session_eviction(orchestrator: Arc<SessionOrchestrator>) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            orchestrator.evict_idle_sessions();
        }
    });
}

/// Loads configuration from the specified path or the current directory.
fn load_config(config_path: Option<&str>) -> anyhow::Result<Config> {
    match config_path {
        Some(path_str) => {
            let path = Path::new(path_str);
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: '{}'\n\nSuggestion: Check the path or remove the --config flag to use defaults",
                    path.display()
                );
            }
            Config::load_from_file(path).map_err(|e| anyhow::anyhow!("{e}"))
        }
        None => Config::load().map_err(|e| anyhow::anyhow!("{e}")),
    }
}

fn print_config(config: &Config) {
    println!("Configuration loaded:");
    println!("  Proxy: {}", config.proxy_base_url);
    println!("  Engine: {}", config.engine);
    println!("  Catalog: {}", config.catalog_dir);
    println!("  Routing subject: {}", config.routing_subject);
    println!("  Request budget: {}s", config.request_budget_secs);
    println!("  Hint cache max age: {}s", config.hint_cache_max_age_secs);
    println!("  Session idle limit: {}s", config.session_idle_secs);
}
